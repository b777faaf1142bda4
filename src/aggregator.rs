// The windowed streaming grouper. Owns every piece of cross-window state
// (the fingerprint store, the known-browser-user-agent set, the
// per-user-agent retained graph map, and the alert list) for the
// duration of a run and drives fingerprint creation and, in testing
// mode, detection.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::config::Config;
use crate::detector::{self, Alert};
use crate::error::Result;
use crate::fingerprint::{self, FingerprintMethod, FingerprintStore, Label};
use crate::graph::ReferrerGraph;
use crate::label::generate_label;
use crate::mode::Mode;
use crate::request::RequestRecord;

type BucketKey = (IpAddr, Option<String>);

/// One row of bookkeeping kept only when evaluation tracking is enabled
/// (the `evaluate` CLI mode): every sub-cluster produced in testing mode,
/// whether it alerted, and whether any contributing request carried the
/// `is_malicious` ground-truth tag. Never consulted by the detector.
#[derive(Debug, Clone)]
pub struct EvalRecord {
    pub host: IpAddr,
    pub method: FingerprintMethod,
    pub label: Label,
    pub request_count: u64,
    pub malicious_request_count: u64,
    pub alerted: bool,
}

pub struct Aggregator {
    config: Config,
    store: FingerprintStore,
    known_browser_user_agents: HashSet<Option<String>>,
    previous_graphs: HashMap<Option<String>, ReferrerGraph>,
    alerts: Vec<Alert>,
    offline_sink: Option<PathBuf>,
    eval_records: Option<Vec<EvalRecord>>,
}

impl Aggregator {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            store: FingerprintStore::new(),
            known_browser_user_agents: HashSet::new(),
            previous_graphs: HashMap::new(),
            alerts: Vec::new(),
            offline_sink: None,
            eval_records: None,
        }
    }

    pub fn with_store(config: Config, store: FingerprintStore) -> Self {
        Self {
            store,
            ..Self::new(config)
        }
    }

    /// In testing mode, every emitted fingerprint is appended to `path`
    /// instead of being compared against the store (the CLI's `offline`
    /// dump-to-CSV flag, §6).
    pub fn set_offline_sink(&mut self, path: impl Into<PathBuf>) {
        self.offline_sink = Some(path.into());
    }

    pub fn enable_eval_tracking(&mut self) {
        self.eval_records.get_or_insert_with(Vec::new);
    }

    pub fn store(&self) -> &FingerprintStore {
        &self.store
    }

    pub fn into_store(self) -> FingerprintStore {
        self.store
    }

    pub fn alerts(&self) -> &[Alert] {
        &self.alerts
    }

    pub fn eval_records(&self) -> &[EvalRecord] {
        self.eval_records.as_deref().unwrap_or(&[])
    }

    /// Consumes a chronologically ordered stream of requests under the
    /// given mode. Training has no windowing — the whole stream is one
    /// window; testing drains on a fixed tumbling window measured from
    /// the stream's own timestamps (§4.1).
    pub fn analyse<I>(&mut self, records: I, mode: Mode) -> Result<()>
    where
        I: IntoIterator<Item = RequestRecord>,
    {
        match mode {
            Mode::Training => self.analyse_training(records),
            Mode::Testing => self.analyse_testing(records),
        }
    }

    fn analyse_training<I>(&mut self, records: I) -> Result<()>
    where
        I: IntoIterator<Item = RequestRecord>,
    {
        let mut buckets: HashMap<BucketKey, Vec<RequestRecord>> = HashMap::new();
        for record in records {
            let key = bucket_key_for(&record);
            buckets.entry(key).or_default().push(record);
        }
        self.drain_all(buckets, Mode::Training)
    }

    fn analyse_testing<I>(&mut self, records: I) -> Result<()>
    where
        I: IntoIterator<Item = RequestRecord>,
    {
        let mut buckets: HashMap<BucketKey, Vec<RequestRecord>> = HashMap::new();
        let mut time_start: Option<DateTime<Utc>> = None;

        for record in records {
            match time_start {
                None => time_start = Some(record.ts),
                Some(start) if record.ts - start > self.config.window => {
                    debug!(time_start = %start, "window boundary reached, draining");
                    self.drain_all(std::mem::take(&mut buckets), Mode::Testing)?;
                    time_start = Some(record.ts);
                }
                _ => {}
            }
            let key = bucket_key_for(&record);
            buckets.entry(key).or_default().push(record);
        }

        self.drain_all(buckets, Mode::Testing)
    }

    fn drain_all(&mut self, buckets: HashMap<BucketKey, Vec<RequestRecord>>, mode: Mode) -> Result<()> {
        if buckets.is_empty() {
            return Ok(());
        }
        debug!(buckets = buckets.len(), ?mode, "draining buckets");
        for ((host, _ua), cluster) in buckets {
            self.drain_bucket(host, cluster, mode)?;
        }
        Ok(())
    }

    fn drain_bucket(&mut self, host: IpAddr, cluster: Vec<RequestRecord>, mode: Mode) -> Result<()> {
        if cluster.is_empty() {
            return Ok(());
        }
        let ua_key = cluster.first().and_then(|r| r.user_agent()).map(str::to_string);

        let output = generate_label(
            cluster,
            mode,
            &self.known_browser_user_agents,
            &self.previous_graphs,
            &self.config,
        );

        for ((method, label), sub_cluster) in output.sub_clusters {
            let request_count = sub_cluster.len() as u64;
            let malicious_request_count =
                sub_cluster.iter().filter(|r| r.is_malicious == Some(true)).count() as u64;

            let Some(new_fp) = fingerprint::generate_fingerprint(&sub_cluster, method, label) else {
                continue;
            };

            match mode {
                Mode::Training => {
                    if label == Label::Browser {
                        self.known_browser_user_agents.insert(ua_key.clone());
                    }
                    info!(host = %host, %method, %label, "stored fingerprint");
                    self.store.insert(host, new_fp);
                }
                Mode::Testing => {
                    if let Some(sink) = self.offline_sink.clone() {
                        fingerprint::append_fingerprint(&sink, host, &new_fp)?;
                    } else {
                        let trained = self.store.fingerprints_for_mut(&host);
                        let alerted = detector::detect(trained, &new_fp, &self.config);
                        if alerted {
                            info!(host = %host, %method, %label, "alert");
                            self.alerts.push(Alert {
                                host,
                                fingerprint: new_fp,
                            });
                        }
                        if let Some(records) = &mut self.eval_records {
                            records.push(EvalRecord {
                                host,
                                method,
                                label,
                                request_count,
                                malicious_request_count,
                                alerted,
                            });
                        }
                    }
                }
            }
        }

        if mode == Mode::Testing {
            self.previous_graphs.insert(ua_key, output.graph);
        }

        Ok(())
    }

}

fn bucket_key_for(record: &RequestRecord) -> BucketKey {
    (record.orig_ip, record.user_agent().map(str::to_string))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Method;
    use chrono::Duration;
    use std::collections::HashMap as Map;
    use std::net::IpAddr;

    fn req(ts_offset_secs: i64, host: &str, ua: &str, uri: &str, method: Method) -> RequestRecord {
        let mut headers = Map::new();
        headers.insert("host".to_string(), host.to_string());
        headers.insert("user-agent".to_string(), ua.to_string());
        headers.insert("accept".to_string(), "*/*".to_string());
        RequestRecord {
            uid: "u".into(),
            ts: Utc::now() + Duration::seconds(ts_offset_secs),
            orig_ip: "10.0.0.1".parse().unwrap(),
            dest_ip: "93.184.216.34".parse().unwrap(),
            dest_port: 80,
            method,
            uri: uri.to_string(),
            version: "1.1".to_string(),
            headers,
            request_body_len: 0,
            is_malicious: None,
        }
    }

    #[test]
    fn training_produces_one_background_fingerprint_for_pure_curl_cluster() {
        let mut agg = Aggregator::new(Config::default());
        let records: Vec<RequestRecord> = (0..5)
            .map(|i| req(i, "a.example", "curl/7.68", "/x", Method::Get))
            .collect();
        agg.analyse(records, Mode::Training).unwrap();

        let host: IpAddr = "10.0.0.1".parse().unwrap();
        let fps = agg.store().fingerprints_for(&host);
        assert_eq!(fps.len(), 1);
        assert_eq!(fps[0].label, Label::Background);
        assert_eq!(fps[0].hosts, vec![("a.example".to_string(), 5)]);
        assert_eq!(fps[0].outgoing_info, 0);
    }

    #[test]
    fn windowed_testing_drains_on_each_boundary_and_at_end_of_stream() {
        let mut config = Config::default();
        config.window = Duration::minutes(10);
        let mut agg = Aggregator::new(config);
        agg.enable_eval_tracking();

        // One record every minute for 25 minutes => drains at ~10, ~20, and EOS.
        let records: Vec<RequestRecord> = (0..25)
            .map(|minute| req(minute * 60, "a.example", "curl/7.68", "/x", Method::Get))
            .collect();
        agg.analyse(records, Mode::Testing).unwrap();

        assert_eq!(agg.eval_records().len(), 3);
    }
}
