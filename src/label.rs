// Splits one (host, user-agent) cluster into up to four (method, label)
// sub-clusters, using the referrer graph to tell browser traffic from
// background traffic and a family of heuristic filters to isolate
// probable exfiltration hiding inside otherwise browser-like traffic.

use std::collections::{HashMap, HashSet};

use crate::config::Config;
use crate::fingerprint::{FingerprintMethod, Label};
use crate::graph::ReferrerGraph;
use crate::mode::Mode;
use crate::request::{Method, RequestRecord};

/// The graph-derived classification before the Suspected-Browser
/// resolution step collapses it down to the two-valued `Label`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TypeLabel {
    Background,
    Browser,
    SuspectedBrowser,
}

pub struct LabelOutput {
    pub sub_clusters: Vec<((FingerprintMethod, Label), Vec<RequestRecord>)>,
    pub graph: ReferrerGraph,
}

pub fn generate_label(
    cluster: Vec<RequestRecord>,
    mode: Mode,
    known_browser_user_agents: &HashSet<Option<String>>,
    previous_graphs: &HashMap<Option<String>, ReferrerGraph>,
    config: &Config,
) -> LabelOutput {
    let ua_key = cluster.first().and_then(|r| r.user_agent()).map(str::to_string);

    let graph = ReferrerGraph::build(cluster.clone(), config.subdomains, config.graph_time_threshold);
    let type_label = classify_type(&graph, &ua_key, known_browser_user_agents, config);

    let (browser_cluster, background_cluster, _final_label) = match type_label {
        TypeLabel::Browser => {
            if mode == Mode::Training {
                (cluster, Vec::new(), Label::Browser)
            } else {
                let (browser, background) = check_browser_malware(&graph, config);
                (browser, background, Label::Browser)
            }
        }
        TypeLabel::SuspectedBrowser => resolve_suspected_browser(&cluster, &graph, &ua_key, previous_graphs, config),
        TypeLabel::Background => (Vec::new(), cluster, Label::Background),
    };

    let mut sub_clusters = Vec::new();
    push_method_split(&mut sub_clusters, browser_cluster, Label::Browser);
    push_method_split(&mut sub_clusters, background_cluster, Label::Background);

    LabelOutput { sub_clusters, graph }
}

fn classify_type(
    graph: &ReferrerGraph,
    ua_key: &Option<String>,
    known_browser_user_agents: &HashSet<Option<String>>,
    config: &Config,
) -> TypeLabel {
    let connected = graph.connected_count();
    let disconnected = graph.disconnected_count();
    let total = connected + disconnected;
    let ratio = if total == 0 { 0.0 } else { connected as f64 / total as f64 };

    let mut label = if ratio < config.connectedness_ratio {
        TypeLabel::Background
    } else {
        TypeLabel::Browser
    };

    if label == TypeLabel::Background && known_browser_user_agents.contains(ua_key) {
        label = TypeLabel::SuspectedBrowser;
    }
    label
}

fn resolve_suspected_browser(
    cluster: &[RequestRecord],
    graph: &ReferrerGraph,
    ua_key: &Option<String>,
    previous_graphs: &HashMap<Option<String>, ReferrerGraph>,
    config: &Config,
) -> (Vec<RequestRecord>, Vec<RequestRecord>, Label) {
    let Some(previous) = previous_graphs.get(ua_key) else {
        return (Vec::new(), cluster.to_vec(), Label::Background);
    };

    let (connected, disconnected) = previous.appendable(cluster);
    if disconnected != 0 && (connected as f64 / disconnected as f64) > config.connectedness_ratio {
        let (browser, background) = check_browser_malware(graph, config);
        (browser, background, Label::Browser)
    } else {
        (Vec::new(), cluster.to_vec(), Label::Background)
    }
}

/// Splits a Browser-labelled cluster's referrer graph into genuine browser
/// traffic and probable exfiltration hiding among the disconnected nodes.
/// Returns (browser_requests, exfiltration_requests), each in the same
/// relative chronological order the graph presents them in — connected
/// nodes first, then the surviving disconnected ones.
fn check_browser_malware(graph: &ReferrerGraph, config: &Config) -> (Vec<RequestRecord>, Vec<RequestRecord>) {
    let disconnected: Vec<&RequestRecord> = graph.iter_disconnected_nodes().collect();
    let mut browser: Vec<RequestRecord> = graph.iter_connected_nodes().cloned().collect();

    let exfiltration = exfiltration_filter(&disconnected);
    let similarity = similarity_filter(&disconnected, config);
    let malicious = exfiltration_similarity_threshold(&disconnected, &exfiltration, &similarity, config);

    let mut background = Vec::new();
    for (i, req) in disconnected.iter().enumerate() {
        if malicious.contains(&i) {
            background.push((*req).clone());
        } else {
            browser.push((*req).clone());
        }
    }
    (browser, background)
}

fn exfiltration_filter(disconnected: &[&RequestRecord]) -> HashSet<usize> {
    disconnected
        .iter()
        .enumerate()
        .filter(|(_, r)| {
            (r.method == Method::Post && r.request_body_len > 0)
                || (r.method == Method::Get && !r.uri_query().is_empty())
        })
        .map(|(i, _)| i)
        .collect()
}

fn sorted_headers_excluding_content_length(r: &RequestRecord) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = r
        .headers
        .iter()
        .filter(|(k, _)| k.as_str() != "content-length")
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    pairs.sort();
    pairs
}

fn similarity_filter(disconnected: &[&RequestRecord], config: &Config) -> HashSet<usize> {
    let mut groups: HashMap<(Method, &str), Vec<usize>> = HashMap::new();
    for (i, r) in disconnected.iter().enumerate() {
        groups.entry((r.method, r.uri_path())).or_default().push(i);
    }

    let mut result = HashSet::new();
    for idxs in groups.values() {
        if idxs.len() <= 1 {
            continue;
        }
        let header_lists: Vec<Vec<(String, String)>> =
            idxs.iter().map(|&i| sorted_headers_excluding_content_length(disconnected[i])).collect();
        let mut total = 0usize;
        for w in header_lists.windows(2) {
            total += strsim::generic_levenshtein(&w[0], &w[1]);
        }
        let avg = total as f64 / (header_lists.len() - 1) as f64;
        if avg <= config.similarity_edit_threshold {
            result.extend(idxs.iter().copied());
        }
    }
    result
}

fn exfiltration_similarity_threshold(
    disconnected: &[&RequestRecord],
    exfiltration: &HashSet<usize>,
    similarity: &HashSet<usize>,
    config: &Config,
) -> HashSet<usize> {
    let candidates: Vec<usize> = (0..disconnected.len())
        .filter(|i| exfiltration.contains(i) && similarity.contains(i))
        .collect();

    let mut groups: HashMap<(Method, &str), Vec<usize>> = HashMap::new();
    for &i in &candidates {
        let r = disconnected[i];
        groups.entry((r.method, r.uri_path())).or_default().push(i);
    }

    let mut result = HashSet::new();
    for idxs in groups.values() {
        let queries: Vec<&str> = idxs.iter().map(|&i| disconnected[i].uri_query()).collect();
        let mut outgoing = queries[0].len() as u64;
        for w in queries.windows(2) {
            outgoing += strsim::levenshtein(w[0], w[1]) as u64;
        }
        if outgoing == 0 || outgoing > config.exfiltration_outgoing_threshold {
            result.extend(idxs.iter().copied());
        }
    }
    result
}

fn push_method_split(
    sub_clusters: &mut Vec<((FingerprintMethod, Label), Vec<RequestRecord>)>,
    cluster: Vec<RequestRecord>,
    label: Label,
) {
    let mut get = Vec::new();
    let mut post = Vec::new();
    for req in cluster {
        match req.method {
            Method::Get => get.push(req),
            Method::Post => post.push(req),
            Method::Other => {}
        }
    }
    if !get.is_empty() {
        sub_clusters.push(((FingerprintMethod::Get, label), get));
    }
    if !post.is_empty() {
        sub_clusters.push(((FingerprintMethod::Post, label), post));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap as Map;

    fn req(
        ts_offset_secs: i64,
        accept: &str,
        host: &str,
        ua: &str,
        referer: Option<&str>,
        uri: &str,
        method: Method,
        body_len: u64,
    ) -> RequestRecord {
        let mut headers = Map::new();
        headers.insert("accept".to_string(), accept.to_string());
        headers.insert("host".to_string(), host.to_string());
        headers.insert("user-agent".to_string(), ua.to_string());
        if let Some(r) = referer {
            headers.insert("referer".to_string(), r.to_string());
        }
        RequestRecord {
            uid: "u".into(),
            ts: Utc::now() + chrono::Duration::seconds(ts_offset_secs),
            orig_ip: "10.0.0.1".parse().unwrap(),
            dest_ip: "93.184.216.34".parse().unwrap(),
            dest_port: 80,
            method,
            uri: uri.to_string(),
            version: "1.1".to_string(),
            headers,
            request_body_len: body_len,
            is_malicious: None,
        }
    }

    #[test]
    fn pure_curl_cluster_is_background() {
        let cluster: Vec<RequestRecord> = (0..5)
            .map(|i| req(i, "*/*", "a.example", "curl/7.68", None, "/x", Method::Get, 0))
            .collect();
        let config = Config::default();
        let out = generate_label(
            cluster,
            Mode::Training,
            &HashSet::new(),
            &HashMap::new(),
            &config,
        );
        assert_eq!(out.sub_clusters.len(), 1);
        let ((method, label), sub) = &out.sub_clusters[0];
        assert_eq!(*method, FingerprintMethod::Get);
        assert_eq!(*label, Label::Background);
        assert_eq!(sub.len(), 5);
    }

    #[test]
    fn chained_html_cluster_is_browser() {
        let cluster = vec![
            req(0, "text/html", "example.com", "Mozilla/5.0", None, "/", Method::Get, 0),
            req(1, "*/*", "example.com", "Mozilla/5.0", Some("http://example.com/"), "/app.js", Method::Get, 0),
            req(2, "*/*", "example.com", "Mozilla/5.0", Some("http://example.com/"), "/style.css", Method::Get, 0),
        ];
        let config = Config::default();
        let out = generate_label(
            cluster,
            Mode::Training,
            &HashSet::new(),
            &HashMap::new(),
            &config,
        );
        assert_eq!(out.sub_clusters.len(), 1);
        assert_eq!(out.sub_clusters[0].0, (FingerprintMethod::Get, Label::Browser));
    }

    #[test]
    fn exfiltration_split_in_testing_mode() {
        let mut cluster = vec![req(0, "text/html", "example.com", "Mozilla/5.0 Chrome", None, "/", Method::Get, 0)];
        for i in 0..20 {
            cluster.push(req(
                2 + i,
                "*/*",
                "evil.example",
                "Mozilla/5.0 Chrome",
                None,
                "/upload?d=aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
                Method::Get,
                0,
            ));
        }
        let config = Config::default();
        let out = generate_label(
            cluster,
            Mode::Testing,
            &HashSet::new(),
            &HashMap::new(),
            &config,
        );
        let background_sub = out
            .sub_clusters
            .iter()
            .find(|((_, label), _)| *label == Label::Background);
        assert!(background_sub.is_some(), "expected the repeated uploads to be split into background");
    }
}
