// The decision procedure: given the trained fingerprints for a host and a
// freshly labelled fingerprint, decide alert / no-alert, and along the way
// recognise a same-application software update so the trained fingerprint
// can absorb the new user-agent instead of producing a false alert.

use std::net::IpAddr;
use std::sync::OnceLock;

use aho_corasick::AhoCorasick;

use crate::config::Config;
use crate::fingerprint::{Fingerprint, Label};

#[derive(Debug, Clone)]
pub struct Alert {
    pub host: IpAddr,
    pub fingerprint: Fingerprint,
}

const FAKE_BROWSER_TOKENS: &[&str] = &["Firefox", "Chrome", "MSIE", "Edge", "Opera", "Safari"];

static FAKE_BROWSER_AC: OnceLock<AhoCorasick> = OnceLock::new();

fn fake_browser_automaton() -> &'static AhoCorasick {
    FAKE_BROWSER_AC.get_or_init(|| {
        AhoCorasick::new(FAKE_BROWSER_TOKENS).expect("fake-browser token automaton build failed")
    })
}

/// Top-level decision procedure (§4.5). May rewrite a trained
/// fingerprint's user-agent in place when it recognises an update.
pub fn detect(trained: &mut [Fingerprint], new_fp: &Fingerprint, config: &Config) -> bool {
    if trained.iter().any(|t| similar(new_fp, t, config)) {
        return false;
    }

    if new_fp.outgoing_info > config.outgoing_threshold {
        return !is_update(new_fp, trained, config);
    }

    fake_browser(&new_fp.user_agent)
}

/// `similar(a, a)` is always true for a non-empty fingerprint: every
/// sub-metric compares a value against itself.
pub fn similar(new: &Fingerprint, old: &Fingerprint, config: &Config) -> bool {
    if new.label != old.label {
        return false;
    }
    match new.label {
        Label::Background => {
            let score = host_check(new, old)
                + avg_size_check(new, old, config)
                + header_check(new, old)
                + ua_check(new, old);
            score >= config.background_threshold as f64
        }
        Label::Browser => {
            let score = ua_check(new, old) + language_check(new, old);
            score >= config.browser_threshold as f64
        }
    }
}

fn host_check(new: &Fingerprint, old: &Fingerprint) -> f64 {
    let every_new_host_known = new
        .hosts
        .iter()
        .all(|(h, _)| old.hosts.iter().any(|(oh, _)| oh == h));
    if every_new_host_known {
        1.0
    } else {
        0.0
    }
}

fn avg_size_check(new: &Fingerprint, old: &Fingerprint, config: &Config) -> f64 {
    let e = old.avg_size * config.avg_size_margin;
    let diff = (new.avg_size - old.avg_size).abs();
    if diff <= e {
        1.0
    } else if diff <= 2.0 * e {
        0.5
    } else {
        0.0
    }
}

fn header_check(new: &Fingerprint, old: &Fingerprint) -> f64 {
    let m = new.constant_header_fields.intersection(&old.constant_header_fields).count();
    if m == old.constant_header_fields.len() && m == new.constant_header_fields.len() {
        1.0
    } else if m == old.constant_header_fields.len() && m < new.constant_header_fields.len() {
        0.5
    } else {
        0.0
    }
}

fn ua_check(new: &Fingerprint, old: &Fingerprint) -> f64 {
    if new.user_agent == old.user_agent {
        1.0
    } else {
        0.0
    }
}

fn language_check(new: &Fingerprint, old: &Fingerprint) -> f64 {
    if new.language == old.language {
        1.0
    } else {
        0.0
    }
}

fn normalized_edit_distance(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 0.0;
    }
    strsim::levenshtein(a, b) as f64 / max_len as f64
}

/// Looks for a trained fingerprint of the same method whose user-agent is
/// within normalised edit distance of `new`'s and whose non-UA features
/// still match. `Label` is a closed two-valued enum here, so the "any
/// other label is an error" branch from the original heuristic can never
/// be reached and is not encoded as a runtime check.
fn is_update(new: &Fingerprint, trained: &mut [Fingerprint], config: &Config) -> bool {
    for t in trained.iter_mut() {
        if t.method != new.method {
            continue;
        }
        if normalized_edit_distance(&new.user_agent, &t.user_agent) > config.update_threshold {
            continue;
        }

        let (score, threshold) = match new.label {
            Label::Background => (
                1.0 + host_check(new, t) + avg_size_check(new, t, config) + header_check(new, t),
                config.background_threshold as f64,
            ),
            Label::Browser => (1.0 + language_check(new, t), config.browser_threshold as f64),
        };

        if score >= threshold {
            t.user_agent = new.user_agent.clone();
            return true;
        }
    }
    false
}

/// Matches `new.user_agent` against the fixed fake-browser token set with a
/// single O(n) scan rather than one `contains` per token.
fn fake_browser(user_agent: &str) -> bool {
    fake_browser_automaton().is_match(user_agent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::FingerprintMethod;
    use std::collections::BTreeSet;

    fn background_fp(user_agent: &str, outgoing_info: u64) -> Fingerprint {
        Fingerprint {
            label: Label::Background,
            method: FingerprintMethod::Get,
            user_agent: user_agent.to_string(),
            language: "en-US".to_string(),
            constant_header_fields: BTreeSet::from(["accept".to_string()]),
            hosts: vec![("a.example".to_string(), 5)],
            avg_size: 100.0,
            outgoing_info,
        }
    }

    #[test]
    fn similar_is_reflexive() {
        let fp = background_fp("curl/7.68", 0);
        let config = Config::default();
        assert!(similar(&fp, &fp, &config));
    }

    #[test]
    fn alert_gating_when_outgoing_below_threshold_and_similar_trained() {
        let config = Config::default();
        let trained_fp = background_fp("definitely-not-a-browser/1.0", 0);
        let mut trained = vec![trained_fp.clone()];
        let new_fp = background_fp("definitely-not-a-browser/1.0", 0);
        assert!(!detect(&mut trained, &new_fp, &config));
    }

    #[test]
    fn exfiltration_triggers_alert_for_chrome_impersonator() {
        let config = Config::default();
        let mut trained: Vec<Fingerprint> = vec![Fingerprint {
            label: Label::Browser,
            method: FingerprintMethod::Get,
            user_agent: "Mozilla/5.0 Chrome".to_string(),
            language: "en-US".to_string(),
            constant_header_fields: BTreeSet::new(),
            hosts: vec![("example.com".to_string(), 10)],
            avg_size: 50.0,
            outgoing_info: 0,
        }];
        let new_fp = Fingerprint {
            label: Label::Background,
            method: FingerprintMethod::Get,
            user_agent: "Mozilla/5.0 Chrome".to_string(),
            language: "en-US".to_string(),
            constant_header_fields: BTreeSet::new(),
            hosts: vec![("evil.example".to_string(), 20)],
            avg_size: 600.0,
            outgoing_info: 10240,
        };
        assert!(detect(&mut trained, &new_fp, &config));
    }

    #[test]
    fn update_rewrites_trained_user_agent() {
        let config = Config::default();
        let mut trained = vec![background_fp("myapp/1.0.0", 0)];
        let new_fp = background_fp("myapp/1.0.1", 5000);
        assert!(!detect(&mut trained, &new_fp, &config));
        assert_eq!(trained[0].user_agent, "myapp/1.0.1");
    }
}
