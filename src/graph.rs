// The referrer graph links requests within one cluster by referer/origin
// and a favicon-loading exception. Nodes are arena-indexed (position in
// the owned cluster vector doubles as the petgraph node index, since
// nodes are only ever appended, never removed), so undirected
// neighbourhood queries ("is this node's degree zero?") are a cheap
// lookup rather than a graph walk from the root.

use std::sync::OnceLock;

use aho_corasick::AhoCorasick;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use crate::request::RequestRecord;

const HEAD_ACCEPT_TOKENS: &[&str] = &["html", "css", "javascript", "flash"];

static HEAD_ACCEPT_AC: OnceLock<AhoCorasick> = OnceLock::new();

fn head_accept_automaton() -> &'static AhoCorasick {
    HEAD_ACCEPT_AC.get_or_init(|| {
        AhoCorasick::new(HEAD_ACCEPT_TOKENS).expect("head-node token automaton build failed")
    })
}

/// Case-sensitive by construction, matching the upstream heuristic: header
/// *values* (unlike names) are never case-folded on parse, so neither is
/// this check. The extension arm also keeps the original's asymmetric
/// substring test (`token` found *inside* the extension, not the reverse) —
/// it quietly matches `.html`/`.css` but not `.js`/`.swf`, which looks like
/// an oversight in the source heuristic but is preserved rather than fixed.
fn is_head_node(req: &RequestRecord) -> bool {
    let Some(accept) = req.header("accept") else {
        return false;
    };

    if head_accept_automaton().is_match(accept) {
        return true;
    }
    if accept.contains("*/*") {
        let path = req.uri_path();
        return match path.rsplit_once('.') {
            Some((_, ext)) => head_accept_automaton().is_match(ext),
            None => true,
        };
    }
    false
}

/// Last `n` dot-separated labels of a hostname. Used to compare
/// `referer`/`origin` hosts against the candidate head's `Host` header at
/// subdomain granularity rather than requiring an exact match. Case-sensitive
/// by construction, matching the upstream heuristic: it never folds case on
/// either side of this comparison.
fn last_labels(host: &str, n: usize) -> String {
    let host = host
        .split("://")
        .last()
        .unwrap_or(host)
        .split('/')
        .next()
        .unwrap_or("");
    let labels: Vec<&str> = host.split('.').collect();
    let start = labels.len().saturating_sub(n);
    labels[start..].join(".")
}

/// Case-sensitive `ends_with`/`contains` checks, matching the upstream
/// heuristic exactly — it never folds case on the request path either.
fn is_favicon_request(req: &RequestRecord) -> bool {
    req.method == crate::request::Method::Get
        && req.uri_query().is_empty()
        && req.request_body_len == 0
        && req.uri_path().ends_with("ico")
        && req.uri_path().contains("favicon")
}

fn linked(head: &RequestRecord, r: &RequestRecord, subdomains: usize, time_threshold: i64) -> bool {
    let referrer = r.referer();
    let head_host = head.host_header();

    if let (Some(referrer), Some(head_host)) = (referrer, head_host) {
        if !referrer.is_empty() && !head_host.is_empty() {
            let same_site = last_labels(referrer, subdomains) == last_labels(head_host, subdomains);
            let within_time = (r.ts - head.ts).num_seconds().abs() < time_threshold;
            return same_site && within_time;
        }
    }

    if is_favicon_request(r) {
        if let (Some(r_host), Some(head_host)) = (r.host_header(), head.host_header()) {
            return last_labels(r_host, subdomains) == last_labels(head_host, subdomains);
        }
    }

    false
}

#[derive(Debug, Clone)]
pub struct ReferrerGraph {
    cluster: Vec<RequestRecord>,
    graph: DiGraph<(), ()>,
    subdomains: usize,
    time_threshold: i64,
}

impl ReferrerGraph {
    pub fn build(cluster: Vec<RequestRecord>, subdomains: usize, time_threshold: i64) -> Self {
        let mut graph = DiGraph::new();
        let mut head_stack: Vec<NodeIndex> = Vec::new();

        for (idx, req) in cluster.iter().enumerate() {
            let node = graph.add_node(());
            debug_assert_eq!(node.index(), idx);

            if let Some(&candidate) = head_stack
                .iter()
                .rev()
                .find(|&&head_idx| linked(&cluster[head_idx.index()], req, subdomains, time_threshold))
            {
                graph.add_edge(candidate, node, ());
            }

            if is_head_node(req) {
                head_stack.push(node);
            }
        }

        Self {
            cluster,
            graph,
            subdomains,
            time_threshold,
        }
    }

    pub fn cluster(&self) -> &[RequestRecord] {
        &self.cluster
    }

    fn is_connected(&self, idx: NodeIndex) -> bool {
        self.graph.neighbors_undirected(idx).next().is_some()
    }

    pub fn iter_connected_nodes(&self) -> impl Iterator<Item = &RequestRecord> {
        self.cluster
            .iter()
            .enumerate()
            .filter(move |(i, _)| self.is_connected(NodeIndex::new(*i)))
            .map(|(_, r)| r)
    }

    pub fn iter_disconnected_nodes(&self) -> impl Iterator<Item = &RequestRecord> {
        self.cluster
            .iter()
            .enumerate()
            .filter(move |(i, _)| !self.is_connected(NodeIndex::new(*i)))
            .map(|(_, r)| r)
    }

    pub fn connected_count(&self) -> usize {
        self.iter_connected_nodes().count()
    }

    pub fn disconnected_count(&self) -> usize {
        self.iter_disconnected_nodes().count()
    }

    /// Rebuilds a combined graph over `self.cluster` followed by
    /// `new_cluster`, without mutating `self`, and classifies every node
    /// that came from `new_cluster` as connected or disconnected in that
    /// combined view. Existing nodes are never reclassified — appending
    /// more requests can only add edges, never remove the ones already
    /// present in `self`.
    pub fn appendable(&self, new_cluster: &[RequestRecord]) -> (usize, usize) {
        let mut combined = self.cluster.clone();
        combined.extend(new_cluster.iter().cloned());
        let combined_graph = ReferrerGraph::build(combined, self.subdomains, self.time_threshold);

        let boundary = self.cluster.len();
        let mut connected = 0usize;
        let mut disconnected = 0usize;
        for i in boundary..combined_graph.cluster.len() {
            if combined_graph.is_connected(NodeIndex::new(i)) {
                connected += 1;
            } else {
                disconnected += 1;
            }
        }
        (connected, disconnected)
    }

    /// Present only so callers relying on petgraph's directed semantics
    /// (e.g. future diagnostics) can walk true head→child edges.
    pub fn head_of(&self, idx: usize) -> Option<usize> {
        self.graph
            .neighbors_directed(NodeIndex::new(idx), Direction::Incoming)
            .next()
            .map(|n| n.index())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Method;
    use std::collections::HashMap;

    fn req(
        ts_offset_secs: i64,
        accept: &str,
        host: &str,
        referer: Option<&str>,
        uri: &str,
        method: Method,
        body_len: u64,
    ) -> RequestRecord {
        let mut headers = HashMap::new();
        headers.insert("accept".to_string(), accept.to_string());
        headers.insert("host".to_string(), host.to_string());
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
    fn head_node_then_linked_child_is_connected() {
        let cluster = vec![
            req(0, "text/html", "example.com", None, "/", Method::Get, 0),
            req(1, "*/*", "example.com", Some("http://example.com/"), "/app.js", Method::Get, 0),
        ];
        let graph = ReferrerGraph::build(cluster, 2, 600);
        assert_eq!(graph.connected_count(), 2);
        assert_eq!(graph.disconnected_count(), 0);
    }

    #[test]
    fn unrelated_request_is_disconnected() {
        let cluster = vec![
            req(0, "text/html", "example.com", None, "/", Method::Get, 0),
            req(1, "*/*", "other.example", Some("http://unrelated.test/"), "/thing", Method::Get, 0),
        ];
        let graph = ReferrerGraph::build(cluster, 2, 600);
        assert_eq!(graph.connected_count(), 0);
        assert_eq!(graph.disconnected_count(), 2);
    }

    #[test]
    fn favicon_exception_links_without_referer() {
        let cluster = vec![
            req(0, "text/html", "example.com", None, "/", Method::Get, 0),
            req(1, "image/*", "example.com", None, "/favicon.ico", Method::Get, 0),
        ];
        let graph = ReferrerGraph::build(cluster, 2, 600);
        assert_eq!(graph.connected_count(), 2);
    }

    #[test]
    fn appendable_never_reclassifies_existing_nodes() {
        let base = vec![req(0, "text/html", "example.com", None, "/", Method::Get, 0)];
        let graph = ReferrerGraph::build(base, 2, 600);
        assert_eq!(graph.disconnected_count(), 1);

        let more = vec![req(1, "*/*", "example.com", Some("http://example.com/"), "/x.css", Method::Get, 0)];
        let (connected, disconnected) = graph.appendable(&more);
        assert_eq!((connected, disconnected), (1, 0));
        // the original graph itself is untouched
        assert_eq!(graph.disconnected_count(), 1);
    }
}
