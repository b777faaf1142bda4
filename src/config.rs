// Tunables, threaded explicitly through every subsystem rather than read
// from a global. Defaults match the reference values; the CLI layer
// overlays any flags the operator passed on top of `Config::default()`.

use chrono::Duration;

#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub window: Duration,
    pub background_threshold: f32,
    pub browser_threshold: f32,
    pub outgoing_threshold: u64,
    pub update_threshold: f64,
    pub avg_size_margin: f64,
    pub subdomains: usize,
    pub graph_time_threshold: i64,
    pub similarity_edit_threshold: f64,
    pub exfiltration_outgoing_threshold: u64,
    pub connectedness_ratio: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            window: Duration::minutes(10),
            background_threshold: 2.5,
            browser_threshold: 2.0,
            outgoing_threshold: 1000,
            update_threshold: 0.10,
            avg_size_margin: 0.30,
            subdomains: 2,
            graph_time_threshold: 600,
            similarity_edit_threshold: 0.10,
            exfiltration_outgoing_threshold: 500,
            connectedness_ratio: 0.5,
        }
    }
}
