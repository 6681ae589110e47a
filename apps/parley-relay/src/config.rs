use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Depth of each connection's outbound queue. A member whose queue
    /// fills up is dropped from its room rather than stalling others.
    pub send_queue_depth: usize,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("PARLEY_RELAY_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            send_queue_depth: env::var("PARLEY_SEND_QUEUE_DEPTH")
                .ok()
                .and_then(|d| d.parse().ok())
                .unwrap_or(64),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            send_queue_depth: 64,
        }
    }
}
