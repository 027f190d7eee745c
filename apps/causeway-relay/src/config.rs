use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind_addr: String,
    pub heartbeat_timeout_seconds: u64,
    pub heartbeat_sweep_seconds: u64,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("CAUSEWAY_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            bind_addr: env::var("CAUSEWAY_BIND").unwrap_or_else(|_| "0.0.0.0".to_string()),
            heartbeat_timeout_seconds: env::var("CAUSEWAY_HEARTBEAT_TIMEOUT")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(600),
            heartbeat_sweep_seconds: env::var("CAUSEWAY_HEARTBEAT_SWEEP")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(60),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            bind_addr: "0.0.0.0".to_string(),
            heartbeat_timeout_seconds: 600,
            heartbeat_sweep_seconds: 60,
        }
    }
}
