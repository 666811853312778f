use std::time::Duration;

pub const DEFAULT_HTTP_PORT: u16 = 8000;
pub const DEFAULT_TCP_PORT: u16 = 8888;
pub const DEFAULT_MAX_FILE_GIB: u64 = 100;
pub const DEFAULT_TOKEN_LEN: usize = 8;
pub const DEFAULT_SESSION_TTL_SECS: u64 = 2 * 60 * 60;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 5 * 60;

const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid SB_HTTP_PORT: {0}")]
    InvalidHttpPort(String),
    #[error("invalid SB_TCP_PORT: {0}")]
    InvalidTcpPort(String),
    #[error("invalid SB_MAX_FILE_SIZE: {0}")]
    InvalidMaxFileSize(String),
    #[error("invalid SB_HTTP_MAX_CONC: {0}")]
    InvalidConcurrency(String),
}

/// Runtime configuration for the bridge, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address both listeners bind to.
    pub bind: String,
    pub http_port: u16,
    pub tcp_port: u16,
    /// Upper bound on a declared file size, in bytes. Configured in GiB.
    pub max_file_size: u64,
    /// Token length in characters; outside 6..=32 the minter falls back to
    /// a UUID.
    pub token_len: usize,
    /// When set, download URLs are synthesized from this base instead of
    /// request headers (e.g. `https://files.example.org`).
    pub public_base_url: Option<String>,
    pub http_max_conc: usize,
    pub session_ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            http_port: DEFAULT_HTTP_PORT,
            tcp_port: DEFAULT_TCP_PORT,
            max_file_size: DEFAULT_MAX_FILE_GIB * GIB,
            token_len: DEFAULT_TOKEN_LEN,
            public_base_url: None,
            http_max_conc: 1024,
            session_ttl: Duration::from_secs(DEFAULT_SESSION_TTL_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Config::default();
        if let Ok(bind) = std::env::var("SB_BIND") {
            if !bind.trim().is_empty() {
                cfg.bind = bind.trim().to_string();
            }
        }
        if let Some(raw) = env_nonempty("SB_HTTP_PORT") {
            cfg.http_port = raw.parse().map_err(|_| ConfigError::InvalidHttpPort(raw))?;
        }
        if let Some(raw) = env_nonempty("SB_TCP_PORT") {
            cfg.tcp_port = raw.parse().map_err(|_| ConfigError::InvalidTcpPort(raw))?;
        }
        if let Some(raw) = env_nonempty("SB_MAX_FILE_SIZE") {
            let gib: u64 = raw
                .parse()
                .map_err(|_| ConfigError::InvalidMaxFileSize(raw))?;
            cfg.max_file_size = gib.saturating_mul(GIB);
        }
        if let Some(raw) = env_nonempty("SB_TOKEN_LEN") {
            // Out-of-range values are honored by falling back to UUID tokens,
            // so an unparsable value just keeps the default.
            if let Ok(len) = raw.parse() {
                cfg.token_len = len;
            }
        }
        cfg.public_base_url =
            env_nonempty("SB_PUBLIC_BASE_URL").map(|s| s.trim_end_matches('/').to_string());
        if let Some(raw) = env_nonempty("SB_HTTP_MAX_CONC") {
            cfg.http_max_conc = raw
                .parse()
                .map_err(|_| ConfigError::InvalidConcurrency(raw))?;
        }
        if let Some(secs) = env_nonempty("SB_SESSION_TTL_SECS").and_then(|s| s.parse().ok()) {
            cfg.session_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = env_nonempty("SB_SWEEP_INTERVAL_SECS").and_then(|s| s.parse().ok()) {
            cfg.sweep_interval = Duration::from_secs(secs);
        }
        Ok(cfg)
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.http_port, 8000);
        assert_eq!(cfg.tcp_port, 8888);
        assert_eq!(cfg.max_file_size, 100 * GIB);
        assert_eq!(cfg.token_len, 8);
        assert_eq!(cfg.session_ttl, Duration::from_secs(7200));
        assert_eq!(cfg.sweep_interval, Duration::from_secs(300));
        assert!(cfg.public_base_url.is_none());
    }

    #[test]
    fn max_file_size_is_configured_in_gib() {
        assert_eq!(2u64 * GIB, 2 * 1024 * 1024 * 1024);
    }
}
