//! Server configuration loaded from environment variables.

use std::time::Duration;

/// Server configuration loaded from environment variables.
///
/// All fields have sensible defaults suitable for local development.
/// In production, override via environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `3000`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS`.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `30`).
    pub request_timeout_secs: u64,
    /// Base URL of the external segmentation inference service.
    pub inference_url: String,
    /// GPU pool slots: concurrent segmentation calls (default: `2`).
    pub gpu_pool_capacity: usize,
    /// IO pool slots: concurrent export/upload jobs (default: `4`).
    pub io_pool_capacity: usize,
    /// Per-call work function deadline in seconds (default: `300`).
    pub job_timeout_secs: u64,
    /// Transient failures retried at most this many times (default: `3`).
    pub max_transient_retries: u32,
    /// Events retained per scope for replay (default: `1024`).
    pub event_retention: usize,
    /// Seconds between WebSocket heartbeat pings (default: `30`).
    pub ws_heartbeat_secs: u64,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                 | Default                   |
    /// |-------------------------|---------------------------|
    /// | `HOST`                  | `0.0.0.0`                 |
    /// | `PORT`                  | `3000`                    |
    /// | `CORS_ORIGINS`          | `http://localhost:5173`   |
    /// | `REQUEST_TIMEOUT_SECS`  | `30`                      |
    /// | `INFERENCE_URL`         | `http://localhost:9090`   |
    /// | `GPU_POOL_CAPACITY`     | `2`                       |
    /// | `IO_POOL_CAPACITY`      | `4`                       |
    /// | `JOB_TIMEOUT_SECS`      | `300`                     |
    /// | `MAX_TRANSIENT_RETRIES` | `3`                       |
    /// | `EVENT_RETENTION`       | `1024`                    |
    /// | `WS_HEARTBEAT_SECS`     | `30`                      |
    pub fn from_env() -> Self {
        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into());

        let port: u16 = std::env::var("PORT")
            .unwrap_or_else(|_| "3000".into())
            .parse()
            .expect("PORT must be a valid u16");

        let cors_origins: Vec<String> = std::env::var("CORS_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:5173".into())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let request_timeout_secs: u64 = std::env::var("REQUEST_TIMEOUT_SECS")
            .unwrap_or_else(|_| "30".into())
            .parse()
            .expect("REQUEST_TIMEOUT_SECS must be a valid u64");

        let inference_url =
            std::env::var("INFERENCE_URL").unwrap_or_else(|_| "http://localhost:9090".into());

        let gpu_pool_capacity: usize = std::env::var("GPU_POOL_CAPACITY")
            .unwrap_or_else(|_| "2".into())
            .parse()
            .expect("GPU_POOL_CAPACITY must be a valid usize");

        let io_pool_capacity: usize = std::env::var("IO_POOL_CAPACITY")
            .unwrap_or_else(|_| "4".into())
            .parse()
            .expect("IO_POOL_CAPACITY must be a valid usize");

        let job_timeout_secs: u64 = std::env::var("JOB_TIMEOUT_SECS")
            .unwrap_or_else(|_| "300".into())
            .parse()
            .expect("JOB_TIMEOUT_SECS must be a valid u64");

        let max_transient_retries: u32 = std::env::var("MAX_TRANSIENT_RETRIES")
            .unwrap_or_else(|_| "3".into())
            .parse()
            .expect("MAX_TRANSIENT_RETRIES must be a valid u32");

        let event_retention: usize = std::env::var("EVENT_RETENTION")
            .unwrap_or_else(|_| "1024".into())
            .parse()
            .expect("EVENT_RETENTION must be a valid usize");

        let ws_heartbeat_secs: u64 = std::env::var("WS_HEARTBEAT_SECS")
            .unwrap_or_else(|_| "30".into())
            .parse()
            .expect("WS_HEARTBEAT_SECS must be a valid u64");

        Self {
            host,
            port,
            cors_origins,
            request_timeout_secs,
            inference_url,
            gpu_pool_capacity,
            io_pool_capacity,
            job_timeout_secs,
            max_transient_retries,
            event_retention,
            ws_heartbeat_secs,
        }
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn ws_heartbeat(&self) -> Duration {
        Duration::from_secs(self.ws_heartbeat_secs)
    }
}
