//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the RPC front (e.g. "0.0.0.0:8080").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Bind address for the subscription gateway.
    #[serde(default = "default_gateway_bind")]
    pub gateway_bind: String,
    /// Upload mode selection threshold in bytes.
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: u64,
    /// Reject inbound chunks larger than this.
    #[serde(default = "default_max_chunk_bytes")]
    pub max_chunk_bytes: u64,
    /// Chunk size hint returned from Initiate.
    #[serde(default = "default_recommended_chunk_bytes")]
    pub recommended_chunk_bytes: u64,
    /// Abort upload sessions with no chunk activity for this long.
    #[serde(default = "default_session_idle_timeout_secs")]
    pub session_idle_timeout_secs: u64,
    /// Adapter read granularity for downloads.
    #[serde(default = "default_download_read_chunk_bytes")]
    pub download_read_chunk_bytes: u64,
    /// Maximum concurrently open upload sessions.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Per-session in-memory buffer cap in bytes.
    #[serde(default = "default_max_session_buffer_bytes")]
    pub max_session_buffer_bytes: u64,
    /// Aggregate in-memory buffer cap across all sessions. New sessions
    /// are rejected rather than degrading existing ones.
    #[serde(default = "default_max_total_buffer_bytes")]
    pub max_total_buffer_bytes: u64,
    /// Enable the /metrics endpoint for Prometheus scraping.
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_gateway_bind() -> String {
    "127.0.0.1:8081".to_string()
}

fn default_multipart_threshold() -> u64 {
    crate::DEFAULT_MULTIPART_THRESHOLD
}

fn default_max_chunk_bytes() -> u64 {
    crate::MAX_CHUNK_SIZE
}

fn default_recommended_chunk_bytes() -> u64 {
    crate::DEFAULT_RECOMMENDED_CHUNK_SIZE
}

fn default_session_idle_timeout_secs() -> u64 {
    1800 // 30 minutes
}

fn default_download_read_chunk_bytes() -> u64 {
    256 * 1024
}

fn default_max_sessions() -> usize {
    256
}

fn default_max_session_buffer_bytes() -> u64 {
    64 * 1024 * 1024
}

fn default_max_total_buffer_bytes() -> u64 {
    512 * 1024 * 1024
}

fn default_metrics_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            gateway_bind: default_gateway_bind(),
            multipart_threshold_bytes: default_multipart_threshold(),
            max_chunk_bytes: default_max_chunk_bytes(),
            recommended_chunk_bytes: default_recommended_chunk_bytes(),
            session_idle_timeout_secs: default_session_idle_timeout_secs(),
            download_read_chunk_bytes: default_download_read_chunk_bytes(),
            max_sessions: default_max_sessions(),
            max_session_buffer_bytes: default_max_session_buffer_bytes(),
            max_total_buffer_bytes: default_max_total_buffer_bytes(),
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

impl ServerConfig {
    /// Session idle timeout as a Duration.
    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }

    /// Validate bounds that would otherwise break the ingest path.
    pub fn validate(&self) -> Result<(), String> {
        if self.recommended_chunk_bytes < crate::MIN_CHUNK_SIZE
            || self.recommended_chunk_bytes > self.max_chunk_bytes
        {
            return Err(format!(
                "recommended_chunk_bytes must be between {} and {}",
                crate::MIN_CHUNK_SIZE,
                self.max_chunk_bytes
            ));
        }
        if self.max_chunk_bytes == 0 || self.download_read_chunk_bytes == 0 {
            return Err("chunk sizes must be positive".to_string());
        }
        if self.max_session_buffer_bytes > self.max_total_buffer_bytes {
            return Err(
                "max_session_buffer_bytes must not exceed max_total_buffer_bytes".to_string(),
            );
        }
        Ok(())
    }
}

/// Progress registry configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProgressConfig {
    /// Minimum gap between non-terminal publishes, in milliseconds.
    #[serde(default = "default_coalesce_interval_ms")]
    pub coalesce_interval_ms: u64,
    /// Grace period before a terminal record is deleted, in seconds.
    /// Clamped to the 60–300 s window.
    #[serde(default = "default_retention_secs")]
    pub retention_after_terminal_secs: u64,
    /// Per-subscriber snapshot buffer capacity.
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer_capacity: usize,
}

fn default_coalesce_interval_ms() -> u64 {
    500
}

fn default_retention_secs() -> u64 {
    120
}

fn default_subscriber_buffer() -> usize {
    32
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            coalesce_interval_ms: default_coalesce_interval_ms(),
            retention_after_terminal_secs: default_retention_secs(),
            subscriber_buffer_capacity: default_subscriber_buffer(),
        }
    }
}

impl ProgressConfig {
    /// Coalescing interval as a Duration.
    pub fn coalesce_interval(&self) -> Duration {
        Duration::from_millis(self.coalesce_interval_ms)
    }

    /// Retention window as a Duration, clamped to the allowed range.
    pub fn retention_after_terminal(&self) -> Duration {
        Duration::from_secs(self.retention_after_terminal_secs.clamp(60, 300))
    }

    /// Buffer capacity with a floor of 16 applied.
    pub fn buffer_capacity(&self) -> usize {
        self.subscriber_buffer_capacity.max(16)
    }
}

/// Subscription gateway configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Heartbeat ping interval in seconds.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Maximum inbound gateway message size in bytes.
    #[serde(default = "default_gateway_max_message_bytes")]
    pub max_message_bytes: usize,
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_gateway_max_message_bytes() -> usize {
    64 * 1024
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: default_heartbeat_secs(),
            max_message_bytes: default_gateway_max_message_bytes(),
        }
    }
}

impl GatewayConfig {
    /// Heartbeat period as a Duration.
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    /// Deadline for a pong reply: two missed heartbeats end the
    /// connection.
    pub fn pong_deadline(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs * 2)
    }
}

/// Storage backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Filesystem {
        /// Root directory for storage.
        path: PathBuf,
    },
    /// S3-compatible storage.
    S3 {
        /// Bucket name.
        bucket: String,
        /// Optional endpoint URL (for MinIO, etc.).
        endpoint: Option<String>,
        /// AWS region.
        region: Option<String>,
        /// Optional key prefix.
        prefix: Option<String>,
        /// AWS access key ID. Falls back to ambient credentials if not set.
        access_key_id: Option<String>,
        /// AWS secret access key. Falls back to ambient credentials if not set.
        secret_access_key: Option<String>,
        /// Force path-style URLs. Required for MinIO and some
        /// S3-compatible services.
        #[serde(default)]
        force_path_style: bool,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/storage"),
        }
    }
}

impl StorageConfig {
    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Filesystem { path } => {
                if path.as_os_str().is_empty() {
                    return Err("filesystem storage path must not be empty".to_string());
                }
            }
            Self::S3 {
                bucket,
                access_key_id,
                secret_access_key,
                ..
            } => {
                if bucket.is_empty() {
                    return Err("s3 bucket must not be empty".to_string());
                }
                if access_key_id.is_some() ^ secret_access_key.is_some() {
                    return Err(
                        "s3 config requires both access_key_id and secret_access_key when either is set"
                            .to_string(),
                    );
                }
            }
        }
        Ok(())
    }
}

/// Top-level application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub progress: ProgressConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl AppConfig {
    /// Configuration suitable for tests: ephemeral ports, small buffers,
    /// fast coalescing.
    pub fn for_testing() -> Self {
        Self {
            server: ServerConfig {
                bind: "127.0.0.1:0".to_string(),
                gateway_bind: "127.0.0.1:0".to_string(),
                multipart_threshold_bytes: 4 * 1024 * 1024,
                max_sessions: 16,
                max_session_buffer_bytes: 16 * 1024 * 1024,
                max_total_buffer_bytes: 64 * 1024 * 1024,
                ..ServerConfig::default()
            },
            progress: ProgressConfig {
                coalesce_interval_ms: 0,
                retention_after_terminal_secs: 60,
                subscriber_buffer_capacity: 16,
            },
            gateway: GatewayConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults_validate() {
        ServerConfig::default().validate().unwrap();
    }

    #[test]
    fn server_rejects_inverted_chunk_bounds() {
        let config = ServerConfig {
            recommended_chunk_bytes: 1,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ServerConfig {
            max_session_buffer_bytes: 10,
            max_total_buffer_bytes: 5,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn progress_retention_clamped() {
        let config = ProgressConfig {
            retention_after_terminal_secs: 5,
            ..ProgressConfig::default()
        };
        assert_eq!(config.retention_after_terminal(), Duration::from_secs(60));

        let config = ProgressConfig {
            retention_after_terminal_secs: 9999,
            ..ProgressConfig::default()
        };
        assert_eq!(config.retention_after_terminal(), Duration::from_secs(300));
    }

    #[test]
    fn progress_buffer_floor() {
        let config = ProgressConfig {
            subscriber_buffer_capacity: 2,
            ..ProgressConfig::default()
        };
        assert_eq!(config.buffer_capacity(), 16);
    }

    #[test]
    fn storage_rejects_partial_credentials() {
        let config = StorageConfig::S3 {
            bucket: "bucket".to_string(),
            endpoint: None,
            region: None,
            prefix: None,
            access_key_id: Some("access".to_string()),
            secret_access_key: None,
            force_path_style: false,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn storage_rejects_empty_bucket() {
        let config = StorageConfig::S3 {
            bucket: String::new(),
            endpoint: None,
            region: None,
            prefix: None,
            access_key_id: None,
            secret_access_key: None,
            force_path_style: false,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn gateway_pong_deadline_is_two_heartbeats() {
        let config = GatewayConfig {
            heartbeat_secs: 7,
            ..GatewayConfig::default()
        };
        assert_eq!(config.pong_deadline(), Duration::from_secs(14));
    }

    #[test]
    fn app_config_toml_roundtrip() {
        let config = AppConfig::for_testing();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: AppConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.server.bind, config.server.bind);
        assert_eq!(
            parsed.progress.coalesce_interval_ms,
            config.progress.coalesce_interval_ms
        );
    }
}
