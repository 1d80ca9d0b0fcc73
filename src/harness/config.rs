//! Harness configuration, loaded from TOML.
//!
//! Every field has a default, so an empty document is a valid configuration:
//!
//! ```toml
//! device_name = "mlx5_0"
//! ipv4_only = true
//!
//! [connection]
//! path_mtu = 4096
//! retry_cnt = 7
//!
//! [queue]
//! cq_depth = 1024
//!
//! [[profile]]
//! family = "irdma"
//! atomic_capability = "none"
//! ```
use std::path::{Path, PathBuf};
use std::{env, fs, io};

use serde::{Deserialize, Serialize};

use crate::harness::introspection::CapabilityProfile;
use crate::ibverbs::device_context::Mtu;

/// Names the TOML file read by [`HarnessConfig::from_env`].
pub const CONFIG_ENV: &str = "VERBS_HARNESS_CONFIG";
/// Overrides [`HarnessConfig::device_name`] in [`HarnessConfig::from_env`].
pub const DEVICE_ENV: &str = "VERBS_HARNESS_DEVICE";

/// PSNs are 24-bit on the wire.
pub const MAX_PSN: u32 = 0x00ff_ffff;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),
    #[error("packet sequence number {0:#x} does not fit in 24 bits")]
    InvalidPsn(u32),
    #[error("queue.{0} must be non-zero")]
    ZeroQueueDepth(&'static str),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    /// Open this device instead of the first usable one.
    pub device_name: Option<String>,
    /// Keep only IPv4-mapped RoCE v2 GIDs when enumerating local ports.
    pub ipv4_only: bool,
    pub connection: ConnectionConfig,
    pub queue: QueueConfig,
    /// Extra capability profiles for the introspection registry.
    #[serde(rename = "profile")]
    pub profiles: Vec<CapabilityProfile>,
}

/// Attribute values used by the connection recipes when driving a QP through its states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionConfig {
    #[serde(with = "mtu_bytes")]
    pub path_mtu: Mtu,
    /// Starting PSN for both the send and the receive queue.
    pub psn: u32,
    pub timeout: u8,
    pub retry_cnt: u8,
    pub rnr_retry: u8,
    pub min_rnr_timer: u8,
    pub max_rd_atomic: u8,
    pub max_dest_rd_atomic: u8,
    pub hop_limit: u8,
    pub traffic_class: u8,
    pub pkey_index: u16,
    pub default_qkey: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            path_mtu: Mtu::Mtu1024,
            psn: 1225,
            timeout: 17,
            retry_cnt: 5,
            rnr_retry: 5,
            min_rnr_timer: 26,
            max_rd_atomic: 10,
            max_dest_rd_atomic: 10,
            hop_limit: 127,
            traffic_class: 0,
            pkey_index: 0,
            default_qkey: 200,
        }
    }
}

impl ConnectionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.psn > MAX_PSN {
            return Err(ConfigError::InvalidPsn(self.psn));
        }
        Ok(())
    }
}

/// Default sizes for queues the allocator creates without explicit bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub cq_depth: u32,
    pub srq_max_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
    pub max_inline_data: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            max_send_wr: 200,
            max_recv_wr: 200,
            cq_depth: 200,
            srq_max_wr: 200,
            max_send_sge: 1,
            max_recv_sge: 1,
            max_inline_data: 36,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("max_send_wr", self.max_send_wr),
            ("max_recv_wr", self.max_recv_wr),
            ("cq_depth", self.cq_depth),
            ("srq_max_wr", self.srq_max_wr),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroQueueDepth(name));
            }
        }
        Ok(())
    }
}

impl HarnessConfig {
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: HarnessConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let toml_str = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&toml_str)
    }

    /// Load the file named by `VERBS_HARNESS_CONFIG` (defaults when unset), then apply the
    /// `VERBS_HARNESS_DEVICE` override.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(path)?,
            None => HarnessConfig::default(),
        };
        if let Ok(device_name) = env::var(DEVICE_ENV) {
            if !device_name.is_empty() {
                config.device_name = Some(device_name);
            }
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.connection.validate()?;
        self.queue.validate()
    }
}

// The MTU is written as a byte count in config files.
mod mtu_bytes {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::ibverbs::device_context::Mtu;

    pub fn serialize<S: Serializer>(mtu: &Mtu, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(mtu.bytes())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Mtu, D::Error> {
        let bytes = u32::deserialize(deserializer)?;
        Mtu::from_bytes(bytes).ok_or_else(|| D::Error::custom(format!("unsupported path MTU {bytes}")))
    }
}
