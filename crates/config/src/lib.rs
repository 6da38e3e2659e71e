//! On-disk replica configuration.
//!
//! A replica directory holds one `config.toml` describing the node's
//! identity and placement, the synchronization cadence, the call timeout
//! and the peer set. Durations live in the file as integer milliseconds.

use core::time::Duration;
use std::fs::{read_to_string, write};

use camino::Utf8Path;
use eyre::{Result as EyreResult, WrapErr};
use flotilla_primitives::node::NodeInfo;
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE: &str = "config.toml";

pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(6);

#[derive(Clone, Debug, Deserialize, Serialize)]
#[non_exhaustive]
pub struct ConfigFile {
    /// Peers this replica synchronizes with, by node id.
    #[serde(default)]
    pub peers: Vec<String>,

    pub node: NodeConfig,

    pub sync: SyncConfig,

    #[serde(default)]
    pub rpc: RpcConfig,
}

impl ConfigFile {
    #[must_use]
    pub const fn new(
        node: NodeConfig,
        sync: SyncConfig,
        rpc: RpcConfig,
        peers: Vec<String>,
    ) -> Self {
        Self {
            peers,
            node,
            sync,
            rpc,
        }
    }

    #[must_use]
    pub fn exists(dir: &Utf8Path) -> bool {
        dir.join(CONFIG_FILE).is_file()
    }

    pub fn load(dir: &Utf8Path) -> EyreResult<Self> {
        let path = dir.join(CONFIG_FILE);
        let content = read_to_string(&path)
            .wrap_err_with(|| format!("failed to read configuration from {path:?}"))?;

        toml::from_str(&content).map_err(Into::into)
    }

    pub fn save(&self, dir: &Utf8Path) -> EyreResult<()> {
        let path = dir.join(CONFIG_FILE);
        let content = toml::to_string_pretty(self)?;

        write(&path, content)
            .wrap_err_with(|| format!("failed to write configuration to {path:?}"))?;

        Ok(())
    }
}

/// Identity and placement of this replica.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NodeConfig {
    pub node_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub region: String,
}

impl NodeConfig {
    /// The node record this replica announces for itself.
    #[must_use]
    pub fn to_info(&self) -> NodeInfo {
        NodeInfo {
            node_id: self.node_id.clone(),
            latitude: self.latitude,
            longitude: self.longitude,
            region: self.region.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct SyncConfig {
    #[serde(
        rename = "timeout_ms",
        with = "serde_duration",
        default = "default_sync_timeout"
    )]
    pub timeout: Duration,

    #[serde(
        rename = "interval_ms",
        with = "serde_duration",
        default = "default_sync_interval"
    )]
    pub interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_SYNC_TIMEOUT,
            interval: DEFAULT_SYNC_INTERVAL,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct RpcConfig {
    #[serde(
        rename = "call_timeout_ms",
        with = "serde_duration",
        default = "default_call_timeout"
    )]
    pub call_timeout: Duration,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

fn default_sync_timeout() -> Duration {
    DEFAULT_SYNC_TIMEOUT
}

fn default_sync_interval() -> Duration {
    DEFAULT_SYNC_INTERVAL
}

fn default_call_timeout() -> Duration {
    DEFAULT_CALL_TIMEOUT
}

mod serde_duration {
    use core::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use tempdir::TempDir;

    use super::*;

    fn sample() -> ConfigFile {
        ConfigFile::new(
            NodeConfig {
                node_id: "node1".to_owned(),
                latitude: 30.2741,
                longitude: 120.1551,
                region: "Hangzhou".to_owned(),
            },
            SyncConfig {
                timeout: Duration::from_millis(1500),
                interval: Duration::from_millis(2500),
            },
            RpcConfig {
                call_timeout: Duration::from_millis(750),
            },
            vec!["node2".to_owned()],
        )
    }

    #[test]
    fn test_round_trips_through_disk() {
        let dir = TempDir::new("flotilla-config").unwrap();
        let dir_path = Utf8Path::from_path(dir.path()).unwrap();

        assert!(!ConfigFile::exists(dir_path));
        sample().save(dir_path).unwrap();
        assert!(ConfigFile::exists(dir_path));

        let loaded = ConfigFile::load(dir_path).unwrap();
        assert_eq!(loaded.node.node_id, "node1");
        assert_eq!(loaded.sync.timeout, Duration::from_millis(1500));
        assert_eq!(loaded.sync.interval, Duration::from_millis(2500));
        assert_eq!(loaded.rpc.call_timeout, Duration::from_millis(750));
        assert_eq!(loaded.peers, vec!["node2".to_owned()]);
    }

    #[test]
    fn test_durations_persist_as_milliseconds() {
        let dir = TempDir::new("flotilla-config").unwrap();
        let dir_path = Utf8Path::from_path(dir.path()).unwrap();

        sample().save(dir_path).unwrap();

        let raw = read_to_string(dir_path.join(CONFIG_FILE)).unwrap();
        assert!(raw.contains("timeout_ms = 1500"));
        assert!(raw.contains("interval_ms = 2500"));
        assert!(raw.contains("call_timeout_ms = 750"));
    }

    #[test]
    fn test_missing_sections_fall_back_to_defaults() {
        let dir = TempDir::new("flotilla-config").unwrap();
        let dir_path = Utf8Path::from_path(dir.path()).unwrap();

        write(
            dir_path.join(CONFIG_FILE),
            concat!(
                "[node]\n",
                "node_id = \"node1\"\n",
                "latitude = 30.2741\n",
                "longitude = 120.1551\n",
                "region = \"Hangzhou\"\n",
                "\n",
                "[sync]\n",
            ),
        )
        .unwrap();

        let loaded = ConfigFile::load(dir_path).unwrap();
        assert_eq!(loaded.sync.timeout, DEFAULT_SYNC_TIMEOUT);
        assert_eq!(loaded.sync.interval, DEFAULT_SYNC_INTERVAL);
        assert_eq!(loaded.rpc.call_timeout, DEFAULT_CALL_TIMEOUT);
        assert!(loaded.peers.is_empty());
    }

    #[test]
    fn test_node_config_builds_node_info() {
        let info = sample().node.to_info();

        assert_eq!(info.node_id, "node1");
        assert_eq!(info.region, "Hangzhou");
        assert!((info.latitude - 30.2741).abs() < f64::EPSILON);
        assert!((info.longitude - 120.1551).abs() < f64::EPSILON);
    }

    #[test]
    fn test_load_reports_missing_file() {
        let dir = TempDir::new("flotilla-config").unwrap();
        let dir_path = Utf8Path::from_path(dir.path()).unwrap();

        assert!(ConfigFile::load(dir_path).is_err());
    }
}
