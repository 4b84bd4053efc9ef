//! Daemon configuration for an in-process replication topology.
//!
//! Loaded from a JSON file; every field has a default so a partial file
//! (or none at all) yields a runnable two-member topology.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::changelog::SyncMode;
use crate::error::ReplError;
use crate::window::WindowConfig;
use larch_store::Dn;

/// One replicated member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberConfig {
    /// The member's replica id, unique within the domain.
    pub replica_id: i32,
    /// Directory holding the member's changelog files.
    pub changelog_dir: PathBuf,
}

/// The relay node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayNodeConfig {
    /// The relay's server id, distinct from member replica ids.
    pub server_id: i32,
    /// Directory holding the relay's changelog files.
    pub changelog_dir: PathBuf,
}

impl Default for RelayNodeConfig {
    fn default() -> Self {
        Self {
            server_id: 1000,
            changelog_dir: PathBuf::from("data/relay"),
        }
    }
}

/// Full daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// The replicated domain id.
    pub domain_id: u32,
    /// The domain suffix, e.g. `dc=example`.
    pub suffix: String,
    /// Flow-control settings applied to every session.
    pub window: WindowConfig,
    /// Changelog sync strategy for members and relay.
    pub sync_mode: SyncMode,
    /// Heartbeat / state-report interval.
    pub heartbeat_ms: u64,
    /// Dependency-queue maintenance interval.
    pub tick_ms: u64,
    /// Monitoring report interval.
    pub report_every_ms: u64,
    /// The relay node.
    pub relay: RelayNodeConfig,
    /// The replicated members.
    pub members: Vec<MemberConfig>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            domain_id: 1,
            suffix: "dc=example".to_string(),
            window: WindowConfig::default(),
            sync_mode: SyncMode::default(),
            heartbeat_ms: 10_000,
            tick_ms: 500,
            report_every_ms: 5_000,
            relay: RelayNodeConfig::default(),
            members: vec![
                MemberConfig {
                    replica_id: 1,
                    changelog_dir: PathBuf::from("data/member-1"),
                },
                MemberConfig {
                    replica_id: 2,
                    changelog_dir: PathBuf::from("data/member-2"),
                },
            ],
        }
    }
}

impl DaemonConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ReplError> {
        let raw = fs::read_to_string(path)?;
        let config: DaemonConfig =
            serde_json::from_str(&raw).map_err(|e| ReplError::Malformed {
                msg: format!("config parse error: {e}"),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<(), ReplError> {
        if self.members.is_empty() {
            return Err(ReplError::Malformed {
                msg: "at least one member is required".to_string(),
            });
        }
        for (i, member) in self.members.iter().enumerate() {
            if self.members[..i]
                .iter()
                .any(|m| m.replica_id == member.replica_id)
            {
                return Err(ReplError::Malformed {
                    msg: format!("duplicate replica id {}", member.replica_id),
                });
            }
            if member.replica_id == self.relay.server_id {
                return Err(ReplError::Malformed {
                    msg: format!(
                        "replica id {} collides with the relay server id",
                        member.replica_id
                    ),
                });
            }
        }
        self.suffix_dn()?;
        Ok(())
    }

    /// The parsed domain suffix.
    pub fn suffix_dn(&self) -> Result<Dn, ReplError> {
        Ok(Dn::parse(&self.suffix)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_validates() {
        let config = DaemonConfig::default();
        config.validate().unwrap();
        assert_eq!(config.members.len(), 2);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"suffix": "dc=acme,dc=org", "heartbeat_ms": 2000}}"#
        )
        .unwrap();
        let config = DaemonConfig::load(file.path()).unwrap();
        assert_eq!(config.suffix, "dc=acme,dc=org");
        assert_eq!(config.heartbeat_ms, 2000);
        assert_eq!(config.domain_id, 1);
        assert_eq!(config.members.len(), 2);
    }

    #[test]
    fn duplicate_replica_id_rejected() {
        let mut config = DaemonConfig::default();
        config.members[1].replica_id = config.members[0].replica_id;
        assert!(matches!(
            config.validate(),
            Err(ReplError::Malformed { .. })
        ));
    }

    #[test]
    fn replica_id_colliding_with_relay_rejected() {
        let mut config = DaemonConfig::default();
        config.members[0].replica_id = config.relay.server_id;
        assert!(matches!(
            config.validate(),
            Err(ReplError::Malformed { .. })
        ));
    }

    #[test]
    fn empty_members_rejected() {
        let config = DaemonConfig {
            members: vec![],
            ..DaemonConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ReplError::Malformed { .. })
        ));
    }

    #[test]
    fn bad_suffix_rejected() {
        let config = DaemonConfig {
            suffix: "not a dn".to_string(),
            ..DaemonConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn garbage_file_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            DaemonConfig::load(file.path()),
            Err(ReplError::Malformed { .. })
        ));
    }
}
