//! Engine configuration.

use crate::EntityName;
use serde::{Deserialize, Serialize};

/// Deployment-wide sync settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    /// Serve no outgoing changes at all
    pub read_only: bool,
    /// Entity types where an incoming edit clears a local tombstone instead
    /// of being rejected
    pub revivable_types: Vec<EntityName>,
    /// A session that has not connected for this long is marked errored on
    /// its next connection
    pub session_timeout_ms: u64,
    /// Idle sessions older than this are dropped with their snapshot rows
    pub lapsed_session_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            read_only: false,
            revivable_types: Vec::new(),
            session_timeout_ms: 10 * 60 * 1000,
            lapsed_session_ms: 60 * 60 * 1000,
        }
    }
}

impl SyncConfig {
    pub fn is_revivable(&self, entity: &str) -> bool {
        self.revivable_types.iter().any(|t| t == entity)
    }
}

/// Per-session overrides negotiated at handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    /// Patient-linked types sent in full regardless of which patients the
    /// peer follows
    pub sync_all_types: Vec<EntityName>,
}

impl SessionConfig {
    pub fn syncs_all(&self, entity: &str) -> bool {
        self.sync_all_types.iter().any(|t| t == entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_keys() {
        let config: SyncConfig =
            serde_json::from_str(r#"{"revivableTypes": ["patientAllergy"]}"#).unwrap();
        assert!(!config.read_only);
        assert!(config.is_revivable("patientAllergy"));
        assert!(!config.is_revivable("encounter"));
        assert_eq!(config.session_timeout_ms, SyncConfig::default().session_timeout_ms);
    }

    #[test]
    fn session_config() {
        let config: SessionConfig =
            serde_json::from_str(r#"{"syncAllTypes": ["labRequest"]}"#).unwrap();
        assert!(config.syncs_all("labRequest"));
        assert!(!SessionConfig::default().syncs_all("labRequest"));
    }
}
