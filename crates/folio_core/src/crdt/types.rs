//! Update log records shared by the storage backends.

use serde::{Deserialize, Serialize};

/// A persisted incremental update.
#[derive(Debug, Clone)]
pub struct CrdtUpdate {
    pub update_id: i64,

    /// Store key of the document this update belongs to
    pub doc_name: String,

    /// Binary yrs update (v1 encoding)
    pub data: Vec<u8>,

    /// Unix timestamp when the update was appended (milliseconds)
    pub timestamp: i64,

    pub origin: UpdateOrigin,
}

/// Origin of an update, used to distinguish local vs remote changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateOrigin {
    /// Local mutation through a provider or worldbuilding connection
    Local,

    /// Update received from the replication server
    Remote,

    /// Diff applied during the SyncStep1/SyncStep2 exchange
    Sync,

    /// One-time import of a legacy JSON payload
    Migration,
}

impl std::fmt::Display for UpdateOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateOrigin::Local => write!(f, "local"),
            UpdateOrigin::Remote => write!(f, "remote"),
            UpdateOrigin::Sync => write!(f, "sync"),
            UpdateOrigin::Migration => write!(f, "migration"),
        }
    }
}

impl std::str::FromStr for UpdateOrigin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(UpdateOrigin::Local),
            "remote" => Ok(UpdateOrigin::Remote),
            "sync" => Ok(UpdateOrigin::Sync),
            "migration" => Ok(UpdateOrigin::Migration),
            _ => Err(format!("Unknown update origin: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_origin_round_trip() {
        for origin in [
            UpdateOrigin::Local,
            UpdateOrigin::Remote,
            UpdateOrigin::Sync,
            UpdateOrigin::Migration,
        ] {
            assert_eq!(origin.to_string().parse::<UpdateOrigin>().unwrap(), origin);
        }
        assert!("invalid".parse::<UpdateOrigin>().is_err());
    }
}
