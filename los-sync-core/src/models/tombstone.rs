use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::identity::Identity;

/// A durable marker that a record was deleted.
///
/// `table` is always the canonical catalog name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tombstone {
    pub table: String,
    pub identity: Identity,
    pub deleted_at: DateTime<Utc>,
}

impl Tombstone {
    pub fn new(table: impl Into<String>, identity: Identity, deleted_at: DateTime<Utc>) -> Self {
        Self {
            table: table.into(),
            identity,
            deleted_at,
        }
    }
}
