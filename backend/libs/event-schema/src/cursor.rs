use chrono::{DateTime, SubsecRound, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::EventError;

/// Ordering key of a message inside a thread.
///
/// Compared lexicographically: creation timestamp first, server id as tie-break.
/// Field order matters for the derived `Ord`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Cursor {
    pub created_at: DateTime<Utc>,
    pub id: i64,
}

impl Cursor {
    pub fn new(created_at: DateTime<Utc>, id: i64) -> Self {
        Self {
            created_at: storage_precision(created_at),
            id,
        }
    }

    /// Compact form used in query strings: `<unix micros>_<id>`
    pub fn encode(&self) -> String {
        format!("{}_{}", self.created_at.timestamp_micros(), self.id)
    }

    pub fn decode(raw: &str) -> Result<Self, EventError> {
        let (micros, id) = raw.split_once('_').ok_or_else(|| EventError::InvalidField {
            field: "cursor",
            reason: format!("expected <micros>_<id>, got {raw}"),
        })?;
        let micros: i64 = micros.parse().map_err(|_| EventError::InvalidField {
            field: "cursor",
            reason: format!("bad timestamp component: {micros}"),
        })?;
        let id: i64 = id.parse().map_err(|_| EventError::InvalidField {
            field: "cursor",
            reason: format!("bad id component: {id}"),
        })?;
        let created_at = Utc
            .timestamp_micros(micros)
            .single()
            .ok_or_else(|| EventError::InvalidField {
                field: "cursor",
                reason: format!("timestamp out of range: {micros}"),
            })?;
        Ok(Self { created_at, id })
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for Cursor {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

/// Postgres keeps microseconds; every timestamp that becomes part of a cursor is
/// truncated the same way so in-memory and stored cursors compare equal.
pub fn storage_precision(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(6)
}
