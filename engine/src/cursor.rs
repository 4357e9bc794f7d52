//! Pagination cursor.

use crate::{error::Result, Error, RecordId, Tick};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Position after the last row of a page: `(tick, id)`.
///
/// Rows are ordered by `(updatedAtTick, id)` and the next page starts strictly
/// after the cursor, so rows inserted between page requests can neither shift
/// the window (no skips) nor be seen twice (no duplicates).
///
/// The token form is `"{tick}_{id}"`. Ticks are numeric, so splitting on the
/// first underscore is unambiguous even when ids contain underscores.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cursor {
    pub tick: Tick,
    pub id: RecordId,
}

impl Cursor {
    pub fn new(tick: Tick, id: impl Into<RecordId>) -> Self {
        Self {
            tick,
            id: id.into(),
        }
    }

    /// Whether a row at `(tick, id)` comes strictly after this cursor.
    pub fn precedes(&self, tick: Tick, id: &str) -> bool {
        (self.tick, self.id.as_str()) < (tick, id)
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.tick, self.id)
    }
}

impl FromStr for Cursor {
    type Err = Error;

    fn from_str(token: &str) -> Result<Self> {
        let (tick, id) = token
            .split_once('_')
            .ok_or_else(|| Error::InvalidCursor(token.to_string()))?;
        let tick = tick
            .parse()
            .map_err(|_| Error::InvalidCursor(token.to_string()))?;
        if id.is_empty() {
            return Err(Error::InvalidCursor(token.to_string()));
        }
        Ok(Cursor::new(tick, id))
    }
}

impl TryFrom<String> for Cursor {
    type Error = crate::Error;

    fn try_from(token: String) -> Result<Self> {
        token.parse()
    }
}

impl From<Cursor> for String {
    fn from(cursor: Cursor) -> Self {
        cursor.to_string()
    }
}
