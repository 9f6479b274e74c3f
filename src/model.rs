//! Core data model.
//!
//! A work item is one unit of queued work, usually a tile to render. It carries
//! a key/value payload, an error slot filled in when an operation on it failed,
//! and the receipt of its current delivery while it is in flight.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Key/value payload carried by a work item on the wire.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Payload key under which a tile coordinate is stored.
pub const TILECOORD_KEY: &str = "tilecoord";

// ---------------------------------------------------------------------------
// Work Item
// ---------------------------------------------------------------------------

/// A unit of work flowing through a queue store.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WorkItem {
    /// Domain payload. Opaque to the store; only this travels on the wire.
    pub payload: Payload,

    /// Set when an operation on this item failed (send rejected, queue
    /// unreachable). `None` means the last operation succeeded.
    pub error: Option<String>,

    /// Handle of the current in-flight delivery. Present only on items
    /// received from `QueueStore::list`, cleared by `delete_one`.
    pub receipt: Option<Receipt>,
}

impl WorkItem {
    pub fn new(payload: Payload) -> Self {
        Self {
            payload,
            error: None,
            receipt: None,
        }
    }

    /// Build an item for a single tile.
    pub fn for_tile(coord: TileCoord) -> Self {
        let mut payload = Payload::new();
        payload.insert(
            TILECOORD_KEY.to_string(),
            serde_json::Value::String(coord.to_string()),
        );
        Self::new(payload)
    }

    /// Set a payload entry.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// The tile coordinate in the payload, if there is one.
    pub fn tile_coord(&self) -> Option<Result<TileCoord>> {
        match self.payload.get(TILECOORD_KEY)? {
            serde_json::Value::String(s) => Some(s.parse()),
            other => Some(Err(Error::InvalidTileCoord(other.to_string()))),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Opaque token identifying one delivery of a message.
///
/// Only valid until the visibility timeout of that delivery expires; after
/// that the message may be redelivered under a different receipt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Receipt(pub String);

impl Receipt {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Receipt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Tile coordinates
// ---------------------------------------------------------------------------

/// A tile (or metatile of `n`×`n` tiles) at zoom `z`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileCoord {
    pub z: u32,
    pub x: u32,
    pub y: u32,
    pub n: u32,
}

impl TileCoord {
    pub fn new(z: u32, x: u32, y: u32) -> Self {
        Self { z, x, y, n: 1 }
    }

    pub fn metatile(z: u32, x: u32, y: u32, n: u32) -> Self {
        Self { z, x, y, n }
    }
}

impl std::fmt::Display for TileCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.n == 1 {
            write!(f, "{}/{}/{}", self.z, self.x, self.y)
        } else {
            write!(f, "{}/{}/{}:+{}/+{}", self.z, self.x, self.y, self.n, self.n)
        }
    }
}

impl FromStr for TileCoord {
    type Err = Error;

    /// Parses `z/x/y` or `z/x/y:+n/+n`.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidTileCoord(s.to_string());
        let (coord, size) = match s.split_once(':') {
            Some((coord, size)) => (coord, Some(size)),
            None => (s, None),
        };

        let parts: Vec<u32> = coord
            .split('/')
            .map(|p| p.trim().parse::<u32>().map_err(|_| invalid()))
            .collect::<Result<_>>()?;
        let [z, x, y] = parts[..] else {
            return Err(invalid());
        };

        let n = match size {
            None => 1,
            Some(size) => {
                let (w, h) = size.split_once('/').ok_or_else(invalid)?;
                let w: u32 = w.strip_prefix('+').ok_or_else(invalid)?.parse().map_err(|_| invalid())?;
                let h: u32 = h.strip_prefix('+').ok_or_else(invalid)?.parse().map_err(|_| invalid())?;
                if w != h || w == 0 {
                    return Err(invalid());
                }
                w
            }
        };

        Ok(Self { z, x, y, n })
    }
}

// ---------------------------------------------------------------------------
// Queue Status
// ---------------------------------------------------------------------------

/// Snapshot of queue attributes, read fresh from the backend on every call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    /// Approximate number of messages ready for delivery.
    pub visible: u64,
    /// Approximate number of messages received but not yet deleted.
    pub in_flight: u64,
    /// Seconds an in-flight message stays hidden before redelivery.
    pub visibility_timeout_secs: u32,
    /// Seconds a receive call may wait for messages to arrive.
    pub receive_wait_secs: u32,
    pub created_at: Option<DateTime<Utc>>,
    pub last_modified_at: Option<DateTime<Utc>>,
}

impl QueueStatus {
    /// Human-readable attribute map, one entry per field.
    pub fn to_attributes(&self) -> BTreeMap<&'static str, String> {
        let ts = |t: Option<DateTime<Utc>>| {
            t.map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                .unwrap_or_else(|| "-".to_string())
        };
        BTreeMap::from([
            ("approximate_visible", self.visible.to_string()),
            ("approximate_in_flight", self.in_flight.to_string()),
            (
                "visibility_timeout",
                format!("{}s", self.visibility_timeout_secs),
            ),
            ("receive_wait_time", format!("{}s", self.receive_wait_secs)),
            ("created", ts(self.created_at)),
            ("last_modified", ts(self.last_modified_at)),
        ])
    }

    /// Nothing visible and nothing in flight.
    pub fn is_drained(&self) -> bool {
        self.visible == 0 && self.in_flight == 0
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (key, value) in self.to_attributes() {
            writeln!(f, "{key:<22} {value}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tile_coord_display_and_parse() {
        let c = TileCoord::new(4, 5, 6);
        assert_eq!(c.to_string(), "4/5/6");
        assert_eq!("4/5/6".parse::<TileCoord>().unwrap(), c);

        let m = TileCoord::metatile(10, 16, 32, 8);
        assert_eq!(m.to_string(), "10/16/32:+8/+8");
        assert_eq!("10/16/32:+8/+8".parse::<TileCoord>().unwrap(), m);
    }

    #[test]
    fn tile_coord_rejects_garbage() {
        for bad in ["", "1/2", "1/2/3/4", "a/b/c", "1/2/3:+2/+4", "1/2/3:2/2", "1/2/3:+0/+0"] {
            assert!(bad.parse::<TileCoord>().is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn work_item_for_tile_round_trips_coord() {
        let item = WorkItem::for_tile(TileCoord::new(3, 1, 2));
        assert_eq!(item.tile_coord().unwrap().unwrap(), TileCoord::new(3, 1, 2));
        assert!(item.receipt.is_none());
        assert!(!item.is_failed());
    }

    #[test]
    fn tile_coord_absent_or_wrong_type() {
        assert!(WorkItem::default().tile_coord().is_none());
        let item = WorkItem::default().with(TILECOORD_KEY, 7);
        assert!(item.tile_coord().unwrap().is_err());
    }

    #[test]
    fn status_attributes_are_human_readable() {
        let status = QueueStatus {
            visible: 3,
            in_flight: 1,
            visibility_timeout_secs: 60,
            receive_wait_secs: 0,
            created_at: None,
            last_modified_at: None,
        };
        let attrs = status.to_attributes();
        assert_eq!(attrs["approximate_visible"], "3");
        assert_eq!(attrs["visibility_timeout"], "60s");
        assert_eq!(attrs["created"], "-");
        assert!(!status.is_drained());
        assert!(status.to_string().contains("approximate_in_flight"));
    }
}
