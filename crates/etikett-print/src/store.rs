// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Persistent default-printer selection backed by SQLite.
//
// One row per connection type holds the stable identifier of the designated
// default device (USB serial number, network hardware address). Rows survive
// process restarts and are updateable independently. A stored value that
// parses as a bare integer is a list position persisted by older releases;
// the registry migrates those to stable identifiers once the device is
// visible (see `parse_legacy_index`).

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info, instrument};

use etikett_core::error::{EtikettError, Result};
use etikett_core::types::ConnectionType;

/// SQLite schema for the default-selection table.
const CREATE_TABLE_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS default_printers (
        connection_type TEXT PRIMARY KEY,
        device_id TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
"#;

/// Persistent selection store backed by a SQLite database.
///
/// All methods are synchronous because `rusqlite` does not support async
/// natively.  In an async context, wrap calls in `tokio::task::spawn_blocking`.
pub struct SelectionStore {
    /// The open SQLite connection.
    conn: Connection,
}

impl SelectionStore {
    /// Open (or create) the selection database at the given path.
    ///
    /// Applies WAL journal mode and creates the table if it does not exist.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| EtikettError::Store(format!("open: {e}")))?;

        // WAL mode survives unclean shutdowns more gracefully and lets the
        // status route read while an assignment writes.
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| EtikettError::Store(format!("WAL pragma: {e}")))?;

        conn.execute_batch(CREATE_TABLE_SQL)
            .map_err(|e| EtikettError::Store(format!("create table: {e}")))?;

        info!("selection store opened");
        Ok(Self { conn })
    }

    /// Open an in-memory database (useful for tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| EtikettError::Store(format!("open in-memory: {e}")))?;

        conn.execute_batch(CREATE_TABLE_SQL)
            .map_err(|e| EtikettError::Store(format!("create table: {e}")))?;

        debug!("in-memory selection store opened");
        Ok(Self { conn })
    }

    /// Return the persisted default identifier for a connection type.
    ///
    /// `None` means no default has ever been assigned (first run) or it was
    /// cleared.
    #[instrument(skip(self))]
    pub fn get(&self, connection_type: ConnectionType) -> Result<Option<String>> {
        let device_id = self
            .conn
            .query_row(
                "SELECT device_id FROM default_printers WHERE connection_type = ?1",
                params![connection_type.as_str()],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(|e| EtikettError::Store(format!("get default: {e}")))?;

        debug!(?device_id, "loaded persisted default");
        Ok(device_id)
    }

    /// Persist the default identifier for a connection type, replacing any
    /// previous value. At most one row exists per connection type.
    #[instrument(skip(self, device_id), fields(device_id = %device_id))]
    pub fn set(&self, connection_type: ConnectionType, device_id: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO default_printers (connection_type, device_id, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(connection_type) DO UPDATE SET
                     device_id = excluded.device_id,
                     updated_at = excluded.updated_at",
                params![
                    connection_type.as_str(),
                    device_id,
                    Utc::now().to_rfc3339()
                ],
            )
            .map_err(|e| EtikettError::Store(format!("set default: {e}")))?;

        info!(%connection_type, "default persisted");
        Ok(())
    }

    /// Remove the persisted default for a connection type. Idempotent.
    #[instrument(skip(self))]
    pub fn clear(&self, connection_type: ConnectionType) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM default_printers WHERE connection_type = ?1",
                params![connection_type.as_str()],
            )
            .map_err(|e| EtikettError::Store(format!("clear default: {e}")))?;

        info!(%connection_type, "default cleared");
        Ok(())
    }
}

/// Interpret a stored value as a legacy list position.
///
/// Older releases persisted the default as a bare list index. Those values
/// cannot be matched by stable identity and must be resolved against the
/// current device list, then rewritten.
pub fn parse_legacy_index(value: &str) -> Option<usize> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<usize>().ok()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get_roundtrip() {
        let store = SelectionStore::open_in_memory().expect("open");
        store.set(ConnectionType::Usb, "SN123").expect("set");

        let loaded = store.get(ConnectionType::Usb).expect("get");
        assert_eq!(loaded.as_deref(), Some("SN123"));
    }

    #[test]
    fn missing_record_returns_none() {
        let store = SelectionStore::open_in_memory().expect("open");
        assert!(store.get(ConnectionType::Wifi).expect("get").is_none());
    }

    #[test]
    fn set_overwrites_single_row() {
        let store = SelectionStore::open_in_memory().expect("open");
        store.set(ConnectionType::Wifi, "aa:bb:cc:dd:ee:ff").expect("set");
        store.set(ConnectionType::Wifi, "aa:bb:cc:dd:ee:ff").expect("set again");
        store.set(ConnectionType::Wifi, "11:22:33:44:55:66").expect("set other");

        let count: i64 = store
            .conn
            .query_row(
                "SELECT COUNT(*) FROM default_printers WHERE connection_type = 'wifi'",
                [],
                |row| row.get(0),
            )
            .expect("count");
        assert_eq!(count, 1);

        let loaded = store.get(ConnectionType::Wifi).expect("get");
        assert_eq!(loaded.as_deref(), Some("11:22:33:44:55:66"));
    }

    #[test]
    fn types_are_independent() {
        let store = SelectionStore::open_in_memory().expect("open");
        store.set(ConnectionType::Usb, "SN123").expect("set usb");
        store.set(ConnectionType::Wifi, "aa:bb:cc:dd:ee:ff").expect("set wifi");

        store.clear(ConnectionType::Usb).expect("clear usb");

        assert!(store.get(ConnectionType::Usb).expect("get usb").is_none());
        assert_eq!(
            store.get(ConnectionType::Wifi).expect("get wifi").as_deref(),
            Some("aa:bb:cc:dd:ee:ff")
        );
    }

    #[test]
    fn clear_is_idempotent() {
        let store = SelectionStore::open_in_memory().expect("open");
        store.clear(ConnectionType::Usb).expect("clear on empty");
        store.set(ConnectionType::Usb, "SN123").expect("set");
        store.clear(ConnectionType::Usb).expect("clear");
        store.clear(ConnectionType::Usb).expect("clear again");
        assert!(store.get(ConnectionType::Usb).expect("get").is_none());
    }

    #[test]
    fn survives_reopen_on_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("selections.db");

        {
            let store = SelectionStore::open(&path).expect("open");
            store.set(ConnectionType::Usb, "SN999").expect("set");
        }

        let store = SelectionStore::open(&path).expect("reopen");
        assert_eq!(
            store.get(ConnectionType::Usb).expect("get").as_deref(),
            Some("SN999")
        );
    }

    #[test]
    fn legacy_index_parses() {
        assert_eq!(parse_legacy_index("0"), Some(0));
        assert_eq!(parse_legacy_index("2"), Some(2));
        assert_eq!(parse_legacy_index(" 7 "), Some(7));
    }

    #[test]
    fn stable_ids_are_not_legacy() {
        assert_eq!(parse_legacy_index("SN123"), None);
        assert_eq!(parse_legacy_index("aa:bb:cc:dd:ee:ff"), None);
        assert_eq!(parse_legacy_index(""), None);
        assert_eq!(parse_legacy_index("-1"), None);
    }
}
