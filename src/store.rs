//! Message delivery tracker.
//!
//! Persists chat messages and their `sent → delivered → read` lifecycle in
//! SQLite. Status updates are single guarded `UPDATE … WHERE status < ?`
//! statements, so concurrent writers always resolve to the lattice maximum —
//! a row can never move backward no matter how deliver/read races land.
//!
//! Unread counts are a read-time projection over message state, never an
//! independently stored truth.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::error::{RelayError, Result};
use crate::protocol::{DeliveryStatus, StoredMessage};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS messages (
    id            TEXT PRIMARY KEY,
    from_identity TEXT NOT NULL,
    to_identity   TEXT NOT NULL,
    body          TEXT,
    media_url     TEXT,
    status        INTEGER NOT NULL DEFAULT 0,
    created_at    INTEGER NOT NULL,
    CHECK (body IS NOT NULL OR media_url IS NOT NULL)
);
CREATE INDEX IF NOT EXISTS idx_messages_inbox
    ON messages (to_identity, from_identity, status);
";

/// SQLite-backed chat message store.
///
/// The connection sits behind a `std::sync::Mutex` with short, synchronous
/// critical sections; no lock is ever held across an await point.
#[derive(Clone)]
pub struct MessageStore {
    conn: Arc<Mutex<Connection>>,
}

impl MessageStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn)
    }

    /// Fully in-memory store, used when no data path is configured and in
    /// tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| RelayError::Persistence("message store lock poisoned".to_string()))
    }

    /// Validate and persist an outgoing message with status `sent`.
    ///
    /// Empty/whitespace text counts as absent; a message with neither text
    /// nor media fails with `InvalidMessage` and nothing is written.
    pub fn insert_sent(
        &self,
        from: &str,
        to: &str,
        text: Option<String>,
        media: Option<String>,
    ) -> Result<StoredMessage> {
        let text = text.filter(|t| !t.trim().is_empty());
        let media = media.filter(|m| !m.trim().is_empty());
        if text.is_none() && media.is_none() {
            return Err(RelayError::InvalidMessage(
                "a chat message needs text or media".to_string(),
            ));
        }

        let message = StoredMessage {
            id: Uuid::new_v4().to_string(),
            from: from.to_string(),
            to: to.to_string(),
            text,
            media,
            status: DeliveryStatus::Sent,
            created_at: Utc::now().timestamp_millis(),
        };

        self.lock()?.execute(
            "INSERT INTO messages (id, from_identity, to_identity, body, media_url, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                message.id,
                message.from,
                message.to,
                message.text,
                message.media,
                message.status.as_db(),
                message.created_at,
            ],
        )?;

        Ok(message)
    }

    /// Apply a status transition to a single message, enforcing the
    /// monotonic lattice: forward moves apply, repeats are no-ops, backward
    /// moves are rejected with `InvalidStateTransition`. Unknown ids are
    /// no-ops (acks may outlive their message).
    pub fn apply_status(&self, id: &str, to: DeliveryStatus) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let current: Option<i64> = tx
            .query_row(
                "SELECT status FROM messages WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(current) = current.map(DeliveryStatus::from_db) else {
            return Ok(false);
        };

        if !current.can_advance(to) {
            return Err(RelayError::InvalidStateTransition { from: current, to });
        }
        if current == to {
            return Ok(false);
        }

        // Guarded again so a concurrent writer racing past us still
        // resolves to the maximum
        let updated = tx.execute(
            "UPDATE messages SET status = ?1 WHERE id = ?2 AND status < ?1",
            params![to.as_db(), id],
        )?;
        tx.commit()?;
        Ok(updated > 0)
    }

    /// Transition one message `sent → delivered`.
    ///
    /// Returns true if the row moved. Idempotent: an already-delivered or
    /// already-read message is left untouched — a late delivery ack racing a
    /// read receipt is an expected interleaving, not an error.
    pub fn mark_delivered(&self, id: &str) -> Result<bool> {
        match self.apply_status(id, DeliveryStatus::Delivered) {
            Ok(moved) => Ok(moved),
            Err(RelayError::InvalidStateTransition { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Bulk-transition all of `sender`'s messages addressed to `reader` that
    /// are not yet read. Returns the ids that moved, oldest first; a repeat
    /// call returns an empty set.
    pub fn mark_read(&self, sender: &str, reader: &str) -> Result<Vec<String>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let ids: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM messages
                 WHERE from_identity = ?1 AND to_identity = ?2 AND status < ?3
                 ORDER BY created_at, rowid",
            )?;
            let rows = stmt.query_map(
                params![sender, reader, DeliveryStatus::Read.as_db()],
                |row| row.get(0),
            )?;
            rows.collect::<rusqlite::Result<Vec<String>>>()?
        };

        if !ids.is_empty() {
            tx.execute(
                "UPDATE messages SET status = ?1
                 WHERE from_identity = ?2 AND to_identity = ?3 AND status < ?1",
                params![DeliveryStatus::Read.as_db(), sender, reader],
            )?;
        }

        tx.commit()?;
        Ok(ids)
    }

    /// Messages addressed to `owner` from `counterpart` with status ≠ read.
    pub fn unread_count(&self, owner: &str, counterpart: &str) -> Result<i64> {
        let count = self.lock()?.query_row(
            "SELECT COUNT(*) FROM messages
             WHERE to_identity = ?1 AND from_identity = ?2 AND status < ?3",
            params![owner, counterpart, DeliveryStatus::Read.as_db()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Undelivered backlog for an identity, oldest first. Pushed to the
    /// client on (re)registration.
    pub fn undelivered_for(&self, identity: &str) -> Result<Vec<StoredMessage>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, from_identity, to_identity, body, media_url, status, created_at
             FROM messages
             WHERE to_identity = ?1 AND status = ?2
             ORDER BY created_at, rowid",
        )?;
        let rows = stmt.query_map(
            params![identity, DeliveryStatus::Sent.as_db()],
            Self::row_to_message,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Fetch a single message by id.
    pub fn get(&self, id: &str) -> Result<Option<StoredMessage>> {
        let message = self
            .lock()?
            .query_row(
                "SELECT id, from_identity, to_identity, body, media_url, status, created_at
                 FROM messages WHERE id = ?1",
                params![id],
                Self::row_to_message,
            )
            .optional()?;
        Ok(message)
    }

    /// Total number of persisted messages (stats endpoint).
    pub fn message_count(&self) -> Result<i64> {
        let count = self
            .lock()?
            .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        Ok(count)
    }

    fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
        Ok(StoredMessage {
            id: row.get(0)?,
            from: row.get(1)?,
            to: row.get(2)?,
            text: row.get(3)?,
            media: row.get(4)?,
            status: DeliveryStatus::from_db(row.get(5)?),
            created_at: row.get(6)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MessageStore {
        MessageStore::open_in_memory().unwrap()
    }

    #[test]
    fn test_insert_requires_text_or_media() {
        let store = store();

        let err = store.insert_sent("res-a", "res-b", None, None).unwrap_err();
        assert_eq!(err.code(), "InvalidMessage");

        // Whitespace-only text is absent text
        let err = store
            .insert_sent("res-a", "res-b", Some("   ".to_string()), None)
            .unwrap_err();
        assert_eq!(err.code(), "InvalidMessage");

        // Nothing was written
        assert_eq!(store.message_count().unwrap(), 0);
    }

    #[test]
    fn test_insert_media_only_is_valid() {
        let store = store();
        let msg = store
            .insert_sent(
                "res-a",
                "res-b",
                None,
                Some("https://cdn.example.com/x.jpg".to_string()),
            )
            .unwrap();
        assert!(msg.text.is_none());
        assert_eq!(msg.status, DeliveryStatus::Sent);
        assert_eq!(store.get(&msg.id).unwrap().unwrap(), msg);
    }

    #[test]
    fn test_mark_delivered_is_idempotent_and_monotonic() {
        let store = store();
        let msg = store
            .insert_sent("res-a", "res-b", Some("hi".to_string()), None)
            .unwrap();

        assert!(store.mark_delivered(&msg.id).unwrap());
        assert!(!store.mark_delivered(&msg.id).unwrap());
        assert_eq!(
            store.get(&msg.id).unwrap().unwrap().status,
            DeliveryStatus::Delivered
        );

        // Once read, a late deliver ack cannot move the status backward
        store.mark_read("res-a", "res-b").unwrap();
        assert!(!store.mark_delivered(&msg.id).unwrap());
        assert_eq!(
            store.get(&msg.id).unwrap().unwrap().status,
            DeliveryStatus::Read
        );
    }

    #[test]
    fn test_apply_status_rejects_backward_moves() {
        let store = store();
        let msg = store
            .insert_sent("res-a", "res-b", Some("hi".to_string()), None)
            .unwrap();
        store.mark_read("res-a", "res-b").unwrap();

        let err = store
            .apply_status(&msg.id, DeliveryStatus::Delivered)
            .unwrap_err();
        assert_eq!(err.code(), "InvalidStateTransition");

        // Repeats of the current status are quiet no-ops
        assert!(!store.apply_status(&msg.id, DeliveryStatus::Read).unwrap());
        // Unknown ids too
        assert!(!store
            .apply_status("no-such-id", DeliveryStatus::Read)
            .unwrap());
    }

    #[test]
    fn test_mark_delivered_unknown_id_is_noop() {
        let store = store();
        assert!(!store.mark_delivered("no-such-id").unwrap());
    }

    #[test]
    fn test_mark_read_bulk_and_idempotent() {
        let store = store();
        let m1 = store
            .insert_sent("res-a", "res-b", Some("one".to_string()), None)
            .unwrap();
        let m2 = store
            .insert_sent("res-a", "res-b", Some("two".to_string()), None)
            .unwrap();
        store.mark_delivered(&m2.id).unwrap();

        // Both sent and delivered messages transition to read
        let ids = store.mark_read("res-a", "res-b").unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&m1.id));
        assert!(ids.contains(&m2.id));

        // Second call finds nothing to move
        assert!(store.mark_read("res-a", "res-b").unwrap().is_empty());
        assert_eq!(
            store.get(&m1.id).unwrap().unwrap().status,
            DeliveryStatus::Read
        );
    }

    #[test]
    fn test_mark_read_only_touches_the_named_pair() {
        let store = store();
        store
            .insert_sent("res-a", "res-b", Some("for b".to_string()), None)
            .unwrap();
        let other = store
            .insert_sent("res-c", "res-b", Some("from c".to_string()), None)
            .unwrap();

        store.mark_read("res-a", "res-b").unwrap();
        assert_eq!(
            store.get(&other.id).unwrap().unwrap().status,
            DeliveryStatus::Sent
        );
        assert_eq!(store.unread_count("res-b", "res-c").unwrap(), 1);
    }

    #[test]
    fn test_unread_count_projection() {
        let store = store();
        for i in 0..3 {
            store
                .insert_sent("res-a", "res-b", Some(format!("msg-{}", i)), None)
                .unwrap();
        }
        assert_eq!(store.unread_count("res-b", "res-a").unwrap(), 3);

        store.mark_read("res-a", "res-b").unwrap();
        assert_eq!(store.unread_count("res-b", "res-a").unwrap(), 0);

        store
            .insert_sent("res-a", "res-b", Some("one more".to_string()), None)
            .unwrap();
        assert_eq!(store.unread_count("res-b", "res-a").unwrap(), 1);
    }

    #[test]
    fn test_undelivered_backlog_oldest_first() {
        let store = store();
        let m1 = store
            .insert_sent("res-a", "res-b", Some("first".to_string()), None)
            .unwrap();
        let m2 = store
            .insert_sent("res-c", "res-b", Some("second".to_string()), None)
            .unwrap();
        let delivered = store
            .insert_sent("res-a", "res-b", Some("third".to_string()), None)
            .unwrap();
        store.mark_delivered(&delivered.id).unwrap();

        let backlog = store.undelivered_for("res-b").unwrap();
        assert_eq!(backlog.len(), 2);
        assert_eq!(backlog[0].id, m1.id);
        assert_eq!(backlog[1].id, m2.id);
    }
}
