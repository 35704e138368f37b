use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use standin_core::error::StandinError;

/// Bridge for running synchronous database work off the async event loop.
pub async fn call_blocking<T, F>(db: std::sync::Arc<Database>, f: F) -> Result<T, StandinError>
where
    T: Send + 'static,
    F: FnOnce(&Database) -> Result<T, StandinError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(db.as_ref()))
        .await
        .map_err(|e| StandinError::Task(format!("DB task join: {e}")))?
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Bot,
}

impl Sender {
    pub fn as_str(self) -> &'static str {
        match self {
            Sender::User => "user",
            Sender::Bot => "bot",
        }
    }

    fn from_str(s: &str) -> Sender {
        if s == "bot" {
            Sender::Bot
        } else {
            Sender::User
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationEntry {
    pub text: String,
    pub sender: Sender,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VipRecord {
    pub user_id: i64,
    pub name: String,
}

/// The persisted credential set plus its rotation cursor, stored as a
/// singleton row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyRing {
    pub keys: Vec<String>,
    pub current_index: usize,
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn new(data_dir: &str) -> Result<Self, StandinError> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = Path::new(data_dir).join("standin.db");
        let conn = Connection::open(db_path)?;
        Self::init(conn)
    }

    /// Ephemeral database, used by tests.
    pub fn open_in_memory() -> Result<Self, StandinError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StandinError> {
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                content TEXT NOT NULL,
                sender TEXT NOT NULL DEFAULT 'user',
                timestamp TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_user_id
                ON messages(user_id, id);

            CREATE TABLE IF NOT EXISTS vips (
                user_id INTEGER PRIMARY KEY,
                name TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS config (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS gemini_keys (
                slot INTEGER PRIMARY KEY CHECK (slot = 0),
                keys_json TEXT NOT NULL,
                current_index INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS stickers (
                file_id TEXT PRIMARY KEY
            );",
        )?;

        Ok(Database {
            conn: Mutex::new(conn),
        })
    }

    // --- messages -----------------------------------------------------

    /// Append one entry to a user's conversation log, then trim the log to
    /// the most recent `cap` entries (push-with-trim ring semantics).
    pub fn append_message(
        &self,
        user_id: i64,
        entry: &ConversationEntry,
        cap: usize,
    ) -> Result<(), StandinError> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO messages (user_id, content, sender, timestamp)
             VALUES (?1, ?2, ?3, ?4)",
            params![user_id, entry.text, entry.sender.as_str(), entry.timestamp],
        )?;
        conn.execute(
            "DELETE FROM messages
             WHERE user_id = ?1
               AND id NOT IN (
                   SELECT id FROM messages WHERE user_id = ?1
                   ORDER BY id DESC LIMIT ?2
               )",
            params![user_id, cap as i64],
        )?;
        Ok(())
    }

    /// Most recent entries for a user, oldest first.
    pub fn recent_messages(
        &self,
        user_id: i64,
        limit: usize,
    ) -> Result<Vec<ConversationEntry>, StandinError> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT content, sender, timestamp
             FROM messages
             WHERE user_id = ?1
             ORDER BY id DESC
             LIMIT ?2",
        )?;
        let mut entries = stmt
            .query_map(params![user_id, limit as i64], |row| {
                Ok(ConversationEntry {
                    text: row.get(0)?,
                    sender: Sender::from_str(&row.get::<_, String>(1)?),
                    timestamp: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        entries.reverse();
        Ok(entries)
    }

    pub fn message_count(&self, user_id: i64) -> Result<usize, StandinError> {
        let conn = self.lock_conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn conversation_count(&self) -> Result<usize, StandinError> {
        let conn = self.lock_conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT user_id) FROM messages",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn delete_conversation(&self, user_id: i64) -> Result<bool, StandinError> {
        let conn = self.lock_conn();
        let deleted = conn.execute("DELETE FROM messages WHERE user_id = ?1", params![user_id])?;
        Ok(deleted > 0)
    }

    pub fn delete_all_conversations(&self) -> Result<usize, StandinError> {
        let conn = self.lock_conn();
        let users: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT user_id) FROM messages",
            [],
            |row| row.get(0),
        )?;
        conn.execute("DELETE FROM messages", [])?;
        Ok(users as usize)
    }

    /// Per-user count of inbound messages newer than `cutoff` (RFC 3339),
    /// busiest users first. Feeds the deactivation summary.
    pub fn activity_since(&self, cutoff: &str) -> Result<Vec<(i64, i64)>, StandinError> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT user_id, COUNT(*) AS n
             FROM messages
             WHERE sender = 'user' AND timestamp > ?1
             GROUP BY user_id
             ORDER BY n DESC",
        )?;
        let rows = stmt
            .query_map(params![cutoff], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // --- vips ---------------------------------------------------------

    pub fn get_vip(&self, user_id: i64) -> Result<Option<VipRecord>, StandinError> {
        let conn = self.lock_conn();
        let vip = conn
            .query_row(
                "SELECT user_id, name FROM vips WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok(VipRecord {
                        user_id: row.get(0)?,
                        name: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(vip)
    }

    pub fn upsert_vip(&self, user_id: i64, name: &str) -> Result<(), StandinError> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO vips (user_id, name) VALUES (?1, ?2)
             ON CONFLICT(user_id) DO UPDATE SET name = excluded.name",
            params![user_id, name],
        )?;
        Ok(())
    }

    pub fn delete_vip(&self, user_id: i64) -> Result<bool, StandinError> {
        let conn = self.lock_conn();
        let deleted = conn.execute("DELETE FROM vips WHERE user_id = ?1", params![user_id])?;
        Ok(deleted > 0)
    }

    pub fn all_vips(&self) -> Result<Vec<VipRecord>, StandinError> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare("SELECT user_id, name FROM vips ORDER BY user_id")?;
        let vips = stmt
            .query_map([], |row| {
                Ok(VipRecord {
                    user_id: row.get(0)?,
                    name: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(vips)
    }

    pub fn vip_count(&self) -> Result<usize, StandinError> {
        let conn = self.lock_conn();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM vips", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    // --- config -------------------------------------------------------

    pub fn get_config_json(&self, key: &str) -> Result<Option<String>, StandinError> {
        let conn = self.lock_conn();
        let value = conn
            .query_row(
                "SELECT value FROM config WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_config_json(&self, key: &str, value: &str) -> Result<(), StandinError> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn delete_config(&self, key: &str) -> Result<(), StandinError> {
        let conn = self.lock_conn();
        conn.execute("DELETE FROM config WHERE key = ?1", params![key])?;
        Ok(())
    }

    // --- gemini keys --------------------------------------------------

    pub fn key_ring(&self) -> Result<Option<KeyRing>, StandinError> {
        let conn = self.lock_conn();
        let row: Option<(String, i64)> = conn
            .query_row(
                "SELECT keys_json, current_index FROM gemini_keys WHERE slot = 0",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            Some((json, index)) => {
                let keys: Vec<String> = serde_json::from_str(&json)?;
                Ok(Some(KeyRing {
                    keys,
                    current_index: index.max(0) as usize,
                }))
            }
            None => Ok(None),
        }
    }

    pub fn save_key_ring(&self, ring: &KeyRing) -> Result<(), StandinError> {
        let json = serde_json::to_string(&ring.keys)?;
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO gemini_keys (slot, keys_json, current_index) VALUES (0, ?1, ?2)
             ON CONFLICT(slot) DO UPDATE
                 SET keys_json = excluded.keys_json,
                     current_index = excluded.current_index",
            params![json, ring.current_index as i64],
        )?;
        Ok(())
    }

    pub fn clear_keys(&self) -> Result<(), StandinError> {
        let conn = self.lock_conn();
        conn.execute("DELETE FROM gemini_keys WHERE slot = 0", [])?;
        Ok(())
    }

    // --- stickers -----------------------------------------------------

    pub fn all_stickers(&self) -> Result<Vec<String>, StandinError> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare("SELECT file_id FROM stickers ORDER BY rowid")?;
        let stickers = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(stickers)
    }

    pub fn add_sticker(&self, file_id: &str) -> Result<(), StandinError> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT OR IGNORE INTO stickers (file_id) VALUES (?1)",
            params![file_id],
        )?;
        Ok(())
    }

    pub fn remove_sticker(&self, file_id: &str) -> Result<bool, StandinError> {
        let conn = self.lock_conn();
        let deleted = conn.execute("DELETE FROM stickers WHERE file_id = ?1", params![file_id])?;
        Ok(deleted > 0)
    }

    pub fn clear_stickers(&self) -> Result<usize, StandinError> {
        let conn = self.lock_conn();
        let deleted = conn.execute("DELETE FROM stickers", [])?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn entry(text: &str, sender: Sender, ts: &str) -> ConversationEntry {
        ConversationEntry {
            text: text.into(),
            sender,
            timestamp: ts.into(),
        }
    }

    #[test]
    fn test_append_and_read_back_ordered() {
        let db = test_db();
        db.append_message(1, &entry("hi", Sender::User, "2026-01-01T00:00:01Z"), 100)
            .unwrap();
        db.append_message(1, &entry("yo", Sender::Bot, "2026-01-01T00:00:02Z"), 100)
            .unwrap();

        let msgs = db.recent_messages(1, 10).unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].text, "hi");
        assert_eq!(msgs[0].sender, Sender::User);
        assert_eq!(msgs[1].text, "yo");
        assert_eq!(msgs[1].sender, Sender::Bot);
    }

    #[test]
    fn test_push_with_trim_keeps_last_cap_entries() {
        let db = test_db();
        for i in 0..150 {
            db.append_message(
                7,
                &entry(&format!("m{i}"), Sender::User, "2026-01-01T00:00:00Z"),
                100,
            )
            .unwrap();
        }
        let msgs = db.recent_messages(7, 200).unwrap();
        assert_eq!(msgs.len(), 100);
        assert_eq!(msgs.first().unwrap().text, "m50");
        assert_eq!(msgs.last().unwrap().text, "m149");
        assert_eq!(db.message_count(7).unwrap(), 100);
    }

    #[test]
    fn test_trim_is_per_user() {
        let db = test_db();
        for i in 0..5 {
            db.append_message(1, &entry(&format!("a{i}"), Sender::User, "t"), 3)
                .unwrap();
            db.append_message(2, &entry(&format!("b{i}"), Sender::User, "t"), 3)
                .unwrap();
        }
        assert_eq!(db.message_count(1).unwrap(), 3);
        assert_eq!(db.message_count(2).unwrap(), 3);
    }

    #[test]
    fn test_delete_conversation() {
        let db = test_db();
        db.append_message(1, &entry("hi", Sender::User, "t"), 100)
            .unwrap();
        assert!(db.delete_conversation(1).unwrap());
        assert!(!db.delete_conversation(1).unwrap());
        assert_eq!(db.message_count(1).unwrap(), 0);
    }

    #[test]
    fn test_delete_all_conversations_reports_user_count() {
        let db = test_db();
        db.append_message(1, &entry("a", Sender::User, "t"), 100)
            .unwrap();
        db.append_message(2, &entry("b", Sender::User, "t"), 100)
            .unwrap();
        db.append_message(2, &entry("c", Sender::User, "t"), 100)
            .unwrap();
        assert_eq!(db.delete_all_conversations().unwrap(), 2);
        assert_eq!(db.conversation_count().unwrap(), 0);
    }

    #[test]
    fn test_activity_since_counts_only_user_messages() {
        let db = test_db();
        db.append_message(1, &entry("old", Sender::User, "2026-01-01T00:00:00Z"), 100)
            .unwrap();
        db.append_message(1, &entry("new", Sender::User, "2026-01-02T12:00:00Z"), 100)
            .unwrap();
        db.append_message(1, &entry("reply", Sender::Bot, "2026-01-02T12:00:01Z"), 100)
            .unwrap();
        db.append_message(2, &entry("x", Sender::User, "2026-01-02T13:00:00Z"), 100)
            .unwrap();
        db.append_message(2, &entry("y", Sender::User, "2026-01-02T13:01:00Z"), 100)
            .unwrap();

        let rows = db.activity_since("2026-01-02T00:00:00Z").unwrap();
        assert_eq!(rows, vec![(2, 2), (1, 1)]);
    }

    #[test]
    fn test_vip_upsert_is_idempotent_rename() {
        let db = test_db();
        db.upsert_vip(42, "First").unwrap();
        db.upsert_vip(42, "Second").unwrap();

        let vips = db.all_vips().unwrap();
        assert_eq!(vips.len(), 1);
        assert_eq!(vips[0].name, "Second");
        assert_eq!(db.get_vip(42).unwrap().unwrap().name, "Second");
    }

    #[test]
    fn test_vip_delete() {
        let db = test_db();
        db.upsert_vip(42, "Name").unwrap();
        assert!(db.delete_vip(42).unwrap());
        assert!(!db.delete_vip(42).unwrap());
        assert!(db.get_vip(42).unwrap().is_none());
    }

    #[test]
    fn test_config_roundtrip() {
        let db = test_db();
        assert!(db.get_config_json("bot_active").unwrap().is_none());
        db.set_config_json("bot_active", "true").unwrap();
        assert_eq!(db.get_config_json("bot_active").unwrap().unwrap(), "true");
        db.set_config_json("bot_active", "false").unwrap();
        assert_eq!(db.get_config_json("bot_active").unwrap().unwrap(), "false");
        db.delete_config("bot_active").unwrap();
        assert!(db.get_config_json("bot_active").unwrap().is_none());
    }

    #[test]
    fn test_key_ring_roundtrip() {
        let db = test_db();
        assert!(db.key_ring().unwrap().is_none());
        db.save_key_ring(&KeyRing {
            keys: vec!["a".into(), "b".into()],
            current_index: 1,
        })
        .unwrap();
        let ring = db.key_ring().unwrap().unwrap();
        assert_eq!(ring.keys, vec!["a", "b"]);
        assert_eq!(ring.current_index, 1);
        db.clear_keys().unwrap();
        assert!(db.key_ring().unwrap().is_none());
    }

    #[test]
    fn test_stickers_set_semantics() {
        let db = test_db();
        db.add_sticker("s1").unwrap();
        db.add_sticker("s1").unwrap();
        db.add_sticker("s2").unwrap();
        assert_eq!(db.all_stickers().unwrap(), vec!["s1", "s2"]);
        assert!(db.remove_sticker("s1").unwrap());
        assert!(!db.remove_sticker("s1").unwrap());
        assert_eq!(db.clear_stickers().unwrap(), 1);
        assert!(db.all_stickers().unwrap().is_empty());
    }
}
