use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::db::{call_blocking, ConversationEntry, Database, KeyRing, VipRecord};

/// Conversation logs keep at most this many entries per user.
pub const HISTORY_CAP: usize = 100;

/// Capability handle over the document store. The pipeline never sees
/// persistence errors: when the store is unavailable (or an operation fails)
/// every read returns an empty result and every write is a no-op, so the
/// assistant keeps running without memory or VIP features.
#[derive(Clone)]
pub enum Store {
    Connected(Arc<Database>),
    Unavailable,
}

impl Store {
    pub fn open(data_dir: &str) -> Store {
        match Database::new(data_dir) {
            Ok(db) => Store::Connected(Arc::new(db)),
            Err(e) => {
                warn!("Database unavailable, running memory-only: {e}");
                Store::Unavailable
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Store::Connected(_))
    }

    fn db(&self) -> Option<Arc<Database>> {
        match self {
            Store::Connected(db) => Some(db.clone()),
            Store::Unavailable => None,
        }
    }

    // --- messages -----------------------------------------------------

    pub async fn append_message(&self, user_id: i64, entry: ConversationEntry) {
        let Some(db) = self.db() else { return };
        if let Err(e) =
            call_blocking(db, move |db| db.append_message(user_id, &entry, HISTORY_CAP)).await
        {
            warn!("Failed to append conversation entry for {user_id}: {e}");
        }
    }

    pub async fn recent_messages(&self, user_id: i64, limit: usize) -> Vec<ConversationEntry> {
        let Some(db) = self.db() else {
            return Vec::new();
        };
        call_blocking(db, move |db| db.recent_messages(user_id, limit))
            .await
            .unwrap_or_else(|e| {
                warn!("Failed to read conversation for {user_id}: {e}");
                Vec::new()
            })
    }

    pub async fn message_count(&self, user_id: i64) -> usize {
        let Some(db) = self.db() else { return 0 };
        call_blocking(db, move |db| db.message_count(user_id))
            .await
            .unwrap_or(0)
    }

    pub async fn conversation_count(&self) -> usize {
        let Some(db) = self.db() else { return 0 };
        call_blocking(db, |db| db.conversation_count())
            .await
            .unwrap_or(0)
    }

    pub async fn delete_conversation(&self, user_id: i64) -> bool {
        let Some(db) = self.db() else { return false };
        call_blocking(db, move |db| db.delete_conversation(user_id))
            .await
            .unwrap_or(false)
    }

    pub async fn delete_all_conversations(&self) -> usize {
        let Some(db) = self.db() else { return 0 };
        call_blocking(db, |db| db.delete_all_conversations())
            .await
            .unwrap_or(0)
    }

    pub async fn activity_since(&self, cutoff: String) -> Vec<(i64, i64)> {
        let Some(db) = self.db() else {
            return Vec::new();
        };
        call_blocking(db, move |db| db.activity_since(&cutoff))
            .await
            .unwrap_or_default()
    }

    // --- vips ---------------------------------------------------------

    pub async fn vip(&self, user_id: i64) -> Option<VipRecord> {
        let db = self.db()?;
        call_blocking(db, move |db| db.get_vip(user_id))
            .await
            .unwrap_or(None)
    }

    pub async fn upsert_vip(&self, user_id: i64, name: String) -> bool {
        let Some(db) = self.db() else { return false };
        match call_blocking(db, move |db| db.upsert_vip(user_id, &name)).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to upsert VIP {user_id}: {e}");
                false
            }
        }
    }

    pub async fn delete_vip(&self, user_id: i64) -> bool {
        let Some(db) = self.db() else { return false };
        call_blocking(db, move |db| db.delete_vip(user_id))
            .await
            .unwrap_or(false)
    }

    pub async fn all_vips(&self) -> Vec<VipRecord> {
        let Some(db) = self.db() else {
            return Vec::new();
        };
        call_blocking(db, |db| db.all_vips())
            .await
            .unwrap_or_default()
    }

    pub async fn vip_count(&self) -> usize {
        let Some(db) = self.db() else { return 0 };
        call_blocking(db, |db| db.vip_count()).await.unwrap_or(0)
    }

    // --- config -------------------------------------------------------

    pub async fn get_config<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let db = self.db()?;
        let key_owned = key.to_string();
        let json = call_blocking(db, move |db| db.get_config_json(&key_owned))
            .await
            .unwrap_or(None)?;
        match serde_json::from_str(&json) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Malformed config value for {key}: {e}");
                None
            }
        }
    }

    pub async fn set_config<T: Serialize>(&self, key: &str, value: &T) -> bool {
        let Some(db) = self.db() else { return false };
        let json = match serde_json::to_string(value) {
            Ok(v) => v,
            Err(e) => {
                warn!("Failed to serialize config value for {key}: {e}");
                return false;
            }
        };
        let key_owned = key.to_string();
        match call_blocking(db, move |db| db.set_config_json(&key_owned, &json)).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to write config {key}: {e}");
                false
            }
        }
    }

    pub async fn delete_config(&self, key: &str) -> bool {
        let Some(db) = self.db() else { return false };
        let key_owned = key.to_string();
        call_blocking(db, move |db| db.delete_config(&key_owned))
            .await
            .is_ok()
    }

    // --- gemini keys --------------------------------------------------

    pub async fn key_ring(&self) -> Option<KeyRing> {
        let db = self.db()?;
        call_blocking(db, |db| db.key_ring()).await.unwrap_or(None)
    }

    pub async fn save_key_ring(&self, ring: KeyRing) -> bool {
        let Some(db) = self.db() else { return false };
        match call_blocking(db, move |db| db.save_key_ring(&ring)).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to persist key ring: {e}");
                false
            }
        }
    }

    pub async fn clear_keys(&self) -> bool {
        let Some(db) = self.db() else { return false };
        call_blocking(db, |db| db.clear_keys()).await.is_ok()
    }

    // --- stickers -----------------------------------------------------

    pub async fn all_stickers(&self) -> Vec<String> {
        let Some(db) = self.db() else {
            return Vec::new();
        };
        call_blocking(db, |db| db.all_stickers())
            .await
            .unwrap_or_default()
    }

    pub async fn add_sticker(&self, file_id: String) -> bool {
        let Some(db) = self.db() else { return false };
        call_blocking(db, move |db| db.add_sticker(&file_id))
            .await
            .is_ok()
    }

    pub async fn remove_sticker(&self, file_id: String) -> bool {
        let Some(db) = self.db() else { return false };
        call_blocking(db, move |db| db.remove_sticker(&file_id))
            .await
            .unwrap_or(false)
    }

    pub async fn clear_stickers(&self) -> usize {
        let Some(db) = self.db() else { return 0 };
        call_blocking(db, |db| db.clear_stickers())
            .await
            .unwrap_or(0)
    }
}
