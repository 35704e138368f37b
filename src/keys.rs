use std::sync::Mutex;

use tracing::info;

use crate::db::KeyRing;
use crate::store::Store;

/// Environment bootstrap slots checked when the persisted set is empty.
const ENV_KEY_SLOTS: u32 = 14;
const ENV_KEY_PREFIX: &str = "GEMINI_KEY_";

/// Ordered Gemini credential set with a round-robin cursor. The persisted
/// ring is authoritative; the environment slots are read once as bootstrap
/// and written back so later reads take the persisted path.
pub struct KeyRotation {
    store: Store,
    cursor: Mutex<usize>,
}

fn env_bootstrap_keys() -> Vec<String> {
    (1..=ENV_KEY_SLOTS)
        .filter_map(|i| std::env::var(format!("{ENV_KEY_PREFIX}{i}")).ok())
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .collect()
}

impl KeyRotation {
    pub fn new(store: Store) -> Self {
        KeyRotation {
            store,
            cursor: Mutex::new(0),
        }
    }

    /// The full ordered credential list. Falls back to the environment
    /// slots when nothing is persisted, persisting what it finds.
    pub async fn all_keys(&self) -> Vec<String> {
        if let Some(ring) = self.store.key_ring().await {
            if !ring.keys.is_empty() {
                return ring.keys;
            }
        }

        let keys = env_bootstrap_keys();
        if !keys.is_empty() {
            info!("Bootstrapped {} Gemini keys from environment", keys.len());
            self.store
                .save_key_ring(KeyRing {
                    keys: keys.clone(),
                    current_index: 0,
                })
                .await;
        }
        keys
    }

    /// Current cursor's credential; advances the cursor modulo the live key
    /// count. `None` when no credentials are configured.
    pub async fn next_key(&self) -> Option<String> {
        let keys = self.all_keys().await;
        if keys.is_empty() {
            return None;
        }
        let mut cursor = self.lock_cursor();
        // Recompute against the current count: keys may have been removed
        // since the cursor was last advanced.
        let idx = *cursor % keys.len();
        *cursor = (idx + 1) % keys.len();
        Some(keys[idx].clone())
    }

    /// Idempotent set-insert. Returns false when the key already exists or
    /// the store rejected the write.
    pub async fn add(&self, key: &str) -> bool {
        let mut keys = self.all_keys().await;
        if keys.iter().any(|k| k == key) {
            return false;
        }
        keys.push(key.to_string());
        let cursor = *self.lock_cursor();
        self.store
            .save_key_ring(KeyRing {
                keys,
                current_index: cursor,
            })
            .await
    }

    /// Remove by position. Resets the cursor to 0 so it can never point
    /// past the shortened list.
    pub async fn remove(&self, index: usize) -> bool {
        let mut keys = self.all_keys().await;
        if index >= keys.len() {
            return false;
        }
        keys.remove(index);
        *self.lock_cursor() = 0;
        self.store
            .save_key_ring(KeyRing {
                keys,
                current_index: 0,
            })
            .await
    }

    pub async fn clear(&self) -> bool {
        *self.lock_cursor() = 0;
        self.store.clear_keys().await
    }

    /// Cursor position for display, normalized to the given key count.
    pub fn cursor_for(&self, key_count: usize) -> usize {
        if key_count == 0 {
            return 0;
        }
        *self.lock_cursor() % key_count
    }

    fn lock_cursor(&self) -> std::sync::MutexGuard<'_, usize> {
        match self.cursor.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
