use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tracing::debug;

use crate::channel::{InboundMessage, Outbound, SendError};
use crate::config::Config;
use crate::db::{ConversationEntry, Sender};
use crate::generator::ResponseGenerator;
use crate::guard::InFlightSlot;
use crate::state::RuntimeState;
use crate::store::Store;
use crate::text::{truncate_chars, truncate_with_ellipsis, count_words};

const ENTRY_CHAR_CAP: usize = 1000;
const MAX_WORDS_TO_REPLY: usize = 200;
const MEDIA_PLACEHOLDER: &str = "[media]";
const SEND_RETRY_CEILING_SECS: u64 = 60;
// Telegram caps messages at 4096 characters; keep headroom for prefixes.
const LOG_MESSAGE_CHAR_CAP: usize = 3996;
const DEFAULT_STICKER_CHANCE: u32 = 10;
const COMPOSING_SHORT_SECS: f64 = 2.0;
const COMPOSING_DEFAULT_SECS: f64 = 3.0;
const STICKER_PAUSE_MS: u64 = 500;

const VOICE_DEFLECTION: &str = "Boss will listen to that when they're back";
const MEDIA_DEFLECTION: &str = "Can't look at media right now";
const SPAM_DEFLECTION: &str = "Say it once, don't spam";
const TOO_LONG_DEFLECTION: &str = "That's a lot, give me the short version";
const FIRST_CONTACT_REPLY: &str =
    "Heads up: this is an automated stand-in, the boss replies properly later.\n\nAnyway, what do you need?";
const GROUP_DISCLOSURE_SUFFIX: &str = "\n\n[automated reply]";
const GROUP_EMPTY_QUERY: &str = "mentioned me";

/// The per-message reply state machine. Every inbound message runs through
/// `handle_private` or `handle_group`; each gate is a potential early exit.
pub struct Pipeline {
    store: Store,
    state: Arc<RuntimeState>,
    generator: Arc<ResponseGenerator>,
    outbound: Arc<dyn Outbound>,
    default_delay: (u64, u64),
}

impl Pipeline {
    pub fn new(
        config: &Config,
        store: Store,
        state: Arc<RuntimeState>,
        generator: Arc<ResponseGenerator>,
        outbound: Arc<dyn Outbound>,
    ) -> Self {
        Pipeline {
            store,
            state,
            generator,
            outbound,
            default_delay: (config.delay_min, config.delay_max),
        }
    }

    pub async fn handle_private(&self, msg: InboundMessage) {
        if !self.bot_active().await {
            return;
        }
        let Some(user_id) = msg.user_id else {
            return;
        };
        // Dropped, not queued: a second message while one is in flight is
        // silently discarded.
        let Some(_slot) = InFlightSlot::acquire(&self.state.guard, user_id) else {
            debug!("User {user_id} already in flight, dropping");
            return;
        };

        if msg.is_sticker {
            self.state
                .log_action(&format!("Ignored sticker from {}", msg.sender_name));
            return;
        }

        if !self.state.guard.cooldown_ok(user_id) {
            return;
        }

        let Some(text) = msg.text.as_deref() else {
            self.handle_media(user_id, &msg).await;
            return;
        };
        let text = text.trim();
        if text.is_empty() {
            return;
        }

        // First contact is decided before this message is persisted.
        let is_first = self.store.message_count(user_id).await == 0;
        self.persist(user_id, text, Sender::User).await;

        if self.state.guard.record_and_check(user_id, text) {
            self.compose_for(msg.chat_id, COMPOSING_SHORT_SECS).await;
            self.deliver(msg.chat_id, SPAM_DEFLECTION).await;
            self.persist(user_id, SPAM_DEFLECTION, Sender::Bot).await;
            self.state.guard.mark_replied(user_id);
            self.state.log_action(&format!("Spam: {}", msg.sender_name));
            return;
        }

        if count_words(text) > MAX_WORDS_TO_REPLY {
            self.compose_for(msg.chat_id, COMPOSING_SHORT_SECS).await;
            self.deliver(msg.chat_id, TOO_LONG_DEFLECTION).await;
            self.persist(user_id, TOO_LONG_DEFLECTION, Sender::Bot).await;
            self.state.guard.mark_replied(user_id);
            return;
        }

        if is_first && self.first_msg_enabled().await {
            self.compose_for(msg.chat_id, COMPOSING_DEFAULT_SECS).await;
            self.deliver(msg.chat_id, FIRST_CONTACT_REPLY).await;
            self.persist(user_id, FIRST_CONTACT_REPLY, Sender::Bot).await;
            self.state.guard.mark_replied(user_id);
            self.state.count_reply();
            self.send_log(&format!(
                "First contact: {}\n> {}",
                msg.sender_name,
                truncate_with_ellipsis(text, 50)
            ))
            .await;
            return;
        }

        let vip = self.store.vip(user_id).await;
        let reply = self.generator.generate(user_id, text, vip.as_ref()).await;

        let (min_d, max_d) = self.delay_range().await;
        let delay = pacing_delay(count_words(&reply), min_d, max_d);
        self.compose_for(msg.chat_id, delay).await;

        if !self.deliver(msg.chat_id, &reply).await {
            return;
        }
        self.persist(user_id, &reply, Sender::Bot).await;
        self.maybe_send_sticker(msg.chat_id).await;
        self.state.guard.mark_replied(user_id);
        self.state.count_reply();
        self.state
            .log_action(&format!("Replied to {}", msg.sender_name));
        self.send_log(&format!(
            "{}\nin:  {}\nout: {}",
            msg.sender_name,
            truncate_with_ellipsis(text, 50),
            truncate_with_ellipsis(&reply, 50)
        ))
        .await;
    }

    /// Group messages skip the spam, length, cooldown and first-contact
    /// gates; the caller has already verified the mention and stripped it.
    pub async fn handle_group(&self, msg: InboundMessage) {
        if !self.bot_active().await {
            return;
        }
        let Some(user_id) = msg.user_id else {
            return;
        };
        let Some(_slot) = InFlightSlot::acquire(&self.state.guard, user_id) else {
            return;
        };

        let query = msg
            .text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(GROUP_EMPTY_QUERY);

        self.persist(user_id, &format!("[GROUP] {query}"), Sender::User)
            .await;

        let vip = self.store.vip(user_id).await;
        let reply = self.generator.generate(user_id, query, vip.as_ref()).await;

        self.compose_for(msg.chat_id, COMPOSING_DEFAULT_SECS).await;
        let outgoing = format!("{reply}{GROUP_DISCLOSURE_SUFFIX}");
        if !self.deliver(msg.chat_id, &outgoing).await {
            return;
        }
        self.persist(user_id, &reply, Sender::Bot).await;
        self.state.count_reply();
        self.state
            .log_action(&format!("Group reply for {}", msg.sender_name));
    }

    async fn handle_media(&self, user_id: i64, msg: &InboundMessage) {
        self.persist(user_id, MEDIA_PLACEHOLDER, Sender::User).await;
        self.compose_for(msg.chat_id, COMPOSING_DEFAULT_SECS).await;

        let reply = if msg.is_voice_like {
            VOICE_DEFLECTION
        } else {
            MEDIA_DEFLECTION
        };
        self.deliver(msg.chat_id, reply).await;
        self.persist(user_id, reply, Sender::Bot).await;
        self.state.guard.mark_replied(user_id);
        self.state.count_reply();
        self.send_log(&format!("Media from {}: {}", msg.sender_name, reply))
            .await;
    }

    /// One rate-limit retry when the requested backoff is under the ceiling;
    /// anything else is logged and abandoned.
    async fn deliver(&self, chat_id: i64, text: &str) -> bool {
        match self.outbound.send_text(chat_id, text).await {
            Ok(()) => true,
            Err(SendError::RetryAfter(secs)) if secs < SEND_RETRY_CEILING_SECS => {
                tokio::time::sleep(Duration::from_secs(secs)).await;
                match self.outbound.send_text(chat_id, text).await {
                    Ok(()) => true,
                    Err(err) => {
                        self.state
                            .log_error(&format!("Send failed after backoff: {err}"));
                        false
                    }
                }
            }
            Err(err) => {
                self.state.log_error(&format!("Send failed: {err}"));
                false
            }
        }
    }

    async fn compose_for(&self, chat_id: i64, secs: f64) {
        self.outbound.show_composing(chat_id).await;
        tokio::time::sleep(Duration::from_secs_f64(secs)).await;
    }

    async fn maybe_send_sticker(&self, chat_id: i64) {
        let chance = self
            .store
            .get_config::<u32>("sticker_chance")
            .await
            .unwrap_or(DEFAULT_STICKER_CHANCE);
        if rand::thread_rng().gen_range(0..100) >= chance {
            return;
        }
        let stickers = self.store.all_stickers().await;
        if stickers.is_empty() {
            return;
        }
        let pick = rand::thread_rng().gen_range(0..stickers.len());
        tokio::time::sleep(Duration::from_millis(STICKER_PAUSE_MS)).await;
        if let Err(err) = self.outbound.send_sticker(chat_id, &stickers[pick]).await {
            debug!("Sticker send failed: {err}");
        }
    }

    async fn persist(&self, user_id: i64, text: &str, sender: Sender) {
        let entry = ConversationEntry {
            text: truncate_chars(text, ENTRY_CHAR_CAP).to_string(),
            sender,
            timestamp: Utc::now().to_rfc3339(),
        };
        self.store.append_message(user_id, entry).await;
    }

    async fn send_log(&self, text: &str) {
        let Some(log_chat) = self.store.get_config::<i64>("log_chat_id").await else {
            return;
        };
        self.deliver(log_chat, truncate_chars(text, LOG_MESSAGE_CHAR_CAP))
            .await;
    }

    async fn bot_active(&self) -> bool {
        self.store
            .get_config::<bool>("bot_active")
            .await
            .unwrap_or(true)
    }

    async fn first_msg_enabled(&self) -> bool {
        self.store
            .get_config::<bool>("first_msg_enabled")
            .await
            .unwrap_or(true)
    }

    async fn delay_range(&self) -> (u64, u64) {
        let min = self
            .store
            .get_config::<u64>("delay_min")
            .await
            .unwrap_or(self.default_delay.0);
        let max = self
            .store
            .get_config::<u64>("delay_max")
            .await
            .unwrap_or(self.default_delay.1);
        if min > max {
            (max, min)
        } else {
            (min, max)
        }
    }
}

/// Short replies pace near the lower bound, long ones near the upper.
fn pacing_bounds(reply_words: usize, min_d: u64, max_d: u64) -> (f64, f64) {
    let (min_d, max_d) = (min_d as f64, max_d as f64);
    let (lo, hi) = if reply_words < 5 {
        (min_d, min_d + 2.0)
    } else if reply_words < 15 {
        (min_d + 1.0, max_d - 1.0)
    } else {
        (max_d - 2.0, max_d)
    };
    let lo = lo.max(0.0);
    let hi = hi.max(lo);
    (lo, hi.min(30.0))
}

fn pacing_delay(reply_words: usize, min_d: u64, max_d: u64) -> f64 {
    let (lo, hi) = pacing_bounds(reply_words, min_d, max_d);
    if hi <= lo {
        return lo;
    }
    rand::thread_rng().gen_range(lo..=hi)
}
