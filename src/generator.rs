use std::sync::Arc;

use chrono::Utc;
use chrono_tz::Tz;
use tracing::{info, warn};

use crate::config::Config;
use crate::db::{Sender, VipRecord};
use crate::gemini::{GenerateErrorKind, TextBackend};
use crate::keys::KeyRotation;
use crate::store::Store;
use crate::text::{truncate_chars, truncate_with_ellipsis};

/// Returned when every key is exhausted or none are configured.
pub const FALLBACK_REPLY: &str = "Boss is offline right now, I'll let them know you pinged";
/// Returned when the model safety-blocks the exchange.
pub const SAFETY_DEFLECTION: &str = "hmm, what are you even saying";

const MAX_ATTEMPTS: usize = 3;
const CONTEXT_FETCH: usize = 5;
const CONTEXT_ENTRIES: usize = 3;
const CONTEXT_CHAR_CAP: usize = 100;
const INPUT_CHAR_CAP: usize = 500;
const REPLY_CHAR_CAP: usize = 300;

const PERSONA_TEMPLATE: &str = "\
You are {name}, replying on Telegram on behalf of your owner.

PERSONALITY:
- Serious and sarcastic by default
- No emojis, ever
- Short to medium replies, casual register
- Friendly only with VIPs

SPECIAL RULES:
- Asked if you are a bot or automated: reply \"Does it matter, what do you need\"
- Asked for personal info (number, address, photos): tell them to ask the owner directly
- Flirting or nonsense: shut it down in one line

VIP HANDLING:
{vip_context}

Current time: {current_time}

RECENT CONVERSATION:
{history}

User's message: {message}

Reply as {name} (short, natural, NO quotes, NO asterisks):";

/// Builds the persona prompt and drives generation through the credential
/// rotation. Never errors; every failure path degrades to a fixed string.
pub struct ResponseGenerator {
    backend: Arc<dyn TextBackend>,
    keys: Arc<KeyRotation>,
    store: Store,
    persona_name: String,
    favorite_vip: Option<String>,
    tz: Tz,
}

impl ResponseGenerator {
    pub fn new(
        config: &Config,
        backend: Arc<dyn TextBackend>,
        keys: Arc<KeyRotation>,
        store: Store,
    ) -> Self {
        ResponseGenerator {
            backend,
            keys,
            store,
            persona_name: config.bot_username.clone(),
            favorite_vip: config.favorite_vip.clone(),
            tz: config.tz(),
        }
    }

    pub async fn generate(&self, user_id: i64, text: &str, vip: Option<&VipRecord>) -> String {
        let keys = self.keys.all_keys().await;
        if keys.is_empty() {
            return FALLBACK_REPLY.to_string();
        }

        let prompt = self.build_prompt(user_id, text, vip).await;
        let attempts = MAX_ATTEMPTS.min(keys.len());

        for attempt in 1..=attempts {
            let Some(key) = self.keys.next_key().await else {
                break;
            };
            match self.backend.generate(&key, &prompt).await {
                Ok(raw) => {
                    let reply = sanitize_reply(&raw, &self.persona_name);
                    if !reply.is_empty() {
                        return reply;
                    }
                    warn!("Generation attempt {attempt} produced empty text");
                }
                Err(GenerateErrorKind::RateLimited) => {
                    info!("Key attempt {attempt}/{attempts} rate limited, rotating");
                }
                Err(GenerateErrorKind::SafetyRejected) => {
                    info!("Generation safety-blocked, deflecting");
                    return SAFETY_DEFLECTION.to_string();
                }
                Err(err) => {
                    warn!("Generation attempt {attempt}/{attempts} failed: {err}");
                }
            }
        }

        FALLBACK_REPLY.to_string()
    }

    async fn build_prompt(&self, user_id: i64, text: &str, vip: Option<&VipRecord>) -> String {
        let history = self.store.recent_messages(user_id, CONTEXT_FETCH).await;
        let start = history.len().saturating_sub(CONTEXT_ENTRIES);
        let mut context = String::new();
        for entry in &history[start..] {
            let label = match entry.sender {
                Sender::User => "User",
                Sender::Bot => self.persona_name.as_str(),
            };
            context.push_str(label);
            context.push_str(": ");
            context.push_str(truncate_chars(&entry.text, CONTEXT_CHAR_CAP));
            context.push('\n');
        }
        if context.is_empty() {
            context.push_str("No previous conversation");
        }

        let vip_context = match vip {
            Some(record)
                if self
                    .favorite_vip
                    .as_deref()
                    .is_some_and(|fav| fav.eq_ignore_ascii_case(&record.name)) =>
            {
                format!(
                    "IMPORTANT: This is {}, the owner's favorite. Be warm, affectionate and respectful.",
                    record.name
                )
            }
            Some(record) => format!(
                "IMPORTANT: This is {} (VIP). Be friendly and respectful.",
                record.name
            ),
            None => "Normal user, usual serious/sarcastic mode.".to_string(),
        };

        let current_time = Utc::now()
            .with_timezone(&self.tz)
            .format("%I:%M %p, %d %b")
            .to_string();

        PERSONA_TEMPLATE
            .replace("{name}", &self.persona_name)
            .replace("{vip_context}", &vip_context)
            .replace("{current_time}", &current_time)
            .replace("{history}", &context)
            .replace("{message}", truncate_chars(text, INPUT_CHAR_CAP))
    }
}

fn sanitize_reply(raw: &str, persona_name: &str) -> String {
    let mut reply = raw.trim();
    let label = format!("{persona_name}:");
    if let Some(rest) = reply.strip_prefix(&label) {
        reply = rest.trim();
    }
    let reply = reply.trim_matches(|c| c == '"' || c == '\'');
    let cleaned: String = reply.chars().filter(|c| *c != '*' && *c != '_').collect();
    truncate_with_ellipsis(cleaned.trim(), REPLY_CHAR_CAP)
}
