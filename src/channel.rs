use async_trait::async_trait;

/// What the reply pipeline needs to know about an inbound message,
/// independent of the transport that carried it.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub user_id: Option<i64>,
    pub chat_id: i64,
    pub sender_name: String,
    pub text: Option<String>,
    pub is_sticker: bool,
    pub is_voice_like: bool,
    pub is_group: bool,
}

impl InboundMessage {
    pub fn private_text(user_id: i64, sender_name: &str, text: &str) -> Self {
        InboundMessage {
            user_id: Some(user_id),
            chat_id: user_id,
            sender_name: sender_name.to_string(),
            text: Some(text.to_string()),
            is_sticker: false,
            is_voice_like: false,
            is_group: false,
        }
    }
}

/// Why a delivery failed. `RetryAfter` carries the transport's requested
/// backoff in seconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    RetryAfter(u64),
    Terminal(String),
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::RetryAfter(secs) => write!(f, "flood wait {secs}s"),
            SendError::Terminal(msg) => write!(f, "{msg}"),
        }
    }
}

/// Outbound side of a chat transport. The pipeline only ever talks to this
/// trait; the Telegram impl lives in `telegram.rs` and tests use a mock.
#[async_trait]
pub trait Outbound: Send + Sync {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<(), SendError>;
    async fn send_sticker(&self, chat_id: i64, file_id: &str) -> Result<(), SendError>;
    /// Show a composing indicator; best-effort, errors are swallowed.
    async fn show_composing(&self, chat_id: i64);
}
