use std::sync::Arc;

use tracing::info;

use crate::channel::Outbound;
use crate::config::Config;
use crate::gemini::{GeminiClient, TextBackend};
use crate::generator::ResponseGenerator;
use crate::keys::KeyRotation;
use crate::pipeline::Pipeline;
use crate::state::RuntimeState;
use crate::store::Store;

/// Everything the dispatcher handlers need, shared behind one Arc.
pub struct AppState {
    pub config: Config,
    pub store: Store,
    pub state: Arc<RuntimeState>,
    pub keys: Arc<KeyRotation>,
    pub backend: Arc<dyn TextBackend>,
    pub pipeline: Pipeline,
    pub outbound: Arc<dyn Outbound>,
}

pub fn build_state(config: Config, store: Store, outbound: Arc<dyn Outbound>) -> Arc<AppState> {
    let backend: Arc<dyn TextBackend> = Arc::new(GeminiClient::new(&config));
    build_state_with_backend(config, store, outbound, backend)
}

pub fn build_state_with_backend(
    config: Config,
    store: Store,
    outbound: Arc<dyn Outbound>,
    backend: Arc<dyn TextBackend>,
) -> Arc<AppState> {
    let state = Arc::new(RuntimeState::new(config.tz()));
    let keys = Arc::new(KeyRotation::new(store.clone()));
    let generator = Arc::new(ResponseGenerator::new(
        &config,
        backend.clone(),
        keys.clone(),
        store.clone(),
    ));
    let pipeline = Pipeline::new(
        &config,
        store.clone(),
        state.clone(),
        generator,
        outbound.clone(),
    );
    Arc::new(AppState {
        config,
        store,
        state,
        keys,
        backend,
        pipeline,
        outbound,
    })
}

pub async fn run(config: Config) -> anyhow::Result<()> {
    let store = Store::open(&config.data_dir);
    if store.is_connected() {
        info!("Document store ready at {}", config.data_dir);
    }

    let bot = teloxide::Bot::new(&config.bot_token);
    let outbound = Arc::new(crate::telegram::TelegramOutbound::new(bot.clone()));
    let app = build_state(config, store, outbound);

    info!(
        "Starting Telegram dispatcher as @{}",
        app.config.bot_username
    );
    crate::telegram::start_bot(app, bot).await;
    Ok(())
}
