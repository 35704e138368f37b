pub mod channel;
pub mod commands;
pub mod config;
pub mod gemini;
pub mod generator;
pub mod guard;
pub mod keys;
pub mod logging;
pub mod pipeline;
pub mod runtime;
pub mod state;
pub mod telegram;

pub use standin_core::error;
pub use standin_core::text;
pub use standin_storage::db;
pub use standin_storage::store;
