use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::StandinError;

fn default_bot_token() -> String {
    String::new()
}
fn default_bot_username() -> String {
    String::new()
}
fn default_owner_id() -> i64 {
    0
}
fn default_gemini_model() -> String {
    "gemini-1.5-flash-latest".into()
}
fn default_data_dir() -> String {
    "./standin.data".into()
}
fn default_timezone() -> String {
    "UTC".into()
}
fn default_delay_min() -> u64 {
    3
}
fn default_delay_max() -> u64 {
    8
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_bot_token")]
    pub bot_token: String,
    #[serde(default = "default_bot_username")]
    pub bot_username: String,
    /// Bootstrap owner identity; the persisted `owner_id` config entry wins
    /// once `/setowner` has run.
    #[serde(default = "default_owner_id")]
    pub owner_id: i64,
    #[serde(default = "default_gemini_model")]
    pub gemini_model: String,
    #[serde(default)]
    pub gemini_base_url: Option<String>,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Distinguished VIP display name that switches the persona to an
    /// affectionate tone instead of the generic friendly VIP tone.
    #[serde(default)]
    pub favorite_vip: Option<String>,
    #[serde(default = "default_delay_min")]
    pub delay_min: u64,
    #[serde(default = "default_delay_max")]
    pub delay_max: u64,
}

impl Config {
    pub fn resolve_config_path() -> Result<Option<PathBuf>, StandinError> {
        if let Ok(custom) = std::env::var("STANDIN_CONFIG") {
            if std::path::Path::new(&custom).exists() {
                return Ok(Some(PathBuf::from(custom)));
            }
            return Err(StandinError::Config(format!(
                "STANDIN_CONFIG points to non-existent file: {custom}"
            )));
        }

        if std::path::Path::new("./standin.config.yaml").exists() {
            return Ok(Some(PathBuf::from("./standin.config.yaml")));
        }
        if std::path::Path::new("./standin.config.yml").exists() {
            return Ok(Some(PathBuf::from("./standin.config.yml")));
        }
        Ok(None)
    }

    /// Load config from YAML file.
    pub fn load() -> Result<Self, StandinError> {
        let Some(path) = Self::resolve_config_path()? else {
            return Err(StandinError::Config(
                "No standin.config.yaml found next to the binary.".into(),
            ));
        };

        let path_str = path.to_string_lossy().to_string();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| StandinError::Config(format!("Failed to read {path_str}: {e}")))?;
        let mut config: Config = serde_yaml::from_str(&content)
            .map_err(|e| StandinError::Config(format!("Failed to parse {path_str}: {e}")))?;
        config.post_deserialize()?;
        Ok(config)
    }

    pub fn post_deserialize(&mut self) -> Result<(), StandinError> {
        if self.bot_token.trim().is_empty() {
            if let Ok(token) = std::env::var("STANDIN_BOT_TOKEN") {
                self.bot_token = token;
            }
        }
        if self.bot_token.trim().is_empty() {
            return Err(StandinError::Config(
                "bot_token is required (config file or STANDIN_BOT_TOKEN)".into(),
            ));
        }

        self.bot_username = self.bot_username.trim().trim_start_matches('@').to_string();
        if self.bot_username.is_empty() {
            return Err(StandinError::Config("bot_username is required".into()));
        }

        if self.timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(StandinError::Config(format!(
                "Unknown timezone: {}",
                self.timezone
            )));
        }

        if self.delay_min == 0 {
            self.delay_min = 1;
        }
        if self.delay_max > 30 {
            self.delay_max = 30;
        }
        if self.delay_min > self.delay_max {
            std::mem::swap(&mut self.delay_min, &mut self.delay_max);
        }

        Ok(())
    }

    pub fn tz(&self) -> chrono_tz::Tz {
        self.timezone.parse().unwrap_or(chrono_tz::UTC)
    }
}
