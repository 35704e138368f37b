use chrono::{DateTime, Duration, Utc};

use crate::gemini::GenerateErrorKind;
use crate::runtime::AppState;
use crate::state::ConfirmOutcome;
use crate::text::mask_key;

const COMMAND_COOLDOWN_SECS: i64 = 1;

pub fn is_command(text: &str) -> bool {
    text.trim_start().starts_with('/')
}

/// Splits `/name args` into a lowercased name (with any `@bot` suffix
/// removed) and the remaining argument string.
fn parse_command(text: &str) -> Option<(String, String)> {
    let trimmed = text.trim();
    let rest = trimmed.strip_prefix('/')?;
    if rest.is_empty() {
        return None;
    }
    let (head, args) = match rest.split_once(char::is_whitespace) {
        Some((h, a)) => (h, a.trim()),
        None => (rest, ""),
    };
    let name = head.split('@').next().unwrap_or(head).to_lowercase();
    if name.is_empty() {
        return None;
    }
    Some((name, args.to_string()))
}

/// The configured owner, with the persisted value taking precedence over
/// the YAML one so `/setowner` survives restarts.
async fn resolve_owner(app: &AppState) -> i64 {
    app.store
        .get_config::<i64>("owner_id")
        .await
        .unwrap_or(app.config.owner_id)
}

async fn require_owner(app: &AppState, user_id: i64) -> bool {
    let owner = resolve_owner(app).await;
    owner != 0 && user_id == owner
}

fn command_cooldown_ok(app: &AppState, user_id: i64, now: DateTime<Utc>) -> bool {
    app.state
        .guard
        .command_cooldown_ok_at(user_id, COMMAND_COOLDOWN_SECS, now)
}

pub async fn handle_command(app: &AppState, user_id: i64, text: &str) -> Option<String> {
    handle_command_at(app, user_id, text, Utc::now()).await
}

pub async fn handle_command_at(
    app: &AppState,
    user_id: i64,
    text: &str,
    now: DateTime<Utc>,
) -> Option<String> {
    let (name, args) = parse_command(text)?;
    if !command_cooldown_ok(app, user_id, now) {
        return None;
    }

    // The cooldown only starts once a command actually matched; unknown
    // names never delay the next real one.
    let response = dispatch(app, user_id, &name, &args, now).await?;
    app.state.guard.mark_command_at(user_id, now);
    Some(response)
}

async fn dispatch(
    app: &AppState,
    user_id: i64,
    name: &str,
    args: &str,
    now: DateTime<Utc>,
) -> Option<String> {
    // Open to everyone; everything else is owner-gated.
    match name {
        "ping" => return Some("pong".to_string()),
        "help" => return Some(help_text()),
        "setowner" => return Some(cmd_setowner(app, user_id).await),
        _ => {}
    }

    if !require_owner(app, user_id).await {
        return None;
    }

    let response = dispatch_owner(app, user_id, name, args, now).await?;
    app.state.count_command();
    app.state.log_action(&format!("Command /{name}"));
    Some(response)
}

async fn dispatch_owner(
    app: &AppState,
    user_id: i64,
    name: &str,
    args: &str,
    now: DateTime<Utc>,
) -> Option<String> {
    let response = match name {
        "boton" => {
            app.store.set_config("bot_active", &true).await;
            "Bot activated.".to_string()
        }
        "botoff" => cmd_botoff(app, now).await,
        "status" => cmd_status(app, now).await,
        "addvip" => cmd_addvip(app, args).await,
        "removevip" => match parse_i64(args) {
            Some(id) if app.store.delete_vip(id).await => format!("Removed VIP {id}."),
            Some(id) => format!("{id} is not a VIP."),
            None => usage("/removevip <user_id>"),
        },
        "listvip" => {
            let vips = app.store.all_vips().await;
            if vips.is_empty() {
                "No VIPs configured.".to_string()
            } else {
                let mut out = format!("{} VIPs:\n", vips.len());
                for vip in vips {
                    out.push_str(&format!("  {} - {}\n", vip.user_id, vip.name));
                }
                out.trim_end().to_string()
            }
        }
        "vipname" => match args.split_once(char::is_whitespace) {
            Some((id, new_name)) if parse_i64(id).is_some() && !new_name.trim().is_empty() => {
                let id = parse_i64(id).unwrap_or_default();
                app.store.upsert_vip(id, new_name.trim().to_string()).await;
                format!("VIP {id} is now \"{}\".", new_name.trim())
            }
            _ => usage("/vipname <user_id> <name>"),
        },
        "addkey" => {
            let key = args.trim();
            if key.is_empty() {
                usage("/addkey <key>")
            } else if app.keys.add(key).await {
                let count = app.keys.all_keys().await.len();
                format!("Key added ({count} total).")
            } else {
                "Key already present.".to_string()
            }
        }
        "removekey" => match args.trim().parse::<usize>() {
            Ok(n) if n >= 1 && app.keys.remove(n - 1).await => format!("Removed key {n}."),
            Ok(_) => "No such key.".to_string(),
            Err(_) => usage("/removekey <number>"),
        },
        "listkeys" => cmd_listkeys(app).await,
        "testkeys" => cmd_testkeys(app).await,
        "clearkeys" => {
            app.keys.clear().await;
            "All keys cleared.".to_string()
        }
        "addsticker" => {
            let file_id = args.trim();
            if file_id.is_empty() {
                usage("/addsticker <file_id>")
            } else {
                app.store.add_sticker(file_id.to_string()).await;
                "Sticker saved.".to_string()
            }
        }
        "removesticker" => {
            if app.store.remove_sticker(args.trim().to_string()).await {
                "Sticker removed.".to_string()
            } else {
                "Unknown sticker.".to_string()
            }
        }
        "liststickers" => {
            let stickers = app.store.all_stickers().await;
            if stickers.is_empty() {
                "No stickers saved.".to_string()
            } else {
                format!("{} stickers:\n  {}", stickers.len(), stickers.join("\n  "))
            }
        }
        "clearstickers" => {
            let n = app.store.clear_stickers().await;
            format!("Removed {n} stickers.")
        }
        "stickerchance" => match args.trim().parse::<u32>() {
            Ok(pct) if pct <= 100 => {
                app.store.set_config("sticker_chance", &pct).await;
                format!("Sticker chance set to {pct}%.")
            }
            _ => usage("/stickerchance <0-100>"),
        },
        "firstmsg" => match args.trim() {
            "on" => {
                app.store.set_config("first_msg_enabled", &true).await;
                "First-message greeting enabled.".to_string()
            }
            "off" => {
                app.store.set_config("first_msg_enabled", &false).await;
                "First-message greeting disabled.".to_string()
            }
            _ => usage("/firstmsg on|off"),
        },
        "delay" => cmd_delay(app, args).await,
        "setlog" => match parse_i64(args) {
            Some(chat_id) => {
                app.store.set_config("log_chat_id", &chat_id).await;
                format!("Log channel set to {chat_id}.")
            }
            None => usage("/setlog <chat_id>"),
        },
        "disablelog" => {
            app.store.delete_config("log_chat_id").await;
            "Log channel disabled.".to_string()
        }
        "testlog" => cmd_testlog(app).await,
        "clearmemory" => match parse_i64(args) {
            Some(id) if app.store.delete_conversation(id).await => {
                format!("Cleared conversation with {id}.")
            }
            Some(id) => format!("No conversation with {id}."),
            None => usage("/clearmemory <user_id>"),
        },
        "memory" => match parse_i64(args) {
            Some(id) => {
                let n = app.store.message_count(id).await;
                format!("{n} stored entries for {id}.")
            }
            None => usage("/memory <user_id>"),
        },
        "clearall" => {
            let count = app.store.conversation_count().await;
            app.state.request_clear_at(user_id, now);
            format!("This wipes {count} conversations. Send /confirmclear within 60s to proceed.")
        }
        "confirmclear" => match app.state.confirm_clear_at(user_id, now) {
            ConfirmOutcome::Confirmed => {
                let n = app.store.delete_all_conversations().await;
                format!("Wiped {n} conversations.")
            }
            ConfirmOutcome::Expired => "Confirmation window expired, run /clearall again.".to_string(),
            ConfirmOutcome::NoRequest | ConfirmOutcome::WrongUser => {
                "Nothing pending to confirm.".to_string()
            }
        },
        "logs" => {
            let actions = app.state.recent_actions(50);
            if actions.is_empty() {
                "No actions logged yet.".to_string()
            } else {
                actions.join("\n")
            }
        }
        "errors" => {
            let errors = app.state.recent_errors(20);
            if errors.is_empty() {
                "No errors logged.".to_string()
            } else {
                errors.join("\n")
            }
        }
        _ => return None,
    };
    Some(response)
}

async fn cmd_setowner(app: &AppState, user_id: i64) -> String {
    let current = resolve_owner(app).await;
    if current != 0 && current != user_id {
        return "Owner is already set.".to_string();
    }
    app.store.set_config("owner_id", &user_id).await;
    format!("Owner set to {user_id}.")
}

async fn cmd_botoff(app: &AppState, now: DateTime<Utc>) -> String {
    app.store.set_config("bot_active", &false).await;
    let cutoff = (now - Duration::hours(24)).to_rfc3339();
    let activity = app.store.activity_since(cutoff).await;
    let total: i64 = activity.iter().map(|(_, n)| n).sum();
    let mut out = format!(
        "Bot deactivated.\nLast 24h: {total} messages from {} users.",
        activity.len()
    );
    for (uid, n) in activity.iter().take(5) {
        out.push_str(&format!("\n  {uid}: {n}"));
    }
    out
}

async fn cmd_status(app: &AppState, now: DateTime<Utc>) -> String {
    let active = app
        .store
        .get_config::<bool>("bot_active")
        .await
        .unwrap_or(true);
    let uptime = now.signed_duration_since(app.state.started_at);
    format!(
        "Active: {}\nUptime: {}\nReplies: {}\nCommands: {}\nErrors: {}\nConversations: {}\nVIPs: {}\nKeys: {}\nStore: {}",
        if active { "yes" } else { "no" },
        format_duration(uptime.num_seconds().max(0)),
        app.state.messages_replied(),
        app.state.commands_executed(),
        app.state.errors_count(),
        app.store.conversation_count().await,
        app.store.vip_count().await,
        app.keys.all_keys().await.len(),
        if app.store.is_connected() { "connected" } else { "unavailable" },
    )
}

async fn cmd_addvip(app: &AppState, args: &str) -> String {
    let mut parts = args.splitn(2, char::is_whitespace);
    let Some(id) = parts.next().and_then(|s| parse_i64(s)) else {
        return usage("/addvip <user_id> [name]");
    };
    let name = parts
        .next()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .unwrap_or("VIP")
        .to_string();
    app.store.upsert_vip(id, name.clone()).await;
    format!("Added VIP {id} ({name}).")
}

async fn cmd_listkeys(app: &AppState) -> String {
    let keys = app.keys.all_keys().await;
    if keys.is_empty() {
        return "No keys configured.".to_string();
    }
    let cursor = app.keys.cursor_for(keys.len());
    let mut out = format!("{} keys:\n", keys.len());
    for (i, key) in keys.iter().enumerate() {
        let marker = if i == cursor { "  (next)" } else { "" };
        out.push_str(&format!("  {}. {}{marker}\n", i + 1, mask_key(key)));
    }
    out.trim_end().to_string()
}

const KEY_TEST_PROMPT: &str = "Reply with the single word: ok";

/// Fires one minimal request per configured key and reports which still work.
async fn cmd_testkeys(app: &AppState) -> String {
    let keys = app.keys.all_keys().await;
    if keys.is_empty() {
        return "No keys configured.".to_string();
    }
    let mut out = format!("Testing {} keys:\n", keys.len());
    let mut live = 0usize;
    for (i, key) in keys.iter().enumerate() {
        let verdict = match app.backend.generate(key, KEY_TEST_PROMPT).await {
            Ok(_) => {
                live += 1;
                "live".to_string()
            }
            Err(GenerateErrorKind::RateLimited) => "rate-limited".to_string(),
            Err(err) => format!("dead ({err})"),
        };
        out.push_str(&format!("  {}. {} - {verdict}\n", i + 1, mask_key(key)));
    }
    out.push_str(&format!("{live}/{} live.", keys.len()));
    out
}

async fn cmd_testlog(app: &AppState) -> String {
    let Some(log_chat) = app.store.get_config::<i64>("log_chat_id").await else {
        return "No log channel configured. Use /setlog <chat_id>.".to_string();
    };
    match app.outbound.send_text(log_chat, "Log channel test.").await {
        Ok(()) => format!("Log channel {log_chat} is working."),
        Err(err) => format!("Log channel {log_chat} failed: {err}"),
    }
}

async fn cmd_delay(app: &AppState, args: &str) -> String {
    let Some((min_raw, max_raw)) = args.trim().split_once('-') else {
        return usage("/delay <min>-<max>");
    };
    let (Ok(min), Ok(max)) = (min_raw.trim().parse::<u64>(), max_raw.trim().parse::<u64>())
    else {
        return usage("/delay <min>-<max>");
    };
    let min = min.clamp(1, 30);
    let max = max.clamp(1, 30);
    let (min, max) = if min > max { (max, min) } else { (min, max) };
    app.store.set_config("delay_min", &min).await;
    app.store.set_config("delay_max", &max).await;
    format!("Reply delay set to {min}-{max}s.")
}

fn help_text() -> String {
    "Commands:\n\
     /boton /botoff /status /ping /setowner\n\
     /addvip <id> [name]  /removevip <id>  /listvip  /vipname <id> <name>\n\
     /addkey <key>  /removekey <n>  /listkeys  /testkeys  /clearkeys\n\
     /addsticker <file_id>  /removesticker <file_id>  /liststickers  /clearstickers  /stickerchance <0-100>\n\
     /firstmsg on|off  /delay <min>-<max>  /setlog <chat_id>  /testlog  /disablelog\n\
     /clearmemory <id>  /memory <id>  /clearall  /confirmclear\n\
     /logs  /errors"
        .to_string()
}

fn format_duration(total_secs: i64) -> String {
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;
    if hours > 0 {
        format!("{hours}h {mins}m")
    } else if mins > 0 {
        format!("{mins}m {secs}s")
    } else {
        format!("{secs}s")
    }
}

fn parse_i64(args: &str) -> Option<i64> {
    args.trim().parse::<i64>().ok()
}

fn usage(pattern: &str) -> String {
    format!("Usage: {pattern}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Outbound, SendError};
    use crate::config::Config;
    use crate::db::{Database, KeyRing};
    use crate::gemini::TextBackend;
    use crate::runtime::{build_state, build_state_with_backend, AppState};
    use crate::store::Store;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    struct NullOutbound;

    #[async_trait::async_trait]
    impl Outbound for NullOutbound {
        async fn send_text(&self, _chat_id: i64, _text: &str) -> Result<(), SendError> {
            Ok(())
        }
        async fn send_sticker(&self, _chat_id: i64, _file_id: &str) -> Result<(), SendError> {
            Ok(())
        }
        async fn show_composing(&self, _chat_id: i64) {}
    }

    struct ScriptedBackend {
        script: Mutex<VecDeque<Result<String, GenerateErrorKind>>>,
    }

    #[async_trait::async_trait]
    impl TextBackend for ScriptedBackend {
        async fn generate(&self, _key: &str, _prompt: &str) -> Result<String, GenerateErrorKind> {
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(GenerateErrorKind::Fatal("script exhausted".into())))
        }
    }

    fn app(owner_id: i64) -> Arc<AppState> {
        let config: Config = serde_yaml::from_str(&format!(
            "bot_token: \"t\"\nbot_username: \"standin\"\nowner_id: {owner_id}\n"
        ))
        .unwrap();
        let store = Store::Connected(Arc::new(Database::open_in_memory().unwrap()));
        build_state(config, store, Arc::new(NullOutbound))
    }

    fn app_with_backend(owner_id: i64, backend: Arc<dyn TextBackend>) -> Arc<AppState> {
        let config: Config = serde_yaml::from_str(&format!(
            "bot_token: \"t\"\nbot_username: \"standin\"\nowner_id: {owner_id}\n"
        ))
        .unwrap();
        let store = Store::Connected(Arc::new(Database::open_in_memory().unwrap()));
        build_state_with_backend(config, store, Arc::new(NullOutbound), backend)
    }

    async fn run_at(app: &AppState, user: i64, text: &str, offset_secs: i64) -> Option<String> {
        let now = Utc::now() + Duration::seconds(offset_secs * 2);
        handle_command_at(app, user, text, now).await
    }

    #[tokio::test]
    async fn test_non_owner_commands_are_silently_dropped() {
        let app = app(777);
        assert_eq!(run_at(&app, 1, "/status", 0).await, None);
        assert_eq!(run_at(&app, 1, "/boton", 1).await, None);
    }

    #[tokio::test]
    async fn test_ping_open_to_everyone() {
        let app = app(777);
        assert_eq!(run_at(&app, 1, "/ping", 0).await.as_deref(), Some("pong"));
    }

    #[tokio::test]
    async fn test_setowner_bootstrap_then_gated() {
        let app = app(0);
        let reply = run_at(&app, 42, "/setowner", 0).await.unwrap();
        assert!(reply.contains("42"));
        // A different user cannot take the slot over.
        assert_eq!(
            run_at(&app, 43, "/setowner", 1).await.as_deref(),
            Some("Owner is already set.")
        );
        // The claimed owner can now run gated commands.
        assert!(run_at(&app, 42, "/status", 2).await.is_some());
        assert_eq!(run_at(&app, 43, "/status", 3).await, None);
    }

    #[tokio::test]
    async fn test_command_cooldown_blocks_rapid_fire() {
        let app = app(777);
        let now = Utc::now();
        assert!(handle_command_at(&app, 777, "/ping", now).await.is_some());
        assert!(handle_command_at(&app, 777, "/ping", now).await.is_none());
        assert!(
            handle_command_at(&app, 777, "/ping", now + Duration::seconds(2))
                .await
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_unknown_command_does_not_burn_cooldown() {
        let app = app(777);
        let now = Utc::now();
        assert_eq!(handle_command_at(&app, 777, "/bogus", now).await, None);
        assert!(handle_command_at(&app, 777, "/ping", now).await.is_some());
    }

    #[tokio::test]
    async fn test_testkeys_reports_per_key_status() {
        let backend = Arc::new(ScriptedBackend {
            script: Mutex::new(VecDeque::from([
                Ok("ok".to_string()),
                Err(GenerateErrorKind::RateLimited),
                Err(GenerateErrorKind::Fatal("API key not valid".into())),
            ])),
        });
        let app = app_with_backend(777, backend);
        app.store
            .save_key_ring(KeyRing {
                keys: vec![
                    "AIzaSyAAAAAA1111111111aaa1".into(),
                    "AIzaSyBBBBBB2222222222bbb2".into(),
                    "AIzaSyCCCCCC3333333333ccc3".into(),
                ],
                current_index: 0,
            })
            .await;

        let report = run_at(&app, 777, "/testkeys", 0).await.unwrap();
        assert!(report.contains("1/3 live."));
        assert!(report.contains("rate-limited"));
        assert!(report.contains("dead"));
        // Full key material never appears in the report.
        assert!(!report.contains("AIzaSyAAAAAA1111111111aaa1"));
    }

    #[tokio::test]
    async fn test_testlog_requires_configured_channel() {
        let app = app(777);
        let reply = run_at(&app, 777, "/testlog", 0).await.unwrap();
        assert!(reply.contains("No log channel configured"));

        run_at(&app, 777, "/setlog 999", 1).await;
        let reply = run_at(&app, 777, "/testlog", 2).await.unwrap();
        assert!(reply.contains("999 is working"));
    }

    #[tokio::test]
    async fn test_vip_roundtrip() {
        let app = app(777);
        let reply = run_at(&app, 777, "/addvip 55 Maya", 0).await.unwrap();
        assert!(reply.contains("Maya"));
        let listing = run_at(&app, 777, "/listvip", 1).await.unwrap();
        assert!(listing.contains("55 - Maya"));
        let rename = run_at(&app, 777, "/vipname 55 Ray", 2).await.unwrap();
        assert!(rename.contains("Ray"));
        let removed = run_at(&app, 777, "/removevip 55", 3).await.unwrap();
        assert!(removed.contains("Removed"));
        assert_eq!(
            run_at(&app, 777, "/listvip", 4).await.as_deref(),
            Some("No VIPs configured.")
        );
    }

    #[tokio::test]
    async fn test_listkeys_masks_and_marks_cursor() {
        let app = app(777);
        run_at(&app, 777, "/addkey AIzaSyABCDEF1234567890xyz9", 0).await;
        let listing = run_at(&app, 777, "/listkeys", 1).await.unwrap();
        assert!(!listing.contains("AIzaSyABCDEF1234567890xyz9"));
        assert!(listing.contains("AIzaSyAB"));
        assert!(listing.contains("(next)"));
    }

    #[tokio::test]
    async fn test_delay_clamps_and_swaps() {
        let app = app(777);
        let reply = run_at(&app, 777, "/delay 99-0", 0).await.unwrap();
        assert_eq!(reply, "Reply delay set to 1-30s.");
        assert_eq!(app.store.get_config::<u64>("delay_min").await, Some(1));
        assert_eq!(app.store.get_config::<u64>("delay_max").await, Some(30));
    }

    #[tokio::test]
    async fn test_stickerchance_rejects_out_of_range() {
        let app = app(777);
        let reply = run_at(&app, 777, "/stickerchance 150", 0).await.unwrap();
        assert!(reply.starts_with("Usage"));
        let ok = run_at(&app, 777, "/stickerchance 25", 1).await.unwrap();
        assert!(ok.contains("25%"));
    }

    #[tokio::test]
    async fn test_clearall_requires_confirmation() {
        let app = app(777);
        app.store
            .append_message(
                5,
                crate::db::ConversationEntry {
                    text: "hi".into(),
                    sender: crate::db::Sender::User,
                    timestamp: String::new(),
                },
            )
            .await;

        let warning = run_at(&app, 777, "/clearall", 0).await.unwrap();
        assert!(warning.contains("1 conversations"));
        // Still there until confirmed.
        assert_eq!(app.store.message_count(5).await, 1);

        let confirmed = run_at(&app, 777, "/confirmclear", 1).await.unwrap();
        assert!(confirmed.contains("Wiped 1"));
        assert_eq!(app.store.message_count(5).await, 0);
    }

    #[tokio::test]
    async fn test_confirmclear_without_request() {
        let app = app(777);
        assert_eq!(
            run_at(&app, 777, "/confirmclear", 0).await.as_deref(),
            Some("Nothing pending to confirm.")
        );
    }

    #[tokio::test]
    async fn test_unknown_command_is_none() {
        let app = app(777);
        assert_eq!(run_at(&app, 777, "/frobnicate", 0).await, None);
        assert_eq!(run_at(&app, 777, "not a command", 1).await, None);
    }

    #[test]
    fn test_parse_command_strips_bot_suffix() {
        assert_eq!(
            parse_command("/status@standin_bot"),
            Some(("status".to_string(), String::new()))
        );
        assert_eq!(
            parse_command("  /AddVip 55 Maya "),
            Some(("addvip".to_string(), "55 Maya".to_string()))
        );
        assert_eq!(parse_command("hello"), None);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(45), "45s");
        assert_eq!(format_duration(125), "2m 5s");
        assert_eq!(format_duration(7260), "2h 1m");
    }
}
