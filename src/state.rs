use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use tracing::{error, info};

use crate::guard::SessionGuard;

const ACTION_LOG_LIMIT: usize = 50;
const ERROR_LOG_LIMIT: usize = 20;
/// Window within which a destructive bulk deletion must be confirmed.
const CONFIRM_TIMEOUT_SECS: i64 = 60;

#[derive(Debug, Clone, Copy)]
struct PendingClear {
    user_id: i64,
    issued_at: DateTime<Utc>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// No `/clearall` request is pending.
    NoRequest,
    /// Pending request belongs to a different identity.
    WrongUser,
    /// Request was older than the confirmation window; slot cleared.
    Expired,
    /// Confirmed within the window; slot cleared.
    Confirmed,
}

/// Process-wide transient session state: counters, rolling operator logs and
/// the single-slot destructive-operation confirmation. Lost on restart by
/// design — cooldowns and spam windows are best-effort.
pub struct RuntimeState {
    pub guard: SessionGuard,
    pub started_at: DateTime<Utc>,
    tz: Tz,
    messages_replied: AtomicU64,
    commands_executed: AtomicU64,
    errors_count: AtomicU64,
    action_log: Mutex<VecDeque<String>>,
    error_log: Mutex<VecDeque<String>>,
    pending_clear: Mutex<Option<PendingClear>>,
}

impl RuntimeState {
    pub fn new(tz: Tz) -> Self {
        RuntimeState {
            guard: SessionGuard::new(),
            started_at: Utc::now(),
            tz,
            messages_replied: AtomicU64::new(0),
            commands_executed: AtomicU64::new(0),
            errors_count: AtomicU64::new(0),
            action_log: Mutex::new(VecDeque::new()),
            error_log: Mutex::new(VecDeque::new()),
            pending_clear: Mutex::new(None),
        }
    }

    // --- counters -----------------------------------------------------

    pub fn count_reply(&self) {
        self.messages_replied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_command(&self) {
        self.commands_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn messages_replied(&self) -> u64 {
        self.messages_replied.load(Ordering::Relaxed)
    }

    pub fn commands_executed(&self) -> u64 {
        self.commands_executed.load(Ordering::Relaxed)
    }

    pub fn errors_count(&self) -> u64 {
        self.errors_count.load(Ordering::Relaxed)
    }

    // --- rolling operator logs ----------------------------------------

    pub fn log_action(&self, action: &str) {
        info!("{action}");
        let stamp = Utc::now().with_timezone(&self.tz).format("%H:%M:%S");
        push_bounded(&self.action_log, format!("[{stamp}] {action}"), ACTION_LOG_LIMIT);
    }

    pub fn log_error(&self, message: &str) {
        error!("{message}");
        self.errors_count.fetch_add(1, Ordering::Relaxed);
        let stamp = Utc::now().with_timezone(&self.tz).format("%H:%M:%S");
        push_bounded(&self.error_log, format!("[{stamp}] {message}"), ERROR_LOG_LIMIT);
    }

    pub fn recent_actions(&self, limit: usize) -> Vec<String> {
        tail(&self.action_log, limit)
    }

    pub fn recent_errors(&self, limit: usize) -> Vec<String> {
        tail(&self.error_log, limit)
    }

    // --- destructive-operation confirmation ---------------------------

    /// Arm (or overwrite) the pending-confirmation slot.
    pub fn request_clear(&self, user_id: i64) {
        self.request_clear_at(user_id, Utc::now());
    }

    pub fn request_clear_at(&self, user_id: i64, now: DateTime<Utc>) {
        *self.lock_pending() = Some(PendingClear {
            user_id,
            issued_at: now,
        });
    }

    pub fn confirm_clear(&self, user_id: i64) -> ConfirmOutcome {
        self.confirm_clear_at(user_id, Utc::now())
    }

    pub fn confirm_clear_at(&self, user_id: i64, now: DateTime<Utc>) -> ConfirmOutcome {
        let mut slot = self.lock_pending();
        let Some(pending) = *slot else {
            return ConfirmOutcome::NoRequest;
        };
        if pending.user_id != user_id {
            return ConfirmOutcome::WrongUser;
        }
        if (now - pending.issued_at) > Duration::seconds(CONFIRM_TIMEOUT_SECS) {
            *slot = None;
            return ConfirmOutcome::Expired;
        }
        *slot = None;
        ConfirmOutcome::Confirmed
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Option<PendingClear>> {
        match self.pending_clear.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn push_bounded(log: &Mutex<VecDeque<String>>, line: String, cap: usize) {
    let mut log = match log.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    log.push_back(line);
    while log.len() > cap {
        log.pop_front();
    }
}

fn tail(log: &Mutex<VecDeque<String>>, limit: usize) -> Vec<String> {
    let log = match log.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    log.iter()
        .skip(log.len().saturating_sub(limit))
        .cloned()
        .collect()
}
