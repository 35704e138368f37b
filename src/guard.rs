use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};

/// Per-user fingerprint window size.
const SPAM_WINDOW_CAP: usize = 5;
/// Trailing interval a fingerprint stays relevant for.
const SPAM_TIME_WINDOW_SECS: i64 = 60;
/// Identical recent fingerprints needed to classify as spam.
const SPAM_THRESHOLD: usize = 3;
/// Minimum gap between two delivered replies to the same user.
const REPLY_COOLDOWN_SECS: i64 = 2;

type Fingerprint = [u8; 32];

#[derive(Debug)]
struct WindowEntry {
    fingerprint: Fingerprint,
    at: DateTime<Utc>,
}

#[derive(Default)]
struct GuardInner {
    spam_windows: HashMap<i64, VecDeque<WindowEntry>>,
    last_reply: HashMap<i64, DateTime<Utc>>,
    last_command: HashMap<i64, DateTime<Utc>>,
    in_flight: HashSet<i64>,
}

/// Per-user rate/spam tracking plus the in-flight mutual-exclusion set.
/// Everything lives behind one mutex because pipeline executions for
/// different users run concurrently on the runtime.
#[derive(Default)]
pub struct SessionGuard {
    inner: Mutex<GuardInner>,
}

fn fingerprint(text: &str) -> Fingerprint {
    Sha256::digest(text.as_bytes()).into()
}

impl SessionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the message fingerprint and report whether the user's recent
    /// window now classifies as spam: at least `SPAM_THRESHOLD` entries
    /// inside the time window, all with the same fingerprint. Empty text is
    /// never counted.
    pub fn record_and_check(&self, user_id: i64, text: &str) -> bool {
        self.record_and_check_at(user_id, text, Utc::now())
    }

    pub fn record_and_check_at(&self, user_id: i64, text: &str, now: DateTime<Utc>) -> bool {
        if text.is_empty() {
            return false;
        }

        let fp = fingerprint(text);
        let mut inner = self.lock();
        let window = inner.spam_windows.entry(user_id).or_default();
        window.push_back(WindowEntry {
            fingerprint: fp,
            at: now,
        });
        while window.len() > SPAM_WINDOW_CAP {
            window.pop_front();
        }

        let recent: Vec<&WindowEntry> = window
            .iter()
            .filter(|e| (now - e.at) < Duration::seconds(SPAM_TIME_WINDOW_SECS))
            .collect();

        recent.len() >= SPAM_THRESHOLD
            && recent.iter().all(|e| e.fingerprint == recent[0].fingerprint)
    }

    /// False while the user is still inside the reply cooldown window.
    pub fn cooldown_ok(&self, user_id: i64) -> bool {
        self.cooldown_ok_at(user_id, Utc::now())
    }

    pub fn cooldown_ok_at(&self, user_id: i64, now: DateTime<Utc>) -> bool {
        let inner = self.lock();
        match inner.last_reply.get(&user_id) {
            Some(last) => (now - *last) >= Duration::seconds(REPLY_COOLDOWN_SECS),
            None => true,
        }
    }

    pub fn mark_replied(&self, user_id: i64) {
        self.mark_replied_at(user_id, Utc::now());
    }

    pub fn mark_replied_at(&self, user_id: i64, now: DateTime<Utc>) {
        self.lock().last_reply.insert(user_id, now);
    }

    /// Command-surface cooldown, independent of the reply cooldown.
    pub fn command_cooldown_ok_at(
        &self,
        user_id: i64,
        interval_secs: i64,
        now: DateTime<Utc>,
    ) -> bool {
        let inner = self.lock();
        match inner.last_command.get(&user_id) {
            Some(last) => (now - *last) >= Duration::seconds(interval_secs),
            None => true,
        }
    }

    pub fn mark_command_at(&self, user_id: i64, now: DateTime<Utc>) {
        self.lock().last_command.insert(user_id, now);
    }

    /// At-most-one-in-flight per user: returns false when a pipeline
    /// execution for this user is already running.
    pub fn try_enter(&self, user_id: i64) -> bool {
        self.lock().in_flight.insert(user_id)
    }

    pub fn leave(&self, user_id: i64) {
        self.lock().in_flight.remove(&user_id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GuardInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// RAII wrapper around the in-flight marker so it is released on every exit
/// path of the pipeline, panics included.
pub struct InFlightSlot<'a> {
    guard: &'a SessionGuard,
    user_id: i64,
}

impl<'a> InFlightSlot<'a> {
    pub fn acquire(guard: &'a SessionGuard, user_id: i64) -> Option<Self> {
        if guard.try_enter(user_id) {
            Some(InFlightSlot { guard, user_id })
        } else {
            None
        }
    }
}

impl Drop for InFlightSlot<'_> {
    fn drop(&mut self) {
        self.guard.leave(self.user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_three_identical_messages_within_window_is_spam() {
        let guard = SessionGuard::new();
        assert!(!guard.record_and_check_at(1, "hi", at(0)));
        assert!(!guard.record_and_check_at(1, "hi", at(10)));
        assert!(guard.record_and_check_at(1, "hi", at(20)));
        // Later repeats keep classifying as spam.
        assert!(guard.record_and_check_at(1, "hi", at(30)));
    }

    #[test]
    fn test_one_differing_message_defeats_spam() {
        let guard = SessionGuard::new();
        assert!(!guard.record_and_check_at(1, "hi", at(0)));
        assert!(!guard.record_and_check_at(1, "hi", at(10)));
        assert!(!guard.record_and_check_at(1, "hi!", at(20)));
    }

    #[test]
    fn test_old_entries_fall_out_of_window() {
        let guard = SessionGuard::new();
        assert!(!guard.record_and_check_at(1, "hi", at(0)));
        assert!(!guard.record_and_check_at(1, "hi", at(10)));
        // Third repeat arrives after the first left the 60s window.
        assert!(!guard.record_and_check_at(1, "hi", at(65)));
    }

    #[test]
    fn test_empty_text_never_counted() {
        let guard = SessionGuard::new();
        for i in 0..5 {
            assert!(!guard.record_and_check_at(1, "", at(i)));
        }
    }

    #[test]
    fn test_spam_windows_are_per_user() {
        let guard = SessionGuard::new();
        guard.record_and_check_at(1, "hi", at(0));
        guard.record_and_check_at(2, "hi", at(1));
        guard.record_and_check_at(1, "hi", at(2));
        guard.record_and_check_at(2, "hi", at(3));
        assert!(guard.record_and_check_at(1, "hi", at(4)));
        assert!(guard.record_and_check_at(2, "hi", at(5)));
    }

    #[test]
    fn test_window_capacity_evicts_oldest() {
        let guard = SessionGuard::new();
        // Six distinct messages, then three identical: window cap is 5 so
        // the distinct ones are pushed out.
        for i in 0..6 {
            guard.record_and_check_at(1, &format!("m{i}"), at(i));
        }
        assert!(!guard.record_and_check_at(1, "x", at(10)));
        assert!(!guard.record_and_check_at(1, "x", at(11)));
        // Window is now [m4, m5, x, x, x]: three identical entries, but the
        // two distinct leftovers block classification.
        assert!(!guard.record_and_check_at(1, "x", at(12)));
    }

    #[test]
    fn test_reply_cooldown() {
        let guard = SessionGuard::new();
        assert!(guard.cooldown_ok_at(1, at(0)));
        guard.mark_replied_at(1, at(0));
        assert!(!guard.cooldown_ok_at(1, at(1)));
        assert!(guard.cooldown_ok_at(1, at(2)));
    }

    #[test]
    fn test_in_flight_mutual_exclusion() {
        let guard = SessionGuard::new();
        assert!(guard.try_enter(1));
        assert!(!guard.try_enter(1));
        assert!(guard.try_enter(2));
        guard.leave(1);
        assert!(guard.try_enter(1));
    }

    #[test]
    fn test_in_flight_slot_releases_on_drop() {
        let guard = SessionGuard::new();
        {
            let slot = InFlightSlot::acquire(&guard, 1);
            assert!(slot.is_some());
            assert!(InFlightSlot::acquire(&guard, 1).is_none());
        }
        assert!(InFlightSlot::acquire(&guard, 1).is_some());
    }

    #[test]
    fn test_command_cooldown() {
        let guard = SessionGuard::new();
        assert!(guard.command_cooldown_ok_at(1, 1, at(0)));
        guard.mark_command_at(1, at(0));
        assert!(!guard.command_cooldown_ok_at(1, 1, at(0)));
        assert!(guard.command_cooldown_ok_at(1, 1, at(1)));
    }
}
