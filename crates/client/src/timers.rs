// Keyed deadline set driving every timeout in the session layer.
//
// Nothing here sleeps. The event loop asks for `next_deadline()`, sleeps
// until then, and feeds the keys from `drain_expired(now)` back into the
// engine. Tests call `drain_expired` with hand-advanced instants instead.

use std::collections::HashMap;

use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerKey {
    /// Open + auth handshake bound for the current connection.
    Handshake,
    /// Next reconnect attempt.
    Reconnect,
    /// Next outgoing ping.
    Heartbeat,
    /// Deadline for any inbound traffic on the active connection.
    Liveness,
    /// Ack timeout or retry wait for one outbound action.
    Action(String),
    /// Earliest remote typing entry expiry.
    TypingSweep,
    /// Local keystroke idle for one chat.
    LocalTyping(String),
}

#[derive(Debug, Default)]
pub struct Timers {
    deadlines: HashMap<TimerKey, Instant>,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `key` at `at`, replacing any previous deadline for it.
    pub fn schedule(&mut self, key: TimerKey, at: Instant) {
        self.deadlines.insert(key, at);
    }

    pub fn cancel(&mut self, key: &TimerKey) -> bool {
        self.deadlines.remove(key).is_some()
    }

    /// Cancel every key matching `pred`.
    pub fn cancel_where(&mut self, mut pred: impl FnMut(&TimerKey) -> bool) {
        self.deadlines.retain(|key, _| !pred(key));
    }

    pub fn deadline(&self, key: &TimerKey) -> Option<Instant> {
        self.deadlines.get(key).copied()
    }

    pub fn is_scheduled(&self, key: &TimerKey) -> bool {
        self.deadlines.contains_key(key)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Remove and return all keys due at `now`, earliest first.
    pub fn drain_expired(&mut self, now: Instant) -> Vec<TimerKey> {
        let mut due: Vec<(Instant, TimerKey)> = Vec::new();
        self.deadlines.retain(|key, at| {
            if *at <= now {
                due.push((*at, key.clone()));
                false
            } else {
                true
            }
        });
        due.sort();
        due.into_iter().map(|(_, key)| key).collect()
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn drain_returns_due_keys_in_deadline_order() {
        let mut timers = Timers::new();
        let now = Instant::now();
        timers.schedule(TimerKey::Heartbeat, now + Duration::from_millis(30));
        timers.schedule(TimerKey::Reconnect, now + Duration::from_millis(10));
        timers.schedule(TimerKey::Liveness, now + Duration::from_millis(50));

        let due = timers.drain_expired(now + Duration::from_millis(30));
        assert_eq!(due, vec![TimerKey::Reconnect, TimerKey::Heartbeat]);
        assert_eq!(timers.len(), 1);
        assert_eq!(timers.next_deadline(), Some(now + Duration::from_millis(50)));
    }

    #[test]
    fn schedule_replaces_existing_deadline() {
        let mut timers = Timers::new();
        let now = Instant::now();
        timers.schedule(TimerKey::Liveness, now + Duration::from_millis(10));
        timers.schedule(TimerKey::Liveness, now + Duration::from_millis(100));
        assert!(timers.drain_expired(now + Duration::from_millis(50)).is_empty());
        assert_eq!(timers.deadline(&TimerKey::Liveness), Some(now + Duration::from_millis(100)));
    }

    #[test]
    fn cancel_where_removes_matching_keys() {
        let mut timers = Timers::new();
        let now = Instant::now();
        timers.schedule(TimerKey::Action("a1".into()), now);
        timers.schedule(TimerKey::Action("a2".into()), now);
        timers.schedule(TimerKey::Heartbeat, now);

        timers.cancel_where(|key| matches!(key, TimerKey::Action(_)));
        assert_eq!(timers.len(), 1);
        assert!(timers.is_scheduled(&TimerKey::Heartbeat));
    }
}
