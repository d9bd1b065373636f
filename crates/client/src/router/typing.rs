// Remote typing indicators: chat → user → deadline.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
pub struct TypingTracker {
    expiry: Duration,
    chats: HashMap<String, BTreeMap<String, Instant>>,
}

impl TypingTracker {
    pub fn new(expiry: Duration) -> Self {
        Self { expiry, chats: HashMap::new() }
    }

    /// (Re)arm the entry for `user` in `chat`. Returns its new deadline.
    pub fn start(&mut self, chat: &str, user: &str, now: Instant) -> Instant {
        let deadline = now + self.expiry;
        self.chats.entry(chat.to_string()).or_default().insert(user.to_string(), deadline);
        deadline
    }

    pub fn stop(&mut self, chat: &str, user: &str) -> bool {
        let Some(users) = self.chats.get_mut(chat) else {
            return false;
        };
        let removed = users.remove(user).is_some();
        if users.is_empty() {
            self.chats.remove(chat);
        }
        removed
    }

    /// Remove every entry whose deadline has passed, sorted by chat then user.
    pub fn expire(&mut self, now: Instant) -> Vec<(String, String)> {
        let mut expired = Vec::new();
        self.chats.retain(|chat, users| {
            users.retain(|user, deadline| {
                if *deadline <= now {
                    expired.push((chat.clone(), user.clone()));
                    false
                } else {
                    true
                }
            });
            !users.is_empty()
        });
        expired.sort();
        expired
    }

    /// Users currently typing in `chat`. Stale entries are skipped, not removed.
    pub fn typing_users(&self, chat: &str, now: Instant) -> Vec<String> {
        self.chats
            .get(chat)
            .map(|users| {
                users
                    .iter()
                    .filter(|(_, deadline)| **deadline > now)
                    .map(|(user, _)| user.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.chats.values().flat_map(|users| users.values()).min().copied()
    }

    pub fn clear(&mut self) {
        self.chats.clear();
    }
}
