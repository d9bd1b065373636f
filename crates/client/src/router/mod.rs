// Event router: dedups inbound events, tracks remote typing state, and fans
// events out to per-kind subscribers.
//
// Handlers run synchronously inside `dispatch`, on the event-loop task,
// so they observe events in exactly the order the server sent them.

pub mod dedup;
pub mod typing;

use tokio::time::Instant;
use tracing::{debug, warn};

use courier_common::protocol::ws::{decode_frame, FrameError, ServerFrame};
use courier_common::types::{EventKind, EventPayload, InboundEvent};

use crate::config::RouterConfig;
use crate::timers::{TimerKey, Timers};

pub use dedup::DedupWindow;
pub use typing::TypingTracker;

pub type EventHandler = Box<dyn FnMut(&InboundEvent) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handed to `subscribers` handlers (possibly zero).
    Delivered { kind: EventKind, subscribers: usize },
    /// Already delivered inside the dedup window.
    Duplicate,
    /// Not an event frame; nothing to route.
    Ignored,
}

struct Subscriber {
    id: SubscriptionId,
    kind: EventKind,
    handler: EventHandler,
}

pub struct EventRouter {
    dedup: DedupWindow,
    typing: TypingTracker,
    subscribers: Vec<Subscriber>,
    next_id: u64,
}

impl EventRouter {
    pub fn new(config: &RouterConfig) -> Self {
        Self {
            dedup: DedupWindow::new(config.dedup_capacity, config.dedup_ttl()),
            typing: TypingTracker::new(config.typing_expiry()),
            subscribers: Vec::new(),
            next_id: 1,
        }
    }

    pub fn subscribe(&mut self, kind: EventKind, handler: EventHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.subscribers.push(Subscriber { id, kind, handler });
        debug!(subscription = id.0, kind = kind.as_str(), "subscriber added");
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|sub| sub.id != id);
        before != self.subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Route one event: drop it if seen, update typing state, fan out.
    pub fn dispatch(
        &mut self,
        event: &InboundEvent,
        now: Instant,
        timers: &mut Timers,
    ) -> DispatchOutcome {
        if let Some(key) = event.dedup_key() {
            if !self.dedup.insert(key, now) {
                debug!(kind = event.kind().as_str(), chat_id = ?event.chat_id, "dropping duplicate event");
                return DispatchOutcome::Duplicate;
            }
        }

        if let EventPayload::Typing { user_id, is_typing } = &event.payload {
            let chat = event.chat_id.as_deref().unwrap_or_default();
            if *is_typing {
                self.typing.start(chat, user_id, now);
            } else {
                self.typing.stop(chat, user_id);
            }
            self.reschedule_sweep(timers);
        }

        self.deliver(event)
    }

    /// Route a decoded frame. Only `Event` frames carry anything to route.
    pub fn dispatch_frame(
        &mut self,
        frame: &ServerFrame,
        now: Instant,
        timers: &mut Timers,
    ) -> DispatchOutcome {
        match frame {
            ServerFrame::Event(event) => self.dispatch(event, now, timers),
            ServerFrame::Unknown { kind } => {
                debug!(%kind, "ignoring unknown frame kind");
                DispatchOutcome::Ignored
            }
            _ => DispatchOutcome::Ignored,
        }
    }

    /// Decode and route raw text. Malformed frames are logged and returned
    /// as errors; the caller keeps the connection.
    pub fn dispatch_text(
        &mut self,
        text: &str,
        now: Instant,
        timers: &mut Timers,
    ) -> Result<DispatchOutcome, FrameError> {
        let frame = decode_frame(text).inspect_err(|error| {
            warn!(%error, "dropping malformed frame");
        })?;
        Ok(self.dispatch_frame(&frame, now, timers))
    }

    /// Sweep expired typing entries, delivering one synthetic stop per entry.
    pub fn expire_typing(&mut self, now: Instant, timers: &mut Timers) -> Vec<InboundEvent> {
        let expired = self.typing.expire(now);
        let mut stops = Vec::with_capacity(expired.len());
        for (chat, user_id) in expired {
            let event = InboundEvent {
                event_id: None,
                chat_id: (!chat.is_empty()).then_some(chat),
                payload: EventPayload::Typing { user_id, is_typing: false },
                server_timestamp: None,
                synthetic: true,
            };
            self.deliver(&event);
            stops.push(event);
        }
        self.reschedule_sweep(timers);
        stops
    }

    pub fn typing_users(&self, chat_id: &str, now: Instant) -> Vec<String> {
        self.typing.typing_users(chat_id, now)
    }

    /// Forget typing state, e.g. when the session ends.
    pub fn clear_typing(&mut self, timers: &mut Timers) {
        self.typing.clear();
        timers.cancel(&TimerKey::TypingSweep);
    }

    fn deliver(&mut self, event: &InboundEvent) -> DispatchOutcome {
        let kind = event.kind();
        let mut subscribers = 0;
        for sub in self.subscribers.iter_mut().filter(|sub| sub.kind == kind) {
            (sub.handler)(event);
            subscribers += 1;
        }
        DispatchOutcome::Delivered { kind, subscribers }
    }

    fn reschedule_sweep(&self, timers: &mut Timers) {
        match self.typing.next_deadline() {
            Some(at) => timers.schedule(TimerKey::TypingSweep, at),
            None => {
                timers.cancel(&TimerKey::TypingSweep);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn router() -> EventRouter {
        EventRouter::new(&RouterConfig {
            dedup_capacity: 16,
            dedup_ttl_ms: 60_000,
            typing_expiry_ms: 5_000,
        })
    }

    fn recorder(router: &mut EventRouter, kind: EventKind) -> Arc<Mutex<Vec<InboundEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        router.subscribe(
            kind,
            Box::new(move |event| sink.lock().expect("lock").push(event.clone())),
        );
        seen
    }

    #[test]
    fn message_with_event_id_is_delivered_once() {
        let mut router = router();
        let mut timers = Timers::new();
        let seen = recorder(&mut router, EventKind::Message);
        let now = Instant::now();
        let text = r#"{"type":"message","eventId":"e1","chatId":"42","message":{"content":"hi"}}"#;

        let first = router.dispatch_text(text, now, &mut timers).expect("valid frame");
        let second = router.dispatch_text(text, now, &mut timers).expect("valid frame");

        assert_eq!(first, DispatchOutcome::Delivered { kind: EventKind::Message, subscribers: 1 });
        assert_eq!(second, DispatchOutcome::Duplicate);
        assert_eq!(seen.lock().expect("lock").len(), 1);
    }

    #[test]
    fn subscribers_only_receive_their_kind() {
        let mut router = router();
        let mut timers = Timers::new();
        let messages = recorder(&mut router, EventKind::Message);
        let presence = recorder(&mut router, EventKind::Presence);

        router
            .dispatch_text(r#"{"type":"user_status","userId":"u2","userStatus":"online"}"#, Instant::now(), &mut timers)
            .expect("valid frame");

        assert!(messages.lock().expect("lock").is_empty());
        assert_eq!(presence.lock().expect("lock").len(), 1);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let mut router = router();
        let mut timers = Timers::new();
        let seen = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&seen);
        let id = router.subscribe(
            EventKind::Message,
            Box::new(move |_| *sink.lock().expect("lock") += 1),
        );
        assert!(router.unsubscribe(id));
        assert!(!router.unsubscribe(id));

        router
            .dispatch_text(r#"{"type":"message","chatId":"1","message":{"id":"m1","content":"x"}}"#, Instant::now(), &mut timers)
            .expect("valid frame");
        assert_eq!(*seen.lock().expect("lock"), 0);
    }

    #[test]
    fn malformed_and_unknown_frames_are_not_routed() {
        let mut router = router();
        let mut timers = Timers::new();
        let now = Instant::now();
        assert!(router.dispatch_text("{oops", now, &mut timers).is_err());
        assert_eq!(
            router.dispatch_text(r#"{"type":"sticker_pack"}"#, now, &mut timers),
            Ok(DispatchOutcome::Ignored)
        );
    }

    #[test]
    fn typing_expiry_emits_exactly_one_stop() {
        let mut router = router();
        let mut timers = Timers::new();
        let seen = recorder(&mut router, EventKind::Typing);
        let now = Instant::now();

        router
            .dispatch_text(r#"{"type":"typing","chatId":"42","userId":"u1","isTyping":true}"#, now, &mut timers)
            .expect("valid frame");
        assert_eq!(timers.deadline(&TimerKey::TypingSweep), Some(now + Duration::from_secs(5)));
        assert_eq!(router.typing_users("42", now), vec!["u1"]);

        let later = now + Duration::from_secs(5);
        let stops = router.expire_typing(later, &mut timers);
        assert_eq!(stops.len(), 1);
        assert!(stops[0].synthetic);
        assert!(router.expire_typing(later + Duration::from_secs(5), &mut timers).is_empty());
        assert!(!timers.is_scheduled(&TimerKey::TypingSweep));

        let seen = seen.lock().expect("lock");
        assert_eq!(seen.len(), 2);
        assert_eq!(
            seen[1].payload,
            EventPayload::Typing { user_id: "u1".into(), is_typing: false }
        );
    }

    #[test]
    fn explicit_stop_clears_typing_entry() {
        let mut router = router();
        let mut timers = Timers::new();
        let now = Instant::now();
        router
            .dispatch_text(r#"{"type":"typing","chatId":"42","userId":"u1","isTyping":true}"#, now, &mut timers)
            .expect("valid frame");
        router
            .dispatch_text(r#"{"type":"typing","chatId":"42","userId":"u1","isTyping":false}"#, now, &mut timers)
            .expect("valid frame");

        assert!(router.typing_users("42", now).is_empty());
        assert!(router.expire_typing(now + Duration::from_secs(10), &mut timers).is_empty());
    }
}
