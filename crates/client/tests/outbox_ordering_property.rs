use std::collections::{HashMap, HashSet};
use std::time::Duration;

use courier_client::backoff::BackoffPolicy;
use courier_client::config::OutboxConfig;
use courier_client::outbox::{ActionState, Intent, OutboundAction, OutboundQueue};
use courier_client::timers::Timers;
use courier_client::transport::{FrameSink, SendFailure};
use courier_common::protocol::ws::{AckResult, ActionAck, ClientFrame};
use proptest::prelude::*;
use tokio::time::Instant;

const CHATS: [&str; 3] = ["1", "2", "3"];

#[derive(Default)]
struct Wire {
    /// (chat id, action id) in write order.
    writes: Vec<(String, String)>,
}

impl FrameSink for Wire {
    fn send_frame(&mut self, frame: &ClientFrame) -> Result<(), SendFailure> {
        if let ClientFrame::Message { action_id, chat_id, .. } = frame {
            self.writes.push((chat_id.clone(), action_id.clone()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum Op {
    Enqueue(usize),
    AckHead(usize, bool),
    ReackSettled(usize),
    TimeoutHead(usize),
    Disconnect,
    Flush,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..CHATS.len()).prop_map(Op::Enqueue),
        3 => (0..CHATS.len(), any::<bool>()).prop_map(|(chat, dup)| Op::AckHead(chat, dup)),
        1 => any::<usize>().prop_map(Op::ReackSettled),
        1 => (0..CHATS.len()).prop_map(Op::TimeoutHead),
        1 => Just(Op::Disconnect),
        3 => Just(Op::Flush),
    ]
}

fn ack(action_id: &str, duplicate: bool) -> ActionAck {
    ActionAck {
        action_id: action_id.to_string(),
        result: if duplicate { AckResult::Duplicate } else { AckResult::Applied },
        reason: None,
        message_id: None,
    }
}

fn in_flight_head(queue: &OutboundQueue, chat: &str) -> Option<String> {
    let head = queue.queued_ids(chat).first().map(|id| id.to_string())?;
    (queue.get(&head)?.state == ActionState::InFlight).then_some(head)
}

proptest! {
    #[test]
    fn per_chat_order_survives_acks_timeouts_and_disconnects(ops in prop::collection::vec(op(), 1..200)) {
        let config = OutboxConfig { max_per_chat: 1_000, ack_timeout_ms: 10, max_attempts: 3 };
        let retry = BackoffPolicy {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            max_attempts: 3,
            jitter: 0.0,
        };
        let mut queue = OutboundQueue::new(&config, retry);
        let mut timers = Timers::new();
        let mut wire = Wire::default();
        let now = Instant::now();

        let mut position: HashMap<String, usize> = HashMap::new();
        let mut settled_ids: Vec<String> = Vec::new();
        let mut settled_once: HashSet<String> = HashSet::new();
        let mut next = 0usize;

        for op in ops {
            match op {
                Op::Enqueue(chat) => {
                    let id = format!("a{next}");
                    position.insert(id.clone(), next);
                    next += 1;
                    queue.enqueue(
                        OutboundAction::with_id(id, Intent::message(CHATS[chat], "x"), now),
                        &mut timers,
                    );
                }
                Op::AckHead(chat, duplicate) => {
                    if let Some(head) = in_flight_head(&queue, CHATS[chat]) {
                        prop_assert!(queue.on_ack(&ack(&head, duplicate), &mut timers));
                    }
                }
                Op::ReackSettled(pick) => {
                    if !settled_ids.is_empty() {
                        let id = settled_ids[pick % settled_ids.len()].clone();
                        prop_assert!(!queue.on_ack(&ack(&id, false), &mut timers));
                    }
                }
                Op::TimeoutHead(chat) => {
                    if let Some(head) = in_flight_head(&queue, CHATS[chat]) {
                        queue.on_timer(&head, now, &mut timers);
                        queue.on_timer(&head, now, &mut timers);
                    }
                }
                Op::Disconnect => queue.on_disconnect(&mut timers),
                Op::Flush => {
                    queue.flush(&mut wire, now, &mut timers);
                }
            }

            for settled in queue.take_settled() {
                prop_assert!(settled_once.insert(settled.action_id.clone()), "settled twice");
                settled_ids.push(settled.action_id);
            }
        }

        for chat in CHATS {
            let mut highest = 0usize;
            for (_, id) in wire.writes.iter().filter(|(c, _)| c == chat) {
                let pos = position[id];
                prop_assert!(pos >= highest, "chat {chat}: {id} written after a later action");
                highest = pos;
            }
        }
    }
}
