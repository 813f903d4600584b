// src/gateway/room.rs
// Per-discussion subscriber fan-out and the `EventSink` the scheduler talks
// to, plus chunk-loss detection (spec §4.9): the room tracks how many
// characters it has forwarded for the in-flight turn and compares that
// against the final `message-complete` content length.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::model::Persona;
use crate::scheduler::{EventSink, OutboundEvent};

use super::message::WsServerMessage;
use super::session::SessionRegistry;

const CHUNK_LOSS_TOLERANCE: usize = 10;

struct TurnAccumulator {
    persona: Persona,
    turn: i64,
    chars_forwarded: usize,
}

/// Implements the Scheduler's `EventSink` seam by resolving a discussion's
/// subscriber set against the live session registry and enqueuing the wire
/// form of each event onto every subscriber's ordered outbound queue
/// (`Session::enqueue`) — fan-out across subscribers is best-effort and
/// unordered relative to each other, but each subscriber sees its own events
/// strictly in emit order (spec §4.9).
pub struct DiscussionRoom {
    registry: std::sync::Arc<SessionRegistry>,
    subscribers: Mutex<HashMap<Uuid, HashSet<Uuid>>>,
    in_flight: Mutex<HashMap<Uuid, TurnAccumulator>>,
}

impl DiscussionRoom {
    pub fn new(registry: std::sync::Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            subscribers: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self, discussion_id: Uuid, session_id: Uuid) {
        self.subscribers.lock().entry(discussion_id).or_default().insert(session_id);
    }

    pub fn unsubscribe_session(&self, session_id: Uuid) {
        let mut subs = self.subscribers.lock();
        for set in subs.values_mut() {
            set.remove(&session_id);
        }
        subs.retain(|_, set| !set.is_empty());
    }

    fn check_chunk_loss(&self, discussion_id: Uuid, response: &crate::model::Response) {
        let mut in_flight = self.in_flight.lock();
        let Some(acc) = in_flight.remove(&discussion_id) else { return };
        let final_len = response.content.chars().count();
        let forwarded = acc.chars_forwarded;
        if final_len > forwarded + CHUNK_LOSS_TOLERANCE {
            warn!(
                %discussion_id, persona = ?acc.persona, turn = acc.turn, forwarded, final_len,
                "chunk-loss detected: message-complete content exceeds accumulated chunks, treating final content as authoritative"
            );
        } else if forwarded > final_len + CHUNK_LOSS_TOLERANCE {
            warn!(
                %discussion_id, persona = ?acc.persona, turn = acc.turn, forwarded, final_len,
                "chunk-loss detected: accumulated chunks exceed final content, provider likely truncated; accumulated view wins"
            );
        }
    }
}

impl EventSink for DiscussionRoom {
    fn emit(&self, discussion_id: Uuid, event: OutboundEvent) {
        match &event {
            OutboundEvent::MessageStart { persona, turn } => {
                self.in_flight.lock().insert(
                    discussion_id,
                    TurnAccumulator { persona: *persona, turn: *turn, chars_forwarded: 0 },
                );
            }
            OutboundEvent::MessageChunk { chunk } => {
                if let Some(acc) = self.in_flight.lock().get_mut(&discussion_id) {
                    acc.chars_forwarded += chunk.chars().count();
                }
            }
            OutboundEvent::MessageComplete { response } => {
                self.check_chunk_loss(discussion_id, response);
            }
            _ => {}
        }

        let session_ids: Vec<Uuid> = self
            .subscribers
            .lock()
            .get(&discussion_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        if session_ids.is_empty() {
            return;
        }

        // Enqueuing is synchronous: every subscriber's queue receives this
        // event before `emit` returns, so events the scheduler emits in order
        // are pushed onto each session's queue in that same order. Each
        // session's single consumer task (spawned in `Session::new`) then
        // drains its queue strictly in receive order, which is what gives us
        // the per-subscriber ordering spec §4.9 requires — no per-event
        // `tokio::spawn` racing another for the connection's send lock.
        let wire = WsServerMessage::from_event(discussion_id, event);
        for id in session_ids {
            if let Some(session) = self.registry.get(id) {
                session.enqueue(wire.clone());
            } else {
                warn!(session_id = %id, "dropping event for subscriber no longer in the registry");
            }
        }
    }
}
