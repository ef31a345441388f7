// Ordered hand-off from room state to local fan-out.
//
// Every change to a room draws a ticket from the room's lane while the room
// (or element) lock is still held, so ticket order is application order.
// Recipients are resolved after the lock is dropped and the pushes are
// released strictly in ticket order. A ticket dropped without delivering
// releases its slot empty, so a lane never stalls behind it.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};

use easel_common::protocol::ws::ServerMessage;

use crate::outbound::OutboundQueue;

/// Messages released together under one ticket.
#[derive(Default)]
pub struct Delivery {
    pushes: Vec<(OutboundQueue, ServerMessage)>,
}

impl Delivery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, outbound: OutboundQueue, message: ServerMessage) {
        self.pushes.push((outbound, message));
    }

    pub fn push_all(&mut self, recipients: Vec<OutboundQueue>, message: &ServerMessage) {
        self.pushes.extend(recipients.into_iter().map(|outbound| (outbound, message.clone())));
    }

    pub fn is_empty(&self) -> bool {
        self.pushes.is_empty()
    }

    fn send(self) {
        for (outbound, message) in self.pushes {
            outbound.push(message);
        }
    }
}

#[derive(Default)]
struct LaneState {
    next_ticket: u64,
    next_release: u64,
    ready: BTreeMap<u64, Delivery>,
}

#[derive(Default)]
pub struct DeliveryLane {
    state: Mutex<LaneState>,
}

impl DeliveryLane {
    fn ticket(self: &Arc<Self>) -> Ticket {
        let mut state = self.state.lock().expect("delivery lane lock poisoned");
        let seq = state.next_ticket;
        state.next_ticket += 1;
        Ticket { lane: Some(Arc::clone(self)), seq, delivered: false }
    }

    fn release(&self, seq: u64, delivery: Delivery) {
        let mut state = self.state.lock().expect("delivery lane lock poisoned");
        state.ready.insert(seq, delivery);
        loop {
            let next = state.next_release;
            let Some(delivery) = state.ready.remove(&next) else {
                break;
            };
            delivery.send();
            state.next_release += 1;
        }
    }

    fn pending(&self) -> usize {
        let state = self.state.lock().expect("delivery lane lock poisoned");
        (state.next_ticket - state.next_release) as usize
    }
}

impl fmt::Debug for DeliveryLane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryLane").field("pending", &self.pending()).finish()
    }
}

/// A reserved position in a room's delivery order.
#[must_use = "a ticket holds back later deliveries of its room until delivered or dropped"]
pub struct Ticket {
    lane: Option<Arc<DeliveryLane>>,
    seq: u64,
    delivered: bool,
}

impl Ticket {
    /// A ticket outside any lane, for outcomes that touched no room state.
    pub fn detached() -> Self {
        Self { lane: None, seq: 0, delivered: false }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn deliver(mut self, delivery: Delivery) {
        self.delivered = true;
        match self.lane.take() {
            Some(lane) => lane.release(self.seq, delivery),
            None => delivery.send(),
        }
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if self.delivered {
            return;
        }
        if let Some(lane) = self.lane.take() {
            lane.release(self.seq, Delivery::default());
        }
    }
}

impl fmt::Debug for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ticket")
            .field("seq", &self.seq)
            .field("detached", &self.lane.is_none())
            .finish()
    }
}

/// A component outcome paired with its place in the room's delivery order.
#[derive(Debug)]
pub struct Sequenced<T> {
    pub outcome: T,
    pub ticket: Ticket,
}

impl<T> Sequenced<T> {
    pub fn into_parts(self) -> (T, Ticket) {
        (self.outcome, self.ticket)
    }
}

/// Per-room lanes shared by every component that changes room state.
#[derive(Clone, Default)]
pub struct DeliveryLanes {
    lanes: Arc<Mutex<HashMap<String, Arc<DeliveryLane>>>>,
}

impl DeliveryLanes {
    /// Draw the next ticket for a room. Call with the state lock held.
    pub fn ticket(&self, room_id: &str) -> Ticket {
        let lane = {
            let mut lanes = self.lanes.lock().expect("delivery lanes lock poisoned");
            Arc::clone(lanes.entry(room_id.to_string()).or_default())
        };
        lane.ticket()
    }

    pub fn sequenced<T>(&self, room_id: &str, outcome: T) -> Sequenced<T> {
        Sequenced { outcome, ticket: self.ticket(room_id) }
    }

    /// Forget a dropped room's lane. Outstanding tickets still release on it.
    pub fn remove(&self, room_id: &str) {
        self.lanes.lock().expect("delivery lanes lock poisoned").remove(room_id);
    }

    pub fn len(&self) -> usize {
        self.lanes.lock().expect("delivery lanes lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
