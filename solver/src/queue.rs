//! The two-priority demon queue (`spec.md` §4.3).
//!
//! Demons are small descriptors — which constraint owns them, a priority, and a
//! payload the constraint interprets itself — not heap-allocated closures. The queue
//! only ever moves `DemonId`s around; the actual propagation work happens inside
//! [`crate::constraint::Constraint::propagate`].

use crate::create_ref_type;
use crate::collections::ref_store::RefVec;
use crate::constraint::PropagatorId;
use crate::vars::{EventKind, VarId};
use std::cell::Cell;
use std::collections::{HashMap, VecDeque};

create_ref_type!(DemonId);

/// Propagation priority. `Delayed` demons are meant for constraints that want to batch
/// several variable events before running one expensive sweep (Pack, PositiveTable).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Normal,
    Delayed,
}

/// Opaque payload a demon carries back to its owning constraint's `propagate`. Most
/// constraints use it to identify which of their own variables changed.
pub type Payload = u32;

struct DemonRecord {
    owner: PropagatorId,
    payload: Payload,
    priority: Priority,
    /// Last round-stamp at which this demon was enqueued; used to discard duplicate
    /// enqueues within the same propagation round without re-running the demon.
    stamp: Cell<u64>,
}

/// FIFO demon queue with per-demon round-level deduplication.
pub struct Queue {
    demons: RefVec<DemonId, DemonRecord>,
    normal: VecDeque<DemonId>,
    delayed: VecDeque<DemonId>,
    round_stamp: u64,
    watchers: HashMap<(VarId, EventKind), Vec<DemonId>>,
}

impl Default for Queue {
    fn default() -> Self {
        Self::new()
    }
}

impl Queue {
    pub fn new() -> Self {
        Queue {
            demons: RefVec::new(),
            normal: VecDeque::new(),
            delayed: VecDeque::new(),
            round_stamp: 1,
            watchers: HashMap::new(),
        }
    }

    /// Registers a new demon, owned by `owner`, carrying `payload`, run at `priority`.
    pub fn new_demon(&mut self, owner: PropagatorId, payload: Payload, priority: Priority) -> DemonId {
        self.demons.push(DemonRecord {
            owner,
            payload,
            priority,
            stamp: Cell::new(0),
        })
    }

    /// Subscribes `demon` to fire whenever `event` occurs on `var`.
    pub fn watch(&mut self, var: VarId, event: EventKind, demon: DemonId) {
        self.watchers.entry((var, event)).or_default().push(demon);
    }

    /// Fires every demon watching `(var, event)`.
    pub fn notify(&mut self, var: VarId, event: EventKind) {
        if let Some(demons) = self.watchers.get(&(var, event)) {
            for &d in demons {
                self.enqueue(d);
            }
        }
    }

    /// Enqueues `demon` unless it was already enqueued this round.
    pub fn enqueue(&mut self, demon: DemonId) {
        let rec = &self.demons[demon];
        if rec.stamp.get() == self.round_stamp {
            return;
        }
        rec.stamp.set(self.round_stamp);
        match rec.priority {
            Priority::Normal => self.normal.push_back(demon),
            Priority::Delayed => self.delayed.push_back(demon),
        }
    }

    /// Advances the round stamp, allowing every demon to be enqueued again, and clears
    /// any stale (failed-round) entries. Called once per top-level propagation round.
    pub fn begin_round(&mut self) {
        self.round_stamp += 1;
        self.normal.clear();
        self.delayed.clear();
    }

    /// Pops the next demon to run: NORMAL before DELAYED, FIFO within each.
    pub fn pop(&mut self) -> Option<(PropagatorId, Payload)> {
        let id = self.normal.pop_front().or_else(|| self.delayed.pop_front())?;
        let rec = &self.demons[id];
        Some((rec.owner, rec.payload))
    }

    pub fn is_empty(&self) -> bool {
        self.normal.is_empty() && self.delayed.is_empty()
    }

    /// Discards all pending work. Called on propagation failure (`spec.md` §4.3): both
    /// sub-queues are cleared before control returns to the caller.
    pub fn clear(&mut self) {
        self.normal.clear();
        self.delayed.clear();
    }
}
