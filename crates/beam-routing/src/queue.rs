//! Time-ordered handover replay
//!
//! Events run in simulated-time order, FIFO between equal times. A
//! terminal can have at most one handover pending; a second one is
//! refused until the first has run.

use crate::channels::BeamDelays;
use crate::handover::{ConvergenceError, HandoverKind, HandoverRouteConvergence, Result};
use sat_netstack::{Mac48Address, Network, RoleDirectory};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoverEvent {
    pub at: Duration,
    pub terminal: Mac48Address,
    pub new_gateway: Mac48Address,
}

/// One executed handover
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoverRecord {
    pub at: Duration,
    pub terminal: Mac48Address,
    pub ut_id: Option<u32>,
    pub old_gateway: Mac48Address,
    pub new_gateway: Mac48Address,
    pub kind: HandoverKind,
}

#[derive(Debug, Default)]
pub struct HandoverQueue {
    heap: BinaryHeap<Reverse<(Duration, u64)>>,
    events: HashMap<u64, HandoverEvent>,
    next_seq: u64,
    pending: HashSet<Mac48Address>,
    serving: HashMap<Mac48Address, Mac48Address>,
    now: Duration,
    log: Vec<HandoverRecord>,
}

impl HandoverQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> Duration {
        self.now
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Time of the earliest queued event
    pub fn next_due(&self) -> Option<Duration> {
        self.heap.peek().map(|Reverse((at, _))| *at)
    }

    pub fn is_pending(&self, terminal: &Mac48Address) -> bool {
        self.pending.contains(terminal)
    }

    pub fn set_serving(&mut self, terminal: Mac48Address, gateway: Mac48Address) {
        self.serving.insert(terminal, gateway);
    }

    pub fn serving(&self, terminal: &Mac48Address) -> Option<Mac48Address> {
        self.serving.get(terminal).copied()
    }

    pub fn log(&self) -> &[HandoverRecord] {
        &self.log
    }

    /// Queue a handover; times in the past run at the current time
    pub fn schedule(
        &mut self,
        at: Duration,
        terminal: Mac48Address,
        new_gateway: Mac48Address,
    ) -> Result<()> {
        if !self.serving.contains_key(&terminal) {
            return Err(ConvergenceError::NotServed(terminal));
        }
        if !self.pending.insert(terminal) {
            return Err(ConvergenceError::HandoverInProgress(terminal));
        }

        let at = at.max(self.now);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.events.insert(
            seq,
            HandoverEvent {
                at,
                terminal,
                new_gateway,
            },
        );
        self.heap.push(Reverse((at, seq)));
        debug!("scheduled handover of {} to {} at {:?}", terminal, new_gateway, at);
        Ok(())
    }

    /// Run every event due at or before `until`. Stops at the first failed
    /// handover; that event is consumed and the terminal released.
    pub fn run_until<D: RoleDirectory>(
        &mut self,
        until: Duration,
        network: &mut Network,
        delays: &dyn BeamDelays,
        convergence: &mut HandoverRouteConvergence<D>,
    ) -> Result<usize> {
        let mut executed = 0;
        while let Some(Reverse((at, seq))) = self.heap.peek().copied() {
            if at > until {
                break;
            }
            self.heap.pop();
            self.now = at;
            let event = match self.events.remove(&seq) {
                Some(event) => event,
                None => continue,
            };

            let outcome = self.execute(&event, network, delays, convergence);
            self.pending.remove(&event.terminal);
            self.log.push(outcome?);
            executed += 1;
        }
        self.now = self.now.max(until);
        info!("ran {} handovers up to {:?}", executed, self.now);
        Ok(executed)
    }

    fn execute<D: RoleDirectory>(
        &mut self,
        event: &HandoverEvent,
        network: &mut Network,
        delays: &dyn BeamDelays,
        convergence: &mut HandoverRouteConvergence<D>,
    ) -> Result<HandoverRecord> {
        let old_gateway = self
            .serving(&event.terminal)
            .ok_or(ConvergenceError::NotServed(event.terminal))?;
        let kind = convergence.handover(
            network,
            delays,
            &event.terminal,
            &old_gateway,
            &event.new_gateway,
        )?;
        self.serving.insert(event.terminal, event.new_gateway);

        Ok(HandoverRecord {
            at: event.at,
            terminal: event.terminal,
            ut_id: convergence.directory().terminal_id(&event.terminal),
            old_gateway,
            new_gateway: event.new_gateway,
            kind,
        })
    }
}
