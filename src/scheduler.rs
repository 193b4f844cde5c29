//! Delayed packet emission
//!
//! Some packets must reach clients later than the event that caused them,
//! such as the damage numbers of a multi-hit skill. An emission is stored
//! under its tick and built only when that tick fires, from the state of its
//! owner at that moment. Emissions of an owner that no longer exists are
//! dropped.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::broadcast::{Router, SendTarget};
use crate::error::RouterError;
use crate::net::session::SessionTable;
use crate::protocol::builders::{DamageInfo, OutboundPackets};
use crate::world::{BlockId, Entity, World};

/// Server time in milliseconds
pub type Tick = u64;

/// Builds a payload from the owner's state at send time
pub type EmitFn = Box<dyn FnOnce(&Entity) -> Option<Vec<u8>> + Send>;

/// Wake-up source for pending emissions
pub trait Timer {
    /// Ask to be woken at `at`
    fn add(&mut self, at: Tick);
}

/// Min-heap of deadlines polled by the server loop
#[derive(Debug, Default)]
pub struct TickTimer {
    deadlines: BinaryHeap<Reverse<Tick>>,
}

impl TickTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<Tick> {
        self.deadlines.peek().map(|Reverse(at)| *at)
    }

    /// Pop every deadline at or before `now`, without duplicates
    pub fn due(&mut self, now: Tick) -> Vec<Tick> {
        let mut due = Vec::new();
        while let Some(Reverse(at)) = self.deadlines.peek().copied() {
            if at > now {
                break;
            }
            self.deadlines.pop();
            if due.last() != Some(&at) {
                due.push(at);
            }
        }
        due
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

impl Timer for TickTimer {
    fn add(&mut self, at: Tick) {
        self.deadlines.push(Reverse(at));
    }
}

struct PendingEmission {
    owner: BlockId,
    target: SendTarget,
    builder: EmitFn,
}

/// One-shot delayed sends, keyed by tick
#[derive(Default)]
pub struct DelayedEmitter {
    pending: BTreeMap<Tick, Vec<PendingEmission>>,
}

impl DelayedEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send `builder`'s payload from `owner` to `target` at tick `at`
    ///
    /// A tick that is not in the future sends right away. Returns whether
    /// the payload went out now.
    #[allow(clippy::too_many_arguments)]
    pub fn schedule<W: World + ?Sized>(
        &mut self,
        world: &W,
        sessions: &mut SessionTable,
        router: &Router,
        timer: &mut dyn Timer,
        now: Tick,
        at: Tick,
        owner: BlockId,
        target: SendTarget,
        builder: EmitFn,
    ) -> Result<bool, RouterError> {
        if at <= now {
            let Some(entity) = world.entity(owner) else {
                debug!(owner, "Owner gone, dropping immediate emission");
                return Ok(false);
            };
            if let Some(payload) = builder(entity) {
                router.send(world, sessions, &payload, Some(entity), target)?;
            }
            return Ok(true);
        }

        self.pending.entry(at).or_default().push(PendingEmission {
            owner,
            target,
            builder,
        });
        timer.add(at);
        Ok(false)
    }

    /// Schedule a damage packet shown around its source
    #[allow(clippy::too_many_arguments)]
    pub fn schedule_damage<W: World + ?Sized>(
        &mut self,
        world: &W,
        sessions: &mut SessionTable,
        router: &Router,
        timer: &mut dyn Timer,
        packets: Arc<OutboundPackets>,
        now: Tick,
        at: Tick,
        info: DamageInfo,
    ) -> Result<bool, RouterError> {
        let builder: EmitFn = Box::new(move |_| match packets.damage(&info) {
            Ok(packet) => Some(packet),
            Err(e) => {
                warn!(src = info.src, error = %e, "Failed to build damage packet");
                None
            }
        });
        self.schedule(
            world,
            sessions,
            router,
            timer,
            now,
            at,
            info.src,
            SendTarget::Area,
            builder,
        )
    }

    /// Run every emission due at or before `tick`
    ///
    /// Returns the number of payloads sent. Emissions run in tick order,
    /// then in the order they were scheduled.
    pub fn fire<W: World + ?Sized>(
        &mut self,
        world: &W,
        sessions: &mut SessionTable,
        router: &Router,
        tick: Tick,
    ) -> usize {
        let later = match tick.checked_add(1) {
            Some(next) => self.pending.split_off(&next),
            None => BTreeMap::new(),
        };
        let due = std::mem::replace(&mut self.pending, later);

        let mut sent = 0;
        for (at, emissions) in due {
            for emission in emissions {
                let Some(owner) = world.entity(emission.owner) else {
                    debug!(owner = emission.owner, at, "Owner gone, dropping emission");
                    continue;
                };
                let Some(payload) = (emission.builder)(owner) else {
                    continue;
                };
                match router.send(world, sessions, &payload, Some(owner), emission.target) {
                    Ok(_) => sent += 1,
                    Err(e) => warn!(owner = emission.owner, at, error = %e, "Delayed emission failed"),
                }
            }
        }
        sent
    }

    /// Drop everything `owner` still has pending
    pub fn cancel_owner(&mut self, owner: BlockId) -> usize {
        let mut removed = 0;
        for emissions in self.pending.values_mut() {
            let before = emissions.len();
            emissions.retain(|e| e.owner != owner);
            removed += before - emissions.len();
        }
        self.pending.retain(|_, emissions| !emissions.is_empty());
        if removed > 0 {
            debug!(owner, removed, "Cancelled pending emissions");
        }
        removed
    }

    /// Number of emissions still waiting
    pub fn pending(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }
}

impl std::fmt::Debug for DelayedEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayedEmitter")
            .field("ticks", &self.pending.keys().collect::<Vec<_>>())
            .field("pending", &self.pending())
            .finish()
    }
}
