//! Bounded pool of reusable isolates

use crate::clock::{IsolateId, MonoClock};
use crate::config::PoolConfig;
use crate::engine::{EngineIsolate, Interrupt, ScriptEngine};
use crate::error::{EngineError, Exhaustion, SandboxError, SandboxResult};
use crate::lock_unpoisoned;
use crate::policy::SandboxPolicy;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// How long `acquire` waits between looks at the idle list while another
/// isolate is being created or returned
const IDLE_POLL: Duration = Duration::from_millis(1);

/// Point-in-time view of the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub idle: usize,
    pub borrowed: usize,
    pub live: usize,
    pub created: u64,
    pub discarded: u64,
    pub closed: bool,
}

struct Slot<I> {
    id: IsolateId,
    isolate: I,
}

struct Shared<E: ScriptEngine> {
    engine: E,
    policy: SandboxPolicy,
    capacity: usize,
    acquire_timeout: Duration,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Slot<E::Isolate>>>,
    borrowed: Mutex<HashMap<IsolateId, Arc<dyn Interrupt>>>,
    closed: AtomicBool,
    live: AtomicUsize,
    created: AtomicU64,
    discarded: AtomicU64,
}

impl<E: ScriptEngine> Shared<E> {
    fn destroy(&self, slot: Slot<E::Isolate>) {
        tracing::debug!(isolate_id = %slot.id, "Destroying isolate");
        slot.isolate.destroy();
        self.live.fetch_sub(1, Ordering::SeqCst);
    }

    /// Reserve room for one more live isolate
    fn reserve(self: &Arc<Self>) -> Option<Reservation<E>> {
        self.live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| {
                (live < self.capacity).then_some(live + 1)
            })
            .ok()
            .map(|_| Reservation {
                shared: Arc::clone(self),
                committed: false,
            })
    }

    fn take_idle(&self) -> Option<Slot<E::Isolate>> {
        lock_unpoisoned(&self.idle).pop()
    }
}

/// A counted but not yet created isolate. Gives the slot back unless committed.
struct Reservation<E: ScriptEngine> {
    shared: Arc<Shared<E>>,
    committed: bool,
}

impl<E: ScriptEngine> Reservation<E> {
    /// The reserved slot now belongs to a live isolate
    fn commit(mut self) {
        self.committed = true;
    }
}

impl<E: ScriptEngine> Drop for Reservation<E> {
    fn drop(&mut self) {
        if !self.committed {
            self.shared.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Owns every isolate. Hands them out one caller at a time.
///
/// Isolates are created lazily, reused while healthy and never exceed `capacity`.
pub struct IsolateManager<E: ScriptEngine> {
    shared: Arc<Shared<E>>,
}

impl<E: ScriptEngine> Clone for IsolateManager<E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<E: ScriptEngine> IsolateManager<E> {
    /// `policy` fixes the hard limits of every isolate the pool creates
    pub fn new(engine: E, policy: SandboxPolicy, config: &PoolConfig) -> SandboxResult<Self> {
        if config.capacity == 0 {
            return Err(SandboxError::Configuration(
                "pool capacity must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            shared: Arc::new(Shared {
                engine,
                policy,
                capacity: config.capacity,
                acquire_timeout: config.acquire_timeout,
                permits: Arc::new(Semaphore::new(config.capacity)),
                idle: Mutex::new(Vec::new()),
                borrowed: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                live: AtomicUsize::new(0),
                created: AtomicU64::new(0),
                discarded: AtomicU64::new(0),
            }),
        })
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn engine(&self) -> &E {
        &self.shared.engine
    }

    /// Borrow an isolate, waiting up to the acquire timeout for one to free up.
    pub async fn acquire(&self) -> SandboxResult<IsolateLease<E>> {
        let shared = &self.shared;
        let started = MonoClock::now();

        let permit = match tokio::time::timeout(
            shared.acquire_timeout,
            Arc::clone(&shared.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(SandboxError::PoolExhausted(Exhaustion::Closed)),
            Err(_) => {
                let waited_ms = MonoClock::elapsed_ms(started);
                tracing::warn!(
                    capacity = shared.capacity,
                    waited_ms,
                    "No isolate available"
                );
                return Err(SandboxError::PoolExhausted(Exhaustion::Timeout { waited_ms }));
            }
        };

        let slot = loop {
            if let Some(slot) = shared.take_idle() {
                break slot;
            }
            if let Some(reservation) = shared.reserve() {
                break self.create(reservation).await?;
            }
            if shared.closed.load(Ordering::SeqCst) {
                return Err(SandboxError::PoolExhausted(Exhaustion::Closed));
            }
            let waited_ms = MonoClock::elapsed_ms(started);
            if u128::from(waited_ms) >= shared.acquire_timeout.as_millis() {
                tracing::warn!(
                    capacity = shared.capacity,
                    waited_ms,
                    "No isolate came back before the acquire timeout"
                );
                return Err(SandboxError::PoolExhausted(Exhaustion::Timeout { waited_ms }));
            }
            // An isolate is being created or is on its way back to the idle list
            tokio::time::sleep(IDLE_POLL).await;
        };

        {
            let mut borrowed = lock_unpoisoned(&shared.borrowed);
            if !shared.closed.load(Ordering::SeqCst) {
                borrowed.insert(slot.id, slot.isolate.interrupter());
                drop(borrowed);
                tracing::debug!(isolate_id = %slot.id, "Isolate acquired");
                return Ok(IsolateLease {
                    id: slot.id,
                    shared: Arc::clone(shared),
                    slot: Some(slot),
                    permit: Some(permit),
                    discard: false,
                });
            }
        }

        shared.destroy(slot);
        Err(SandboxError::PoolExhausted(Exhaustion::Closed))
    }

    /// Create an isolate in the live slot held by `reservation`.
    ///
    /// The reservation travels with the blocking task, so a caller that gives up
    /// mid-creation frees the slot once the orphaned isolate is dropped.
    async fn create(&self, reservation: Reservation<E>) -> SandboxResult<Slot<E::Isolate>> {
        let shared = Arc::clone(&self.shared);
        let created = tokio::task::spawn_blocking(move || -> Result<_, EngineError> {
            let isolate = shared.engine.create_isolate(&shared.policy)?;
            Ok((isolate, reservation))
        })
        .await;

        let isolate = match created {
            Ok(Ok((isolate, reservation))) => {
                reservation.commit();
                isolate
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Failed to create isolate");
                return Err(SandboxError::PoolExhausted(Exhaustion::Engine(e.0)));
            }
            Err(e) => {
                return Err(SandboxError::PoolExhausted(Exhaustion::Engine(format!(
                    "isolate creation panicked: {}",
                    e
                ))));
            }
        };

        let id = IsolateId::new();
        self.shared.created.fetch_add(1, Ordering::SeqCst);
        tracing::info!(
            isolate_id = %id,
            engine = self.shared.engine.name(),
            live = self.shared.live.load(Ordering::SeqCst),
            "Isolate created"
        );
        Ok(Slot { id, isolate })
    }

    /// Return a borrowed isolate. Same as dropping the lease.
    pub fn release(&self, lease: IsolateLease<E>) {
        drop(lease);
    }

    /// Shut the pool down: interrupt borrowed isolates, destroy idle ones.
    /// Every later `acquire` fails fast.
    pub fn close_all(&self) {
        let shared = &self.shared;
        let interrupted: Vec<_> = {
            let mut borrowed = lock_unpoisoned(&shared.borrowed);
            shared.closed.store(true, Ordering::SeqCst);
            shared.permits.close();
            borrowed.drain().collect()
        };
        for (id, interrupter) in &interrupted {
            tracing::debug!(isolate_id = %id, "Interrupting borrowed isolate");
            interrupter.interrupt();
        }

        let idle = std::mem::take(&mut *lock_unpoisoned(&shared.idle));
        let destroyed = idle.len();
        for slot in idle {
            shared.destroy(slot);
        }

        tracing::info!(
            interrupted = interrupted.len(),
            destroyed,
            "Isolate pool closed"
        );
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn is_borrowed(&self, id: IsolateId) -> bool {
        lock_unpoisoned(&self.shared.borrowed).contains_key(&id)
    }

    pub fn stats(&self) -> PoolStats {
        let shared = &self.shared;
        PoolStats {
            capacity: shared.capacity,
            idle: lock_unpoisoned(&shared.idle).len(),
            borrowed: lock_unpoisoned(&shared.borrowed).len(),
            live: shared.live.load(Ordering::SeqCst),
            created: shared.created.load(Ordering::SeqCst),
            discarded: shared.discarded.load(Ordering::SeqCst),
            closed: shared.closed.load(Ordering::SeqCst),
        }
    }
}

/// Exclusive use of one pooled isolate. Returned to the pool on drop.
pub struct IsolateLease<E: ScriptEngine> {
    id: IsolateId,
    shared: Arc<Shared<E>>,
    slot: Option<Slot<E::Isolate>>,
    permit: Option<OwnedSemaphorePermit>,
    discard: bool,
}

impl<E: ScriptEngine> IsolateLease<E> {
    pub fn id(&self) -> IsolateId {
        self.id
    }

    /// Handle that stops whatever the leased isolate is running
    pub fn interrupter(&self) -> Option<Arc<dyn Interrupt>> {
        self.slot.as_ref().map(|slot| slot.isolate.interrupter())
    }

    pub fn isolate(&self) -> Option<&E::Isolate> {
        self.slot.as_ref().map(|slot| &slot.isolate)
    }

    pub fn isolate_mut(&mut self) -> Option<&mut E::Isolate> {
        self.slot.as_mut().map(|slot| &mut slot.isolate)
    }

    /// Destroy the isolate on release instead of returning it to the pool
    pub fn discard(&mut self) {
        self.discard = true;
    }

    fn finish(&mut self) {
        let Some(slot) = self.slot.take() else {
            return;
        };
        let shared = &self.shared;

        let discard = self.discard || std::thread::panicking() || slot.isolate.is_corrupted();
        let was_borrowed = lock_unpoisoned(&shared.borrowed).remove(&slot.id).is_some();

        if discard {
            shared.discarded.fetch_add(1, Ordering::SeqCst);
            tracing::info!(isolate_id = %slot.id, "Isolate discarded");
            shared.destroy(slot);
        } else if !was_borrowed {
            // Reclaimed by close_all
            shared.destroy(slot);
        } else {
            let mut idle = lock_unpoisoned(&shared.idle);
            if shared.closed.load(Ordering::SeqCst) {
                drop(idle);
                shared.destroy(slot);
            } else {
                tracing::debug!(isolate_id = %slot.id, "Isolate returned to pool");
                idle.push(slot);
            }
        }

        self.permit.take();
    }
}

impl<E: ScriptEngine> Drop for IsolateLease<E> {
    fn drop(&mut self) {
        self.finish();
    }
}
