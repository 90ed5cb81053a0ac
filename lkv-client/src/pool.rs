//! # Per-Node Connection Pool
//!
//! Purpose: Reuse TCP connections to one node, growing on demand up to a hard
//! cap and queueing a bounded number of callers once the cap is reached.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: A fixed slot table sized to `max_pool_size`;
//!    each slot holds at most one `Connection`.
//! 2. **Lock-Free Fast Path**: Free slot indices live in a `SlotRing`;
//!    checkout pops an index and locks only that slot.
//! 3. **Move Semantics for Exclusivity**: A checked-out connection is moved out
//!    of its slot into the caller's `PooledConnection`, so two callers can
//!    never hold the same connection.
//! 4. **Direct Handoff**: On checkin with callers waiting, the slot goes
//!    straight to one waiter instead of back to the ring.
//! 5. **Deadline-Scoped Waiting**: A waiter leaves the queue under the same
//!    lock that handoffs take, so an expired waiter is never handed a slot.
//!
//! ## Structure Overview
//!
//! ```text
//! Pool
//!   └── shared: Arc<PoolShared>
//!         ├── slots: [Mutex<Slot>; max_pool_size]
//!         │     └── Slot { conn, state: Empty|Pending|Idle|InUse, last_returned }
//!         ├── available: SlotRing          (indices of Idle slots)
//!         ├── size: AtomicUsize            (non-Empty slots)
//!         ├── queue: Mutex<WaitQueue> + Condvar
//!         │     ├── waiting: VecDeque<ticket>
//!         │     └── delivered: ticket -> slot index
//!         └── maintenance: background thread (evict, ping, top up)
//! ```
//!
//! ## Invariants
//! - An index is in `available` exactly when its slot is `Idle`.
//! - `Idle + InUse + Pending == size <= max_pool_size`.
//! - `release` pushes to `available` only while holding the queue lock, so a
//!   caller that re-checks the ring under that lock cannot miss a checkin.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use lkv_common::{BusyReason, HandoffPolicy, LkvError, LkvResult, NodeConfig, Value};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::codec::Reply;
use crate::connection::Connection;
use crate::ring::SlotRing;

/// Consecutive failed replacements after which the pool reports unhealthy.
const UNHEALTHY_AFTER: usize = 3;

/// Bounds for the maintenance thread's wake-up period.
const MIN_MAINTENANCE_TICK: Duration = Duration::from_millis(10);
const MAX_MAINTENANCE_TICK: Duration = Duration::from_secs(1);

/// Stand-in deadline for timeouts too large to add to `Instant::now()`.
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Pool lifecycle. Transitions are one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolStatus {
    Uninitialized,
    Running,
    Stopped,
}

impl PoolStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PoolStatus::Uninitialized,
            1 => PoolStatus::Running,
            _ => PoolStatus::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            PoolStatus::Uninitialized => 0,
            PoolStatus::Running => 1,
            PoolStatus::Stopped => 2,
        }
    }
}

/// Point-in-time pool counters.
///
/// Slots are sampled one at a time, so the snapshot is exact only when the
/// pool is quiescent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub status: PoolStatus,
    /// Tracked connections: idle + in use + pending.
    pub size: usize,
    pub available: usize,
    pub in_use: usize,
    /// Slots being opened or replaced.
    pub pending: usize,
    /// Callers blocked in checkout.
    pub waiting: usize,
    pub healthy: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Empty,
    Pending,
    Idle,
    InUse,
}

struct Slot {
    conn: Option<Connection>,
    state: SlotState,
    last_returned: Instant,
}

impl Slot {
    fn empty() -> Self {
        Slot {
            conn: None,
            state: SlotState::Empty,
            last_returned: Instant::now(),
        }
    }
}

#[derive(Default)]
struct WaitQueue {
    waiting: VecDeque<u64>,
    delivered: HashMap<u64, usize>,
    next_ticket: u64,
}

impl WaitQueue {
    fn leave(&mut self, ticket: u64) {
        self.waiting.retain(|&queued| queued != ticket);
    }
}

enum WaitOutcome {
    Slot(usize),
    Retry,
}

/// Stop flag the maintenance thread sleeps on.
struct StopSignal {
    stopped: Mutex<bool>,
    cv: Condvar,
}

impl StopSignal {
    fn new() -> Self {
        StopSignal {
            stopped: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    /// Sleeps up to `period`; returns true once a stop was requested.
    fn wait(&self, period: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if !*stopped {
            self.cv.wait_for(&mut stopped, period);
        }
        *stopped
    }

    fn trigger(&self) {
        *self.stopped.lock() = true;
        self.cv.notify_all();
    }
}

struct Maintenance {
    signal: Arc<StopSignal>,
    join: JoinHandle<()>,
}

struct PoolShared {
    node: String,
    config: Arc<NodeConfig>,
    status: AtomicU8,
    slots: Box<[Mutex<Slot>]>,
    available: SlotRing,
    size: AtomicUsize,
    // Serializes growth so concurrent callers cannot overshoot the cap.
    grow_lock: Mutex<()>,
    queue: Mutex<WaitQueue>,
    handoff_cv: Condvar,
    healthy: AtomicBool,
    failed_replacements: AtomicUsize,
}

/// Connection pool for one node.
///
/// Lifecycle: `new` (Uninitialized) → `start` (Running) → `stop` (Stopped).
/// Dropping the pool stops it.
pub struct Pool {
    shared: Arc<PoolShared>,
    maintenance: Mutex<Option<Maintenance>>,
}

impl Pool {
    /// Validates `config` and allocates the slot table. No I/O happens here.
    pub fn new(config: NodeConfig) -> LkvResult<Self> {
        config.validate()?;
        let max = config.max_pool_size;
        let slots = (0..max)
            .map(|_| Mutex::new(Slot::empty()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Pool {
            shared: Arc::new(PoolShared {
                node: config.id(),
                config: Arc::new(config),
                status: AtomicU8::new(PoolStatus::Uninitialized.as_u8()),
                slots,
                available: SlotRing::with_capacity(max),
                size: AtomicUsize::new(0),
                grow_lock: Mutex::new(()),
                queue: Mutex::new(WaitQueue::default()),
                handoff_cv: Condvar::new(),
                healthy: AtomicBool::new(true),
                failed_replacements: AtomicUsize::new(0),
            }),
            maintenance: Mutex::new(None),
        })
    }

    /// Node identifier, `host:port`.
    pub fn node_id(&self) -> &str {
        &self.shared.node
    }

    pub fn config(&self) -> &NodeConfig {
        &self.shared.config
    }

    pub fn status(&self) -> PoolStatus {
        self.shared.status()
    }

    pub fn is_healthy(&self) -> bool {
        self.shared.healthy.load(Ordering::Acquire)
    }

    /// Opens `min_pool_size` connections and starts background maintenance.
    ///
    /// Any failed open aborts the start: connections opened so far are closed
    /// and the pool stays `Uninitialized`.
    pub fn start(&self) -> LkvResult<()> {
        let shared = &self.shared;
        let _growth = shared.grow_lock.lock();
        let status = shared.status();
        if status != PoolStatus::Uninitialized {
            return Err(LkvError::Config(format!(
                "{}: pool cannot start from {:?}",
                shared.node, status
            )));
        }

        let min = shared.config.min_pool_size;
        let mut opened = Vec::with_capacity(min);
        for _ in 0..min {
            match shared.open_slot() {
                Ok(idx) => opened.push(idx),
                Err(err) => {
                    for idx in opened {
                        shared.discard(idx);
                    }
                    error!(node = %shared.node, error = %err, "pool start aborted");
                    return Err(err);
                }
            }
        }

        {
            let _queue = shared.queue.lock();
            shared.set_status(PoolStatus::Running);
        }
        for idx in opened {
            shared.release(idx);
        }

        let signal = Arc::new(StopSignal::new());
        let join = {
            let shared = Arc::clone(shared);
            let signal = Arc::clone(&signal);
            std::thread::Builder::new()
                .name(format!("lkv-pool-{}", shared.node))
                .spawn(move || shared.maintenance_loop(&signal))?
        };
        *self.maintenance.lock() = Some(Maintenance { signal, join });

        info!(node = %shared.node, size = min, max = shared.config.max_pool_size, "pool started");
        Ok(())
    }

    /// Checks out a connection, waiting up to `get_client_timeout`.
    pub fn checkout(&self) -> LkvResult<PooledConnection> {
        self.checkout_timeout(self.shared.config.get_client_timeout)
    }

    /// Checks out a connection, waiting up to `timeout` once the pool is full.
    ///
    /// A zero timeout never waits. Fails with `PoolBusy(QueueFull)` when
    /// `max_wait_size` callers are already waiting and with
    /// `PoolBusy(TimedOut)` when no connection frees up in time.
    pub fn checkout_timeout(&self, timeout: Duration) -> LkvResult<PooledConnection> {
        let shared = &self.shared;
        let now = Instant::now();
        let deadline = now.checked_add(timeout).unwrap_or(now + FAR_FUTURE);

        loop {
            shared.ensure_running()?;

            if let Some(handle) = shared.try_take() {
                return Ok(handle);
            }

            if shared.size.load(Ordering::Acquire) < shared.config.max_pool_size {
                shared.grow()?;
                if let Some(handle) = shared.try_take() {
                    return Ok(handle);
                }
            }

            match shared.wait_for_slot(deadline)? {
                WaitOutcome::Slot(idx) => {
                    if let Some(handle) = shared.claim(idx) {
                        return Ok(handle);
                    }
                }
                WaitOutcome::Retry => {}
            }
        }
    }

    /// Stops the pool: wakes waiters, ends maintenance and closes idle
    /// connections. Checked-out connections are closed at checkin.
    pub fn stop(&self) {
        let shared = &self.shared;
        {
            let _queue = shared.queue.lock();
            if shared.status() == PoolStatus::Stopped {
                return;
            }
            shared.set_status(PoolStatus::Stopped);
            shared.handoff_cv.notify_all();
        }

        if let Some(maintenance) = self.maintenance.lock().take() {
            maintenance.signal.trigger();
            if maintenance.join.join().is_err() {
                error!(node = %shared.node, "maintenance thread panicked");
            }
        }

        let mut closed = 0usize;
        while let Some(idx) = shared.available.pop() {
            shared.discard(idx);
            closed += 1;
        }
        info!(node = %shared.node, closed, "pool stopped");
    }

    pub fn stats(&self) -> PoolStats {
        let shared = &self.shared;
        let mut stats = PoolStats {
            status: shared.status(),
            size: shared.size.load(Ordering::Acquire),
            available: 0,
            in_use: 0,
            pending: 0,
            waiting: shared.queue.lock().waiting.len(),
            healthy: shared.healthy.load(Ordering::Acquire),
        };
        for slot in shared.slots.iter() {
            match slot.lock().state {
                SlotState::Idle => stats.available += 1,
                SlotState::InUse => stats.in_use += 1,
                SlotState::Pending => stats.pending += 1,
                SlotState::Empty => {}
            }
        }
        stats
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.stop();
    }
}

impl PoolShared {
    fn status(&self) -> PoolStatus {
        PoolStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: PoolStatus) {
        self.status.store(status.as_u8(), Ordering::Release);
    }

    fn ensure_running(&self) -> LkvResult<()> {
        match self.status() {
            PoolStatus::Running => Ok(()),
            PoolStatus::Uninitialized => Err(LkvError::NotRunning("pool not started")),
            PoolStatus::Stopped => Err(LkvError::NotRunning("pool stopped")),
        }
    }

    /// Pops free slots until one yields a connection.
    fn try_take(self: &Arc<Self>) -> Option<PooledConnection> {
        while let Some(idx) = self.available.pop() {
            if let Some(handle) = self.claim(idx) {
                return Some(handle);
            }
        }
        None
    }

    /// Moves the connection out of an `Idle` slot into a caller handle.
    fn claim(self: &Arc<Self>, idx: usize) -> Option<PooledConnection> {
        let mut slot = self.slots[idx].lock();
        if slot.state != SlotState::Idle {
            warn!(node = %self.node, slot = idx, state = ?slot.state, "skipping non-idle slot");
            return None;
        }
        let conn = slot.conn.take()?;
        slot.state = SlotState::InUse;
        Some(PooledConnection {
            shared: Arc::clone(self),
            slot: idx,
            conn: Some(conn),
        })
    }

    /// Opens up to `acquire_increment` connections (capped at the maximum).
    ///
    /// Fails only when not a single connection could be opened.
    fn grow(&self) -> LkvResult<usize> {
        let _growth = self.grow_lock.lock();
        if !self.available.is_empty() {
            return Ok(0);
        }
        let size = self.size.load(Ordering::Acquire);
        let batch = self
            .config
            .acquire_increment
            .min(self.config.max_pool_size.saturating_sub(size));

        let mut opened = 0;
        for _ in 0..batch {
            match self.open_slot() {
                Ok(idx) => {
                    opened += 1;
                    self.release(idx);
                }
                Err(err) if opened == 0 => return Err(err),
                Err(err) => {
                    warn!(node = %self.node, error = %err, opened, "pool growth cut short");
                    break;
                }
            }
        }
        if opened > 0 {
            debug!(node = %self.node, opened, size = self.size.load(Ordering::Acquire), "pool grown");
        }
        Ok(opened)
    }

    /// Reserves an empty slot, opens a connection into it and leaves it `Idle`
    /// without publishing it. Callers hold `grow_lock`.
    fn open_slot(&self) -> LkvResult<usize> {
        let idx = self.reserve_slot().ok_or_else(|| {
            LkvError::Config(format!("{}: no free slot below max_pool_size", self.node))
        })?;

        let mut conn = Connection::new(Arc::clone(&self.config));
        match conn.open() {
            Ok(()) => {
                let mut slot = self.slots[idx].lock();
                slot.conn = Some(conn);
                slot.state = SlotState::Idle;
                slot.last_returned = Instant::now();
                Ok(idx)
            }
            Err(err) => {
                self.discard(idx);
                Err(err)
            }
        }
    }

    fn reserve_slot(&self) -> Option<usize> {
        if self.size.load(Ordering::Acquire) >= self.config.max_pool_size {
            return None;
        }
        for (idx, slot) in self.slots.iter().enumerate() {
            let mut slot = slot.lock();
            if slot.state == SlotState::Empty {
                slot.state = SlotState::Pending;
                self.size.fetch_add(1, Ordering::AcqRel);
                return Some(idx);
            }
        }
        None
    }

    /// Publishes an `Idle` slot: directly to a waiter if any, else to the ring.
    fn release(&self, idx: usize) {
        let mut queue = self.queue.lock();
        if self.status() == PoolStatus::Stopped {
            drop(queue);
            self.discard(idx);
            return;
        }

        if !queue.waiting.is_empty() {
            let pick = match self.config.handoff {
                HandoffPolicy::Fifo => 0,
                HandoffPolicy::SlotModulo => idx % queue.waiting.len(),
            };
            if let Some(ticket) = queue.waiting.remove(pick) {
                queue.delivered.insert(ticket, idx);
                self.handoff_cv.notify_all();
                return;
            }
        }

        if self.available.push(idx).is_err() {
            // The ring holds every slot index; overflow means a slot was
            // released twice.
            error!(node = %self.node, slot = idx, "availability ring overflow");
            drop(queue);
            self.discard(idx);
        }
    }

    /// Closes whatever the slot holds and frees it.
    fn discard(&self, idx: usize) {
        let conn = {
            let mut slot = self.slots[idx].lock();
            if slot.state == SlotState::Empty {
                return;
            }
            slot.state = SlotState::Empty;
            slot.conn.take()
        };
        if let Some(mut conn) = conn {
            conn.close_logged();
        }
        self.size.fetch_sub(1, Ordering::AcqRel);

        // Freed capacity lets a waiter grow the pool instead of timing out.
        let _queue = self.queue.lock();
        self.handoff_cv.notify_all();
    }

    fn checkin(&self, idx: usize, conn: Connection) {
        if self.status() == PoolStatus::Stopped || !conn.is_open() {
            if !conn.is_open() {
                debug!(node = %self.node, slot = idx, "dropping closed connection");
            }
            {
                let mut slot = self.slots[idx].lock();
                slot.conn = Some(conn);
            }
            self.discard(idx);
            return;
        }

        {
            let mut slot = self.slots[idx].lock();
            slot.conn = Some(conn);
            slot.state = SlotState::Idle;
            slot.last_returned = Instant::now();
        }
        self.release(idx);
    }

    fn wait_for_slot(&self, deadline: Instant) -> LkvResult<WaitOutcome> {
        let mut queue = self.queue.lock();

        // Checkin publishes under this lock, so nothing can slip in between
        // this re-check and joining the queue.
        if let Some(idx) = self.available.pop() {
            return Ok(WaitOutcome::Slot(idx));
        }
        if self.size.load(Ordering::Acquire) < self.config.max_pool_size {
            return Ok(WaitOutcome::Retry);
        }
        if queue.waiting.len() >= self.config.max_wait_size {
            return Err(LkvError::PoolBusy(BusyReason::QueueFull));
        }
        if Instant::now() >= deadline {
            return Err(LkvError::PoolBusy(BusyReason::TimedOut));
        }

        let ticket = queue.next_ticket;
        queue.next_ticket = queue.next_ticket.wrapping_add(1);
        queue.waiting.push_back(ticket);

        loop {
            if let Some(idx) = queue.delivered.remove(&ticket) {
                return Ok(WaitOutcome::Slot(idx));
            }
            if self.status() != PoolStatus::Running {
                queue.leave(ticket);
                return Err(LkvError::NotRunning("pool stopped"));
            }
            if self.size.load(Ordering::Acquire) < self.config.max_pool_size {
                queue.leave(ticket);
                return Ok(WaitOutcome::Retry);
            }
            if self.handoff_cv.wait_until(&mut queue, deadline).timed_out() {
                if let Some(idx) = queue.delivered.remove(&ticket) {
                    return Ok(WaitOutcome::Slot(idx));
                }
                queue.leave(ticket);
                return Err(LkvError::PoolBusy(BusyReason::TimedOut));
            }
        }
    }

    fn maintenance_tick(&self) -> Duration {
        [self.config.idle_timeout, self.config.health_check_interval]
            .into_iter()
            .filter(|period| !period.is_zero())
            .map(|period| period / 2)
            .min()
            .unwrap_or(MAX_MAINTENANCE_TICK)
            .clamp(MIN_MAINTENANCE_TICK, MAX_MAINTENANCE_TICK)
    }

    fn maintenance_loop(&self, signal: &StopSignal) {
        let tick = self.maintenance_tick();
        let mut last_health_check = Instant::now();
        debug!(node = %self.node, ?tick, "maintenance started");

        while !signal.wait(tick) {
            if self.status() != PoolStatus::Running {
                break;
            }
            self.evict_idle(Instant::now());

            let interval = self.config.health_check_interval;
            if !interval.is_zero() && last_health_check.elapsed() >= interval {
                self.check_health();
                last_health_check = Instant::now();
            }

            self.top_up();
        }
        debug!(node = %self.node, "maintenance stopped");
    }

    /// Closes idle connections above `min_pool_size` that sat unused longer
    /// than `idle_timeout`.
    ///
    /// The scan runs under the queue lock: a checkout that finds the ring
    /// empty re-checks it under that lock, so it never misses an idle
    /// connection that is only out of the ring for inspection.
    fn evict_idle(&self, now: Instant) {
        let idle_timeout = self.config.idle_timeout;
        let min = self.config.min_pool_size;
        if idle_timeout.is_zero() || self.size.load(Ordering::Acquire) <= min {
            return;
        }

        let mut evicted = Vec::new();
        {
            let _queue = self.queue.lock();
            // With the queue lock held nothing is pushed, so one pass over the
            // current length visits every queued index once.
            for _ in 0..self.available.len() {
                let idx = match self.available.pop() {
                    Some(idx) => idx,
                    None => break,
                };
                let mut slot = self.slots[idx].lock();
                let expired = slot.state == SlotState::Idle
                    && now.saturating_duration_since(slot.last_returned) >= idle_timeout;
                if expired && self.size.load(Ordering::Acquire) > min {
                    slot.state = SlotState::Empty;
                    evicted.extend(slot.conn.take());
                    self.size.fetch_sub(1, Ordering::AcqRel);
                } else if self.available.push(idx).is_err() {
                    error!(node = %self.node, slot = idx, "availability ring overflow");
                }
            }
            if !evicted.is_empty() {
                self.handoff_cv.notify_all();
            }
        }

        if evicted.is_empty() {
            return;
        }
        for conn in &mut evicted {
            conn.close_logged();
        }
        debug!(
            node = %self.node,
            evicted = evicted.len(),
            size = self.size.load(Ordering::Acquire),
            "idle connections evicted"
        );
    }

    /// Pings every idle connection; dead ones are reopened in place.
    fn check_health(&self) {
        for _ in 0..self.available.len() {
            let idx = match self.available.pop() {
                Some(idx) => idx,
                None => break,
            };
            let conn = {
                let mut slot = self.slots[idx].lock();
                if slot.state != SlotState::Idle {
                    continue;
                }
                slot.state = SlotState::Pending;
                slot.conn.take()
            };
            let mut conn = match conn {
                Some(conn) => conn,
                None => {
                    self.discard(idx);
                    continue;
                }
            };

            if conn.ping() {
                self.restore(idx, conn);
                continue;
            }

            warn!(node = %self.node, slot = idx, "health check failed, reconnecting");
            conn.close_logged();
            let reopened = match conn.open() {
                Ok(()) => conn.ping(),
                Err(err) => {
                    warn!(node = %self.node, slot = idx, error = %err, "reconnect failed");
                    false
                }
            };
            if reopened {
                self.record_replacement(true);
                self.restore(idx, conn);
            } else {
                conn.close_logged();
                self.discard(idx);
                self.record_replacement(false);
            }
        }
    }

    /// Returns a probed connection to its slot and republishes it.
    fn restore(&self, idx: usize, conn: Connection) {
        {
            let mut slot = self.slots[idx].lock();
            slot.conn = Some(conn);
            slot.state = SlotState::Idle;
        }
        self.release(idx);
    }

    /// Reopens connections until the pool is back at `min_pool_size`.
    fn top_up(&self) {
        let min = self.config.min_pool_size;
        if self.size.load(Ordering::Acquire) >= min {
            return;
        }
        let _growth = self.grow_lock.lock();
        while self.status() == PoolStatus::Running && self.size.load(Ordering::Acquire) < min {
            match self.open_slot() {
                Ok(idx) => {
                    self.record_replacement(true);
                    self.release(idx);
                }
                Err(err) => {
                    warn!(node = %self.node, error = %err, "failed to restore minimum pool size");
                    self.record_replacement(false);
                    break;
                }
            }
        }
    }

    fn record_replacement(&self, success: bool) {
        if success {
            self.failed_replacements.store(0, Ordering::Release);
            if !self.healthy.swap(true, Ordering::AcqRel) {
                info!(node = %self.node, "pool healthy again");
            }
            return;
        }
        let failures = self.failed_replacements.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= UNHEALTHY_AFTER && self.healthy.swap(false, Ordering::AcqRel) {
            error!(node = %self.node, failures, "pool marked unhealthy");
        }
    }
}

/// A checked-out connection; dropping it checks the connection back in.
pub struct PooledConnection {
    shared: Arc<PoolShared>,
    slot: usize,
    conn: Option<Connection>,
}

impl PooledConnection {
    /// Node identifier this connection belongs to.
    pub fn node_id(&self) -> &str {
        &self.shared.node
    }

    /// Slot index inside the owning pool.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Runs one command, returning the raw reply.
    pub fn execute(&mut self, args: &[Value]) -> LkvResult<Reply> {
        match self.conn.as_mut() {
            Some(conn) => conn.execute(args),
            None => Err(LkvError::Closed),
        }
    }

    pub fn ping(&mut self) -> bool {
        self.conn.as_mut().map(Connection::ping).unwrap_or(false)
    }

    pub fn is_open(&self) -> bool {
        self.conn.as_ref().map(Connection::is_open).unwrap_or(false)
    }

    /// Checks the connection back into its pool.
    pub fn close(self) {}
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.shared.checkin(self.slot, conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_node() -> NodeConfig {
        // Bind and drop a listener so the port is known to refuse connections.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        NodeConfig {
            min_pool_size: 0,
            max_pool_size: 2,
            acquire_increment: 1,
            connect_timeout: Duration::from_millis(200),
            ..NodeConfig::new("127.0.0.1", port)
        }
    }

    #[test]
    fn idle_scan_never_hides_the_only_connection() {
        // Connects complete in the kernel backlog; nothing is ever read.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let pool = Pool::new(NodeConfig {
            min_pool_size: 0,
            max_pool_size: 1,
            acquire_increment: 1,
            idle_timeout: Duration::from_secs(3600),
            health_check_interval: Duration::ZERO,
            connect_timeout: Duration::from_secs(1),
            ..NodeConfig::new("127.0.0.1", port)
        })
        .unwrap();
        pool.start().unwrap();
        drop(pool.checkout().unwrap());

        let done = Arc::new(AtomicBool::new(false));
        let scanner = {
            let shared = Arc::clone(&pool.shared);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                while !done.load(Ordering::Acquire) {
                    shared.evict_idle(Instant::now());
                }
            })
        };

        for _ in 0..2_000 {
            let conn = pool.checkout_timeout(Duration::ZERO);
            assert!(conn.is_ok(), "idle connection hidden: {:?}", conn.err());
        }
        done.store(true, Ordering::Release);
        scanner.join().unwrap();
        assert_eq!(pool.stats().size, 1);
    }

    #[test]
    fn idle_scan_evicts_only_expired_above_min() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let pool = Pool::new(NodeConfig {
            min_pool_size: 1,
            max_pool_size: 3,
            acquire_increment: 1,
            idle_timeout: Duration::from_secs(3600),
            health_check_interval: Duration::ZERO,
            connect_timeout: Duration::from_secs(1),
            ..NodeConfig::new("127.0.0.1", port)
        })
        .unwrap();
        pool.start().unwrap();
        let held: Vec<_> = (0..3).map(|_| pool.checkout().unwrap()).collect();
        drop(held);

        pool.shared.evict_idle(Instant::now());
        assert_eq!(pool.stats().size, 3);

        pool.shared.evict_idle(Instant::now() + Duration::from_secs(7200));
        let stats = pool.stats();
        assert_eq!((stats.size, stats.available), (1, 1));
        assert_eq!(pool.shared.available.len(), 1);
    }

    #[test]
    fn rejects_invalid_bounds() {
        let config = NodeConfig {
            min_pool_size: 3,
            max_pool_size: 1,
            ..NodeConfig::default()
        };
        assert!(matches!(Pool::new(config), Err(LkvError::Config(_))));
    }

    #[test]
    fn checkout_before_start_fails() {
        let pool = Pool::new(unreachable_node()).unwrap();
        assert_eq!(pool.status(), PoolStatus::Uninitialized);
        assert!(matches!(
            pool.checkout_timeout(Duration::ZERO),
            Err(LkvError::NotRunning(_))
        ));
    }

    #[test]
    fn start_fails_when_node_unreachable() {
        let config = NodeConfig {
            min_pool_size: 1,
            ..unreachable_node()
        };
        let pool = Pool::new(config).unwrap();
        assert!(matches!(pool.start(), Err(LkvError::Connect { .. })));
        assert_eq!(pool.status(), PoolStatus::Uninitialized);
        assert_eq!(pool.stats().size, 0);
    }

    #[test]
    fn growth_failure_surfaces_connect_error() {
        let pool = Pool::new(unreachable_node()).unwrap();
        pool.start().unwrap();
        assert!(matches!(
            pool.checkout_timeout(Duration::from_millis(50)),
            Err(LkvError::Connect { .. })
        ));
        let stats = pool.stats();
        assert_eq!(stats.size, 0);
        assert_eq!(stats.pending, 0);
    }

    #[test]
    fn stop_is_one_way_and_idempotent() {
        let pool = Pool::new(unreachable_node()).unwrap();
        pool.start().unwrap();
        pool.stop();
        pool.stop();
        assert_eq!(pool.status(), PoolStatus::Stopped);
        assert!(matches!(pool.start(), Err(LkvError::Config(_))));
        assert!(matches!(
            pool.checkout_timeout(Duration::ZERO),
            Err(LkvError::NotRunning(_))
        ));
    }

    #[test]
    fn maintenance_tick_is_clamped() {
        let fast = Pool::new(NodeConfig {
            idle_timeout: Duration::from_millis(4),
            ..unreachable_node()
        })
        .unwrap();
        assert_eq!(fast.shared.maintenance_tick(), MIN_MAINTENANCE_TICK);

        let disabled = Pool::new(NodeConfig {
            idle_timeout: Duration::ZERO,
            health_check_interval: Duration::ZERO,
            ..unreachable_node()
        })
        .unwrap();
        assert_eq!(disabled.shared.maintenance_tick(), MAX_MAINTENANCE_TICK);
    }

    #[test]
    fn unhealthy_after_repeated_failures() {
        let pool = Pool::new(unreachable_node()).unwrap();
        for _ in 0..UNHEALTHY_AFTER {
            pool.shared.record_replacement(false);
        }
        assert!(!pool.is_healthy());
        pool.shared.record_replacement(true);
        assert!(pool.is_healthy());
    }
}
