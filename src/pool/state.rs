//! Partitioned pool state for one route
//!
//! Every server has one record in an arena keyed by [`ServerId`]. The record's
//! partition tag says where it lives, and each partition has its own index:
//! a queue for idle servers, a map of holders for active ones and a set for
//! in-flight connects. All transitions happen under the owning pool's lock,
//! which is never held across an await point.
//!
//! Waiters are served strictly in arrival order. Capacity freed by a release
//! goes to the oldest waiter directly (the server itself on reuse, a connect
//! slot on discard), so a newcomer can never overtake a queued acquirer.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::client::ClientId;
use crate::config::{IdleOrder, PoolConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerId(pub u64);

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Who currently holds an active server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Holder {
    Client(ClientId),
    /// Checked out by the periodic maintainer for a health probe
    Maintainer,
}

impl fmt::Display for Holder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Holder::Client(id) => write!(f, "{}", id),
            Holder::Maintainer => f.write_str("maintainer"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    Idle,
    Active(Holder),
    Connecting,
}

/// Limits applied to one pool
#[derive(Debug, Clone)]
pub struct PoolPolicy {
    pub max_size: usize,
    pub min_size: usize,
    pub idle_timeout: Option<Duration>,
    pub max_lifetime: Option<Duration>,
    /// 0 = unlimited
    pub max_requests: u64,
    pub idle_order: IdleOrder,
}

impl From<&PoolConfig> for PoolPolicy {
    fn from(config: &PoolConfig) -> Self {
        Self {
            max_size: config.max_size,
            min_size: config.min_size,
            idle_timeout: config.idle_timeout(),
            max_lifetime: config.max_lifetime(),
            max_requests: config.max_requests,
            idle_order: config.idle_order,
        }
    }
}

#[derive(Debug)]
struct ServerRecord<T> {
    partition: Partition,
    created_at: Instant,
    last_active: Instant,
    /// Number of times the server was lent out
    requests: u64,
    /// Present only while idle
    conn: Option<T>,
}

/// Identifies a queued acquirer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaiterId(u64);

/// What a waiter is handed when capacity frees up
#[derive(Debug)]
pub enum Grant<T> {
    /// An idle server, already marked active for the waiter
    Server { id: ServerId, conn: T },
    /// A reserved connecting slot; the waiter performs the connect
    Connect { id: ServerId },
}

/// Result of an acquire attempt under the lock
#[derive(Debug)]
pub enum Checkout<T> {
    Server { id: ServerId, conn: T },
    Connect { id: ServerId },
    Wait {
        waiter: WaiterId,
        rx: oneshot::Receiver<Grant<T>>,
    },
    Closed,
}

struct Waiter<T> {
    id: WaiterId,
    holder: Holder,
    tx: oneshot::Sender<Grant<T>>,
}

/// Pool statistics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub active: usize,
    pub connecting: usize,
    pub waiting: usize,
    pub max_size: usize,
}

impl PoolStats {
    pub fn total(&self) -> usize {
        self.idle + self.active + self.connecting
    }
}

pub struct PoolState<T> {
    policy: PoolPolicy,
    records: HashMap<ServerId, ServerRecord<T>>,
    idle: VecDeque<ServerId>,
    active: HashMap<ServerId, Holder>,
    connecting: HashSet<ServerId>,
    waiters: VecDeque<Waiter<T>>,
    next_server: u64,
    next_waiter: u64,
    closed: bool,
}

impl<T> PoolState<T> {
    pub fn new(policy: PoolPolicy) -> Self {
        Self {
            policy,
            records: HashMap::new(),
            idle: VecDeque::new(),
            active: HashMap::new(),
            connecting: HashSet::new(),
            waiters: VecDeque::new(),
            next_server: 1,
            next_waiter: 1,
            closed: false,
        }
    }

    pub fn policy(&self) -> &PoolPolicy {
        &self.policy
    }

    /// |idle| + |active| + |connecting|
    pub fn total(&self) -> usize {
        self.idle.len() + self.active.len() + self.connecting.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn has_waiters(&self) -> bool {
        !self.waiters.is_empty()
    }

    /// Servers missing to reach `min_size`
    pub fn deficit(&self) -> usize {
        if self.closed {
            return 0;
        }
        self.policy.min_size.saturating_sub(self.total())
    }

    pub fn partition_of(&self, id: ServerId) -> Option<Partition> {
        self.records.get(&id).map(|r| r.partition)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.idle.len(),
            active: self.active.len(),
            connecting: self.connecting.len(),
            waiting: self.waiters.len(),
            max_size: self.policy.max_size,
        }
    }

    /// Acquire for `holder`: an idle server, else a connect slot, else a place
    /// in the wait queue. Expired idle servers met on the way are moved into
    /// `expired` for the caller to close outside the lock.
    pub fn checkout(&mut self, holder: Holder, now: Instant, expired: &mut Vec<T>) -> Checkout<T> {
        if self.closed {
            return Checkout::Closed;
        }
        if self.waiters.is_empty() {
            if let Some((id, conn)) = self.take_idle(holder, now, expired) {
                return Checkout::Server { id, conn };
            }
            if let Some(id) = self.reserve_connect(now) {
                return Checkout::Connect { id };
            }
        }

        let id = WaiterId(self.next_waiter);
        self.next_waiter += 1;
        let (tx, rx) = oneshot::channel();
        self.waiters.push_back(Waiter { id, holder, tx });
        Checkout::Wait { waiter: id, rx }
    }

    fn take_idle(&mut self, holder: Holder, now: Instant, expired: &mut Vec<T>) -> Option<(ServerId, T)> {
        loop {
            let id = match self.policy.idle_order {
                IdleOrder::Lifo => self.idle.pop_back(),
                IdleOrder::Fifo => self.idle.pop_front(),
            }?;

            let stale = match self.records.get(&id) {
                Some(record) => self.is_stale(record, now),
                None => continue,
            };
            if stale {
                if let Some(conn) = self.records.remove(&id).and_then(|r| r.conn) {
                    expired.push(conn);
                }
                continue;
            }

            let record = self.records.get_mut(&id)?;
            let conn = record.conn.take()?;
            record.partition = Partition::Active(holder);
            record.requests += 1;
            record.last_active = now;
            self.active.insert(id, holder);
            return Some((id, conn));
        }
    }

    /// Reserve a connecting slot if the pool has room
    pub fn reserve_connect(&mut self, now: Instant) -> Option<ServerId> {
        if self.closed || self.total() >= self.policy.max_size {
            return None;
        }
        let id = ServerId(self.next_server);
        self.next_server += 1;
        self.records.insert(
            id,
            ServerRecord {
                partition: Partition::Connecting,
                created_at: now,
                last_active: now,
                requests: 0,
                conn: None,
            },
        );
        self.connecting.insert(id);
        Some(id)
    }

    /// A connect finished: the server goes straight to `holder`
    pub fn connected(&mut self, id: ServerId, holder: Holder, now: Instant) -> bool {
        if !self.connecting.remove(&id) {
            return false;
        }
        match self.records.get_mut(&id) {
            Some(record) => {
                record.partition = Partition::Active(holder);
                record.created_at = now;
                record.last_active = now;
                record.requests = 1;
                self.active.insert(id, holder);
                true
            }
            None => false,
        }
    }

    /// A connect finished with no holder (prefill): the server becomes
    /// available. Returns the connection if the pool no longer accepts it.
    pub fn connected_idle(&mut self, id: ServerId, conn: T, now: Instant) -> Option<T> {
        if !self.connecting.remove(&id) || self.closed {
            self.records.remove(&id);
            return Some(conn);
        }
        match self.records.get_mut(&id) {
            Some(record) => {
                record.created_at = now;
                record.last_active = now;
            }
            None => return Some(conn),
        }
        self.make_available(id, conn, now);
        None
    }

    /// A connect failed or was cancelled: free the slot
    pub fn abort_connect(&mut self, id: ServerId) {
        if self.connecting.remove(&id) {
            self.records.remove(&id);
        }
        self.grant_capacity();
    }

    /// Return an active server. Returns the connection when it must be
    /// closed instead (past lifetime/request limits, or pool closed).
    pub fn checkin(&mut self, id: ServerId, conn: T, now: Instant) -> Option<T> {
        self.checkin_inner(id, conn, now, true)
    }

    /// Return a server after a health probe without refreshing its idle time
    pub fn checkin_probed(&mut self, id: ServerId, conn: T, now: Instant) -> Option<T> {
        self.checkin_inner(id, conn, now, false)
    }

    fn checkin_inner(&mut self, id: ServerId, conn: T, now: Instant, touch: bool) -> Option<T> {
        if self.active.remove(&id).is_none() {
            return Some(conn);
        }

        let worn_out = match self.records.get_mut(&id) {
            Some(record) => {
                if touch {
                    record.last_active = now;
                }
                self.policy
                    .max_lifetime
                    .is_some_and(|max| now.saturating_duration_since(record.created_at) > max)
                    || (self.policy.max_requests > 0 && record.requests >= self.policy.max_requests)
            }
            None => return Some(conn),
        };

        if worn_out || self.closed {
            self.records.remove(&id);
            self.grant_capacity();
            return Some(conn);
        }

        self.make_available(id, conn, now);
        None
    }

    /// Hand a server to the oldest live waiter, else park it in the idle queue
    fn make_available(&mut self, id: ServerId, mut conn: T, now: Instant) {
        while let Some(waiter) = self.waiters.pop_front() {
            self.active.insert(id, waiter.holder);
            if let Some(record) = self.records.get_mut(&id) {
                record.partition = Partition::Active(waiter.holder);
                record.requests += 1;
                record.last_active = now;
            }
            match waiter.tx.send(Grant::Server { id, conn }) {
                Ok(()) => return,
                Err(Grant::Server { conn: back, .. }) => {
                    self.active.remove(&id);
                    if let Some(record) = self.records.get_mut(&id) {
                        record.requests -= 1;
                    }
                    conn = back;
                }
                Err(Grant::Connect { .. }) => unreachable!("sent a server grant"),
            }
        }

        if let Some(record) = self.records.get_mut(&id) {
            record.partition = Partition::Idle;
            record.conn = Some(conn);
            self.idle.push_back(id);
        }
    }

    /// Remove a server from every partition. Returns its connection if it
    /// was idle. Freed capacity goes to the oldest waiter.
    pub fn discard(&mut self, id: ServerId) -> Option<T> {
        let record = self.records.remove(&id)?;
        match record.partition {
            Partition::Idle => self.idle.retain(|&i| i != id),
            Partition::Active(_) => {
                self.active.remove(&id);
            }
            Partition::Connecting => {
                self.connecting.remove(&id);
            }
        }
        self.grant_capacity();
        record.conn
    }

    /// Turn free capacity into connect slots for queued waiters
    fn grant_capacity(&mut self) {
        while !self.waiters.is_empty() && !self.closed && self.total() < self.policy.max_size {
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            let Some(id) = self.reserve_connect(Instant::now()) else {
                self.waiters.push_front(waiter);
                break;
            };
            if waiter.tx.send(Grant::Connect { id }).is_err() {
                self.connecting.remove(&id);
                self.records.remove(&id);
            }
        }
    }

    /// Drop a queued waiter. False if it was already granted or removed.
    pub fn cancel_waiter(&mut self, waiter: WaiterId) -> bool {
        match self.waiters.iter().position(|w| w.id == waiter) {
            Some(pos) => {
                self.waiters.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Remove idle servers past idle timeout, lifetime or request limits
    pub fn evict_expired(&mut self, now: Instant) -> Vec<T> {
        let stale: Vec<ServerId> = self
            .idle
            .iter()
            .copied()
            .filter(|id| self.records.get(id).is_some_and(|r| self.is_stale(r, now)))
            .collect();

        let mut evicted = Vec::with_capacity(stale.len());
        for id in stale {
            if let Some(conn) = self.discard(id) {
                evicted.push(conn);
            }
        }
        evicted
    }

    /// Check out idle servers untouched for at least `min_idle` for probing
    pub fn checkout_for_probe(&mut self, now: Instant, min_idle: Duration) -> Vec<(ServerId, T)> {
        let due: Vec<ServerId> = self
            .idle
            .iter()
            .copied()
            .filter(|id| {
                self.records.get(id).is_some_and(|r| {
                    !self.is_stale(r, now) && now.saturating_duration_since(r.last_active) >= min_idle
                })
            })
            .collect();

        let mut batch = Vec::with_capacity(due.len());
        for id in due {
            self.idle.retain(|&i| i != id);
            if let Some(record) = self.records.get_mut(&id) {
                if let Some(conn) = record.conn.take() {
                    record.partition = Partition::Active(Holder::Maintainer);
                    self.active.insert(id, Holder::Maintainer);
                    batch.push((id, conn));
                }
            }
        }
        batch
    }

    /// Refuse new acquires, drop waiters and hand back every idle connection
    pub fn close(&mut self) -> Vec<T> {
        self.closed = true;
        self.waiters.clear();
        let ids: Vec<ServerId> = self.idle.drain(..).collect();
        ids.into_iter()
            .filter_map(|id| self.records.remove(&id).and_then(|r| r.conn))
            .collect()
    }

    fn is_stale(&self, record: &ServerRecord<T>, now: Instant) -> bool {
        let idle_for = now.saturating_duration_since(record.last_active);
        let age = now.saturating_duration_since(record.created_at);
        self.policy.idle_timeout.is_some_and(|t| idle_for > t)
            || self.policy.max_lifetime.is_some_and(|t| age > t)
            || (self.policy.max_requests > 0 && record.requests >= self.policy.max_requests)
    }

    /// Verify size bound and partition exclusivity
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.total() > self.policy.max_size {
            return Err(format!(
                "pool size {} exceeds max_size {}",
                self.total(),
                self.policy.max_size
            ));
        }
        if self.total() != self.records.len() {
            return Err(format!(
                "{} records but partitions hold {}",
                self.records.len(),
                self.total()
            ));
        }
        for (id, record) in &self.records {
            let in_idle = self.idle.contains(id);
            let holder = self.active.get(id);
            let in_connecting = self.connecting.contains(id);
            let memberships = in_idle as u8 + holder.is_some() as u8 + in_connecting as u8;
            if memberships != 1 {
                return Err(format!("server {} is in {} partitions", id, memberships));
            }
            let consistent = match record.partition {
                Partition::Idle => in_idle && record.conn.is_some(),
                Partition::Active(h) => holder == Some(&h) && record.conn.is_none(),
                Partition::Connecting => in_connecting && record.conn.is_none(),
            };
            if !consistent {
                return Err(format!("server {} tagged {:?} but indexed elsewhere", id, record.partition));
            }
        }
        Ok(())
    }
}
