/*
 * Copyright 2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! A bounded pool of connections.
//!
//! Bookkeeping happens under one mutex which is never held across I/O.  Each connection is
//! counted in exactly one of three places: `idle`, `checked_out`, or `pending` (a slot
//! reserved for a dial in progress), and the three never sum to more than the pool size.
//!
//! When the pool is full, callers queue as waiters.  A returned connection, or the capacity
//! freed by an evicted one, is handed directly to the oldest waiter still listening, so no
//! other caller can overtake it.

use std::borrow::{Borrow, BorrowMut};
use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures_channel::oneshot;
use futures_util::future::BoxFuture;

use super::{connect::Conn, context::Context, options::Options};
use crate::{error::Error, task};

/// Opens a new, ready to use, connection.
pub(crate) type Connector =
    Arc<dyn Fn(Context) -> BoxFuture<'static, Result<Conn, Error>> + Send + Sync>;

/// A snapshot of pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Times an idle connection was reused
    pub hits: u64,
    /// Times no idle connection was available
    pub misses: u64,
    /// Times a caller gave up waiting for a connection
    pub timeouts: u64,

    pub total_conns: usize,
    pub idle_conns: usize,
    /// Connections closed for exceeding their idle time or lifetime
    pub stale_conns: u64,
    pub checked_out: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct PoolConfig {
    pub(crate) size: usize,
    pub(crate) min_idle: usize,
    pub(crate) timeout: Duration,
    pub(crate) max_idle_time: Option<Duration>,
    pub(crate) max_lifetime: Option<Duration>,
}

impl PoolConfig {
    pub(crate) fn from_options(opts: &Options) -> Self {
        PoolConfig {
            size: opts.pool_size,
            min_idle: opts.min_idle_conns.min(opts.pool_size),
            timeout: opts.effective_pool_timeout(),
            max_idle_time: opts.conn_max_idle_time,
            max_lifetime: opts.conn_max_lifetime,
        }
    }

    fn is_stale(&self, conn: &Conn, now: Instant) -> bool {
        let expired = |since: Instant, limit: Option<Duration>| {
            limit.map_or(false, |limit| now.saturating_duration_since(since) >= limit)
        };
        expired(conn.created_at(), self.max_lifetime) || expired(conn.used_at(), self.max_idle_time)
    }
}

/// What a queued caller receives: a connection, or the right to dial one.
enum Grant {
    Conn(Conn),
    Slot,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<Conn>,
    checked_out: usize,
    pending: usize,
    filling: usize,
    waiters: VecDeque<oneshot::Sender<Grant>>,
    closed: bool,

    hits: u64,
    misses: u64,
    timeouts: u64,
    stale: u64,
}

impl PoolState {
    fn total(&self) -> usize {
        self.idle.len() + self.checked_out + self.pending
    }

    /// Offers `grant` to waiters in arrival order, returning it if nobody takes it.
    fn grant(&mut self, mut grant: Grant) -> Result<(), Grant> {
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.send(grant) {
                Ok(()) => return Ok(()),
                Err(returned) => grant = returned,
            }
        }
        Err(grant)
    }

    /// One unit of capacity has just been given up; pass it on as a dial slot if someone is
    /// waiting.
    fn vacate(&mut self) {
        if self.closed {
            return;
        }
        self.pending += 1;
        if self.grant(Grant::Slot).is_err() {
            self.pending -= 1;
        }
    }
}

struct PoolInner {
    config: PoolConfig,
    connector: Connector,
    state: Mutex<PoolState>,
}

#[derive(Clone)]
pub(crate) struct ConnPool {
    inner: Arc<PoolInner>,
}

enum Step {
    Ready(Conn),
    Dial,
    Wait(oneshot::Receiver<Grant>),
}

impl ConnPool {
    pub(crate) fn new(config: PoolConfig, connector: Connector) -> Self {
        ConnPool {
            inner: Arc::new(PoolInner {
                config,
                connector,
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes a connection, dialling a new one if there is room, otherwise waiting up to the
    /// pool timeout for one to be released.
    pub(crate) async fn acquire(&self, ctx: &Context) -> Result<PooledConn, Error> {
        ctx.check()?;
        match self.next_step()? {
            Step::Ready(conn) => {
                self.fill();
                Ok(self.lease(conn))
            }
            Step::Dial => self.dial(ctx, self.slot(false)).await,
            Step::Wait(rx) => {
                let mut waiter = Waiter { rx, pool: self };
                // An earlier context deadline is reported as such, not as a pool timeout.
                let limit = match ctx.remaining() {
                    Some(left) if left <= self.inner.config.timeout => None,
                    _ => Some(self.inner.config.timeout),
                };
                let waited = task::timeout(limit, ctx.run(&mut waiter.rx)).await;
                match waited {
                    None => {
                        self.state().timeouts += 1;
                        Err(Error::PoolTimeout)
                    }
                    Some(Err(cancelled)) => Err(cancelled),
                    Some(Ok(Err(oneshot::Canceled))) => Err(Error::ClientClosed),
                    Some(Ok(Ok(Grant::Conn(conn)))) => Ok(self.lease(conn)),
                    Some(Ok(Ok(Grant::Slot))) => self.dial(ctx, self.slot(false)).await,
                }
            }
        }
    }

    fn next_step(&self) -> Result<Step, Error> {
        let mut stale = Vec::new();
        let now = Instant::now();
        let mut state = self.state();
        if state.closed {
            return Err(Error::ClientClosed);
        }
        while let Some(conn) = state.idle.pop_back() {
            if self.inner.config.is_stale(&conn, now) {
                state.stale += 1;
                stale.push(conn);
                continue;
            }
            state.hits += 1;
            state.checked_out += 1;
            return Ok(Step::Ready(conn));
        }
        state.misses += 1;
        if state.total() < self.inner.config.size {
            state.pending += 1;
            Ok(Step::Dial)
        } else {
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            Ok(Step::Wait(rx))
        }
    }

    async fn dial(&self, ctx: &Context, slot: SlotGuard) -> Result<PooledConn, Error> {
        let conn = ctx.run((self.inner.connector)(ctx.clone())).await??;
        Ok(slot.checked_out(conn))
    }

    /// A guard for a slot already counted in `pending`.
    fn slot(&self, fill: bool) -> SlotGuard {
        SlotGuard {
            pool: self.clone(),
            fill,
            done: false,
        }
    }

    fn lease(&self, conn: Conn) -> PooledConn {
        PooledConn {
            conn,
            lease: Lease {
                pool: self.clone(),
                done: false,
            },
        }
    }

    /// Returns a connection to the pool.  Broken or stale connections are closed instead.
    pub(crate) fn release(&self, pooled: PooledConn) {
        let PooledConn { conn, mut lease } = pooled;
        lease.done = true;
        self.put(conn);
    }

    /// Closes a connection that can no longer be trusted.
    pub(crate) fn remove(&self, pooled: PooledConn) {
        log::debug!("Removing connection {}", pooled.id());
        drop(pooled);
    }

    /// `conn` is counted as checked out.
    fn put(&self, conn: Conn) {
        let now = Instant::now();
        let discard;
        {
            let mut state = self.state();
            let stale = self.inner.config.is_stale(&conn, now);
            if state.closed || !conn.is_usable() || stale {
                if stale && !state.closed {
                    state.stale += 1;
                }
                state.checked_out -= 1;
                state.vacate();
                discard = Some((conn, !state.closed));
            } else {
                if let Err(Grant::Conn(conn)) = state.grant(Grant::Conn(conn)) {
                    state.checked_out -= 1;
                    state.idle.push_back(conn);
                }
                discard = None;
            }
        }
        if let Some((conn, refill)) = discard {
            log::debug!("Closing connection {}", conn.id());
            drop(conn);
            if refill {
                self.fill();
            }
        }
    }

    fn restore(&self, grant: Grant) {
        match grant {
            Grant::Conn(conn) => self.put(conn),
            Grant::Slot => {
                let mut state = self.state();
                state.pending -= 1;
                state.vacate();
            }
        }
    }

    /// Dials in the background until `min_idle` connections are idle or dialling.
    pub(crate) fn fill(&self) {
        let min_idle = self.inner.config.min_idle;
        if min_idle == 0 {
            return;
        }
        let mut slots = Vec::new();
        {
            let mut state = self.state();
            while !state.closed
                && state.idle.len() + state.filling < min_idle
                && state.total() < self.inner.config.size
            {
                state.pending += 1;
                state.filling += 1;
                slots.push(self.slot(true));
            }
        }
        for slot in slots {
            let pool = self.clone();
            task::spawn(async move {
                match (pool.inner.connector)(Context::background()).await {
                    Ok(conn) => {
                        let pooled = slot.checked_out(conn);
                        pool.release(pooled);
                    }
                    Err(e) => log::warn!("Could not open idle connection: {}", e),
                }
            });
        }
    }

    pub(crate) fn stats(&self) -> PoolStats {
        let state = self.state();
        PoolStats {
            hits: state.hits,
            misses: state.misses,
            timeouts: state.timeouts,
            total_conns: state.idle.len() + state.checked_out,
            idle_conns: state.idle.len(),
            stale_conns: state.stale,
            checked_out: state.checked_out,
        }
    }

    /// Closes every idle connection and fails every waiter.  Connections still checked out
    /// are closed when they come back.
    pub(crate) fn close(&self) {
        let (idle, waiters) = {
            let mut state = self.state();
            state.closed = true;
            (
                std::mem::take(&mut state.idle),
                std::mem::take(&mut state.waiters),
            )
        };
        log::debug!("Closing pool with {} idle connections", idle.len());
        drop(waiters);
        drop(idle);
    }
}

/// A queued `acquire`.  If it is abandoned, any grant already sent to it is given back.
struct Waiter<'a> {
    rx: oneshot::Receiver<Grant>,
    pool: &'a ConnPool,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        self.rx.close();
        if let Ok(Some(grant)) = self.rx.try_recv() {
            self.pool.restore(grant);
        }
    }
}

/// A reserved dial slot, freed again unless it becomes a connection.
struct SlotGuard {
    pool: ConnPool,
    fill: bool,
    done: bool,
}

impl SlotGuard {
    fn checked_out(mut self, conn: Conn) -> PooledConn {
        {
            let mut state = self.pool.state();
            state.pending -= 1;
            if self.fill {
                state.filling -= 1;
            }
            state.checked_out += 1;
        }
        self.done = true;
        self.pool.lease(conn)
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let mut state = self.pool.state();
        state.pending -= 1;
        if self.fill {
            state.filling -= 1;
        }
        state.vacate();
    }
}

/// Accounts for one checked out connection.  Dropping it without `done` evicts.
struct Lease {
    pool: ConnPool,
    done: bool,
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let closed = {
            let mut state = self.pool.state();
            state.checked_out -= 1;
            state.vacate();
            state.closed
        };
        if !closed {
            self.pool.fill();
        }
    }
}

/// A connection checked out of the pool.
///
/// Give it back with `release`; dropping it closes the connection and frees its place in the
/// pool.
pub struct PooledConn {
    conn: Conn,
    lease: Lease,
}

impl Deref for PooledConn {
    type Target = Conn;

    fn deref(&self) -> &Conn {
        &self.conn
    }
}

impl DerefMut for PooledConn {
    fn deref_mut(&mut self) -> &mut Conn {
        &mut self.conn
    }
}

impl Borrow<Conn> for PooledConn {
    fn borrow(&self) -> &Conn {
        &self.conn
    }
}

impl BorrowMut<Conn> for PooledConn {
    fn borrow_mut(&mut self) -> &mut Conn {
        &mut self.conn
    }
}

impl fmt::Debug for PooledConn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("PooledConn").field(&self.conn).finish()
    }
}
