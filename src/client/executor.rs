/*
 * Copyright 2017-2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::{
    connect::{self, default_dialer},
    context::Context,
    credentials::CredentialsResolver,
    hooks::{HookChain, ProcessHook, ProcessPipelineHook},
    options::Options,
    pool::{ConnPool, Connector, PoolConfig, PoolStats, PooledConn},
    retry::{self, ExponentialBackoff, RetryPolicy},
    transaction::{Pipeline, Transaction},
};
use crate::{
    error::Error,
    protocol::{FromResp, RespValue},
};

/// A pooled client.
///
/// Cheap to clone, clones share the pool.  Every command runs through the registered hooks,
/// and failed attempts are retried according to the retry policy, each attempt taking a
/// connection from the pool and giving it back (or closing it) before the next.
///
/// ```no_run
/// # #[macro_use] extern crate redis_pool_client;
/// use redis_pool_client::client::{Client, Context, Options};
///
/// # async fn run() -> Result<(), redis_pool_client::error::Error> {
/// let client = Client::new(Options::new("127.0.0.1:6379").pool_size(8));
/// let ctx = Context::background();
/// client.execute(&ctx, resp_array!["SET", "greeting", "hello"]).await?;
/// let value: String = client.send(&ctx, resp_array!["GET", "greeting"]).await?;
/// assert_eq!(value, "hello");
/// client.close()?;
/// # Ok(())
/// # }
/// # fn main() {}
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    pub(crate) opts: Arc<Options>,
    pub(crate) pool: ConnPool,
    pub(crate) hooks: HookChain,
    process: ProcessHook,
    pipeline: ProcessPipelineHook,
    pub(crate) retry: Arc<dyn RetryPolicy>,
    credentials: Arc<CredentialsResolver>,
    closed: AtomicBool,
}

/// Gives `conn` back to the pool, or closes it if the last exchange left it unusable.
pub(crate) fn settle(pool: &ConnPool, conn: PooledConn) {
    if conn.is_usable() {
        pool.release(conn);
    } else {
        pool.remove(conn);
    }
}

fn base_process(pool: ConnPool) -> ProcessHook {
    Arc::new(move |ctx, cmd| {
        let pool = pool.clone();
        Box::pin(async move {
            let mut conn = pool.acquire(&ctx).await?;
            let reply = ctx.run(conn.roundtrip(&cmd)).await;
            settle(&pool, conn);
            reply??.into_result()
        })
    })
}

fn base_pipeline(pool: ConnPool) -> ProcessPipelineHook {
    Arc::new(move |ctx, cmds| {
        let pool = pool.clone();
        Box::pin(async move {
            let mut conn = pool.acquire(&ctx).await?;
            let replies = ctx.run(conn.roundtrip_batch(&cmds)).await;
            settle(&pool, conn);
            replies?
        })
    })
}

fn connector(
    opts: Arc<Options>,
    hooks: &HookChain,
    credentials: Arc<CredentialsResolver>,
) -> Connector {
    let dial = hooks.dial(opts.dialer.clone().unwrap_or_else(default_dialer));
    let hooks = hooks.clone();
    Arc::new(move |ctx| {
        let opts = opts.clone();
        let dial = dial.clone();
        let hooks = hooks.clone();
        let credentials = credentials.clone();
        Box::pin(async move {
            let creds = credentials.resolve(&ctx).await?;
            let conn = connect::open(&ctx, &dial, &opts).await?;
            connect::handshake(&ctx, conn, &creds, &opts, &hooks).await
        })
    })
}

impl Client {
    /// Builds a client from a snapshot of `opts`.  No connection is made until the first
    /// command, unless `min_idle_conns` is set, in which case idle connections are opened in
    /// the background.
    pub fn new(opts: &Options) -> Client {
        let opts = Arc::new(opts.clone());
        let hooks = HookChain::new(opts.hooks.clone());
        let credentials = Arc::new(CredentialsResolver::new(&opts));
        let pool = ConnPool::new(
            PoolConfig::from_options(&opts),
            connector(opts.clone(), &hooks, credentials.clone()),
        );
        let retry = match &opts.retry_policy {
            Some(policy) => policy.clone(),
            None => Arc::new(ExponentialBackoff::from_options(&opts)),
        };
        let client = Client {
            inner: Arc::new(ClientInner {
                process: hooks.process(base_process(pool.clone())),
                pipeline: hooks.pipeline(base_pipeline(pool.clone())),
                opts,
                pool,
                hooks,
                retry,
                credentials,
                closed: AtomicBool::new(false),
            }),
        };
        client.inner.pool.fill();
        client
    }

    pub(crate) fn inner(&self) -> &ClientInner {
        &self.inner
    }

    pub(crate) fn check_open(&self) -> Result<(), Error> {
        if self.inner.closed.load(Ordering::SeqCst) {
            Err(Error::ClientClosed)
        } else {
            Ok(())
        }
    }

    /// Sends one command, returning its reply.  A server error reply is returned as
    /// `Error::Remote`.
    pub async fn execute(&self, ctx: &Context, cmd: RespValue) -> Result<RespValue, Error> {
        self.check_open()?;
        let process = &self.inner.process;
        retry::with_retries(ctx, self.inner.retry.as_ref(), || {
            process(ctx.clone(), cmd.clone())
        })
        .await
    }

    /// Sends one command and converts its reply.
    pub async fn send<T>(&self, ctx: &Context, cmd: RespValue) -> Result<T, Error>
    where
        T: FromResp,
    {
        T::from_resp(self.execute(ctx, cmd).await?)
    }

    /// Sends `cmds` as a single write on one connection, returning one result per command in
    /// the same order.  A failure affecting the whole batch is repeated for every command.
    pub async fn execute_batch(
        &self,
        ctx: &Context,
        cmds: Vec<RespValue>,
    ) -> Vec<Result<RespValue, Error>> {
        if cmds.is_empty() {
            return Vec::new();
        }
        let count = cmds.len();
        match self.execute_pipeline(ctx, cmds).await {
            Ok(replies) => replies.into_iter().map(RespValue::into_result).collect(),
            Err(e) => vec![Err(e); count],
        }
    }

    pub(crate) async fn execute_pipeline(
        &self,
        ctx: &Context,
        cmds: Vec<RespValue>,
    ) -> Result<Vec<RespValue>, Error> {
        self.check_open()?;
        let pipeline = &self.inner.pipeline;
        retry::with_retries(ctx, self.inner.retry.as_ref(), || {
            pipeline(ctx.clone(), cmds.clone())
        })
        .await
    }

    /// Queues commands locally, sending them together on `exec`.
    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new(self.clone(), false)
    }

    /// Like `pipeline`, but the commands are wrapped in `MULTI`/`EXEC`.
    pub fn tx_pipeline(&self) -> Pipeline {
        Pipeline::new(self.clone(), true)
    }

    /// Takes a dedicated connection for a `WATCH`/`MULTI`/`EXEC` transaction.
    pub async fn transaction(&self, ctx: &Context) -> Result<Transaction, Error> {
        self.check_open()?;
        let pool = &self.inner.pool;
        let conn =
            retry::with_retries(ctx, self.inner.retry.as_ref(), || pool.acquire(ctx)).await?;
        Ok(Transaction::new(self.clone(), conn))
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    pub fn options(&self) -> &Options {
        &self.inner.opts
    }

    /// Closes every pooled connection and ends any credentials subscription.  Later calls,
    /// on this or any clone, do nothing.
    pub fn close(&self) -> Result<(), Error> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        log::debug!("Closing {}", self);
        self.inner.pool.close();
        self.inner.credentials.close()
    }
}

impl fmt::Display for Client {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Redis<{} db:{}>", self.inner.opts.addr, self.inner.opts.db)
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Client")
            .field("opts", &self.inner.opts)
            .field("pool", &self.pool_stats())
            .finish()
    }
}
