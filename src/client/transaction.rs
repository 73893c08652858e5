/*
 * Copyright 2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! Client side batching: plain pipelines, `MULTI`/`EXEC` pipelines, and transactions that
//! `WATCH` keys on a dedicated connection.

use std::sync::Arc;

use tokio::sync::Mutex;

use super::{
    context::Context,
    executor::{self, Client},
    hooks::{self, Pinned, ProcessHook, ProcessPipelineHook},
    pool::PooledConn,
};
use crate::{
    error::{self, Error},
    protocol::{FromResp, RespValue},
};

fn wrap_multi(cmds: Vec<RespValue>) -> Vec<RespValue> {
    let mut wrapped = Vec::with_capacity(cmds.len() + 2);
    wrapped.push(resp_array!["MULTI"]);
    wrapped.extend(cmds);
    wrapped.push(resp_array!["EXEC"]);
    wrapped
}

/// Maps the replies to `MULTI`, each queued command, and `EXEC` onto one result per queued
/// command.
fn exec_replies(
    mut replies: Vec<RespValue>,
    count: usize,
) -> Result<Vec<Result<RespValue, Error>>, Error> {
    if replies.len() != count + 2 {
        return Err(error::internal(format!(
            "Expected {} replies to transaction, got {}",
            count + 2,
            replies.len()
        )));
    }
    let exec = replies.pop().unwrap_or(RespValue::Nil);
    let mut replies = replies.into_iter();
    if let Some(RespValue::Error(msg)) = replies.next() {
        return Err(Error::Remote(msg));
    }
    match exec {
        RespValue::Array(results) if results.len() == count => {
            Ok(results.into_iter().map(RespValue::into_result).collect())
        }
        RespValue::Nil => Err(Error::TxAborted),
        // EXECABORT: nothing ran, blame the commands the server refused to queue
        RespValue::Error(msg) => Ok(replies
            .map(|queued| match queued {
                RespValue::Error(refused) => Err(Error::Remote(refused)),
                _ => Err(Error::Remote(msg.clone())),
            })
            .collect()),
        other => Err(error::resp("Unexpected reply to EXEC", other)),
    }
}

/// Commands queued locally and sent in one write by `exec`.
#[derive(Debug)]
pub struct Pipeline {
    client: Client,
    cmds: Vec<RespValue>,
    tx: bool,
}

impl Pipeline {
    pub(crate) fn new(client: Client, tx: bool) -> Self {
        Pipeline {
            client,
            cmds: Vec::new(),
            tx,
        }
    }

    pub fn queue(&mut self, cmd: RespValue) -> &mut Self {
        self.cmds.push(cmd);
        self
    }

    pub fn len(&self) -> usize {
        self.cmds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cmds.is_empty()
    }

    /// Drops every queued command.
    pub fn discard(&mut self) {
        self.cmds.clear();
    }

    /// Sends the queued commands, returning one result per command in queue order, and
    /// empties the queue.  A transactional pipeline that is aborted by the server reports the
    /// abort for every command.
    pub async fn exec(&mut self, ctx: &Context) -> Vec<Result<RespValue, Error>> {
        let cmds = std::mem::take(&mut self.cmds);
        if cmds.is_empty() {
            return Vec::new();
        }
        if !self.tx {
            return self.client.execute_batch(ctx, cmds).await;
        }
        let count = cmds.len();
        let results = match self.client.execute_pipeline(ctx, wrap_multi(cmds)).await {
            Ok(replies) => exec_replies(replies, count),
            Err(e) => Err(e),
        };
        results.unwrap_or_else(|e| vec![Err(e); count])
    }
}

/// A `WATCH`/`MULTI`/`EXEC` session on one connection taken from the pool.
///
/// Commands sent with `execute` run immediately; commands added with `queue` run atomically
/// on `exec`.  If a watched key changes before `exec`, `exec` fails with `Error::TxAborted`
/// and the whole sequence must be started again; it is never retried automatically.
///
/// Finish with `close` to return the connection to the pool.  A session that is dropped
/// instead closes its connection.
pub struct Transaction {
    client: Client,
    conn: Pinned<PooledConn>,
    process: ProcessHook,
    pipeline: ProcessPipelineHook,
    queued: Vec<RespValue>,
}

impl Transaction {
    pub(crate) fn new(client: Client, conn: PooledConn) -> Self {
        let conn = Arc::new(Mutex::new(conn));
        let chain = &client.inner().hooks;
        Transaction {
            process: chain.process(hooks::pinned_process(conn.clone())),
            pipeline: chain.pipeline(hooks::pinned_pipeline(conn.clone())),
            conn,
            client,
            queued: Vec::new(),
        }
    }

    pub async fn watch<K>(&self, ctx: &Context, keys: impl IntoIterator<Item = K>) -> Result<(), Error>
    where
        K: Into<RespValue>,
    {
        let reply = self.execute(ctx, resp_array!["WATCH"].append(keys)).await?;
        <()>::from_resp(reply)
    }

    pub async fn unwatch(&self, ctx: &Context) -> Result<(), Error> {
        let reply = self.execute(ctx, resp_array!["UNWATCH"]).await?;
        <()>::from_resp(reply)
    }

    /// Runs `cmd` on the session's connection straight away.
    pub async fn execute(&self, ctx: &Context, cmd: RespValue) -> Result<RespValue, Error> {
        self.client.check_open()?;
        (self.process)(ctx.clone(), cmd).await
    }

    pub fn queue(&mut self, cmd: RespValue) -> &mut Self {
        self.queued.push(cmd);
        self
    }

    /// Drops every queued command.  Watched keys stay watched.
    pub fn discard(&mut self) {
        self.queued.clear();
    }

    /// Sends the queued commands inside `MULTI`/`EXEC` and empties the queue.
    pub async fn exec(&mut self, ctx: &Context) -> Result<Vec<Result<RespValue, Error>>, Error> {
        self.client.check_open()?;
        let cmds = std::mem::take(&mut self.queued);
        let count = cmds.len();
        let replies = (self.pipeline)(ctx.clone(), wrap_multi(cmds)).await?;
        exec_replies(replies, count)
    }

    /// Clears any watches and returns the connection to the pool.
    pub async fn close(self, ctx: &Context) -> Result<(), Error> {
        let usable = self.conn.lock().await.is_usable();
        let res = if usable && self.client.check_open().is_ok() {
            self.unwatch(ctx).await
        } else {
            Ok(())
        };
        let Transaction {
            client,
            conn,
            process,
            pipeline,
            ..
        } = self;
        drop(process);
        drop(pipeline);
        match Arc::try_unwrap(conn) {
            Ok(conn) => executor::settle(&client.inner().pool, conn.into_inner()),
            Err(_) => log::warn!("Transaction connection still in use on close, dropping it"),
        }
        res
    }
}
