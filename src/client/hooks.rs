/*
 * Copyright 2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! Middleware around dialing, single commands and pipelines.
//!
//! A `Hook` receives the next function in the chain and returns a function that wraps it.
//! Hooks registered first are outermost: their "before" code runs first and their "after" code
//! runs last.  A hook that returns without calling `next` short-circuits everything inside it.

use std::borrow::BorrowMut;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::Mutex;

use super::{
    connect::{BoxedTransport, Conn},
    context::Context,
};
use crate::{error::Error, protocol::RespValue};

/// Opens a transport: `(context, network, address)`.
pub type DialHook =
    Arc<dyn Fn(Context, String, String) -> BoxFuture<'static, Result<BoxedTransport, Error>> + Send + Sync>;

/// Executes a single command and returns its reply.
pub type ProcessHook =
    Arc<dyn Fn(Context, RespValue) -> BoxFuture<'static, Result<RespValue, Error>> + Send + Sync>;

/// Executes a batch of commands, returning one reply per command in order.  Server error
/// replies are returned in place as `RespValue::Error`, only failures that affect the whole
/// batch are returned as `Err`.
pub type ProcessPipelineHook = Arc<
    dyn Fn(Context, Vec<RespValue>) -> BoxFuture<'static, Result<Vec<RespValue>, Error>>
        + Send
        + Sync,
>;

pub trait Hook: Send + Sync + 'static {
    fn dial_hook(&self, next: DialHook) -> DialHook {
        next
    }

    fn process_hook(&self, next: ProcessHook) -> ProcessHook {
        next
    }

    fn process_pipeline_hook(&self, next: ProcessPipelineHook) -> ProcessPipelineHook {
        next
    }
}

/// The registered hooks, in registration order.  Never changes once the client is built.
///
/// Client-wide operations are folded once in `Client::new`.  Bases bound to a single
/// connection (the handshake, a transaction) are folded when that connection or session is
/// created, over the same fixed list.
#[derive(Clone)]
pub(crate) struct HookChain {
    hooks: Arc<[Arc<dyn Hook>]>,
}

impl HookChain {
    pub(crate) fn new(hooks: Vec<Arc<dyn Hook>>) -> Self {
        HookChain {
            hooks: hooks.into(),
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.hooks.len()
    }

    pub(crate) fn dial(&self, base: DialHook) -> DialHook {
        self.hooks
            .iter()
            .rev()
            .fold(base, |next, hook| hook.dial_hook(next))
    }

    pub(crate) fn process(&self, base: ProcessHook) -> ProcessHook {
        self.hooks
            .iter()
            .rev()
            .fold(base, |next, hook| hook.process_hook(next))
    }

    pub(crate) fn pipeline(&self, base: ProcessPipelineHook) -> ProcessPipelineHook {
        self.hooks
            .iter()
            .rev()
            .fold(base, |next, hook| hook.process_pipeline_hook(next))
    }
}

impl Default for HookChain {
    fn default() -> Self {
        HookChain::new(Vec::new())
    }
}

/// A connection shared between the caller and a hook-wrapped function bound to it.
pub(crate) type Pinned<C> = Arc<Mutex<C>>;

/// The innermost single-command function for a connection that is not drawn from the pool.
pub(crate) fn pinned_process<C>(conn: Pinned<C>) -> ProcessHook
where
    C: BorrowMut<Conn> + Send + 'static,
{
    Arc::new(move |ctx, cmd| {
        let conn = conn.clone();
        Box::pin(async move {
            let mut guard = conn.lock().await;
            let conn = BorrowMut::<Conn>::borrow_mut(&mut *guard);
            ctx.run(conn.roundtrip(&cmd)).await??.into_result()
        })
    })
}

/// The innermost batch function for a connection that is not drawn from the pool.
pub(crate) fn pinned_pipeline<C>(conn: Pinned<C>) -> ProcessPipelineHook
where
    C: BorrowMut<Conn> + Send + 'static,
{
    Arc::new(move |ctx, cmds| {
        let conn = conn.clone();
        Box::pin(async move {
            let mut guard = conn.lock().await;
            let conn = BorrowMut::<Conn>::borrow_mut(&mut *guard);
            ctx.run(conn.roundtrip_batch(&cmds)).await?
        })
    })
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};

    use super::{Hook, HookChain, ProcessHook};
    use crate::{
        client::context::Context,
        error::{self, Error},
        protocol::RespValue,
    };

    struct Tracing {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Hook for Tracing {
        fn process_hook(&self, next: ProcessHook) -> ProcessHook {
            let name = self.name;
            let log = self.log.clone();
            Arc::new(move |ctx, cmd| {
                let next = next.clone();
                let log = log.clone();
                Box::pin(async move {
                    log.lock().unwrap().push(format!("{}-start", name));
                    let res = next(ctx, cmd).await;
                    log.lock().unwrap().push(format!("{}-end", name));
                    res
                })
            })
        }
    }

    struct Refuse;

    impl Hook for Refuse {
        fn process_hook(&self, _next: ProcessHook) -> ProcessHook {
            Arc::new(|_, _| Box::pin(async { Err(error::internal("hook error")) }))
        }
    }

    fn base(log: Arc<Mutex<Vec<String>>>) -> ProcessHook {
        Arc::new(move |_, _| {
            let log = log.clone();
            Box::pin(async move {
                log.lock().unwrap().push("base".into());
                Ok(RespValue::SimpleString("PONG".into()))
            })
        })
    }

    fn tracing(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Arc<dyn Hook> {
        Arc::new(Tracing {
            name,
            log: log.clone(),
        })
    }

    #[tokio::test]
    async fn first_registered_is_outermost() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = HookChain::new(vec![
            tracing("hook-1", &log),
            tracing("hook-2", &log),
            tracing("hook-3", &log),
        ]);
        let process = chain.process(base(log.clone()));

        let reply = process(Context::background(), resp_array!["PING"])
            .await
            .unwrap();
        assert_eq!(reply, RespValue::SimpleString("PONG".into()));
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "hook-1-start",
                "hook-2-start",
                "hook-3-start",
                "base",
                "hook-3-end",
                "hook-2-end",
                "hook-1-end",
            ]
        );
    }

    #[tokio::test]
    async fn short_circuit_skips_inner_hooks_only() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = HookChain::new(vec![
            tracing("outer", &log),
            Arc::new(Refuse) as Arc<dyn Hook>,
            tracing("inner", &log),
        ]);
        let process = chain.process(base(log.clone()));

        let err = process(Context::background(), resp_array!["PING"])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal(ref msg) if msg == "hook error"));
        assert_eq!(*log.lock().unwrap(), vec!["outer-start", "outer-end"]);
    }

    #[tokio::test]
    async fn empty_chain_is_the_base() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = HookChain::default();
        assert_eq!(chain.len(), 0);
        let process = chain.process(base(log.clone()));
        process(Context::background(), resp_array!["PING"])
            .await
            .unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["base"]);
    }
}
