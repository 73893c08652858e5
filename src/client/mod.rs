/*
 * Copyright 2017-2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! The client API itself.
//!
//! * `Client` is the entry point: a pool of connections behind `execute`, `execute_batch`,
//! pipelines and transactions.
//! * `Options` configures addresses, timeouts, pool bounds, retries, credentials and hooks.
//! * `Hook` lets callers wrap dialing, single commands and pipelines.
//! * `Context` carries cancellation and deadlines into every call.

mod connect;
mod context;
mod credentials;
mod executor;
mod hooks;
mod options;
mod pool;
mod retry;
mod transaction;

pub use self::connect::{BoxedTransport, Conn, Transport};
pub use self::context::Context;
pub use self::credentials::{
    Credentials, CredentialsListener, CredentialsProvider, CredentialsProviderContext,
    StreamingCredentialsProvider, Unsubscribe,
};
pub use self::executor::Client;
pub use self::hooks::{DialHook, Hook, ProcessHook, ProcessPipelineHook};
pub use self::options::{OnConnect, Options};
pub use self::pool::{PoolStats, PooledConn};
pub use self::retry::{is_retryable, ExponentialBackoff, RetryPolicy};
pub use self::transaction::{Pipeline, Transaction};
