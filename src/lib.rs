/*
 * Copyright 2017-2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! A pooled client for Redis using Tokio.
//!
//! [`Client`](client/struct.Client.html) owns a bounded pool of connections.  Each command
//! takes a connection, is sent through the registered [`Hook`](client/trait.Hook.html)s, and
//! on failure is retried according to a [`RetryPolicy`](client/trait.RetryPolicy.html) before
//! the connection is returned to the pool, or closed if it can no longer be trusted.
//!
//! Commands are built as [`RespValue`](protocol/enum.RespValue.html) arrays, most easily with
//! the `resp_array!` macro, and replies can be converted with
//! [`FromResp`](protocol/trait.FromResp.html):
//!
//! ```no_run
//! #[macro_use]
//! extern crate redis_pool_client;
//!
//! use redis_pool_client::client::{Client, Context, Options};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), redis_pool_client::error::Error> {
//!     let client = Client::new(&Options::new("127.0.0.1:6379"));
//!     let ctx = Context::background();
//!
//!     let results = client
//!         .execute_batch(&ctx, vec![resp_array!["INCR", "ctr"], resp_array!["GET", "ctr"]])
//!         .await;
//!     println!("{:?}", results);
//!
//!     client.close()
//! }
//! ```
//!
//! ## Authentication
//!
//! Credentials come from, in order of preference, a streaming provider that pushes rotated
//! credentials, a context-aware callback, a plain callback, or the static username and
//! password options.  Each new connection resolves credentials afresh, so a rotation applies
//! to every connection opened after it.
//!
//! ## Cancellation
//!
//! Every operation takes a [`Context`](client/struct.Context.html).  Cancelling it, or letting
//! its deadline pass, stops waiting for the pool, dialing, I/O and retry backoff alike.

#[macro_use]
pub mod protocol;

pub mod client;

pub mod error;

mod task;
