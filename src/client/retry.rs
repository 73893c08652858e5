/*
 * Copyright 2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use super::{context::Context, options::Options};
use crate::error::{Error, ErrorKind};

/// Decides whether a failed attempt is tried again, and after how long.
///
/// `attempt` counts retries already made, so it is `0` after the first failure.
pub trait RetryPolicy: Send + Sync + 'static {
    fn should_retry(&self, attempt: u32, err: &Error) -> bool;

    fn backoff(&self, attempt: u32) -> Duration;
}

/// Errors worth another attempt on a fresh or different connection.
///
/// Authentication failures are included because the next attempt dials a new connection and
/// resolves credentials again, picking up any rotation.
pub fn is_retryable(err: &Error) -> bool {
    match err.kind() {
        ErrorKind::Transport | ErrorKind::PoolExhausted | ErrorKind::Authentication => true,
        ErrorKind::Application => err.is_transient_remote(),
        ErrorKind::Cancellation
        | ErrorKind::Protocol
        | ErrorKind::TransactionAborted
        | ErrorKind::Closed
        | ErrorKind::Other => false,
    }
}

/// Exponential backoff from `min` doubling up to `max`, with up to 10% added jitter.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    max_retries: i32,
    min: Duration,
    max: Duration,
}

impl ExponentialBackoff {
    /// A negative `max_retries` disables retrying, as does zero.
    pub fn new(max_retries: i32, min: Duration, max: Duration) -> Self {
        ExponentialBackoff {
            max_retries,
            min,
            max,
        }
    }

    pub(crate) fn from_options(opts: &Options) -> Self {
        ExponentialBackoff::new(
            opts.max_retries,
            opts.min_retry_backoff,
            opts.max_retry_backoff,
        )
    }

    fn base(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(31);
        self.min.saturating_mul(factor).min(self.max)
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn should_retry(&self, attempt: u32, err: &Error) -> bool {
        self.max_retries > 0 && (attempt as i64) < self.max_retries as i64 && is_retryable(err)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base(attempt);
        let spread = (base.as_nanos() / 10) as u64;
        let jitter = if spread > 0 {
            Duration::from_nanos(rand::thread_rng().gen_range(0..spread))
        } else {
            Duration::ZERO
        };
        (base + jitter).min(self.max)
    }
}

/// Runs `attempt` until it succeeds or `policy` gives up, sleeping between attempts.
///
/// Cancellation of `ctx` ends the loop at once, and the cancellation error is returned in
/// place of whatever error the last attempt produced.
pub(crate) async fn with_retries<T, F, Fut>(
    ctx: &Context,
    policy: &dyn RetryPolicy,
    mut attempt: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut retries = 0;
    loop {
        ctx.check()?;
        let err = match attempt().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if let Some(cancelled) = ctx.err() {
            return Err(cancelled);
        }
        if err.is_cancelled() || !policy.should_retry(retries, &err) {
            return Err(err);
        }
        let backoff = policy.backoff(retries);
        log::debug!(
            "Attempt {} failed ({}), retrying in {:?}",
            retries + 1,
            err,
            backoff
        );
        if !backoff.is_zero() {
            ctx.run(tokio::time::sleep(backoff)).await?;
        }
        retries += 1;
    }
}
