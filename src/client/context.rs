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
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::{CancelReason, Error};

/// Carries cancellation and an optional deadline into every client operation.
///
/// Cloning is cheap and clones share cancellation.  Derived contexts (`with_cancel`,
/// `with_timeout`, `with_deadline`) are cancelled when their parent is, but cancelling a
/// derived context leaves the parent untouched.
#[derive(Debug, Clone, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Context::default()
    }

    pub fn with_cancel(&self) -> Self {
        Context {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// The earlier of `deadline` and any inherited deadline applies.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        };
        Context {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// The cancellation error, if this context is already done.
    pub fn err(&self) -> Option<Error> {
        if self.token.is_cancelled() {
            Some(Error::Cancelled(CancelReason::Canceled))
        } else if self.deadline.map_or(false, |d| Instant::now() >= d) {
            Some(Error::Cancelled(CancelReason::DeadlineExceeded))
        } else {
            None
        }
    }

    pub fn check(&self) -> Result<(), Error> {
        match self.err() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> Error {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.token.cancelled() => Error::Cancelled(CancelReason::Canceled),
                _ = tokio::time::sleep_until(deadline.into()) => {
                    Error::Cancelled(CancelReason::DeadlineExceeded)
                }
            },
            None => {
                self.token.cancelled().await;
                Error::Cancelled(CancelReason::Canceled)
            }
        }
    }

    /// Runs `future` unless the context finishes first, in which case the future is dropped.
    pub async fn run<F>(&self, future: F) -> Result<F::Output, Error>
    where
        F: Future,
    {
        self.check()?;
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            out = future => Ok(out),
        }
    }
}
