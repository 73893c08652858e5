/*
 * Copyright 2020-2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

use std::future::Future;
use std::time::Duration;

/// Spawns background work on the current runtime.  Outside a runtime the work is dropped and
/// a warning logged, background work is always best-effort.
pub(crate) fn spawn<F>(f: F)
where
    F: Future + Send + 'static,
    F::Output: Send,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(f);
        }
        Err(_) => log::warn!("No Tokio runtime available, background task not started"),
    }
}

/// Bounds `future` by `duration`, `None` meaning it timed out.  A `None` duration never times
/// out.
pub(crate) async fn timeout<T>(duration: Option<Duration>, future: T) -> Option<T::Output>
where
    T: Future,
{
    match duration {
        Some(duration) => tokio::time::timeout(duration, future).await.ok(),
        None => Some(future.await),
    }
}
