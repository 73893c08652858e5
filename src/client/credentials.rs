/*
 * Copyright 2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! Resolving the username and password presented when a connection is opened.
//!
//! Sources are consulted in a fixed order, the first one configured wins:
//!
//! 1. a `StreamingCredentialsProvider`, subscribed to once and then pushing updates,
//! 2. a context-aware provider callback,
//! 3. a plain provider callback,
//! 4. the static `username`/`password` options,
//! 5. nothing, in which case no authentication is sent.
//!
//! A pushed update only affects connections opened afterwards, connections that already
//! authenticated keep their session.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::BoxFuture;
use tokio::sync::{watch, OnceCell};

use super::{context::Context, options::Options};
use crate::error::Error;

#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    /// No password means no authentication step.
    pub fn is_empty(&self) -> bool {
        self.password.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

pub type CredentialsProvider = Arc<dyn Fn() -> Credentials + Send + Sync>;

pub type CredentialsProviderContext =
    Arc<dyn Fn(Context) -> BoxFuture<'static, Result<Credentials, Error>> + Send + Sync>;

/// Stops a streaming subscription.  Called at most once.
pub type Unsubscribe = Box<dyn FnOnce() -> Result<(), Error> + Send>;

/// A credential source that pushes rotated credentials rather than being polled.
pub trait StreamingCredentialsProvider: Send + Sync + 'static {
    /// Start delivering updates to `listener`, returning the credentials to use right now.
    fn subscribe(&self, listener: CredentialsListener) -> Result<(Credentials, Unsubscribe), Error>;
}

/// A credential pair together with how many times credentials have been installed.
#[derive(Debug)]
pub(crate) struct CredentialState {
    pub(crate) credentials: Credentials,
    pub(crate) version: u64,
}

struct Shared {
    state: watch::Sender<Arc<CredentialState>>,
}

impl Shared {
    fn new(initial: Credentials) -> Self {
        let (state, _) = watch::channel(Arc::new(CredentialState {
            credentials: initial,
            version: 0,
        }));
        Shared { state }
    }

    fn current(&self) -> Arc<CredentialState> {
        self.state.borrow().clone()
    }
}

/// Handed to a streaming provider; each `on_next` replaces the credentials used for new
/// connections.
#[derive(Clone)]
pub struct CredentialsListener {
    shared: Arc<Shared>,
}

impl CredentialsListener {
    pub fn on_next(&self, credentials: Credentials) {
        self.shared.state.send_modify(|state| {
            *state = Arc::new(CredentialState {
                credentials,
                version: state.version + 1,
            });
        });
        log::debug!("Credentials rotated");
    }

    /// Report a failure from the provider.  The last good credentials stay in use.
    pub fn on_error(&self, err: Error) {
        log::warn!(
            "Credentials provider error, keeping credentials version {}: {}",
            self.shared.current().version,
            err
        );
    }
}

impl fmt::Debug for CredentialsListener {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CredentialsListener").finish_non_exhaustive()
    }
}

pub(crate) struct CredentialsResolver {
    fixed: Credentials,
    provider: Option<CredentialsProvider>,
    provider_context: Option<CredentialsProviderContext>,
    streaming: Option<Arc<dyn StreamingCredentialsProvider>>,
    shared: Arc<Shared>,
    subscribed: OnceCell<()>,
    unsubscribe: Mutex<Option<Unsubscribe>>,
    closed: AtomicBool,
}

impl CredentialsResolver {
    pub(crate) fn new(opts: &Options) -> Self {
        let fixed = Credentials::new(opts.username.clone(), opts.password.clone());
        CredentialsResolver {
            shared: Arc::new(Shared::new(fixed.clone())),
            fixed,
            provider: opts.credentials_provider.clone(),
            provider_context: opts.credentials_provider_context.clone(),
            streaming: opts.streaming_credentials_provider.clone(),
            subscribed: OnceCell::new(),
            unsubscribe: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) async fn resolve(&self, ctx: &Context) -> Result<Credentials, Error> {
        ctx.check()?;
        if let Some(streaming) = &self.streaming {
            self.subscribed
                .get_or_try_init(|| async { self.subscribe(streaming.as_ref()) })
                .await?;
            return Ok(self.shared.current().credentials.clone());
        }
        if let Some(provider) = &self.provider_context {
            return ctx.run(provider(ctx.clone())).await?;
        }
        if let Some(provider) = &self.provider {
            return Ok(provider());
        }
        Ok(self.fixed.clone())
    }

    fn subscribe(&self, provider: &dyn StreamingCredentialsProvider) -> Result<(), Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ClientClosed);
        }
        let listener = CredentialsListener {
            shared: self.shared.clone(),
        };
        let (initial, unsubscribe) = provider.subscribe(listener)?;

        // A push that raced the subscribe call is newer than `initial`.
        self.shared.state.send_if_modified(|state| {
            if state.version > 0 {
                return false;
            }
            *state = Arc::new(CredentialState {
                credentials: initial,
                version: 1,
            });
            true
        });

        let mut slot = self
            .unsubscribe
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.closed.load(Ordering::SeqCst) {
            drop(slot);
            unsubscribe()?;
            return Err(Error::ClientClosed);
        }
        *slot = Some(unsubscribe);
        log::debug!("Subscribed to streaming credentials");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn version(&self) -> u64 {
        self.shared.current().version
    }

    /// Ends any streaming subscription.  Safe to call repeatedly and concurrently, the
    /// provider's unsubscribe runs at most once.
    pub(crate) fn close(&self) -> Result<(), Error> {
        self.closed.store(true, Ordering::SeqCst);
        let unsubscribe = self
            .unsubscribe
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match unsubscribe {
            Some(unsubscribe) => unsubscribe(),
            None => Ok(()),
        }
    }
}

impl Drop for CredentialsResolver {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("Error ending credentials subscription: {}", e);
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::{
        Credentials, CredentialsListener, CredentialsResolver, StreamingCredentialsProvider,
        Unsubscribe,
    };
    use crate::{
        client::{context::Context, options::Options},
        error::{self, Error},
    };

    #[derive(Default)]
    struct Streaming {
        listener: Mutex<Option<CredentialsListener>>,
        unsubscribed: Arc<AtomicUsize>,
        push_during_subscribe: bool,
        fail: bool,
    }

    impl StreamingCredentialsProvider for Streaming {
        fn subscribe(
            &self,
            listener: CredentialsListener,
        ) -> Result<(Credentials, Unsubscribe), Error> {
            if self.fail {
                return Err(error::internal("subscription refused"));
            }
            if self.push_during_subscribe {
                listener.on_next(Credentials::new("streaming", "pushed"));
            }
            *self.listener.lock().unwrap() = Some(listener);
            let unsubscribed = self.unsubscribed.clone();
            Ok((
                Credentials::new("streaming", "initial"),
                Box::new(move || {
                    unsubscribed.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            ))
        }
    }

    fn all_sources(streaming: Option<Arc<Streaming>>) -> Options {
        let mut opts = Options::new("localhost:6379");
        opts.username("static")
            .password("static-pass")
            .credentials_provider(|| Credentials::new("plain", "plain-pass"))
            .credentials_provider_context(Arc::new(|_ctx| {
                Box::pin(async { Ok(Credentials::new("context", "context-pass")) })
            }));
        if let Some(streaming) = streaming {
            opts.streaming_credentials_provider(streaming);
        }
        opts
    }

    async fn resolved_user(opts: &Options) -> String {
        CredentialsResolver::new(opts)
            .resolve(&Context::background())
            .await
            .unwrap()
            .username()
            .to_owned()
    }

    #[tokio::test]
    async fn sources_are_consulted_in_priority_order() {
        let mut opts = all_sources(Some(Arc::new(Streaming::default())));
        assert_eq!(resolved_user(&opts).await, "streaming");

        opts.streaming_credentials_provider = None;
        assert_eq!(resolved_user(&opts).await, "context");

        opts.credentials_provider_context = None;
        assert_eq!(resolved_user(&opts).await, "plain");

        opts.credentials_provider = None;
        assert_eq!(resolved_user(&opts).await, "static");

        let bare = Options::new("localhost:6379");
        let creds = CredentialsResolver::new(&bare)
            .resolve(&Context::background())
            .await
            .unwrap();
        assert!(creds.is_empty());
    }

    #[tokio::test]
    async fn pushes_replace_the_current_pair() {
        let streaming = Arc::new(Streaming::default());
        let resolver = CredentialsResolver::new(&all_sources(Some(streaming.clone())));
        let ctx = Context::background();

        assert_eq!(resolver.resolve(&ctx).await.unwrap().password(), "initial");
        assert_eq!(resolver.version(), 1);

        let listener = streaming.listener.lock().unwrap().clone().unwrap();
        listener.on_next(Credentials::new("streaming", "rotated"));
        assert_eq!(resolver.resolve(&ctx).await.unwrap().password(), "rotated");
        assert_eq!(resolver.version(), 2);

        listener.on_error(error::internal("token endpoint down"));
        assert_eq!(resolver.resolve(&ctx).await.unwrap().password(), "rotated");
        assert_eq!(resolver.version(), 2);
    }

    #[tokio::test]
    async fn push_during_subscribe_is_not_overwritten() {
        let streaming = Arc::new(Streaming {
            push_during_subscribe: true,
            ..Streaming::default()
        });
        let resolver = CredentialsResolver::new(&all_sources(Some(streaming)));
        let creds = resolver.resolve(&Context::background()).await.unwrap();
        assert_eq!(creds.password(), "pushed");
    }

    #[tokio::test]
    async fn subscribe_failure_is_returned() {
        let streaming = Arc::new(Streaming {
            fail: true,
            ..Streaming::default()
        });
        let resolver = CredentialsResolver::new(&all_sources(Some(streaming)));
        let err = resolver.resolve(&Context::background()).await.unwrap_err();
        assert_eq!(err.to_string(), "subscription refused");
    }

    #[tokio::test]
    async fn close_unsubscribes_exactly_once() {
        let streaming = Arc::new(Streaming::default());
        let resolver = CredentialsResolver::new(&all_sources(Some(streaming.clone())));
        resolver.resolve(&Context::background()).await.unwrap();

        resolver.close().unwrap();
        resolver.close().unwrap();
        assert_eq!(streaming.unsubscribed.load(Ordering::SeqCst), 1);

        let dropped = Arc::new(Streaming::default());
        let resolver = CredentialsResolver::new(&all_sources(Some(dropped.clone())));
        resolver.resolve(&Context::background()).await.unwrap();
        drop(resolver);
        assert_eq!(dropped.unsubscribed.load(Ordering::SeqCst), 1);

        let closed = CredentialsResolver::new(&all_sources(Some(Arc::new(Streaming::default()))));
        closed.close().unwrap();
        assert!(matches!(
            closed.resolve(&Context::background()).await,
            Err(Error::ClientClosed)
        ));
    }
}
