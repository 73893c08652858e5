/*
 * Copyright 2020-2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;

use super::{
    connect::Conn,
    context::Context,
    credentials::{
        Credentials, CredentialsProvider, CredentialsProviderContext,
        StreamingCredentialsProvider,
    },
    hooks::{DialHook, Hook},
    retry::RetryPolicy,
};
use crate::error::Error;

/// Runs against every new connection once the handshake has succeeded.
pub type OnConnect =
    Arc<dyn for<'a> Fn(Context, &'a mut Conn) -> BoxFuture<'a, Result<(), Error>> + Send + Sync>;

const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_MIN_RETRY_BACKOFF: Duration = Duration::from_millis(8);
const DEFAULT_MAX_RETRY_BACKOFF: Duration = Duration::from_millis(512);
const DEFAULT_CONN_MAX_IDLE_TIME: Duration = Duration::from_secs(30 * 60);
const DEFAULT_MAX_RETRIES: i32 = 3;

/// Connection options
///
/// Options are set with chained setters, then passed to `Client::new` which takes its own
/// copy; changing an `Options` afterwards has no effect on a client already built.
///
/// ```
/// use std::time::Duration;
/// use redis_pool_client::client::Options;
///
/// let mut opts = Options::new("127.0.0.1:6379");
/// opts.password("secret").pool_size(4).read_timeout(Some(Duration::from_millis(500)));
/// ```
#[derive(Clone)]
pub struct Options {
    pub(crate) network: String,
    pub(crate) addr: String,
    pub(crate) dialer: Option<DialHook>,

    pub(crate) dial_timeout: Option<Duration>,
    pub(crate) read_timeout: Option<Duration>,
    pub(crate) write_timeout: Option<Duration>,
    write_timeout_set: bool,

    pub(crate) pool_size: usize,
    pub(crate) min_idle_conns: usize,
    pub(crate) pool_timeout: Option<Duration>,
    pub(crate) conn_max_idle_time: Option<Duration>,
    pub(crate) conn_max_lifetime: Option<Duration>,

    pub(crate) max_retries: i32,
    pub(crate) min_retry_backoff: Duration,
    pub(crate) max_retry_backoff: Duration,
    pub(crate) retry_policy: Option<Arc<dyn RetryPolicy>>,

    pub(crate) username: String,
    pub(crate) password: String,
    pub(crate) credentials_provider: Option<CredentialsProvider>,
    pub(crate) credentials_provider_context: Option<CredentialsProviderContext>,
    pub(crate) streaming_credentials_provider: Option<Arc<dyn StreamingCredentialsProvider>>,

    pub(crate) on_connect: Option<OnConnect>,
    pub(crate) hooks: Vec<Arc<dyn Hook>>,

    pub(crate) db: i64,
    pub(crate) client_name: Option<String>,

    #[cfg(feature = "tls")]
    pub(crate) tls: bool,
}

fn default_pool_size() -> usize {
    let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
    10 * cpus
}

impl Options {
    /// Options for a TCP connection to `addr` (`host:port`).
    pub fn new(addr: impl Into<String>) -> Self {
        Options {
            network: "tcp".into(),
            addr: addr.into(),
            dialer: None,
            dial_timeout: Some(DEFAULT_DIAL_TIMEOUT),
            read_timeout: Some(DEFAULT_READ_TIMEOUT),
            write_timeout: Some(DEFAULT_READ_TIMEOUT),
            write_timeout_set: false,
            pool_size: default_pool_size(),
            min_idle_conns: 0,
            pool_timeout: None,
            conn_max_idle_time: Some(DEFAULT_CONN_MAX_IDLE_TIME),
            conn_max_lifetime: None,
            max_retries: DEFAULT_MAX_RETRIES,
            min_retry_backoff: DEFAULT_MIN_RETRY_BACKOFF,
            max_retry_backoff: DEFAULT_MAX_RETRY_BACKOFF,
            retry_policy: None,
            username: String::new(),
            password: String::new(),
            credentials_provider: None,
            credentials_provider_context: None,
            streaming_credentials_provider: None,
            on_connect: None,
            hooks: Vec::new(),
            db: 0,
            client_name: None,
            #[cfg(feature = "tls")]
            tls: false,
        }
    }

    /// `tcp` (the default) or `unix`, in which case the address is a socket path.
    pub fn network(&mut self, network: impl Into<String>) -> &mut Self {
        self.network = network.into();
        self
    }

    /// Replace the built-in TCP/Unix dialer.  Dial hooks still wrap it.
    pub fn dialer(&mut self, dialer: DialHook) -> &mut Self {
        self.dialer = Some(dialer);
        self
    }

    pub fn dial_timeout(&mut self, timeout: Option<Duration>) -> &mut Self {
        self.dial_timeout = timeout;
        self
    }

    /// Timeout for reading a single reply, `None` to wait forever.  Unless set separately
    /// the write timeout follows it.
    pub fn read_timeout(&mut self, timeout: Option<Duration>) -> &mut Self {
        self.read_timeout = timeout;
        if !self.write_timeout_set {
            self.write_timeout = self.read_timeout;
        }
        self
    }

    pub fn write_timeout(&mut self, timeout: Option<Duration>) -> &mut Self {
        self.write_timeout = timeout;
        self.write_timeout_set = true;
        self
    }

    /// Maximum number of connections, idle and checked out together.
    pub fn pool_size(&mut self, size: usize) -> &mut Self {
        self.pool_size = size.max(1);
        self
    }

    pub fn min_idle_conns(&mut self, n: usize) -> &mut Self {
        self.min_idle_conns = n;
        self
    }

    /// How long `acquire` waits for a connection when the pool is full.  Defaults to the read
    /// timeout plus one second.
    pub fn pool_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.pool_timeout = Some(timeout);
        self
    }

    pub fn conn_max_idle_time(&mut self, max: Option<Duration>) -> &mut Self {
        self.conn_max_idle_time = max;
        self
    }

    pub fn conn_max_lifetime(&mut self, max: Option<Duration>) -> &mut Self {
        self.conn_max_lifetime = max;
        self
    }

    /// Retries after the first attempt.  Negative disables retrying.
    pub fn max_retries(&mut self, retries: i32) -> &mut Self {
        self.max_retries = retries;
        self
    }

    pub fn min_retry_backoff(&mut self, backoff: Duration) -> &mut Self {
        self.min_retry_backoff = backoff;
        self
    }

    pub fn max_retry_backoff(&mut self, backoff: Duration) -> &mut Self {
        self.max_retry_backoff = backoff;
        self
    }

    /// Replace the default exponential backoff policy.  `max_retries` and the backoff bounds
    /// are ignored when a policy is set.
    pub fn retry_policy(&mut self, policy: Arc<dyn RetryPolicy>) -> &mut Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Set the username used when connecting
    pub fn username(&mut self, username: impl Into<String>) -> &mut Self {
        self.username = username.into();
        self
    }

    /// Set the password used when connecting
    pub fn password(&mut self, password: impl Into<String>) -> &mut Self {
        self.password = password.into();
        self
    }

    pub fn credentials_provider<F>(&mut self, provider: F) -> &mut Self
    where
        F: Fn() -> Credentials + Send + Sync + 'static,
    {
        self.credentials_provider = Some(Arc::new(provider));
        self
    }

    pub fn credentials_provider_context(
        &mut self,
        provider: CredentialsProviderContext,
    ) -> &mut Self {
        self.credentials_provider_context = Some(provider);
        self
    }

    pub fn streaming_credentials_provider(
        &mut self,
        provider: Arc<dyn StreamingCredentialsProvider>,
    ) -> &mut Self {
        self.streaming_credentials_provider = Some(provider);
        self
    }

    pub fn on_connect(&mut self, on_connect: OnConnect) -> &mut Self {
        self.on_connect = Some(on_connect);
        self
    }

    /// Append a hook.  Hooks added first wrap hooks added later.
    pub fn hook(&mut self, hook: impl Hook) -> &mut Self {
        self.hooks.push(Arc::new(hook));
        self
    }

    /// Database selected on every new connection.
    pub fn db(&mut self, db: i64) -> &mut Self {
        self.db = db;
        self
    }

    pub fn client_name(&mut self, name: impl Into<String>) -> &mut Self {
        self.client_name = Some(name.into());
        self
    }

    #[cfg(feature = "tls")]
    pub fn tls(&mut self, tls: bool) -> &mut Self {
        self.tls = tls;
        self
    }

    pub(crate) fn effective_pool_timeout(&self) -> Duration {
        match (self.pool_timeout, self.read_timeout) {
            (Some(timeout), _) => timeout,
            (None, Some(read)) => read + Duration::from_secs(1),
            (None, None) => Duration::from_secs(30),
        }
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Options")
            .field("network", &self.network)
            .field("addr", &self.addr)
            .field("dial_timeout", &self.dial_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("pool_size", &self.pool_size)
            .field("min_idle_conns", &self.min_idle_conns)
            .field("max_retries", &self.max_retries)
            .field("username", &self.username)
            .field("password", &if self.password.is_empty() { "" } else { "<redacted>" })
            .field("hooks", &self.hooks.len())
            .field("db", &self.db)
            .field("client_name", &self.client_name)
            .finish_non_exhaustive()
    }
}
