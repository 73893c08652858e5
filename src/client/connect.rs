/*
 * Copyright 2017-2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{Decoder, Framed};

use super::{
    context::Context,
    credentials::Credentials,
    hooks::{self, DialHook, HookChain},
    options::Options,
};
use crate::{
    error::{self, ConnectionReason, Error},
    protocol::{RespCodec, RespValue},
    task,
};

/// Anything a connection can be layered over: TCP, Unix sockets, TLS, or an in-memory pipe.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedTransport = Box<dyn Transport>;

pub type RespConnection = Framed<BoxedTransport, RespCodec>;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// A single connection to the server.
///
/// A connection becomes unusable after any transport or protocol failure, and also if a
/// request was written but its replies were never fully read (e.g. the caller was cancelled
/// mid-flight), since the position in the reply stream is then unknown.
pub struct Conn {
    id: u64,
    framed: RespConnection,
    created_at: Instant,
    used_at: Instant,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    broken: bool,
    in_flight: bool,
}

fn timed_out(op: &str) -> Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("{} timed out", op)).into()
}

impl Conn {
    pub fn new(
        transport: BoxedTransport,
        read_timeout: Option<Duration>,
        write_timeout: Option<Duration>,
    ) -> Self {
        let now = Instant::now();
        Conn {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            framed: RespCodec.framed(transport),
            created_at: now,
            used_at: now,
            read_timeout,
            write_timeout,
            broken: false,
            in_flight: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// When this connection last sent a request or received a reply.
    pub fn used_at(&self) -> Instant {
        self.used_at
    }

    pub fn set_used_at(&mut self, at: Instant) {
        self.used_at = at;
    }

    pub fn is_usable(&self) -> bool {
        !self.broken && !self.in_flight
    }

    fn fail(&mut self, err: Error) -> Error {
        if err.is_connection_fatal() {
            self.broken = true;
        }
        err
    }

    /// Writes every command in `cmds` and flushes them together.
    pub async fn write(&mut self, cmds: &[RespValue]) -> Result<(), Error> {
        self.used_at = Instant::now();
        let framed = &mut self.framed;
        let written = task::timeout(self.write_timeout, async move {
            for cmd in cmds {
                framed.feed(cmd).await?;
            }
            SinkExt::<&RespValue>::flush(framed).await
        })
        .await;
        match written {
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => Err(self.fail(e.into())),
            None => Err(self.fail(timed_out("write"))),
        }
    }

    /// Reads the next reply.
    pub async fn read(&mut self) -> Result<RespValue, Error> {
        match task::timeout(self.read_timeout, self.framed.next()).await {
            Some(Some(Ok(reply))) => {
                self.used_at = Instant::now();
                Ok(reply)
            }
            Some(Some(Err(e))) => Err(self.fail(e)),
            Some(None) => Err(self.fail(Error::Connection(ConnectionReason::Closed))),
            None => Err(self.fail(timed_out("read"))),
        }
    }

    pub async fn roundtrip(&mut self, cmd: &RespValue) -> Result<RespValue, Error> {
        let mut replies = self.roundtrip_batch(std::slice::from_ref(cmd)).await?;
        replies
            .pop()
            .ok_or_else(|| error::internal("No reply read for command"))
    }

    /// Sends `cmds` as one write, then reads exactly one reply per command, in order.
    pub async fn roundtrip_batch(&mut self, cmds: &[RespValue]) -> Result<Vec<RespValue>, Error> {
        if !self.is_usable() {
            return Err(Error::Connection(ConnectionReason::Closed));
        }
        self.in_flight = true;
        self.write(cmds).await?;
        let mut replies = Vec::with_capacity(cmds.len());
        for _ in cmds {
            replies.push(self.read().await?);
        }
        self.in_flight = false;
        Ok(replies)
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .field("used_at", &self.used_at)
            .field("usable", &self.is_usable())
            .finish()
    }
}

/// The dialer used when `Options::dialer` is not set.
pub(crate) fn default_dialer() -> DialHook {
    Arc::new(|_ctx, network, addr| Box::pin(async move { dial(&network, &addr).await }))
}

async fn dial(network: &str, addr: &str) -> Result<BoxedTransport, Error> {
    match network {
        "tcp" => Ok(Box::new(dial_tcp(addr).await?)),
        #[cfg(unix)]
        "unix" => Ok(Box::new(tokio::net::UnixStream::connect(addr).await?)),
        other => Err(error::internal(format!("Unsupported network: {}", other))),
    }
}

async fn dial_tcp(addr: &str) -> Result<TcpStream, Error> {
    let mut last_err = None;
    for resolved in tokio::net::lookup_host(addr).await? {
        match TcpStream::connect(resolved).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                let keepalive = socket2::TcpKeepalive::new().with_time(Duration::from_secs(300));
                socket2::SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }
    match last_err {
        Some(e) => Err(e.into()),
        None => Err(Error::Connection(ConnectionReason::ConnectionFailed)),
    }
}

#[cfg(feature = "with-rustls")]
pub(crate) async fn wrap_tls(addr: &str, transport: BoxedTransport) -> Result<BoxedTransport, Error> {
    use tokio_rustls::{
        rustls::{pki_types::ServerName, ClientConfig, RootCertStore},
        TlsConnector,
    };

    let host = addr.rsplit_once(':').map_or(addr, |(host, _)| host).to_owned();
    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    let server_name = ServerName::try_from(host)
        .map_err(|_| error::internal("Invalid DNS name for TLS"))?;
    let stream = TlsConnector::from(Arc::new(config))
        .connect(server_name, transport)
        .await?;
    Ok(Box::new(stream))
}

#[cfg(all(feature = "tls", not(feature = "with-rustls")))]
pub(crate) async fn wrap_tls(_addr: &str, _transport: BoxedTransport) -> Result<BoxedTransport, Error> {
    Err(error::internal("TLS requested but no TLS backend is enabled"))
}

/// Dials through the hook chain and the dial timeout, producing a bare connection.
pub(crate) async fn open(ctx: &Context, dial: &DialHook, opts: &Options) -> Result<Conn, Error> {
    let dialing = dial(ctx.clone(), opts.network.clone(), opts.addr.clone());
    let transport = match task::timeout(opts.dial_timeout, ctx.run(dialing)).await {
        Some(dialed) => dialed??,
        None => return Err(Error::Connection(ConnectionReason::DialTimeout)),
    };
    #[cfg(feature = "tls")]
    let transport = if opts.tls {
        wrap_tls(&opts.addr, transport).await?
    } else {
        transport
    };
    log::debug!("Connected to {}", opts.addr);
    Ok(Conn::new(transport, opts.read_timeout, opts.write_timeout))
}

fn hello_command(creds: &Credentials, client_name: Option<&str>) -> RespValue {
    let mut hello = resp_array!["HELLO", "2"];
    if !creds.password().is_empty() {
        let username = match creds.username() {
            "" => "default",
            name => name,
        };
        hello.push("AUTH");
        hello.push(username);
        hello.push(creds.password());
    }
    if let Some(name) = client_name {
        hello.push("SETNAME");
        hello.push(name);
    }
    hello
}

fn legacy_commands(creds: &Credentials, opts: &Options) -> Vec<RespValue> {
    let mut cmds = Vec::new();
    if !creds.password().is_empty() {
        let mut auth = resp_array!["AUTH"];
        if !creds.username().is_empty() {
            auth.push(creds.username());
        }
        auth.push(creds.password());
        cmds.push(auth);
    }
    if let Some(name) = opts.client_name.as_deref() {
        cmds.push(resp_array!["CLIENT", "SETNAME", name]);
    }
    cmds
}

fn check_replies(replies: Vec<RespValue>) -> Result<(), Error> {
    for reply in replies {
        if let RespValue::Error(msg) = reply {
            return Err(error::handshake_reply(msg));
        }
    }
    Ok(())
}

/// Authenticates and prepares a freshly dialled connection.
///
/// `HELLO 2` carries the credentials and client name; servers that predate `HELLO` get the
/// equivalent `AUTH` and `CLIENT SETNAME`.  Everything is sent through the pipeline hooks so
/// hooks observe the handshake.  `on_connect` runs last.
pub(crate) async fn handshake(
    ctx: &Context,
    conn: Conn,
    creds: &Credentials,
    opts: &Options,
    hooks: &HookChain,
) -> Result<Conn, Error> {
    let pinned = Arc::new(Mutex::new(Box::new(conn)));
    let pipeline = hooks.pipeline(hooks::pinned_pipeline(pinned.clone()));

    let hello = pipeline(
        ctx.clone(),
        vec![hello_command(creds, opts.client_name.as_deref())],
    )
    .await?;
    let mut cmds = match hello.into_iter().next() {
        Some(RespValue::Error(msg)) => {
            let err = error::handshake_reply(msg);
            if err.kind() == error::ErrorKind::Authentication {
                return Err(err);
            }
            log::debug!("HELLO not supported ({}), falling back to AUTH", err);
            legacy_commands(creds, opts)
        }
        _ => Vec::new(),
    };
    if opts.db > 0 {
        cmds.push(resp_array!["SELECT", opts.db]);
    }
    if !cmds.is_empty() {
        check_replies(pipeline(ctx.clone(), cmds).await?)?;
    }
    drop(pipeline);

    let mut conn = match Arc::try_unwrap(pinned) {
        Ok(mutex) => *mutex.into_inner(),
        Err(_) => return Err(error::internal("Connection still shared after handshake")),
    };
    if let Some(on_connect) = &opts.on_connect {
        on_connect(ctx.clone(), &mut conn).await?;
    }
    Ok(conn)
}
