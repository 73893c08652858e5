/*
 * Copyright 2017-2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! Error handling

use std::{error, fmt, io, sync::Arc};

use futures_channel::oneshot;

use crate::protocol::RespValue;

#[derive(Debug, Clone)]
pub enum Error {
    /// The operation's context was cancelled or its deadline passed
    Cancelled(CancelReason),

    /// An IO error occurred on the underlying transport
    IO(Arc<io::Error>),

    /// The connection could not be established, or was closed unexpectedly
    Connection(ConnectionReason),

    /// The server rejected the presented credentials
    Auth(String),

    /// A RESP parsing/serialising error occurred
    RESP(String, Option<RespValue>),

    /// A well-formed error reply from the server
    Remote(String),

    /// No pooled connection became available within the pool timeout
    PoolTimeout,

    /// A watched key changed before EXEC, the transaction was not applied
    TxAborted,

    /// The client has been closed
    ClientClosed,

    /// An error annotated by a hook, the original error is kept for classification
    Wrapped(String, Box<Error>),

    /// A non-specific internal error that prevented an operation from completing
    Internal(String),
}

/// The coarse classification used by retry policies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Cancellation,
    Transport,
    Authentication,
    Protocol,
    Application,
    PoolExhausted,
    TransactionAborted,
    Closed,
    Other,
}

/// Why a context stopped an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Canceled,
    DeadlineExceeded,
}

/// Details of a `Connection` error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionReason {
    /// The dial did not complete within the dial timeout
    DialTimeout,
    /// The address did not resolve to anything that accepted a connection
    ConnectionFailed,
    /// The server closed the connection while a reply was outstanding
    Closed,
}

pub(crate) fn internal(msg: impl Into<String>) -> Error {
    Error::Internal(msg.into())
}

pub(crate) fn resp(msg: impl Into<String>, resp: RespValue) -> Error {
    Error::RESP(msg.into(), Some(resp))
}

const AUTH_PREFIXES: &[&str] = &["WRONGPASS", "NOAUTH", "ERR invalid password", "ERR AUTH"];

const TRANSIENT_PREFIXES: &[&str] = &[
    "LOADING ",
    "READONLY ",
    "MASTERDOWN ",
    "TRYAGAIN ",
    "CLUSTERDOWN ",
];

/// Turns an error reply received during connection set-up into either an authentication
/// failure or a plain remote error.
pub(crate) fn handshake_reply(msg: String) -> Error {
    if AUTH_PREFIXES.iter().any(|p| msg.starts_with(p)) {
        Error::Auth(msg)
    } else {
        Error::Remote(msg)
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Cancelled(_) => ErrorKind::Cancellation,
            Error::IO(_) | Error::Connection(_) => ErrorKind::Transport,
            Error::Auth(_) => ErrorKind::Authentication,
            Error::RESP(_, _) => ErrorKind::Protocol,
            Error::Remote(_) => ErrorKind::Application,
            Error::PoolTimeout => ErrorKind::PoolExhausted,
            Error::TxAborted => ErrorKind::TransactionAborted,
            Error::ClientClosed => ErrorKind::Closed,
            Error::Wrapped(_, inner) => inner.kind(),
            Error::Internal(_) => ErrorKind::Other,
        }
    }

    /// Annotate this error with a message, keeping its classification.
    pub fn wrap(self, msg: impl Into<String>) -> Error {
        Error::Wrapped(msg.into(), Box::new(self))
    }

    /// The innermost error, looking through any hook annotations.
    pub fn root(&self) -> &Error {
        match self {
            Error::Wrapped(_, inner) => inner.root(),
            other => other,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancellation
    }

    /// True for read, write and dial timeouts.
    pub fn is_timeout(&self) -> bool {
        match self.root() {
            Error::IO(err) => err.kind() == io::ErrorKind::TimedOut,
            Error::Connection(ConnectionReason::DialTimeout) => true,
            _ => false,
        }
    }

    /// True for server replies that describe a temporary server state rather than a problem
    /// with the command.
    pub fn is_transient_remote(&self) -> bool {
        match self.root() {
            Error::Remote(msg) => TRANSIENT_PREFIXES
                .iter()
                .any(|p| msg.starts_with(p) || msg.as_str() == p.trim_end()),
            _ => false,
        }
    }

    /// Whether a connection that produced this error can still be trusted.
    pub(crate) fn is_connection_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Transport | ErrorKind::Protocol | ErrorKind::Cancellation
        )
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::IO(Arc::new(err))
    }
}

impl From<oneshot::Canceled> for Error {
    fn from(_: oneshot::Canceled) -> Error {
        Error::ClientClosed
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::IO(err) => Some(err.as_ref()),
            Error::Wrapped(_, inner) => Some(inner.as_ref()),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Cancelled(CancelReason::Canceled) => f.write_str("context canceled"),
            Error::Cancelled(CancelReason::DeadlineExceeded) => {
                f.write_str("context deadline exceeded")
            }
            Error::IO(err) => fmt::Display::fmt(err, f),
            Error::Connection(ConnectionReason::DialTimeout) => f.write_str("dial timed out"),
            Error::Connection(ConnectionReason::ConnectionFailed) => {
                f.write_str("could not connect to any resolved address")
            }
            Error::Connection(ConnectionReason::Closed) => {
                f.write_str("connection closed by server")
            }
            Error::Auth(s) => f.write_str(s),
            Error::RESP(s, _) => f.write_str(s),
            Error::Remote(s) => f.write_str(s),
            Error::PoolTimeout => f.write_str("connection pool timeout"),
            Error::TxAborted => f.write_str("transaction aborted: watched key changed"),
            Error::ClientClosed => f.write_str("client is closed"),
            Error::Wrapped(msg, inner) => write!(f, "{}: {}", msg, inner),
            Error::Internal(s) => f.write_str(s),
        }
    }
}

#[cfg(test)]
mod test {
    use std::io;

    use super::{handshake_reply, Error, ErrorKind};

    #[test]
    fn wrapping_keeps_the_kind() {
        let err: Error = io::Error::new(io::ErrorKind::TimedOut, "read").into();
        let wrapped = err.wrap("wrapped error");
        assert_eq!(wrapped.kind(), ErrorKind::Transport);
        assert!(wrapped.is_timeout());
        assert_eq!(wrapped.to_string(), "wrapped error: read");
    }

    #[test]
    fn handshake_errors_are_classified() {
        let auth = handshake_reply("WRONGPASS invalid username-password pair".into());
        assert_eq!(auth.kind(), ErrorKind::Authentication);

        let other = handshake_reply("ERR unknown command 'HELLO'".into());
        assert_eq!(other.kind(), ErrorKind::Application);
    }

    #[test]
    fn transient_remote_errors() {
        assert!(Error::Remote("LOADING Redis is loading".into()).is_transient_remote());
        assert!(Error::Remote("TRYAGAIN".into()).is_transient_remote());
        assert!(!Error::Remote("WRONGTYPE Operation".into()).is_transient_remote());
    }
}
