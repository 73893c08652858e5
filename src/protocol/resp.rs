/*
 * Copyright 2017-2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! Values exchanged with the server, and conversions in and out of them

use std::borrow::Cow;

use crate::error::{self, Error};

/// A single RESP value.  Commands are arrays of bulk strings; replies may be any variant.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RespValue {
    Nil,

    Array(Vec<RespValue>),

    /// Binary-safe payload, stored as raw bytes.
    BulkString(Vec<u8>),

    /// An error reply from the server
    Error(String),

    Integer(i64),

    SimpleString(String),
}

impl RespValue {
    /// Splits server error replies off from every other value.
    pub(crate) fn into_result(self) -> Result<RespValue, Error> {
        match self {
            RespValue::Error(string) => Err(Error::Remote(string)),
            other => Ok(other),
        }
    }

    /// Push an argument onto a command.
    ///
    /// Panics if `self` is not an array.
    pub fn push<T: Into<RespValue>>(&mut self, item: T) {
        match self {
            RespValue::Array(ref mut vals) => vals.push(item.into()),
            _ => panic!("Can only push to arrays"),
        }
    }

    /// Append a variable number of arguments, e.g. for `DEL k1 k2 …`.
    ///
    /// Panics if `self` is not an array.
    pub fn append<T>(mut self, other: impl IntoIterator<Item = T>) -> Self
    where
        T: Into<RespValue>,
    {
        match self {
            RespValue::Array(ref mut vals) => vals.extend(other.into_iter().map(Into::into)),
            _ => panic!("Can only append to arrays"),
        }
        self
    }

    /// The upper-cased command name of a command array, if it has one.
    pub fn command_name(&self) -> Option<String> {
        match self {
            RespValue::Array(args) => match args.first() {
                Some(RespValue::BulkString(name)) => {
                    Some(String::from_utf8_lossy(name).to_ascii_uppercase())
                }
                Some(RespValue::SimpleString(name)) => Some(name.to_ascii_uppercase()),
                _ => None,
            },
            _ => None,
        }
    }

    /// A human readable rendering of a command, arguments separated by spaces.
    pub fn to_command_string(&self) -> String {
        match self {
            RespValue::Array(args) => args
                .iter()
                .map(|arg| arg.as_text())
                .collect::<Vec<_>>()
                .join(" "),
            other => other.as_text().into_owned(),
        }
    }

    fn as_text(&self) -> Cow<'_, str> {
        match self {
            RespValue::Nil => Cow::Borrowed("(nil)"),
            RespValue::BulkString(bytes) => String::from_utf8_lossy(bytes),
            RespValue::Error(s) | RespValue::SimpleString(s) => Cow::Borrowed(s),
            RespValue::Integer(i) => Cow::Owned(i.to_string()),
            RespValue::Array(_) => Cow::Owned(self.to_command_string()),
        }
    }
}

/// A type that can be read out of a reply.
///
/// Error replies are turned into `Error::Remote` before `from_resp_int` sees them.
pub trait FromResp: Sized {
    fn from_resp(resp: RespValue) -> Result<Self, Error> {
        Self::from_resp_int(resp.into_result()?)
    }

    fn from_resp_int(resp: RespValue) -> Result<Self, Error>;
}

impl FromResp for RespValue {
    fn from_resp_int(resp: RespValue) -> Result<RespValue, Error> {
        Ok(resp)
    }
}

impl FromResp for String {
    fn from_resp_int(resp: RespValue) -> Result<String, Error> {
        match resp {
            RespValue::BulkString(ref bytes) => Ok(String::from_utf8_lossy(bytes).into_owned()),
            RespValue::SimpleString(string) => Ok(string),
            _ => Err(error::resp("Cannot convert into a string", resp)),
        }
    }
}

impl FromResp for Vec<u8> {
    fn from_resp_int(resp: RespValue) -> Result<Vec<u8>, Error> {
        match resp {
            RespValue::BulkString(bytes) => Ok(bytes),
            RespValue::SimpleString(string) => Ok(string.into_bytes()),
            _ => Err(error::resp("Not a bulk string", resp)),
        }
    }
}

impl FromResp for i64 {
    fn from_resp_int(resp: RespValue) -> Result<i64, Error> {
        match resp {
            RespValue::Integer(i) => Ok(i),
            RespValue::BulkString(ref bytes) => std::str::from_utf8(bytes)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| error::resp("Cannot be converted into an i64", resp.clone())),
            _ => Err(error::resp("Cannot be converted into an i64", resp)),
        }
    }
}

impl FromResp for bool {
    fn from_resp_int(resp: RespValue) -> Result<bool, Error> {
        match i64::from_resp_int(resp)? {
            0 => Ok(false),
            1 => Ok(true),
            x => Err(error::resp(
                "i64 value cannot be represented as bool",
                RespValue::Integer(x),
            )),
        }
    }
}

impl FromResp for () {
    fn from_resp_int(resp: RespValue) -> Result<(), Error> {
        match resp {
            RespValue::SimpleString(ref string) if string == "OK" => Ok(()),
            _ => Err(error::resp("Expected OK", resp)),
        }
    }
}

impl<T: FromResp> FromResp for Option<T> {
    fn from_resp_int(resp: RespValue) -> Result<Option<T>, Error> {
        match resp {
            RespValue::Nil => Ok(None),
            x => Ok(Some(T::from_resp_int(x)?)),
        }
    }
}

impl<T: FromResp> FromResp for Vec<T> {
    fn from_resp_int(resp: RespValue) -> Result<Vec<T>, Error> {
        match resp {
            RespValue::Array(ary) => ary.into_iter().map(T::from_resp).collect(),
            _ => Err(error::resp("Cannot be converted into a vector", resp)),
        }
    }
}

/// Build a command array.  Each element may be anything that is `Into<RespValue>`.
///
/// ```
/// #[macro_use]
/// extern crate redis_pool_client;
///
/// fn main() {
///     let key = format!("user:{}", 42);
///     let _cmd = resp_array!["SET", key, "payload"];
/// }
/// ```
#[macro_export]
macro_rules! resp_array {
    ($($e:expr),* $(,)?) => {
        {
            $crate::protocol::RespValue::Array(vec![
                $(
                    $e.into(),
                )*
            ])
        }
    }
}

macro_rules! bulk_from {
    ($($t:ty => |$v:ident| $body:expr),* $(,)?) => {
        $(
            impl<'a> From<$t> for RespValue {
                fn from($v: $t) -> RespValue {
                    RespValue::BulkString($body)
                }
            }
        )*
    };
}

bulk_from! {
    String => |s| s.into_bytes(),
    &'a String => |s| s.as_bytes().to_vec(),
    &'a str => |s| s.as_bytes().to_vec(),
    &'a [u8] => |s| s.to_vec(),
    Vec<u8> => |s| s,
}

macro_rules! integer_arg_from {
    ($($t:ty),* $(,)?) => {
        $(
            impl From<$t> for RespValue {
                fn from(i: $t) -> RespValue {
                    RespValue::BulkString(i.to_string().into_bytes())
                }
            }
        )*
    };
}

// Integers are sent as bulk-string arguments, the form servers expect inside commands.
integer_arg_from!(i32, i64, u32, u64, usize);
