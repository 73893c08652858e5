/*
 * Copyright 2020-2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;

use super::resp::RespValue;

/// Frames `RespValue`s over a byte stream.  Stateless; one instance per connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct RespCodec;

impl Decoder for RespCodec {
    type Item = RespValue;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<RespValue>, Error> {
        match parse(buf, 0)? {
            Some((consumed, value)) => {
                buf.advance(consumed);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}

impl<'a> Encoder<&'a RespValue> for RespCodec {
    type Error = io::Error;

    fn encode(&mut self, msg: &'a RespValue, buf: &mut BytesMut) -> Result<(), io::Error> {
        write_value(msg, buf);
        Ok(())
    }
}

impl Encoder<RespValue> for RespCodec {
    type Error = io::Error;

    fn encode(&mut self, msg: RespValue, buf: &mut BytesMut) -> Result<(), io::Error> {
        write_value(&msg, buf);
        Ok(())
    }
}

fn write_line(prefix: u8, body: &[u8], buf: &mut BytesMut) {
    buf.reserve(body.len() + 3);
    buf.put_u8(prefix);
    buf.put_slice(body);
    buf.put_slice(b"\r\n");
}

fn write_value(value: &RespValue, buf: &mut BytesMut) {
    match value {
        RespValue::Nil => write_line(b'$', b"-1", buf),
        RespValue::Array(items) => {
            write_line(b'*', items.len().to_string().as_bytes(), buf);
            for item in items {
                write_value(item, buf);
            }
        }
        RespValue::BulkString(bytes) => {
            write_line(b'$', bytes.len().to_string().as_bytes(), buf);
            buf.reserve(bytes.len() + 2);
            buf.put_slice(bytes);
            buf.put_slice(b"\r\n");
        }
        RespValue::Error(s) => write_line(b'-', s.as_bytes(), buf),
        RespValue::Integer(i) => write_line(b':', i.to_string().as_bytes(), buf),
        RespValue::SimpleString(s) => write_line(b'+', s.as_bytes(), buf),
    }
}

type Parsed = Result<Option<(usize, RespValue)>, Error>;

fn protocol_error(msg: String) -> Error {
    Error::RESP(msg, None)
}

/// Finds the `\r\n` terminated line starting at `start`, returning the line (without the
/// terminator) and the position just after it.
fn line(buf: &[u8], start: usize) -> Option<(&[u8], usize)> {
    buf.get(start..)?
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|offset| (&buf[start..start + offset], start + offset + 2))
}

fn length(buf: &[u8], start: usize) -> Result<Option<(i64, usize)>, Error> {
    let (raw, next) = match line(buf, start) {
        Some(found) => found,
        None => return Ok(None),
    };
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .map(|n| Some((n, next)))
        .ok_or_else(|| protocol_error(format!("Not an integer: {:?}", raw)))
}

const MAX_PREALLOC: usize = 1024;

fn parse(buf: &[u8], pos: usize) -> Parsed {
    let marker = match buf.get(pos) {
        Some(marker) => *marker,
        None => return Ok(None),
    };
    let body = pos + 1;
    match marker {
        b'+' | b'-' => Ok(line(buf, body).map(|(raw, next)| {
            let text = String::from_utf8_lossy(raw).into_owned();
            let value = if marker == b'+' {
                RespValue::SimpleString(text)
            } else {
                RespValue::Error(text)
            };
            (next, value)
        })),
        b':' => Ok(length(buf, body)?.map(|(n, next)| (next, RespValue::Integer(n)))),
        b'$' => match length(buf, body)? {
            None => Ok(None),
            Some((-1, next)) => Ok(Some((next, RespValue::Nil))),
            Some((n, next)) if n >= 0 => {
                let end = next + n as usize;
                if buf.len() < end + 2 {
                    return Ok(None);
                }
                if &buf[end..end + 2] != b"\r\n" {
                    return Err(protocol_error("Bulk string not terminated".into()));
                }
                Ok(Some((end + 2, RespValue::BulkString(buf[next..end].to_vec()))))
            }
            Some((n, _)) => Err(protocol_error(format!("Invalid string size: {}", n))),
        },
        b'*' => match length(buf, body)? {
            None => Ok(None),
            Some((-1, next)) => Ok(Some((next, RespValue::Nil))),
            Some((n, mut next)) if n >= 0 => {
                // The count is untrusted, the array grows as items arrive.
                let mut items = Vec::with_capacity((n as usize).min(MAX_PREALLOC));
                for _ in 0..n {
                    match parse(buf, next)? {
                        Some((after, item)) => {
                            items.push(item);
                            next = after;
                        }
                        None => return Ok(None),
                    }
                }
                Ok(Some((next, RespValue::Array(items))))
            }
            Some((n, _)) => Err(protocol_error(format!("Invalid array size: {}", n))),
        },
        other => Err(protocol_error(format!("Unexpected byte: {}", other))),
    }
}

#[cfg(test)]
mod test {
    use bytes::BytesMut;
    use tokio_util::codec::{Decoder, Encoder};

    use super::RespCodec;
    use crate::{error::ErrorKind, protocol::RespValue};

    fn encoded(value: &RespValue) -> Vec<u8> {
        let mut buf = BytesMut::new();
        RespCodec.encode(value, &mut buf).unwrap();
        buf.to_vec()
    }

    #[test]
    fn encodes_commands_as_bulk_arrays() {
        assert_eq!(
            encoded(&resp_array!["SET", "x"]),
            b"*2\r\n$3\r\nSET\r\n$1\r\nx\r\n".to_vec()
        );
    }

    #[test]
    fn bulk_strings_keep_control_characters() {
        let value = RespValue::BulkString(b"hello1\r\nhello2\r\n".to_vec());
        let mut buf = BytesMut::from(&encoded(&value)[..]);
        assert_eq!(RespCodec.decode(&mut buf).unwrap(), Some(value));
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frames_wait_for_more_data() {
        let mut buf = BytesMut::from(&b"*2\r\n:1\r\n$5\r\nhel"[..]);
        assert_eq!(RespCodec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"lo\r\n");
        assert_eq!(
            RespCodec.decode(&mut buf).unwrap(),
            Some(RespValue::Array(vec![
                RespValue::Integer(1),
                RespValue::BulkString(b"hello".to_vec())
            ]))
        );
    }

    #[test]
    fn nil_and_errors() {
        let mut buf = BytesMut::from(&b"$-1\r\n-ERR bad\r\n"[..]);
        assert_eq!(RespCodec.decode(&mut buf).unwrap(), Some(RespValue::Nil));
        assert_eq!(
            RespCodec.decode(&mut buf).unwrap(),
            Some(RespValue::Error("ERR bad".into()))
        );
    }

    #[test]
    fn garbage_is_a_protocol_error() {
        let mut buf = BytesMut::from(&b"?what\r\n"[..]);
        let err = RespCodec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn oversized_array_header_waits_for_items() {
        let mut buf = BytesMut::from(&b"*4611686018427387903\r\n"[..]);
        assert_eq!(RespCodec.decode(&mut buf).unwrap(), None);

        let mut buf = BytesMut::from(&b"*1000000000\r\n:1\r\n:2\r\n"[..]);
        assert_eq!(RespCodec.decode(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 21);
    }
}
