/*
 * Copyright 2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! An in-process server speaking enough of the Redis protocol for the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Decoder;

use redis_pool_client::protocol::{RespCodec, RespValue};

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// Username and password every connection must present
    pub required: Option<(String, String)>,
    /// Pretend to be a server that predates `HELLO`
    pub no_hello: bool,
}

#[derive(Default)]
struct Db {
    values: HashMap<Vec<u8>, Vec<u8>>,
    versions: HashMap<Vec<u8>, u64>,
}

impl Db {
    fn touch(&mut self, key: &[u8]) {
        *self.versions.entry(key.to_vec()).or_default() += 1;
    }

    fn version(&self, key: &[u8]) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }
}

#[derive(Default)]
pub struct ServerState {
    config: ServerConfig,
    db: Mutex<Db>,
    commands: Mutex<Vec<String>>,
    auths: Mutex<Vec<(String, String)>>,
    connections: AtomicUsize,
}

pub struct MockServer {
    addr: String,
    state: Arc<ServerState>,
    accept: JoinHandle<()>,
}

impl MockServer {
    pub async fn start() -> MockServer {
        MockServer::with_config(ServerConfig::default()).await
    }

    pub async fn with_config(config: ServerConfig) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let state = Arc::new(ServerState {
            config,
            ..ServerState::default()
        });
        let accept = {
            let state = state.clone();
            tokio::spawn(async move {
                while let Ok((socket, _)) = listener.accept().await {
                    state.connections.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(socket, state.clone()));
                }
            })
        };
        MockServer {
            addr,
            state,
            accept,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Every command received so far, rendered as space separated text.
    pub fn commands(&self) -> Vec<String> {
        self.state.commands.lock().unwrap().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.commands()
            .iter()
            .filter(|c| c.split(' ').next().map_or(false, |n| n.eq_ignore_ascii_case(name)))
            .count()
    }

    /// The `(username, password)` pairs presented by `HELLO ... AUTH` or `AUTH`.
    pub fn auths(&self) -> Vec<(String, String)> {
        self.state.auths.lock().unwrap().clone()
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Change a key behind the client's back.
    pub fn touch(&self, key: &str) {
        self.state.db.lock().unwrap().touch(key.as_bytes());
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

enum Reply {
    Value(RespValue),
    Close,
}

fn ok() -> Reply {
    Reply::Value(RespValue::SimpleString("OK".into()))
}

fn error(msg: impl Into<String>) -> Reply {
    Reply::Value(RespValue::Error(msg.into()))
}

struct Session {
    state: Arc<ServerState>,
    authed: bool,
    name: Option<Vec<u8>>,
    watched: Vec<(Vec<u8>, u64)>,
    multi: Option<Vec<Vec<Vec<u8>>>>,
    multi_failed: bool,
}

async fn serve(socket: TcpStream, state: Arc<ServerState>) {
    let mut framed = RespCodec.framed(socket);
    let mut session = Session {
        authed: state.config.required.is_none(),
        state,
        name: None,
        watched: Vec::new(),
        multi: None,
        multi_failed: false,
    };
    while let Some(Ok(cmd)) = framed.next().await {
        session
            .state
            .commands
            .lock()
            .unwrap()
            .push(cmd.to_command_string());
        let args = match cmd {
            RespValue::Array(args) => args
                .into_iter()
                .map(|arg| match arg {
                    RespValue::BulkString(bytes) => bytes,
                    other => other.to_command_string().into_bytes(),
                })
                .collect::<Vec<_>>(),
            _ => break,
        };
        let reply = match session.handle(args).await {
            Reply::Value(value) => value,
            Reply::Close => break,
        };
        if framed.send(reply).await.is_err() {
            break;
        }
    }
}

fn text(arg: &[u8]) -> String {
    String::from_utf8_lossy(arg).into_owned()
}

fn bulk(bytes: Vec<u8>) -> RespValue {
    RespValue::BulkString(bytes)
}

impl Session {
    fn authenticate(&mut self, user: String, pass: String) -> Result<(), Reply> {
        self.state.auths.lock().unwrap().push((user.clone(), pass.clone()));
        match &self.state.config.required {
            Some((u, p)) if *u == user && *p == pass => {
                self.authed = true;
                Ok(())
            }
            Some(_) => Err(error(
                "WRONGPASS invalid username-password pair or user is disabled.",
            )),
            None => {
                self.authed = true;
                Ok(())
            }
        }
    }

    async fn handle(&mut self, args: Vec<Vec<u8>>) -> Reply {
        let name = match args.first() {
            Some(name) => text(name).to_ascii_uppercase(),
            None => return error("ERR empty command"),
        };

        match name.as_str() {
            "HELLO" => return self.hello(&args),
            "AUTH" => {
                let (user, pass) = match args.len() {
                    2 => ("default".to_owned(), text(&args[1])),
                    3 => (text(&args[1]), text(&args[2])),
                    _ => return error("ERR syntax error"),
                };
                return match self.authenticate(user, pass) {
                    Ok(()) => ok(),
                    Err(reply) => reply,
                };
            }
            "CRASH" => return Reply::Close,
            _ => (),
        }
        if !self.authed {
            return error("NOAUTH Authentication required.");
        }

        if let Some(queue) = self.multi.as_mut() {
            match name.as_str() {
                "EXEC" | "DISCARD" | "MULTI" | "WATCH" => (),
                "SET" | "GET" | "DEL" | "INCR" | "PING" => {
                    queue.push(args);
                    return Reply::Value(RespValue::SimpleString("QUEUED".into()));
                }
                other => {
                    self.multi_failed = true;
                    return error(format!("ERR unknown command '{}'", other.to_lowercase()));
                }
            }
        }

        match name.as_str() {
            "MULTI" => {
                if self.multi.is_some() {
                    return error("ERR MULTI calls can not be nested");
                }
                self.multi = Some(Vec::new());
                ok()
            }
            "EXEC" => self.exec(),
            "DISCARD" => {
                self.multi = None;
                self.multi_failed = false;
                self.watched.clear();
                ok()
            }
            "WATCH" => {
                if self.multi.is_some() {
                    return error("ERR WATCH inside MULTI is not allowed");
                }
                let db = self.state.db.lock().unwrap();
                for key in &args[1..] {
                    self.watched.push((key.clone(), db.version(key)));
                }
                ok()
            }
            "UNWATCH" => {
                self.watched.clear();
                ok()
            }
            "SELECT" => ok(),
            "FLUSHDB" => {
                let mut db = self.state.db.lock().unwrap();
                let keys: Vec<_> = db.values.keys().cloned().collect();
                for key in keys {
                    db.touch(&key);
                }
                db.values.clear();
                ok()
            }
            "CLIENT" => match args.get(1).map(|a| text(a).to_ascii_uppercase()).as_deref() {
                Some("SETNAME") if args.len() == 3 => {
                    self.name = Some(args[2].clone());
                    ok()
                }
                Some("GETNAME") => Reply::Value(match &self.name {
                    Some(name) => bulk(name.clone()),
                    None => RespValue::Nil,
                }),
                _ => error("ERR syntax error"),
            },
            "SLOW" => {
                let millis = text(&args[1]).parse().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(millis)).await;
                ok()
            }
            "LOADING" => error("LOADING Redis is loading the dataset in memory"),
            _ => Reply::Value(self.data(&name, &args)),
        }
    }

    fn hello(&mut self, args: &[Vec<u8>]) -> Reply {
        if self.state.config.no_hello {
            return error("ERR unknown command 'hello'");
        }
        let mut i = 2;
        while i < args.len() {
            match text(&args[i]).to_ascii_uppercase().as_str() {
                "AUTH" if i + 2 < args.len() => {
                    if let Err(reply) = self.authenticate(text(&args[i + 1]), text(&args[i + 2])) {
                        return reply;
                    }
                    i += 3;
                }
                "SETNAME" if i + 1 < args.len() => {
                    self.name = Some(args[i + 1].clone());
                    i += 2;
                }
                _ => return error("ERR syntax error in HELLO option"),
            }
        }
        if !self.authed {
            return error("NOAUTH HELLO must be called with the client already authenticated");
        }
        Reply::Value(RespValue::Array(vec![
            bulk(b"server".to_vec()),
            bulk(b"redis".to_vec()),
            bulk(b"proto".to_vec()),
            RespValue::Integer(2),
        ]))
    }

    fn exec(&mut self) -> Reply {
        let queue = match self.multi.take() {
            Some(queue) => queue,
            None => return error("ERR EXEC without MULTI"),
        };
        let watched = std::mem::take(&mut self.watched);
        if std::mem::take(&mut self.multi_failed) {
            return error("EXECABORT Transaction discarded because of previous errors.");
        }
        {
            let db = self.state.db.lock().unwrap();
            if watched.iter().any(|(key, v)| db.version(key) != *v) {
                return Reply::Value(RespValue::Nil);
            }
        }
        let results = queue
            .into_iter()
            .map(|args| {
                let name = text(&args[0]).to_ascii_uppercase();
                self.data(&name, &args)
            })
            .collect();
        Reply::Value(RespValue::Array(results))
    }

    fn data(&self, name: &str, args: &[Vec<u8>]) -> RespValue {
        let mut db = self.state.db.lock().unwrap();
        match (name, args.len()) {
            ("PING", 1) => RespValue::SimpleString("PONG".into()),
            ("PING", 2) | ("ECHO", 2) => bulk(args[1].clone()),
            ("SET", 3) => {
                db.touch(&args[1]);
                db.values.insert(args[1].clone(), args[2].clone());
                RespValue::SimpleString("OK".into())
            }
            ("GET", 2) => match db.values.get(&args[1]) {
                Some(value) => bulk(value.clone()),
                None => RespValue::Nil,
            },
            ("DEL", n) if n >= 2 => {
                let mut removed = 0;
                for key in &args[1..] {
                    db.touch(key);
                    if db.values.remove(key).is_some() {
                        removed += 1;
                    }
                }
                RespValue::Integer(removed)
            }
            ("INCR", 2) => {
                let current = db
                    .values
                    .get(&args[1])
                    .map(|v| text(v).parse::<i64>());
                match current {
                    Some(Err(_)) => {
                        RespValue::Error("ERR value is not an integer or out of range".into())
                    }
                    Some(Ok(n)) => {
                        db.touch(&args[1]);
                        db.values.insert(args[1].clone(), (n + 1).to_string().into_bytes());
                        RespValue::Integer(n + 1)
                    }
                    None => {
                        db.touch(&args[1]);
                        db.values.insert(args[1].clone(), b"1".to_vec());
                        RespValue::Integer(1)
                    }
                }
            }
            (name, _) => RespValue::Error(format!(
                "ERR unknown command '{}'",
                name.to_lowercase()
            )),
        }
    }
}
