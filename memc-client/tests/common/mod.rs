//! In-process memcached stand-ins for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Entry {
    pub value: Vec<u8>,
    pub flags: u32,
    pub cas: u64,
}

#[derive(Default)]
struct Shared {
    store: Mutex<HashMap<Vec<u8>, Entry>>,
    next_cas: AtomicU64,
    connections: AtomicUsize,
    commands: AtomicUsize,
    noops: AtomicUsize,
}

/// Threaded fake memcached speaking both the text and binary protocols.
pub struct FakeMemcached {
    port: u16,
    shared: Arc<Shared>,
}

impl FakeMemcached {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let shared = Arc::new(Shared::default());
        let accept_shared = shared.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                accept_shared.connections.fetch_add(1, Ordering::SeqCst);
                let conn_shared = accept_shared.clone();
                thread::spawn(move || serve(stream, conn_shared));
            }
        });
        FakeMemcached { port, shared }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn get(&self, key: &str) -> Option<Entry> {
        self.shared
            .store
            .lock()
            .expect("store")
            .get(key.as_bytes())
            .cloned()
    }

    /// Stores `value` directly, bypassing the wire.
    pub fn insert(&self, key: &str, value: &[u8]) {
        let cas = self.shared.next_cas.fetch_add(1, Ordering::SeqCst) + 1;
        let entry = Entry {
            value: value.to_vec(),
            flags: 0,
            cas,
        };
        self.shared
            .store
            .lock()
            .expect("store")
            .insert(key.as_bytes().to_vec(), entry);
    }

    pub fn len(&self) -> usize {
        self.shared.store.lock().expect("store").len()
    }

    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> usize {
        self.shared.commands.load(Ordering::SeqCst)
    }

    /// Binary NOOPs received so far.
    pub fn noops(&self) -> usize {
        self.shared.noops.load(Ordering::SeqCst)
    }
}

/// Port with nothing listening on it.
pub fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);
    port
}

/// Accepts one connection and hands it to `handler`.
pub fn spawn_scripted(handler: fn(&mut BufReader<TcpStream>, &mut TcpStream)) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
        let mut reader = BufReader::new(stream.try_clone().expect("clone"));
        handler(&mut reader, &mut stream);
    });
    port
}

/// Reads one text command line without its CRLF.
pub fn read_text_line(reader: &mut BufReader<TcpStream>) -> Option<String> {
    let mut line = String::new();
    match reader.read_line(&mut line) {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line.trim_end_matches(['\r', '\n']).to_string()),
    }
}

fn serve(stream: TcpStream, shared: Arc<Shared>) {
    let mut writer = match stream.try_clone() {
        Ok(writer) => writer,
        Err(_) => return,
    };
    let mut reader = BufReader::new(stream);
    loop {
        let first = match reader.fill_buf() {
            Ok([]) | Err(_) => return,
            Ok(buf) => buf[0],
        };
        let keep_going = if first == 0x80 {
            serve_binary(&mut reader, &mut writer, &shared)
        } else {
            serve_text(&mut reader, &mut writer, &shared)
        };
        if !keep_going {
            return;
        }
    }
}

fn serve_text(reader: &mut BufReader<TcpStream>, out: &mut TcpStream, shared: &Shared) -> bool {
    let Some(line) = read_text_line(reader) else {
        return false;
    };
    shared.commands.fetch_add(1, Ordering::SeqCst);
    let parts: Vec<&str> = line.split(' ').collect();
    let noreply = parts.last() == Some(&"noreply");
    let reply: Vec<u8> = match parts[0] {
        "set" | "add" | "replace" | "cas" => {
            let key = parts[1].as_bytes().to_vec();
            let flags: u32 = parts[2].parse().unwrap_or(0);
            let len: usize = parts[4].parse().unwrap_or(0);
            let mut data = vec![0u8; len + 2];
            if reader.read_exact(&mut data).is_err() {
                return false;
            }
            data.truncate(len);
            let token = if parts[0] == "cas" {
                parts[5].parse().ok()
            } else {
                None
            };
            let status = store(shared, parts[0], key, data, flags, token);
            text_status(status).to_vec()
        }
        "get" | "gets" => {
            let mut reply = Vec::new();
            let store = shared.store.lock().expect("store");
            for key in &parts[1..] {
                if let Some(entry) = store.get(key.as_bytes()) {
                    let header = if parts[0] == "gets" {
                        let len = entry.value.len();
                        format!("VALUE {key} {} {len} {}\r\n", entry.flags, entry.cas)
                    } else {
                        format!("VALUE {key} {} {}\r\n", entry.flags, entry.value.len())
                    };
                    reply.extend_from_slice(header.as_bytes());
                    reply.extend_from_slice(&entry.value);
                    reply.extend_from_slice(b"\r\n");
                }
            }
            reply.extend_from_slice(b"END\r\n");
            reply
        }
        "delete" => {
            let removed = shared
                .store
                .lock()
                .expect("store")
                .remove(parts[1].as_bytes())
                .is_some();
            if removed {
                b"DELETED\r\n".to_vec()
            } else {
                b"NOT_FOUND\r\n".to_vec()
            }
        }
        "flush_all" => {
            shared.store.lock().expect("store").clear();
            b"OK\r\n".to_vec()
        }
        "quit" => return false,
        _ => b"ERROR\r\n".to_vec(),
    };
    if noreply {
        return true;
    }
    out.write_all(&reply).is_ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StoreStatus {
    Stored,
    NotStored,
    Exists,
    NotFound,
}

fn text_status(status: StoreStatus) -> &'static [u8] {
    match status {
        StoreStatus::Stored => b"STORED\r\n",
        StoreStatus::NotStored => b"NOT_STORED\r\n",
        StoreStatus::Exists => b"EXISTS\r\n",
        StoreStatus::NotFound => b"NOT_FOUND\r\n",
    }
}

fn store(
    shared: &Shared,
    verb: &str,
    key: Vec<u8>,
    value: Vec<u8>,
    flags: u32,
    token: Option<u64>,
) -> StoreStatus {
    let mut store = shared.store.lock().expect("store");
    let existing = store.get(&key).map(|entry| entry.cas);
    match (verb, existing) {
        ("add", Some(_)) => return StoreStatus::NotStored,
        ("replace", None) => return StoreStatus::NotStored,
        ("cas", None) => return StoreStatus::NotFound,
        ("cas", Some(current)) if Some(current) != token => return StoreStatus::Exists,
        _ => {}
    }
    let cas = shared.next_cas.fetch_add(1, Ordering::SeqCst) + 1;
    store.insert(key, Entry { value, flags, cas });
    StoreStatus::Stored
}

fn serve_binary(reader: &mut BufReader<TcpStream>, out: &mut TcpStream, shared: &Shared) -> bool {
    let mut header = [0u8; 24];
    if reader.read_exact(&mut header).is_err() {
        return false;
    }
    shared.commands.fetch_add(1, Ordering::SeqCst);
    let opcode = header[1];
    let key_len = u16::from_be_bytes([header[2], header[3]]) as usize;
    let extras_len = header[4] as usize;
    let body_len = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
    let opaque = [header[12], header[13], header[14], header[15]];
    let cas = u64::from_be_bytes([
        header[16], header[17], header[18], header[19], header[20], header[21], header[22],
        header[23],
    ]);
    let mut body = vec![0u8; body_len];
    if reader.read_exact(&mut body).is_err() {
        return false;
    }
    let extras = &body[..extras_len];
    let key = body[extras_len..extras_len + key_len].to_vec();
    let value = body[extras_len + key_len..].to_vec();

    let quiet = matches!(opcode, 0x11..=0x14 | 0x18);
    let base = if quiet { opcode - 0x10 } else { opcode };
    let (status, reply_extras, reply_value, reply_cas): (u16, Vec<u8>, Vec<u8>, u64) = match base {
        0x00 => match shared.store.lock().expect("store").get(&key) {
            Some(entry) => (0, entry.flags.to_be_bytes().to_vec(), entry.value.clone(), entry.cas),
            None => (1, Vec::new(), b"Not found".to_vec(), 0),
        },
        0x01..=0x03 => {
            let flags = u32::from_be_bytes([extras[0], extras[1], extras[2], extras[3]]);
            let verb = match (base, cas) {
                (0x01, 0) => "set",
                (0x01, _) => "cas",
                (0x02, _) => "add",
                _ => "replace",
            };
            let token = (cas != 0).then_some(cas);
            match store(shared, verb, key, value, flags, token) {
                StoreStatus::Stored => (0, Vec::new(), Vec::new(), 0),
                StoreStatus::NotFound => (1, Vec::new(), Vec::new(), 0),
                StoreStatus::NotStored if base == 0x03 => (1, Vec::new(), Vec::new(), 0),
                StoreStatus::NotStored | StoreStatus::Exists => (2, Vec::new(), Vec::new(), 0),
            }
        }
        0x04 => {
            let removed = shared.store.lock().expect("store").remove(&key).is_some();
            if removed {
                (0, Vec::new(), Vec::new(), 0)
            } else {
                (1, Vec::new(), Vec::new(), 0)
            }
        }
        0x08 => {
            shared.store.lock().expect("store").clear();
            (0, Vec::new(), Vec::new(), 0)
        }
        0x0a => {
            shared.noops.fetch_add(1, Ordering::SeqCst);
            (0, Vec::new(), Vec::new(), 0)
        }
        _ => (0x81, Vec::new(), b"Unknown command".to_vec(), 0),
    };
    if quiet && status == 0 {
        return true;
    }

    let mut reply = Vec::with_capacity(24 + reply_extras.len() + reply_value.len());
    reply.push(0x81);
    reply.push(opcode);
    reply.extend_from_slice(&0u16.to_be_bytes());
    reply.push(reply_extras.len() as u8);
    reply.push(0);
    reply.extend_from_slice(&status.to_be_bytes());
    reply.extend_from_slice(&((reply_extras.len() + reply_value.len()) as u32).to_be_bytes());
    reply.extend_from_slice(&opaque);
    reply.extend_from_slice(&reply_cas.to_be_bytes());
    reply.extend_from_slice(&reply_extras);
    reply.extend_from_slice(&reply_value);
    out.write_all(&reply).is_ok()
}
