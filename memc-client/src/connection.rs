//! # Server Connection
//!
//! Purpose: Own one socket to one server and move encoded requests and
//! decoded replies across it, including requests whose replies are not
//! awaited (no-block, buffered and no-reply writes).
//!
//! ## Design Principles
//! 1. **Lazy Connect**: The socket opens on first use and reopens on the next
//!    use after a failure.
//! 2. **Buffer Reuse**: One `BytesMut` write buffer and one scratch buffer per
//!    connection, reused for every request.
//! 3. **Ordered Replies**: Un-awaited replies are drained before the next
//!    awaited request, so every blocking call reads its own reply.
//! 4. **Lazy Socket Options**: Timeouts, TCP flags and buffer sizes are
//!    re-applied to an open socket only when the configured values change.
//!
//! ## Reply Accounting
//!
//! ```text
//! text   : pending_replies counts un-awaited requests sent without noreply;
//!          drain reads exactly that many replies
//! binary : pending_replies counts every un-awaited send, quiet or not; drain
//!          sends NOOP and reads until the NOOP's opaque comes back
//! udp    : every write is noreply, nothing to drain
//! ```

use std::io::{self, BufReader, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::time::Duration;

use bytes::BytesMut;
use memc_common::{BehaviorConfig, MemcError};
use socket2::{Domain, Protocol as SockProtocol, SockAddr, SockRef, Socket, TcpKeepalive, Type};
use tracing::{debug, warn};

use crate::codec::{
    check_udp_size, put_udp_header, EncodeOptions, Frame, Protocol, Reply, Request, WireCodec,
};
use crate::error::WireError;
use crate::server::Server;

/// Lifecycle of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Closed,
    Connecting,
    Open,
    /// Last exchange failed; the next use reconnects.
    Failed,
}

enum Transport {
    Tcp(BufReader<TcpStream>),
    Udp { socket: UdpSocket, request_id: u16 },
}

/// Socket settings last pushed to the open socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct SocketOptions {
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    nodelay: bool,
    keepalive: bool,
    keepidle_secs: u32,
    send_size: u32,
    recv_size: u32,
}

impl SocketOptions {
    fn from_behavior(behavior: &BehaviorConfig) -> Self {
        SocketOptions {
            read_timeout: behavior.read_timeout(),
            write_timeout: behavior.write_timeout(),
            nodelay: behavior.tcp_nodelay,
            keepalive: behavior.tcp_keepalive,
            keepidle_secs: behavior.tcp_keepidle_secs,
            send_size: behavior.socket_send_size,
            recv_size: behavior.socket_recv_size,
        }
    }
}

/// Single connection to one server with reusable buffers.
pub struct Connection {
    server: String,
    state: ConnState,
    transport: Option<Transport>,
    codec: WireCodec,
    write_buf: BytesMut,
    scratch: Vec<u8>,
    buffered_msgs: usize,
    pending_replies: usize,
    next_opaque: u32,
    options: SocketOptions,
}

impl Connection {
    /// Creates a closed connection for `server`.
    pub fn new(server: &Server) -> Self {
        Connection {
            server: server.id(),
            state: ConnState::Closed,
            transport: None,
            codec: WireCodec::new(Protocol::Text),
            write_buf: BytesMut::with_capacity(256),
            scratch: Vec::with_capacity(128),
            buffered_msgs: 0,
            pending_replies: 0,
            next_opaque: 0,
            options: SocketOptions::default(),
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnState::Open && self.transport.is_some()
    }

    /// Requests queued locally and not yet written.
    pub fn buffered_msgs(&self) -> usize {
        self.buffered_msgs
    }

    /// Un-awaited requests whose replies have not been consumed yet.
    pub fn pending_replies(&self) -> usize {
        self.pending_replies
    }

    /// True when anything is queued or owed.
    pub fn has_pending(&self) -> bool {
        self.buffered_msgs > 0 || self.pending_replies > 0
    }

    /// Opens the socket if needed and brings socket options up to date.
    pub fn ensure_open(
        &mut self,
        server: &Server,
        behavior: &BehaviorConfig,
    ) -> Result<(), WireError> {
        if !self.is_open() {
            self.connect(server, behavior)?;
        }
        self.apply_options(behavior)
    }

    fn connect(&mut self, server: &Server, behavior: &BehaviorConfig) -> Result<(), WireError> {
        self.reset();
        self.state = ConnState::Connecting;
        self.codec = WireCodec::for_behavior(behavior);

        let result = if behavior.use_udp {
            open_udp(server.addrs()).map(|socket| Transport::Udp {
                socket,
                request_id: 0,
            })
        } else {
            open_tcp(server.addrs(), behavior).map(|stream| Transport::Tcp(BufReader::new(stream)))
        };

        match result {
            Ok(transport) => {
                debug!(
                    server = %self.server,
                    udp = behavior.use_udp,
                    binary = behavior.binary_protocol,
                    "connected"
                );
                if let Transport::Tcp(_) = transport {
                    // connect_addr already set everything but the timeouts.
                    self.options = SocketOptions {
                        read_timeout: None,
                        write_timeout: None,
                        ..SocketOptions::from_behavior(behavior)
                    };
                }
                self.transport = Some(transport);
                self.state = ConnState::Open;
                Ok(())
            }
            Err(source) => {
                warn!(server = %self.server, error = %source, "connect failed");
                self.state = ConnState::Failed;
                Err(WireError::Connect {
                    server: self.server.clone(),
                    source,
                })
            }
        }
    }

    fn apply_options(&mut self, behavior: &BehaviorConfig) -> Result<(), WireError> {
        let wanted = SocketOptions::from_behavior(behavior);
        if wanted == self.options {
            return Ok(());
        }
        let applied = match &self.transport {
            Some(Transport::Tcp(reader)) => {
                let stream = reader.get_ref();
                stream
                    .set_read_timeout(wanted.read_timeout)
                    .and_then(|_| stream.set_write_timeout(wanted.write_timeout))
                    .and_then(|_| apply_tcp_options(&SockRef::from(stream), &self.options, &wanted))
            }
            Some(Transport::Udp { socket, .. }) => socket
                .set_read_timeout(wanted.read_timeout)
                .and_then(|_| socket.set_write_timeout(wanted.write_timeout))
                .and_then(|_| apply_buffer_sizes(&SockRef::from(socket), &self.options, &wanted)),
            None => return Ok(()),
        };
        applied.map_err(WireError::Write)?;
        debug!(server = %self.server, options = ?wanted, "socket options applied");
        self.options = wanted;
        Ok(())
    }

    fn take_opaque(&mut self) -> u32 {
        self.next_opaque = self.next_opaque.wrapping_add(1);
        self.next_opaque
    }

    /// Sends `request` and waits for its reply.
    ///
    /// Anything queued or owed on this connection is flushed and drained
    /// first.
    pub fn request(
        &mut self,
        request: &Request<'_>,
        behavior: &BehaviorConfig,
    ) -> Result<Reply, WireError> {
        if matches!(self.transport, Some(Transport::Udp { .. })) {
            return Err(MemcError::NotSupported("replies are not read over UDP".to_string()).into());
        }
        self.drain()?;

        let opaque = self.take_opaque();
        let opts = EncodeOptions {
            quiet: false,
            opaque,
            verify_key: behavior.verify_key,
        };
        self.codec.encode(request, opts, &mut self.write_buf)?;
        self.buffered_msgs += 1;
        self.flush()?;
        match self.read_until_opaque(opaque)? {
            Reply::OutOfMemory => Err(MemcError::MemoryAllocation.into()),
            reply => Ok(reply),
        }
    }

    /// Sends `request` without waiting for the reply.
    ///
    /// Under `BufferRequests` the request stays queued until a watermark is
    /// crossed or `flush` is called; otherwise it is written immediately.
    pub fn send_async(
        &mut self,
        request: &Request<'_>,
        behavior: &BehaviorConfig,
    ) -> Result<(), WireError> {
        let quiet = behavior.no_reply || behavior.use_udp;
        let opts = EncodeOptions {
            quiet,
            opaque: self.take_opaque(),
            verify_key: behavior.verify_key,
        };

        if let Some(Transport::Udp { .. }) = self.transport {
            return self.send_datagram(request, opts);
        }

        self.codec.encode(request, opts, &mut self.write_buf)?;
        self.buffered_msgs += 1;
        // Quiet binary requests still answer failures.
        if !quiet || self.codec.protocol() == Protocol::Binary {
            self.pending_replies += 1;
        }

        let over_watermark = self.write_buf.len() >= behavior.io_bytes_watermark as usize
            || self.buffered_msgs >= behavior.io_msg_watermark as usize;
        if !behavior.buffer_requests || over_watermark {
            self.flush()?;
        }
        if self.pending_replies > behavior.io_msg_watermark as usize {
            debug!(
                server = %self.server,
                pending = self.pending_replies,
                "draining un-awaited replies"
            );
            self.drain()?;
        }
        Ok(())
    }

    fn send_datagram(
        &mut self,
        request: &Request<'_>,
        opts: EncodeOptions,
    ) -> Result<(), WireError> {
        let Some(Transport::Udp { socket, request_id }) = self.transport.as_mut() else {
            return Ok(());
        };
        let mut payload = BytesMut::new();
        self.codec.encode(request, opts, &mut payload)?;
        check_udp_size(payload.len())?;

        *request_id = request_id.wrapping_add(1);
        let mut datagram = BytesMut::with_capacity(payload.len() + 8);
        put_udp_header(*request_id, &mut datagram);
        datagram.extend_from_slice(&payload);
        socket.send(&datagram).map_err(WireError::Write)?;
        Ok(())
    }

    /// Writes every queued request to the socket.
    pub fn flush(&mut self) -> Result<(), WireError> {
        if self.write_buf.is_empty() {
            self.buffered_msgs = 0;
            return Ok(());
        }
        let Some(Transport::Tcp(reader)) = self.transport.as_mut() else {
            self.write_buf.clear();
            self.buffered_msgs = 0;
            return Ok(());
        };
        let stream = reader.get_mut();
        stream.write_all(&self.write_buf).map_err(WireError::Write)?;
        stream.flush().map_err(WireError::Write)?;
        self.write_buf.clear();
        self.buffered_msgs = 0;
        Ok(())
    }

    /// Flushes queued requests and consumes every owed reply.
    ///
    /// Failures reported inside drained replies are logged, not returned:
    /// their callers already got `Buffered`. A drain that cannot complete
    /// leaves the stream out of step, so the connection is failed.
    pub fn drain(&mut self) -> Result<(), WireError> {
        let result = self.flush().and_then(|_| self.read_owed());
        if let Err(err) = &result {
            warn!(server = %self.server, error = %err, "drain failed, dropping connection");
            self.fail();
        }
        result
    }

    fn read_owed(&mut self) -> Result<(), WireError> {
        match self.codec.protocol() {
            Protocol::Text => {
                while self.pending_replies > 0 {
                    self.pending_replies -= 1;
                    let reply = self.read_frame()?.reply;
                    log_drained(&self.server, &reply);
                }
            }
            Protocol::Binary if self.pending_replies > 0 => {
                let opaque = self.take_opaque();
                let opts = EncodeOptions {
                    opaque,
                    ..EncodeOptions::default()
                };
                self.codec.encode(&Request::Noop, opts, &mut self.write_buf)?;
                self.buffered_msgs += 1;
                self.flush()?;
                let reply = self.read_until_opaque(opaque)?;
                if reply != Reply::Noop {
                    return Err(MemcError::Protocol(format!("expected NOOP, got {reply:?}")).into());
                }
                self.pending_replies = 0;
            }
            Protocol::Binary => {}
        }
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Frame, WireError> {
        match self.transport.as_mut() {
            Some(Transport::Tcp(reader)) => self.codec.read_frame(reader, &mut self.scratch),
            _ => Err(WireError::Read(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection is not open",
            ))),
        }
    }

    /// Text replies come back in order; binary replies are matched by opaque
    /// and anything older is a reply to an earlier quiet request.
    fn read_until_opaque(&mut self, opaque: u32) -> Result<Reply, WireError> {
        loop {
            let frame = self.read_frame()?;
            if self.codec.protocol() == Protocol::Text || frame.opaque == opaque {
                return Ok(frame.reply);
            }
            log_drained(&self.server, &frame.reply);
        }
    }

    /// Drops the socket after a failed exchange.
    pub fn fail(&mut self) {
        self.reset();
        self.state = ConnState::Failed;
    }

    /// Sends queued requests if possible, then drops the socket.
    pub fn close(&mut self) {
        if self.is_open() && self.has_pending() {
            if let Err(err) = self.drain() {
                debug!(server = %self.server, error = %err, "dropping queued requests on close");
            }
        }
        self.reset();
        self.state = ConnState::Closed;
    }

    fn reset(&mut self) {
        self.transport = None;
        self.write_buf.clear();
        self.scratch.clear();
        self.buffered_msgs = 0;
        self.pending_replies = 0;
        self.options = SocketOptions::default();
    }
}

fn log_drained(server: &str, reply: &Reply) {
    if reply.code().is_success() {
        return;
    }
    warn!(server, code = %reply.code(), reply = ?reply, "un-awaited request failed");
}

fn apply_tcp_options(
    sock: &SockRef<'_>,
    current: &SocketOptions,
    wanted: &SocketOptions,
) -> io::Result<()> {
    if wanted.nodelay != current.nodelay {
        sock.set_nodelay(wanted.nodelay)?;
    }
    if (wanted.keepalive, wanted.keepidle_secs) != (current.keepalive, current.keepidle_secs) {
        if wanted.keepalive {
            sock.set_tcp_keepalive(&keepalive_params(wanted.keepidle_secs))?;
        } else {
            sock.set_keepalive(false)?;
        }
    }
    apply_buffer_sizes(sock, current, wanted)
}

/// Zero means the OS default, which cannot be restored on an open socket.
fn apply_buffer_sizes(
    sock: &SockRef<'_>,
    current: &SocketOptions,
    wanted: &SocketOptions,
) -> io::Result<()> {
    if wanted.send_size != current.send_size && wanted.send_size > 0 {
        sock.set_send_buffer_size(wanted.send_size as usize)?;
    }
    if wanted.recv_size != current.recv_size && wanted.recv_size > 0 {
        sock.set_recv_buffer_size(wanted.recv_size as usize)?;
    }
    Ok(())
}

fn keepalive_params(idle_secs: u32) -> TcpKeepalive {
    let keepalive = TcpKeepalive::new();
    if idle_secs > 0 {
        keepalive.with_time(Duration::from_secs(u64::from(idle_secs)))
    } else {
        keepalive
    }
}

fn open_tcp(addrs: &[SocketAddr], behavior: &BehaviorConfig) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in addrs {
        match connect_addr(addr, behavior) {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no addresses")))
}

fn connect_addr(addr: &SocketAddr, behavior: &BehaviorConfig) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(*addr), Type::STREAM, Some(SockProtocol::TCP))?;
    socket.set_nodelay(behavior.tcp_nodelay)?;
    if behavior.tcp_keepalive {
        socket.set_tcp_keepalive(&keepalive_params(behavior.tcp_keepidle_secs))?;
    }
    // Buffer sizes go on before connect so the window scale is negotiated.
    if behavior.socket_send_size > 0 {
        socket.set_send_buffer_size(behavior.socket_send_size as usize)?;
    }
    if behavior.socket_recv_size > 0 {
        socket.set_recv_buffer_size(behavior.socket_recv_size as usize)?;
    }

    let target = SockAddr::from(*addr);
    match behavior.connect_timeout() {
        Some(timeout) => socket.connect_timeout(&target, timeout)?,
        None => socket.connect(&target)?,
    }
    Ok(TcpStream::from(socket))
}

fn open_udp(addrs: &[SocketAddr]) -> io::Result<UdpSocket> {
    let addr = addrs
        .first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no addresses"))?;
    let local: SocketAddr = if addr.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    };
    let socket = UdpSocket::bind(local)?;
    socket.connect(addr)?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::ServerList;
    use memc_common::{Behavior, Key, Ttl};
    use std::io::{BufRead, BufReader as StdBufReader, Read};
    use std::net::TcpListener;
    use std::thread;

    fn server_for(port: u16) -> ServerList {
        let mut list = ServerList::new();
        list.add("127.0.0.1", port).unwrap();
        list
    }

    /// Accepts one connection, answers `STORED` to every storage command.
    fn spawn_store_server() -> (u16, thread::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut reader = StdBufReader::new(stream.try_clone().unwrap());
            let mut seen = Vec::new();
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).unwrap_or(0) == 0 {
                    break;
                }
                let parts: Vec<&str> = line.split_whitespace().collect();
                let len: usize = parts[4].parse().unwrap();
                let mut data = vec![0u8; len + 2];
                reader.read_exact(&mut data).unwrap();
                seen.push(parts[1].to_string());
                if parts.last() != Some(&"noreply") {
                    stream.write_all(b"STORED\r\n").unwrap();
                }
            }
            seen
        });
        (port, handle)
    }

    fn set_request(key: &Key) -> Request<'_> {
        Request::Store {
            mode: crate::codec::StoreMode::Set,
            key,
            value: b"v",
            flags: 0,
            ttl: Ttl::NEVER,
        }
    }

    #[test]
    fn buffered_requests_wait_for_flush() {
        let (port, handle) = spawn_store_server();
        let list = server_for(port);
        let server = list.get(0).unwrap();
        let mut behavior = BehaviorConfig::default();
        behavior.set(Behavior::BufferRequests, 1).unwrap();

        let mut conn = Connection::new(server);
        conn.ensure_open(server, &behavior).unwrap();
        let keys: Vec<Key> = (0..3).map(|i| Key::new(format!("k{i}")).unwrap()).collect();
        for key in &keys {
            conn.send_async(&set_request(key), &behavior).unwrap();
        }
        assert_eq!(conn.buffered_msgs(), 3);
        assert_eq!(conn.pending_replies(), 3);

        conn.drain().unwrap();
        assert!(!conn.has_pending());
        conn.close();
        assert_eq!(conn.state(), ConnState::Closed);
        assert_eq!(handle.join().unwrap(), vec!["k0", "k1", "k2"]);
    }

    #[test]
    fn msg_watermark_forces_write() {
        let (port, handle) = spawn_store_server();
        let list = server_for(port);
        let server = list.get(0).unwrap();
        let mut behavior = BehaviorConfig::default();
        behavior.set(Behavior::BufferRequests, 1).unwrap();
        behavior.set(Behavior::IoMsgWatermark, 2).unwrap();
        behavior.set(Behavior::NoReply, 1).unwrap();

        let mut conn = Connection::new(server);
        conn.ensure_open(server, &behavior).unwrap();
        let a = Key::new("a").unwrap();
        let b = Key::new("b").unwrap();
        conn.send_async(&set_request(&a), &behavior).unwrap();
        assert_eq!(conn.buffered_msgs(), 1);
        conn.send_async(&set_request(&b), &behavior).unwrap();
        assert_eq!(conn.buffered_msgs(), 0);
        assert_eq!(conn.pending_replies(), 0);
        conn.close();
        assert_eq!(handle.join().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn broken_drain_drops_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut reader = StdBufReader::new(stream.try_clone().unwrap());
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            reader.read_line(&mut line).unwrap();
            stream.write_all(b"BOGUS\r\n").unwrap();
            let mut rest = Vec::new();
            let _ = reader.read_to_end(&mut rest);
        });
        let list = server_for(port);
        let server = list.get(0).unwrap();
        let behavior = BehaviorConfig::default();

        let mut conn = Connection::new(server);
        conn.ensure_open(server, &behavior).unwrap();
        let key = Key::new("k").unwrap();
        conn.send_async(&set_request(&key), &behavior).unwrap();
        assert_eq!(conn.pending_replies(), 1);

        let err = conn.drain().unwrap_err();
        assert!(matches!(err, WireError::Fatal(MemcError::Protocol(_))));
        assert_eq!(conn.state(), ConnState::Failed);
        assert!(!conn.has_pending());
        handle.join().unwrap();
    }

    #[test]
    fn socket_options_follow_behavior_changes() {
        let (port, handle) = spawn_store_server();
        let list = server_for(port);
        let server = list.get(0).unwrap();
        let mut behavior = BehaviorConfig::default();

        let mut conn = Connection::new(server);
        conn.ensure_open(server, &behavior).unwrap();
        let stream = |conn: &Connection| match conn.transport.as_ref() {
            Some(Transport::Tcp(reader)) => reader.get_ref().try_clone().unwrap(),
            _ => panic!("expected a TCP transport"),
        };
        assert!(!stream(&conn).nodelay().unwrap());
        assert!(!SockRef::from(&stream(&conn)).keepalive().unwrap());

        behavior.set(Behavior::TcpNoDelay, 1).unwrap();
        behavior.set(Behavior::TcpKeepalive, 1).unwrap();
        behavior.set(Behavior::TcpKeepIdle, 30).unwrap();
        behavior.set(Behavior::ReceiveTimeout, 250).unwrap();
        conn.ensure_open(server, &behavior).unwrap();

        let live = stream(&conn);
        assert!(live.nodelay().unwrap());
        assert!(SockRef::from(&live).keepalive().unwrap());
        assert_eq!(live.read_timeout().unwrap(), Some(Duration::from_millis(250)));

        behavior.set(Behavior::TcpNoDelay, 0).unwrap();
        conn.ensure_open(server, &behavior).unwrap();
        assert!(!stream(&conn).nodelay().unwrap());

        drop(live);
        conn.close();
        assert!(handle.join().unwrap().is_empty());
    }

    #[test]
    fn connect_failure_marks_failed() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let list = server_for(port);
        let server = list.get(0).unwrap();
        let mut conn = Connection::new(server);
        let err = conn
            .ensure_open(server, &BehaviorConfig::default())
            .unwrap_err();
        assert!(matches!(err, WireError::Connect { .. }));
        assert_eq!(conn.state(), ConnState::Failed);
    }
}
