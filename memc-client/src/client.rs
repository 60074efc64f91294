//! # Synchronous Client API
//!
//! Purpose: Expose a compact, blocking memcached API that hides server
//! selection, pooling, and wire framing behind one facade.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `Client` delegates each call to
//!    Distributor -> ConnectionPool -> WireCodec.
//! 2. **Two Channels**: Misses, refused stores, and I/O trouble come back as
//!    `Ok(Outcome)`; configuration and protocol faults come back as `Err`.
//! 3. **Exclusive Access**: Every operation takes `&mut self`. Share a client
//!    across threads behind a `Mutex`.
//! 4. **Explicit Lifecycle**: `Uninitialized -> Ready -> Closed`; `close` is
//!    idempotent and `Drop` calls it.
//!
//! ## Operation Flow
//!
//! ```text
//! key ── IntoKey ──> Key ── Distributor ──> [primary, replicas...]
//!                                                │
//!        Outcome <── WireError fold <── ConnectionPool::run ── Connection
//! ```

use std::time::Instant;

use memc_common::{
    Behavior, BehaviorConfig, IntoKey, Key, MemcError, MemcResult, Outcome, ReturnCode, Ttl,
    DEFAULT_TTL,
};
use tracing::debug;

use crate::codec::{Reply, Request, StoreMode};
use crate::config::ClientConfig;
use crate::distributor::Distributor;
use crate::error::WireError;
use crate::pool::ConnectionPool;
use crate::server::{Server, ServerList, ServerSpec};

/// Facade lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No server configured yet.
    Uninitialized,
    Ready,
    /// `close` was called; every operation fails with `MemcError::Closed`.
    Closed,
}

/// Blocking memcached client.
///
/// Exclusively owns its server list, connections, and behavior flags.
pub struct Client {
    state: ClientState,
    servers: ServerList,
    pool: ConnectionPool,
    behavior: BehaviorConfig,
    distributor: Distributor,
    default_ttl: Ttl,
}

impl Default for Client {
    fn default() -> Self {
        Client::new()
    }
}

impl Client {
    /// Creates a client with no servers; add them with `server_add`.
    pub fn new() -> Self {
        Client {
            state: ClientState::Uninitialized,
            servers: ServerList::new(),
            pool: ConnectionPool::new(),
            behavior: BehaviorConfig::default(),
            distributor: Distributor::new(),
            default_ttl: DEFAULT_TTL,
        }
    }

    /// Creates a client from a server spec string such as
    /// `"cache-a:11211,cache-b:11211"`.
    ///
    /// # Errors
    /// - `InvalidArguments`, `DuplicateServer`, `HostLookup` as for
    ///   `ServerList::parse`.
    pub fn parse(spec: &str) -> MemcResult<Self> {
        let mut client = Client::new();
        client.servers = ServerList::parse(spec)?;
        client.state = ClientState::Ready;
        Ok(client)
    }

    /// Creates a client talking to a single server.
    ///
    /// # Examples
    /// ```rust,no_run
    /// use memc_client::{Client, ReturnCode};
    ///
    /// let mut client = Client::with_server("127.0.0.1", 11211).unwrap();
    /// let outcome = client.set("greeting", "hello").unwrap();
    /// assert_eq!(outcome.code(), ReturnCode::Stored);
    /// let hit = client.get("greeting").unwrap();
    /// assert_eq!(hit.value().map(|v| v.as_ref()), Some(&b"hello"[..]));
    /// ```
    pub fn with_server(host: &str, port: u16) -> MemcResult<Self> {
        let mut client = Client::new();
        client.server_add(host, port)?;
        Ok(client)
    }

    /// Creates a client from a loaded `ClientConfig`.
    pub fn with_config(config: ClientConfig) -> MemcResult<Self> {
        config.behavior.validate()?;
        let mut client = Client::new();
        client.default_ttl = config.default_ttl();
        client.behavior = config.behavior;
        for entry in &config.servers {
            for spec in ServerSpec::parse_list(entry)? {
                client.servers.add_spec(spec)?;
            }
        }
        if client.behavior.sort_hosts {
            client.servers.sort();
        }
        if !client.servers.is_empty() {
            client.state = ClientState::Ready;
        }
        Ok(client)
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn servers(&self) -> &ServerList {
        &self.servers
    }

    pub fn behavior(&self) -> &BehaviorConfig {
        &self.behavior
    }

    pub fn default_ttl(&self) -> Ttl {
        self.default_ttl
    }

    pub fn set_default_ttl(&mut self, ttl: impl Into<Ttl>) {
        self.default_ttl = ttl.into();
    }

    fn ensure_open(&self) -> MemcResult<()> {
        match self.state {
            ClientState::Closed => Err(MemcError::Closed),
            _ => Ok(()),
        }
    }

    fn ensure_ready(&self) -> MemcResult<()> {
        match self.state {
            ClientState::Ready => Ok(()),
            ClientState::Uninitialized => Err(MemcError::NoServers),
            ClientState::Closed => Err(MemcError::Closed),
        }
    }

    /// Adds a server with weight 1; usable at any time before `close`.
    ///
    /// # Errors
    /// - `DuplicateServer` if `host:port` is already configured; the list is
    ///   left unchanged.
    /// - `HostLookup` if `host` does not resolve.
    pub fn server_add(&mut self, host: &str, port: u16) -> MemcResult<&Server> {
        self.server_add_with_weight(host, port, 1)
    }

    /// Adds a server with an explicit ketama weight.
    pub fn server_add_with_weight(
        &mut self,
        host: &str,
        port: u16,
        weight: u32,
    ) -> MemcResult<&Server> {
        self.ensure_open()?;
        let index = self.servers.add_with_weight(host, port, weight)?;
        let slot = self.servers.get(index).map(Server::slot);
        if self.behavior.sort_hosts {
            self.servers.sort();
        }
        self.state = ClientState::Ready;
        self.servers
            .iter()
            .find(|server| Some(server.slot()) == slot)
            .ok_or(MemcError::NoServers)
    }

    /// Number of configured servers regardless of liveness.
    pub fn server_count(&self) -> usize {
        self.servers.count()
    }

    /// Server that owns `key` under the current distribution.
    pub fn server_for_key(&mut self, key: impl IntoKey) -> MemcResult<&Server> {
        let key = key.into_key()?;
        self.ensure_ready()?;
        self.revive_dead();
        let index = self
            .distributor
            .select_server(&key, &self.servers, &self.behavior)?;
        self.servers.get(index).ok_or(MemcError::NoServers)
    }

    /// Unconditional store with the default TTL.
    pub fn set(&mut self, key: impl IntoKey, value: impl AsRef<[u8]>) -> MemcResult<Outcome> {
        let ttl = self.default_ttl;
        self.store(StoreMode::Set, key, value.as_ref(), 0, ttl)
    }

    pub fn set_with_ttl(
        &mut self,
        key: impl IntoKey,
        value: impl AsRef<[u8]>,
        ttl: impl Into<Ttl>,
    ) -> MemcResult<Outcome> {
        self.store(StoreMode::Set, key, value.as_ref(), 0, ttl.into())
    }

    /// Unconditional store carrying client flags.
    pub fn set_with_flags(
        &mut self,
        key: impl IntoKey,
        value: impl AsRef<[u8]>,
        flags: u32,
        ttl: impl Into<Ttl>,
    ) -> MemcResult<Outcome> {
        self.store(StoreMode::Set, key, value.as_ref(), flags, ttl.into())
    }

    /// Stores only if the key is absent; an existing key yields `NotStored`.
    pub fn add(&mut self, key: impl IntoKey, value: impl AsRef<[u8]>) -> MemcResult<Outcome> {
        let ttl = self.default_ttl;
        self.store(StoreMode::Add, key, value.as_ref(), 0, ttl)
    }

    pub fn add_with_ttl(
        &mut self,
        key: impl IntoKey,
        value: impl AsRef<[u8]>,
        ttl: impl Into<Ttl>,
    ) -> MemcResult<Outcome> {
        self.store(StoreMode::Add, key, value.as_ref(), 0, ttl.into())
    }

    /// Stores only if the key is present; a missing key yields `NotStored`.
    pub fn replace(&mut self, key: impl IntoKey, value: impl AsRef<[u8]>) -> MemcResult<Outcome> {
        let ttl = self.default_ttl;
        self.store(StoreMode::Replace, key, value.as_ref(), 0, ttl)
    }

    pub fn replace_with_ttl(
        &mut self,
        key: impl IntoKey,
        value: impl AsRef<[u8]>,
        ttl: impl Into<Ttl>,
    ) -> MemcResult<Outcome> {
        self.store(StoreMode::Replace, key, value.as_ref(), 0, ttl.into())
    }

    /// Stores only if the item still carries `token`.
    ///
    /// `DataExists` means another writer got there first; `NotFound` means
    /// the item is gone.
    pub fn cas(
        &mut self,
        key: impl IntoKey,
        value: impl AsRef<[u8]>,
        ttl: impl Into<Ttl>,
        token: u64,
    ) -> MemcResult<Outcome> {
        self.store(StoreMode::Cas(token), key, value.as_ref(), 0, ttl.into())
    }

    fn store(
        &mut self,
        mode: StoreMode,
        key: impl IntoKey,
        value: &[u8],
        flags: u32,
        ttl: Ttl,
    ) -> MemcResult<Outcome> {
        let key = key.into_key()?;
        self.ensure_ready()?;
        let request = Request::Store {
            mode,
            key: &key,
            value,
            flags,
            ttl,
        };
        self.dispatch_write(&key, &request)
    }

    /// Fetches one item.
    ///
    /// A miss is `Ok` with `ReturnCode::NotFound`. With replicas configured,
    /// a failed or missing read falls through to the next replica.
    ///
    /// # Errors
    /// - `NotSupported` in UDP mode.
    /// - `Protocol` if a reply is malformed or truncated beyond recovery.
    pub fn get(&mut self, key: impl IntoKey) -> MemcResult<Outcome> {
        let key = key.into_key()?;
        self.ensure_ready()?;
        if self.behavior.use_udp {
            return Err(MemcError::NotSupported("get over UDP".to_string()));
        }
        self.revive_dead();

        let mut targets = match self.select_targets(&key)? {
            Some(targets) => targets,
            None => return Ok(Outcome::new(ReturnCode::NoServers)),
        };
        if self.behavior.randomize_replica_read && targets.len() > 1 {
            let start = self.distributor.random_index(targets.len());
            targets.rotate_left(start);
        }

        let with_cas = self.behavior.support_cas;
        let request = Request::Get { key: &key, with_cas };
        let mut last = Outcome::new(ReturnCode::NoServers);
        for index in targets {
            let result = self
                .pool
                .run(&mut self.servers, index, &self.behavior, |conn, behavior| {
                    conn.request(&request, behavior)
                });
            match result {
                Ok(Reply::Hit(mut item)) => {
                    if !with_cas {
                        item.cas = None;
                    }
                    return Ok(Outcome::hit(item));
                }
                Ok(reply) => {
                    log_error_reply(&key, &reply);
                    last = reply.into_outcome();
                }
                Err(err) => last = Outcome::new(err.into_code()?),
            }
        }
        Ok(last)
    }

    /// Deletes `key` immediately.
    pub fn delete(&mut self, key: impl IntoKey) -> MemcResult<Outcome> {
        self.delete_with_ttl(key, Ttl::NEVER)
    }

    /// Deletes `key`, asking the server to hold a lock window of `ttl`.
    ///
    /// # Errors
    /// - `InvalidArguments` for a non-zero `ttl` under the binary protocol,
    ///   which has no field for it.
    pub fn delete_with_ttl(
        &mut self,
        key: impl IntoKey,
        ttl: impl Into<Ttl>,
    ) -> MemcResult<Outcome> {
        let key = key.into_key()?;
        self.ensure_ready()?;
        let request = Request::Delete {
            key: &key,
            ttl: ttl.into(),
        };
        self.dispatch_write(&key, &request)
    }

    /// Invalidates every item on every configured server after `ttl`.
    ///
    /// All servers failing returns the last failure code; a subset failing
    /// returns `SomeErrors`.
    pub fn flush(&mut self, ttl: impl Into<Ttl>) -> MemcResult<Outcome> {
        self.ensure_ready()?;
        self.revive_dead();
        let request = Request::Flush { ttl: ttl.into() };

        let total = self.servers.count();
        let mut failed = 0;
        let mut last_failure = ReturnCode::Failure;
        let mut fatal = None;
        for index in 0..total {
            match self.write_to(index, &request) {
                Ok(outcome) if outcome.is_success() => {}
                Ok(outcome) => {
                    failed += 1;
                    last_failure = outcome.code();
                }
                Err(err) => {
                    failed += 1;
                    last_failure = err.code();
                    fatal.get_or_insert(err);
                }
            }
        }
        if let Some(err) = fatal {
            return Err(err);
        }

        let code = if failed == 0 {
            self.write_code()
        } else if failed == total {
            last_failure
        } else {
            ReturnCode::SomeErrors
        };
        Ok(Outcome::new(code))
    }

    /// Writes every buffered request to its server.
    ///
    /// Returns `WriteFailure` if any server could not be written.
    pub fn flush_buffers(&mut self) -> MemcResult<Outcome> {
        self.ensure_ready()?;
        let failed = self.pool.flush_all(&mut self.servers, &self.behavior);
        if failed > 0 {
            debug!(failed, "flush_buffers could not reach every server");
            return Ok(Outcome::new(ReturnCode::WriteFailure));
        }
        Ok(Outcome::new(ReturnCode::Success))
    }

    /// Sets one behavior flag; non-zero means "on" for boolean flags.
    ///
    /// Timeouts, TCP flags and socket buffer sizes reach open connections on
    /// their next use.
    ///
    /// # Errors
    /// - `InvalidArguments` for negative or out-of-range values.
    /// - `NotSupported` for recognised but unavailable values.
    /// - `Closed` after `close`.
    pub fn behavior_set(&mut self, flag: Behavior, value: i64) -> MemcResult<()> {
        self.ensure_open()?;
        let change = self.behavior.set(flag, value)?;
        debug!(flag = flag.name(), value, "behavior set");
        if change.transport_changed {
            // Open sockets speak the old framing; queued requests go out first.
            self.pool.close_all();
        }
        if change.resort_hosts {
            self.servers.sort();
        }
        Ok(())
    }

    /// Same as `behavior_set(flag, 1)`.
    pub fn behavior_enable(&mut self, flag: Behavior) -> MemcResult<()> {
        self.behavior_set(flag, 1)
    }

    /// Sets a flag by its stable numeric id.
    ///
    /// # Errors
    /// - `NotSupported` for retired ids, `InvalidArguments` for unknown ones.
    pub fn behavior_set_raw(&mut self, id: u32, value: i64) -> MemcResult<()> {
        let flag = Behavior::from_id(id)?;
        self.behavior_set(flag, value)
    }

    /// Current value of one flag in integer form.
    pub fn behavior_get(&self, flag: Behavior) -> u64 {
        self.behavior.get(flag)
    }

    /// Releases every connection; later calls are no-ops.
    pub fn close(&mut self) {
        if self.state == ClientState::Closed {
            return;
        }
        self.pool.close_all();
        self.state = ClientState::Closed;
        debug!(servers = self.servers.count(), "client closed");
    }

    fn revive_dead(&mut self) {
        if self.behavior.auto_eject_hosts {
            self.servers
                .revive_expired(self.behavior.retry_timeout(), Instant::now());
        }
    }

    /// `None` when every server is ejected.
    fn select_targets(&mut self, key: &Key) -> MemcResult<Option<Vec<usize>>> {
        let count = 1 + self.behavior.number_of_replicas as usize;
        match self
            .distributor
            .select_servers(key, &self.servers, &self.behavior, count)
        {
            Ok(targets) => Ok(Some(targets)),
            Err(MemcError::NoServers) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Sends a keyed write to the primary and its replicas; returns the
    /// primary's outcome.
    fn dispatch_write(&mut self, key: &Key, request: &Request<'_>) -> MemcResult<Outcome> {
        self.revive_dead();
        let targets = match self.select_targets(key)? {
            Some(targets) => targets,
            None => return Ok(Outcome::new(ReturnCode::NoServers)),
        };
        let mut primary = None;
        for index in targets {
            let outcome = self.write_to(index, request)?;
            if !outcome.is_success() {
                log_outcome(key, index, &outcome);
            }
            primary.get_or_insert(outcome);
        }
        Ok(primary.unwrap_or_else(|| Outcome::new(ReturnCode::NoServers)))
    }

    fn write_to(&mut self, index: usize, request: &Request<'_>) -> MemcResult<Outcome> {
        let behavior = &self.behavior;
        let result = if behavior.writes_are_async() || behavior.no_reply || behavior.use_udp {
            let code = self.write_code();
            self.pool
                .run(&mut self.servers, index, &self.behavior, |conn, behavior| {
                    conn.send_async(request, behavior)
                })
                .map(|_| Outcome::new(code))
        } else {
            self.pool
                .run(&mut self.servers, index, &self.behavior, |conn, behavior| {
                    conn.request(request, behavior)
                })
                .map(Reply::into_outcome)
        };
        fold(result)
    }

    /// Success code for a write that was not acknowledged by the server.
    fn write_code(&self) -> ReturnCode {
        if self.behavior.writes_are_async() {
            ReturnCode::Buffered
        } else {
            ReturnCode::Success
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

fn fold(result: Result<Outcome, WireError>) -> MemcResult<Outcome> {
    match result {
        Ok(outcome) => Ok(outcome),
        Err(err) => err.into_code().map(Outcome::new),
    }
}

fn log_error_reply(key: &Key, reply: &Reply) {
    if let Reply::ClientError(message) | Reply::ServerError(message) = reply {
        debug!(key = %key, code = %reply.code(), message = %message, "server refused request");
    }
}

fn log_outcome(key: &Key, index: usize, outcome: &Outcome) {
    debug!(key = %key, server = index, code = %outcome.code(), "write not applied");
}
