//! # Server List
//!
//! Purpose: Own the ordered set of configured memcached endpoints together
//! with their liveness state.
//!
//! ## Design Principles
//! 1. **Append-Only Order**: New servers go to the end so modulo routing of
//!    existing keys stays put; only `SortHosts` reorders.
//! 2. **Stable Slots**: Every server keeps the pool slot it was born with, so
//!    reordering never strands a connection.
//! 3. **Generation Counter**: Any change that can move keys bumps
//!    `generation`, letting the distributor cache its ring.
//! 4. **Validate Before Mutate**: Parsing and resolution finish before the
//!    list changes.
//!
//! ## Spec Grammar
//!
//! ```text
//! list  := entry ((',' | whitespace) entry)*
//! entry := host | host ':' port | host ':' port ':' weight
//!        | '[' v6 ']' | '[' v6 ']' ':' port | '[' v6 ']' ':' port ':' weight
//! ```

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::{Duration, Instant};

use memc_common::{MemcError, MemcResult, DEFAULT_PORT};
use tracing::{debug, info, warn};

/// Liveness of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Alive,
    /// Ejected; eligible again once the retry window elapses.
    Dead,
}

/// One parsed entry of a server spec string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSpec {
    pub host: String,
    pub port: u16,
    pub weight: u32,
}

impl ServerSpec {
    /// Parses a full spec string into entries.
    ///
    /// # Errors
    /// - `InvalidArguments` if the string is empty or any entry is malformed.
    ///
    /// # Examples
    /// ```rust
    /// use memc_client::ServerSpec;
    ///
    /// let specs = ServerSpec::parse_list("cache-a:11212, cache-b [::1]:11213:3").unwrap();
    /// assert_eq!(specs.len(), 3);
    /// assert_eq!(specs[1].port, 11211);
    /// assert_eq!(specs[2].host, "::1");
    /// assert_eq!(specs[2].weight, 3);
    /// ```
    pub fn parse_list(spec: &str) -> MemcResult<Vec<ServerSpec>> {
        let entries: Vec<ServerSpec> = spec
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|entry| !entry.is_empty())
            .map(ServerSpec::parse)
            .collect::<MemcResult<_>>()?;
        if entries.is_empty() {
            return Err(MemcError::InvalidArguments(
                "server list is empty".to_string(),
            ));
        }
        Ok(entries)
    }

    /// Parses one `host[:port[:weight]]` entry.
    pub fn parse(entry: &str) -> MemcResult<ServerSpec> {
        let malformed = || MemcError::InvalidArguments(format!("malformed server entry {entry:?}"));

        let (host, rest) = if let Some(bracketed) = entry.strip_prefix('[') {
            let end = bracketed.find(']').ok_or_else(malformed)?;
            let rest = &bracketed[end + 1..];
            if rest.is_empty() {
                (&bracketed[..end], None)
            } else {
                (&bracketed[..end], Some(rest.strip_prefix(':').ok_or_else(malformed)?))
            }
        } else {
            match entry.split_once(':') {
                Some((host, rest)) => (host, Some(rest)),
                None => (entry, None),
            }
        };
        if host.is_empty() {
            return Err(malformed());
        }

        let Some(rest) = rest else {
            return Ok(ServerSpec {
                host: host.to_string(),
                port: DEFAULT_PORT,
                weight: 1,
            });
        };
        let mut fields = rest.split(':');
        let port = fields
            .next()
            .and_then(|port| port.parse::<u16>().ok())
            .filter(|port| *port != 0)
            .ok_or_else(malformed)?;
        let weight = match fields.next() {
            None => 1,
            Some(weight) => weight
                .parse::<u32>()
                .ok()
                .filter(|weight| *weight != 0)
                .ok_or_else(malformed)?,
        };
        if fields.next().is_some() {
            return Err(malformed());
        }

        Ok(ServerSpec {
            host: host.to_string(),
            port,
            weight,
        })
    }
}

/// One configured memcached endpoint.
#[derive(Debug, Clone)]
pub struct Server {
    host: String,
    port: u16,
    weight: u32,
    addrs: Vec<SocketAddr>,
    slot: usize,
    state: ServerState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
}

impl Server {
    fn resolve(spec: ServerSpec, slot: usize) -> MemcResult<Server> {
        let addrs: Vec<SocketAddr> = (spec.host.as_str(), spec.port)
            .to_socket_addrs()
            .map_err(|err| MemcError::HostLookup(format!("{}:{}: {err}", spec.host, spec.port)))?
            .collect();
        if addrs.is_empty() {
            return Err(MemcError::HostLookup(format!(
                "{}:{}: no addresses",
                spec.host, spec.port
            )));
        }
        Ok(Server {
            host: spec.host,
            port: spec.port,
            weight: spec.weight,
            addrs,
            slot,
            state: ServerState::Alive,
            consecutive_failures: 0,
            last_failure: None,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// Resolved socket addresses, in resolver order.
    pub fn addrs(&self) -> &[SocketAddr] {
        &self.addrs
    }

    /// Pool slot owned by this server.
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn is_alive(&self) -> bool {
        self.state == ServerState::Alive
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_failure(&self) -> Option<Instant> {
        self.last_failure
    }

    /// `host:port`, with IPv6 hosts bracketed.
    pub fn id(&self) -> String {
        self.to_string()
    }

    /// Label hashed onto the ketama ring for point `index`.
    pub fn ring_label(&self, index: u32) -> String {
        if self.port == DEFAULT_PORT {
            format!("{}-{index}", self.host)
        } else {
            format!("{}:{}-{index}", self.host, self.port)
        }
    }

    fn same_endpoint(&self, host: &str, port: u16) -> bool {
        self.port == port && self.host.eq_ignore_ascii_case(host)
    }

    /// Counts one failure and returns the new streak length.
    pub(crate) fn record_failure(&mut self, now: Instant) -> u32 {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure = Some(now);
        self.consecutive_failures
    }

    pub(crate) fn record_success(&mut self) {
        self.consecutive_failures = 0;
        if self.state == ServerState::Dead {
            self.state = ServerState::Alive;
        }
    }

    pub(crate) fn mark_dead(&mut self, now: Instant) {
        self.state = ServerState::Dead;
        self.last_failure = Some(now);
    }

    pub(crate) fn mark_alive(&mut self) {
        self.state = ServerState::Alive;
    }

    /// True once a dead server's retry window has elapsed.
    fn retry_due(&self, retry: Duration, now: Instant) -> bool {
        match self.last_failure {
            Some(at) => now.saturating_duration_since(at) >= retry,
            None => true,
        }
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Ordered, mutable set of servers.
#[derive(Debug, Default)]
pub struct ServerList {
    servers: Vec<Server>,
    next_slot: usize,
    generation: u64,
}

impl ServerList {
    /// Creates an empty list.
    pub fn new() -> Self {
        ServerList::default()
    }

    /// Parses and resolves a spec string into a new list.
    ///
    /// # Errors
    /// - `InvalidArguments` for malformed specs.
    /// - `DuplicateServer` if an entry repeats.
    /// - `HostLookup` if any host fails to resolve.
    pub fn parse(spec: &str) -> MemcResult<Self> {
        let mut list = ServerList::new();
        for entry in ServerSpec::parse_list(spec)? {
            list.add_spec(entry)?;
        }
        Ok(list)
    }

    /// Appends `host:port` with weight 1 and returns its index.
    pub fn add(&mut self, host: &str, port: u16) -> MemcResult<usize> {
        self.add_with_weight(host, port, 1)
    }

    /// Appends `host:port` with an explicit ketama weight.
    pub fn add_with_weight(&mut self, host: &str, port: u16, weight: u32) -> MemcResult<usize> {
        if host.is_empty() || port == 0 || weight == 0 {
            return Err(MemcError::InvalidArguments(format!(
                "invalid server {host}:{port} weight {weight}"
            )));
        }
        self.add_spec(ServerSpec {
            host: host.to_string(),
            port,
            weight,
        })
    }

    /// Appends a parsed entry; the list is untouched on error.
    pub fn add_spec(&mut self, spec: ServerSpec) -> MemcResult<usize> {
        if let Some(existing) = self
            .servers
            .iter()
            .find(|server| server.same_endpoint(&spec.host, spec.port))
        {
            return Err(MemcError::DuplicateServer(existing.id()));
        }
        let server = Server::resolve(spec, self.next_slot)?;
        debug!(server = %server, slot = server.slot, "server added");
        self.next_slot += 1;
        self.servers.push(server);
        self.generation += 1;
        Ok(self.servers.len() - 1)
    }

    /// Number of configured servers regardless of liveness.
    #[inline]
    pub fn count(&self) -> usize {
        self.servers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Server> {
        self.servers.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Server> {
        self.servers.iter()
    }

    pub fn as_slice(&self) -> &[Server] {
        &self.servers
    }

    /// Bumped whenever routing inputs change (membership, order, liveness).
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of slots ever handed out; sizes the connection pool.
    pub fn slot_count(&self) -> usize {
        self.next_slot
    }

    /// Orders servers by `host:port`.
    pub fn sort(&mut self) {
        self.servers
            .sort_by(|a, b| a.host.cmp(&b.host).then(a.port.cmp(&b.port)));
        self.generation += 1;
    }

    /// Ejects `index`; routing skips it under auto-eject.
    pub fn mark_dead(&mut self, index: usize, now: Instant) {
        if let Some(server) = self.servers.get_mut(index) {
            if server.is_alive() {
                warn!(
                    server = %server,
                    failures = server.consecutive_failures,
                    "server marked dead"
                );
                server.mark_dead(now);
                self.generation += 1;
            }
        }
    }

    /// Returns `index` to the eligible set.
    pub fn mark_alive(&mut self, index: usize) {
        if let Some(server) = self.servers.get_mut(index) {
            if !server.is_alive() {
                server.mark_alive();
                self.generation += 1;
            }
        }
    }

    /// Revives every dead server whose retry window has elapsed.
    ///
    /// Failure streaks are kept, so a revived server that fails once more is
    /// ejected again immediately.
    pub fn revive_expired(&mut self, retry: Duration, now: Instant) -> usize {
        let mut revived = 0;
        for server in &mut self.servers {
            if !server.is_alive() && server.retry_due(retry, now) {
                info!(server = %server, "retry window elapsed, server eligible again");
                server.mark_alive();
                revived += 1;
            }
        }
        if revived > 0 {
            self.generation += 1;
        }
        revived
    }

    /// Records a failed exchange; returns true if the server was just ejected.
    pub(crate) fn record_failure(
        &mut self,
        index: usize,
        eject: bool,
        limit: u32,
        now: Instant,
    ) -> bool {
        let Some(server) = self.servers.get_mut(index) else {
            return false;
        };
        let failures = server.record_failure(now);
        if eject && server.is_alive() && failures >= limit.max(1) {
            self.mark_dead(index, now);
            return true;
        }
        false
    }

    /// Records a successful exchange.
    pub(crate) fn record_success(&mut self, index: usize) {
        if let Some(server) = self.servers.get_mut(index) {
            let was_dead = !server.is_alive();
            server.record_success();
            if was_dead {
                self.generation += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_entry_variants() {
        assert_eq!(
            ServerSpec::parse("localhost").unwrap(),
            ServerSpec {
                host: "localhost".into(),
                port: 11211,
                weight: 1
            }
        );
        let spec = ServerSpec::parse("10.0.0.1:11300:4").unwrap();
        assert_eq!((spec.host.as_str(), spec.port, spec.weight), ("10.0.0.1", 11300, 4));
        let spec = ServerSpec::parse("[::1]:11212").unwrap();
        assert_eq!((spec.host.as_str(), spec.port), ("::1", 11212));
        let spec = ServerSpec::parse("[::1]").unwrap();
        assert_eq!(spec.port, 11211);
    }

    #[test]
    fn rejects_malformed_entries() {
        for bad in [
            "host:",
            "host:0",
            "host:99999",
            "host:1:0",
            "host:1:2:3",
            ":11211",
            "[::1",
            "[::1]x",
            "::1",
        ] {
            let err = ServerSpec::parse(bad).unwrap_err();
            assert!(matches!(err, MemcError::InvalidArguments(_)), "{bad}");
        }
        assert!(matches!(
            ServerSpec::parse_list(" , "),
            Err(MemcError::InvalidArguments(_))
        ));
    }

    #[test]
    fn parse_list_resolves_and_orders() {
        let list = ServerList::parse("127.0.0.1:11311,127.0.0.1:11312 127.0.0.1:11313").unwrap();
        assert_eq!(list.count(), 3);
        let ports: Vec<u16> = list.iter().map(Server::port).collect();
        assert_eq!(ports, vec![11311, 11312, 11313]);
        assert_eq!(list.get(2).unwrap().slot(), 2);
    }

    #[test]
    fn duplicate_add_leaves_list_unchanged() {
        let mut list = ServerList::new();
        list.add("127.0.0.1", 11211).unwrap();
        let generation = list.generation();
        let err = list.add("127.0.0.1", 11211).unwrap_err();
        assert!(matches!(err, MemcError::DuplicateServer(ref id) if id == "127.0.0.1:11211"));
        assert_eq!(list.count(), 1);
        assert_eq!(list.generation(), generation);
    }

    #[test]
    fn unresolvable_host_is_lookup_failure() {
        let mut list = ServerList::new();
        let err = list.add("no-such-host.invalid", 11211).unwrap_err();
        assert!(matches!(err, MemcError::HostLookup(_)));
        assert!(list.is_empty());
    }

    #[test]
    fn ring_labels_omit_default_port() {
        let mut list = ServerList::new();
        list.add("127.0.0.1", 11211).unwrap();
        list.add("127.0.0.1", 11212).unwrap();
        assert_eq!(list.get(0).unwrap().ring_label(3), "127.0.0.1-3");
        assert_eq!(list.get(1).unwrap().ring_label(0), "127.0.0.1:11212-0");
    }

    #[test]
    fn sort_keeps_slots() {
        let mut list = ServerList::new();
        list.add("127.0.0.3", 11211).unwrap();
        list.add("127.0.0.1", 11211).unwrap();
        list.sort();
        assert_eq!(list.get(0).unwrap().host(), "127.0.0.1");
        assert_eq!(list.get(0).unwrap().slot(), 1);
        assert_eq!(list.get(1).unwrap().slot(), 0);
    }

    #[test]
    fn failures_eject_and_retry_window_revives() {
        let mut list = ServerList::new();
        list.add("127.0.0.1", 11211).unwrap();
        let start = Instant::now();

        assert!(!list.record_failure(0, true, 2, start));
        assert!(list.record_failure(0, true, 2, start));
        assert_eq!(list.get(0).unwrap().state(), ServerState::Dead);

        assert_eq!(list.revive_expired(Duration::from_secs(2), start), 0);
        let later = start + Duration::from_secs(3);
        assert_eq!(list.revive_expired(Duration::from_secs(2), later), 1);
        assert!(list.get(0).unwrap().is_alive());
        assert_eq!(list.get(0).unwrap().consecutive_failures(), 2);

        // One more failure re-ejects; a success resets the streak.
        assert!(list.record_failure(0, true, 2, later));
        list.record_success(0);
        assert!(list.get(0).unwrap().is_alive());
        assert_eq!(list.get(0).unwrap().consecutive_failures(), 0);
    }

    #[test]
    fn failures_without_eject_never_kill() {
        let mut list = ServerList::new();
        list.add("127.0.0.1", 11211).unwrap();
        let now = Instant::now();
        for _ in 0..5 {
            assert!(!list.record_failure(0, false, 2, now));
        }
        assert!(list.get(0).unwrap().is_alive());
    }
}
