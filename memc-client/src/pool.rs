//! # Connection Pool
//!
//! Purpose: Hold one lazily opened connection per server slot and run each
//! exchange through a single place that does failure accounting.
//!
//! ## Design Principles
//! 1. **One Connection Per Server**: Slots are indexed by the server's stable
//!    slot number, so sorting the server list never orphans a socket.
//! 2. **Central Accounting**: Success resets a server's failure streak; an I/O
//!    failure drops the socket and may eject the server.
//! 3. **Fail Fast**: Dead servers are refused before any socket work.

use std::time::Instant;

use memc_common::{BehaviorConfig, MemcError};
use tracing::warn;

use crate::connection::Connection;
use crate::error::WireError;
use crate::server::ServerList;

/// Connections keyed by server slot.
#[derive(Default)]
pub struct ConnectionPool {
    slots: Vec<Option<Connection>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        ConnectionPool { slots: Vec::new() }
    }

    /// Number of slots holding a connection object.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs `op` on the connection for `servers[index]`.
    ///
    /// The connection is opened first if needed. The result is folded into
    /// the server's health before it is returned.
    pub fn run<T, F>(
        &mut self,
        servers: &mut ServerList,
        index: usize,
        behavior: &BehaviorConfig,
        op: F,
    ) -> Result<T, WireError>
    where
        F: FnOnce(&mut Connection, &BehaviorConfig) -> Result<T, WireError>,
    {
        let server = servers.get(index).ok_or(MemcError::NoServers)?;
        let slot = server.slot();
        if !server.is_alive() && behavior.auto_eject_hosts {
            return Err(WireError::MarkedDead(server.id()));
        }

        if self.slots.len() <= slot {
            self.slots.resize_with(slot + 1, || None);
        }
        let conn = self.slots[slot].get_or_insert_with(|| Connection::new(server));
        let result = conn
            .ensure_open(server, behavior)
            .and_then(|_| op(conn, behavior));

        match &result {
            Ok(_) => servers.record_success(index),
            Err(err) if err.is_server_failure() => {
                conn.fail();
                let now = Instant::now();
                let ejected = servers.record_failure(
                    index,
                    behavior.auto_eject_hosts,
                    behavior.server_failure_limit,
                    now,
                );
                if let Some(server) = servers.get(index) {
                    warn!(
                        server = %server,
                        error = %err,
                        failures = server.consecutive_failures(),
                        ejected,
                        "server exchange failed"
                    );
                }
            }
            Err(WireError::Fatal(MemcError::Protocol(_))) => conn.fail(),
            // Rejected before sending, or a complete reply: the stream is intact.
            Err(_) => {}
        }
        result
    }

    /// Flushes queued requests on every open connection.
    ///
    /// Returns the number of servers whose flush failed.
    pub fn flush_all(&mut self, servers: &mut ServerList, behavior: &BehaviorConfig) -> usize {
        let mut failed = 0;
        for index in 0..servers.count() {
            let has_pending = servers
                .get(index)
                .and_then(|server| self.slots.get(server.slot()))
                .and_then(Option::as_ref)
                .is_some_and(|conn| conn.is_open() && conn.has_pending());
            if !has_pending {
                continue;
            }
            if self.run(servers, index, behavior, |conn, _| conn.drain()).is_err() {
                failed += 1;
            }
        }
        failed
    }

    /// Closes every connection, sending queued requests first where possible.
    pub fn close_all(&mut self) {
        for conn in self.slots.iter_mut().flatten() {
            conn.close();
        }
        self.slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memc_common::Behavior;
    use std::net::TcpListener;

    fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    #[test]
    fn failures_eject_after_limit() {
        let mut servers = ServerList::new();
        servers.add("127.0.0.1", closed_port()).unwrap();
        let mut behavior = BehaviorConfig::default();
        behavior.set(Behavior::AutoEjectHosts, 1).unwrap();
        behavior.set(Behavior::ServerFailureLimit, 2).unwrap();
        let mut pool = ConnectionPool::new();

        let first = pool.run(&mut servers, 0, &behavior, |_, _| Ok(()));
        assert!(matches!(first, Err(WireError::Connect { .. })));
        assert!(servers.get(0).unwrap().is_alive());

        let second = pool.run(&mut servers, 0, &behavior, |_, _| Ok(()));
        assert!(matches!(second, Err(WireError::Connect { .. })));
        assert!(!servers.get(0).unwrap().is_alive());

        let third = pool.run(&mut servers, 0, &behavior, |_, _| Ok(()));
        assert!(matches!(third, Err(WireError::MarkedDead(_))));
    }

    #[test]
    fn fatal_errors_do_not_count_as_failures() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut servers = ServerList::new();
        servers.add("127.0.0.1", port).unwrap();
        let behavior = BehaviorConfig::default();
        let mut pool = ConnectionPool::new();

        let result: Result<(), WireError> = pool.run(&mut servers, 0, &behavior, |_, _| {
            Err(MemcError::BadKey.into())
        });
        assert!(matches!(result, Err(WireError::Fatal(MemcError::BadKey))));
        assert_eq!(servers.get(0).unwrap().consecutive_failures(), 0);
        assert_eq!(pool.len(), 1);

        pool.close_all();
        assert!(pool.is_empty());
    }
}
