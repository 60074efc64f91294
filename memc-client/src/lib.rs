// memc-client - Synchronous memcached client
//
// Blocking client for memcached servers speaking the text or binary protocol,
// with modulo or ketama distribution, replicas, and host ejection.

//! # memc Sync Client
//!
//! Purpose: Provide a blocking memcached client that spreads keys across a
//! server fleet and keeps one reusable connection per server.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `Client` hides distribution, pooling, and framing.
//! 2. **Soft vs Hard Results**: Expected outcomes are values, broken setups
//!    and protocol faults are errors.
//! 3. **Minimal Allocation**: Reuse per-connection buffers for framing.
//! 4. **Protocol Clarity**: Text and binary framing are explicit codecs.

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod distributor;
pub mod error;
pub mod hash;
pub mod pool;
pub mod server;

pub use client::{Client, ClientState};
pub use codec::{Protocol, Reply, WireCodec};
pub use config::ClientConfig;
pub use connection::{ConnState, Connection};
pub use distributor::{Distributor, Ring, XorShift64};
pub use error::WireError;
pub use pool::ConnectionPool;
pub use server::{Server, ServerList, ServerSpec, ServerState};

pub use memc_common::{
    Behavior, BehaviorConfig, DistributionKind, HashKind, IntoKey, Item, Key, KeyInput, MemcError,
    MemcResult, Outcome, ReturnCode, Symbol, Ttl, DEFAULT_PORT, DEFAULT_TTL,
};
