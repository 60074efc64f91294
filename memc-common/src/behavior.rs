//! # Behavior Flags
//!
//! Purpose: Hold every client tunable in one typed struct and expose the
//! flag-oriented `set`/`get` surface embedding hosts drive with numeric
//! constants.
//!
//! ## Design Principles
//! 1. **Typed Storage**: Each flag has a real field with a real type; the
//!    integer view exists only at the `set`/`get` boundary.
//! 2. **Validate on Entry**: Out-of-range values are rejected before any
//!    field changes, so a failed `set` leaves the config untouched.
//! 3. **Stable Ids**: `Behavior` discriminants never change; retired ids stay
//!    reserved and report `NotSupported`.
//!
//! ## Timeout Resolution
//!
//! ```text
//! read  : receive_timeout_ms > 0 ? receive_timeout_ms : poll_timeout_ms
//! write : send_timeout_ms    > 0 ? send_timeout_ms    : poll_timeout_ms
//! 0 after fallback => block without limit
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MemcError, MemcResult};

/// Numeric ids of behavior flags that existed once and were removed.
const RETIRED_IDS: [u32; 5] = [6, 11, 24, 25, 31];

/// A named client tunable.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Behavior {
    NoBlock = 0,
    TcpNoDelay = 1,
    Hash = 2,
    Ketama = 3,
    SocketSendSize = 4,
    SocketRecvSize = 5,
    SupportCas = 7,
    PollTimeout = 8,
    Distribution = 9,
    BufferRequests = 10,
    SortHosts = 12,
    VerifyKey = 13,
    ConnectTimeout = 14,
    RetryTimeout = 15,
    KetamaWeighted = 16,
    KetamaHash = 17,
    BinaryProtocol = 18,
    SendTimeout = 19,
    ReceiveTimeout = 20,
    ServerFailureLimit = 21,
    IoMsgWatermark = 22,
    IoBytesWatermark = 23,
    NoReply = 26,
    UseUdp = 27,
    AutoEjectHosts = 28,
    NumberOfReplicas = 29,
    RandomizeReplicaRead = 30,
    TcpKeepalive = 32,
    TcpKeepIdle = 33,
}

impl Behavior {
    /// Every supported flag, in id order.
    pub const ALL: [Behavior; 29] = [
        Behavior::NoBlock,
        Behavior::TcpNoDelay,
        Behavior::Hash,
        Behavior::Ketama,
        Behavior::SocketSendSize,
        Behavior::SocketRecvSize,
        Behavior::SupportCas,
        Behavior::PollTimeout,
        Behavior::Distribution,
        Behavior::BufferRequests,
        Behavior::SortHosts,
        Behavior::VerifyKey,
        Behavior::ConnectTimeout,
        Behavior::RetryTimeout,
        Behavior::KetamaWeighted,
        Behavior::KetamaHash,
        Behavior::BinaryProtocol,
        Behavior::SendTimeout,
        Behavior::ReceiveTimeout,
        Behavior::ServerFailureLimit,
        Behavior::IoMsgWatermark,
        Behavior::IoBytesWatermark,
        Behavior::NoReply,
        Behavior::UseUdp,
        Behavior::AutoEjectHosts,
        Behavior::NumberOfReplicas,
        Behavior::RandomizeReplicaRead,
        Behavior::TcpKeepalive,
        Behavior::TcpKeepIdle,
    ];

    /// Returns the stable numeric id.
    #[inline]
    pub const fn id(self) -> u32 {
        self as u32
    }

    /// Resolves a numeric id.
    ///
    /// # Errors
    /// - `NotSupported` for retired ids.
    /// - `InvalidArguments` for ids that never existed.
    pub fn from_id(id: u32) -> MemcResult<Self> {
        if let Some(flag) = Self::ALL.iter().copied().find(|b| b.id() == id) {
            return Ok(flag);
        }
        if RETIRED_IDS.contains(&id) {
            return Err(MemcError::NotSupported(format!("behavior {id} is retired")));
        }
        Err(MemcError::InvalidArguments(format!("unknown behavior {id}")))
    }

    /// Constant-style name an embedding host exposes for this flag.
    pub const fn name(self) -> &'static str {
        match self {
            Behavior::NoBlock => "MEMCACHED_BEHAVIOR_NO_BLOCK",
            Behavior::TcpNoDelay => "MEMCACHED_BEHAVIOR_TCP_NODELAY",
            Behavior::Hash => "MEMCACHED_BEHAVIOR_HASH",
            Behavior::Ketama => "MEMCACHED_BEHAVIOR_KETAMA",
            Behavior::SocketSendSize => "MEMCACHED_BEHAVIOR_SOCKET_SEND_SIZE",
            Behavior::SocketRecvSize => "MEMCACHED_BEHAVIOR_SOCKET_RECV_SIZE",
            Behavior::SupportCas => "MEMCACHED_BEHAVIOR_SUPPORT_CAS",
            Behavior::PollTimeout => "MEMCACHED_BEHAVIOR_POLL_TIMEOUT",
            Behavior::Distribution => "MEMCACHED_BEHAVIOR_DISTRIBUTION",
            Behavior::BufferRequests => "MEMCACHED_BEHAVIOR_BUFFER_REQUESTS",
            Behavior::SortHosts => "MEMCACHED_BEHAVIOR_SORT_HOSTS",
            Behavior::VerifyKey => "MEMCACHED_BEHAVIOR_VERIFY_KEY",
            Behavior::ConnectTimeout => "MEMCACHED_BEHAVIOR_CONNECT_TIMEOUT",
            Behavior::RetryTimeout => "MEMCACHED_BEHAVIOR_RETRY_TIMEOUT",
            Behavior::KetamaWeighted => "MEMCACHED_BEHAVIOR_KETAMA_WEIGHTED",
            Behavior::KetamaHash => "MEMCACHED_BEHAVIOR_KETAMA_HASH",
            Behavior::BinaryProtocol => "MEMCACHED_BEHAVIOR_BINARY_PROTOCOL",
            Behavior::SendTimeout => "MEMCACHED_BEHAVIOR_SND_TIMEOUT",
            Behavior::ReceiveTimeout => "MEMCACHED_BEHAVIOR_RCV_TIMEOUT",
            Behavior::ServerFailureLimit => "MEMCACHED_BEHAVIOR_SERVER_FAILURE_LIMIT",
            Behavior::IoMsgWatermark => "MEMCACHED_BEHAVIOR_IO_MSG_WATERMARK",
            Behavior::IoBytesWatermark => "MEMCACHED_BEHAVIOR_IO_BYTES_WATERMARK",
            Behavior::NoReply => "MEMCACHED_BEHAVIOR_NOREPLY",
            Behavior::UseUdp => "MEMCACHED_BEHAVIOR_USE_UDP",
            Behavior::AutoEjectHosts => "MEMCACHED_BEHAVIOR_AUTO_EJECT_HOSTS",
            Behavior::NumberOfReplicas => "MEMCACHED_BEHAVIOR_NUMBER_OF_REPLICAS",
            Behavior::RandomizeReplicaRead => "MEMCACHED_BEHAVIOR_RANDOMIZE_REPLICA_READ",
            Behavior::TcpKeepalive => "MEMCACHED_BEHAVIOR_TCP_KEEPALIVE",
            Behavior::TcpKeepIdle => "MEMCACHED_BEHAVIOR_TCP_KEEPIDLE",
        }
    }
}

/// Hash function applied to keys (and, for ketama, to ring points).
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(non_camel_case_types)]
pub enum HashKind {
    /// Jenkins one-at-a-time.
    #[default]
    Default = 0,
    Md5 = 1,
    Crc = 2,
    Fnv1_64 = 3,
    Fnv1a_64 = 4,
    Fnv1_32 = 5,
    Fnv1a_32 = 6,
    /// Recognised, not implemented.
    Hsieh = 7,
    Murmur = 8,
    /// Recognised, not implemented.
    Jenkins = 9,
}

impl HashKind {
    /// Resolves a numeric flag value.
    pub fn from_value(value: u64) -> MemcResult<Self> {
        let kind = match value {
            0 => HashKind::Default,
            1 => HashKind::Md5,
            2 => HashKind::Crc,
            3 => HashKind::Fnv1_64,
            4 => HashKind::Fnv1a_64,
            5 => HashKind::Fnv1_32,
            6 => HashKind::Fnv1a_32,
            8 => HashKind::Murmur,
            7 | 9 => {
                return Err(MemcError::NotSupported(format!(
                    "hash function {value} is not available"
                )))
            }
            _ => {
                return Err(MemcError::InvalidArguments(format!(
                    "unknown hash function {value}"
                )))
            }
        };
        Ok(kind)
    }
}

/// Strategy mapping a key hash onto a server.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionKind {
    #[default]
    Modulo = 0,
    Consistent = 1,
    ConsistentKetama = 2,
    Random = 3,
    /// Recognised, not implemented.
    ConsistentKetamaSpy = 4,
    ConsistentWeighted = 5,
    /// Recognised, not implemented.
    VirtualBucket = 6,
}

impl DistributionKind {
    /// Resolves a numeric flag value.
    pub fn from_value(value: u64) -> MemcResult<Self> {
        let kind = match value {
            0 => DistributionKind::Modulo,
            1 => DistributionKind::Consistent,
            2 => DistributionKind::ConsistentKetama,
            3 => DistributionKind::Random,
            5 => DistributionKind::ConsistentWeighted,
            4 | 6 => {
                return Err(MemcError::NotSupported(format!(
                    "distribution {value} is not available"
                )))
            }
            _ => {
                return Err(MemcError::InvalidArguments(format!(
                    "unknown distribution {value}"
                )))
            }
        };
        Ok(kind)
    }

    /// True for ring-based strategies.
    #[inline]
    pub fn is_consistent(self) -> bool {
        matches!(
            self,
            DistributionKind::Consistent
                | DistributionKind::ConsistentKetama
                | DistributionKind::ConsistentWeighted
        )
    }
}

/// Side effects a caller must apply after a successful `BehaviorConfig::set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BehaviorChange {
    /// Wire protocol or transport flipped; open connections are stale.
    pub transport_changed: bool,
    /// Host ordering must be re-applied.
    pub resort_hosts: bool,
}

/// Client tunables with their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorConfig {
    /// Writes return `Buffered` without waiting for the server.
    pub no_block: bool,
    pub tcp_nodelay: bool,
    pub hash: HashKind,
    pub distribution: DistributionKind,
    /// Hash used for keys under ketama distributions.
    pub ketama_hash: HashKind,
    pub ketama_weighted: bool,
    /// `SO_SNDBUF` size, 0 keeps the OS default.
    pub socket_send_size: u32,
    /// `SO_RCVBUF` size, 0 keeps the OS default.
    pub socket_recv_size: u32,
    pub support_cas: bool,
    pub poll_timeout_ms: u64,
    /// Writes stay queued until `flush_buffers` or a watermark.
    pub buffer_requests: bool,
    pub sort_hosts: bool,
    pub verify_key: bool,
    /// 0 waits for the OS connect timeout.
    pub connect_timeout_ms: u64,
    /// Seconds before a dead server becomes eligible again.
    pub retry_timeout_secs: u64,
    pub binary_protocol: bool,
    pub send_timeout_ms: u64,
    pub receive_timeout_ms: u64,
    /// Consecutive failures that eject a server under `auto_eject_hosts`.
    pub server_failure_limit: u32,
    pub io_msg_watermark: u32,
    pub io_bytes_watermark: u32,
    pub no_reply: bool,
    pub use_udp: bool,
    pub auto_eject_hosts: bool,
    pub number_of_replicas: u32,
    pub randomize_replica_read: bool,
    pub tcp_keepalive: bool,
    /// Keepalive idle time in seconds, 0 keeps the OS default.
    pub tcp_keepidle_secs: u32,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        BehaviorConfig {
            no_block: false,
            tcp_nodelay: false,
            hash: HashKind::Default,
            distribution: DistributionKind::Modulo,
            ketama_hash: HashKind::Md5,
            ketama_weighted: false,
            socket_send_size: 0,
            socket_recv_size: 0,
            support_cas: false,
            poll_timeout_ms: 5_000,
            buffer_requests: false,
            sort_hosts: false,
            verify_key: false,
            connect_timeout_ms: 0,
            retry_timeout_secs: 2,
            binary_protocol: false,
            send_timeout_ms: 0,
            receive_timeout_ms: 0,
            server_failure_limit: 2,
            io_msg_watermark: 500,
            io_bytes_watermark: 65_536,
            no_reply: false,
            use_udp: false,
            auto_eject_hosts: false,
            number_of_replicas: 0,
            randomize_replica_read: false,
            tcp_keepalive: false,
            tcp_keepidle_secs: 0,
        }
    }
}

impl BehaviorConfig {
    /// Applies one flag.
    ///
    /// Non-zero means "on" for boolean flags. The config is unchanged when an
    /// error is returned.
    ///
    /// # Errors
    /// - `InvalidArguments` for negative or out-of-range values.
    /// - `NotSupported` for recognised but unavailable hash/distribution kinds.
    ///
    /// # Examples
    /// ```rust
    /// use memc_common::{Behavior, BehaviorConfig, DistributionKind};
    ///
    /// let mut config = BehaviorConfig::default();
    /// config.set(Behavior::Distribution, 2).unwrap();
    /// assert_eq!(config.distribution, DistributionKind::ConsistentKetama);
    /// assert!(config.set(Behavior::PollTimeout, -1).is_err());
    /// ```
    pub fn set(&mut self, flag: Behavior, value: i64) -> MemcResult<BehaviorChange> {
        let value = u64::try_from(value).map_err(|_| {
            MemcError::InvalidArguments(format!("{} must not be negative", flag.name()))
        })?;
        let on = value != 0;
        let mut change = BehaviorChange::default();

        match flag {
            Behavior::NoBlock => self.no_block = on,
            Behavior::TcpNoDelay => self.tcp_nodelay = on,
            Behavior::Hash => self.hash = HashKind::from_value(value)?,
            Behavior::Ketama => {
                if on {
                    self.distribution = DistributionKind::ConsistentKetama;
                    self.ketama_hash = HashKind::Md5;
                } else {
                    self.clear_distribution(DistributionKind::ConsistentKetama);
                }
            }
            Behavior::SocketSendSize => self.socket_send_size = to_u32(flag, value)?,
            Behavior::SocketRecvSize => self.socket_recv_size = to_u32(flag, value)?,
            Behavior::SupportCas => self.support_cas = on,
            Behavior::PollTimeout => self.poll_timeout_ms = value,
            Behavior::Distribution => self.distribution = DistributionKind::from_value(value)?,
            Behavior::BufferRequests => self.buffer_requests = on,
            Behavior::SortHosts => {
                self.sort_hosts = on;
                change.resort_hosts = on;
            }
            Behavior::VerifyKey => self.verify_key = on,
            Behavior::ConnectTimeout => self.connect_timeout_ms = value,
            Behavior::RetryTimeout => self.retry_timeout_secs = value,
            Behavior::KetamaWeighted => {
                self.ketama_weighted = on;
                if on {
                    self.distribution = DistributionKind::ConsistentWeighted;
                } else {
                    self.clear_distribution(DistributionKind::ConsistentWeighted);
                }
            }
            Behavior::KetamaHash => self.ketama_hash = HashKind::from_value(value)?,
            Behavior::BinaryProtocol => {
                change.transport_changed = self.binary_protocol != on;
                self.binary_protocol = on;
            }
            Behavior::SendTimeout => self.send_timeout_ms = value,
            Behavior::ReceiveTimeout => self.receive_timeout_ms = value,
            Behavior::ServerFailureLimit => self.server_failure_limit = to_u32(flag, value)?,
            Behavior::IoMsgWatermark => self.io_msg_watermark = to_u32(flag, value)?,
            Behavior::IoBytesWatermark => self.io_bytes_watermark = to_u32(flag, value)?,
            Behavior::NoReply => self.no_reply = on,
            Behavior::UseUdp => {
                change.transport_changed = self.use_udp != on;
                self.use_udp = on;
            }
            Behavior::AutoEjectHosts => self.auto_eject_hosts = on,
            Behavior::NumberOfReplicas => self.number_of_replicas = to_u32(flag, value)?,
            Behavior::RandomizeReplicaRead => self.randomize_replica_read = on,
            Behavior::TcpKeepalive => self.tcp_keepalive = on,
            Behavior::TcpKeepIdle => self.tcp_keepidle_secs = to_u32(flag, value)?,
        }
        Ok(change)
    }

    /// Clearing `Ketama` or `KetamaWeighted` falls back to modulo only when
    /// that flag's distribution is the active one.
    fn clear_distribution(&mut self, selected: DistributionKind) {
        if self.distribution == selected {
            self.distribution = DistributionKind::Modulo;
        }
    }

    /// Reads one flag back in its integer form.
    pub fn get(&self, flag: Behavior) -> u64 {
        match flag {
            Behavior::NoBlock => self.no_block as u64,
            Behavior::TcpNoDelay => self.tcp_nodelay as u64,
            Behavior::Hash => self.hash as u64,
            Behavior::Ketama => (self.distribution == DistributionKind::ConsistentKetama) as u64,
            Behavior::SocketSendSize => u64::from(self.socket_send_size),
            Behavior::SocketRecvSize => u64::from(self.socket_recv_size),
            Behavior::SupportCas => self.support_cas as u64,
            Behavior::PollTimeout => self.poll_timeout_ms,
            Behavior::Distribution => self.distribution as u64,
            Behavior::BufferRequests => self.buffer_requests as u64,
            Behavior::SortHosts => self.sort_hosts as u64,
            Behavior::VerifyKey => self.verify_key as u64,
            Behavior::ConnectTimeout => self.connect_timeout_ms,
            Behavior::RetryTimeout => self.retry_timeout_secs,
            Behavior::KetamaWeighted => self.ketama_weighted as u64,
            Behavior::KetamaHash => self.ketama_hash as u64,
            Behavior::BinaryProtocol => self.binary_protocol as u64,
            Behavior::SendTimeout => self.send_timeout_ms,
            Behavior::ReceiveTimeout => self.receive_timeout_ms,
            Behavior::ServerFailureLimit => u64::from(self.server_failure_limit),
            Behavior::IoMsgWatermark => u64::from(self.io_msg_watermark),
            Behavior::IoBytesWatermark => u64::from(self.io_bytes_watermark),
            Behavior::NoReply => self.no_reply as u64,
            Behavior::UseUdp => self.use_udp as u64,
            Behavior::AutoEjectHosts => self.auto_eject_hosts as u64,
            Behavior::NumberOfReplicas => u64::from(self.number_of_replicas),
            Behavior::RandomizeReplicaRead => self.randomize_replica_read as u64,
            Behavior::TcpKeepalive => self.tcp_keepalive as u64,
            Behavior::TcpKeepIdle => u64::from(self.tcp_keepidle_secs),
        }
    }

    /// Rejects combinations a deserialized config may carry but `set` never
    /// produces.
    pub fn validate(&self) -> MemcResult<()> {
        HashKind::from_value(self.hash as u64)?;
        HashKind::from_value(self.ketama_hash as u64)?;
        DistributionKind::from_value(self.distribution as u64)?;
        Ok(())
    }

    /// Connect timeout, `None` when unbounded.
    pub fn connect_timeout(&self) -> Option<Duration> {
        non_zero_ms(self.connect_timeout_ms)
    }

    /// Per-read socket timeout, falling back to the poll timeout.
    pub fn read_timeout(&self) -> Option<Duration> {
        non_zero_ms(self.receive_timeout_ms).or_else(|| non_zero_ms(self.poll_timeout_ms))
    }

    /// Per-write socket timeout, falling back to the poll timeout.
    pub fn write_timeout(&self) -> Option<Duration> {
        non_zero_ms(self.send_timeout_ms).or_else(|| non_zero_ms(self.poll_timeout_ms))
    }

    /// Time a dead server stays ejected.
    pub fn retry_timeout(&self) -> Duration {
        Duration::from_secs(self.retry_timeout_secs)
    }

    /// True when writes must not wait for the server acknowledgment.
    #[inline]
    pub fn writes_are_async(&self) -> bool {
        self.no_block || self.buffer_requests
    }

    /// Hash applied to keys under the current distribution.
    pub fn key_hash(&self) -> HashKind {
        match self.distribution {
            DistributionKind::ConsistentKetama | DistributionKind::ConsistentWeighted => {
                self.ketama_hash
            }
            _ => self.hash,
        }
    }
}

fn to_u32(flag: Behavior, value: u64) -> MemcResult<u32> {
    u32::try_from(value).map_err(|_| {
        MemcError::InvalidArguments(format!("{} value {value} is out of range", flag.name()))
    })
}

fn non_zero_ms(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}
