//! # Key Distribution
//!
//! Purpose: Map a key onto one server (plus replica fallbacks) of a
//! `ServerList`, using the hashing and distribution strategy selected in
//! `BehaviorConfig`.
//!
//! ## Design Principles
//! 1. **Cached Ring**: The ketama ring is rebuilt only when the server list
//!    generation or ring parameters change.
//! 2. **Candidate Set**: Ejected servers are dropped from the candidate set
//!    before hashing, so modulo and ring routing agree on who is eligible.
//! 3. **Distinct Replicas**: Fallback targets never repeat a server.
//!
//! ## Ring Layout
//!
//! ```text
//! per server: 160 * weight points (weight = 1 unless weighted)
//! per label : md5("host-i" | "host:port-i") -> 4 LE u32 points
//! lookup    : first point >= hash(key), wrapping to points[0]
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use memc_common::{BehaviorConfig, DistributionKind, Key, MemcError, MemcResult};
use tracing::debug;

use crate::hash::{hash, md5_digest};
use crate::server::ServerList;

const POINTS_PER_SERVER: u32 = 160;
const POINTS_PER_DIGEST: u32 = 4;

/// Immutable consistent-hash ring over server indices.
#[derive(Debug, Clone)]
pub struct Ring {
    /// Sorted `(point, server index)` pairs.
    points: Box<[(u32, usize)]>,
}

impl Ring {
    /// Builds a ring over `candidates` (indices into `servers`).
    pub fn build(servers: &ServerList, candidates: &[usize], weighted: bool) -> Ring {
        let mut points = Vec::new();
        for &idx in candidates {
            let Some(server) = servers.get(idx) else {
                continue;
            };
            let weight = if weighted { server.weight() } else { 1 };
            let num_points = POINTS_PER_SERVER.saturating_mul(weight);
            for i in 0..num_points / POINTS_PER_DIGEST {
                let digest = md5_digest(server.ring_label(i).as_bytes());
                for chunk in digest.chunks_exact(4) {
                    let point = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    points.push((point, idx));
                }
            }
        }
        points.sort_unstable();
        Ring {
            points: points.into_boxed_slice(),
        }
    }

    /// Position of the first point at or after `hash`, wrapping.
    #[inline]
    fn position(&self, hash: u32) -> usize {
        let idx = self.points.partition_point(|&(point, _)| point < hash);
        if idx == self.points.len() {
            0
        } else {
            idx
        }
    }

    /// Server owning `hash`.
    pub fn route(&self, hash: u32) -> Option<usize> {
        self.points.get(self.position(hash)).map(|&(_, idx)| idx)
    }

    /// Up to `count` distinct servers in ring order starting at `hash`.
    pub fn walk(&self, hash: u32, count: usize) -> Vec<usize> {
        let mut picked = Vec::with_capacity(count);
        if self.points.is_empty() {
            return picked;
        }
        let start = self.position(hash);
        for step in 0..self.points.len() {
            if picked.len() == count {
                break;
            }
            let (_, idx) = self.points[(start + step) % self.points.len()];
            if !picked.contains(&idx) {
                picked.push(idx);
            }
        }
        picked
    }

    /// Total number of points on the ring.
    pub fn point_count(&self) -> usize {
        self.points.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RingKey {
    generation: u64,
    weighted: bool,
    eject: bool,
}

/// Server selection with a cached ring.
#[derive(Debug)]
pub struct Distributor {
    ring: Option<(RingKey, Ring)>,
    rng: XorShift64,
}

impl Default for Distributor {
    fn default() -> Self {
        Distributor::new()
    }
}

impl Distributor {
    pub fn new() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0x9E37_79B9_7F4A_7C15);
        Distributor {
            ring: None,
            rng: XorShift64::new(seed),
        }
    }

    /// Primary server index for `key`.
    ///
    /// # Errors
    /// - `NoServers` if the candidate set is empty.
    pub fn select_server(
        &mut self,
        key: &Key,
        servers: &ServerList,
        behavior: &BehaviorConfig,
    ) -> MemcResult<usize> {
        let picked = self.select_servers(key, servers, behavior, 1)?;
        picked.first().copied().ok_or(MemcError::NoServers)
    }

    /// Primary plus up to `count - 1` distinct fallback indices.
    pub fn select_servers(
        &mut self,
        key: &Key,
        servers: &ServerList,
        behavior: &BehaviorConfig,
        count: usize,
    ) -> MemcResult<Vec<usize>> {
        let candidates = candidates(servers, behavior);
        if candidates.is_empty() {
            return Err(MemcError::NoServers);
        }
        let count = count.clamp(1, candidates.len());

        if behavior.distribution.is_consistent() {
            let key_hash = hash(behavior.key_hash(), key.as_bytes())?;
            let ring = self.ring_for(servers, behavior, &candidates);
            return Ok(ring.walk(key_hash, count));
        }

        let start = match behavior.distribution {
            DistributionKind::Random => self.random_index(candidates.len()),
            _ => {
                let key_hash = hash(behavior.hash, key.as_bytes())?;
                key_hash as usize % candidates.len()
            }
        };
        Ok((0..count)
            .map(|step| candidates[(start + step) % candidates.len()])
            .collect())
    }

    /// Uniform index in `0..len`; `len` must be non-zero.
    pub(crate) fn random_index(&mut self, len: usize) -> usize {
        (self.rng.next_u64() % len.max(1) as u64) as usize
    }

    fn ring_for(
        &mut self,
        servers: &ServerList,
        behavior: &BehaviorConfig,
        candidates: &[usize],
    ) -> &Ring {
        let key = RingKey {
            generation: servers.generation(),
            weighted: behavior.ketama_weighted
                || behavior.distribution == DistributionKind::ConsistentWeighted,
            eject: behavior.auto_eject_hosts,
        };
        if matches!(&self.ring, Some((cached, _)) if *cached != key) {
            self.ring = None;
        }
        let (_, ring) = self.ring.get_or_insert_with(|| {
            let ring = Ring::build(servers, candidates, key.weighted);
            debug!(
                generation = key.generation,
                points = ring.point_count(),
                "rebuilt hash ring"
            );
            (key, ring)
        });
        ring
    }
}

/// Indices eligible for routing, in list order.
fn candidates(servers: &ServerList, behavior: &BehaviorConfig) -> Vec<usize> {
    servers
        .iter()
        .enumerate()
        .filter(|(_, server)| !behavior.auto_eject_hosts || server.is_alive())
        .map(|(idx, _)| idx)
        .collect()
}

/// Tiny deterministic PRNG; plenty for picking a random server.
#[derive(Debug, Clone)]
pub struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    /// A zero seed would stay zero forever, so it is bumped to one.
    pub fn new(seed: u64) -> Self {
        Self {
            state: seed.max(1),
        }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    /// Next value masked to `mask`, for power-of-two sized tables.
    #[inline]
    pub fn next_index(&mut self, mask: usize) -> usize {
        (self.next_u64() as usize) & mask
    }
}
