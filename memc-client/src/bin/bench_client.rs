//! # Client Benchmark Harness
//!
//! Purpose: Drive a repeatable set/get loop against live memcached servers so
//! client throughput and latency can be compared across behavior settings.
//!
//! ## Design Principles
//! 1. **Deterministic Workload**: Use a fixed PRNG seed for stable comparisons.
//! 2. **Allocation Control**: Pre-build keys/values to keep setup costs off the hot path.
//! 3. **Real Stack**: Go through the public `Client` facade, not the codec.
//!
//! Usage: `bench_client [servers] [keys] [ops] [value_size] [binary] [no_block]`

use std::env;
use std::hint::black_box;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use memc_client::{Behavior, Client, ReturnCode, XorShift64};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_SERVERS: &str = "127.0.0.1:11211";
const DEFAULT_KEY_COUNT: usize = 1 << 12;
const DEFAULT_OP_COUNT: usize = 100_000;
const DEFAULT_VALUE_SIZE: usize = 128;

struct BenchConfig {
    servers: String,
    requested_keys: usize,
    key_count: usize,
    key_mask: usize,
    op_count: usize,
    value_size: usize,
    binary: bool,
    no_block: bool,
}

impl BenchConfig {
    fn from_args() -> Self {
        let mut args = env::args().skip(1);
        let servers = args.next().unwrap_or_else(|| DEFAULT_SERVERS.to_string());
        let requested_keys = parse_usize(args.next(), DEFAULT_KEY_COUNT);
        let op_count = parse_usize(args.next(), DEFAULT_OP_COUNT);
        let value_size = parse_usize(args.next(), DEFAULT_VALUE_SIZE);
        let binary = parse_flag(args.next());
        let no_block = parse_flag(args.next());

        let key_count = normalize_power_of_two(requested_keys);
        BenchConfig {
            servers,
            requested_keys,
            key_count,
            key_mask: key_count - 1,
            op_count,
            value_size,
            binary,
            no_block,
        }
    }
}

fn parse_usize(value: Option<String>, fallback: usize) -> usize {
    value.and_then(|raw| raw.parse().ok()).unwrap_or(fallback)
}

fn parse_flag(value: Option<String>) -> bool {
    matches!(value.as_deref(), Some("1" | "true" | "yes"))
}

fn normalize_power_of_two(value: usize) -> usize {
    let value = value.max(1);
    if value.is_power_of_two() {
        value
    } else {
        value.next_power_of_two()
    }
}

fn build_keys(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("bench:{i:08x}")).collect()
}

fn build_values(count: usize, size: usize, seed: u64) -> Vec<Vec<u8>> {
    let mut rng = XorShift64::new(seed);
    (0..count)
        .map(|_| (0..size).map(|_| rng.next_u64() as u8).collect())
        .collect()
}

fn report(label: &str, ops: usize, elapsed: Duration) {
    let secs = elapsed.as_secs_f64();
    let ops_per_sec = (ops as f64) / secs;
    let nanos_per_op = (secs * 1e9) / (ops as f64);
    println!(
        "{label}: {ops} ops in {secs:.3}s ({ops_per_sec:.0} ops/s, {nanos_per_op:.1} ns/op)"
    );
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = BenchConfig::from_args();
    let mut client = Client::parse(&config.servers)
        .with_context(|| format!("invalid server list {:?}", config.servers))?;
    if config.binary {
        client.behavior_enable(Behavior::BinaryProtocol)?;
    }
    if config.no_block {
        client.behavior_enable(Behavior::NoBlock)?;
    }

    let keys = build_keys(config.key_count);
    let values = build_values(config.key_count, config.value_size, 0x5A5A_5A5A_5A5A_5A5A);

    info!(servers = client.server_count(), "preloading keys");
    for (key, value) in keys.iter().zip(&values) {
        let outcome = client.set(key.as_str(), value)?;
        if !outcome.is_success() {
            bail!("preload of {key} failed: {}", outcome.code());
        }
    }
    client.flush_buffers()?;

    println!(
        "keys: requested={}, actual={}, ops={}, value_size={}, binary={}, no_block={}",
        config.requested_keys,
        config.key_count,
        config.op_count,
        config.value_size,
        config.binary,
        config.no_block
    );

    let mut rng = XorShift64::new(0x1234_5678_9ABC_DEF0);
    let mut misses = 0usize;
    let start = Instant::now();
    for _ in 0..config.op_count {
        let idx = rng.next_index(config.key_mask);
        let outcome = client.get(keys[idx].as_str())?;
        if outcome.code() == ReturnCode::NotFound {
            misses += 1;
        }
        black_box(outcome);
    }
    report("GET", config.op_count, start.elapsed());
    if misses > 0 {
        println!("GET misses: {misses}");
    }

    let mut rng = XorShift64::new(0x0FED_CBA9_8765_4321);
    let start = Instant::now();
    for _ in 0..config.op_count {
        let idx = rng.next_index(config.key_mask);
        let outcome = client.set(keys[idx].as_str(), &values[idx])?;
        black_box(outcome);
    }
    client.flush_buffers()?;
    report("SET", config.op_count, start.elapsed());

    client.close();
    Ok(())
}
