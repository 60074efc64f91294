// memc-common - Shared vocabulary for the memcached client
//
// Keys, TTLs, outcome codes, errors and behavior flags used by every layer
// of memc-client and by hosts that embed it.

pub mod behavior;
pub mod error;
pub mod outcome;
pub mod types;

// Re-export for convenience
pub use behavior::*;
pub use error::*;
pub use outcome::*;
pub use types::*;

/// TTL used by `set`/`add` when the caller gives none.
pub const DEFAULT_TTL: Ttl = Ttl(600);

/// Port assumed when a server spec omits one.
pub const DEFAULT_PORT: u16 = 11211;
