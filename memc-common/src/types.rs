//! # Key and TTL Types
//!
//! Core value types handed to the client facade.
//!
//! ## Design Principles
//!
//! 1. **Validate Once**: A `Key` can only be built through checks that match
//!    the wire limits, so every later layer can treat it as well-formed.
//!
//! 2. **Single Key Type**: Strings, byte strings and symbol-like identifiers
//!    all normalize into the same `Key`; hashing never sees the input kind.
//!
//! 3. **Protocol Agnostic**: Keys are raw bytes. Text framing constraints
//!    (no whitespace, no control bytes) are enforced for both protocols so a
//!    key that works in one mode keeps working after a protocol switch.
//!
//! ## Key Rules
//!
//! ```text
//! always        : 1..=250 bytes, no ASCII whitespace, no control bytes
//! VerifyKey set : additionally every byte must be printable ASCII (0x21..=0x7e)
//! ```

use std::borrow::Cow;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MemcError, MemcResult};

/// Maximum key length accepted by memcached (text and binary).
pub const MAX_KEY_SIZE: usize = 250;

/// Validated cache key.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key(Box<[u8]>);

impl Key {
    /// Creates a key from raw bytes.
    ///
    /// # Errors
    /// - `MemcError::BadKey` for an empty key or one containing whitespace or
    ///   control bytes.
    /// - `MemcError::KeyTooBig` when longer than `MAX_KEY_SIZE`.
    ///
    /// # Examples
    /// ```rust
    /// use memc_common::{Key, MemcError, MAX_KEY_SIZE};
    ///
    /// let key = Key::new("alpha").expect("valid key");
    /// assert_eq!(key.as_bytes(), b"alpha");
    ///
    /// let too_long = vec![b'k'; MAX_KEY_SIZE + 1];
    /// assert!(matches!(Key::new(&too_long), Err(MemcError::KeyTooBig(251))));
    /// assert!(matches!(Key::new("two words"), Err(MemcError::BadKey)));
    /// ```
    pub fn new(data: impl AsRef<[u8]>) -> MemcResult<Self> {
        let data = data.as_ref();
        if data.is_empty() {
            return Err(MemcError::BadKey);
        }
        if data.len() > MAX_KEY_SIZE {
            return Err(MemcError::KeyTooBig(data.len()));
        }
        if data
            .iter()
            .any(|&b| b.is_ascii_whitespace() || b.is_ascii_control())
        {
            return Err(MemcError::BadKey);
        }
        Ok(Key(data.into()))
    }

    /// Strict check applied when `VerifyKey` is enabled.
    ///
    /// Rejects anything outside printable ASCII, including UTF-8 multibyte
    /// sequences that the lenient rules let through.
    pub fn verify_strict(&self) -> MemcResult<()> {
        if self.0.iter().all(|b| b.is_ascii_graphic()) {
            Ok(())
        } else {
            Err(MemcError::BadKey)
        }
    }

    /// Returns the key bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns the key length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false; kept for clippy's `len_without_is_empty`.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<[u8]> for Key {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({:?})", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// Symbol-like identifier (an interned name in the embedding host).
///
/// Hashes and stores exactly like the string of the same name, so
/// `Symbol::new("foo")` and `"foo"` address the same item.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Symbol(Cow<'static, str>);

impl Symbol {
    /// Creates a symbol from its name.
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Symbol(name.into())
    }

    /// Returns the symbol name.
    pub fn name(&self) -> &str {
        &self.0
    }
}

/// Dynamically typed key argument coming from an embedding host.
///
/// Hosts with runtime-typed values describe what they received; anything that
/// is not string-representable is rejected with `InvalidArguments`.
#[derive(Debug, Clone, Copy)]
pub enum KeyInput<'a> {
    /// Host string.
    Str(&'a str),
    /// Host symbol (converted to its name).
    Symbol(&'a str),
    /// Host byte string.
    Bytes(&'a [u8]),
    /// Any other host value; carries the host's type name for the error.
    Other(&'a str),
}

/// Conversion into a validated `Key` at the facade boundary.
pub trait IntoKey {
    /// Normalizes `self` into a `Key`.
    fn into_key(self) -> MemcResult<Key>;
}

impl IntoKey for Key {
    fn into_key(self) -> MemcResult<Key> {
        Ok(self)
    }
}

impl IntoKey for &Key {
    fn into_key(self) -> MemcResult<Key> {
        Ok(self.clone())
    }
}

impl IntoKey for &str {
    fn into_key(self) -> MemcResult<Key> {
        Key::new(self)
    }
}

impl IntoKey for String {
    fn into_key(self) -> MemcResult<Key> {
        Key::new(self)
    }
}

impl IntoKey for &String {
    fn into_key(self) -> MemcResult<Key> {
        Key::new(self)
    }
}

impl IntoKey for &[u8] {
    fn into_key(self) -> MemcResult<Key> {
        Key::new(self)
    }
}

impl<const N: usize> IntoKey for &[u8; N] {
    fn into_key(self) -> MemcResult<Key> {
        Key::new(self)
    }
}

impl IntoKey for Vec<u8> {
    fn into_key(self) -> MemcResult<Key> {
        Key::new(self)
    }
}

impl IntoKey for Symbol {
    fn into_key(self) -> MemcResult<Key> {
        Key::new(self.name())
    }
}

impl IntoKey for &Symbol {
    fn into_key(self) -> MemcResult<Key> {
        Key::new(self.name())
    }
}

impl IntoKey for KeyInput<'_> {
    fn into_key(self) -> MemcResult<Key> {
        match self {
            KeyInput::Str(s) | KeyInput::Symbol(s) => Key::new(s),
            KeyInput::Bytes(b) => Key::new(b),
            KeyInput::Other(type_name) => Err(MemcError::InvalidArguments(format!(
                "memcached key must be a string or symbol, got {type_name}"
            ))),
        }
    }
}

/// Item lifetime in seconds, as understood by memcached.
///
/// `0` means "never expires". Values above 30 days are interpreted by the
/// server as an absolute unix timestamp; the client passes them through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ttl(pub u32);

impl Ttl {
    /// No expiration.
    pub const NEVER: Ttl = Ttl(0);

    /// Creates a TTL from whole seconds.
    #[inline]
    pub const fn from_secs(secs: u32) -> Self {
        Ttl(secs)
    }

    /// Returns the TTL in seconds.
    #[inline]
    pub const fn as_secs(&self) -> u32 {
        self.0
    }

    /// Returns true if the TTL means "never expires".
    #[inline]
    pub const fn is_never(&self) -> bool {
        self.0 == 0
    }
}

impl From<u32> for Ttl {
    fn from(secs: u32) -> Self {
        Ttl(secs)
    }
}

impl From<Duration> for Ttl {
    /// Saturates at `u32::MAX` seconds.
    fn from(duration: Duration) -> Self {
        Ttl(u32::try_from(duration.as_secs()).unwrap_or(u32::MAX))
    }
}
