//! # Operation Outcomes
//!
//! Purpose: Carry the soft result of one operation (a `ReturnCode` plus the
//! item for reads) back to the caller as an ordinary value.
//!
//! A miss or a refused `add` is not an error: callers branch on
//! `Outcome::code()` and only `Err(MemcError)` means something is broken.

use bytes::Bytes;

use crate::error::ReturnCode;

/// Item returned by a read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    /// Stored value bytes.
    pub value: Bytes,
    /// Opaque client flags stored next to the value.
    pub flags: u32,
    /// CAS token, present when the server reported one.
    pub cas: Option<u64>,
}

impl Item {
    /// Creates an item without a CAS token.
    pub fn new(value: impl Into<Bytes>, flags: u32) -> Self {
        Item {
            value: value.into(),
            flags,
            cas: None,
        }
    }
}

/// Result of one client operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    code: ReturnCode,
    item: Option<Item>,
}

impl Outcome {
    /// Creates an outcome without payload.
    #[inline]
    pub fn new(code: ReturnCode) -> Self {
        Outcome { code, item: None }
    }

    /// Creates a successful read outcome.
    #[inline]
    pub fn hit(item: Item) -> Self {
        Outcome {
            code: ReturnCode::Success,
            item: Some(item),
        }
    }

    /// Returns the outcome code.
    #[inline]
    pub fn code(&self) -> ReturnCode {
        self.code
    }

    /// True when the operation completed or was accepted for delivery.
    #[inline]
    pub fn is_success(&self) -> bool {
        self.code.is_success()
    }

    /// True for a read that found nothing.
    #[inline]
    pub fn is_not_found(&self) -> bool {
        self.code == ReturnCode::NotFound
    }

    /// Returns the read item, if any.
    pub fn item(&self) -> Option<&Item> {
        self.item.as_ref()
    }

    /// Returns the read value, if any.
    pub fn value(&self) -> Option<&Bytes> {
        self.item.as_ref().map(|item| &item.value)
    }

    /// Returns the CAS token of the read item, if any.
    pub fn cas(&self) -> Option<u64> {
        self.item.as_ref().and_then(|item| item.cas)
    }

    /// Consumes the outcome and returns the value, if any.
    pub fn into_value(self) -> Option<Bytes> {
        self.item.map(|item| item.value)
    }
}

impl From<ReturnCode> for Outcome {
    fn from(code: ReturnCode) -> Self {
        Outcome::new(code)
    }
}
