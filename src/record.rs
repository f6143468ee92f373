//! Leaf-level value storage.

use std::fmt as StdFmt;

/// An opaque byte payload associated with a key.
///
/// Records live only at leaf level and are shared as `Arc<Record>` so that
/// batch find results, orphan reinsertion, and callers can all hold the same
/// allocation without copying.
#[derive(Clone, PartialEq, Eq)]
pub struct Record {
    value: Box<[u8]>,
}

impl Record {
    /// Create a record from a byte payload.
    #[must_use]
    pub fn new(value: impl Into<Box<[u8]>>) -> Self {
        Self {
            value: value.into(),
        }
    }

    /// The stored payload.
    #[inline]
    #[must_use]
    pub fn value(&self) -> &[u8] {
        &self.value
    }
}

impl StdFmt::Debug for Record {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("Record")
            .field("len", &self.value.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_round_trip() {
        let r = Record::new(b"hello".as_slice());
        assert_eq!(r.value(), b"hello");
    }

    #[test]
    fn test_record_debug_hides_payload() {
        let r = Record::new(vec![0u8; 32]);
        assert_eq!(format!("{r:?}"), "Record { len: 32 }");
    }
}
