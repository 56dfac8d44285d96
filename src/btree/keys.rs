//! Order-preserving key encoding for secondary indexes.
//!
//! A composite key is the concatenation of its component encodings, each
//! tagged so that nulls sort before any value and components compare with
//! their natural order under plain lexicographic byte comparison: unsigned
//! integers big-endian, signed integers with the sign bit flipped, text
//! UTF-8 with a NUL terminator (NUL forbidden inside components).

use crate::error::{GaldrError, Result};

const TAG_NULL: u8 = 0x00;
const TAG_INT: u8 = 0x01;
const TAG_UINT: u8 = 0x02;
const TAG_TEXT: u8 = 0x03;
const TAG_BYTES: u8 = 0x04;

/// One component of an index key.
#[derive(Clone, Debug, PartialEq)]
pub enum KeyComponent<'a> {
    /// Null; sorts before every value.
    Null,
    /// Signed 64-bit integer.
    Int(i64),
    /// Unsigned 64-bit integer.
    Uint(u64),
    /// UTF-8 text; must not contain NUL.
    Text(&'a str),
    /// Raw bytes; must not contain NUL.
    Bytes(&'a [u8]),
}

impl KeyComponent<'_> {
    /// Whether the component is null. Unique indexes treat null keys as
    /// always distinct.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    fn encode_into(&self, out: &mut Vec<u8>) -> Result<()> {
        match self {
            Self::Null => out.push(TAG_NULL),
            Self::Int(v) => {
                out.push(TAG_INT);
                // Flipping the sign bit makes two's-complement order match
                // unsigned byte order.
                out.extend_from_slice(&((*v as u64) ^ (1u64 << 63)).to_be_bytes());
            }
            Self::Uint(v) => {
                out.push(TAG_UINT);
                out.extend_from_slice(&v.to_be_bytes());
            }
            Self::Text(s) => {
                if s.as_bytes().contains(&0) {
                    return Err(GaldrError::InvalidArgument(
                        "index key text must not contain NUL".into(),
                    ));
                }
                out.push(TAG_TEXT);
                out.extend_from_slice(s.as_bytes());
                out.push(0);
            }
            Self::Bytes(b) => {
                if b.contains(&0) {
                    return Err(GaldrError::InvalidArgument(
                        "index key bytes must not contain NUL".into(),
                    ));
                }
                out.push(TAG_BYTES);
                out.extend_from_slice(b);
                out.push(0);
            }
        }
        Ok(())
    }
}

/// Encodes a composite key from its components.
pub fn encode_key(components: &[KeyComponent<'_>]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for component in components {
        component.encode_into(&mut out)?;
    }
    Ok(out)
}

/// Whether every component of the encoded key is null. Unique constraints
/// skip all-null keys (SQL semantics: nulls are always distinct).
pub fn is_all_null(encoded: &[u8]) -> bool {
    !encoded.is_empty() && encoded.iter().all(|&b| b == TAG_NULL)
}

/// Smallest byte string strictly greater than every key starting with
/// `prefix`, or `None` when the prefix is all `0xFF` (scan to the end).
pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut out = prefix.to_vec();
    while let Some(last) = out.last_mut() {
        if *last < 0xFF {
            *last += 1;
            return Some(out);
        }
        out.pop();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enc(components: &[KeyComponent<'_>]) -> Vec<u8> {
        encode_key(components).expect("encode")
    }

    #[test]
    fn signed_integers_sort_naturally() {
        let values = [i64::MIN, -100, -1, 0, 1, 42, i64::MAX];
        let encoded: Vec<Vec<u8>> = values.iter().map(|&v| enc(&[KeyComponent::Int(v)])).collect();
        for pair in encoded.windows(2) {
            assert!(pair[0] < pair[1], "ordering broken: {pair:?}");
        }
    }

    #[test]
    fn unsigned_integers_sort_naturally() {
        let encoded: Vec<Vec<u8>> = [0u64, 1, 255, 256, u64::MAX]
            .iter()
            .map(|&v| enc(&[KeyComponent::Uint(v)]))
            .collect();
        for pair in encoded.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn text_sorts_lexicographically_with_prefix_first() {
        let a = enc(&[KeyComponent::Text("abc")]);
        let ab = enc(&[KeyComponent::Text("abcd")]);
        let b = enc(&[KeyComponent::Text("b")]);
        assert!(a < ab);
        assert!(ab < b);
    }

    #[test]
    fn null_sorts_before_any_value() {
        let null = enc(&[KeyComponent::Null]);
        assert!(null < enc(&[KeyComponent::Int(i64::MIN)]));
        assert!(null < enc(&[KeyComponent::Text("")]));
        assert!(null < enc(&[KeyComponent::Uint(0)]));
    }

    #[test]
    fn composite_orders_by_leftmost_component_first() {
        let k = |a: i64, b: &'static str| enc(&[KeyComponent::Int(a), KeyComponent::Text(b)]);
        assert!(k(1, "zzz") < k(2, "aaa"));
        assert!(k(2, "aaa") < k(2, "aab"));
        // A bound prefix on the first component brackets all extensions.
        let prefix = enc(&[KeyComponent::Int(2)]);
        assert!(k(2, "aaa").starts_with(&prefix));
        assert!(!k(3, "aaa").starts_with(&prefix));
    }

    #[test]
    fn nul_in_text_is_rejected() {
        assert!(encode_key(&[KeyComponent::Text("a\0b")]).is_err());
    }

    #[test]
    fn all_null_detection() {
        assert!(is_all_null(&enc(&[KeyComponent::Null])));
        assert!(is_all_null(&enc(&[KeyComponent::Null, KeyComponent::Null])));
        assert!(!is_all_null(&enc(&[KeyComponent::Null, KeyComponent::Int(0)])));
    }

    #[test]
    fn prefix_successor_brackets_the_prefix() {
        let prefix = enc(&[KeyComponent::Text("user")]);
        let upper = prefix_successor(&prefix).expect("successor");
        assert!(prefix < upper);
        let extended = enc(&[KeyComponent::Text("user"), KeyComponent::Int(7)]);
        assert!(extended > prefix && extended < upper);

        assert_eq!(prefix_successor(&[0xFF, 0xFF]), None);
        assert_eq!(prefix_successor(&[0x01, 0xFF]), Some(vec![0x02]));
    }
}
