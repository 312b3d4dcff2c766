//! The canonical byte encoding fed to the fingerprint hash.
//!
//! The exact bytes produced here are a wire contract: any change invalidates
//! every cache entry everywhere. The layout is deliberately dumb so it can be
//! reproduced in any language:
//!
//! - strings: u32 big-endian byte length, then the UTF-8 bytes
//! - sequences: u32 big-endian element count, then each element
//! - maps: u32 big-endian entry count, then `(key, value)` pairs in
//!   ascending key order
//! - integers: fixed-width big-endian
//! - bools: one byte, `0` or `1`
//! - structs: fields in declaration order, each preceded by a one-byte field
//!   tag starting at `0`
//!
//! Unknown or optional-absent fields never appear in the encoding.

pub struct CanonicalEncoder {
    buf: Vec<u8>,
}

impl CanonicalEncoder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn field(&mut self, tag: u8) -> &mut Self {
        self.buf.push(tag);
        self
    }

    pub fn string(&mut self, value: &str) -> &mut Self {
        self.buf
            .extend_from_slice(&(value.len() as u32).to_be_bytes());
        self.buf.extend_from_slice(value.as_bytes());
        self
    }

    pub fn string_list<S: AsRef<str>>(&mut self, values: &[S]) -> &mut Self {
        self.buf
            .extend_from_slice(&(values.len() as u32).to_be_bytes());
        for value in values {
            self.string(value.as_ref());
        }
        self
    }

    /// Encodes the entries in ascending key order, regardless of the order
    /// they are handed over in.
    pub fn string_map<K: AsRef<str>, V: AsRef<str>>(&mut self, entries: &[(K, V)]) -> &mut Self {
        let mut sorted: Vec<(&str, &str)> = entries
            .iter()
            .map(|(k, v)| (k.as_ref(), v.as_ref()))
            .collect();
        sorted.sort_by(|(a, _), (b, _)| a.cmp(b));

        self.buf
            .extend_from_slice(&(sorted.len() as u32).to_be_bytes());
        for (key, value) in sorted {
            self.string(key);
            self.string(value);
        }
        self
    }

    pub fn bool(&mut self, value: bool) -> &mut Self {
        self.buf.push(u8::from(value));
        self
    }

    pub fn u64(&mut self, value: u64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

impl Default for CanonicalEncoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_string_layout_is_pinned() {
        let mut encoder = CanonicalEncoder::new();
        encoder.string("hi");
        assert_eq!(encoder.finish(), vec![0, 0, 0, 2, b'h', b'i']);
    }

    #[test]
    fn test_list_layout_is_pinned() {
        let mut encoder = CanonicalEncoder::new();
        encoder.string_list(&["a", "bc"]);
        assert_eq!(
            encoder.finish(),
            vec![0, 0, 0, 2, 0, 0, 0, 1, b'a', 0, 0, 0, 2, b'b', b'c']
        );
    }

    #[test]
    fn test_map_layout_is_pinned_and_sorted() {
        let mut encoder = CanonicalEncoder::new();
        encoder.string_map(&[("b", "2"), ("a", "1")]);
        assert_eq!(
            encoder.finish(),
            vec![
                0, 0, 0, 2, // two entries
                0, 0, 0, 1, b'a', 0, 0, 0, 1, b'1', // a=1
                0, 0, 0, 1, b'b', 0, 0, 0, 1, b'2', // b=2
            ]
        );
    }

    #[test]
    fn test_map_is_insertion_order_independent() {
        // A fixed set of entries pushed through every rotation of the input
        // must produce identical bytes.
        let entries = [
            ("alpha", "1"),
            ("beta", "2"),
            ("gamma", "3"),
            ("delta", "4"),
            ("epsilon", "5"),
        ];

        let reference = {
            let mut encoder = CanonicalEncoder::new();
            encoder.string_map(&entries);
            encoder.finish()
        };

        for rotation in 1..entries.len() {
            let mut permuted = entries.to_vec();
            permuted.rotate_left(rotation);
            let mut encoder = CanonicalEncoder::new();
            encoder.string_map(&permuted);
            assert_eq!(encoder.finish(), reference, "rotation {rotation}");
        }
    }

    #[test]
    fn test_scalar_layout_is_pinned() {
        let mut encoder = CanonicalEncoder::new();
        encoder.bool(true).u64(258);
        assert_eq!(encoder.finish(), vec![1, 0, 0, 0, 0, 0, 0, 1, 2]);
    }

    #[test]
    fn test_field_tags_disambiguate_empty_fields() {
        // An empty list in field 0 followed by a string in field 1 must not
        // collide with the reverse arrangement.
        let a = {
            let mut encoder = CanonicalEncoder::new();
            encoder.field(0).string_list::<&str>(&[]).field(1).string("x");
            encoder.finish()
        };
        let b = {
            let mut encoder = CanonicalEncoder::new();
            encoder.field(0).string("x").field(1).string_list::<&str>(&[]);
            encoder.finish()
        };
        assert_ne!(a, b);
    }
}
