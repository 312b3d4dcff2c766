use std::hash::Hasher;

/// Anything that can be fingerprinted.
///
/// The fingerprint is the xxhash64 (seed 0) of the value's canonical byte
/// encoding, rendered as 16 lowercase hex characters of the big-endian
/// digest.
pub trait TorqueHash {
    fn canonical_bytes(&self) -> Vec<u8>;

    fn hash(&self) -> String {
        let mut hasher = twox_hash::XxHash64::with_seed(0);
        hasher.write(&self.canonical_bytes());
        hex::encode(hasher.finish().to_be_bytes())
    }
}
