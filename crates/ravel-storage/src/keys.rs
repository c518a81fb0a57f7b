/// `raft_log` partition: `index(8)`.
/// Big-endian so lexicographic order = numeric order.
pub fn raft_log_key(index: u64) -> [u8; 8] {
    index.to_be_bytes()
}

/// Decode the index back out of a `raft_log` key.
pub fn raft_log_index(key: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = key.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

/// `meta` partition: `label_utf8`.
pub fn meta_key(label: &str) -> Vec<u8> {
    label.as_bytes().to_vec()
}

pub const META_LAST_PURGED: &str = "last_purged";
pub const META_VOTE: &str = "vote";
