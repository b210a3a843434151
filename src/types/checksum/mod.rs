#![forbid(unsafe_code)]

/// CRC32 of a log record, salted with the record sequence number so that a
/// stale record replayed at the wrong position fails verification.
pub fn record_crc32(seq: u64, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&seq.to_be_bytes());
    hasher.update(payload);
    hasher.finalize()
}
