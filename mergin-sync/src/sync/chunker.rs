use uuid::Uuid;

pub use mergin_core::UPLOAD_CHUNK_SIZE;

/// Plans the transfer of a file of the given size: one freshly generated
/// chunk id per `chunk_size` slice, canonical hyphenated UUIDs. Zero-byte
/// files need no chunks at all; the coordinator creates them directly.
pub fn generate_chunk_ids(size_bytes: u64, chunk_size: u64) -> Vec<String> {
    if size_bytes == 0 {
        return Vec::new();
    }
    let count = size_bytes.div_ceil(chunk_size.max(1));
    (0..count).map(|_| Uuid::new_v4().to_string()).collect()
}
