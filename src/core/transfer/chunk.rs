//! Chunk arithmetic, acknowledgment cadence and reassembly.

use super::error::TransferError;
use crate::core::config::{ACK_EVERY_CHUNK_BELOW, ACK_INTERVAL, CHUNK_SIZE};
use bytes::{Bytes, BytesMut};
use std::collections::BTreeMap;
use std::ops::Range;

/// `ceil(file_size / CHUNK_SIZE)`; zero for an empty file.
pub fn total_chunks(file_size: u64) -> u32 {
    file_size.div_ceil(CHUNK_SIZE as u64) as u32
}

/// Byte range of chunk `index` within a file of `file_size` bytes.
/// Only the last chunk may be shorter than `CHUNK_SIZE`.
pub fn chunk_range(file_size: u64, index: u32) -> Range<usize> {
    let start = (index as u64 * CHUNK_SIZE as u64).min(file_size) as usize;
    let end = (start as u64 + CHUNK_SIZE as u64).min(file_size) as usize;
    start..end
}

/// Receiver ack cadence: every chunk on small transfers, otherwise every
/// `ACK_INTERVAL`-th chunk, and always the final one.
pub fn should_ack(received: u32, total: u32) -> bool {
    total < ACK_EVERY_CHUNK_BELOW || received % ACK_INTERVAL == 0 || received == total
}

/// `round(done / total * 100)`, with an empty transfer counting as done.
pub fn progress_percent(done: u32, total: u32) -> u8 {
    if total == 0 {
        return 100;
    }
    let done = done.min(total) as u64;
    ((done * 100 + total as u64 / 2) / total as u64) as u8
}

/// Progress for an in-flight update. 100 is reserved for the completion event.
pub fn in_flight_progress(done: u32, total: u32) -> u8 {
    progress_percent(done, total).min(99)
}

/// Concatenate chunks `0..total` in index order.
///
/// Any gap aborts with `MissingChunk` rather than yielding a truncated file.
pub fn assemble(chunks: &BTreeMap<u32, Bytes>, total: u32) -> Result<Bytes, TransferError> {
    let size: usize = chunks.values().map(Bytes::len).sum();
    let mut out = BytesMut::with_capacity(size);
    for index in 0..total {
        let chunk = chunks
            .get(&index)
            .ok_or(TransferError::MissingChunk { index })?;
        out.extend_from_slice(chunk);
    }
    Ok(out.freeze())
}

/// Content type inferred from the file extension, `application/octet-stream`
/// when unknown.
pub fn content_type_for(file_name: &str) -> String {
    mime_guess::from_path(file_name)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_chunks_50000() {
        assert_eq!(total_chunks(50_000), 4);
        let sizes: Vec<usize> = (0..4).map(|i| chunk_range(50_000, i).len()).collect();
        assert_eq!(sizes, vec![16384, 16384, 16384, 848]);
    }

    #[test]
    fn test_total_chunks_edges() {
        assert_eq!(total_chunks(0), 0);
        assert_eq!(total_chunks(1), 1);
        assert_eq!(total_chunks(CHUNK_SIZE as u64), 1);
        assert_eq!(total_chunks(CHUNK_SIZE as u64 + 1), 2);
    }

    #[test]
    fn test_reassembly_matches_source() {
        let data: Bytes = (0..50_000u32).map(|i| (i % 251) as u8).collect::<Vec<_>>().into();
        let total = total_chunks(data.len() as u64);
        let chunks: BTreeMap<u32, Bytes> = (0..total)
            .map(|i| (i, data.slice(chunk_range(50_000, i))))
            .collect();
        let out = assemble(&chunks, total).unwrap();
        assert_eq!(out.len(), 50_000);
        assert_eq!(out, data);
    }

    #[test]
    fn test_assemble_empty_file() {
        let out = assemble(&BTreeMap::new(), 0).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_assemble_reports_gap() {
        let mut chunks = BTreeMap::new();
        chunks.insert(0, Bytes::from_static(b"a"));
        chunks.insert(2, Bytes::from_static(b"c"));
        assert_eq!(
            assemble(&chunks, 3),
            Err(TransferError::MissingChunk { index: 1 })
        );
    }

    #[test]
    fn test_ack_cadence_large_transfer() {
        let acked: Vec<u32> = (1..=120).filter(|&n| should_ack(n, 120)).collect();
        let expected: Vec<u32> = (1..=24).map(|k| k * 5).collect();
        assert_eq!(acked, expected);
    }

    #[test]
    fn test_ack_cadence_final_chunk_off_interval() {
        let acked: Vec<u32> = (1..=53).filter(|&n| should_ack(n, 53)).collect();
        assert_eq!(acked.last(), Some(&53));
        assert!(acked.contains(&50));
        assert!(!acked.contains(&51));
    }

    #[test]
    fn test_ack_cadence_small_transfer_acks_everything() {
        assert!((1..=49).all(|n| should_ack(n, 49)));
    }

    #[test]
    fn test_progress_rounding_and_cap() {
        assert_eq!(progress_percent(1, 3), 33);
        assert_eq!(progress_percent(2, 3), 67);
        assert_eq!(progress_percent(0, 0), 100);
        assert_eq!(in_flight_progress(199, 200), 99);
        assert_eq!(in_flight_progress(200, 200), 99);
    }

    #[test]
    fn test_content_type_inference() {
        assert_eq!(content_type_for("photo.JPG"), "image/jpeg");
        assert_eq!(content_type_for("clip.mp4"), "video/mp4");
        assert_eq!(content_type_for("blob"), "application/octet-stream");
    }
}
