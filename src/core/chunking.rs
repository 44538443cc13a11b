//! Splitting a serialized payload into transfer-unit sized writes

use std::num::NonZeroUsize;

/// Attribute payload size every BLE link supports before MTU negotiation
/// (23 byte ATT MTU minus the 3 byte write header)
pub const DEFAULT_MAX_CHUNK_SIZE: NonZeroUsize = match NonZeroUsize::new(20) {
    Some(size) => size,
    None => unreachable!(),
};

/// Split `data` into ordered, contiguous slices of at most `max_chunk_size`
/// bytes. Concatenating the slices yields `data` again.
pub fn chunks(data: &[u8], max_chunk_size: NonZeroUsize) -> std::slice::Chunks<'_, u8> {
    data.chunks(max_chunk_size.get())
}

/// Number of writes needed for `len` bytes
pub fn chunk_count(len: usize, max_chunk_size: NonZeroUsize) -> usize {
    len.div_ceil(max_chunk_size.get())
}
