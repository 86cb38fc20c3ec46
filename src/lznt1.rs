//! LZNT1 decompression for compressed attribute streams.
//!
//! A compression unit inflates from a sequence of chunks. Each chunk starts
//! with a 16-bit header: bits 0..12 hold the stored chunk size minus one,
//! bit 15 marks a compressed chunk. Compressed chunks interleave flag bytes
//! with tokens: a clear flag bit is a literal byte, a set bit a 16-bit
//! back-reference whose displacement/length split depends on how much of the
//! chunk has been produced so far.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{FsError, Result};

const CHUNK_SIZE_MASK: u16 = 0x0FFF;
const CHUNK_COMPRESSED: u16 = 0x8000;

/// Inflates `src` to at most `expected_size` bytes.
///
/// The caller zero-pads the result up to the compression unit size; a chunk
/// stream that would produce more than `expected_size` bytes is corrupt.
pub(crate) fn decompress(src: &[u8], expected_size: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(expected_size);
    let mut position = 0usize;

    while position + 2 <= src.len() && out.len() < expected_size {
        let header = LittleEndian::read_u16(&src[position..position + 2]);
        position += 2;
        if header == 0 {
            break;
        }
        let stored_size = (header & CHUNK_SIZE_MASK) as usize + 1;
        if position + stored_size > src.len() {
            return Err(corrupt(position, "chunk extends past the compressed data"));
        }
        let chunk = &src[position..position + stored_size];
        position += stored_size;

        if header & CHUNK_COMPRESSED == 0 {
            if out.len() + stored_size > expected_size {
                return Err(corrupt(position, "chunk overflows the compression unit"));
            }
            out.extend_from_slice(chunk);
        } else {
            inflate_chunk(chunk, &mut out, expected_size, position)?;
        }
    }
    Ok(out)
}

fn inflate_chunk(
    chunk: &[u8],
    out: &mut Vec<u8>,
    expected_size: usize,
    diagnostic_offset: usize,
) -> Result<()> {
    let chunk_start = out.len();
    let mut position = 0usize;

    while position < chunk.len() {
        let flags = chunk[position];
        position += 1;
        for bit in 0..8 {
            if position >= chunk.len() {
                return Ok(());
            }
            if flags & (1 << bit) == 0 {
                if out.len() >= expected_size {
                    return Err(corrupt(diagnostic_offset, "literal overflows the unit"));
                }
                out.push(chunk[position]);
                position += 1;
            } else {
                if position + 2 > chunk.len() {
                    return Err(corrupt(diagnostic_offset, "truncated copy token"));
                }
                let token = LittleEndian::read_u16(&chunk[position..position + 2]);
                position += 2;

                let produced = out.len() - chunk_start;
                if produced == 0 {
                    return Err(corrupt(diagnostic_offset, "copy token before any output"));
                }
                // The token split widens the displacement field as the
                // window grows: 4 displacement bits for the first 16 bytes,
                // up to 12 once the chunk output passes 2048 bytes.
                let mut displacement_bits = 4u32;
                let mut window = produced - 1;
                while window >= 0x10 {
                    displacement_bits += 1;
                    window >>= 1;
                }
                let length_mask = 0xFFFFu16 >> displacement_bits;
                let displacement = (token >> (16 - displacement_bits)) as usize + 1;
                let length = (token & length_mask) as usize + 3;

                if displacement > produced {
                    return Err(corrupt(
                        diagnostic_offset,
                        "copy displacement reaches before the chunk",
                    ));
                }
                if out.len() + length > expected_size {
                    return Err(corrupt(diagnostic_offset, "copy overflows the unit"));
                }
                // Copies may overlap their own output.
                for _ in 0..length {
                    let byte = out[out.len() - displacement];
                    out.push(byte);
                }
            }
        }
    }
    Ok(())
}

fn corrupt(offset: usize, reason: &str) -> FsError {
    FsError::CorruptRecord {
        offset: offset as u64,
        reason: format!("LZNT1: {reason}"),
    }
}
