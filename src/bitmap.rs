//! Cluster allocation bitmap ($Bitmap, MFT entry 6).
//!
//! One bit per cluster, little-endian words: bit k of word w covers cluster
//! 32*w + k. Contiguous allocated clusters coalesce into ranges, which the
//! caller receives; the scan itself is also traced for diagnostics.

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, trace, warn};

use crate::attribute::AttributeBody;
use crate::cancel::CancelToken;
use crate::error::{FsError, Result};
use crate::io::{VolumeGeometry, VolumeRead};
use crate::mft::Mft;
use crate::stream::ClusterStream;

/// MFT entry index of the $Bitmap metadata file.
pub(crate) const BITMAP_ENTRY_INDEX: u64 = 6;

const SCAN_CHUNK: usize = 64 * 1024;

/// A contiguous range of allocated clusters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterRange {
    pub start: u64,
    pub count: u64,
}

/// Reads $Bitmap's $DATA and coalesces the set bits into ranges.
pub(crate) fn read_bitmap(
    mft: &Mft,
    io: &dyn VolumeRead,
    geometry: &VolumeGeometry,
    cancel: &CancelToken,
) -> Result<Vec<ClusterRange>> {
    let entry = mft
        .get(io, BITMAP_ENTRY_INDEX)
        .map_err(|error| match error {
            FsError::EntryOutOfRange { .. } => FsError::MissingValue("$Bitmap entry"),
            other => other.with_context("reading $Bitmap entry"),
        })?;
    let attribute = entry
        .data_attribute()
        .ok_or(FsError::MissingValue("$Bitmap $DATA attribute"))?;

    let mut scanner = Scanner::default();
    match &attribute.body {
        AttributeBody::Resident { data } => {
            check_word_aligned(data.len() as u64)?;
            scanner.feed(data)?;
        }
        AttributeBody::NonResident { .. } => {
            let mut stream = ClusterStream::open(io, geometry.cluster_size, attribute)?;
            check_word_aligned(stream.len())?;
            let mut chunk = vec![0u8; SCAN_CHUNK];
            let mut offset = 0u64;
            while offset < stream.len() {
                cancel.check()?;
                let count = match stream.read_at(offset, &mut chunk) {
                    Ok(count) => count,
                    Err(error) => {
                        // Best-effort scan: a short or failed read ends the
                        // walk with what has been collected so far.
                        warn!(offset, %error, "bitmap scan terminated early");
                        break;
                    }
                };
                if count == 0 {
                    break;
                }
                scanner.feed(&chunk[..count])?;
                offset += count as u64;
            }
        }
    }
    let ranges = scanner.finish();
    let allocated: u64 = ranges.iter().map(|range| range.count).sum();
    debug!(ranges = ranges.len(), allocated, "bitmap scan complete");
    for range in &ranges {
        trace!(start = range.start, count = range.count, "allocated run");
    }
    Ok(ranges)
}

fn check_word_aligned(size: u64) -> Result<()> {
    if size % 4 != 0 {
        return Err(FsError::CorruptBitmap(format!(
            "$DATA size {size} is not a multiple of 4"
        )));
    }
    Ok(())
}

/// Incremental bit scanner carrying the open range across chunks.
#[derive(Default)]
struct Scanner {
    next_cluster: u64,
    open_range_start: Option<u64>,
    ranges: Vec<ClusterRange>,
}

impl Scanner {
    fn feed(&mut self, data: &[u8]) -> Result<()> {
        for word_bytes in data.chunks(4) {
            if word_bytes.len() < 4 {
                return Err(FsError::CorruptBitmap(
                    "bitmap data is not word aligned".to_string(),
                ));
            }
            let word = LittleEndian::read_u32(word_bytes);
            match word {
                0x0000_0000 => {
                    self.close_range();
                    self.next_cluster += 32;
                }
                0xFFFF_FFFF => {
                    if self.open_range_start.is_none() {
                        self.open_range_start = Some(self.next_cluster);
                    }
                    self.next_cluster += 32;
                }
                mixed => {
                    for bit in 0..32 {
                        if mixed & (1 << bit) != 0 {
                            if self.open_range_start.is_none() {
                                self.open_range_start = Some(self.next_cluster);
                            }
                        } else {
                            self.close_range();
                        }
                        self.next_cluster += 1;
                    }
                }
            }
        }
        Ok(())
    }

    fn close_range(&mut self) {
        if let Some(start) = self.open_range_start.take() {
            self.ranges.push(ClusterRange {
                start,
                count: self.next_cluster - start,
            });
        }
    }

    fn finish(mut self) -> Vec<ClusterRange> {
        self.close_range();
        self.ranges
    }
}
