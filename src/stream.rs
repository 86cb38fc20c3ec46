//! Linear byte view over a non-resident attribute.
//!
//! A [`ClusterStream`] translates virtual offsets into cluster reads through
//! the attribute's run list. Sparse runs and bytes past the initialized size
//! read as zeros; compressed attributes are inflated one compression unit at
//! a time. Runs are resolved lazily on access, and a one-block cache keeps
//! adjacent small reads from hitting the volume repeatedly.

use bytes::Bytes;

use crate::attribute::{Attribute, AttributeBody};
use crate::error::{FsError, Result};
use crate::io::{read_exact_at, VolumeRead};
use crate::lznt1;
use crate::runs::DataRun;

/// Read session over one non-resident attribute value.
pub struct ClusterStream<'a> {
    io: &'a dyn VolumeRead,
    cluster_size: u64,
    runs: &'a [DataRun],
    /// Virtual start cluster of each run, for binary search.
    run_starts: Vec<u64>,
    valid_size: u64,
    initialized_size: u64,
    /// Compression unit in clusters; zero when uncompressed.
    compression_unit: u64,
    /// Cached block: virtual byte offset and contents. One cluster for
    /// plain streams, one inflated unit for compressed streams.
    block: Option<(u64, Vec<u8>)>,
}

impl<'a> ClusterStream<'a> {
    /// Opens a stream over a non-resident attribute.
    pub fn open(
        io: &'a dyn VolumeRead,
        cluster_size: u32,
        attribute: &'a Attribute,
    ) -> Result<Self> {
        match &attribute.body {
            AttributeBody::Resident { .. } => Err(FsError::InvalidArgument(
                "cannot open a cluster stream over a resident attribute",
            )),
            AttributeBody::NonResident {
                runs,
                valid_size,
                initialized_size,
                compression_unit,
                ..
            } => Ok(Self::from_parts(
                io,
                cluster_size,
                runs,
                *valid_size,
                *initialized_size,
                *compression_unit,
            )),
        }
    }

    /// Builds a stream from an explicit run list, used by the MFT backing
    /// store before a full attribute object exists.
    pub(crate) fn from_parts(
        io: &'a dyn VolumeRead,
        cluster_size: u32,
        runs: &'a [DataRun],
        valid_size: u64,
        initialized_size: u64,
        compression_unit: u32,
    ) -> Self {
        let mut run_starts = Vec::with_capacity(runs.len());
        let mut start = 0u64;
        for run in runs {
            run_starts.push(start);
            start += run.length;
        }
        Self {
            io,
            cluster_size: cluster_size as u64,
            runs,
            run_starts,
            valid_size,
            initialized_size,
            compression_unit: compression_unit as u64,
            block: None,
        }
    }

    /// Length of the virtual byte view.
    pub fn len(&self) -> u64 {
        self.valid_size
    }

    pub fn is_empty(&self) -> bool {
        self.valid_size == 0
    }

    /// Reads up to `buf.len()` bytes at virtual offset `offset`. Returns
    /// the count read; zero only at or past the end of the view.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= self.valid_size || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min((self.valid_size - offset) as usize);
        let mut filled = 0usize;

        while filled < want {
            let position = offset + filled as u64;
            if position >= self.initialized_size {
                buf[filled..want].fill(0);
                filled = want;
                break;
            }
            let readable = (self.initialized_size - offset).min(want as u64) as usize;
            let count = if self.compression_unit > 0 {
                self.read_unit(position, &mut buf[filled..readable])?
            } else {
                self.read_clusters(position, &mut buf[filled..readable])?
            };
            if count == 0 {
                return Err(FsError::CorruptRuns {
                    offset: position,
                    reason: "run list does not cover the attribute".to_string(),
                });
            }
            filled += count;
        }
        Ok(want)
    }

    /// Reads exactly `buf.len()` bytes at `offset` or fails.
    pub fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let count = self.read_at(offset, buf)?;
        if count != buf.len() {
            return Err(FsError::OutOfBounds {
                offset: offset + count as u64,
                max: self.valid_size,
            });
        }
        Ok(())
    }

    /// Reads the whole view, refusing sizes above `limit`.
    pub fn read_all(&mut self, limit: usize) -> Result<Vec<u8>> {
        if self.valid_size > limit as u64 {
            return Err(FsError::OutOfBounds {
                offset: self.valid_size,
                max: limit as u64,
            });
        }
        let mut data = vec![0u8; self.valid_size as usize];
        self.read_exact_at(0, &mut data)?;
        Ok(data)
    }

    /// Uncompressed path: serve from the run containing `position`.
    fn read_clusters(&mut self, position: u64, buf: &mut [u8]) -> Result<usize> {
        let (index, run_start) = match self.run_containing(position / self.cluster_size) {
            Some(found) => found,
            None => return Ok(0),
        };
        let run = self.runs[index];
        let run_offset = run_start * self.cluster_size;
        let run_size = run.length * self.cluster_size;
        let within = position - run_offset;
        let count = buf.len().min((run_size - within) as usize);

        match run.lcn {
            None => {
                buf[..count].fill(0);
                Ok(count)
            }
            Some(lcn) => {
                let physical = lcn * self.cluster_size + within;
                if count as u64 >= self.cluster_size {
                    read_exact_at(self.io, physical, &mut buf[..count])?;
                    Ok(count)
                } else {
                    // Small read: go through the one-cluster cache. The
                    // copy never crosses the cached cluster's boundary; a
                    // read spanning two clusters comes back short and the
                    // outer loop continues in the next cluster.
                    let cluster_virtual = position - (position % self.cluster_size);
                    let cluster_physical = lcn * self.cluster_size + (cluster_virtual - run_offset);
                    let cluster_len = self.cluster_size as usize;
                    let start = (position % self.cluster_size) as usize;
                    let count = count.min(cluster_len - start);
                    self.load_block(cluster_virtual, |io, block| {
                        block.resize(cluster_len, 0);
                        // A short read near the end of the image leaves the
                        // zero fill in place.
                        io.read_at(cluster_physical, block).map(|_| ())
                    })?;
                    let block = &self.block.as_ref().expect("block just loaded").1;
                    buf[..count].copy_from_slice(&block[start..start + count]);
                    Ok(count)
                }
            }
        }
    }

    /// Compressed path: serve from the inflated compression unit covering
    /// `position`.
    fn read_unit(&mut self, position: u64, buf: &mut [u8]) -> Result<usize> {
        let unit_size = self.compression_unit * self.cluster_size;
        let unit_start = position - (position % unit_size);
        self.ensure_unit(unit_start)?;
        let block = &self.block.as_ref().expect("unit just loaded").1;
        let within = (position - unit_start) as usize;
        let count = buf.len().min(block.len() - within);
        buf[..count].copy_from_slice(&block[within..within + count]);
        Ok(count)
    }

    fn ensure_unit(&mut self, unit_start: u64) -> Result<()> {
        if let Some((cached_start, _)) = &self.block {
            if *cached_start == unit_start {
                return Ok(());
            }
        }
        let unit_size = (self.compression_unit * self.cluster_size) as usize;
        let first_vcn = unit_start / self.cluster_size;

        // Gather the unit's allocated clusters in order; a sparse or
        // missing tail marks the unit as compressed.
        let mut stored = Vec::new();
        let mut allocated_clusters = 0u64;
        for vcn in first_vcn..first_vcn + self.compression_unit {
            match self.run_containing(vcn) {
                None => {}
                Some((index, run_start)) => {
                    let run = &self.runs[index];
                    if let Some(lcn) = run.lcn {
                        let within = vcn - run_start;
                        let physical = (lcn + within) * self.cluster_size;
                        let cluster_offset = stored.len();
                        stored.resize(cluster_offset + self.cluster_size as usize, 0);
                        read_exact_at(self.io, physical, &mut stored[cluster_offset..])?;
                        allocated_clusters += 1;
                    }
                }
            }
        }

        let inflated = if allocated_clusters == self.compression_unit {
            // Every cluster is backed: the unit is stored raw.
            stored
        } else if allocated_clusters == 0 {
            vec![0u8; unit_size]
        } else {
            let mut data = lznt1::decompress(&stored, unit_size)?;
            data.resize(unit_size, 0);
            data
        };
        self.block = Some((unit_start, inflated));
        Ok(())
    }

    fn load_block<F>(&mut self, block_start: u64, fill: F) -> Result<()>
    where
        F: FnOnce(&dyn VolumeRead, &mut Vec<u8>) -> Result<()>,
    {
        if let Some((cached_start, _)) = &self.block {
            if *cached_start == block_start {
                return Ok(());
            }
        }
        let mut block = Vec::new();
        fill(self.io, &mut block)?;
        self.block = Some((block_start, block));
        Ok(())
    }

    /// Finds the run containing a virtual cluster, returning its index and
    /// virtual start cluster.
    fn run_containing(&self, vcn: u64) -> Option<(usize, u64)> {
        let index = match self.run_starts.binary_search(&vcn) {
            Ok(exact) => exact,
            Err(0) => return None,
            Err(insertion) => insertion - 1,
        };
        let start = self.run_starts[index];
        if vcn < start + self.runs[index].length {
            Some((index, start))
        } else {
            None
        }
    }
}

/// Materializes an attribute value: the inline bytes when resident, the
/// streamed bytes when non-resident. `limit` bounds the allocation.
pub(crate) fn read_attribute_value(
    io: &dyn VolumeRead,
    cluster_size: u32,
    attribute: &Attribute,
    limit: usize,
) -> Result<Bytes> {
    match &attribute.body {
        AttributeBody::Resident { data } => Ok(data.clone()),
        AttributeBody::NonResident { .. } => {
            let mut stream = ClusterStream::open(io, cluster_size, attribute)?;
            Ok(Bytes::from(stream.read_all(limit)?))
        }
    }
}
