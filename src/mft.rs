//! The Master File Table: a logical vector of entries behind a bounded
//! cache.
//!
//! Reading the MFT is self-referential: entry 0 describes the MFT's own
//! data runs. The backing store therefore starts as a direct reader at the
//! volume-declared MFT offset, good for exactly one record, and is replaced
//! by a run-list reader once entry 0's $DATA has been decoded. From then on
//! an entry index translates to a byte offset through those runs.

use std::collections::HashSet;
use std::sync::Arc;

use bitflags::bitflags;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::attribute::AttributeBody;
use crate::cancel::CancelToken;
use crate::entry::{parse_attribute_list, MftEntry};
use crate::error::{FsError, Result};
use crate::io::{read_exact_at, VolumeGeometry, VolumeRead};
use crate::runs::DataRun;
use crate::stream::{read_attribute_value, ClusterStream};

/// Recursion bound for $ATTRIBUTE_LIST indirection; crafted images with
/// reference loops fail instead of recursing forever.
const MAX_ATTRIBUTE_LIST_DEPTH: usize = 16;

/// Upper bound on an $ATTRIBUTE_LIST value, far above anything a real
/// volume produces.
const MAX_ATTRIBUTE_LIST_SIZE: usize = 16 * 1024 * 1024;

bitflags! {
    /// Flags accepted by `read_mft`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MftReadFlags: u32 {
        /// Treat the supplied byte range as the literal MFT blob; entry 0's
        /// data runs are not resolved and reads never leave the range.
        const MFT_ONLY = 0x01;
    }
}

/// How raw entry bytes are located on the volume.
#[derive(Debug)]
enum Backing {
    /// Fixed byte range starting at the MFT offset. Used during bootstrap
    /// and for MFT-only sessions over metadata dumps.
    Direct { offset: u64, size: u64 },
    /// Entry 0's $DATA run list.
    Runs {
        runs: Vec<DataRun>,
        valid_size: u64,
        initialized_size: u64,
    },
}

#[derive(Debug)]
pub(crate) struct Mft {
    geometry: VolumeGeometry,
    backing: Backing,
    entry_count: u64,
    cache: Mutex<LruCache<u64, Arc<MftEntry>>>,
    capacity: usize,
    cancel: CancelToken,
}

impl Mft {
    /// Reads the MFT, performing the self-referential bootstrap.
    pub(crate) fn bootstrap(
        geometry: &VolumeGeometry,
        io: &dyn VolumeRead,
        mft_offset: u64,
        mft_size: u64,
        flags: MftReadFlags,
        capacity: usize,
        cancel: CancelToken,
    ) -> Result<Mft> {
        geometry.validate()?;
        if capacity == 0 {
            return Err(FsError::InvalidArgument("cache capacity"));
        }
        let entry_size = geometry.mft_entry_size as u64;
        if mft_size < entry_size {
            return Err(FsError::OutOfBounds {
                offset: mft_size,
                max: entry_size,
            });
        }
        if mft_size > isize::MAX as u64 {
            return Err(FsError::InvalidArgument("MFT size exceeds the platform maximum"));
        }

        let mut mft = Mft {
            geometry: geometry.clone(),
            backing: Backing::Direct {
                offset: mft_offset,
                size: if flags.contains(MftReadFlags::MFT_ONLY) {
                    mft_size
                } else {
                    // The stub backing is good for exactly one record until
                    // entry 0's runs are known.
                    entry_size
                },
            },
            entry_count: if flags.contains(MftReadFlags::MFT_ONLY) {
                mft_size / entry_size
            } else {
                1
            },
            cache: Mutex::new(LruCache::unbounded()),
            capacity,
            cancel,
        };

        if flags.contains(MftReadFlags::MFT_ONLY) {
            debug!(
                entries = mft.entry_count,
                offset = mft_offset,
                "MFT-only session over supplied blob"
            );
            return Ok(mft);
        }

        // The stub backing can produce exactly one record, so entry 0 is
        // parsed here without attribute list resolution; extension records
        // are unreachable until the run-list backing is in place.
        let mut record = mft
            .read_raw(io, 0)
            .map_err(|error| error.with_context("bootstrapping from MFT entry 0"))?;
        let entry_zero = MftEntry::parse(&mut record, 0, geometry)
            .map_err(|error| error.with_context("bootstrapping from MFT entry 0"))?;
        mft.adopt_data_attribute(&entry_zero)?;

        // Huge MFTs can spill their own $DATA runs into extension records
        // through an attribute list; those are reachable now that the base
        // runs are in place, so resolve once more.
        if entry_zero.attribute_list_index().is_some() {
            let entry_zero = mft
                .load_entry(io, 0)
                .map_err(|error| error.with_context("resolving MFT entry 0 attribute list"))?;
            mft.adopt_data_attribute(&entry_zero)?;
        }
        debug!(entries = mft.entry_count, "MFT bootstrap complete");
        Ok(mft)
    }

    /// Replaces the backing store with entry 0's $DATA run list.
    fn adopt_data_attribute(&mut self, entry_zero: &MftEntry) -> Result<()> {
        let data = entry_zero
            .data_attribute()
            .ok_or(FsError::MissingValue("$MFT $DATA attribute"))?;
        match &data.body {
            AttributeBody::Resident { .. } => Err(FsError::CorruptRecord {
                offset: 0,
                reason: "resident $MFT $DATA attribute".to_string(),
            }),
            AttributeBody::NonResident {
                runs,
                valid_size,
                initialized_size,
                ..
            } => {
                self.entry_count = valid_size / self.geometry.mft_entry_size as u64;
                self.backing = Backing::Runs {
                    runs: runs.clone(),
                    valid_size: *valid_size,
                    initialized_size: *initialized_size,
                };
                Ok(())
            }
        }
    }

    pub(crate) fn number_of_entries(&self) -> u64 {
        self.entry_count
    }

    /// Reads the raw record bytes for an entry index.
    fn read_raw(&self, io: &dyn VolumeRead, index: u64) -> Result<Vec<u8>> {
        if index >= self.entry_count {
            return Err(FsError::EntryOutOfRange {
                index,
                count: self.entry_count,
            });
        }
        let entry_size = self.geometry.mft_entry_size as u64;
        let byte_offset = index * entry_size;
        let mut record = vec![0u8; entry_size as usize];

        match &self.backing {
            Backing::Direct { offset, size } => {
                if byte_offset + entry_size > *size {
                    return Err(FsError::EntryOutOfRange {
                        index,
                        count: size / entry_size,
                    });
                }
                read_exact_at(io, offset + byte_offset, &mut record).map_err(|_| {
                    FsError::CorruptRecord {
                        offset: offset + byte_offset,
                        reason: format!("short read of MFT entry {index}"),
                    }
                })?;
            }
            Backing::Runs {
                runs,
                valid_size,
                initialized_size,
            } => {
                let mut stream = ClusterStream::from_parts(
                    io,
                    self.geometry.cluster_size,
                    runs,
                    *valid_size,
                    *initialized_size,
                    0,
                );
                stream.read_exact_at(byte_offset, &mut record).map_err(|_| {
                    FsError::CorruptRecord {
                        offset: byte_offset,
                        reason: format!("short read of MFT entry {index}"),
                    }
                })?;
            }
        }
        Ok(record)
    }

    /// Reads and fully parses an entry, resolving attribute list
    /// indirection.
    fn load_entry(&self, io: &dyn VolumeRead, index: u64) -> Result<MftEntry> {
        let mut visited = HashSet::from([index]);
        self.load_entry_bounded(io, index, &mut visited, 0)
    }

    fn load_entry_bounded(
        &self,
        io: &dyn VolumeRead,
        index: u64,
        visited: &mut HashSet<u64>,
        depth: usize,
    ) -> Result<MftEntry> {
        let mut record = self.read_raw(io, index)?;
        let mut entry = MftEntry::parse(&mut record, index, &self.geometry)
            .map_err(|error| error.with_context(format!("parsing MFT entry {index}")))?;
        if let Some(list_index) = entry.attribute_list_index() {
            self.merge_attribute_list(io, &mut entry, list_index, visited, depth)?;
        }
        Ok(entry)
    }

    /// Pulls the attributes named by an $ATTRIBUTE_LIST out of their
    /// extension records and merges them into the base entry. Continuation
    /// fragments of one attribute append their runs to the base fragment.
    fn merge_attribute_list(
        &self,
        io: &dyn VolumeRead,
        entry: &mut MftEntry,
        list_index: usize,
        visited: &mut HashSet<u64>,
        depth: usize,
    ) -> Result<()> {
        if depth >= MAX_ATTRIBUTE_LIST_DEPTH {
            return Err(FsError::CyclicAttributeList { entry: entry.index });
        }
        let list_attribute = &entry.attributes()[list_index];
        let value = read_attribute_value(
            io,
            self.geometry.cluster_size,
            list_attribute,
            MAX_ATTRIBUTE_LIST_SIZE,
        )
        .map_err(|error| {
            error.with_context(format!("reading attribute list of entry {}", entry.index))
        })?;
        let records = parse_attribute_list(&value, 0)?;

        let mut referenced = Vec::new();
        for record in &records {
            let target = record.reference.entry;
            if target != entry.index && !referenced.contains(&target) {
                referenced.push(target);
            }
        }
        for target in referenced {
            self.cancel.check()?;
            if !visited.insert(target) {
                return Err(FsError::CyclicAttributeList { entry: target });
            }
            let mut extension = self
                .load_entry_bounded(io, target, visited, depth + 1)
                .map_err(|error| {
                    error.with_context(format!(
                        "reading extension entry {target} of entry {}",
                        entry.index
                    ))
                })?;
            for attribute in extension.take_attributes() {
                let listed = records.iter().any(|record| {
                    record.reference.entry == target
                        && record.kind == attribute.kind
                        && record.name.as_deref() == attribute.name.as_deref()
                });
                if !listed {
                    continue;
                }
                // A continuation fragment extends the run list of the
                // attribute's first extent.
                if let AttributeBody::NonResident {
                    first_vcn,
                    last_vcn,
                    runs,
                    ..
                } = &attribute.body
                {
                    if *first_vcn > 0 {
                        let base_position = entry.attributes().iter().position(|existing| {
                            existing.kind == attribute.kind
                                && existing.name.as_deref() == attribute.name.as_deref()
                                && !existing.is_resident()
                        });
                        if let Some(position) = base_position {
                            if let AttributeBody::NonResident {
                                runs: base_runs,
                                last_vcn: base_last_vcn,
                                ..
                            } = &mut entry.attribute_mut(position).body
                            {
                                base_runs.extend_from_slice(runs);
                                *base_last_vcn = *last_vcn;
                            }
                            continue;
                        }
                    }
                }
                entry.push_attribute(attribute);
            }
        }
        Ok(())
    }

    /// Returns a shared handle to the cached entry, reading and parsing it
    /// on a miss. I/O happens outside the cache lock.
    pub(crate) fn get(&self, io: &dyn VolumeRead, index: u64) -> Result<Arc<MftEntry>> {
        if let Some(cached) = self.cache.lock().get(&index) {
            return Ok(cached.clone());
        }
        trace!(index, "MFT cache miss");
        let parsed = Arc::new(self.load_entry(io, index)?);

        let mut cache = self.cache.lock();
        if let Some(raced) = cache.get(&index) {
            // Another reader parsed the same entry first; keep one live
            // object per index.
            return Ok(raced.clone());
        }
        while cache.len() >= self.capacity {
            let victim = cache
                .iter()
                .rev()
                .find(|(_, cached)| Arc::strong_count(cached) == 1)
                .map(|(key, _)| *key);
            match victim {
                Some(key) => {
                    cache.pop(&key);
                }
                // Every cached entry is pinned; admit the new one anyway
                // and shrink back once references drop.
                None => break,
            }
        }
        cache.push(index, parsed.clone());
        Ok(parsed)
    }

    /// Reads and parses a fresh, caller-owned copy, bypassing the cache.
    pub(crate) fn get_uncached(&self, io: &dyn VolumeRead, index: u64) -> Result<MftEntry> {
        self.load_entry(io, index)
    }

    /// True while any cached entry has an outstanding shared handle.
    pub(crate) fn has_pinned_entries(&self) -> bool {
        self.cache
            .lock()
            .iter()
            .any(|(_, cached)| Arc::strong_count(cached) > 1)
    }

    #[cfg(test)]
    fn cached_len(&self) -> usize {
        self.cache.lock().len()
    }
}
