//! Attribute header decoding.
//!
//! An MFT record is a sequence of attributes. Each starts with a 16-byte
//! common header followed by either a resident form (the value is inline) or
//! a non-resident form (the value lives in clusters described by a run
//! list). The runtime dispatches on a handful of attribute kinds; everything
//! else is carried through opaquely with its raw payload.

use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;

use crate::error::{FsError, Result};
use crate::runs::{self, DataRun};

/// Attribute type codes the runtime knows by name. Unlisted codes pass
/// through as [`AttributeKind::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeKind {
    StandardInformation,
    AttributeList,
    FileName,
    ObjectId,
    SecurityDescriptor,
    VolumeName,
    VolumeInformation,
    Data,
    IndexRoot,
    IndexAllocation,
    Bitmap,
    ReparsePoint,
    LoggedUtilityStream,
    Unknown(u32),
}

impl AttributeKind {
    pub fn from_code(code: u32) -> Self {
        match code {
            0x10 => AttributeKind::StandardInformation,
            0x20 => AttributeKind::AttributeList,
            0x30 => AttributeKind::FileName,
            0x40 => AttributeKind::ObjectId,
            0x50 => AttributeKind::SecurityDescriptor,
            0x60 => AttributeKind::VolumeName,
            0x70 => AttributeKind::VolumeInformation,
            0x80 => AttributeKind::Data,
            0x90 => AttributeKind::IndexRoot,
            0xA0 => AttributeKind::IndexAllocation,
            0xB0 => AttributeKind::Bitmap,
            0xC0 => AttributeKind::ReparsePoint,
            0x100 => AttributeKind::LoggedUtilityStream,
            other => AttributeKind::Unknown(other),
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            AttributeKind::StandardInformation => 0x10,
            AttributeKind::AttributeList => 0x20,
            AttributeKind::FileName => 0x30,
            AttributeKind::ObjectId => 0x40,
            AttributeKind::SecurityDescriptor => 0x50,
            AttributeKind::VolumeName => 0x60,
            AttributeKind::VolumeInformation => 0x70,
            AttributeKind::Data => 0x80,
            AttributeKind::IndexRoot => 0x90,
            AttributeKind::IndexAllocation => 0xA0,
            AttributeKind::Bitmap => 0xB0,
            AttributeKind::ReparsePoint => 0xC0,
            AttributeKind::LoggedUtilityStream => 0x100,
            AttributeKind::Unknown(code) => *code,
        }
    }
}

/// Marks the end of the attribute sequence in a record.
pub(crate) const END_OF_ATTRIBUTES: u32 = 0xFFFF_FFFF;

bitflags! {
    /// Attribute data flags from the common header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AttributeFlags: u16 {
        const COMPRESSED = 0x0001;
        const ENCRYPTED = 0x4000;
        const SPARSE = 0x8000;
    }
}

/// Resident or non-resident attribute value.
#[derive(Debug, Clone)]
pub enum AttributeBody {
    Resident {
        data: Bytes,
    },
    NonResident {
        runs: Vec<DataRun>,
        first_vcn: u64,
        last_vcn: u64,
        allocated_size: u64,
        valid_size: u64,
        initialized_size: u64,
        /// Compression unit in clusters; zero when uncompressed.
        compression_unit: u32,
        total_allocated_size: Option<u64>,
    },
}

/// One decoded attribute of an MFT entry.
#[derive(Debug, Clone)]
pub struct Attribute {
    pub kind: AttributeKind,
    pub name: Option<String>,
    pub flags: AttributeFlags,
    pub id: u16,
    pub body: AttributeBody,
}

impl Attribute {
    pub fn is_resident(&self) -> bool {
        matches!(self.body, AttributeBody::Resident { .. })
    }

    pub fn is_compressed(&self) -> bool {
        self.flags.contains(AttributeFlags::COMPRESSED)
    }

    pub fn is_sparse(&self) -> bool {
        self.flags.contains(AttributeFlags::SPARSE)
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags.contains(AttributeFlags::ENCRYPTED)
    }

    /// Inline value of a resident attribute.
    pub fn resident_data(&self) -> Option<&Bytes> {
        match &self.body {
            AttributeBody::Resident { data } => Some(data),
            AttributeBody::NonResident { .. } => None,
        }
    }

    /// Run list of a non-resident attribute.
    pub fn data_runs(&self) -> Option<&[DataRun]> {
        match &self.body {
            AttributeBody::Resident { .. } => None,
            AttributeBody::NonResident { runs, .. } => Some(runs),
        }
    }

    /// Logical value size: inline length when resident, valid size when
    /// non-resident.
    pub fn valid_size(&self) -> u64 {
        match &self.body {
            AttributeBody::Resident { data } => data.len() as u64,
            AttributeBody::NonResident { valid_size, .. } => *valid_size,
        }
    }

    pub fn matches(&self, kind: AttributeKind, name: Option<&str>) -> bool {
        self.kind == kind && self.name.as_deref() == name
    }
}

/// Parses the attribute at `offset` inside a record.
///
/// Returns `None` at the end-of-attributes terminator, otherwise the
/// attribute and its on-disk length. `record_offset` is the volume offset of
/// the record, used only for diagnostics.
pub(crate) fn parse_at(
    record: &[u8],
    offset: usize,
    cluster_size: u32,
    record_offset: u64,
) -> Result<Option<(Attribute, usize)>> {
    let diagnostic = record_offset + offset as u64;
    let remaining = &record[offset..];
    if remaining.len() < 4 {
        return Err(FsError::TruncatedAttribute { offset: diagnostic });
    }
    let type_code = LittleEndian::read_u32(&remaining[0..4]);
    if type_code == END_OF_ATTRIBUTES {
        return Ok(None);
    }
    if type_code == 0 {
        return Err(FsError::UnknownAttributeKind {
            kind: 0,
            offset: diagnostic,
        });
    }
    if remaining.len() < 16 {
        return Err(FsError::TruncatedAttribute { offset: diagnostic });
    }

    let length = LittleEndian::read_u32(&remaining[4..8]) as usize;
    if length < 24 || length % 8 != 0 || length > remaining.len() {
        return Err(FsError::TruncatedAttribute { offset: diagnostic });
    }
    let attribute = &remaining[..length];

    let non_resident = attribute[8] != 0;
    let name_length = attribute[9] as usize;
    let name_offset = LittleEndian::read_u16(&attribute[10..12]) as usize;
    let flags = AttributeFlags::from_bits_truncate(LittleEndian::read_u16(&attribute[12..14]));
    let id = LittleEndian::read_u16(&attribute[14..16]);

    let name = if name_length == 0 {
        None
    } else {
        let name_end = name_offset + 2 * name_length;
        if name_end > length {
            return Err(FsError::TruncatedAttribute { offset: diagnostic });
        }
        let units: Vec<u16> = attribute[name_offset..name_end]
            .chunks_exact(2)
            .map(LittleEndian::read_u16)
            .collect();
        Some(String::from_utf16_lossy(&units))
    };

    let body = if non_resident {
        parse_non_resident(attribute, flags, cluster_size, diagnostic)?
    } else {
        parse_resident(attribute, diagnostic)?
    };

    Ok(Some((
        Attribute {
            kind: AttributeKind::from_code(type_code),
            name,
            flags,
            id,
            body,
        },
        length,
    )))
}

fn parse_resident(attribute: &[u8], diagnostic: u64) -> Result<AttributeBody> {
    let value_length = LittleEndian::read_u32(&attribute[16..20]) as usize;
    let value_offset = LittleEndian::read_u16(&attribute[20..22]) as usize;
    if value_length == 0 {
        return Ok(AttributeBody::Resident { data: Bytes::new() });
    }
    let value_end = value_offset
        .checked_add(value_length)
        .ok_or(FsError::TruncatedAttribute { offset: diagnostic })?;
    if value_offset < 24 || value_end > attribute.len() {
        return Err(FsError::TruncatedAttribute { offset: diagnostic });
    }
    Ok(AttributeBody::Resident {
        data: Bytes::copy_from_slice(&attribute[value_offset..value_end]),
    })
}

fn parse_non_resident(
    attribute: &[u8],
    flags: AttributeFlags,
    cluster_size: u32,
    diagnostic: u64,
) -> Result<AttributeBody> {
    if attribute.len() < 64 {
        return Err(FsError::TruncatedAttribute { offset: diagnostic });
    }
    let first_vcn = LittleEndian::read_u64(&attribute[16..24]);
    let last_vcn = LittleEndian::read_u64(&attribute[24..32]);
    let runs_offset = LittleEndian::read_u16(&attribute[32..34]) as usize;
    let compression_exponent = LittleEndian::read_u16(&attribute[34..36]);
    let allocated_size = LittleEndian::read_u64(&attribute[40..48]);
    let valid_size = LittleEndian::read_u64(&attribute[48..56]);
    let initialized_size = LittleEndian::read_u64(&attribute[56..64]);

    let compression_unit = if compression_exponent == 0 {
        0
    } else {
        if compression_exponent > 31 {
            return Err(FsError::CorruptRecord {
                offset: diagnostic,
                reason: format!("compression unit exponent {compression_exponent} out of bounds"),
            });
        }
        1u32 << compression_exponent
    };

    let total_allocated_size = if flags.contains(AttributeFlags::COMPRESSED) {
        if attribute.len() < 72 {
            return Err(FsError::TruncatedAttribute { offset: diagnostic });
        }
        Some(LittleEndian::read_u64(&attribute[64..72]))
    } else {
        None
    };

    if runs_offset < 64 || runs_offset >= attribute.len() {
        return Err(FsError::TruncatedAttribute { offset: diagnostic });
    }
    let (data_runs, _) = runs::decode_runs(&attribute[runs_offset..], diagnostic + runs_offset as u64)?;

    if valid_size > allocated_size || initialized_size > valid_size {
        return Err(FsError::CorruptRecord {
            offset: diagnostic,
            reason: format!(
                "impossible sizes: allocated {allocated_size}, valid {valid_size}, initialized {initialized_size}"
            ),
        });
    }
    // The size fields are only authoritative in the first extent, and even
    // there the run list covers just this extent's VCN span: an attribute
    // fragmented across $ATTRIBUTE_LIST extension records carries the full
    // allocation in its base header while each extent lists its own runs.
    let covered_clusters = runs::total_clusters(&data_runs);
    if first_vcn == 0 {
        let covered = covered_clusters * cluster_size as u64;
        if covered >= allocated_size + cluster_size as u64 {
            return Err(FsError::CorruptRuns {
                offset: diagnostic,
                reason: format!(
                    "run list covers {covered} bytes of an allocation of {allocated_size}"
                ),
            });
        }
    }
    if !data_runs.is_empty() && last_vcn != u64::MAX && last_vcn >= first_vcn {
        let extent_clusters = last_vcn - first_vcn + 1;
        if covered_clusters != extent_clusters {
            return Err(FsError::CorruptRuns {
                offset: diagnostic,
                reason: format!(
                    "run list covers {covered_clusters} clusters of an extent of {extent_clusters}"
                ),
            });
        }
    }

    Ok(AttributeBody::NonResident {
        runs: data_runs,
        first_vcn,
        last_vcn,
        allocated_size,
        valid_size,
        initialized_size,
        compression_unit,
        total_allocated_size,
    })
}


#[cfg(test)]
mod tests {
    use super::test_support::{non_resident, resident, NonResidentSpec};
    use super::*;

    #[test]
    fn test_parse_resident_attribute() {
        let bytes = resident(0x80, None, b"hello world");
        let (attribute, length) = parse_at(&bytes, 0, 4096, 0).unwrap().unwrap();
        assert_eq!(length, bytes.len());
        assert_eq!(attribute.kind, AttributeKind::Data);
        assert!(attribute.name.is_none());
        assert!(attribute.is_resident());
        assert_eq!(attribute.resident_data().unwrap().as_ref(), b"hello world");
        assert_eq!(attribute.valid_size(), 11);
    }

    #[test]
    fn test_parse_named_attribute() {
        let bytes = resident(0x80, Some("$SDS"), &[1, 2, 3]);
        let (attribute, _) = parse_at(&bytes, 0, 4096, 0).unwrap().unwrap();
        assert_eq!(attribute.name.as_deref(), Some("$SDS"));
    }

    #[test]
    fn test_parse_non_resident_attribute() {
        // 4 clusters at LCN 64; cluster size 4096 -> 16384 bytes allocated.
        let bytes = non_resident(&NonResidentSpec {
            kind: 0x80,
            name: None,
            flags: 0,
            run_bytes: &[0x11, 0x04, 0x40, 0x00],
            first_vcn: 0,
            last_vcn: 3,
            allocated_size: 16384,
            valid_size: 15000,
            initialized_size: 12000,
            compression_exponent: 0,
        });
        let (attribute, _) = parse_at(&bytes, 0, 4096, 0).unwrap().unwrap();
        match &attribute.body {
            AttributeBody::NonResident {
                runs,
                allocated_size,
                valid_size,
                initialized_size,
                compression_unit,
                ..
            } => {
                assert_eq!(runs.len(), 1);
                assert_eq!(runs[0].lcn, Some(64));
                assert_eq!(*allocated_size, 16384);
                assert_eq!(*valid_size, 15000);
                assert_eq!(*initialized_size, 12000);
                assert_eq!(*compression_unit, 0);
            }
            AttributeBody::Resident { .. } => panic!("expected non-resident"),
        }
    }

    #[test]
    fn test_parse_compressed_attribute_unit_size() {
        let bytes = non_resident(&NonResidentSpec {
            kind: 0x80,
            name: None,
            flags: 0x0001,
            run_bytes: &[0x11, 0x10, 0x40, 0x00],
            first_vcn: 0,
            last_vcn: 15,
            allocated_size: 16 * 4096,
            valid_size: 16 * 4096,
            initialized_size: 16 * 4096,
            compression_exponent: 4,
        });
        let (attribute, _) = parse_at(&bytes, 0, 4096, 0).unwrap().unwrap();
        assert!(attribute.is_compressed());
        match attribute.body {
            AttributeBody::NonResident {
                compression_unit, ..
            } => assert_eq!(compression_unit, 16),
            AttributeBody::Resident { .. } => panic!("expected non-resident"),
        }
    }

    #[test]
    fn test_terminator_yields_none() {
        let bytes = 0xFFFF_FFFFu32.to_le_bytes();
        assert!(parse_at(&bytes, 0, 4096, 0).unwrap().is_none());
    }

    #[test]
    fn test_zero_type_code_is_rejected() {
        let bytes = [0u8; 32];
        assert!(matches!(
            parse_at(&bytes, 0, 4096, 0),
            Err(FsError::UnknownAttributeKind { kind: 0, .. })
        ));
    }

    #[test]
    fn test_truncated_header_is_rejected() {
        let mut bytes = resident(0x80, None, b"data");
        bytes.truncate(20);
        assert!(matches!(
            parse_at(&bytes, 0, 4096, 0),
            Err(FsError::TruncatedAttribute { .. })
        ));
    }

    #[test]
    fn test_run_coverage_mismatch_is_rejected() {
        // Run list covers 2 clusters but the header claims 4.
        let bytes = non_resident(&NonResidentSpec {
            kind: 0x80,
            name: None,
            flags: 0,
            run_bytes: &[0x11, 0x02, 0x40, 0x00],
            first_vcn: 0,
            last_vcn: 3,
            allocated_size: 16384,
            valid_size: 16384,
            initialized_size: 16384,
            compression_exponent: 0,
        });
        assert!(matches!(
            parse_at(&bytes, 0, 4096, 0),
            Err(FsError::CorruptRuns { .. })
        ));
    }

    #[test]
    fn test_first_extent_of_fragmented_attribute_is_accepted() {
        // Base extent of an attribute continued in an extension record:
        // the header carries the full allocation while the runs only cover
        // VCNs 0..=1 of the first fragment.
        let bytes = non_resident(&NonResidentSpec {
            kind: 0x80,
            name: None,
            flags: 0,
            run_bytes: &[0x11, 0x02, 0x40, 0x00],
            first_vcn: 0,
            last_vcn: 1,
            allocated_size: 4 * 4096,
            valid_size: 4 * 4096,
            initialized_size: 4 * 4096,
            compression_exponent: 0,
        });
        let (attribute, _) = parse_at(&bytes, 0, 4096, 0).unwrap().unwrap();
        assert_eq!(attribute.data_runs().unwrap().len(), 1);
    }

    #[test]
    fn test_run_overflow_of_allocation_is_rejected() {
        // Runs account for 4 clusters against an allocation of 2.
        let bytes = non_resident(&NonResidentSpec {
            kind: 0x80,
            name: None,
            flags: 0,
            run_bytes: &[0x11, 0x04, 0x40, 0x00],
            first_vcn: 0,
            last_vcn: 3,
            allocated_size: 8192,
            valid_size: 8192,
            initialized_size: 8192,
            compression_exponent: 0,
        });
        assert!(matches!(
            parse_at(&bytes, 0, 4096, 0),
            Err(FsError::CorruptRuns { .. })
        ));
    }

    #[test]
    fn test_impossible_sizes_are_rejected() {
        let bytes = non_resident(&NonResidentSpec {
            kind: 0x80,
            name: None,
            flags: 0,
            run_bytes: &[0x11, 0x04, 0x40, 0x00],
            first_vcn: 0,
            last_vcn: 3,
            allocated_size: 16384,
            valid_size: 20000,
            initialized_size: 100,
            compression_exponent: 0,
        });
        assert!(matches!(
            parse_at(&bytes, 0, 4096, 0),
            Err(FsError::CorruptRecord { .. })
        ));
    }

    #[test]
    fn test_unknown_kind_passes_through() {
        let bytes = resident(0xE0, None, &[0xAB; 8]);
        let (attribute, _) = parse_at(&bytes, 0, 4096, 0).unwrap().unwrap();
        assert_eq!(attribute.kind, AttributeKind::Unknown(0xE0));
        assert_eq!(attribute.resident_data().unwrap().len(), 8);
    }
}
