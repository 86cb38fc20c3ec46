//! MFT entry (FILE record) parsing.
//!
//! Each entry is a fixed-size record protected by fixups. After the header
//! comes a packed sequence of attributes terminated by 0xFFFFFFFF. Entries
//! whose attributes spilled into other records carry an $ATTRIBUTE_LIST;
//! resolving those references requires reading other entries and happens in
//! the MFT layer, which merges the extension attributes back into the base
//! entry produced here.

use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};

use crate::attribute::{self, Attribute, AttributeKind};
use crate::error::{FsError, Result};
use crate::fixup::apply_fixups;
use crate::io::VolumeGeometry;

/// "FILE"
const ENTRY_SIGNATURE: [u8; 4] = [0x46, 0x49, 0x4C, 0x45];
/// "BAAD": the signature chkdsk leaves on records with a failed fixup.
const BAD_ENTRY_SIGNATURE: [u8; 4] = [0x42, 0x41, 0x41, 0x44];

const ENTRY_HEADER_SIZE: usize = 48;

bitflags! {
    /// MFT record header flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u16 {
        const IN_USE = 0x0001;
        const DIRECTORY = 0x0002;
    }
}

/// A 64-bit file reference: 48-bit entry index plus 16-bit sequence value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileReference {
    pub entry: u64,
    pub sequence: u16,
}

impl FileReference {
    pub fn from_raw(raw: u64) -> Self {
        Self {
            entry: raw & 0x0000_FFFF_FFFF_FFFF,
            sequence: (raw >> 48) as u16,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.entry == 0 && self.sequence == 0
    }
}

/// One parsed MFT entry.
#[derive(Debug, Clone)]
pub struct MftEntry {
    pub index: u64,
    pub sequence: u16,
    pub hard_link_count: u16,
    pub flags: EntryFlags,
    pub used_size: u32,
    pub allocated_size: u32,
    pub base_reference: FileReference,
    pub log_sequence_number: u64,
    attributes: Vec<Attribute>,
    file_name_index: Option<usize>,
    data_index: Option<usize>,
}

impl MftEntry {
    pub fn is_in_use(&self) -> bool {
        self.flags.contains(EntryFlags::IN_USE)
    }

    pub fn is_directory(&self) -> bool {
        self.flags.contains(EntryFlags::DIRECTORY)
    }

    /// Base records have a zero base-record reference; extension records
    /// point back at the entry that owns their attributes.
    pub fn is_base_record(&self) -> bool {
        self.base_reference.is_zero()
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    /// The primary $FILE_NAME attribute, preferring the Win32 namespace
    /// when an entry carries several names.
    pub fn file_name_attribute(&self) -> Option<&Attribute> {
        self.file_name_index.map(|index| &self.attributes[index])
    }

    /// The unnamed $DATA attribute, if any.
    pub fn data_attribute(&self) -> Option<&Attribute> {
        self.data_index.map(|index| &self.attributes[index])
    }

    pub fn find_attribute(&self, kind: AttributeKind, name: Option<&str>) -> Option<&Attribute> {
        self.attributes
            .iter()
            .find(|attribute| attribute.matches(kind, name))
    }

    /// Decodes the file name string from the primary $FILE_NAME attribute.
    ///
    /// Full $FILE_NAME decoding lives upstream; the name itself is needed
    /// here to identify metadata files such as "$Secure".
    pub fn file_name(&self) -> Option<String> {
        let attribute = self.file_name_attribute()?;
        let data = attribute.resident_data()?;
        file_name_from_payload(data)
    }

    /// Parses a fixed-size record. The buffer is mutated in place by the
    /// fixup pass before any field is interpreted.
    pub(crate) fn parse(record: &mut [u8], index: u64, geometry: &VolumeGeometry) -> Result<Self> {
        let record_offset = index * geometry.mft_entry_size as u64;
        if record.len() != geometry.mft_entry_size as usize {
            return Err(FsError::CorruptRecord {
                offset: record_offset,
                reason: format!("record buffer of {} bytes", record.len()),
            });
        }
        if record[0..4] == BAD_ENTRY_SIGNATURE {
            return Err(FsError::CorruptRecord {
                offset: record_offset,
                reason: "record is marked bad".to_string(),
            });
        }
        if record[0..4] != ENTRY_SIGNATURE {
            return Err(FsError::CorruptRecord {
                offset: record_offset,
                reason: "missing FILE signature".to_string(),
            });
        }
        let usa_offset = LittleEndian::read_u16(&record[4..6]);
        let usa_count = LittleEndian::read_u16(&record[6..8]);
        apply_fixups(record, usa_offset, usa_count, geometry.bytes_per_sector)?;

        let log_sequence_number = LittleEndian::read_u64(&record[8..16]);
        let sequence = LittleEndian::read_u16(&record[16..18]);
        let hard_link_count = LittleEndian::read_u16(&record[18..20]);
        let first_attribute_offset = LittleEndian::read_u16(&record[20..22]) as usize;
        let flags = EntryFlags::from_bits_truncate(LittleEndian::read_u16(&record[22..24]));
        let used_size = LittleEndian::read_u32(&record[24..28]);
        let allocated_size = LittleEndian::read_u32(&record[28..32]);
        let base_reference = FileReference::from_raw(LittleEndian::read_u64(&record[32..40]));

        if used_size as usize > record.len() {
            return Err(FsError::CorruptRecord {
                offset: record_offset,
                reason: format!("used size {used_size} exceeds the entry size"),
            });
        }
        if first_attribute_offset < ENTRY_HEADER_SIZE
            || first_attribute_offset >= used_size as usize
        {
            return Err(FsError::CorruptRecord {
                offset: record_offset,
                reason: format!("first attribute offset {first_attribute_offset} out of bounds"),
            });
        }
        // NTFS 3.1 records the entry's own number; older record layouts put
        // the update sequence array where the field would be.
        if usa_offset as usize >= ENTRY_HEADER_SIZE {
            let record_number = LittleEndian::read_u32(&record[44..48]);
            if record_number as u64 != index & 0xFFFF_FFFF {
                return Err(FsError::CorruptRecord {
                    offset: record_offset,
                    reason: format!("record number {record_number} does not match index {index}"),
                });
            }
        }

        let mut entry = MftEntry {
            index,
            sequence,
            hard_link_count,
            flags,
            used_size,
            allocated_size,
            base_reference,
            log_sequence_number,
            attributes: Vec::new(),
            file_name_index: None,
            data_index: None,
        };

        let used = &record[..used_size as usize];
        let mut offset = first_attribute_offset;
        while offset + 4 <= used.len() {
            match attribute::parse_at(used, offset, geometry.cluster_size, record_offset)? {
                None => break,
                Some((parsed, length)) => {
                    entry.push_attribute(parsed);
                    offset += length;
                }
            }
        }
        Ok(entry)
    }

    /// Appends an attribute, keeping the primary $FILE_NAME and unnamed
    /// $DATA shortcuts current. Also used when merging attribute list
    /// extensions.
    pub(crate) fn push_attribute(&mut self, attribute: Attribute) {
        let index = self.attributes.len();
        match attribute.kind {
            AttributeKind::FileName => {
                let rank = attribute
                    .resident_data()
                    .and_then(|data| data.get(65).copied())
                    .map(namespace_rank)
                    .unwrap_or(u8::MAX);
                let current_rank = self
                    .file_name_index
                    .map(|existing| {
                        self.attributes[existing]
                            .resident_data()
                            .and_then(|data| data.get(65).copied())
                            .map(namespace_rank)
                            .unwrap_or(u8::MAX)
                    })
                    .unwrap_or(u8::MAX);
                if self.file_name_index.is_none() || rank < current_rank {
                    self.file_name_index = Some(index);
                }
            }
            AttributeKind::Data => {
                if attribute.name.is_none() && self.data_index.is_none() {
                    self.data_index = Some(index);
                }
            }
            _ => {}
        }
        self.attributes.push(attribute);
    }

    /// Index of the $ATTRIBUTE_LIST attribute, if the entry has one.
    pub(crate) fn attribute_list_index(&self) -> Option<usize> {
        self.attributes
            .iter()
            .position(|attribute| attribute.kind == AttributeKind::AttributeList)
    }

    pub(crate) fn attribute_mut(&mut self, index: usize) -> &mut Attribute {
        &mut self.attributes[index]
    }

    /// Takes the attribute vector out of an extension record during
    /// attribute list merging. The record is discarded afterwards.
    pub(crate) fn take_attributes(&mut self) -> Vec<Attribute> {
        self.file_name_index = None;
        self.data_index = None;
        std::mem::take(&mut self.attributes)
    }
}

/// Namespace preference for the primary file name: Win32 first, then the
/// combined Win32/DOS name, then POSIX, then DOS-only.
fn namespace_rank(namespace: u8) -> u8 {
    match namespace {
        1 => 0,
        3 => 1,
        0 => 2,
        2 => 3,
        _ => 4,
    }
}

/// Extracts the name string from a $FILE_NAME payload (length byte at
/// offset 64, UTF-16LE characters from offset 66).
pub(crate) fn file_name_from_payload(data: &[u8]) -> Option<String> {
    let length = *data.get(64)? as usize;
    let end = 66 + 2 * length;
    if data.len() < end {
        return None;
    }
    let units: Vec<u16> = data[66..end]
        .chunks_exact(2)
        .map(LittleEndian::read_u16)
        .collect();
    Some(String::from_utf16_lossy(&units))
}

/// One record of an $ATTRIBUTE_LIST value.
#[derive(Debug, Clone)]
pub(crate) struct AttributeListEntry {
    pub kind: AttributeKind,
    pub name: Option<String>,
    pub first_vcn: u64,
    pub reference: FileReference,
    pub id: u16,
}

/// Parses the packed records of an $ATTRIBUTE_LIST value.
pub(crate) fn parse_attribute_list(data: &[u8], base_offset: u64) -> Result<Vec<AttributeListEntry>> {
    const MIN_RECORD: usize = 26;
    let mut entries = Vec::new();
    let mut offset = 0usize;

    while offset + MIN_RECORD <= data.len() {
        let record = &data[offset..];
        let type_code = LittleEndian::read_u32(&record[0..4]);
        if type_code == 0 {
            break;
        }
        let record_length = LittleEndian::read_u16(&record[4..6]) as usize;
        if record_length < MIN_RECORD || offset + record_length > data.len() {
            return Err(FsError::CorruptRecord {
                offset: base_offset + offset as u64,
                reason: format!("attribute list record of {record_length} bytes"),
            });
        }
        let name_length = record[6] as usize;
        let name_offset = record[7] as usize;
        let first_vcn = LittleEndian::read_u64(&record[8..16]);
        let reference = FileReference::from_raw(LittleEndian::read_u64(&record[16..24]));
        let id = LittleEndian::read_u16(&record[24..26]);

        let name = if name_length == 0 {
            None
        } else {
            let name_end = name_offset + 2 * name_length;
            if name_end > record_length {
                return Err(FsError::CorruptRecord {
                    offset: base_offset + offset as u64,
                    reason: "attribute list name out of bounds".to_string(),
                });
            }
            let units: Vec<u16> = record[name_offset..name_end]
                .chunks_exact(2)
                .map(LittleEndian::read_u16)
                .collect();
            Some(String::from_utf16_lossy(&units))
        };

        entries.push(AttributeListEntry {
            kind: AttributeKind::from_code(type_code),
            name,
            first_vcn,
            reference,
            id,
        });
        offset += record_length;
    }
    Ok(entries)
}
