//! Security descriptor index ($Secure, MFT entry 9).
//!
//! $Secure stores every distinct security descriptor once, in the $SDS data
//! stream, and indexes them by 32-bit identifier through the $SII B-tree
//! ($INDEX_ROOT plus, on larger volumes, $INDEX_ALLOCATION records). Volumes
//! created before the scheme existed have no $Secure file; that is an absent
//! index, not an error.

use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;
use tracing::debug;

use crate::attribute::{Attribute, AttributeBody, AttributeKind};
use crate::entry::MftEntry;
use crate::error::{FsError, Result};
use crate::fixup::apply_fixups;
use crate::io::{VolumeGeometry, VolumeRead};
use crate::mft::Mft;
use crate::stream::ClusterStream;

/// MFT entry index of the $Secure metadata file.
pub(crate) const SECURE_ENTRY_INDEX: u64 = 9;

/// Descent bound for the $SII tree; mirrors the attribute list bound.
const MAX_INDEX_DEPTH: usize = 16;

/// $SDS entries are preceded by a 20-byte header.
const SDS_HEADER_SIZE: usize = 20;

/// "INDX"
const INDEX_RECORD_SIGNATURE: [u8; 4] = [0x49, 0x4E, 0x44, 0x58];

const ENTRY_FLAG_HAS_SUBNODE: u16 = 0x0001;
const ENTRY_FLAG_LAST: u16 = 0x0002;

/// Self-relative control bit of a security descriptor.
pub const CONTROL_SELF_RELATIVE: u16 = 0x8000;

/// A Windows security identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sid {
    pub revision: u8,
    pub identifier_authority: u64,
    pub sub_authorities: Vec<u32>,
}

impl std::fmt::Display for Sid {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "S-{}-{}", self.revision, self.identifier_authority)?;
        for sub_authority in &self.sub_authorities {
            write!(formatter, "-{sub_authority}")?;
        }
        Ok(())
    }
}

/// Parsed header of an access control list; ACE decoding stays upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AclSummary {
    pub revision: u8,
    pub size: u16,
    pub ace_count: u16,
    /// Offset of the ACL inside the descriptor payload.
    pub offset: u32,
}

/// One security descriptor resolved through $Secure.
#[derive(Debug, Clone)]
pub struct SecurityDescriptor {
    pub id: u32,
    pub hash: u32,
    pub revision: u8,
    pub control: u16,
    pub owner: Option<Sid>,
    pub group: Option<Sid>,
    pub sacl: Option<AclSummary>,
    pub dacl: Option<AclSummary>,
    /// The raw self-relative descriptor bytes.
    pub payload: Bytes,
}

impl SecurityDescriptor {
    pub fn is_self_relative(&self) -> bool {
        self.control & CONTROL_SELF_RELATIVE != 0
    }
}

/// Loaded $SII index and $SDS stream handles.
pub(crate) struct SecurityIndex {
    cluster_size: u32,
    bytes_per_sector: u16,
    sds: Attribute,
    sii_root: Bytes,
    sii_allocation: Option<Attribute>,
    index_record_size: u32,
}

impl SecurityIndex {
    /// Reads $Secure. Returns `None` on volumes without one (the entry is
    /// identified by name, so a reused entry 9 also reads as absent).
    pub(crate) fn load(
        mft: &Mft,
        io: &dyn VolumeRead,
        geometry: &VolumeGeometry,
    ) -> Result<Option<SecurityIndex>> {
        let entry = match mft.get(io, SECURE_ENTRY_INDEX) {
            Ok(entry) => entry,
            Err(FsError::EntryOutOfRange { .. }) => {
                debug!("volume has no MFT entry 9; security index absent");
                return Ok(None);
            }
            Err(error) => return Err(error.with_context("reading $Secure entry")),
        };
        if entry.file_name().as_deref() != Some("$Secure") {
            debug!("MFT entry 9 is not named $Secure; security index absent");
            return Ok(None);
        }
        Self::from_entry(&entry, geometry)
    }

    fn from_entry(entry: &MftEntry, geometry: &VolumeGeometry) -> Result<Option<SecurityIndex>> {
        let sds = entry
            .find_attribute(AttributeKind::Data, Some("$SDS"))
            .ok_or(FsError::MissingValue("$Secure $SDS attribute"))?
            .clone();
        let root_attribute = entry
            .find_attribute(AttributeKind::IndexRoot, Some("$SII"))
            .ok_or(FsError::MissingValue("$Secure $SII index root"))?;
        let sii_root = root_attribute
            .resident_data()
            .ok_or(FsError::MissingValue("resident $SII index root value"))?
            .clone();
        if sii_root.len() < 32 {
            return Err(FsError::CorruptRecord {
                offset: 0,
                reason: "truncated $SII index root".to_string(),
            });
        }
        let index_record_size = LittleEndian::read_u32(&sii_root[8..12]);
        let sii_allocation = entry
            .find_attribute(AttributeKind::IndexAllocation, Some("$SII"))
            .cloned();

        debug!(index_record_size, "security descriptor index loaded");
        Ok(Some(SecurityIndex {
            cluster_size: geometry.cluster_size,
            bytes_per_sector: geometry.bytes_per_sector,
            sds,
            sii_root,
            sii_allocation,
            index_record_size,
        }))
    }

    /// Resolves an identifier to its descriptor. Identifier 0 is never
    /// valid and an unknown identifier is an absent result, not an error.
    pub(crate) fn lookup(
        &self,
        io: &dyn VolumeRead,
        id: u32,
    ) -> Result<Option<SecurityDescriptor>> {
        if id == 0 {
            return Ok(None);
        }
        // The root node header sits at offset 16 of the $INDEX_ROOT value.
        let mut node = node_slice(&self.sii_root, 16)?.to_vec();

        for _ in 0..MAX_INDEX_DEPTH {
            match walk_node(&node, id)? {
                NodeOutcome::Found(reference) => {
                    return self.read_descriptor(io, id, reference).map(Some);
                }
                NodeOutcome::NotFound => return Ok(None),
                NodeOutcome::Descend(vcn) => {
                    node = self.read_index_record(io, vcn)?;
                }
            }
        }
        Err(FsError::CorruptRecord {
            offset: 0,
            reason: "$SII tree deeper than supported".to_string(),
        })
    }

    /// Reads and unprotects one "INDX" record, returning its node bytes.
    fn read_index_record(&self, io: &dyn VolumeRead, vcn: u64) -> Result<Vec<u8>> {
        let allocation = self
            .sii_allocation
            .as_ref()
            .ok_or(FsError::MissingValue("$SII index allocation"))?;
        // Child references are in clusters, or in 512-byte blocks when an
        // index record is smaller than a cluster.
        let block_size = if self.index_record_size >= self.cluster_size {
            self.cluster_size as u64
        } else {
            512
        };
        let offset = vcn * block_size;

        let mut record = vec![0u8; self.index_record_size as usize];
        let mut stream = ClusterStream::open(io, self.cluster_size, allocation)?;
        stream
            .read_exact_at(offset, &mut record)
            .map_err(|_| FsError::CorruptRecord {
                offset,
                reason: "short read of $SII index record".to_string(),
            })?;

        if record[0..4] != INDEX_RECORD_SIGNATURE {
            return Err(FsError::CorruptRecord {
                offset,
                reason: "missing INDX signature".to_string(),
            });
        }
        let usa_offset = LittleEndian::read_u16(&record[4..6]);
        let usa_count = LittleEndian::read_u16(&record[6..8]);
        apply_fixups(&mut record, usa_offset, usa_count, self.bytes_per_sector)?;

        // The node header of an index record starts at offset 24.
        Ok(node_slice(&record, 24)?.to_vec())
    }

    /// Fetches the descriptor bytes out of $SDS and cross-checks the entry
    /// header against the index.
    fn read_descriptor(
        &self,
        io: &dyn VolumeRead,
        id: u32,
        reference: SdsReference,
    ) -> Result<SecurityDescriptor> {
        if (reference.size as usize) < SDS_HEADER_SIZE {
            return Err(FsError::CorruptRecord {
                offset: reference.offset,
                reason: format!("$SDS entry of {} bytes", reference.size),
            });
        }
        let mut entry = vec![0u8; reference.size as usize];
        match &self.sds.body {
            AttributeBody::Resident { data } => {
                let start = reference.offset as usize;
                let end = start + entry.len();
                if end > data.len() {
                    return Err(FsError::OutOfBounds {
                        offset: reference.offset,
                        max: data.len() as u64,
                    });
                }
                entry.copy_from_slice(&data[start..end]);
            }
            AttributeBody::NonResident { .. } => {
                let mut stream = ClusterStream::open(io, self.cluster_size, &self.sds)?;
                stream
                    .read_exact_at(reference.offset, &mut entry)
                    .map_err(|error| {
                        error.with_context(format!("reading $SDS entry for identifier {id}"))
                    })?;
            }
        }

        let header_hash = LittleEndian::read_u32(&entry[0..4]);
        let header_id = LittleEndian::read_u32(&entry[4..8]);
        let header_offset = LittleEndian::read_u64(&entry[8..16]);
        let header_size = LittleEndian::read_u32(&entry[16..20]);
        if header_id != id || header_size != reference.size || header_offset != reference.offset {
            return Err(FsError::CorruptRecord {
                offset: reference.offset,
                reason: format!(
                    "$SDS header (id {header_id}, size {header_size}) disagrees with the index \
                     (id {id}, size {})",
                    reference.size
                ),
            });
        }
        let payload = Bytes::copy_from_slice(&entry[SDS_HEADER_SIZE..]);
        parse_descriptor(payload, id, header_hash, reference.offset)
    }
}

/// Where a descriptor lives inside $SDS, per its $SII leaf.
#[derive(Debug, Clone, Copy)]
struct SdsReference {
    offset: u64,
    size: u32,
}

enum NodeOutcome {
    Found(SdsReference),
    NotFound,
    Descend(u64),
}

/// Bounds-checks a node header at `header_offset` and returns the node
/// bytes from the header to the end of the used area.
fn node_slice(record: &[u8], header_offset: usize) -> Result<&[u8]> {
    if record.len() < header_offset + 16 {
        return Err(FsError::CorruptRecord {
            offset: header_offset as u64,
            reason: "truncated index node header".to_string(),
        });
    }
    let header = &record[header_offset..];
    let index_size = LittleEndian::read_u32(&header[4..8]) as usize;
    if index_size < 16 || header_offset + index_size > record.len() {
        return Err(FsError::CorruptRecord {
            offset: header_offset as u64,
            reason: format!("index node of {index_size} bytes"),
        });
    }
    Ok(&record[header_offset..header_offset + index_size])
}

/// Scans one node's entries for `id`, deciding between a match, a child
/// descent, and a miss.
fn walk_node(node: &[u8], id: u32) -> Result<NodeOutcome> {
    let entries_offset = LittleEndian::read_u32(&node[0..4]) as usize;
    let mut position = entries_offset;

    loop {
        if position + 16 > node.len() {
            return Err(FsError::CorruptRecord {
                offset: position as u64,
                reason: "index entries overrun the node".to_string(),
            });
        }
        let entry = &node[position..];
        let entry_size = LittleEndian::read_u16(&entry[8..10]) as usize;
        let key_size = LittleEndian::read_u16(&entry[10..12]) as usize;
        let flags = LittleEndian::read_u16(&entry[12..14]);
        if entry_size < 16 || position + entry_size > node.len() {
            return Err(FsError::CorruptRecord {
                offset: position as u64,
                reason: format!("index entry of {entry_size} bytes"),
            });
        }
        let subnode = if flags & ENTRY_FLAG_HAS_SUBNODE != 0 {
            if entry_size < 24 {
                return Err(FsError::CorruptRecord {
                    offset: position as u64,
                    reason: "index entry too small for a child reference".to_string(),
                });
            }
            Some(LittleEndian::read_u64(&entry[entry_size - 8..entry_size]))
        } else {
            None
        };

        if flags & ENTRY_FLAG_LAST != 0 {
            return Ok(match subnode {
                Some(vcn) => NodeOutcome::Descend(vcn),
                None => NodeOutcome::NotFound,
            });
        }
        if key_size < 4 || 16 + key_size > entry_size {
            return Err(FsError::CorruptRecord {
                offset: position as u64,
                reason: format!("index key of {key_size} bytes"),
            });
        }
        let key = LittleEndian::read_u32(&entry[16..20]);

        if id == key {
            let data_offset = LittleEndian::read_u16(&entry[0..2]) as usize;
            let data_size = LittleEndian::read_u16(&entry[2..4]) as usize;
            if data_size < 20 || data_offset + data_size > entry_size {
                return Err(FsError::CorruptRecord {
                    offset: position as u64,
                    reason: "index entry data out of bounds".to_string(),
                });
            }
            let data = &entry[data_offset..data_offset + data_size];
            return Ok(NodeOutcome::Found(SdsReference {
                offset: LittleEndian::read_u64(&data[8..16]),
                size: LittleEndian::read_u32(&data[16..20]),
            }));
        }
        if id < key {
            return Ok(match subnode {
                Some(vcn) => NodeOutcome::Descend(vcn),
                None => NodeOutcome::NotFound,
            });
        }
        position += entry_size;
    }
}

/// Parses a self-relative SECURITY_DESCRIPTOR payload.
fn parse_descriptor(
    payload: Bytes,
    id: u32,
    hash: u32,
    diagnostic_offset: u64,
) -> Result<SecurityDescriptor> {
    if payload.len() < 20 {
        return Err(FsError::CorruptRecord {
            offset: diagnostic_offset,
            reason: "truncated security descriptor".to_string(),
        });
    }
    let revision = payload[0];
    let control = LittleEndian::read_u16(&payload[2..4]);
    let owner_offset = LittleEndian::read_u32(&payload[4..8]);
    let group_offset = LittleEndian::read_u32(&payload[8..12]);
    let sacl_offset = LittleEndian::read_u32(&payload[12..16]);
    let dacl_offset = LittleEndian::read_u32(&payload[16..20]);

    let owner = parse_sid_at(&payload, owner_offset, diagnostic_offset)?;
    let group = parse_sid_at(&payload, group_offset, diagnostic_offset)?;
    let sacl = parse_acl_at(&payload, sacl_offset, diagnostic_offset)?;
    let dacl = parse_acl_at(&payload, dacl_offset, diagnostic_offset)?;

    Ok(SecurityDescriptor {
        id,
        hash,
        revision,
        control,
        owner,
        group,
        sacl,
        dacl,
        payload,
    })
}

fn parse_sid_at(payload: &[u8], offset: u32, diagnostic_offset: u64) -> Result<Option<Sid>> {
    if offset == 0 {
        return Ok(None);
    }
    let start = offset as usize;
    let corrupt = |reason: &str| FsError::CorruptRecord {
        offset: diagnostic_offset + offset as u64,
        reason: format!("SID: {reason}"),
    };
    if start + 8 > payload.len() {
        return Err(corrupt("header out of bounds"));
    }
    let revision = payload[start];
    let count = payload[start + 1] as usize;
    if count > 15 {
        return Err(corrupt("too many sub-authorities"));
    }
    let end = start + 8 + 4 * count;
    if end > payload.len() {
        return Err(corrupt("sub-authorities out of bounds"));
    }
    // The identifier authority is the lone big-endian field in the format.
    let mut identifier_authority = 0u64;
    for byte in &payload[start + 2..start + 8] {
        identifier_authority = (identifier_authority << 8) | *byte as u64;
    }
    let sub_authorities = payload[start + 8..end]
        .chunks_exact(4)
        .map(LittleEndian::read_u32)
        .collect();
    Ok(Some(Sid {
        revision,
        identifier_authority,
        sub_authorities,
    }))
}

fn parse_acl_at(payload: &[u8], offset: u32, diagnostic_offset: u64) -> Result<Option<AclSummary>> {
    if offset == 0 {
        return Ok(None);
    }
    let start = offset as usize;
    if start + 8 > payload.len() {
        return Err(FsError::CorruptRecord {
            offset: diagnostic_offset + offset as u64,
            reason: "ACL header out of bounds".to_string(),
        });
    }
    let revision = payload[start];
    let size = LittleEndian::read_u16(&payload[start + 2..start + 4]);
    let ace_count = LittleEndian::read_u16(&payload[start + 4..start + 6]);
    if start + size as usize > payload.len() {
        return Err(FsError::CorruptRecord {
            offset: diagnostic_offset + offset as u64,
            reason: format!("ACL of {size} bytes out of bounds"),
        });
    }
    Ok(Some(AclSummary {
        revision,
        size,
        ace_count,
        offset,
    }))
}
