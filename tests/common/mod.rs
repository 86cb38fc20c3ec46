#![allow(dead_code)]
//! Synthetic NTFS volume fixtures for the integration tests.
//!
//! Builds a 16 MiB image with a 32-entry MFT at 4 MiB: entry 0 describes
//! the MFT itself, entry 5 carries a boot-sized $DATA stream, entry 6 the
//! allocation bitmap, entry 9 the $Secure index and entry 11 a fully sparse
//! stream. Records are fixup-protected exactly as a volume would store
//! them.

use byteorder::{ByteOrder, LittleEndian};
use talos::{MemImage, VolumeGeometry};

pub const BYTES_PER_SECTOR: usize = 512;
pub const CLUSTER_SIZE: usize = 4096;
pub const ENTRY_SIZE: usize = 1024;
pub const VOLUME_SIZE: usize = 16 * 1024 * 1024;

pub const MFT_LCN: u64 = 1024;
pub const MFT_OFFSET: u64 = MFT_LCN * CLUSTER_SIZE as u64;
pub const MFT_ENTRY_COUNT: u64 = 32;
pub const MFT_SIZE: u64 = MFT_ENTRY_COUNT * ENTRY_SIZE as u64;

pub const BITMAP_LCN: u64 = 1040;
pub const SDS_LCN: u64 = 1048;

pub const BOOT_ENTRY: u64 = 5;
pub const SPARSE_ENTRY: u64 = 11;
pub const HALF_INITIALIZED_ENTRY: u64 = 12;
pub const HALF_INITIALIZED_LCN: u64 = 1052;
pub const HALF_INITIALIZED_SIZE: u64 = 128;

pub const KNOWN_SECURITY_ID: u32 = 256;
pub const OTHER_SECURITY_ID: u32 = 300;

pub fn geometry() -> VolumeGeometry {
    VolumeGeometry {
        bytes_per_sector: BYTES_PER_SECTOR as u16,
        cluster_size: CLUSTER_SIZE as u32,
        mft_entry_size: ENTRY_SIZE as u32,
        mft_offset: MFT_OFFSET,
        volume_size: VOLUME_SIZE as u64,
    }
}

/// Encodes a run list from (length-in-clusters, LCN) pairs; `None` encodes
/// a sparse run.
pub fn encode_runs(runs: &[(u64, Option<u64>)]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut previous_lcn: i64 = 0;
    for (length, lcn) in runs {
        let length_bytes = unsigned_bytes(*length);
        match lcn {
            None => {
                out.push(length_bytes.len() as u8);
                out.extend_from_slice(&length_bytes);
            }
            Some(lcn) => {
                let delta = *lcn as i64 - previous_lcn;
                let delta_bytes = signed_bytes(delta);
                out.push(((delta_bytes.len() as u8) << 4) | length_bytes.len() as u8);
                out.extend_from_slice(&length_bytes);
                out.extend_from_slice(&delta_bytes);
                previous_lcn = *lcn as i64;
            }
        }
    }
    out.push(0);
    out
}

fn unsigned_bytes(value: u64) -> Vec<u8> {
    let mut bytes = value.to_le_bytes().to_vec();
    while bytes.len() > 1 && bytes[bytes.len() - 1] == 0 {
        bytes.pop();
    }
    bytes
}

fn signed_bytes(value: i64) -> Vec<u8> {
    let mut bytes = value.to_le_bytes().to_vec();
    while bytes.len() > 1 {
        let last = bytes[bytes.len() - 1];
        let next = bytes[bytes.len() - 2];
        let redundant = (last == 0 && next & 0x80 == 0) || (last == 0xFF && next & 0x80 != 0);
        if redundant {
            bytes.pop();
        } else {
            break;
        }
    }
    bytes
}

pub fn resident_attr(kind: u32, name: Option<&str>, value: &[u8]) -> Vec<u8> {
    let name_units: Vec<u8> = name
        .unwrap_or("")
        .encode_utf16()
        .flat_map(|unit| unit.to_le_bytes())
        .collect();
    let name_offset = 24usize;
    let value_offset = (name_offset + name_units.len() + 7) & !7;
    let length = (value_offset + value.len() + 7) & !7;

    let mut out = vec![0u8; length];
    LittleEndian::write_u32(&mut out[0..4], kind);
    LittleEndian::write_u32(&mut out[4..8], length as u32);
    out[9] = name.map_or(0, |n| n.encode_utf16().count() as u8);
    LittleEndian::write_u16(&mut out[10..12], name_offset as u16);
    LittleEndian::write_u32(&mut out[16..20], value.len() as u32);
    LittleEndian::write_u16(&mut out[20..22], value_offset as u16);
    out[name_offset..name_offset + name_units.len()].copy_from_slice(&name_units);
    out[value_offset..value_offset + value.len()].copy_from_slice(value);
    out
}

pub struct NonResident<'a> {
    pub kind: u32,
    pub name: Option<&'a str>,
    pub runs: &'a [(u64, Option<u64>)],
    pub allocated: u64,
    pub valid: u64,
    pub initialized: u64,
}

pub fn non_resident_attr(spec: &NonResident<'_>) -> Vec<u8> {
    let name_units: Vec<u8> = spec
        .name
        .unwrap_or("")
        .encode_utf16()
        .flat_map(|unit| unit.to_le_bytes())
        .collect();
    let run_bytes = encode_runs(spec.runs);
    let name_offset = 64usize;
    let runs_offset = (name_offset + name_units.len() + 7) & !7;
    let length = (runs_offset + run_bytes.len() + 7) & !7;
    let last_vcn = spec.runs.iter().map(|(length, _)| *length).sum::<u64>() - 1;

    let mut out = vec![0u8; length];
    LittleEndian::write_u32(&mut out[0..4], spec.kind);
    LittleEndian::write_u32(&mut out[4..8], length as u32);
    out[8] = 1;
    out[9] = spec.name.map_or(0, |n| n.encode_utf16().count() as u8);
    LittleEndian::write_u16(&mut out[10..12], name_offset as u16);
    LittleEndian::write_u64(&mut out[24..32], last_vcn);
    LittleEndian::write_u16(&mut out[32..34], runs_offset as u16);
    LittleEndian::write_u64(&mut out[40..48], spec.allocated);
    LittleEndian::write_u64(&mut out[48..56], spec.valid);
    LittleEndian::write_u64(&mut out[56..64], spec.initialized);
    out[name_offset..name_offset + name_units.len()].copy_from_slice(&name_units);
    out[runs_offset..runs_offset + run_bytes.len()].copy_from_slice(&run_bytes);
    out
}

pub fn file_name_payload(parent: u64, name: &str) -> Vec<u8> {
    let units: Vec<u8> = name
        .encode_utf16()
        .flat_map(|unit| unit.to_le_bytes())
        .collect();
    let mut out = vec![0u8; 66 + units.len()];
    LittleEndian::write_u64(&mut out[0..8], parent | (1u64 << 48));
    out[64] = name.encode_utf16().count() as u8;
    out[65] = 1; // Win32 namespace
    out[66..].copy_from_slice(&units);
    out
}

/// Assembles a fixup-protected FILE record.
pub fn build_record(index: u64, flags: u16, attributes: &[Vec<u8>]) -> Vec<u8> {
    let sector_count = ENTRY_SIZE / BYTES_PER_SECTOR;
    let usa_count = sector_count + 1;
    let usa_offset = 48usize;
    let first_attribute_offset = (usa_offset + 2 * usa_count + 7) & !7;

    let mut record = vec![0u8; ENTRY_SIZE];
    record[0..4].copy_from_slice(b"FILE");
    LittleEndian::write_u16(&mut record[4..6], usa_offset as u16);
    LittleEndian::write_u16(&mut record[6..8], usa_count as u16);
    LittleEndian::write_u16(&mut record[16..18], 1);
    LittleEndian::write_u16(&mut record[18..20], 1);
    LittleEndian::write_u16(&mut record[20..22], first_attribute_offset as u16);
    LittleEndian::write_u16(&mut record[22..24], flags);
    LittleEndian::write_u32(&mut record[28..32], ENTRY_SIZE as u32);
    LittleEndian::write_u32(&mut record[44..48], index as u32);

    let mut offset = first_attribute_offset;
    for attribute in attributes {
        record[offset..offset + attribute.len()].copy_from_slice(attribute);
        offset += attribute.len();
    }
    LittleEndian::write_u32(&mut record[offset..offset + 4], 0xFFFF_FFFF);
    offset += 8;
    LittleEndian::write_u32(&mut record[24..28], offset as u32);

    // Install the fixup sentinels, displacing the protected bytes into the
    // update sequence array.
    let usn: u16 = 0x0042;
    LittleEndian::write_u16(&mut record[usa_offset..], usn);
    for sector in 0..sector_count {
        let sentinel_offset = (sector + 1) * BYTES_PER_SECTOR - 2;
        let saved_offset = usa_offset + 2 * (sector + 1);
        record[saved_offset] = record[sentinel_offset];
        record[saved_offset + 1] = record[sentinel_offset + 1];
        LittleEndian::write_u16(&mut record[sentinel_offset..], usn);
    }
    record
}

/// Self-relative descriptor: revision 1, owner and group S-1-1-0, one
/// empty DACL.
pub fn descriptor_payload() -> Vec<u8> {
    let world_sid = {
        let mut sid = vec![1u8, 1];
        sid.extend_from_slice(&[0, 0, 0, 0, 0, 1]);
        sid.extend_from_slice(&0u32.to_le_bytes());
        sid
    };
    let mut payload = vec![0u8; 20];
    payload[0] = 1;
    LittleEndian::write_u16(&mut payload[2..4], 0x8000 | 0x0004);
    LittleEndian::write_u32(&mut payload[4..8], 20);
    LittleEndian::write_u32(&mut payload[8..12], 32);
    LittleEndian::write_u32(&mut payload[16..20], 44);
    payload.extend_from_slice(&world_sid);
    payload.extend_from_slice(&world_sid);
    let mut acl = vec![2u8, 0];
    acl.extend_from_slice(&8u16.to_le_bytes());
    acl.extend_from_slice(&0u16.to_le_bytes());
    acl.extend_from_slice(&0u16.to_le_bytes());
    payload.extend_from_slice(&acl);
    payload
}

/// One $SDS stream entry: 20-byte header followed by the descriptor.
fn sds_entry(id: u32, offset: u64, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; 20];
    LittleEndian::write_u32(&mut out[0..4], 0x1234_0000 | id);
    LittleEndian::write_u32(&mut out[4..8], id);
    LittleEndian::write_u64(&mut out[8..16], offset);
    LittleEndian::write_u32(&mut out[16..20], (20 + payload.len()) as u32);
    out.extend_from_slice(payload);
    out
}

/// $SII $INDEX_ROOT value: header plus one leaf node of (id -> offset,
/// size) entries in key order.
fn sii_index_root(entries: &[(u32, u64, u32)]) -> Vec<u8> {
    let mut body = Vec::new();
    for (id, offset, size) in entries {
        let mut entry = vec![0u8; 40];
        LittleEndian::write_u16(&mut entry[0..2], 20);
        LittleEndian::write_u16(&mut entry[2..4], 20);
        LittleEndian::write_u16(&mut entry[8..10], 40);
        LittleEndian::write_u16(&mut entry[10..12], 4);
        LittleEndian::write_u32(&mut entry[16..20], *id);
        LittleEndian::write_u32(&mut entry[20..24], 0x1234_0000 | id);
        LittleEndian::write_u32(&mut entry[24..28], *id);
        LittleEndian::write_u64(&mut entry[28..36], *offset);
        LittleEndian::write_u32(&mut entry[36..40], *size);
        body.extend_from_slice(&entry);
    }
    let mut last = vec![0u8; 16];
    LittleEndian::write_u16(&mut last[8..10], 16);
    LittleEndian::write_u16(&mut last[12..14], 0x0002);
    body.extend_from_slice(&last);

    // $INDEX_ROOT header, then the node header at offset 16.
    let mut root = vec![0u8; 32];
    LittleEndian::write_u32(&mut root[4..8], 16); // collation: ULONG
    LittleEndian::write_u32(&mut root[8..12], CLUSTER_SIZE as u32);
    root[12] = 1;
    LittleEndian::write_u32(&mut root[16..20], 16);
    LittleEndian::write_u32(&mut root[20..24], (16 + body.len()) as u32);
    LittleEndian::write_u32(&mut root[24..28], (16 + body.len()) as u32);
    root.extend_from_slice(&body);
    root
}

fn simple_file(index: u64, name: &str, contents: &[u8]) -> Vec<u8> {
    build_record(
        index,
        0x0001,
        &[
            resident_attr(0x30, None, &file_name_payload(5, name)),
            resident_attr(0x80, None, contents),
        ],
    )
}

/// Raw bytes of the standard test volume. `with_secure` controls whether
/// entry 9 is a real $Secure file or a reused plain file.
pub fn build_volume_bytes(with_secure: bool) -> Vec<u8> {
    let mut image = vec![0u8; VOLUME_SIZE];

    // Boot-area pattern read back through entry 5's $DATA.
    for (position, byte) in image[..2 * CLUSTER_SIZE].iter_mut().enumerate() {
        *byte = (position % 251) as u8;
    }

    // Allocation bitmap: the first 4096 clusters allocated, the rest free.
    let bitmap_offset = (BITMAP_LCN * CLUSTER_SIZE as u64) as usize;
    image[bitmap_offset..bitmap_offset + 512].fill(0xFF);

    // Backing cluster of the half-initialized stream.
    let half_offset = (HALF_INITIALIZED_LCN * CLUSTER_SIZE as u64) as usize;
    image[half_offset..half_offset + CLUSTER_SIZE].fill(0xAB);

    // $SDS stream: descriptors for two identifiers.
    let descriptor = descriptor_payload();
    let sds_offset = (SDS_LCN * CLUSTER_SIZE as u64) as usize;
    let first = sds_entry(KNOWN_SECURITY_ID, 0, &descriptor);
    let second_offset = 512u64;
    let second = sds_entry(OTHER_SECURITY_ID, second_offset, &descriptor);
    image[sds_offset..sds_offset + first.len()].copy_from_slice(&first);
    image[sds_offset + second_offset as usize..sds_offset + second_offset as usize + second.len()]
        .copy_from_slice(&second);

    let sii_entries = [
        (KNOWN_SECURITY_ID, 0u64, first.len() as u32),
        (OTHER_SECURITY_ID, second_offset, second.len() as u32),
    ];

    let mut records: Vec<Vec<u8>> = Vec::new();
    records.push(build_record(
        0,
        0x0001,
        &[
            resident_attr(0x30, None, &file_name_payload(5, "$MFT")),
            non_resident_attr(&NonResident {
                kind: 0x80,
                name: None,
                runs: &[(8, Some(MFT_LCN))],
                allocated: MFT_SIZE,
                valid: MFT_SIZE,
                initialized: MFT_SIZE,
            }),
        ],
    ));
    for index in 1..5u64 {
        records.push(simple_file(index, &format!("file{index}.txt"), b"payload"));
    }
    records.push(build_record(
        BOOT_ENTRY,
        0x0001,
        &[
            resident_attr(0x30, None, &file_name_payload(5, "$Boot")),
            non_resident_attr(&NonResident {
                kind: 0x80,
                name: None,
                runs: &[(2, Some(0))],
                allocated: 8192,
                valid: 8192,
                initialized: 8192,
            }),
        ],
    ));
    records.push(build_record(
        6,
        0x0001,
        &[
            resident_attr(0x30, None, &file_name_payload(5, "$Bitmap")),
            non_resident_attr(&NonResident {
                kind: 0x80,
                name: None,
                runs: &[(1, Some(BITMAP_LCN))],
                allocated: CLUSTER_SIZE as u64,
                valid: 1024,
                initialized: 1024,
            }),
        ],
    ));
    records.push(simple_file(7, "file7.txt", b"payload"));
    records.push(simple_file(8, "file8.txt", b"payload"));

    let secure_name = if with_secure { "$Secure" } else { "leftover.dat" };
    records.push(build_record(
        9,
        0x0001,
        &[
            resident_attr(0x30, None, &file_name_payload(5, secure_name)),
            resident_attr(0x90, Some("$SII"), &sii_index_root(&sii_entries)),
            non_resident_attr(&NonResident {
                kind: 0x80,
                name: Some("$SDS"),
                runs: &[(2, Some(SDS_LCN))],
                allocated: 8192,
                valid: 8192,
                initialized: 8192,
            }),
        ],
    ));
    records.push(simple_file(10, "file10.txt", b"payload"));
    records.push(build_record(
        SPARSE_ENTRY,
        0x0001,
        &[
            resident_attr(0x30, None, &file_name_payload(5, "sparse.bin")),
            non_resident_attr(&NonResident {
                kind: 0x80,
                name: None,
                runs: &[(4, None)],
                allocated: 4 * CLUSTER_SIZE as u64,
                valid: 4 * CLUSTER_SIZE as u64,
                initialized: 4 * CLUSTER_SIZE as u64,
            }),
        ],
    ));
    records.push(build_record(
        HALF_INITIALIZED_ENTRY,
        0x0001,
        &[
            resident_attr(0x30, None, &file_name_payload(5, "halfinit.bin")),
            non_resident_attr(&NonResident {
                kind: 0x80,
                name: None,
                runs: &[(1, Some(HALF_INITIALIZED_LCN))],
                allocated: CLUSTER_SIZE as u64,
                valid: CLUSTER_SIZE as u64,
                initialized: HALF_INITIALIZED_SIZE,
            }),
        ],
    ));
    for index in 13..MFT_ENTRY_COUNT {
        records.push(simple_file(index, &format!("file{index}.txt"), b"payload"));
    }

    let mut offset = MFT_OFFSET as usize;
    for record in records {
        image[offset..offset + ENTRY_SIZE].copy_from_slice(&record);
        offset += ENTRY_SIZE;
    }
    image
}

pub fn build_volume() -> MemImage {
    MemImage::new(build_volume_bytes(true))
}

pub fn build_volume_without_secure() -> MemImage {
    MemImage::new(build_volume_bytes(false))
}
