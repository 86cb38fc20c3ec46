//! Multi-sector transfer protection (fixup) decoding.
//!
//! NTFS protects records spanning several sectors by writing the record's
//! update sequence number over the last two bytes of each sector and keeping
//! the displaced bytes in the update sequence array. Every MFT record and
//! index record passes through here before any further parsing; a sentinel
//! mismatch means a torn write and the record is rejected.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{FsError, Result};

/// Verifies and removes the fixup values from a just-read record.
///
/// `usa_offset` and `usa_count` come from the record header; `usa_count`
/// includes the update sequence number itself, so it protects
/// `usa_count - 1` sectors of `bytes_per_sector` bytes each.
pub fn apply_fixups(
    record: &mut [u8],
    usa_offset: u16,
    usa_count: u16,
    bytes_per_sector: u16,
) -> Result<()> {
    let usa_offset = usa_offset as usize;
    let usa_count = usa_count as usize;
    let sector_size = bytes_per_sector as usize;

    if usa_count < 2 {
        return Err(FsError::CorruptRecord {
            offset: usa_offset as u64,
            reason: format!("update sequence count {usa_count} is too small"),
        });
    }
    let sector_count = usa_count - 1;
    let usa_end = usa_offset + 2 * usa_count;
    if usa_end > record.len() {
        return Err(FsError::CorruptRecord {
            offset: usa_offset as u64,
            reason: "update sequence array extends past the record".to_string(),
        });
    }
    if sector_count * sector_size > record.len() {
        return Err(FsError::CorruptRecord {
            offset: usa_offset as u64,
            reason: format!("{sector_count} protected sectors exceed the record size"),
        });
    }

    let usn = LittleEndian::read_u16(&record[usa_offset..usa_offset + 2]);
    for sector in 0..sector_count {
        let sentinel_offset = (sector + 1) * sector_size - 2;
        let sentinel = LittleEndian::read_u16(&record[sentinel_offset..sentinel_offset + 2]);
        if sentinel != usn {
            return Err(FsError::CorruptRecord {
                offset: sentinel_offset as u64,
                reason: format!(
                    "fixup sentinel {sentinel:#06x} does not match update sequence number {usn:#06x}"
                ),
            });
        }
        let saved_offset = usa_offset + 2 * (sector + 1);
        let saved = [record[saved_offset], record[saved_offset + 1]];
        record[sentinel_offset] = saved[0];
        record[sentinel_offset + 1] = saved[1];
    }
    Ok(())
}
