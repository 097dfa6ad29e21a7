//! On-disk header layouts for both image versions, and the reconciled
//! logical header the rest of the engine works against.

use binrw::binrw;

/// Length in bytes of the fixed image-magic string at the start of every
/// header, v1 or v2.
pub const IMAGE_MAGIC_LEN: usize = 16;

/// The fixed magic partclone-format images begin with.
pub const IMAGE_MAGIC: &[u8; IMAGE_MAGIC_LEN] = b"partclone-image\0";

/// Length of the 4-byte ASCII version tag.
pub const VERSION_LEN: usize = 4;

pub const VERSION_V1: [u8; VERSION_LEN] = *b"0001";
pub const VERSION_V2: [u8; VERSION_LEN] = *b"0002";

/// Trailer literal that must immediately follow a v1 bitmap.
pub const TRAILER_MAGIC: &[u8; 8] = b"BiTmAgIc";
pub const TRAILER_LEN: u64 = 8;

/// Just enough of the header to find out which version we're looking at,
/// read first so `verify()` knows which full header struct to parse next.
#[binrw]
#[derive(Debug, Clone)]
pub struct HeaderTag {
    pub magic: [u8; IMAGE_MAGIC_LEN],
    pub version: [u8; VERSION_LEN],
}

impl HeaderTag {
    pub const SIZE: u64 = (IMAGE_MAGIC_LEN + VERSION_LEN) as u64;

    pub fn magic_ok(&self) -> bool {
        &self.magic == IMAGE_MAGIC
    }
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct V1HeaderRaw {
    pub magic: [u8; IMAGE_MAGIC_LEN],
    pub version: [u8; VERSION_LEN],
    pub block_size: u32,
    pub device_size: u64,
    pub total_blocks: u64,
    pub used_blocks: u64,
}

impl V1HeaderRaw {
    pub const SIZE: u64 = (IMAGE_MAGIC_LEN + VERSION_LEN) as u64 + 4 + 8 + 8 + 8;
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct V2HeaderRaw {
    pub magic: [u8; IMAGE_MAGIC_LEN],
    pub version: [u8; VERSION_LEN],
    pub block_size: u32,
    pub device_size: u64,
    pub total_blocks: u64,
    pub used_blocks: u64,
    pub checksum_size: u32,
    pub blocks_per_checksum: u32,
}

impl V2HeaderRaw {
    pub const SIZE: u64 = V1HeaderRaw::SIZE + 4 + 4;
}

/// The reconciled header fields every version handler ultimately produces.
#[derive(Debug, Clone)]
pub struct LogicalHeader {
    pub block_size: u32,
    pub total_blocks: u64,
    pub device_size: u64,
    pub checksum_size: u64,
    pub blocks_per_checksum: u64,
    pub header_size: u64,
    pub used_blocks: u64,
}

impl LogicalHeader {
    /// Byte offset in the base file of the `i`-th captured block (zero
    /// based), accounting for v2's interleaved checksum groups. v1 has no
    /// inter-block checksums at all (`blocks_per_checksum = 0`), so this
    /// reduces to a simple `block_size` stride.
    pub fn rblock2offset(&self, captured_index: u64) -> u64 {
        let mut offset = self.header_size + captured_index * self.block_size as u64;
        if self.blocks_per_checksum != 0 {
            offset += (captured_index / self.blocks_per_checksum) * self.checksum_size;
        }
        offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_sizes_match_field_layout() {
        assert_eq!(V1HeaderRaw::SIZE, 48);
        assert_eq!(V2HeaderRaw::SIZE, 56);
    }

    #[test]
    fn rblock2offset_reduces_to_simple_stride_for_v1() {
        let header = LogicalHeader {
            block_size: 16,
            total_blocks: 4,
            device_size: 64,
            checksum_size: crate::crc::CRC_SIZE,
            blocks_per_checksum: 0,
            header_size: 100,
            used_blocks: 2,
        };
        assert_eq!(header.rblock2offset(0), 100);
        assert_eq!(header.rblock2offset(1), 100 + 16);
    }

    #[test]
    fn rblock2offset_accounts_for_checksum_groups() {
        let header = LogicalHeader {
            block_size: 16,
            total_blocks: 4,
            device_size: 64,
            checksum_size: 4,
            blocks_per_checksum: 2,
            header_size: 56,
            used_blocks: 4,
        };
        // blocks 0,1 share one checksum group; block 2 starts the next one.
        assert_eq!(header.rblock2offset(0), 56);
        assert_eq!(header.rblock2offset(1), 56 + 16);
        assert_eq!(header.rblock2offset(2), 56 + 2 * 16 + 4);
    }
}
