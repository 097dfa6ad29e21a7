//! Version dispatch. Modeled as a sum type rather than a table of
//! raw function pointers: only header verification differs between the two
//! on-disk formats, so that is the only thing each variant supplies. Every
//! other per-block operation is implemented once, against the shared
//! [`crate::context::FormatState`], in `context.rs`.

use std::io;

use crate::bitmap::Bitmap;
use crate::crc::{bitmap_checksum, CRC_SIZE};
use crate::header::{HeaderTag, LogicalHeader, V1HeaderRaw, V2HeaderRaw, TRAILER_LEN, TRAILER_MAGIC, VERSION_V1, VERSION_V2};
use crate::host::{HostServices, Whence};

/// Which on-disk format a header matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatVersion {
    V1,
    V2,
}

impl FormatVersion {
    /// The "static, indexed table" keyed by the 4-byte on-disk
    /// version tag. A linear scan here plays the same role the original's
    /// `version_table` array does; unlike that table, each entry only needs
    /// to carry a tag because the behavior difference between variants is
    /// encoded in the type system (the `match` in `lookup`/`verify`) rather
    /// than in a row of function pointers.
    const TABLE: &'static [([u8; 4], FormatVersion)] =
        &[(VERSION_V1, FormatVersion::V1), (VERSION_V2, FormatVersion::V2)];

    pub fn lookup(tag: &[u8; 4]) -> Option<Self> {
        Self::TABLE
            .iter()
            .find(|(t, _)| t == tag)
            .map(|(_, v)| *v)
    }

    /// Read and validate the format-specific header starting at offset 0 of
    /// `file`, returning the reconciled logical header and expanded bitmap.
    pub fn verify<H: HostServices>(
        self,
        host: &H,
        file: &mut H::File,
    ) -> io::Result<(LogicalHeader, Bitmap)> {
        match self {
            FormatVersion::V1 => verify_v1(host, file),
            FormatVersion::V2 => verify_v2(host, file),
        }
    }
}

/// A short read while parsing the header or bitmap region means the image
/// is truncated/corrupt, not a transient I/O failure — remapped to
/// `InvalidData` so callers can tell "this isn't a valid image" apart from
/// "the host couldn't service this read". Any other host error kind
/// passes through unchanged.
fn remap_short_read(e: io::Error) -> io::Error {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        io::Error::new(io::ErrorKind::InvalidData, "image truncated in header/bitmap region")
    } else {
        e
    }
}

fn read_struct<H: HostServices, T: binrw::BinRead>(
    host: &H,
    file: &mut H::File,
    size: u64,
) -> io::Result<T>
where
    for<'a> T::Args<'a>: Default,
{
    host.seek(file, 0, Whence::Absolute)?;
    let mut buf = vec![0u8; size as usize];
    host.read_exact(file, &mut buf).map_err(remap_short_read)?;
    let mut cursor = std::io::Cursor::new(buf);
    T::read_le(&mut cursor).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn verify_v1<H: HostServices>(host: &H, file: &mut H::File) -> io::Result<(LogicalHeader, Bitmap)> {
    let raw: V1HeaderRaw = read_struct(host, file, V1HeaderRaw::SIZE)?;
    let tag = HeaderTag {
        magic: raw.magic,
        version: raw.version,
    };
    if !tag.magic_ok() {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad v1 image magic"));
    }

    let mut header = LogicalHeader {
        block_size: raw.block_size,
        total_blocks: raw.total_blocks,
        device_size: raw.device_size,
        checksum_size: CRC_SIZE,
        // v1's data region has no inter-block checksums at all; 0 tells
        // `rblock2offset` to skip the checksum term rather than interleave
        // one every block.
        blocks_per_checksum: 0,
        header_size: V1HeaderRaw::SIZE + raw.total_blocks + TRAILER_LEN,
        used_blocks: raw.used_blocks,
    };

    host.seek(file, V1HeaderRaw::SIZE as i64, Whence::Absolute)?;
    let mut bits = host.allocate(header.total_blocks as usize)?;
    if let Err(e) = host.read_exact(file, &mut bits) {
        host.free(bits);
        return Err(remap_short_read(e));
    }
    for b in bits.iter_mut() {
        // Only the byte value 1 means captured; everything else
        // (including values > 1, which the on-disk bitmap is not guaranteed
        // to avoid) is treated as not captured.
        if *b != 1 {
            *b = 0;
        }
    }

    let mut trailer = [0u8; TRAILER_LEN as usize];
    if let Err(e) = host.read_exact(file, &mut trailer) {
        host.free(bits);
        return Err(remap_short_read(e));
    }
    if &trailer != TRAILER_MAGIC {
        host.free(bits);
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "v1 bitmap trailer magic mismatch",
        ));
    }

    let expected_device_size = header.total_blocks * header.block_size as u64;
    if header.device_size != expected_device_size {
        header.device_size = expected_device_size;
    }

    let bitmap = Bitmap::from_expanded(bits, crate::bitmap::DEFAULT_FACTOR);
    Ok((header, bitmap))
}

fn verify_v2<H: HostServices>(host: &H, file: &mut H::File) -> io::Result<(LogicalHeader, Bitmap)> {
    let raw: V2HeaderRaw = read_struct(host, file, V2HeaderRaw::SIZE)?;
    let tag = HeaderTag {
        magic: raw.magic,
        version: raw.version,
    };
    if !tag.magic_ok() {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad v2 image magic"));
    }

    let bitmap_size = raw.total_blocks.div_ceil(8);
    let mut header = LogicalHeader {
        block_size: raw.block_size,
        total_blocks: raw.total_blocks,
        device_size: raw.device_size,
        checksum_size: raw.checksum_size as u64,
        blocks_per_checksum: raw.blocks_per_checksum as u64,
        header_size: V2HeaderRaw::SIZE + bitmap_size + CRC_SIZE,
        used_blocks: raw.used_blocks,
    };

    host.seek(file, V2HeaderRaw::SIZE as i64, Whence::Absolute)?;
    let mut packed = host.allocate((bitmap_size + CRC_SIZE) as usize)?;
    if let Err(e) = host.read_exact(file, &mut packed) {
        host.free(packed);
        return Err(remap_short_read(e));
    }

    let (packed_bitmap, stored_crc_bytes) = packed.split_at(bitmap_size as usize);
    let stored_crc = u32::from_le_bytes(stored_crc_bytes.try_into().unwrap());
    if bitmap_checksum(packed_bitmap) != stored_crc {
        host.free(packed);
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "v2 bitmap checksum mismatch",
        ));
    }

    let mut bits = match host.allocate(header.total_blocks as usize) {
        Ok(bits) => bits,
        Err(e) => {
            host.free(packed);
            return Err(e);
        }
    };
    for i in 0..header.total_blocks as usize {
        bits[i] = if packed_bitmap[i >> 3] & (1 << (i & 7)) != 0 { 1 } else { 0 };
    }
    host.free(packed);

    let expected_device_size = header.total_blocks * header.block_size as u64;
    if header.device_size != expected_device_size {
        header.device_size = expected_device_size;
    }

    let bitmap = Bitmap::from_expanded(bits, crate::bitmap::DEFAULT_FACTOR);
    Ok((header, bitmap))
}
