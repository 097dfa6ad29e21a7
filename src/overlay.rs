//! The change-file overlay collaborator. The engine only ever talks to an
//! [`Overlay`] implementation, never to a concrete file format — the
//! overlay's own on-disk layout is deliberately left out of the engine
//! proper. [`SimpleOverlay`] is the reference implementation shipped so this
//! crate is runnable and testable end to end; a production deployment is
//! free to substitute its own `Overlay` impl over whatever change-file
//! format it already has.

use std::io;
use std::path::Path;

use crate::host::HostServices;

/// The overlay capability set, mirroring `changefile.h`'s `cf_init` /
/// `cf_create` / `cf_verify` / `cf_seek` / `cf_readblock` / `cf_writeblock` /
/// `cf_blockused` / `cf_sync` / `cf_finish`.
pub trait Overlay<H: HostServices>: Sized {
    /// Open an existing overlay file.
    fn init(host: &H, path: &Path, block_size: u32, total_blocks: u64) -> io::Result<Self>;

    /// Create a new, empty overlay file.
    fn create(host: &H, path: &Path, block_size: u32, total_blocks: u64) -> io::Result<Self>;

    fn verify(&mut self, host: &H) -> io::Result<()>;

    fn seek(&mut self, host: &H, block: u64) -> io::Result<()>;

    /// Returns `ErrorKind::NotFound` if `block` has no overlay entry, so the
    /// version handler's "try overlay, fall through to base image" logic
    /// works unchanged.
    fn read_block(&mut self, host: &H, buf: &mut [u8]) -> io::Result<()>;

    fn write_block(&mut self, host: &H, buf: &[u8]) -> io::Result<()>;

    /// Whether the block last sought to has an overlay entry.
    fn block_used(&self) -> bool;

    fn sync(&mut self, host: &H) -> io::Result<()>;

    fn finish(self, host: &H) -> io::Result<()>;
}

const OVERLAY_MAGIC: &[u8; 8] = b"PCOVRLY1";
const OVERLAY_MAGIC_LEN: u64 = 8;
// magic + block_size(u32) + total_blocks(u64)
const OVERLAY_HEADER_LEN: u64 = OVERLAY_MAGIC_LEN + 4 + 8;

/// Reference `Overlay` implementation: an 8-byte magic, a `u32` block size,
/// a `u64` block count, a byte-per-block presence bitmap (reusing the main
/// image's v1 bitmap convention for internal consistency), then sparse
/// per-block storage.
pub struct SimpleOverlay<H: HostServices> {
    file: H::File,
    block_size: u32,
    total_blocks: u64,
    present: Vec<u8>,
    cursor: u64,
}

impl<H: HostServices> SimpleOverlay<H> {
    fn bitmap_offset() -> u64 {
        OVERLAY_HEADER_LEN
    }

    fn data_offset(&self, block: u64) -> u64 {
        OVERLAY_HEADER_LEN + self.total_blocks + block * self.block_size as u64
    }

    fn write_header(host: &H, file: &mut H::File, block_size: u32, total_blocks: u64) -> io::Result<()> {
        host.seek(file, 0, crate::host::Whence::Absolute)?;
        host.write_all(file, OVERLAY_MAGIC)?;
        host.write_all(file, &block_size.to_le_bytes())?;
        host.write_all(file, &total_blocks.to_le_bytes())?;
        host.write_all(file, &vec![0u8; total_blocks as usize])?;
        Ok(())
    }
}

impl<H: HostServices> Overlay<H> for SimpleOverlay<H> {
    fn init(host: &H, path: &Path, block_size: u32, total_blocks: u64) -> io::Result<Self> {
        let mut file = host.open(path, crate::host::OpenMode::ReadWrite)?;

        let header_ok = (|| -> io::Result<bool> {
            let mut tag = [0u8; OVERLAY_MAGIC_LEN as usize];
            host.seek(&mut file, 0, crate::host::Whence::Absolute)?;
            host.read_exact(&mut file, &mut tag)?;
            if &tag != OVERLAY_MAGIC {
                return Ok(false);
            }
            let mut size_buf = [0u8; 4];
            host.read_exact(&mut file, &mut size_buf)?;
            let mut count_buf = [0u8; 8];
            host.read_exact(&mut file, &mut count_buf)?;
            let on_disk_block_size = u32::from_le_bytes(size_buf);
            let on_disk_total_blocks = u64::from_le_bytes(count_buf);
            Ok(on_disk_block_size == block_size && on_disk_total_blocks == total_blocks)
        })();

        let header_ok = match header_ok {
            Ok(ok) => ok,
            Err(e) => {
                let _ = host.close(file);
                return Err(e);
            }
        };
        if !header_ok {
            let _ = host.close(file);
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "overlay magic or geometry does not match image",
            ));
        }

        let mut present = match host.allocate(total_blocks as usize) {
            Ok(buf) => buf,
            Err(e) => {
                let _ = host.close(file);
                return Err(e);
            }
        };
        if let Err(e) = host.read_exact(&mut file, &mut present) {
            host.free(present);
            let _ = host.close(file);
            return Err(e);
        }
        Ok(SimpleOverlay {
            file,
            block_size,
            total_blocks,
            present,
            cursor: 0,
        })
    }

    fn create(host: &H, path: &Path, block_size: u32, total_blocks: u64) -> io::Result<Self> {
        let mut file = host.open(path, crate::host::OpenMode::ReadWriteCreate)?;
        if let Err(e) = Self::write_header(host, &mut file, block_size, total_blocks) {
            let _ = host.close(file);
            return Err(e);
        }
        let present = match host.allocate(total_blocks as usize) {
            Ok(buf) => buf,
            Err(e) => {
                let _ = host.close(file);
                return Err(e);
            }
        };
        Ok(SimpleOverlay {
            file,
            block_size,
            total_blocks,
            present,
            cursor: 0,
        })
    }

    fn verify(&mut self, _host: &H) -> io::Result<()> {
        // Presence bitmap is already loaded by `init`/`create`; nothing
        // further to validate for the reference format.
        Ok(())
    }

    fn seek(&mut self, host: &H, block: u64) -> io::Result<()> {
        if block >= self.total_blocks {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }
        self.cursor = block;
        let offset = self.data_offset(block) as i64;
        host.seek(&mut self.file, offset, crate::host::Whence::Absolute)?;
        Ok(())
    }

    fn read_block(&mut self, host: &H, buf: &mut [u8]) -> io::Result<()> {
        if self.present[self.cursor as usize] != 1 {
            return Err(io::Error::from(io::ErrorKind::NotFound));
        }
        let offset = self.data_offset(self.cursor) as i64;
        host.seek(&mut self.file, offset, crate::host::Whence::Absolute)?;
        host.read_exact(&mut self.file, buf)
    }

    fn write_block(&mut self, host: &H, buf: &[u8]) -> io::Result<()> {
        let offset = self.data_offset(self.cursor) as i64;
        host.seek(&mut self.file, offset, crate::host::Whence::Absolute)?;
        host.write_all(&mut self.file, buf)?;
        self.present[self.cursor as usize] = 1;
        host.seek(
            &mut self.file,
            (Self::bitmap_offset() + self.cursor) as i64,
            crate::host::Whence::Absolute,
        )?;
        host.write_all(&mut self.file, &[1u8])?;
        Ok(())
    }

    fn block_used(&self) -> bool {
        self.present[self.cursor as usize] == 1
    }

    fn sync(&mut self, _host: &H) -> io::Result<()> {
        // The host-services capability set has no explicit flush
        // primitive; `write`/`write_all` already go straight to the host,
        // so there is nothing further to do here for the reference format.
        Ok(())
    }

    fn finish(self, host: &H) -> io::Result<()> {
        host.free(self.present);
        host.close(self.file)
    }
}
