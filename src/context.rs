//! The image handle and its public API: lifecycle
//! open -> verify -> read/write/sync -> close, a flag-guarded state
//! machine, and the per-block operations callers invoke.

use std::io;
use std::path::{Path, PathBuf};

use bitflags::bitflags;

use crate::crc::V1CrcTable;
use crate::header::LogicalHeader;
use crate::host::{HostServices, OpenMode, Whence};
use crate::overlay::{Overlay, SimpleOverlay};
use crate::version::FormatVersion;

bitflags! {
    /// Mirrors the `PC_*` flag word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StateFlags: u32 {
        const OPEN                = 1 << 0;
        const OVERLAY_OPEN        = 1 << 1;
        const VERIFIED            = 1 << 2;
        const HEAD_VALID          = 1 << 3;
        const VERSION_INIT        = 1 << 4;
        const HAS_OVERLAY_HANDLE  = 1 << 5;
        const HAS_OVERLAY_PATH    = 1 << 6;
        const HAS_BASE_PATH       = 1 << 7;
        const HAS_SCRATCH         = 1 << 8;
        const OVERLAY_VERIFIED    = 1 << 9;
        const TOLERANT            = 1 << 10;
        const READ_ONLY           = 1 << 11;
    }
}

/// Format-agnostic, per-image state shared by every version handler: the
/// expanded bitmap, the v1 CRC table (always precomputed at init; see
/// `crc::v1_crc32`'s doc comment), and the running count of captured blocks
/// preceding the cursor.
pub(crate) struct FormatState {
    pub bitmap: crate::bitmap::Bitmap,
    #[allow(dead_code)] // carried for on-disk compatibility, not consulted by this engine
    pub crc_table: V1CrcTable,
    pub nvbcount: u64,
}

/// An open partclone-style image. Generic over the host-services capability
/// (`H`) and over the overlay collaborator (`O`), which defaults to the
/// bundled reference implementation.
pub struct ImageContext<H: HostServices, O: Overlay<H> = SimpleOverlay<H>> {
    host: H,
    base_file: Option<H::File>,
    base_path: Option<PathBuf>,
    overlay_path: Option<PathBuf>,
    overlay: Option<O>,
    mode: OpenMode,
    cursor: u64,
    header: Option<LogicalHeader>,
    version: Option<FormatVersion>,
    format_state: Option<FormatState>,
    scratch: Option<Vec<u8>>,
    flags: StateFlags,
}

/// Sentinel `tell()` returns when the context is not read-ready, matching
/// `partclone_tell`'s `~0`.
pub const TELL_INVALID: u64 = u64::MAX;

fn invalid_state() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, "image handle is not in the required state")
}

impl<H: HostServices, O: Overlay<H>> ImageContext<H, O> {
    fn read_ready(&self) -> bool {
        self.flags.contains(
            StateFlags::OPEN | StateFlags::VERIFIED | StateFlags::HEAD_VALID | StateFlags::VERSION_INIT,
        )
    }

    fn write_ready(&self) -> bool {
        self.read_ready()
            && self.flags.contains(StateFlags::HAS_OVERLAY_HANDLE | StateFlags::OVERLAY_VERIFIED)
            && !self.flags.contains(StateFlags::READ_ONLY)
    }

    /// Open the base image read-only and remember the (optional) overlay
    /// path. Mirrors `partclone_open`.
    pub fn open(host: H, path: impl AsRef<Path>, overlay_path: Option<PathBuf>, mode: OpenMode) -> io::Result<Self> {
        let path = path.as_ref();
        log::debug!("opening image {path:?} mode={mode:?}");
        let base_file = host.open(path, OpenMode::ReadOnly)?;

        let mut flags = StateFlags::OPEN | StateFlags::HAS_BASE_PATH;
        if overlay_path.is_some() {
            flags |= StateFlags::HAS_OVERLAY_PATH;
        }

        Ok(ImageContext {
            host,
            base_file: Some(base_file),
            base_path: Some(path.to_path_buf()),
            overlay_path,
            overlay: None,
            mode,
            cursor: 0,
            header: None,
            version: None,
            format_state: None,
            scratch: None,
            flags,
        })
    }

    /// Request best-effort behavior on a corrupt image. Recorded but does
    /// not currently change engine policy.
    pub fn tolerant(&mut self) {
        if self.flags.contains(StateFlags::OPEN) {
            self.flags |= StateFlags::TOLERANT;
        }
    }

    /// Read the header, pick a version handler, materialize the bitmap and
    /// prefix-sum index, and open or defer the overlay. Mirrors
    /// `partclone_verify` plus the version table's `init`/`verify`.
    pub fn verify(&mut self) -> io::Result<()> {
        if !self.flags.contains(StateFlags::OPEN) {
            return Err(invalid_state());
        }
        let file = self.base_file.as_mut().ok_or_else(invalid_state)?;

        let tag: crate::header::HeaderTag = {
            self.host.seek(file, 0, Whence::Absolute)?;
            let mut buf = vec![0u8; crate::header::HeaderTag::SIZE as usize];
            self.host.read_exact(file, &mut buf).map_err(|e| {
                if e.kind() == io::ErrorKind::UnexpectedEof {
                    io::Error::new(io::ErrorKind::InvalidData, "image truncated in header region")
                } else {
                    e
                }
            })?;
            let mut cursor = std::io::Cursor::new(buf);
            <crate::header::HeaderTag as binrw::BinRead>::read_le(&mut cursor)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
        };

        let version = FormatVersion::lookup(&tag.version)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unrecognized image version"))?;

        // version-init: precompute the v1 CRC table.
        let crc_table = V1CrcTable::new();
        self.flags |= StateFlags::VERSION_INIT;
        if !self.mode.allows_write() {
            self.flags |= StateFlags::READ_ONLY;
        }

        let (header, bitmap) = version.verify(&self.host, file)?;

        let scratch = self.host.allocate(header.block_size as usize)?;
        self.flags |= StateFlags::HAS_SCRATCH;

        self.version = Some(version);
        self.format_state = Some(FormatState {
            bitmap,
            crc_table,
            nvbcount: 0,
        });
        self.scratch = Some(scratch);
        self.flags |= StateFlags::VERIFIED | StateFlags::HEAD_VALID;
        self.cursor = 0;

        if let (Some(overlay_path), true) = (self.overlay_path.clone(), self.mode.allows_write()) {
            if let Ok(mut overlay) = O::init(&self.host, &overlay_path, header.block_size, header.total_blocks) {
                if overlay.verify(&self.host).is_ok() {
                    self.overlay = Some(overlay);
                    self.flags |= StateFlags::OVERLAY_OPEN | StateFlags::HAS_OVERLAY_HANDLE | StateFlags::OVERLAY_VERIFIED;
                }
            }
        }

        self.header = Some(header);
        log::debug!("verified image version={version:?}");
        Ok(())
    }

    pub fn block_size(&self) -> Option<u32> {
        if self.flags.contains(StateFlags::VERIFIED) {
            self.header.as_ref().map(|h| h.block_size)
        } else {
            None
        }
    }

    pub fn block_count(&self) -> Option<u64> {
        if self.flags.contains(StateFlags::VERIFIED) {
            self.header.as_ref().map(|h| h.total_blocks)
        } else {
            None
        }
    }

    /// Which on-disk format this image verified against.
    pub fn version(&self) -> Option<FormatVersion> {
        self.version
    }

    /// Seek to logical block `block`. `block == total_blocks` is accepted as
    /// the EOF cursor; anything past that is out of range.
    pub fn seek(&mut self, block: u64) -> io::Result<()> {
        if !self.read_ready() {
            return Err(invalid_state());
        }
        let total_blocks = self.header.as_ref().unwrap().total_blocks;
        if block > total_blocks {
            return Err(invalid_state());
        }

        let state = self.format_state.as_mut().unwrap();
        state.nvbcount = state.bitmap.captured_in_prefix(block);

        if let Some(overlay) = self.overlay.as_mut() {
            if block < total_blocks {
                overlay.seek(&self.host, block)?;
            }
        }

        self.cursor = block;
        Ok(())
    }

    pub fn tell(&self) -> u64 {
        if self.read_ready() {
            self.cursor
        } else {
            TELL_INVALID
        }
    }

    fn read_one_block(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let cursor = self.cursor;
        let total_blocks = self.header.as_ref().unwrap().total_blocks;

        // `nvbcount` tracks how many captured blocks precede the cursor in
        // the base file's data region, which is laid out as one stored
        // chunk per captured block, in logical-block order, with no gaps
        // for blocks the overlay happens to shadow. It therefore must
        // advance here whenever the block is captured, even on an overlay
        // hit, not only on an actual base-file read as the original engine
        // does it (see the `context.rs` entry in DESIGN.md: advancing only
        // on a base-file read desyncs every later offset once a captured
        // block is overlay-shadowed mid-scan).
        let captured = self.format_state.as_ref().unwrap().bitmap.is_captured(cursor);

        let overlay_hit = if let Some(overlay) = self.overlay.as_mut() {
            cursor < total_blocks
                && overlay.seek(&self.host, cursor).is_ok()
                && overlay.read_block(&self.host, buf).is_ok()
        } else {
            false
        };

        if !captured {
            if !overlay_hit {
                let scratch = self.scratch.as_ref().unwrap();
                buf.copy_from_slice(scratch);
            }
            return Ok(());
        }

        let header = self.header.as_ref().unwrap();
        let state = self.format_state.as_mut().unwrap();
        let offset = header.rblock2offset(state.nvbcount);
        state.nvbcount += 1;
        if overlay_hit {
            return Ok(());
        }
        let file = self.base_file.as_mut().unwrap();
        self.host.seek(file, offset as i64, Whence::Absolute)?;
        self.host.read_exact(file, buf)?;
        Ok(())
    }

    /// Read `nblocks` blocks from the current position into `buf`
    /// (`nblocks * block_size` bytes). Advances the cursor once per
    /// successfully-read block, even on eventual failure, so a caller can
    /// retry starting at the failing block.
    pub fn read_blocks(&mut self, buf: &mut [u8], nblocks: u64) -> io::Result<()> {
        if !self.read_ready() {
            return Err(invalid_state());
        }
        let block_size = self.header.as_ref().unwrap().block_size as usize;
        for i in 0..nblocks as usize {
            let chunk = &mut buf[i * block_size..(i + 1) * block_size];
            self.read_one_block(chunk)?;
            self.cursor += 1;
        }
        Ok(())
    }

    /// Is the block at the cursor used (captured in the base image, or
    /// present in the overlay)?
    pub fn block_used(&mut self) -> io::Result<bool> {
        if !self.read_ready() {
            return Err(invalid_state());
        }
        let cursor = self.cursor;
        let total_blocks = self.header.as_ref().unwrap().total_blocks;
        if let Some(overlay) = self.overlay.as_mut() {
            if cursor < total_blocks && overlay.seek(&self.host, cursor).is_ok() && overlay.block_used() {
                return Ok(true);
            }
        }
        if cursor >= total_blocks {
            return Ok(false);
        }
        Ok(self.format_state.as_ref().unwrap().bitmap.is_captured(cursor))
    }

    fn ensure_overlay(&mut self) -> io::Result<()> {
        if self.write_ready() {
            return Ok(());
        }
        let header = self.header.as_ref().ok_or_else(invalid_state)?;
        if self.overlay_path.is_none() {
            let base = self.base_path.as_ref().ok_or_else(invalid_state)?;
            let mut synthesized = base.clone().into_os_string();
            synthesized.push(".cf");
            self.overlay_path = Some(PathBuf::from(synthesized));
            self.flags |= StateFlags::HAS_OVERLAY_PATH;
        }
        let overlay_path = self.overlay_path.clone().unwrap();
        let overlay = O::create(&self.host, &overlay_path, header.block_size, header.total_blocks)?;
        self.overlay = Some(overlay);
        self.flags |= StateFlags::HAS_OVERLAY_HANDLE | StateFlags::OVERLAY_VERIFIED | StateFlags::OVERLAY_OPEN;
        Ok(())
    }

    /// Write `nblocks` blocks from `buf` at the current position, redirected
    /// to the overlay. Synthesizes *basepath* + ".cf" and creates the
    /// overlay on first write if none was supplied.
    pub fn write_blocks(&mut self, buf: &[u8], nblocks: u64) -> io::Result<()> {
        if !self.read_ready() || self.flags.contains(StateFlags::READ_ONLY) {
            return Err(invalid_state());
        }
        let block_size = self.header.as_ref().unwrap().block_size as usize;
        for i in 0..nblocks as usize {
            self.ensure_overlay()?;
            let chunk = &buf[i * block_size..(i + 1) * block_size];
            let cursor = self.cursor;
            let overlay = self.overlay.as_mut().unwrap();
            overlay.seek(&self.host, cursor)?;
            overlay.write_block(&self.host, chunk)?;
            self.cursor += 1;
        }
        Ok(())
    }

    pub fn sync(&mut self) -> io::Result<()> {
        if !self.write_ready() {
            return Err(invalid_state());
        }
        self.overlay.as_mut().unwrap().sync(&self.host)
    }

    /// Release everything regardless of which lifecycle stage failed.
    /// Always best-effort: individual release steps that fail are ignored
    /// so later steps still run.
    pub fn close(mut self) -> io::Result<()> {
        if self.flags.contains(StateFlags::OVERLAY_OPEN) {
            let _ = self.sync();
        }
        if let Some(overlay) = self.overlay.take() {
            let _ = overlay.finish(&self.host);
        }
        if let Some(file) = self.base_file.take() {
            let _ = self.host.close(file);
        }
        if let Some(scratch) = self.scratch.take() {
            self.host.free(scratch);
        }
        if let Some(state) = self.format_state.take() {
            self.host.free(state.bitmap.into_raw_bytes());
        }
        Ok(())
    }

    /// Open, verify, and close `path`, returning verify's result. Mirrors
    /// `partclone_probe`.
    pub fn probe(host: H, path: impl AsRef<Path>) -> io::Result<()> {
        let mut ctx: ImageContext<H, O> = ImageContext::open(host, path, None, OpenMode::ReadOnly)?;
        let result = ctx.verify();
        let _ = ctx.close();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{IMAGE_MAGIC, TRAILER_MAGIC, VERSION_V1};
    use crate::host::MockHost;

    /// Builds a v1 image whose captured-block chunks are filled with
    /// caller-chosen, distinguishable bytes (one fill value per stored
    /// chunk, in storage order) rather than a value derived from the
    /// block's own index — needed to tell apart "read the right chunk"
    /// from "read *a* chunk that happens to look plausible".
    fn v1_bytes(total_blocks: u64, block_size: u32, bits: &[u8], chunk_fill: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(IMAGE_MAGIC);
        buf.extend_from_slice(&VERSION_V1);
        buf.extend_from_slice(&block_size.to_le_bytes());
        buf.extend_from_slice(&(total_blocks * block_size as u64).to_le_bytes());
        buf.extend_from_slice(&total_blocks.to_le_bytes());
        let used = bits.iter().filter(|&&b| b == 1).count() as u64;
        buf.extend_from_slice(&used.to_le_bytes());
        buf.extend_from_slice(bits);
        buf.extend_from_slice(TRAILER_MAGIC);
        assert_eq!(chunk_fill.len() as u64, used, "one fill byte per captured block");
        for &fill in chunk_fill {
            buf.extend(std::iter::repeat(fill).take(block_size as usize));
        }
        buf
    }

    #[test]
    fn tell_is_invalid_before_verify() {
        let host = MockHost::new();
        let path = Path::new("/img.v1");
        host.seed(path, v1_bytes(2, 8, &[1, 0], &[0xAA]));

        let ctx: ImageContext<&MockHost> = ImageContext::open(&host, path, None, OpenMode::ReadOnly).unwrap();
        assert_eq!(ctx.tell(), TELL_INVALID);
        ctx.close().unwrap();
    }

    #[test]
    fn seek_accepts_eof_cursor_and_rejects_past_it() {
        let host = MockHost::new();
        let path = Path::new("/img.v1");
        let bits = [1u8, 0, 1, 1];
        host.seed(path, v1_bytes(4, 8, &bits, &[0xAA, 0xBB, 0xCC]));

        let mut ctx: ImageContext<&MockHost> = ImageContext::open(&host, path, None, OpenMode::ReadOnly).unwrap();
        ctx.verify().unwrap();

        ctx.seek(4).unwrap();
        assert_eq!(ctx.tell(), 4);

        let err = ctx.seek(5).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        ctx.close().unwrap();
    }

    #[test]
    fn block_used_at_eof_cursor_does_not_panic() {
        let host = MockHost::new();
        let path = Path::new("/img.v1");
        let bits = [1u8, 0];
        host.seed(path, v1_bytes(2, 8, &bits, &[0xAA]));

        let mut ctx: ImageContext<&MockHost> = ImageContext::open(&host, path, None, OpenMode::ReadOnly).unwrap();
        ctx.verify().unwrap();

        ctx.seek(2).unwrap();
        assert!(!ctx.block_used().unwrap());

        ctx.close().unwrap();
    }

    #[test]
    fn nvbcount_survives_an_overlay_shadowed_captured_block() {
        let host = MockHost::new();
        let path = Path::new("/img.nvb");
        let bits = [1u8, 1, 0, 1];
        host.seed(path, v1_bytes(4, 8, &bits, &[0xAA, 0xBB, 0xCC]));

        let mut ctx: ImageContext<&MockHost> = ImageContext::open(&host, path, None, OpenMode::ReadWrite).unwrap();
        ctx.verify().unwrap();

        ctx.seek(1).unwrap();
        ctx.write_blocks(&[0xDDu8; 8], 1).unwrap();

        ctx.seek(0).unwrap();
        let mut buf = vec![0u8; 8 * 4];
        ctx.read_blocks(&mut buf, 4).unwrap();

        assert_eq!(&buf[0..8], &[0xAAu8; 8][..], "block 0 reads its own base chunk");
        assert_eq!(&buf[8..16], &[0xDDu8; 8][..], "block 1 reads the overlay value");
        assert_eq!(&buf[16..24], &[0u8; 8][..], "block 2 is not captured");
        assert_eq!(
            &buf[24..32],
            &[0xCCu8; 8][..],
            "block 3 must land on the third stored chunk, not the second"
        );

        ctx.close().unwrap();
    }

    #[test]
    fn write_sync_close_reopen_round_trips_through_public_api() {
        let host = MockHost::new();
        let path = Path::new("/img.v1");
        let overlay_path = PathBuf::from("/img.v1.cf");
        let bits = [1u8, 0, 1, 1];
        host.seed(path, v1_bytes(4, 8, &bits, &[0xAA, 0xBB, 0xCC]));

        {
            let mut ctx: ImageContext<&MockHost> =
                ImageContext::open(&host, path, None, OpenMode::ReadWrite).unwrap();
            ctx.verify().unwrap();
            ctx.seek(1).unwrap();
            ctx.write_blocks(&[0x42u8; 8], 1).unwrap();
            ctx.sync().unwrap();
            ctx.close().unwrap();
        }

        {
            let mut ctx: ImageContext<&MockHost> =
                ImageContext::open(&host, path, Some(overlay_path), OpenMode::ReadWrite).unwrap();
            ctx.verify().unwrap();
            ctx.seek(1).unwrap();
            let mut buf = vec![0u8; 8];
            ctx.read_blocks(&mut buf, 1).unwrap();
            assert_eq!(buf, vec![0x42u8; 8]);
            ctx.close().unwrap();
        }
    }
}
