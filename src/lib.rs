//! Random-access reader and change-file overlay writer for partclone-style
//! partition-clone images.
//!
//! An image stores only the blocks its source filesystem reported as used,
//! alongside a bitmap recording which logical block is which. This crate
//! opens such an image, reconciles its header (v1's unpacked
//! byte-per-block bitmap and trailer, or v2's packed bitmap and CRC-32
//! checksum) into a single logical view, and serves random-access reads
//! over it. Writes never touch the base image: they land in a companion
//! change-file overlay, which also takes precedence over the base image on
//! read.
//!
//! The engine never touches a filesystem or the global allocator directly;
//! every such operation goes through the [`host::HostServices`] trait,
//! which is what lets the same code run against a real file
//! ([`host::StdHost`]) or an in-memory harness ([`host::MockHost`]).

pub mod bitmap;
pub mod context;
pub mod crc;
pub mod header;
pub mod host;
pub mod overlay;
pub mod registry;
pub mod version;

pub use context::{ImageContext, StateFlags, TELL_INVALID};
pub use header::LogicalHeader;
pub use host::{HostServices, MockHost, OpenMode, StdHost, Whence};
pub use overlay::{Overlay, SimpleOverlay};
pub use registry::{descriptor, ImageTypeDescriptor};
pub use version::FormatVersion;
