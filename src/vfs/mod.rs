//! Files for the sandboxed toolchain
//!
//! There is no host filesystem behind the toolchain. Files live inside the
//! memfs module's memory; the host fills it from a ustar image and reads
//! results back out through the [`bridge::Bridge`].

pub mod archive;
pub mod bridge;

pub use archive::{Archive, ArchiveEntry, ArchiveError, ArchiveWriter, EntryKind};
pub use bridge::{Bridge, OutputListener, SharedBridge};
