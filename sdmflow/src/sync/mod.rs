//! Synchronization of batch outputs to durable storage.

mod accounting;
mod archive;
mod exclude;
mod mirror;
mod scratch;

pub use accounting::record_accounting;
pub use archive::{ArchiveReport, ArchiveSettings, Archiver};
pub use exclude::ExcludeList;
pub use mirror::{LocalMirror, Mirror, MirrorError, MirrorStats, RsyncMirror};
pub use scratch::clear_subtree;
