//! OCI container image layer engine: translates between tar-based layer
//! archives (with OCI and overlayfs whiteout conventions) and an expanded
//! on-disk directory tree.

pub mod entry;
pub mod error;
pub mod format;
pub mod idmap;
pub mod path;
pub mod pipe;
pub mod repack;
pub mod unpack;
pub mod whiteout;
pub mod xattrfilter;

pub use entry::{Delta, DeltaKind, TarEntry, TypeFlag};
pub use error::{Error, IdKind, Result};
pub use format::{MapOptions, OnDiskFormat, OverlayNamespace};
pub use idmap::IdMap;
pub use repack::{Generator, RepackOptions, spawn_generate_layer};
pub use unpack::{Extractor, UnpackOptions};
pub use xattrfilter::Registry;
