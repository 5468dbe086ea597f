//! Archive-level and repack-input data model: `TarEntry` and `Delta`.

use camino::Utf8PathBuf;
use indexmap::IndexMap;

/// The tar typeflags the engine understands. Any other typeflag byte fails
/// with `UnsupportedTypeflag`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeFlag {
    Regular,
    Directory,
    Symlink,
    Hardlink,
    CharDevice,
    BlockDevice,
    Fifo,
}

impl TypeFlag {
    pub fn from_tar(entry_type: tar::EntryType) -> Option<Self> {
        Some(match entry_type {
            tar::EntryType::Regular | tar::EntryType::Continuous => TypeFlag::Regular,
            tar::EntryType::Directory => TypeFlag::Directory,
            tar::EntryType::Symlink => TypeFlag::Symlink,
            tar::EntryType::Link => TypeFlag::Hardlink,
            tar::EntryType::Char => TypeFlag::CharDevice,
            tar::EntryType::Block => TypeFlag::BlockDevice,
            tar::EntryType::Fifo => TypeFlag::Fifo,
            _ => return None,
        })
    }

    pub fn to_tar(self) -> tar::EntryType {
        match self {
            TypeFlag::Regular => tar::EntryType::Regular,
            TypeFlag::Directory => tar::EntryType::Directory,
            TypeFlag::Symlink => tar::EntryType::Symlink,
            TypeFlag::Hardlink => tar::EntryType::Link,
            TypeFlag::CharDevice => tar::EntryType::Char,
            TypeFlag::BlockDevice => tar::EntryType::Block,
            TypeFlag::Fifo => tar::EntryType::Fifo,
        }
    }
}

/// A single archive-level record. The xattr association is an ordered map:
/// callers must not rely on iteration order being meaningful, but duplicate
/// names are rejected by construction (an `IndexMap` insert overwrites, it
/// never duplicates).
#[derive(Debug, Clone)]
pub struct TarEntry {
    pub name: Utf8PathBuf,
    pub typeflag: TypeFlag,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub linkname: Option<Utf8PathBuf>,
    pub mtime: i64,
    pub atime: i64,
    pub devmajor: u32,
    pub devminor: u32,
    pub xattrs: IndexMap<String, Vec<u8>>,
}

/// What changed at a path, as reported by an external mtree-like comparator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaKind {
    Modified,
    Added,
    Missing,
}

/// A single path delta, the unit of input to the generator.
#[derive(Debug, Clone)]
pub struct Delta {
    pub path: Utf8PathBuf,
    pub kind: DeltaKind,
}

/// Sort deltas lexicographically by path, the order `GenerateLayer` requires
/// so that whiteouts precede replacements at the same ancestor.
pub fn sort_deltas(deltas: &mut [Delta]) {
    deltas.sort_by(|a, b| a.path.as_str().cmp(b.path.as_str()));
}

