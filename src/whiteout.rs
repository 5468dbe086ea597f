//! C4: whiteout codec. Classifies an on-disk inode as plain/opaque/not-a-
//! whiteout, and synthesizes overlayfs-style whiteouts during unpack.

use camino::Utf8Path;
use cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use rustix::fd::AsFd;
use rustix::fs::{Mode, makedev};

use crate::error::{Error, Result};
use crate::format::{OnDiskFormat, OverlayNamespace};

/// Prefix marking an OCI-layer whiteout marker file.
pub const WH_PREFIX: &str = ".wh.";
/// The OCI-layer opaque-whiteout marker name.
pub const WH_OPAQUE: &str = ".wh..wh..opq";
/// The overlayfs xattr name (sans namespace) recording an opaque directory.
const OPAQUE_XATTR_SUFFIX: &str = "overlay.opaque";
/// The overlayfs xattr name (sans namespace) recording a xattr-style
/// whiteout on a zero-length regular file.
const WHITEOUT_XATTR_SUFFIX: &str = "overlay.whiteout";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhiteoutKind {
    Plain,
    Opaque,
}

/// Treat `ENODATA`/`ENOTSUP` while probing a xattr as "not present" rather
/// than a hard error, per the classification rule.
fn getxattr_tolerant(dir: &Dir, path: &str, name: &str) -> Result<Option<Vec<u8>>> {
    match dir.getxattr(path, name) {
        Ok(v) => Ok(v),
        Err(e) => match e.raw_os_error() {
            Some(libc::ENODATA) | Some(libc::EOPNOTSUPP) => Ok(None),
            _ => Err(Error::io(path, e)),
        },
    }
}

/// Classify the inode at `path` (relative to `dir`) as a whiteout, in
/// `OverlayfsRootfs` mode. `path` must already have been `lstat`-ed by the
/// caller into `meta` to avoid a second syscall for the common case.
pub fn classify(
    dir: &Dir,
    path: &str,
    meta: &std::fs::Metadata,
    fmt: &OnDiskFormat,
) -> Result<Option<WhiteoutKind>> {
    use std::os::unix::fs::{FileTypeExt, MetadataExt};

    let Some(namespace) = fmt.overlay_namespace() else {
        return Ok(None);
    };
    let ns = namespace.prefix();

    if meta.file_type().is_char_device() && meta.rdev() == 0 {
        return Ok(Some(WhiteoutKind::Plain));
    }

    if meta.is_dir() {
        let opaque = getxattr_tolerant(dir, path, &format!("{ns}{OPAQUE_XATTR_SUFFIX}"))?;
        if opaque.as_deref() == Some(b"y") {
            return Ok(Some(WhiteoutKind::Opaque));
        }
        return Ok(None);
    }

    if meta.is_file() && meta.len() == 0 {
        let wh = getxattr_tolerant(dir, path, &format!("{ns}{WHITEOUT_XATTR_SUFFIX}"))?;
        if wh.is_some() {
            return Ok(Some(WhiteoutKind::Plain));
        }
    }

    Ok(None)
}

/// Synthesize a plain overlayfs whiteout (a char(0,0) device node) at
/// `dir_fd`/`name`, removing any existing entry there first.
pub fn synthesize_plain(dir_fd: &Dir, name: &str) -> Result<()> {
    if dir_fd.symlink_metadata(name).is_ok() {
        remove_any(dir_fd, name)?;
    }

    rustix::fs::mknodat(
        dir_fd.as_fd(),
        name,
        rustix::fs::FileType::CharacterDevice,
        Mode::from_raw_mode(0o666),
        makedev(0, 0),
    )
    .map_err(|e| Error::io(name, e.into()))
}

/// Mark `dir_fd` (the directory itself, already resolved and created) as an
/// opaque whiteout by setting the overlay opaque xattr. Does not touch the
/// directory's children.
pub fn synthesize_opaque(dir_fd: &Dir, dir_name: &str, namespace: OverlayNamespace) -> Result<()> {
    let key = format!("{}{OPAQUE_XATTR_SUFFIX}", namespace.prefix());
    dir_fd
        .setxattr(dir_name, &key, b"y")
        .map_err(|e| Error::io(dir_name, e))
}

fn remove_any(dir_fd: &Dir, name: &str) -> Result<()> {
    let meta = dir_fd.symlink_metadata(name).map_err(|e| Error::io(name, e))?;
    if meta.is_dir() {
        dir_fd
            .remove_dir_all(name)
            .map_err(|e| Error::io(name, e))?;
    } else {
        dir_fd.remove_file(name).map_err(|e| Error::io(name, e))?;
    }
    Ok(())
}

/// Compute the OCI whiteout marker name for `basename` (used by C6 when
/// emitting a plain whiteout: `dir/.wh.<basename>`).
pub fn oci_marker_name(basename: &str) -> String {
    format!("{WH_PREFIX}{basename}")
}
