//! C5: the tar extractor. Applies a stream of tar entries to a root
//! directory, enforcing path safety, whiteout semantics, identity mapping,
//! and the xattr filter policy.

use std::collections::HashSet;
use std::io::Read;
use std::os::unix::fs::PermissionsExt;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use rustix::fd::AsFd;
use rustix::fs::{AtFlags, Mode, Timestamps, makedev};

use crate::entry::{TarEntry, TypeFlag};
use crate::error::{Error, IdKind, Result};
use crate::format::OnDiskFormat;
use crate::idmap;
use crate::path::{clean, secure_join, split};
use crate::whiteout::{self, WH_OPAQUE, WH_PREFIX};
use crate::xattrfilter::Registry;

/// Construction-time configuration for one extraction pass.
pub struct UnpackOptions {
    pub on_disk_format: OnDiskFormat,
    /// If a symlink stands where a tar directory entry is about to land,
    /// and the symlink resolves (within root) to an existing directory,
    /// keep the symlink instead of clobbering it.
    pub keep_dirlinks: bool,
}

/// Metadata captured for a parent directory before mutating its children,
/// restored afterward so that creating/removing children doesn't pollute
/// the parent's own timestamps.
struct SavedParent {
    mode: u32,
    uid: u32,
    gid: u32,
    mtime: i64,
    atime: i64,
}

enum ClobberAction {
    /// Remove whatever is at `path` before creating the new entry.
    Remove,
    /// Leave the existing directory in place; still apply this entry's
    /// metadata to it.
    ReuseDirectory,
    /// Leave an existing symlink-to-directory in place untouched; skip
    /// metadata application entirely (children extract through it).
    KeepDirlink,
}

/// Extracts tar entries onto a root directory. One instance corresponds to
/// one extraction pass (one layer); `UpperPaths` and the ENOTSUP warn-once
/// flag live for the instance's lifetime and are discarded with it.
pub struct Extractor {
    root: Dir,
    options: UnpackOptions,
    registry: Registry,
    upper_paths: HashSet<Utf8PathBuf>,
    warned_enotsup: bool,
}

impl Extractor {
    pub fn new(root: Dir, options: UnpackOptions) -> Self {
        Extractor {
            root,
            options,
            registry: Registry::default_registry(),
            upper_paths: HashSet::new(),
            warned_enotsup: false,
        }
    }

    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    /// Apply every entry of a tar archive to the root directory, in order.
    pub fn unpack_layer<R: Read>(&mut self, archive: &mut tar::Archive<R>) -> Result<()> {
        let mut entries = archive
            .entries()
            .map_err(|e| Error::io(Utf8PathBuf::new(), e))?;
        while let Some(entry) = entries.next() {
            let mut entry = entry.map_err(|e| Error::io(Utf8PathBuf::new(), e))?;
            let tar_entry = read_tar_entry(&mut entry)?;
            self.unpack_entry(&tar_entry, &mut entry)?;
        }
        Ok(())
    }

    /// Apply a single tar entry. `reader` supplies exactly `entry.size`
    /// bytes of payload for regular files.
    pub fn unpack_entry(&mut self, entry: &TarEntry, reader: &mut impl Read) -> Result<()> {
        let name = clean(entry.name.as_str());

        if name == "/" || name.is_empty() {
            if entry.typeflag != TypeFlag::Directory {
                return Err(Error::MaliciousArchive {
                    path: entry.name.clone(),
                    reason: "root entry must be a directory",
                });
            }
            self.record_upper_path(Utf8Path::new("."));
            return Ok(());
        }

        let (unsafe_dir, base) = split(&name);
        let dir_rel = secure_join(&self.root, Utf8Path::new(unsafe_dir))?;
        let path_rel = join_rel(&dir_rel, base);

        let saved_parent = self.snapshot_parent(&dir_rel)?;
        self.ensure_dir_all(&dir_rel)?;

        let result = self.unpack_entry_at(entry, &dir_rel, base, &path_rel, reader);

        self.restore_parent(&dir_rel, saved_parent)?;
        result
    }

    fn unpack_entry_at(
        &mut self,
        entry: &TarEntry,
        dir_rel: &Utf8Path,
        base: &str,
        path_rel: &Utf8Path,
        reader: &mut impl Read,
    ) -> Result<()> {
        if let Some(rest) = base.strip_prefix(WH_PREFIX) {
            return self.handle_whiteout(dir_rel, base, rest);
        }

        let existing = self.root.symlink_metadata(path_rel.as_str()).ok();
        let action = self.clobber_action(entry, existing.as_ref(), path_rel)?;

        if let ClobberAction::Remove = action {
            remove_any_tolerant(&self.root, path_rel.as_str())?;
        }

        if matches!(action, ClobberAction::KeepDirlink) {
            self.record_upper_path(path_rel);
            return Ok(());
        }

        if !matches!(action, ClobberAction::ReuseDirectory) {
            self.create_by_typeflag(entry, path_rel, reader)?;
        }

        if entry.typeflag != TypeFlag::Hardlink {
            self.apply_metadata(entry, path_rel)?;
        }

        self.record_upper_path(path_rel);
        Ok(())
    }

    fn handle_whiteout(&mut self, dir_rel: &Utf8Path, base: &str, rest: &str) -> Result<()> {
        match &self.options.on_disk_format {
            OnDiskFormat::DirRootfs { .. } => {
                if base == WH_OPAQUE {
                    self.oci_opaque_whiteout_removal(dir_rel)
                } else {
                    self.oci_plain_whiteout_removal(dir_rel, rest)
                }
            }
            OnDiskFormat::OverlayfsRootfs { .. } => {
                let namespace = self
                    .options
                    .on_disk_format
                    .overlay_namespace()
                    .expect("OverlayfsRootfs always has an overlay namespace");
                if base == WH_OPAQUE {
                    whiteout::synthesize_opaque(&self.root, dir_rel.as_str(), namespace)
                } else {
                    let target = join_rel(dir_rel, rest);
                    whiteout::synthesize_plain(&self.root, target.as_str())
                }
            }
        }
    }

    /// §4.5.1 plain whiteout removal (`DirRootfs` mode).
    fn oci_plain_whiteout_removal(&mut self, dir_rel: &Utf8Path, basename: &str) -> Result<()> {
        let target = join_rel(dir_rel, basename);
        if self.root.symlink_metadata(target.as_str()).is_err() {
            return Ok(());
        }
        self.remove_below_upper_paths(&target, false)
    }

    /// §4.5.1 opaque whiteout removal (`DirRootfs` mode).
    fn oci_opaque_whiteout_removal(&mut self, dir_rel: &Utf8Path) -> Result<()> {
        self.remove_below_upper_paths(dir_rel, true)
    }

    /// Depth-first walk of `target` removing any sub-path not recorded in
    /// `UpperPaths`, pruning beneath removed paths. `skip_self` is set for
    /// the opaque-whiteout case, which never removes `target` itself.
    fn remove_below_upper_paths(&mut self, target: &Utf8Path, skip_self: bool) -> Result<()> {
        let meta = match self.root.symlink_metadata(target.as_str()) {
            Ok(m) => m,
            Err(_) => return Ok(()),
        };

        if !skip_self && !self.upper_paths.contains(target) {
            remove_any_tolerant(&self.root, target.as_str())?;
            return Ok(());
        }

        if !meta.is_dir() {
            return Ok(());
        }

        let mut children = Vec::new();
        for entry in self
            .root
            .read_dir(target.as_str())
            .map_err(|e| Error::io(target, e))?
        {
            let entry = entry.map_err(|e| Error::io(target, e))?;
            let name = entry.file_name();
            let name = name.to_string_lossy().into_owned();
            children.push(join_rel(target, &name));
        }

        for child in children {
            self.remove_below_upper_paths(&child, false)?;
        }

        Ok(())
    }

    fn clobber_action(
        &self,
        entry: &TarEntry,
        existing: Option<&std::fs::Metadata>,
        path_rel: &Utf8Path,
    ) -> Result<ClobberAction> {
        let Some(existing) = existing else {
            return Ok(ClobberAction::Remove);
        };

        if existing.is_dir() && entry.typeflag == TypeFlag::Directory {
            return Ok(ClobberAction::ReuseDirectory);
        }

        if self.options.keep_dirlinks
            && existing.file_type().is_symlink()
            && entry.typeflag == TypeFlag::Directory
        {
            let target = secure_join(&self.root, path_rel)?;
            if let Ok(meta) = self.root.symlink_metadata(target.as_str()) {
                if meta.is_dir() {
                    return Ok(ClobberAction::KeepDirlink);
                }
            }
        }

        Ok(ClobberAction::Remove)
    }

    fn create_by_typeflag(
        &mut self,
        entry: &TarEntry,
        path_rel: &Utf8Path,
        reader: &mut impl Read,
    ) -> Result<()> {
        let rootless = self.options.on_disk_format.map_options().rootless;

        match entry.typeflag {
            TypeFlag::Regular => {
                let mut file = self
                    .root
                    .create(path_rel.as_str())
                    .map_err(|e| Error::io(path_rel, e))?;
                let copied =
                    std::io::copy(&mut reader.take(entry.size), &mut file).map_err(|e| Error::io(path_rel, e))?;
                if copied != entry.size {
                    return Err(Error::ShortWrite {
                        path: path_rel.to_path_buf(),
                        expected: entry.size,
                        actual: copied,
                    });
                }
            }
            TypeFlag::Directory => {
                if let Err(e) = self.root.create_dir(path_rel.as_str()) {
                    if e.kind() != std::io::ErrorKind::AlreadyExists {
                        return Err(Error::io(path_rel, e));
                    }
                }
            }
            TypeFlag::Hardlink => {
                let linkname = entry
                    .linkname
                    .as_deref()
                    .ok_or_else(|| Error::MaliciousArchive {
                        path: path_rel.to_path_buf(),
                        reason: "hardlink entry missing link name",
                    })?;
                let (link_dir, link_base) = split(linkname.as_str());
                let link_dir_resolved = secure_join(&self.root, Utf8Path::new(link_dir))?;
                let link_target = join_rel(&link_dir_resolved, link_base);
                self.root
                    .hard_link(link_target.as_str(), &self.root, path_rel.as_str())
                    .map_err(|e| Error::io(path_rel, e))?;
            }
            TypeFlag::Symlink => {
                let linkname = entry
                    .linkname
                    .as_deref()
                    .ok_or_else(|| Error::MaliciousArchive {
                        path: path_rel.to_path_buf(),
                        reason: "symlink entry missing link name",
                    })?;
                self.root
                    .symlink(linkname.as_str(), path_rel.as_str())
                    .map_err(|e| Error::io(path_rel, e))?;
            }
            TypeFlag::CharDevice | TypeFlag::BlockDevice => {
                if rootless {
                    self.root
                        .create(path_rel.as_str())
                        .map_err(|e| Error::io(path_rel, e))?;
                    rustix::fs::chmodat(
                        self.root.as_fd(),
                        path_rel.as_str(),
                        Mode::from_raw_mode(0),
                        AtFlags::empty(),
                    )
                    .map_err(|e| Error::io(path_rel, e.into()))?;
                } else {
                    let file_type = if entry.typeflag == TypeFlag::CharDevice {
                        rustix::fs::FileType::CharacterDevice
                    } else {
                        rustix::fs::FileType::BlockDevice
                    };
                    rustix::fs::mknodat(
                        self.root.as_fd(),
                        path_rel.as_str(),
                        file_type,
                        Mode::from_raw_mode(entry.mode),
                        makedev(entry.devmajor, entry.devminor),
                    )
                    .map_err(|e| Error::io(path_rel, e.into()))?;
                }
            }
            TypeFlag::Fifo => {
                rustix::fs::mknodat(
                    self.root.as_fd(),
                    path_rel.as_str(),
                    rustix::fs::FileType::Fifo,
                    Mode::from_raw_mode(entry.mode),
                    0,
                )
                .map_err(|e| Error::io(path_rel, e.into()))?;
            }
        }

        Ok(())
    }

    fn apply_metadata(&mut self, entry: &TarEntry, path_rel: &Utf8Path) -> Result<()> {
        let fmt = self.options.on_disk_format.clone();
        let map = fmt.map_options().clone();
        let rootless = map.rootless;

        let mut container_uid = entry.uid;
        let mut container_gid = entry.gid;
        let mut skip_rootless_xattr_passthrough = false;

        if rootless {
            if let Some(payload) = entry.xattrs.get(idmap::ROOTLESS_XATTR) {
                if let Some(resource) = idmap::RootlessResource::decode(payload) {
                    container_uid = resource.uid.unwrap_or(container_uid);
                    container_gid = resource.gid.unwrap_or(container_gid);
                }
                skip_rootless_xattr_passthrough = true;
            }
        } else if entry.xattrs.contains_key(idmap::ROOTLESS_XATTR) {
            tracing::debug!(path = %path_rel, "ignoring unexpected user.rootlesscontainers xattr");
            skip_rootless_xattr_passthrough = true;
        }

        self.clear_on_disk_xattrs(path_rel)?;

        for (name, value) in entry.xattrs.iter() {
            if skip_rootless_xattr_passthrough && name == idmap::ROOTLESS_XATTR {
                continue;
            }
            let Some(disk_name) = self.registry.to_disk(&fmt, name) else {
                continue;
            };
            if let Err(e) = self.root.setxattr(path_rel.as_str(), &disk_name, value) {
                self.handle_xattr_write_error(path_rel, &disk_name, e, rootless);
            }
        }

        if rootless {
            if container_uid != 0 || container_gid != 0 {
                let payload = idmap::RootlessResource::new(container_uid, container_gid).encode();
                self.root
                    .setxattr(path_rel.as_str(), idmap::ROOTLESS_XATTR, &payload)
                    .map_err(|e| Error::io(path_rel, e))?;
            }
        } else {
            let host_uid = idmap::to_host(container_uid, &map.uid_mappings, IdKind::Uid)?;
            let host_gid = idmap::to_host(container_gid, &map.gid_mappings, IdKind::Gid)?;
            rustix::fs::chownat(
                self.root.as_fd(),
                path_rel.as_str(),
                Some(rustix::fs::Uid::from_raw(host_uid)),
                Some(rustix::fs::Gid::from_raw(host_gid)),
                AtFlags::SYMLINK_NOFOLLOW,
            )
            .map_err(|e| Error::io(path_rel, e.into()))?;
        }

        if entry.typeflag != TypeFlag::Symlink {
            rustix::fs::chmodat(
                self.root.as_fd(),
                path_rel.as_str(),
                Mode::from_raw_mode(entry.mode),
                AtFlags::empty(),
            )
            .map_err(|e| Error::io(path_rel, e.into()))?;
        }

        let mtime = if entry.mtime == 0 {
            now_seconds()
        } else {
            entry.mtime
        };
        let atime = if entry.atime == 0 { mtime } else { entry.atime };
        rustix::fs::utimensat(
            self.root.as_fd(),
            path_rel.as_str(),
            &Timestamps {
                last_access: rustix::fs::Timespec {
                    tv_sec: atime,
                    tv_nsec: 0,
                },
                last_modification: rustix::fs::Timespec {
                    tv_sec: mtime,
                    tv_nsec: 0,
                },
            },
            AtFlags::SYMLINK_NOFOLLOW,
        )
        .map_err(|e| Error::io(path_rel, e.into()))?;

        Ok(())
    }

    fn handle_xattr_write_error(
        &mut self,
        path: &Utf8Path,
        xattr: &str,
        e: std::io::Error,
        rootless: bool,
    ) {
        match e.raw_os_error() {
            Some(code) if code == libc::EOPNOTSUPP || code == libc::ENOTSUP => {
                if !self.warned_enotsup {
                    tracing::warn!(path = %path, xattr, "xattrs not supported on this filesystem");
                    self.warned_enotsup = true;
                } else {
                    tracing::debug!(path = %path, xattr, "xattrs not supported on this filesystem");
                }
            }
            Some(code) if rootless && code == libc::EPERM => {
                tracing::warn!(path = %path, xattr, "cannot set xattr while rootless");
            }
            _ => {
                tracing::debug!(path = %path, xattr, error = %e, "failed to set xattr");
            }
        }
    }

    fn clear_on_disk_xattrs(&self, path_rel: &Utf8Path) -> Result<()> {
        let fmt = &self.options.on_disk_format;
        let names = match self.root.listxattrs(path_rel.as_str()) {
            Ok(names) => names,
            Err(_) => return Ok(()),
        };
        for name in names {
            let Some(name) = name.to_str() else { continue };
            if self.registry.masked_on_disk(fmt, name) {
                continue;
            }
            let _ = self.root.removexattr(path_rel.as_str(), name);
        }
        Ok(())
    }

    fn snapshot_parent(&self, dir_rel: &Utf8Path) -> Result<Option<SavedParent>> {
        let Ok(meta) = self.root.symlink_metadata(dir_rel.as_str()) else {
            return Ok(None);
        };
        use std::os::unix::fs::MetadataExt;
        Ok(Some(SavedParent {
            mode: meta.permissions().mode(),
            uid: meta.uid(),
            gid: meta.gid(),
            mtime: meta.mtime(),
            atime: meta.atime(),
        }))
    }

    fn restore_parent(&self, dir_rel: &Utf8Path, saved: Option<SavedParent>) -> Result<()> {
        let Some(saved) = saved else { return Ok(()) };
        rustix::fs::chownat(
            self.root.as_fd(),
            dir_rel.as_str(),
            Some(rustix::fs::Uid::from_raw(saved.uid)),
            Some(rustix::fs::Gid::from_raw(saved.gid)),
            AtFlags::SYMLINK_NOFOLLOW,
        )
        .map_err(|e| Error::io(dir_rel, e.into()))?;
        rustix::fs::chmodat(
            self.root.as_fd(),
            dir_rel.as_str(),
            Mode::from_raw_mode(saved.mode),
            AtFlags::empty(),
        )
        .map_err(|e| Error::io(dir_rel, e.into()))?;
        rustix::fs::utimensat(
            self.root.as_fd(),
            dir_rel.as_str(),
            &Timestamps {
                last_access: rustix::fs::Timespec {
                    tv_sec: saved.atime,
                    tv_nsec: 0,
                },
                last_modification: rustix::fs::Timespec {
                    tv_sec: saved.mtime,
                    tv_nsec: 0,
                },
            },
            AtFlags::SYMLINK_NOFOLLOW,
        )
        .map_err(|e| Error::io(dir_rel, e.into()))?;
        Ok(())
    }

    /// `MkdirAll` with non-directory-component correction (§4.5(b)): a
    /// component that exists but isn't a directory is replaced. If the
    /// replaced component was itself a synthesized overlayfs whiteout (see
    /// §8 "whiteout-then-recreate"), the new directory is marked opaque so
    /// the whiteout's replace-not-merge intent survives the conversion.
    fn ensure_dir_all(&self, dir_rel: &Utf8Path) -> Result<()> {
        if dir_rel.as_str().is_empty() {
            return Ok(());
        }
        let mut acc = Utf8PathBuf::new();
        for component in dir_rel.as_str().split('/').filter(|c| !c.is_empty()) {
            acc = join_rel(&acc, component);
            match self.root.symlink_metadata(acc.as_str()) {
                Ok(meta) if meta.is_dir() => continue,
                Ok(meta) => {
                    let was_whiteout =
                        whiteout::classify(&self.root, acc.as_str(), &meta, &self.options.on_disk_format)?
                            .is_some();
                    remove_any_tolerant(&self.root, acc.as_str())?;
                    self.root
                        .create_dir(acc.as_str())
                        .map_err(|e| Error::io(acc.as_path(), e))?;
                    if was_whiteout {
                        if let Some(namespace) = self.options.on_disk_format.overlay_namespace() {
                            whiteout::synthesize_opaque(&self.root, acc.as_str(), namespace)?;
                        }
                    }
                }
                Err(_) => {
                    self.root
                        .create_dir(acc.as_str())
                        .map_err(|e| Error::io(acc.as_path(), e))?;
                }
            }
        }
        Ok(())
    }

    fn record_upper_path(&mut self, path: &Utf8Path) {
        let mut acc = path.to_path_buf();
        loop {
            if !self.upper_paths.insert(acc.clone()) {
                break;
            }
            let Some(parent) = acc.parent() else { break };
            if parent.as_str().is_empty() || parent == acc {
                self.upper_paths.insert(Utf8PathBuf::from("."));
                break;
            }
            acc = parent.to_path_buf();
        }
    }
}

fn join_rel(dir: &Utf8Path, base: &str) -> Utf8PathBuf {
    if dir.as_str().is_empty() || dir.as_str() == "." {
        Utf8PathBuf::from(base)
    } else {
        dir.join(base)
    }
}

fn remove_any_tolerant(dir: &Dir, path: &str) -> Result<()> {
    let meta = match dir.symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::io(path, e)),
    };
    if meta.is_dir() {
        dir.remove_dir_all(path).map_err(|e| Error::io(path, e))
    } else {
        dir.remove_file(path).map_err(|e| Error::io(path, e))
    }
}

fn now_seconds() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Build a `TarEntry` from a `tar` crate entry, including PAX-extension
/// xattrs (`SCHILY.xattr.<name>`, with `LIBARCHIVE.xattr.<name>` accepted as
/// a legacy alias on read).
fn read_tar_entry<R: Read>(entry: &mut tar::Entry<'_, R>) -> Result<TarEntry> {
    let header = entry.header().clone();
    let path = entry
        .path()
        .map_err(|e| Error::io(Utf8PathBuf::new(), e))?;
    let name = Utf8PathBuf::from_path_buf(path.into_owned())
        .unwrap_or_else(|p| Utf8PathBuf::from(p.to_string_lossy().into_owned()));

    let linkname = entry
        .link_name()
        .map_err(|e| Error::io(&name, e))?
        .map(|p| {
            Utf8PathBuf::from_path_buf(p.into_owned())
                .unwrap_or_else(|p| Utf8PathBuf::from(p.to_string_lossy().into_owned()))
        });

    let typeflag = TypeFlag::from_tar(header.entry_type()).ok_or_else(|| {
        Error::UnsupportedTypeflag {
            path: name.clone(),
            typeflag: header.entry_type().as_byte(),
        }
    })?;

    let mut xattrs = indexmap::IndexMap::new();
    if let Some(extensions) = entry.pax_extensions().map_err(|e| Error::io(&name, e))? {
        for ext in extensions {
            let ext = ext.map_err(|e| Error::io(&name, e))?;
            let key = ext.key().unwrap_or_default();
            for prefix in ["SCHILY.xattr.", "LIBARCHIVE.xattr."] {
                if let Some(xattr_name) = key.strip_prefix(prefix) {
                    xattrs.insert(xattr_name.to_string(), ext.value_bytes().to_vec());
                    break;
                }
            }
        }
    }

    Ok(TarEntry {
        name,
        typeflag,
        mode: header.mode().unwrap_or(0o644),
        uid: header.uid().unwrap_or(0) as u32,
        gid: header.gid().unwrap_or(0) as u32,
        size: header.size().unwrap_or(0),
        linkname,
        mtime: header.mtime().unwrap_or(0) as i64,
        atime: 0,
        devmajor: header.device_major().ok().flatten().unwrap_or(0),
        devminor: header.device_minor().ok().flatten().unwrap_or(0),
        xattrs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{MapOptions, OverlayNamespace};
    use cap_std::ambient_authority;

    fn entry(name: &str, typeflag: TypeFlag) -> TarEntry {
        TarEntry {
            name: Utf8PathBuf::from(name),
            typeflag,
            mode: 0o644,
            uid: 0,
            gid: 0,
            size: 0,
            linkname: None,
            mtime: 1_700_000_000,
            atime: 0,
            devmajor: 0,
            devminor: 0,
            xattrs: indexmap::IndexMap::new(),
        }
    }

    fn dir_extractor(root: Dir) -> Extractor {
        Extractor::new(
            root,
            UnpackOptions {
                on_disk_format: OnDiskFormat::DirRootfs {
                    map: MapOptions::default(),
                },
                keep_dirlinks: false,
            },
        )
    }

    fn overlay_extractor(root: Dir) -> Extractor {
        Extractor::new(
            root,
            UnpackOptions {
                on_disk_format: OnDiskFormat::OverlayfsRootfs {
                    map: MapOptions::default(),
                    user_xattr: false,
                },
                keep_dirlinks: false,
            },
        )
    }

    #[test]
    fn extracts_regular_file_with_content_and_mode() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Dir::open_ambient_dir(tmp.path(), ambient_authority()).unwrap();
        let mut extractor = dir_extractor(root);

        let mut e = entry("a/b/file", TypeFlag::Regular);
        e.size = 5;
        e.mode = 0o600;
        extractor.unpack_entry(&e, &mut &b"hello"[..]).unwrap();

        let content = extractor.root.read("a/b/file").unwrap();
        assert_eq!(content, b"hello");
        let meta = extractor.root.symlink_metadata("a/b/file").unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn short_write_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Dir::open_ambient_dir(tmp.path(), ambient_authority()).unwrap();
        let mut extractor = dir_extractor(root);

        let mut e = entry("file", TypeFlag::Regular);
        e.size = 10;
        let err = extractor.unpack_entry(&e, &mut &b"short"[..]).unwrap_err();
        assert!(matches!(err, Error::ShortWrite { .. }));
    }

    #[test]
    fn symlink_pointing_outside_root_is_never_followed_for_writes() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Dir::open_ambient_dir(tmp.path(), ambient_authority()).unwrap();
        root.symlink("/", "escape").unwrap();
        let mut extractor = dir_extractor(root);

        let mut e = entry("escape/etc/passwd", TypeFlag::Regular);
        e.size = 1;
        extractor.unpack_entry(&e, &mut &b"X"[..]).unwrap();

        let content = extractor.root.read("etc/passwd").unwrap();
        assert_eq!(content, b"X");
    }

    #[test]
    fn existing_directory_is_reused_not_recreated() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Dir::open_ambient_dir(tmp.path(), ambient_authority()).unwrap();
        root.create_dir("d").unwrap();
        root.write("d/keep", "x").unwrap();
        let mut extractor = dir_extractor(root);

        let e = entry("d", TypeFlag::Directory);
        extractor.unpack_entry(&e, &mut &[][..]).unwrap();

        assert!(extractor.root.exists("d/keep"));
    }

    #[test]
    fn keep_dirlinks_preserves_symlink_to_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Dir::open_ambient_dir(tmp.path(), ambient_authority()).unwrap();
        root.create_dir("real").unwrap();
        root.symlink("real", "link").unwrap();

        let mut extractor = Extractor::new(
            root,
            UnpackOptions {
                on_disk_format: OnDiskFormat::DirRootfs {
                    map: MapOptions::default(),
                },
                keep_dirlinks: true,
            },
        );

        let e = entry("link", TypeFlag::Directory);
        extractor.unpack_entry(&e, &mut &[][..]).unwrap();

        let meta = extractor.root.symlink_metadata("link").unwrap();
        assert!(meta.file_type().is_symlink());
    }

    #[test]
    fn dir_rootfs_whiteout_removes_existing_path() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Dir::open_ambient_dir(tmp.path(), ambient_authority()).unwrap();
        root.write("gone", "x").unwrap();
        let mut extractor = dir_extractor(root);

        let e = entry(".wh.gone", TypeFlag::Regular);
        extractor.unpack_entry(&e, &mut &[][..]).unwrap();

        assert!(!extractor.root.exists("gone"));
    }

    #[test]
    fn dir_rootfs_whiteout_spares_paths_recorded_earlier_in_same_layer() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Dir::open_ambient_dir(tmp.path(), ambient_authority()).unwrap();
        let mut extractor = dir_extractor(root);

        let mut file1 = entry("a/b/c/file1", TypeFlag::Regular);
        file1.size = 1;
        extractor.unpack_entry(&file1, &mut &b"1"[..]).unwrap();
        let mut file2 = entry("a/b/c/file2", TypeFlag::Regular);
        file2.size = 1;
        extractor.unpack_entry(&file2, &mut &b"2"[..]).unwrap();

        // opaque whiteout within the SAME extraction must spare file1/file2,
        // both already recorded in this pass's UpperPaths.
        let opaque = entry("a/b/c/.wh..wh..opq", TypeFlag::Regular);
        extractor.unpack_entry(&opaque, &mut &[][..]).unwrap();

        assert!(extractor.root.exists("a/b/c/file1"));
        assert!(extractor.root.exists("a/b/c/file2"));
    }

    #[test]
    fn opaque_plus_upper_across_two_layers() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Dir::open_ambient_dir(tmp.path(), ambient_authority()).unwrap();

        {
            let mut layer1 = dir_extractor(root.try_clone().unwrap());
            let mut file1 = entry("a/b/c/file1", TypeFlag::Regular);
            file1.size = 1;
            layer1.unpack_entry(&file1, &mut &b"1"[..]).unwrap();
            let mut file2 = entry("a/b/c/file2", TypeFlag::Regular);
            file2.size = 1;
            layer1.unpack_entry(&file2, &mut &b"1"[..]).unwrap();
        }

        {
            // fresh Extractor => fresh (empty) UpperPaths, as a new layer.
            let mut layer2 = dir_extractor(root.try_clone().unwrap());
            let opaque = entry("a/b/c/.wh..wh..opq", TypeFlag::Regular);
            layer2.unpack_entry(&opaque, &mut &[][..]).unwrap();
            let mut file2 = entry("a/b/c/file2", TypeFlag::Regular);
            file2.size = 1;
            layer2.unpack_entry(&file2, &mut &b"2"[..]).unwrap();
        }

        assert!(root.exists("a/b/c"));
        assert!(!root.exists("a/b/c/file1"));
        assert_eq!(root.read("a/b/c/file2").unwrap(), b"2");
    }

    #[test]
    fn overlayfs_whiteout_prefix_synthesizes_char_device() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Dir::open_ambient_dir(tmp.path(), ambient_authority()).unwrap();
        root.write("gone", "x").unwrap();
        let mut extractor = overlay_extractor(root);

        let e = entry(".wh.gone", TypeFlag::Regular);
        extractor.unpack_entry(&e, &mut &[][..]).unwrap();

        use std::os::unix::fs::{FileTypeExt, MetadataExt};
        let meta = extractor.root.symlink_metadata("gone").unwrap();
        assert!(meta.file_type().is_char_device());
        assert_eq!(meta.rdev(), 0);
    }

    #[test]
    fn whiteout_then_recreate_in_dir_rootfs_mode() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Dir::open_ambient_dir(tmp.path(), ambient_authority()).unwrap();
        root.create_dir("dir").unwrap();
        root.write("dir/stale", "x").unwrap();
        let mut extractor = dir_extractor(root);

        let wh = entry(".wh.dir", TypeFlag::Regular);
        extractor.unpack_entry(&wh, &mut &[][..]).unwrap();
        assert!(!extractor.root.exists("dir"));

        let mut file = entry("dir/sub/file", TypeFlag::Regular);
        file.size = 1;
        extractor.unpack_entry(&file, &mut &b"x"[..]).unwrap();

        assert!(extractor.root.symlink_metadata("dir").unwrap().is_dir());
        assert!(!extractor.root.exists("dir/stale"));
        assert!(extractor.root.exists("dir/sub/file"));
    }

    #[test]
    fn whiteout_then_recreate_becomes_opaque_directory_in_overlayfs_mode() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Dir::open_ambient_dir(tmp.path(), ambient_authority()).unwrap();
        root.create_dir("dir").unwrap();
        root.write("dir/stale", "x").unwrap();
        let mut extractor = overlay_extractor(root);

        let wh = entry(".wh.dir", TypeFlag::Regular);
        extractor.unpack_entry(&wh, &mut &[][..]).unwrap();

        let mut file = entry("dir/sub/file", TypeFlag::Regular);
        file.size = 1;
        extractor.unpack_entry(&file, &mut &b"x"[..]).unwrap();

        let meta = extractor.root.symlink_metadata("dir").unwrap();
        assert!(meta.is_dir());
        assert!(extractor.root.exists("dir/sub/file"));
        let opaque = extractor
            .root
            .getxattr("dir", "trusted.overlay.opaque")
            .unwrap();
        assert_eq!(opaque.as_deref(), Some(&b"y"[..]));
    }

    #[test]
    fn hardlink_points_at_same_inode_and_ignores_its_own_metadata() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Dir::open_ambient_dir(tmp.path(), ambient_authority()).unwrap();
        let mut extractor = dir_extractor(root);

        let mut r = entry("r", TypeFlag::Regular);
        r.size = 1;
        extractor.unpack_entry(&r, &mut &b"x"[..]).unwrap();

        let mut s = entry("s", TypeFlag::Symlink);
        s.linkname = Some(Utf8PathBuf::from("r"));
        extractor.unpack_entry(&s, &mut &[][..]).unwrap();

        let mut h = entry("h", TypeFlag::Hardlink);
        h.linkname = Some(Utf8PathBuf::from("s"));
        extractor.unpack_entry(&h, &mut &[][..]).unwrap();

        let meta_h = extractor.root.symlink_metadata("h").unwrap();
        let meta_s = extractor.root.symlink_metadata("s").unwrap();
        let meta_r = extractor.root.symlink_metadata("r").unwrap();
        use std::os::unix::fs::MetadataExt;
        assert_eq!(meta_h.ino(), meta_s.ino());
        assert_ne!(meta_h.ino(), meta_r.ino());
        assert_eq!(
            extractor.root.read_link_contents("h").unwrap(),
            extractor.root.read_link_contents("s").unwrap()
        );
    }

    #[test]
    fn rootless_xattr_overrides_owner_and_is_persisted_canonically() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Dir::open_ambient_dir(tmp.path(), ambient_authority()).unwrap();
        let mut extractor = Extractor::new(
            root,
            UnpackOptions {
                on_disk_format: OnDiskFormat::DirRootfs {
                    map: MapOptions {
                        rootless: true,
                        ..Default::default()
                    },
                },
                keep_dirlinks: false,
            },
        );

        let mut e = entry("file", TypeFlag::Regular);
        e.size = 1;
        e.uid = 1000;
        e.gid = 1000;
        let payload = idmap::RootlessResource::new(1000, 1000).encode();
        e.xattrs.insert(idmap::ROOTLESS_XATTR.to_string(), payload);
        extractor.unpack_entry(&e, &mut &b"x"[..]).unwrap();

        let stored = extractor
            .root
            .getxattr("file", idmap::ROOTLESS_XATTR)
            .unwrap()
            .unwrap();
        let decoded = idmap::RootlessResource::decode(&stored).unwrap();
        assert_eq!(decoded.uid, Some(1000));
        assert_eq!(decoded.gid, Some(1000));

        use std::os::unix::fs::MetadataExt;
        let meta = extractor.root.symlink_metadata("file").unwrap();
        assert_eq!(meta.uid(), 0);
        assert_eq!(meta.gid(), 0);
    }

    #[test]
    fn overlay_namespace_matches_user_xattr_flag() {
        let fmt = OnDiskFormat::OverlayfsRootfs {
            map: MapOptions::default(),
            user_xattr: true,
        };
        assert_eq!(fmt.overlay_namespace(), Some(OverlayNamespace::User));
    }

    /// A filter that drops everything under a chosen prefix, for exercising
    /// a caller-supplied registry distinct from the process-wide default.
    struct DropPrefixFilter;

    impl crate::xattrfilter::XattrFilter for DropPrefixFilter {
        fn masked_on_disk(&self, _fmt: &OnDiskFormat, _name: &str) -> bool {
            true
        }
        fn to_disk(&self, _fmt: &OnDiskFormat, _name: &str) -> Option<String> {
            None
        }
        fn to_tar(&self, _fmt: &OnDiskFormat, _name: &str) -> Option<String> {
            None
        }
    }

    #[test]
    fn with_registry_overrides_the_default_xattr_policy() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Dir::open_ambient_dir(tmp.path(), ambient_authority()).unwrap();
        let custom_registry = Registry::default_registry()
            .with_prefix_override("user.quarantined.", std::sync::Arc::new(DropPrefixFilter));
        let mut extractor = dir_extractor(root).with_registry(custom_registry);

        let mut e = entry("file", TypeFlag::Regular);
        e.size = 1;
        e.xattrs
            .insert("user.quarantined.secret".to_string(), b"x".to_vec());
        e.xattrs
            .insert("user.kept".to_string(), b"y".to_vec());
        extractor.unpack_entry(&e, &mut &b"x"[..]).unwrap();

        assert_eq!(
            extractor.root.getxattr("file", "user.quarantined.secret").unwrap(),
            None
        );
        assert_eq!(
            extractor.root.getxattr("file", "user.kept").unwrap(),
            Some(b"y".to_vec())
        );
    }
}
