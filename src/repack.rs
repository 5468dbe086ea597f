//! C6: the tar generator. Turns a root directory plus a list of path deltas
//! into an OCI layer tar stream (or an "insert" layer rooted under a prefix).

use std::collections::HashMap;
use std::io::Write;
use std::os::unix::fs::{FileTypeExt, MetadataExt};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use rustix::fs::{major, minor};

use crate::entry::{Delta, DeltaKind, TypeFlag, sort_deltas};
use crate::error::{Error, IdKind, Result};
use crate::format::OnDiskFormat;
use crate::idmap;
use crate::path::{clean, split};
use crate::pipe::{self, PipeReader};
use crate::whiteout::{self, WH_OPAQUE, WH_PREFIX};
use crate::xattrfilter::Registry;

/// Construction-time configuration for one generation pass.
pub struct RepackOptions {
    pub on_disk_format: OnDiskFormat,
    /// `SOURCE_DATE_EPOCH`: no emitted mtime exceeds this value.
    pub source_date_epoch: Option<i64>,
}

/// Tracks (dev, ino) -> first archive path seen, for hardlink emission.
#[derive(Default)]
struct InodeMap {
    seen: HashMap<(u64, u64), Utf8PathBuf>,
}

impl InodeMap {
    fn first_path(&mut self, dev: u64, ino: u64, path: &Utf8Path) -> Option<Utf8PathBuf> {
        if let Some(existing) = self.seen.get(&(dev, ino)) {
            return Some(existing.clone());
        }
        self.seen.insert((dev, ino), path.to_path_buf());
        None
    }
}

/// Generates a tar stream from a root directory. One instance corresponds to
/// one generation pass; `InodeMap` lives for the instance's lifetime.
pub struct Generator<W: Write> {
    root: Dir,
    options: RepackOptions,
    registry: Registry,
    builder: tar::Builder<W>,
    inode_map: InodeMap,
}

impl<W: Write> Generator<W> {
    pub fn new(root: Dir, options: RepackOptions, writer: W) -> Self {
        Generator {
            root,
            options,
            registry: Registry::default_registry(),
            builder: tar::Builder::new(writer),
            inode_map: InodeMap::default(),
        }
    }

    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    /// Finish the archive and return the underlying writer.
    pub fn finish(mut self) -> Result<W> {
        self.builder
            .finish()
            .map_err(|e| Error::io(Utf8PathBuf::new(), e))?;
        self.builder
            .into_inner()
            .map_err(|e| Error::io(Utf8PathBuf::new(), e))
    }

    /// Top-level entry point: emit one tar entry (or whiteout marker) for
    /// each delta, in lexical path order.
    pub fn generate_layer(&mut self, deltas: &[Delta]) -> Result<()> {
        let mut deltas = deltas.to_vec();
        sort_deltas(&mut deltas);

        for delta in &deltas {
            match delta.kind {
                DeltaKind::Missing => {
                    let (dir, base) = split(delta.path.as_str());
                    self.add_whiteout(Utf8Path::new(dir), base)?;
                }
                DeltaKind::Added | DeltaKind::Modified => {
                    self.emit_changed(&delta.path)?;
                }
            }
        }

        Ok(())
    }

    /// Emit an "insert" layer: every file under `source_root` (a directory
    /// outside the engine's own root, e.g. a scratch build tree), reparented
    /// under `target_prefix` in the archive. If `opaque`, `target_prefix`
    /// itself is preceded by an opaque-whiteout marker. If `source_root` is
    /// `None` (there is nothing to insert), a single whiteout is emitted at
    /// `target_prefix` instead and `opaque` is ignored.
    pub fn generate_insert_layer(
        &mut self,
        source_root: Option<&Dir>,
        target_prefix: &Utf8Path,
        opaque: bool,
    ) -> Result<()> {
        let Some(source_root) = source_root else {
            let (dir, base) = split(target_prefix.as_str());
            return self.add_whiteout(Utf8Path::new(dir), base);
        };

        if opaque {
            self.add_opaque_whiteout(target_prefix)?;
        }

        let config = cap_std_ext::dirext::WalkConfiguration::default().sort_by_file_name();
        let mut error = None;
        source_root
            .walk(&config, |component| {
                let rel = match Utf8Path::from_path(component.path) {
                    Some(p) => p,
                    None => {
                        error = Some(Error::MaliciousArchive {
                            path: Utf8PathBuf::new(),
                            reason: "non-UTF-8 path while walking insert-layer source",
                        });
                        return Ok(std::ops::ControlFlow::Break(()));
                    }
                };
                let archive_path = join_rel(target_prefix, rel.as_str());
                if let Err(e) = self.add_file(source_root, rel, &archive_path) {
                    error = Some(e);
                    return Ok(std::ops::ControlFlow::Break(()));
                }
                Ok::<_, std::io::Error>(std::ops::ControlFlow::Continue(()))
            })
            .map_err(|e| Error::io(target_prefix, e))?;

        if let Some(e) = error {
            return Err(e);
        }
        Ok(())
    }

    fn emit_changed(&mut self, path: &Utf8Path) -> Result<()> {
        let meta = self
            .root
            .symlink_metadata(path.as_str())
            .map_err(|e| Error::io(path, e))?;

        if let OnDiskFormat::OverlayfsRootfs { .. } = &self.options.on_disk_format {
            let fmt = self.options.on_disk_format.clone();
            if let Some(kind) = whiteout::classify(&self.root, path.as_str(), &meta, &fmt)? {
                return match kind {
                    whiteout::WhiteoutKind::Plain => {
                        let (dir, base) = split(path.as_str());
                        self.add_whiteout(Utf8Path::new(dir), base)
                    }
                    whiteout::WhiteoutKind::Opaque => {
                        // emit the directory entry itself first (preserves its
                        // mode/ownership), then the opaque marker child.
                        let root = self.root.try_clone().map_err(|e| Error::io(path, e))?;
                        self.add_file(&root, path, path)?;
                        self.add_opaque_whiteout(path)
                    }
                };
            }
        }

        let root = self.root.try_clone().map_err(|e| Error::io(path, e))?;
        self.add_file(&root, path, path)
    }

    /// §4.6.1: append one file/dir/symlink/device/hardlink entry, reading
    /// content from `dir`/`disk_path` but naming it `archive_path` in the
    /// tar stream (they differ for insert layers).
    fn add_file(&mut self, dir: &Dir, disk_path: &Utf8Path, archive_path: &Utf8Path) -> Result<()> {
        let cleaned = clean(archive_path.as_str());
        let archive_name = cleaned.strip_prefix('/').unwrap_or(&cleaned).to_string();
        if archive_name == ".." || archive_name.starts_with("../") {
            return Err(Error::EscapesRoot {
                path: archive_path.to_path_buf(),
            });
        }
        let (_, basename) = split(&archive_name);
        if basename.starts_with(WH_PREFIX) {
            return Err(Error::MaliciousArchive {
                path: archive_path.to_path_buf(),
                reason: "file name collides with the whiteout marker convention",
            });
        }

        let meta = dir
            .symlink_metadata(disk_path.as_str())
            .map_err(|e| Error::io(disk_path, e))?;
        let typeflag = typeflag_from_metadata(disk_path, &meta)?;

        let mtime = match self.options.source_date_epoch {
            Some(sde) => meta.mtime().min(sde),
            None => meta.mtime(),
        };

        let fmt = &self.options.on_disk_format;
        let map = fmt.map_options();
        let rootless = map.rootless;

        // The uid/gid that belong in the archive entry (the intended
        // container owner); under rootless emulation these come from the
        // `user.rootlesscontainers` xattr recorded at unpack time, not from
        // the on-disk owner (which is always the host process's own).
        let (archive_uid, archive_gid) = if rootless {
            match dir.getxattr(disk_path.as_str(), idmap::ROOTLESS_XATTR) {
                Ok(Some(payload)) => {
                    let resource = idmap::RootlessResource::decode(&payload);
                    let resource = resource.unwrap_or_default();
                    (resource.uid.unwrap_or(0), resource.gid.unwrap_or(0))
                }
                _ => (0, 0),
            }
        } else {
            (
                idmap::to_container(meta.uid(), &map.uid_mappings, IdKind::Uid)?,
                idmap::to_container(meta.gid(), &map.gid_mappings, IdKind::Gid)?,
            )
        };

        // §4.2 "On repack": under rootless emulation the entry's own owner
        // fields are always (0,0); a non-(0,0) intended owner is carried
        // instead as a `user.rootlesscontainers` xattr, mirroring how
        // `unpack.rs::apply_metadata` decodes the same xattr on the way in.
        let (header_uid, header_gid) = if rootless { (0, 0) } else { (archive_uid, archive_gid) };

        let mut xattrs: indexmap::IndexMap<String, Vec<u8>> = indexmap::IndexMap::new();
        if let Ok(names) = dir.listxattrs(disk_path.as_str()) {
            for name in names {
                let Some(name) = name.to_str().map(str::to_string) else {
                    continue;
                };
                if rootless && name == idmap::ROOTLESS_XATTR {
                    continue;
                }
                let Some(tar_name) = self.registry.to_tar(fmt, &name) else {
                    continue;
                };
                let Some(value) = dir
                    .getxattr(disk_path.as_str(), &name)
                    .map_err(|e| Error::io(disk_path, e))?
                else {
                    continue;
                };
                if value.is_empty() {
                    tracing::warn!(path = %disk_path, xattr = %name, "dropping empty xattr value");
                    continue;
                }
                xattrs.insert(tar_name, value);
            }
        }

        if rootless && (archive_uid != 0 || archive_gid != 0) {
            let payload = idmap::RootlessResource::new(archive_uid, archive_gid).encode();
            xattrs.insert(idmap::ROOTLESS_XATTR.to_string(), payload);
        }

        if typeflag != TypeFlag::Directory && meta.nlink() > 1 {
            if let Some(first) = self
                .inode_map
                .first_path(meta.dev(), meta.ino(), Utf8Path::new(&archive_name))
            {
                let mut header = tar::Header::new_gnu();
                header.set_entry_type(tar::EntryType::Link);
                header.set_size(0);
                header.set_mtime(mtime.max(0) as u64);
                header.set_uid(header_uid as u64);
                header.set_gid(header_gid as u64);
                header.set_mode(meta.mode() & 0o7777);
                self.builder
                    .append_link(&mut header, archive_name.as_str(), first.as_str())
                    .map_err(|e| Error::io(&archive_name, e))?;
                return Ok(());
            }
        }

        let mut header = tar::Header::new_gnu();
        header.set_entry_type(typeflag.to_tar());
        header.set_mtime(mtime.max(0) as u64);
        header.set_uid(header_uid as u64);
        header.set_gid(header_gid as u64);
        header.set_mode(meta.mode() & 0o7777);

        if !xattrs.is_empty() {
            let pax: Vec<_> = xattrs
                .iter()
                .map(|(k, v)| (format!("SCHILY.xattr.{k}"), v.clone()))
                .collect();
            self.builder
                .append_pax_extensions(pax.iter().map(|(k, v)| (k.as_str(), v.as_slice())))
                .map_err(|e| Error::io(&archive_name, e))?;
        }

        match typeflag {
            TypeFlag::Directory => {
                header.set_size(0);
                let tar_name = format!("{archive_name}/");
                self.builder
                    .append_data(&mut header, &tar_name, std::io::empty())
                    .map_err(|e| Error::io(&archive_name, e))?;
            }
            TypeFlag::Regular => {
                let content = dir
                    .read(disk_path.as_str())
                    .map_err(|e| Error::io(disk_path, e))?;
                header.set_size(content.len() as u64);
                self.builder
                    .append_data(&mut header, archive_name.as_str(), content.as_slice())
                    .map_err(|e| Error::io(&archive_name, e))?;
            }
            TypeFlag::Symlink => {
                header.set_size(0);
                let target = dir
                    .read_link_contents(disk_path.as_str())
                    .map_err(|e| Error::io(disk_path, e))?;
                self.builder
                    .append_link(&mut header, archive_name.as_str(), &target)
                    .map_err(|e| Error::io(&archive_name, e))?;
            }
            TypeFlag::CharDevice | TypeFlag::BlockDevice | TypeFlag::Fifo => {
                header.set_size(0);
                if typeflag != TypeFlag::Fifo {
                    let rdev = meta.rdev();
                    header.set_device_major(major(rdev));
                    header.set_device_minor(minor(rdev));
                }
                self.builder
                    .append_data(&mut header, archive_name.as_str(), std::io::empty())
                    .map_err(|e| Error::io(&archive_name, e))?;
            }
            TypeFlag::Hardlink => unreachable!("hardlinks are detected via InodeMap, not lstat"),
        }

        Ok(())
    }

    /// §4.6.2: append a plain whiteout marker `dir/.wh.<basename>`.
    fn add_whiteout(&mut self, dir: &Utf8Path, basename: &str) -> Result<()> {
        if basename.starts_with(WH_PREFIX) {
            return Err(Error::MaliciousArchive {
                path: join_rel(dir, basename),
                reason: "basename already denotes a whiteout marker",
            });
        }
        let archive_name = join_rel(dir, &whiteout::oci_marker_name(basename));
        self.append_zero_length_marker(&archive_name)
    }

    /// §4.6.2: append an opaque whiteout marker `dir/.wh..wh..opq`.
    fn add_opaque_whiteout(&mut self, dir: &Utf8Path) -> Result<()> {
        let archive_name = join_rel(dir, WH_OPAQUE);
        self.append_zero_length_marker(&archive_name)
    }

    fn append_zero_length_marker(&mut self, archive_name: &Utf8Path) -> Result<()> {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(0);
        header.set_mode(0o000);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(self.options.source_date_epoch.unwrap_or(0).max(0) as u64);
        self.builder
            .append_data(&mut header, archive_name.as_str(), std::io::empty())
            .map_err(|e| Error::io(archive_name, e))
    }
}

/// §5 concurrency model: run `generate_layer` on its own thread, writing into
/// a streaming pipe, and hand back the read side for the consumer (e.g. a
/// blob-store compressor) to pull from incrementally. A single writer thread
/// per layer; the producer's terminal error, if any, is delivered to the
/// consumer's next `read` rather than propagated silently. The caller
/// cancels by dropping the returned reader.
pub fn spawn_generate_layer(
    root: Dir,
    options: RepackOptions,
    deltas: Vec<Delta>,
) -> PipeReader {
    pipe::spawn_producer(move |writer| {
        let mut generator = Generator::new(root, options, writer);
        generator
            .generate_layer(&deltas)
            .map_err(std::io::Error::other)?;
        generator.finish().map_err(std::io::Error::other)?;
        Ok(())
    })
}

fn join_rel(dir: &Utf8Path, base: &str) -> Utf8PathBuf {
    if dir.as_str().is_empty() || dir.as_str() == "." {
        Utf8PathBuf::from(base)
    } else {
        dir.join(base)
    }
}

fn typeflag_from_metadata(path: &Utf8Path, meta: &std::fs::Metadata) -> Result<TypeFlag> {
    let ft = meta.file_type();
    Ok(if ft.is_dir() {
        TypeFlag::Directory
    } else if ft.is_file() {
        TypeFlag::Regular
    } else if ft.is_symlink() {
        TypeFlag::Symlink
    } else if ft.is_char_device() {
        TypeFlag::CharDevice
    } else if ft.is_block_device() {
        TypeFlag::BlockDevice
    } else if ft.is_fifo() {
        TypeFlag::Fifo
    } else {
        return Err(Error::UnsupportedTypeflag {
            path: path.to_path_buf(),
            typeflag: 0,
        });
    })
}
