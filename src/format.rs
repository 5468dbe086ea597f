//! Data model shared across components: the on-disk format tag and the
//! identity-mapping options that accompany it.

use crate::idmap::IdMap;

/// Which xattr namespace an `OverlayfsRootfs` instance uses for its
/// overlay-managed metadata (`trusted.*` requires `CAP_SYS_ADMIN`; `user.*`
/// is available to unprivileged processes when the kernel is configured to
/// allow it). Derived from `OnDiskFormat::OverlayfsRootfs`'s `user_xattr`
/// flag rather than stored independently, so the two can never disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayNamespace {
    Trusted,
    User,
}

impl OverlayNamespace {
    pub fn prefix(self) -> &'static str {
        match self {
            OverlayNamespace::Trusted => "trusted.",
            OverlayNamespace::User => "user.",
        }
    }

    fn from_user_xattr(user_xattr: bool) -> Self {
        if user_xattr {
            OverlayNamespace::User
        } else {
            OverlayNamespace::Trusted
        }
    }
}

/// Host/container identity-mapping configuration shared by the extractor
/// and generator.
#[derive(Debug, Clone, Default)]
pub struct MapOptions {
    pub uid_mappings: Vec<IdMap>,
    pub gid_mappings: Vec<IdMap>,
    pub rootless: bool,
}

/// Tagged variant controlling how the filesystem under a root directory is
/// interpreted: as a plain extracted directory tree (OCI whiteouts are tar
/// marker files only) or as a live overlayfs upperdir (whiteouts may be
/// char(0,0) device nodes or opaque-xattr directories).
#[derive(Debug, Clone)]
pub enum OnDiskFormat {
    DirRootfs {
        map: MapOptions,
    },
    OverlayfsRootfs {
        map: MapOptions,
        /// If true, overlay-managed metadata lives in the `user.*` xattr
        /// namespace (available to unprivileged processes); otherwise in
        /// `trusted.*` (requires `CAP_SYS_ADMIN`).
        user_xattr: bool,
    },
}

impl OnDiskFormat {
    pub fn map_options(&self) -> &MapOptions {
        match self {
            OnDiskFormat::DirRootfs { map } => map,
            OnDiskFormat::OverlayfsRootfs { map, .. } => map,
        }
    }

    /// The overlay xattr namespace this format uses, if any.
    pub fn overlay_namespace(&self) -> Option<OverlayNamespace> {
        match self {
            OnDiskFormat::DirRootfs { .. } => None,
            OnDiskFormat::OverlayfsRootfs { user_xattr, .. } => {
                Some(OverlayNamespace::from_user_xattr(*user_xattr))
            }
        }
    }
}
