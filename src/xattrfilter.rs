//! C3: the xattr filter registry. Maps xattr names/prefixes to policy
//! objects that decide masking and on-disk/archive name translation.

use std::sync::Arc;

use crate::format::OnDiskFormat;

/// Policy object for a registered xattr name or prefix.
pub trait XattrFilter: Send + Sync {
    /// If true, on-disk iteration of this xattr must be skipped, and
    /// xattr-clearing must not remove it.
    fn masked_on_disk(&self, fmt: &OnDiskFormat, name: &str) -> bool;

    /// The on-disk name to use when writing an archive xattr; `None` drops
    /// it instead of writing anything.
    fn to_disk(&self, fmt: &OnDiskFormat, name: &str) -> Option<String>;

    /// The archive name to use when reading an on-disk xattr; `None` drops
    /// it instead of emitting a PAX record.
    fn to_tar(&self, fmt: &OnDiskFormat, name: &str) -> Option<String>;
}

/// `security.selinux`, `system.nfs4_acl`: always masked, always dropped in
/// both directions.
struct ForbiddenFilter;

impl XattrFilter for ForbiddenFilter {
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

/// `{trusted|user}.overlay.` prefix filter, one instance per namespace. It
/// escapes overlay-namespaced xattrs one level when writing them to disk, so
/// that archive-sourced xattr data does not get misinterpreted by a kernel
/// overlayfs mount; and unescapes on the way back into an archive. Names in
/// the namespace that were never escaped are kernel-managed state and are
/// invisible to archive generation.
struct OverlayFilter {
    ns: &'static str,
}

impl OverlayFilter {
    fn doubled_prefix(&self) -> String {
        format!("{}overlay.overlay.", self.ns)
    }

    fn single_prefix(&self) -> String {
        format!("{}overlay.", self.ns)
    }

    fn matches_namespace(&self, fmt: &OnDiskFormat) -> bool {
        fmt.overlay_namespace()
            .is_some_and(|ns| ns.prefix() == self.ns)
    }
}

impl XattrFilter for OverlayFilter {
    fn masked_on_disk(&self, fmt: &OnDiskFormat, name: &str) -> bool {
        self.matches_namespace(fmt) && !name.starts_with(&self.doubled_prefix())
    }

    fn to_disk(&self, fmt: &OnDiskFormat, name: &str) -> Option<String> {
        if !self.matches_namespace(fmt) {
            return Some(name.to_string());
        }
        let suffix = name.strip_prefix(&self.single_prefix())?;
        Some(format!("{}{}", self.doubled_prefix(), suffix))
    }

    fn to_tar(&self, fmt: &OnDiskFormat, name: &str) -> Option<String> {
        if !self.matches_namespace(fmt) {
            return Some(name.to_string());
        }
        let suffix = name.strip_prefix(&self.doubled_prefix())?;
        Some(format!("{}{}", self.single_prefix(), suffix))
    }
}

/// Pass-through behavior for any xattr with no registered filter.
struct PassthroughFilter;

impl XattrFilter for PassthroughFilter {
    fn masked_on_disk(&self, _fmt: &OnDiskFormat, _name: &str) -> bool {
        false
    }
    fn to_disk(&self, _fmt: &OnDiskFormat, name: &str) -> Option<String> {
        Some(name.to_string())
    }
    fn to_tar(&self, _fmt: &OnDiskFormat, name: &str) -> Option<String> {
        Some(name.to_string())
    }
}

enum Key {
    Exact(&'static str),
    Prefix(&'static str),
}

/// Process-wide registry of xattr filters. Built immutably at startup;
/// `with_override` produces a derived registry for tests without mutating
/// global state.
pub struct Registry {
    entries: Vec<(Key, Arc<dyn XattrFilter>)>,
    fallback: Arc<dyn XattrFilter>,
}

impl Registry {
    /// The default registry: the forbidden filter for SELinux/NFSv4 ACL
    /// xattrs, and the overlay escape filter for both xattr namespaces.
    pub fn default_registry() -> Self {
        let forbidden: Arc<dyn XattrFilter> = Arc::new(ForbiddenFilter);
        Registry {
            entries: vec![
                (Key::Exact("security.selinux"), Arc::clone(&forbidden)),
                (Key::Exact("system.nfs4_acl"), forbidden),
                (
                    Key::Prefix("trusted.overlay."),
                    Arc::new(OverlayFilter { ns: "trusted." }),
                ),
                (
                    Key::Prefix("user.overlay."),
                    Arc::new(OverlayFilter { ns: "user." }),
                ),
            ],
            fallback: Arc::new(PassthroughFilter),
        }
    }

    /// Add or replace an entry, returning a new registry. Intended for test
    /// code that needs to exercise custom filter behavior; production code
    /// should use `default_registry()` as process-wide, read-only
    /// configuration.
    pub fn with_prefix_override(mut self, prefix: &'static str, filter: Arc<dyn XattrFilter>) -> Self {
        self.entries.push((Key::Prefix(prefix), filter));
        self
    }

    fn lookup(&self, name: &str) -> &Arc<dyn XattrFilter> {
        let mut best_prefix_len = 0;
        let mut best: Option<&Arc<dyn XattrFilter>> = None;
        for (key, filter) in self.entries.iter().rev() {
            match key {
                Key::Exact(k) if *k == name => return filter,
                Key::Prefix(k) if name.starts_with(k) && k.len() >= best_prefix_len => {
                    best_prefix_len = k.len();
                    best = Some(filter);
                }
                _ => {}
            }
        }
        best.unwrap_or(&self.fallback)
    }

    pub fn masked_on_disk(&self, fmt: &OnDiskFormat, name: &str) -> bool {
        self.lookup(name).masked_on_disk(fmt, name)
    }

    pub fn to_disk(&self, fmt: &OnDiskFormat, name: &str) -> Option<String> {
        self.lookup(name).to_disk(fmt, name)
    }

    pub fn to_tar(&self, fmt: &OnDiskFormat, name: &str) -> Option<String> {
        self.lookup(name).to_tar(fmt, name)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::default_registry()
    }
}
