//! C1: lexical path cleaning and symlink-safe joins rooted at a directory.
//!
//! `clean` is a pure string operation; `secure_join` additionally consults
//! the filesystem (via a `cap_std::fs::Dir`) to resolve symlinks that exist
//! within the root without ever leaving it.

use std::collections::VecDeque;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::fs::Dir;

use crate::error::{Error, Result};

/// Maximum number of symlink hops `secure_join` will follow before giving up.
const MAX_SYMLINK_HOPS: u32 = 255;

/// Lexically normalize a POSIX path: collapse `.` components, resolve `..`
/// purely syntactically, remove duplicate separators, and preserve the
/// absolute/relative-ness of the input. Empty input returns empty output.
pub fn clean(p: &str) -> String {
    if p.is_empty() {
        return String::new();
    }

    let rooted = p.starts_with('/');
    let mut stack: Vec<&str> = Vec::new();

    for component in p.split('/') {
        match component {
            "" | "." => continue,
            ".." => {
                if matches!(stack.last(), Some(&"..")) || (stack.is_empty() && !rooted) {
                    stack.push("..");
                } else {
                    stack.pop();
                }
            }
            other => stack.push(other),
        }
    }

    let joined = stack.join("/");
    match (rooted, joined.is_empty()) {
        (true, true) => "/".to_string(),
        (true, false) => format!("/{joined}"),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

/// Split a cleaned archive/file name into its parent directory and base
/// component, the way the extractor and generator need (dirname resolved
/// through `secure_join`, basename preserved literally).
pub fn split(p: &str) -> (&str, &str) {
    let cleaned = p.trim_end_matches('/');
    match cleaned.rfind('/') {
        Some(0) => ("/", &cleaned[1..]),
        Some(idx) => (&cleaned[..idx], &cleaned[idx + 1..]),
        None => ("", cleaned),
    }
}

fn components(p: &str) -> VecDeque<String> {
    p.split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .map(String::from)
        .collect()
}

/// Resolve `unsafe_path` against `root_dir` such that the result is
/// guaranteed to be lexically under the root, honoring symlinks that exist
/// within the root. Absolute symlink targets are reinterpreted as rooted at
/// `root_dir`, never at the host filesystem root. Missing path components
/// are tolerated (the caller may be about to create them).
pub fn secure_join(root_dir: &Dir, unsafe_path: &Utf8Path) -> Result<Utf8PathBuf> {
    let mut resolved: Vec<String> = Vec::new();
    let mut remaining: VecDeque<String> = components(unsafe_path.as_str());
    let mut hops = 0u32;

    while let Some(name) = remaining.pop_front() {
        if name == ".." {
            if resolved.pop().is_none() {
                return Err(Error::EscapesRoot {
                    path: unsafe_path.to_path_buf(),
                });
            }
            continue;
        }

        let candidate = Utf8PathBuf::from(resolved.join("/")).join(&name);
        let meta = match root_dir.symlink_metadata(candidate.as_str()) {
            Ok(meta) => meta,
            // Missing, or blocked by a non-directory ancestor (e.g. a
            // synthesized whiteout device node standing where a directory
            // is about to be created): tolerated the same way, since the
            // caller's MkdirAll is responsible for fixing up the tree.
            Err(e)
                if e.kind() == std::io::ErrorKind::NotFound
                    || e.kind() == std::io::ErrorKind::NotADirectory =>
            {
                resolved.push(name);
                continue;
            }
            Err(e) => return Err(Error::io(candidate, e)),
        };

        if meta.file_type().is_symlink() {
            hops += 1;
            if hops > MAX_SYMLINK_HOPS {
                return Err(Error::SymlinkLoop {
                    path: unsafe_path.to_path_buf(),
                });
            }

            let target = root_dir
                .read_link_contents(candidate.as_str())
                .map_err(|e| Error::io(candidate.clone(), e))?;
            let target = target.to_string_lossy().into_owned();
            let mut target_components = components(&target);

            if target.starts_with('/') {
                resolved.clear();
            }
            // relative targets resolve against `resolved` (the symlink's
            // parent directory, since `name` itself was never pushed).

            target_components.extend(remaining.drain(..));
            remaining = target_components;
            continue;
        }

        resolved.push(name);
    }

    Ok(Utf8PathBuf::from(resolved.join("/")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cap_std::ambient_authority;

    #[test]
    fn clean_basic() {
        assert_eq!(clean(""), "");
        assert_eq!(clean("/"), "/");
        assert_eq!(clean("a/b/../c"), "a/c");
        assert_eq!(clean("/a/b/../../c"), "/c");
        assert_eq!(clean("/../../a"), "/a");
        assert_eq!(clean("../../a"), "../../a");
        assert_eq!(clean("a//b/./c/"), "a/b/c");
        assert_eq!(clean("."), ".");
    }

    #[test]
    fn clean_is_idempotent() {
        for p in ["a/b/../c", "/a/./b//c", "../x/../y", "/"] {
            let once = clean(p);
            assert_eq!(clean(&once), once);
        }
    }

    #[test]
    fn split_basic() {
        assert_eq!(split("a/b/c"), ("a/b", "c"));
        assert_eq!(split("/a"), ("/", "a"));
        assert_eq!(split("a"), ("", "a"));
        assert_eq!(split("a/b/"), ("a", "b"));
    }

    #[test]
    fn secure_join_tolerates_non_directory_ancestor() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Dir::open_ambient_dir(tmp.path(), ambient_authority()).unwrap();
        root.write("plain", "x").unwrap();

        // "plain" exists but isn't a directory; the caller's MkdirAll is
        // responsible for replacing it, not SecureJoin.
        let resolved = secure_join(&root, Utf8Path::new("plain/sub")).unwrap();
        assert_eq!(resolved, Utf8PathBuf::from("plain/sub"));
    }

    #[test]
    fn secure_join_tolerates_missing_components() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Dir::open_ambient_dir(tmp.path(), ambient_authority()).unwrap();
        let resolved = secure_join(&root, Utf8Path::new("a/b/c")).unwrap();
        assert_eq!(resolved, Utf8PathBuf::from("a/b/c"));
    }

    #[test]
    fn secure_join_rejects_escape_above_root() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Dir::open_ambient_dir(tmp.path(), ambient_authority()).unwrap();
        let err = secure_join(&root, Utf8Path::new("../../etc")).unwrap_err();
        assert!(matches!(err, Error::EscapesRoot { .. }));
    }

    #[test]
    fn secure_join_follows_symlink_within_root() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Dir::open_ambient_dir(tmp.path(), ambient_authority()).unwrap();
        root.create_dir("real").unwrap();
        root.symlink("real", "link").unwrap();

        let resolved = secure_join(&root, Utf8Path::new("link/sub")).unwrap();
        assert_eq!(resolved, Utf8PathBuf::from("real/sub"));
    }

    #[test]
    fn secure_join_rewrites_absolute_symlink_target_to_root() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Dir::open_ambient_dir(tmp.path(), ambient_authority()).unwrap();
        root.symlink("/", "escape").unwrap();

        // an absolute symlink to "/" must resolve to the root itself, not
        // the host filesystem root.
        let resolved = secure_join(&root, Utf8Path::new("escape/etc/passwd")).unwrap();
        assert_eq!(resolved, Utf8PathBuf::from("etc/passwd"));
    }

    #[test]
    fn secure_join_detects_symlink_loop() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Dir::open_ambient_dir(tmp.path(), ambient_authority()).unwrap();
        root.symlink("a", "b").unwrap();
        root.symlink("b", "a").unwrap();

        let err = secure_join(&root, Utf8Path::new("a/x")).unwrap_err();
        assert!(matches!(err, Error::SymlinkLoop { .. }));
    }

    proptest::proptest! {
        #[test]
        fn clean_never_panics(p in "[a-zA-Z0-9./]{0,64}") {
            let _ = clean(&p);
        }

        #[test]
        fn clean_idempotent_prop(p in "[a-zA-Z0-9./]{0,64}") {
            let once = clean(&p);
            let twice = clean(&once);
            proptest::prop_assert_eq!(once, twice);
        }
    }
}
