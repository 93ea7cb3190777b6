//! Sandbox root and canonical path resolution
//!
//! Every path handed to the engine goes through [`PathResolver`], which is
//! the only producer of [`ResolvedPath`]. Containment is always decided on
//! canonical forms, after symlinks have been resolved.

use super::lock::LockKey;
use crate::error::{Error, Result, SandboxError};
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

/// Canonical directory all resolved paths live under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxRoot {
    path: PathBuf,
}

impl SandboxRoot {
    /// Create the directory if needed and pin its canonical form
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!("Creating sandbox root: {:?}", path);
        }
        fs::create_dir_all(path)?;
        let path = path.canonicalize()?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True when `candidate` is the root or below it
    pub fn contains(&self, candidate: &Path) -> bool {
        is_within(&self.path, candidate)
    }
}

/// A path proven to lie inside the sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    requested: String,
    canonical: PathBuf,
    relative: PathBuf,
}

impl ResolvedPath {
    /// The string the caller passed in
    pub fn requested(&self) -> &str {
        &self.requested
    }

    /// Absolute canonical location
    pub fn canonical(&self) -> &Path {
        &self.canonical
    }

    /// Canonical location relative to the sandbox root
    pub fn sandbox_relative(&self) -> &Path {
        &self.relative
    }

    /// Sandbox-relative location with `/` separators, `.` for the root
    pub fn location(&self) -> String {
        if self.is_root() {
            return ".".to_string();
        }
        self.relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }

    pub fn is_root(&self) -> bool {
        self.relative.as_os_str().is_empty()
    }

    pub fn file_name(&self) -> Option<String> {
        self.canonical
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
    }

    pub fn lock_key(&self) -> LockKey {
        LockKey::from_canonical(&self.canonical)
    }
}

/// Resolves caller-supplied paths against the sandbox root
#[derive(Debug, Clone)]
pub struct PathResolver {
    root: SandboxRoot,
}

impl PathResolver {
    pub fn new(root: SandboxRoot) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// Resolve a sandbox-relative path.
    ///
    /// Absolute paths, drive prefixes and `..` segments are rejected outright
    /// (both `/` and `\` count as separators); `.` and empty segments are
    /// dropped. The remaining path is canonicalized and must stay inside the
    /// root.
    pub fn resolve(&self, relative: &str) -> Result<ResolvedPath> {
        let normalized = normalize_relative(relative).map_err(|reason| {
            debug!("Rejected path {:?}: {}", relative, reason);
            outside(relative)
        })?;

        let joined = self.root.path().join(normalized);
        self.contain(relative, &joined)
    }

    /// Re-validate an absolute path, e.g. one previously returned by
    /// [`ResolvedPath::canonical`]
    pub fn resolve_absolute(&self, path: &Path) -> Result<ResolvedPath> {
        let requested = path.to_string_lossy().to_string();
        if !path.is_absolute() || path.components().any(|c| c == Component::ParentDir) {
            return Err(outside(&requested));
        }
        self.contain(&requested, path)
    }

    fn contain(&self, requested: &str, candidate: &Path) -> Result<ResolvedPath> {
        let canonical = canonicalize_lenient(candidate).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                // a dangling symlink, whose target cannot be proven contained
                outside(requested)
            } else {
                Error::Io(e)
            }
        })?;

        let relative = match canonical.strip_prefix(self.root.path()) {
            Ok(rel) => rel.to_path_buf(),
            Err(_) => return Err(outside(requested)),
        };

        Ok(ResolvedPath {
            requested: requested.to_string(),
            canonical,
            relative,
        })
    }
}

fn outside(requested: &str) -> Error {
    Error::Sandbox(SandboxError::PathOutsideSandbox(requested.to_string()))
}

/// True when `candidate` equals `root` or lies below it, component-wise
pub(crate) fn is_within(root: &Path, candidate: &Path) -> bool {
    candidate.starts_with(root)
}

/// Whether `e`, raised while looking up `path`, means nothing is there.
///
/// Besides `NotFound` this covers lookups through a regular file
/// (`a.txt/x`), which the OS reports as "not a directory".
pub(crate) fn is_missing(e: &io::Error, path: &Path) -> bool {
    e.kind() == io::ErrorKind::NotFound
        || path
            .ancestors()
            .skip(1)
            .any(|ancestor| fs::metadata(ancestor).map(|m| !m.is_dir()).unwrap_or(false))
}

/// Lexically normalize a relative path, refusing anything that could climb
pub(crate) fn normalize_relative(input: &str) -> std::result::Result<PathBuf, &'static str> {
    if input.contains('\0') {
        return Err("contains NUL byte");
    }
    if input.starts_with('/') || input.starts_with('\\') {
        return Err("absolute path");
    }
    let mut chars = input.chars();
    if let (Some(drive), Some(':')) = (chars.next(), chars.next()) {
        if drive.is_ascii_alphabetic() {
            return Err("drive prefix");
        }
    }

    let mut normalized = PathBuf::new();
    for segment in input.split(|c| c == '/' || c == '\\') {
        match segment {
            "" | "." => {}
            ".." => return Err("parent directory segment"),
            name => normalized.push(name),
        }
    }
    Ok(normalized)
}

/// Canonicalize a path that may not exist yet.
///
/// The deepest existing ancestor is canonicalized (resolving symlinks) and
/// the missing tail is appended unchanged. An existing entry that cannot be
/// canonicalized, such as a dangling symlink, yields `NotFound`.
pub(crate) fn canonicalize_lenient(path: &Path) -> io::Result<PathBuf> {
    let mut current = path.to_path_buf();
    let mut remaining: Vec<OsString> = Vec::new();

    loop {
        match fs::symlink_metadata(&current) {
            Ok(_) => break,
            Err(e) if is_missing(&e, &current) => {
                let name = current.file_name().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "path has no existing ancestor")
                })?;
                remaining.push(name.to_owned());
                current = match current.parent() {
                    Some(parent) => parent.to_path_buf(),
                    None => break,
                };
            }
            Err(e) => return Err(e),
        }
    }

    let mut result = fs::canonicalize(&current)?;
    for part in remaining.into_iter().rev() {
        result.push(part);
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tempfile::tempdir;

    fn resolver() -> (tempfile::TempDir, PathResolver) {
        let dir = tempdir().unwrap();
        let root = SandboxRoot::create(dir.path().join("box")).unwrap();
        (dir, PathResolver::new(root))
    }

    #[test]
    fn test_sandbox_root_created() {
        let dir = tempdir().unwrap();
        let root = SandboxRoot::create(dir.path().join("a/b")).unwrap();
        assert!(root.path().is_dir());
        assert!(root.path().is_absolute());
        assert!(root.contains(&root.path().join("x")));
        assert!(!root.contains(dir.path()));
    }

    #[test]
    fn test_traversal_rejected() {
        let (_dir, resolver) = resolver();

        for input in [
            "a/../../etc/passwd",
            "/etc/passwd",
            "a/./b/../../c",
            "..",
            "a\\..\\..\\secret",
            "a/..\\b",
            "\\windows\\system32",
            "C:\\boot.ini",
            "c:secret",
            "nul\0byte",
        ] {
            let err = resolver.resolve(input).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::SecurityViolation, "input {:?}", input);
        }
    }

    #[test]
    fn test_resolve_normalizes() {
        let (_dir, resolver) = resolver();

        let resolved = resolver.resolve("docs/./reports//q1.txt").unwrap();
        assert_eq!(resolved.canonical(), resolver.root().join("docs/reports/q1.txt"));
        assert_eq!(resolved.location(), "docs/reports/q1.txt");
        assert_eq!(resolved.requested(), "docs/./reports//q1.txt");
        assert_eq!(resolved.file_name().as_deref(), Some("q1.txt"));
    }

    #[test]
    fn test_root_resolves_to_itself() {
        let (_dir, resolver) = resolver();

        for input in ["", ".", "./", "./."] {
            let resolved = resolver.resolve(input).unwrap();
            assert!(resolved.is_root());
            assert_eq!(resolved.canonical(), resolver.root());
            assert_eq!(resolved.location(), ".");
        }
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let (_dir, resolver) = resolver();
        fs::create_dir_all(resolver.root().join("a/b")).unwrap();
        fs::write(resolver.root().join("a/b/file.txt"), "x").unwrap();

        for input in ["a/b/file.txt", "a/./b/", "a/b/missing/deeper.txt", "."] {
            let first = resolver.resolve(input).unwrap();
            let again = resolver.resolve(&first.location()).unwrap();
            assert_eq!(first.canonical(), again.canonical());

            let absolute = resolver.resolve_absolute(first.canonical()).unwrap();
            assert_eq!(first.canonical(), absolute.canonical());
        }
    }

    #[test]
    fn test_resolve_absolute_outside_rejected() {
        let (dir, resolver) = resolver();

        let err = resolver.resolve_absolute(dir.path()).unwrap_err();
        assert!(err.is_security_violation());

        let sneaky = resolver.root().join("..").join("box");
        let err = resolver.resolve_absolute(&sneaky).unwrap_err();
        assert!(err.is_security_violation());

        let err = resolver.resolve_absolute(Path::new("relative/path")).unwrap_err();
        assert!(err.is_security_violation());
    }

    #[test]
    fn test_sibling_prefix_is_not_contained() {
        let dir = tempdir().unwrap();
        let root = SandboxRoot::create(dir.path().join("box")).unwrap();
        fs::create_dir_all(dir.path().join("box2")).unwrap();
        let resolver = PathResolver::new(root);

        let sibling = dir.path().join("box2").canonicalize().unwrap();
        let err = resolver.resolve_absolute(&sibling).unwrap_err();
        assert!(err.is_security_violation());
    }

    #[test]
    fn test_spellings_share_lock_key() {
        let (_dir, resolver) = resolver();

        let a = resolver.resolve("x/y.txt").unwrap();
        let b = resolver.resolve("./x//./y.txt").unwrap();
        assert_eq!(a.lock_key(), b.lock_key());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_rejected() {
        let (dir, resolver) = resolver();
        let outside_dir = dir.path().join("outside");
        fs::create_dir_all(&outside_dir).unwrap();
        std::os::unix::fs::symlink(&outside_dir, resolver.root().join("link")).unwrap();

        let err = resolver.resolve("link/passwd").unwrap_err();
        assert!(err.is_security_violation());

        let err = resolver.resolve("link").unwrap_err();
        assert!(err.is_security_violation());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_inside_sandbox_allowed() {
        let (_dir, resolver) = resolver();
        fs::create_dir_all(resolver.root().join("real")).unwrap();
        std::os::unix::fs::symlink(resolver.root().join("real"), resolver.root().join("alias"))
            .unwrap();

        let resolved = resolver.resolve("alias/new.txt").unwrap();
        assert_eq!(resolved.canonical(), resolver.root().join("real/new.txt"));
    }

    #[test]
    fn test_path_below_a_file_resolves() {
        let (_dir, resolver) = resolver();
        fs::write(resolver.root().join("a.txt"), "x").unwrap();

        let resolved = resolver.resolve("a.txt/x").unwrap();
        assert_eq!(resolved.canonical(), resolver.root().join("a.txt/x"));

        let err = fs::metadata(resolved.canonical()).unwrap_err();
        assert!(is_missing(&err, resolved.canonical()));
    }

    #[cfg(unix)]
    #[test]
    fn test_dangling_symlink_rejected() {
        let (dir, resolver) = resolver();
        std::os::unix::fs::symlink(dir.path().join("nowhere"), resolver.root().join("dangling"))
            .unwrap();

        let err = resolver.resolve("dangling").unwrap_err();
        assert!(err.is_security_violation());
    }
}
