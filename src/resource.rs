use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TetherError};

/// A project-relative path with symlinks resolved and `/` separators.
///
/// Only [`ResourcePath::resolve`] builds one, so holding a value proves the
/// path stayed inside the project root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourcePath(String);

impl ResourcePath {
    /// Canonicalize `raw` against `project_root`, which must itself be canonical.
    ///
    /// Any `..` component is rejected outright, before touching the
    /// filesystem. The remaining path is resolved through its deepest
    /// existing ancestor (the target file need not exist yet) and must land
    /// under the root.
    pub fn resolve(project_root: &Path, raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(TetherError::Validation("resource path is empty".into()));
        }
        if trimmed.contains('\0') {
            return Err(TetherError::Validation(
                "resource path contains a NUL byte".into(),
            ));
        }

        let path = Path::new(trimmed);
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(TetherError::PathTraversal(trimmed.into()));
        }

        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            project_root.join(path)
        };
        let resolved = resolve_existing_prefix(&joined)?;

        let relative = resolved
            .strip_prefix(project_root)
            .map_err(|_| TetherError::PathTraversal(trimmed.into()))?;
        let parts: Vec<String> = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();
        if parts.is_empty() {
            return Err(TetherError::Validation(
                "resource path refers to the project root itself".into(),
            ));
        }
        Ok(Self(parts.join("/")))
    }

    #[cfg(test)]
    pub(crate) fn from_stored(value: String) -> Self {
        Self(value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonicalize the deepest ancestor that exists and re-append the rest.
fn resolve_existing_prefix(path: &Path) -> Result<PathBuf> {
    let mut missing: Vec<&std::ffi::OsStr> = Vec::new();
    let mut cursor = path;
    loop {
        match cursor.canonicalize() {
            Ok(mut base) => {
                for part in missing.iter().rev() {
                    base.push(part);
                }
                return Ok(base);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let Some(name) = cursor.file_name() else {
                    return Err(e.into());
                };
                missing.push(name);
                match cursor.parent() {
                    Some(parent) => cursor = parent,
                    None => return Err(e.into()),
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn root() -> (tempfile::TempDir, PathBuf) {
        let dir = tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        (dir, root)
    }

    #[test]
    fn relative_paths_normalize() {
        let (_dir, root) = root();
        fs::create_dir_all(root.join("src")).unwrap();
        fs::write(root.join("src/lib.rs"), "").unwrap();

        let a = ResourcePath::resolve(&root, "src/lib.rs").unwrap();
        let b = ResourcePath::resolve(&root, "./src//lib.rs").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "src/lib.rs");
    }

    #[test]
    fn missing_files_still_resolve() {
        let (_dir, root) = root();
        let p = ResourcePath::resolve(&root, "not/yet/created.rs").unwrap();
        assert_eq!(p.as_str(), "not/yet/created.rs");
    }

    #[test]
    fn absolute_path_inside_root_is_relativized() {
        let (_dir, root) = root();
        let abs = root.join("docs/readme.md");
        let p = ResourcePath::resolve(&root, abs.to_str().unwrap()).unwrap();
        assert_eq!(p.as_str(), "docs/readme.md");
    }

    #[test]
    fn traversal_is_rejected() {
        let (_dir, root) = root();
        for raw in ["../../etc/passwd", "src/../../x", "..", "/etc/passwd"] {
            let err = ResourcePath::resolve(&root, raw).unwrap_err();
            assert!(
                matches!(err, TetherError::PathTraversal(_)),
                "{raw} should be a traversal, got {err:?}"
            );
        }
    }

    #[test]
    fn dot_dot_rejected_even_when_it_stays_inside() {
        let (_dir, root) = root();
        fs::create_dir_all(root.join("src")).unwrap();
        let err = ResourcePath::resolve(&root, "src/../Cargo.toml").unwrap_err();
        assert!(matches!(err, TetherError::PathTraversal(_)));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escaping_root_is_rejected() {
        let (_dir, root) = root();
        let outside = tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), root.join("escape")).unwrap();
        let err = ResourcePath::resolve(&root, "escape/secret.txt").unwrap_err();
        assert!(matches!(err, TetherError::PathTraversal(_)));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_inside_root_resolves_to_target() {
        let (_dir, root) = root();
        fs::create_dir_all(root.join("real")).unwrap();
        std::os::unix::fs::symlink(root.join("real"), root.join("alias")).unwrap();
        let p = ResourcePath::resolve(&root, "alias/file.rs").unwrap();
        assert_eq!(p.as_str(), "real/file.rs");
    }

    #[test]
    fn empty_and_root_paths_are_validation_errors() {
        let (_dir, root) = root();
        assert!(matches!(
            ResourcePath::resolve(&root, "  "),
            Err(TetherError::Validation(_))
        ));
        assert!(matches!(
            ResourcePath::resolve(&root, "."),
            Err(TetherError::Validation(_))
        ));
    }
}
