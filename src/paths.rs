//! Candidate filename resolution inside the safe root
//!
//! Ticket text names files loosely: absolute paths, repo-relative paths, or
//! just a basename. Everything is mapped to a concrete path under the safe
//! root, or classified as a new file, and anything that would escape the root
//! is rejected.

use crate::error::RepairError;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Directories never searched for partial matches.
pub const IGNORED_DIRS: &[&str] = &[
    ".git",
    ".hg",
    ".venv",
    "venv",
    "__pycache__",
    ".pytest_cache",
    "node_modules",
    "target",
];

/// Outcome of resolving one candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// An existing file under the root.
    Existing(PathBuf),
    /// No such file; creating it at this path stays inside the root.
    NewFile(PathBuf),
}

impl Resolution {
    pub fn path(&self) -> &Path {
        match self {
            Resolution::Existing(p) | Resolution::NewFile(p) => p,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Resolution::NewFile(_))
    }
}

/// Resolve `.` and `..` without touching the filesystem.
///
/// `..` at the top of a relative path is kept so containment checks still see
/// the escape.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let popped = match out.components().next_back() {
                    Some(Component::Normal(_)) => out.pop(),
                    _ => false,
                };
                if !popped && !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

pub fn is_ignored_dir(name: &str) -> bool {
    IGNORED_DIRS.contains(&name)
}

#[derive(Debug, Clone)]
pub struct PathResolver {
    root: PathBuf,
}

impl PathResolver {
    /// Build a resolver for `root`, which must exist.
    pub fn new(root: &Path) -> anyhow::Result<Self> {
        let root = root.canonicalize().map_err(|e| {
            anyhow::anyhow!("Safe root {} is not accessible: {}", root.display(), e)
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// True when `path` (normalized, symlinks followed where it exists) lies
    /// inside the safe root.
    pub fn contains(&self, path: &Path) -> bool {
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        let normalized = normalize_lexically(&absolute);
        let effective = canonical_prefix(&normalized);
        effective.starts_with(&self.root)
    }

    /// Map a candidate filename to a concrete path under the root.
    pub fn resolve(&self, candidate: &str) -> Result<Resolution, RepairError> {
        let cleaned = clean_candidate(candidate);
        let out_of_scope = || RepairError::OutOfScopePath {
            candidate: candidate.to_string(),
            root: self.root.clone(),
        };
        if cleaned.is_empty() {
            return Err(out_of_scope());
        }

        let raw = PathBuf::from(&cleaned);
        if raw.is_absolute() {
            let normalized = normalize_lexically(&raw);
            if !self.contains(&normalized) {
                return Err(out_of_scope());
            }
            let effective = canonical_prefix(&normalized);
            return Ok(if effective.is_file() {
                Resolution::Existing(effective)
            } else {
                Resolution::NewFile(effective)
            });
        }

        let joined = normalize_lexically(&self.root.join(&raw));
        if self.contains(&joined) && joined.is_file() {
            return Ok(Resolution::Existing(canonical_prefix(&joined)));
        }

        if let Some(found) = self.partial_match(&raw) {
            return Ok(Resolution::Existing(found));
        }

        if self.contains(&joined) {
            debug!(candidate = %cleaned, "no match under root, treating as new file");
            Ok(Resolution::NewFile(canonical_prefix(&joined)))
        } else {
            Err(out_of_scope())
        }
    }

    /// Search the root for files whose name equals the candidate's final
    /// segment. Matches that also end with the full candidate path are
    /// preferred; among the rest the shallowest path wins.
    fn partial_match(&self, candidate: &Path) -> Option<PathBuf> {
        let file_name = candidate.file_name()?;
        let wanted: Vec<Component<'_>> = candidate
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .collect();

        let mut matches: Vec<PathBuf> = WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| {
                e.depth() == 0
                    || !e.file_type().is_dir()
                    || !is_ignored_dir(&e.file_name().to_string_lossy())
            })
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() && e.file_name() == file_name)
            .map(|e| e.into_path())
            .collect();

        if matches.is_empty() {
            return None;
        }

        if wanted.len() > 1 {
            let suffixed: Vec<PathBuf> = matches
                .iter()
                .filter(|p| ends_with_components(p, &wanted))
                .cloned()
                .collect();
            if !suffixed.is_empty() {
                matches = suffixed;
            }
        }

        matches.sort_by(|a, b| {
            a.components()
                .count()
                .cmp(&b.components().count())
                .then_with(|| a.cmp(b))
        });

        if matches.len() > 1 {
            warn!(
                candidate = %candidate.display(),
                chosen = %matches[0].display(),
                alternatives = matches.len() - 1,
                "ambiguous filename, picking the shallowest match"
            );
        }
        matches.into_iter().next()
    }
}

fn clean_candidate(candidate: &str) -> String {
    let trimmed = candidate
        .trim()
        .trim_matches('`')
        .trim_matches('"')
        .trim_matches('\'')
        .trim();
    let normalized = trimmed.replace('\\', "/");
    let mut out = normalized.as_str();
    while let Some(rest) = out.strip_prefix("./") {
        out = rest;
    }
    out.to_string()
}

fn ends_with_components(path: &Path, wanted: &[Component<'_>]) -> bool {
    let have: Vec<Component<'_>> = path.components().collect();
    have.len() >= wanted.len() && have[have.len() - wanted.len()..] == *wanted
}

/// Canonicalize the longest existing ancestor of `path` and re-append the
/// rest, so symlinked ancestors cannot smuggle a path outside the root.
fn canonical_prefix(path: &Path) -> PathBuf {
    let mut existing = path.to_path_buf();
    let mut tail = Vec::new();
    loop {
        if let Ok(canon) = existing.canonicalize() {
            let mut out = canon;
            for part in tail.iter().rev() {
                out.push(part);
            }
            return out;
        }
        match (existing.file_name().map(|n| n.to_os_string()), existing.parent()) {
            (Some(name), Some(parent)) => {
                tail.push(name);
                existing = parent.to_path_buf();
            }
            _ => return path.to_path_buf(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn touch(root: &Path, rel: &str) -> PathBuf {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "x = 1\n").unwrap();
        path.canonicalize().unwrap()
    }

    #[test]
    fn test_normalize_lexically() {
        assert_eq!(
            normalize_lexically(Path::new("/a/b/../c/./d")),
            PathBuf::from("/a/c/d")
        );
        assert_eq!(
            normalize_lexically(Path::new("../x/y")),
            PathBuf::from("../x/y")
        );
        assert_eq!(normalize_lexically(Path::new("/..")), PathBuf::from("/"));
    }

    #[test]
    fn test_unique_basename_resolves_to_nested_file() {
        let dir = tempdir().unwrap();
        let expected = touch(dir.path(), "src/core/utils.py");
        let resolver = PathResolver::new(dir.path()).unwrap();
        assert_eq!(
            resolver.resolve("utils.py").unwrap(),
            Resolution::Existing(expected)
        );
    }

    #[test]
    fn test_ambiguous_basename_picks_shallowest() {
        let dir = tempdir().unwrap();
        let shallow = touch(dir.path(), "a/utils.py");
        touch(dir.path(), "a/b/c/utils.py");
        let resolver = PathResolver::new(dir.path()).unwrap();
        assert_eq!(
            resolver.resolve("utils.py").unwrap(),
            Resolution::Existing(shallow)
        );
    }

    #[test]
    fn test_partial_path_prefers_matching_suffix() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "utils.py");
        let deep = touch(dir.path(), "pkg/core/utils.py");
        let resolver = PathResolver::new(dir.path()).unwrap();
        assert_eq!(
            resolver.resolve("core/utils.py").unwrap(),
            Resolution::Existing(deep)
        );
    }

    #[test]
    fn test_exact_relative_match() {
        let dir = tempdir().unwrap();
        let login = touch(dir.path(), "src/login.py");
        touch(dir.path(), "legacy/src/login.py");
        let resolver = PathResolver::new(dir.path()).unwrap();
        assert_eq!(
            resolver.resolve("./src/login.py").unwrap(),
            Resolution::Existing(login)
        );
    }

    #[test]
    fn test_ignored_directories_are_not_searched() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "node_modules/lib/helpers.js");
        let resolver = PathResolver::new(dir.path()).unwrap();
        let resolved = resolver.resolve("helpers.js").unwrap();
        assert!(resolved.is_new());
        assert_eq!(resolved.path(), resolver.root().join("helpers.js"));
    }

    #[test]
    fn test_missing_file_becomes_new_file_inside_root() {
        let dir = tempdir().unwrap();
        let resolver = PathResolver::new(dir.path()).unwrap();
        assert_eq!(
            resolver.resolve("src/new_module.py").unwrap(),
            Resolution::NewFile(resolver.root().join("src/new_module.py"))
        );
    }

    #[test]
    fn test_escape_via_parent_dir_is_out_of_scope() {
        let dir = tempdir().unwrap();
        let resolver = PathResolver::new(dir.path()).unwrap();
        let err = resolver.resolve("../../etc/shadow.py").unwrap_err();
        assert!(matches!(err, RepairError::OutOfScopePath { .. }));
    }

    #[test]
    fn test_absolute_paths_must_stay_inside_root() {
        let dir = tempdir().unwrap();
        let inside = touch(dir.path(), "app/main.go");
        let resolver = PathResolver::new(dir.path()).unwrap();

        let ok = resolver.resolve(&inside.display().to_string()).unwrap();
        assert_eq!(ok, Resolution::Existing(inside));

        let outside = tempdir().unwrap();
        let foreign = touch(outside.path(), "main.go");
        let err = resolver
            .resolve(&foreign.display().to_string())
            .unwrap_err();
        assert!(matches!(err, RepairError::OutOfScopePath { .. }));
    }

    #[test]
    fn test_sibling_with_shared_prefix_is_not_inside() {
        let parent = tempdir().unwrap();
        let root = parent.path().join("app");
        let sibling = parent.path().join("app-evil");
        fs::create_dir_all(&root).unwrap();
        fs::create_dir_all(&sibling).unwrap();
        let resolver = PathResolver::new(&root).unwrap();
        assert!(!resolver.contains(&sibling.join("x.py")));
        assert!(resolver.contains(&root.join("x.py")));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_directory_escape_is_rejected() {
        let dir = tempdir().unwrap();
        let outside = tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();
        let resolver = PathResolver::new(dir.path()).unwrap();
        let err = resolver.resolve("link/payload.py").unwrap_err();
        assert!(matches!(err, RepairError::OutOfScopePath { .. }));
    }
}
