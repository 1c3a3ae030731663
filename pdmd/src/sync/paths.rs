use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("vault path is empty")]
    Empty,
    #[error("vault path contains unsupported component: {0}")]
    UnsupportedComponent(String),
    #[error("path is outside the vault root: {0}")]
    OutsideRoot(String),
}

/// Normalizes a vault-relative path: `/` separators, no leading or trailing
/// slash, no `.` segments. `..` is rejected.
pub fn normalize_relative(path: &str) -> Result<String, PathError> {
    let mut parts = Vec::new();
    for part in path.split(['/', '\\']) {
        match part {
            "" | "." => continue,
            ".." => return Err(PathError::UnsupportedComponent(path.to_string())),
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return Err(PathError::Empty);
    }
    Ok(parts.join("/"))
}

/// Maps a vault-relative path under the vault's local root.
pub fn local_path_for(root: &Path, relative: &str) -> Result<PathBuf, PathError> {
    if relative.is_empty() {
        return Ok(root.to_path_buf());
    }
    let mut out = root.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent(relative.to_string()));
            }
        }
    }
    Ok(out)
}

/// Inverse of [`local_path_for`].
pub fn relative_path_for(root: &Path, local: &Path) -> Result<String, PathError> {
    let relative = local
        .strip_prefix(root)
        .map_err(|_| PathError::OutsideRoot(local.display().to_string()))?;
    let joined = relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/");
    if joined.is_empty() {
        return Err(PathError::Empty);
    }
    Ok(joined)
}

pub fn parent_path(path: &str) -> Option<&str> {
    path.rsplit_once('/').map(|(parent, _)| parent)
}

pub fn file_name(path: &str) -> &str {
    path.rsplit_once('/').map(|(_, name)| name).unwrap_or(path)
}

pub fn extension(path: &str) -> String {
    let name = file_name(path);
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => ext.to_ascii_lowercase(),
        _ => String::new(),
    }
}

pub fn join(folder: &str, name: &str) -> String {
    if folder.is_empty() {
        name.to_string()
    } else {
        format!("{folder}/{name}")
    }
}

/// True when `path` is `folder` itself or lies beneath it. The empty folder
/// is the vault root and contains everything.
pub fn is_within(path: &str, folder: &str) -> bool {
    if folder.is_empty() || path == folder {
        return true;
    }
    path.len() > folder.len() && path.starts_with(folder) && path.as_bytes()[folder.len()] == b'/'
}

/// Rewrites `path` (which lies within `from`) so it lies within `to`.
pub fn rebase(path: &str, from: &str, to: &str) -> String {
    if path == from {
        return to.to_string();
    }
    if from.is_empty() {
        return join(to, path);
    }
    let rest = &path[from.len() + 1..];
    join(to, rest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_relative_path_under_root() {
        let root = PathBuf::from("/vaults/main");
        let mapped = local_path_for(&root, "parts/bracket.sldprt").unwrap();
        assert_eq!(mapped, PathBuf::from("/vaults/main/parts/bracket.sldprt"));
        assert_eq!(
            relative_path_for(&root, &mapped).unwrap(),
            "parts/bracket.sldprt"
        );
    }

    #[test]
    fn rejects_parent_dir() {
        let root = PathBuf::from("/vaults/main");
        assert!(matches!(
            local_path_for(&root, "../secret"),
            Err(PathError::UnsupportedComponent(_))
        ));
        assert!(normalize_relative("a/../b").is_err());
    }

    #[test]
    fn normalizes_separators() {
        assert_eq!(
            normalize_relative("\\parts\\sub/./a.txt/").unwrap(),
            "parts/sub/a.txt"
        );
        assert_eq!(normalize_relative("/"), Err(PathError::Empty));
    }

    #[test]
    fn within_respects_segment_boundaries() {
        assert!(is_within("parts/a.txt", "parts"));
        assert!(is_within("parts", "parts"));
        assert!(!is_within("parts2/a.txt", "parts"));
        assert!(is_within("anything", ""));
    }

    #[test]
    fn rebase_moves_prefix() {
        assert_eq!(rebase("parts/sub/a.txt", "parts", "archive/parts"), "archive/parts/sub/a.txt");
        assert_eq!(rebase("parts", "parts", "old"), "old");
    }

    #[test]
    fn extension_is_lowercased() {
        assert_eq!(extension("parts/Bracket.SLDPRT"), "sldprt");
        assert_eq!(extension(".hidden"), "");
    }
}
