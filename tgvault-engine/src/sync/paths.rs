use std::path::{Component, Path};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("{0} is outside the sync folder")]
    OutsideRoot(String),
    #[error("path is empty")]
    Empty,
    #[error("path contains unsupported component")]
    UnsupportedComponent,
}

/// Tooling and cache directories that are never synced.
const EXCLUDED_DIRS: &[&str] = &[
    "node_modules",
    "__pycache__",
    "target",
    "venv",
    "$RECYCLE.BIN",
    "System Volume Information",
];

/// Editor swap, backup and in-progress download suffixes.
const EXCLUDED_SUFFIXES: &[&str] = &[
    "~", ".swp", ".swo", ".swx", ".tmp", ".bak", ".part", ".partial", ".crdownload",
];

/// Stored name for `path` under `root`: relative, forward slashes.
pub fn relative_name(root: &Path, path: &Path) -> Result<String, PathError> {
    let relative = path
        .strip_prefix(root)
        .map_err(|_| PathError::OutsideRoot(path.display().to_string()))?;

    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => continue,
            Component::RootDir | Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent);
            }
        }
    }
    if parts.is_empty() {
        return Err(PathError::Empty);
    }
    Ok(parts.join("/"))
}

/// True when any component of `relative` is hidden or a tooling directory, or
/// the final name looks like a swap/backup file.
pub fn is_excluded(relative: &Path) -> bool {
    let mut components = relative.components().peekable();
    while let Some(component) = components.next() {
        let Component::Normal(part) = component else {
            continue;
        };
        let name = part.to_string_lossy();
        if name.starts_with('.') {
            return true;
        }
        let is_last = components.peek().is_none();
        if !is_last && EXCLUDED_DIRS.contains(&name.as_ref()) {
            return true;
        }
        if is_last && is_scratch_file(&name) {
            return true;
        }
    }
    false
}

fn is_scratch_file(name: &str) -> bool {
    // vim probes writability with a file literally named 4913
    if name == "4913" || (name.starts_with('#') && name.ends_with('#')) {
        return true;
    }
    let lower = name.to_ascii_lowercase();
    EXCLUDED_SUFFIXES
        .iter()
        .any(|suffix| lower.ends_with(suffix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn relative_name_uses_forward_slashes() {
        let root = PathBuf::from("/home/me/docs");
        assert_eq!(
            relative_name(&root, Path::new("/home/me/docs/taxes/2024/w2.pdf")).unwrap(),
            "taxes/2024/w2.pdf"
        );
        assert!(matches!(
            relative_name(&root, Path::new("/home/me/other.txt")),
            Err(PathError::OutsideRoot(_))
        ));
        assert!(matches!(
            relative_name(&root, &root),
            Err(PathError::Empty)
        ));
    }

    #[test]
    fn excludes_hidden_tooling_and_scratch_files() {
        for path in [
            ".git/config",
            "src/.env",
            "web/node_modules/react/index.js",
            "notes.txt~",
            "notes.txt.swp",
            "movie.mkv.part",
            "#draft.org#",
            "4913",
        ] {
            assert!(is_excluded(Path::new(path)), "{path} should be excluded");
        }
        for path in ["notes.txt", "target.txt", "reports/q3.pdf", "node_modules.md"] {
            assert!(!is_excluded(Path::new(path)), "{path} should be synced");
        }
    }
}
