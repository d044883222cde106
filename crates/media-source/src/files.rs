//! File discovery helpers

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::SourceError;

/// Image extensions picked up by [`find_files`] in image sequences and calibration sets
pub const IMAGE_PATTERNS: &str = "*.jpg;*.jpeg;*.png;*.gif;*.tif;*.bmp";

/// List the files of `dir` whose names match one of the `;`-separated patterns.
///
/// Patterns are either `*.ext` (case-insensitive suffix) or an exact file name.
/// The result is sorted so sequences replay in a stable order.
pub fn find_files(dir: impl AsRef<Path>, patterns: &str) -> Result<Vec<PathBuf>, SourceError> {
    let dir = dir.as_ref();
    let patterns: Vec<String> = patterns
        .split(';')
        .map(|p| p.trim().to_ascii_lowercase())
        .filter(|p| !p.is_empty())
        .collect();

    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let name = name.to_ascii_lowercase();
        let matched = patterns.iter().any(|p| match p.strip_prefix('*') {
            Some(suffix) => name.ends_with(suffix),
            None => name == *p,
        });
        if matched {
            files.push(path);
        }
    }

    files.sort();
    debug!("Found {} files in {}", files.len(), dir.display());
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_files_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.JPG", "a.png", "notes.txt", "c.jpeg"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        std::fs::create_dir(dir.path().join("nested.png")).unwrap();

        let files = find_files(dir.path(), IMAGE_PATTERNS).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();

        assert_eq!(names, vec!["a.png", "b.JPG", "c.jpeg"]);
    }

    #[test]
    fn test_missing_dir_is_io_error() {
        let err = find_files("/definitely/not/here", IMAGE_PATTERNS).unwrap_err();
        assert!(matches!(err, SourceError::Io(_)));
    }
}
