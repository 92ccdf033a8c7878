use std::path::{Path, PathBuf};

/// Locations where a skip marker would exclude `file_path`: its own directory
/// and that directory's parent
pub fn skip_marker_paths(file_path: &Path, marker: &str) -> Vec<PathBuf> {
    let mut paths = Vec::with_capacity(2);
    if let Some(dir) = file_path.parent() {
        paths.push(dir.join(marker));
        if let Some(parent) = dir.parent() {
            paths.push(parent.join(marker));
        }
    }
    paths
}

/// Check if a skip marker sits next to the file or one directory up.
/// Not cached: a marker dropped in mid-run takes effect for the next file.
pub fn has_skip_marker(file_path: &Path, marker: &str) -> bool {
    skip_marker_paths(file_path, marker)
        .iter()
        .any(|p| p.exists())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_marker_paths() {
        let paths = skip_marker_paths(Path::new("/lib/Show/S01/ep.mkv"), ".donotshrink");
        assert_eq!(
            paths,
            vec![
                PathBuf::from("/lib/Show/S01/.donotshrink"),
                PathBuf::from("/lib/Show/.donotshrink"),
            ]
        );
    }

    #[test]
    fn test_marker_in_same_or_parent_dir() {
        let root = TempDir::new().unwrap();
        let season = root.path().join("Show").join("S01");
        fs::create_dir_all(&season).unwrap();
        let file = season.join("ep.mkv");
        fs::write(&file, b"x").unwrap();

        assert!(!has_skip_marker(&file, ".donotshrink"));

        fs::write(root.path().join("Show").join(".donotshrink"), b"").unwrap();
        assert!(has_skip_marker(&file, ".donotshrink"));

        fs::remove_file(root.path().join("Show").join(".donotshrink")).unwrap();
        fs::write(season.join(".donotshrink"), b"").unwrap();
        assert!(has_skip_marker(&file, ".donotshrink"));
    }

    #[test]
    fn test_marker_two_levels_up_is_ignored() {
        let root = TempDir::new().unwrap();
        let season = root.path().join("Show").join("S01");
        fs::create_dir_all(&season).unwrap();
        fs::write(root.path().join(".donotshrink"), b"").unwrap();

        assert!(!has_skip_marker(&season.join("ep.mkv"), ".donotshrink"));
    }
}
