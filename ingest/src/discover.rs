use crate::error::StartupError;
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::SystemTime;
use walkdir::WalkDir;

/// One candidate transcript file. Identity is the file name, assumed unique
/// across archive directories; the first directory encountered wins on
/// collision so mirrored archives do not double-ingest.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub name: String,
    pub path: PathBuf,
    pub origin: PathBuf,
    pub modified: Option<SystemTime>,
}

/// List `.jsonl` transcripts across the archive directories in priority
/// order. Missing directories are skipped silently; a permission-denied
/// directory is fatal, as is having no readable directory at all.
pub fn enumerate_sources(dirs: &[PathBuf]) -> Result<Vec<SourceFile>, StartupError> {
    let mut by_name: HashMap<String, SourceFile> = HashMap::new();
    let mut readable = 0usize;

    for dir in dirs {
        match fs::read_dir(dir) {
            Ok(_) => readable += 1,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => {
                return Err(StartupError::UnreadableSource {
                    path: dir.clone(),
                    source: e,
                })
            }
        }

        for entry in WalkDir::new(dir)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("jsonl"))
        {
            let Some(name) = entry.file_name().to_str().map(String::from) else {
                continue;
            };
            if by_name.contains_key(&name) {
                continue;
            }
            let modified = entry.metadata().ok().and_then(|m| m.modified().ok());
            by_name.insert(
                name.clone(),
                SourceFile {
                    name,
                    path: entry.path().to_path_buf(),
                    origin: dir.clone(),
                    modified,
                },
            );
        }
    }

    if readable == 0 {
        return Err(StartupError::NoReadableSources(dirs.to_vec()));
    }

    let mut files: Vec<SourceFile> = by_name.into_values().collect();
    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn lists_sorted_and_recursive() {
        let dir = tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("project-a")).expect("mkdir");
        fs::write(dir.path().join("project-a/b-session.jsonl"), "").expect("write");
        fs::write(dir.path().join("a-session.jsonl"), "").expect("write");
        fs::write(dir.path().join("notes.txt"), "").expect("write");

        let files = enumerate_sources(&[dir.path().to_path_buf()]).expect("enumerate");
        let names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["a-session.jsonl", "b-session.jsonl"]);
    }

    #[test]
    fn first_directory_wins_on_name_collision() {
        let primary = tempdir().expect("tempdir");
        let mirror = tempdir().expect("tempdir");
        fs::write(primary.path().join("shared.jsonl"), "primary").expect("write");
        fs::write(mirror.path().join("shared.jsonl"), "mirror").expect("write");
        fs::write(mirror.path().join("only-mirror.jsonl"), "").expect("write");

        let files = enumerate_sources(&[primary.path().to_path_buf(), mirror.path().to_path_buf()])
            .expect("enumerate");
        assert_eq!(files.len(), 2);
        let shared = files.iter().find(|f| f.name == "shared.jsonl").unwrap();
        assert_eq!(shared.origin, primary.path());
    }

    #[test]
    fn missing_directory_is_skipped() {
        let dir = tempdir().expect("tempdir");
        fs::write(dir.path().join("one.jsonl"), "").expect("write");

        let files = enumerate_sources(&[
            dir.path().join("does-not-exist"),
            dir.path().to_path_buf(),
        ])
        .expect("enumerate");
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn all_directories_missing_is_fatal() {
        let dir = tempdir().expect("tempdir");
        let err = enumerate_sources(&[dir.path().join("gone")]).unwrap_err();
        assert!(matches!(err, StartupError::NoReadableSources(_)));
    }
}
