//! Session file naming and crash recovery.
//!
//! A recording session writes into a file carrying an `(in use)` marker in
//! its name; the marker is stripped by rename on a normal close. A file
//! still carrying the marker at startup is a crash remnant and gets its
//! marker stripped the same way, never repaired by content.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Local;
use tracing::{debug, warn};

pub(crate) const IN_USE_MARKER: &str = " (in use)";

/// Paths of one recording session: the active (marked) file and the final
/// name it is renamed to on close.
#[derive(Clone, Debug)]
pub(crate) struct SessionPaths {
    pub(crate) active: PathBuf,
    pub(crate) finished: PathBuf,
}

/// Pick a fresh session file name derived from today's date, disambiguated
/// with a numeric suffix when either the active or the finished name is
/// already taken.
pub(crate) fn allocate_session_paths(dir: &Path, extension: &str) -> io::Result<SessionPaths> {
    fs::create_dir_all(dir)?;
    let stem = Local::now().format("%Y-%m-%d").to_string();
    allocate_with_stem(dir, &stem, extension)
}

fn allocate_with_stem(dir: &Path, stem: &str, extension: &str) -> io::Result<SessionPaths> {
    for attempt in 1u32.. {
        let name = if attempt == 1 { stem.to_string() } else { format!("{stem} ({attempt})") };
        let finished = dir.join(format!("{name}.{extension}"));
        let active = dir.join(format!("{name}{IN_USE_MARKER}.{extension}"));
        if !finished.exists() && !active.exists() {
            return Ok(SessionPaths { active, finished });
        }
    }
    unreachable!("suffix search is unbounded")
}

/// Strip the in-use marker from a closed session by rename.
pub(crate) fn finish_session(paths: &SessionPaths) -> io::Result<()> {
    fs::rename(&paths.active, &paths.finished)
}

/// Scan `dir` for files left with the in-use marker by a previous crash and
/// rename them to their final names. Returns how many files were recovered.
pub fn recover_interrupted_sessions(dir: &Path) -> io::Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }
    let mut recovered = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(stripped) = strip_marker(name) else { continue };

        // The unmarked name may already exist; fall back to suffixing.
        let mut target = dir.join(&stripped);
        if target.exists() {
            let (stem, extension) = match stripped.rsplit_once('.') {
                Some((stem, ext)) => (stem.to_string(), ext.to_string()),
                None => (stripped.clone(), String::new()),
            };
            target = allocate_with_stem(dir, &stem, &extension)?.finished;
        }

        warn!(
            "recovering interrupted session {:?} -> {:?}",
            entry.path(),
            target
        );
        fs::rename(entry.path(), &target)?;
        recovered += 1;
    }
    if recovered == 0 {
        debug!("no interrupted sessions found in {}", dir.display());
    }
    Ok(recovered)
}

fn strip_marker(name: &str) -> Option<String> {
    let at = name.find(IN_USE_MARKER)?;
    let mut stripped = String::with_capacity(name.len() - IN_USE_MARKER.len());
    stripped.push_str(&name[..at]);
    stripped.push_str(&name[at + IN_USE_MARKER.len()..]);
    Some(stripped)
}

#[cfg(test)]
mod tests {
    use std::fs::File;

    use super::*;

    #[test]
    fn allocates_disambiguated_names() {
        let dir = tempfile::tempdir().unwrap();
        let first = allocate_session_paths(dir.path(), "flv").unwrap();
        File::create(&first.active).unwrap();
        let second = allocate_session_paths(dir.path(), "flv").unwrap();
        assert_ne!(first.active, second.active);
        assert!(second.finished.to_str().unwrap().contains("(2)"));
    }

    #[test]
    fn finish_strips_the_marker() {
        let dir = tempfile::tempdir().unwrap();
        let paths = allocate_session_paths(dir.path(), "flv").unwrap();
        File::create(&paths.active).unwrap();
        finish_session(&paths).unwrap();
        assert!(!paths.active.exists());
        assert!(paths.finished.exists());
    }

    #[test]
    fn recovers_crash_remnants_by_rename() {
        let dir = tempfile::tempdir().unwrap();
        let marked = dir.path().join(format!("2024-01-01{IN_USE_MARKER}.flv"));
        File::create(&marked).unwrap();

        let recovered = recover_interrupted_sessions(dir.path()).unwrap();
        assert_eq!(recovered, 1);
        assert!(!marked.exists());
        assert!(dir.path().join("2024-01-01.flv").exists());
    }

    #[test]
    fn recovery_avoids_clobbering_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        File::create(dir.path().join("2024-01-01.flv")).unwrap();
        File::create(dir.path().join(format!("2024-01-01{IN_USE_MARKER}.flv"))).unwrap();

        let recovered = recover_interrupted_sessions(dir.path()).unwrap();
        assert_eq!(recovered, 1);
        assert!(dir.path().join("2024-01-01.flv").exists());
        assert!(dir.path().join("2024-01-01 (2).flv").exists());
    }

    #[test]
    fn recovery_of_missing_dir_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert_eq!(recover_interrupted_sessions(&missing).unwrap(), 0);
    }
}
