//! Small filesystem helpers shared by the store, the registry and the partial store

use crate::errors::Result;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Name of the host running this process, `"unknown"` when it cannot be found
pub(crate) fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

/// Temporary sibling of `path`, unique per call, process and host
pub(crate) fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    let serial = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    name.push(format!(".tmp-{}-{serial}-on-{}", std::process::id(), hostname()));
    path.with_file_name(name)
}

/// Whether a file name was produced by [`temp_path_for`]
pub(crate) fn is_temp_name(name: &str) -> bool {
    name.contains(".tmp-")
}

/// Write `bytes` to `path` so that readers see either the old or the new content
///
/// The bytes go to a temporary file in the same directory which is then renamed over
/// `path`. A crash leaves an orphaned temporary file, never a truncated `path`.
pub(crate) fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = temp_path_for(path);
    fs::write(&tmp, bytes)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn atomic_write_replaces_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("value");
        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| is_temp_name(&e.file_name().to_string_lossy()))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn temp_names_are_recognised() {
        let tmp = temp_path_for(Path::new("/data/abc.bin"));
        let name = tmp.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("abc.bin.tmp-"));
        assert!(is_temp_name(&name));
        assert!(!is_temp_name("abc.bin"));
        assert_ne!(temp_path_for(Path::new("/data/abc.bin")), tmp);
    }
}
