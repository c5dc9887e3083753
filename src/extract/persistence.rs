//! Crash-recovery log of in-flight extractions.
//!
//! Each file being extracted gets a marker in a per-user temporary
//! directory: a symlink named after the SHA-256 of the file's path and
//! pointing at the file. A marker still present at startup means the
//! previous process died while extracting that file.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use super::error::{ExtractError, ExtractResult};

/// Owned handle to the marker directory.
#[derive(Debug)]
pub struct PersistenceLog {
    dir: PathBuf,
}

impl PersistenceLog {
    /// Open the log at `dir`, or at [`default_dir`](Self::default_dir).
    ///
    /// Failing to create the directory is fatal to extraction.
    pub fn open(dir: Option<PathBuf>) -> ExtractResult<Self> {
        let dir = dir.unwrap_or_else(Self::default_dir);
        create_private_dir(&dir).map_err(|source| ExtractError::PersistenceDir {
            path: dir.clone(),
            source,
        })?;

        crate::debug_event!("extract", "persistence log", "{}", dir.display());
        Ok(Self { dir })
    }

    /// `$TMPDIR/indexwatch-<uid>`.
    pub fn default_dir() -> PathBuf {
        std::env::temp_dir().join(format!("indexwatch-{}", current_uid()))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn marker_path(&self, file: &Path) -> PathBuf {
        self.dir.join(path_hash(file))
    }

    /// Mark `file` as being extracted.
    pub fn record(&self, file: &Path) -> ExtractResult<()> {
        let marker = self.marker_path(file);

        // Leftover from a run that was never recovered
        if fs::symlink_metadata(&marker).is_ok() {
            let _ = fs::remove_file(&marker);
        }

        write_marker(file, &marker).map_err(|source| ExtractError::Marker {
            path: file.to_path_buf(),
            source,
        })
    }

    /// Drop the marker for `file`, if there is one.
    pub fn forget(&self, file: &Path) {
        let marker = self.marker_path(file);
        match fs::remove_file(&marker) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                "[extract] failed to remove marker for {}: {e}",
                file.display()
            ),
        }
    }

    /// Whether a marker exists for `file`.
    pub fn contains(&self, file: &Path) -> bool {
        fs::symlink_metadata(self.marker_path(file)).is_ok()
    }

    /// Consume every marker left behind, calling `on_recovered` once per
    /// file that was mid-extraction. Markers whose name does not match
    /// their target are removed without a callback.
    pub fn recover<F>(&self, mut on_recovered: F) -> ExtractResult<usize>
    where
        F: FnMut(&Path),
    {
        let mut recovered = 0;

        for entry in fs::read_dir(&self.dir)? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("[extract] unreadable marker entry: {e}");
                    continue;
                }
            };
            let marker = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();

            let target = match read_marker(&marker) {
                Ok(target) => target,
                Err(e) => {
                    tracing::warn!("[extract] unreadable marker {}: {e}", marker.display());
                    let _ = fs::remove_file(&marker);
                    continue;
                }
            };

            if path_hash(&target) != name {
                tracing::warn!(
                    "[extract] corrupt marker {name} points at {}, discarding",
                    target.display()
                );
                let _ = fs::remove_file(&marker);
                continue;
            }

            if let Err(e) = fs::remove_file(&marker) {
                tracing::warn!("[extract] failed to remove marker {name}: {e}");
            }

            crate::log_event!("extract", "recovered", "{}", target.display());
            on_recovered(&target);
            recovered += 1;
        }

        Ok(recovered)
    }
}

/// Hex SHA-256 of a path's bytes.
pub fn path_hash(path: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path_bytes(path));
    format!("{:x}", hasher.finalize())
}

#[cfg(unix)]
pub(super) fn path_bytes(path: &Path) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    path.as_os_str().as_bytes().to_vec()
}

#[cfg(not(unix))]
pub(super) fn path_bytes(path: &Path) -> Vec<u8> {
    path.to_string_lossy().into_owned().into_bytes()
}

#[cfg(unix)]
fn current_uid() -> u32 {
    // SAFETY: getuid has no preconditions and cannot fail
    unsafe { libc::getuid() }
}

#[cfg(not(unix))]
fn current_uid() -> u32 {
    0
}

/// Create `dir` with mode 0700, or accept an existing one only if it is a
/// real directory owned by the current user.
#[cfg(unix)]
fn create_private_dir(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::{DirBuilderExt, MetadataExt, PermissionsExt};

    match fs::DirBuilder::new().recursive(true).mode(0o700).create(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
        Err(e) => return Err(e),
    }

    let metadata = fs::symlink_metadata(dir)?;
    if metadata.file_type().is_symlink() {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "marker directory is a symbolic link",
        ));
    }
    if !metadata.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "marker directory path is not a directory",
        ));
    }
    let uid = current_uid();
    if metadata.uid() != uid {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("marker directory is owned by uid {}, not {uid}", metadata.uid()),
        ));
    }

    if metadata.permissions().mode() & 0o777 != 0o700 {
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)
}

#[cfg(unix)]
fn write_marker(file: &Path, marker: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(file, marker)
}

#[cfg(not(unix))]
fn write_marker(file: &Path, marker: &Path) -> io::Result<()> {
    fs::write(marker, file.to_string_lossy().as_bytes())
}

#[cfg(unix)]
fn read_marker(marker: &Path) -> io::Result<PathBuf> {
    fs::read_link(marker)
}

#[cfg(not(unix))]
fn read_marker(marker: &Path) -> io::Result<PathBuf> {
    fs::read_to_string(marker).map(PathBuf::from)
}
