//! Low-level file access shared by the heap, the row index and the repack
//! protocol: a positioned file handle, sidecar naming and file replacement.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::config::simulate_win32;
use crate::constant::BACKUP_SUFFIX;
use crate::dberror::DbError;

// ══════════════════════════════════════ File Handle ══════════════════════════════════════

/// Exclusive read/write handle on one table file.
#[derive(Debug)]
pub struct FileHandle {
    file: File,
    path: PathBuf,
}

impl FileHandle {
    /// Creates (or truncates) a file.
    pub fn create(path: &Path) -> Result<Self, DbError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(FileHandle { file, path: path.to_path_buf() })
    }

    /// Opens an existing file for update.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(FileHandle { file, path: path.to_path_buf() })
    }

    pub fn open_read(path: &Path) -> Result<Self, DbError> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(FileHandle { file, path: path.to_path_buf() })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reading past end of file is `CorruptData`: every read is driven by a
    /// length or an offset stored in the files themselves.
    pub fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<(), DbError> {
        self.file.seek(SeekFrom::Start(pos))?;
        match self.file.read_exact(buf) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(DbError::corrupt(format!(
                "{}: {} bytes at offset {} run past end of file",
                self.path.display(),
                buf.len(),
                pos
            ))),
            Err(e) => Err(e.into()),
        }
    }

    pub fn read_vec_at(&mut self, pos: u64, len: usize) -> Result<Vec<u8>, DbError> {
        let mut buf = vec![0u8; len];
        self.read_at(pos, &mut buf)?;
        Ok(buf)
    }

    pub fn write_at(&mut self, pos: u64, buf: &[u8]) -> Result<(), DbError> {
        check_failpoint("write_at")?;
        self.file.seek(SeekFrom::Start(pos))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    pub fn set_len(&mut self, new_len: u64) -> Result<(), DbError> {
        self.file.set_len(new_len)?;
        Ok(())
    }

    pub fn file_len(&self) -> Result<u64, DbError> {
        Ok(self.file.metadata()?.len())
    }

    pub fn flush(&mut self) -> Result<(), DbError> {
        self.file.flush()?;
        Ok(())
    }

    pub fn sync_all(&self) -> Result<(), DbError> {
        self.file.sync_all()?;
        Ok(())
    }
}

// ══════════════════════════════════════ PATHS ══════════════════════════════════════

/// `dir/name.ext` + `suffix` -> `dir/name.extsuffix`
pub fn sidecar_path(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

pub fn remove_if_exists(path: &Path) -> Result<(), DbError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub fn copy_file(src: &Path, dst: &Path) -> Result<(), DbError> {
    check_failpoint("copy_file")?;
    fs::copy(src, dst)?;
    Ok(())
}

fn rename(src: &Path, dst: &Path) -> Result<(), DbError> {
    check_failpoint("rename")?;
    fs::rename(src, dst)?;
    Ok(())
}

// ══════════════════════════════════════ REPLACE ══════════════════════════════════════

/// Moves each `(src, dst)` pair over its destination.
///
/// On POSIX a rename over an existing file is atomic, so the pairs are
/// renamed in order. On Windows (or when `GEOTUCO_SIMUL_WIN32` is set) the
/// destinations are first moved aside to `_backup`, then the sources are
/// renamed in, then the backups are deleted.
///
/// A failure before the first destination changed is a plain error and the
/// caller still owns the sources. A failure after that point leaves a mix
/// of old and new files and is reported as `FatalInconsistency`.
pub fn replace_files(pairs: &[(PathBuf, PathBuf)]) -> Result<(), DbError> {
    if cfg!(windows) || simulate_win32() || failpoint::win32_forced() {
        replace_files_win32(pairs)
    } else {
        replace_files_posix(pairs)
    }
}

fn replace_files_posix(pairs: &[(PathBuf, PathBuf)]) -> Result<(), DbError> {
    for (i, (src, dst)) in pairs.iter().enumerate() {
        if let Err(e) = rename(src, dst) {
            if i == 0 {
                return Err(e);
            }
            return Err(DbError::FatalInconsistency(format!(
                "{} was replaced but renaming {} over {} failed: {}",
                pairs[0].1.display(),
                src.display(),
                dst.display(),
                e
            )));
        }
    }
    Ok(())
}

fn replace_files_win32(pairs: &[(PathBuf, PathBuf)]) -> Result<(), DbError> {
    let backups: Vec<PathBuf> = pairs.iter().map(|(_, dst)| sidecar_path(dst, BACKUP_SUFFIX)).collect();
    for b in &backups {
        if b.exists() {
            return Err(DbError::InvalidOperation(format!("{} already exists", b.display())));
        }
    }

    // move the originals aside; undo on failure
    for (i, (_, dst)) in pairs.iter().enumerate() {
        if let Err(e) = rename(dst, &backups[i]) {
            for j in (0..i).rev() {
                if let Err(undo) = rename(&backups[j], &pairs[j].1) {
                    warn!(file = %pairs[j].1.display(), error = %undo, "could not move original back");
                }
            }
            return Err(e);
        }
    }

    for (i, (src, dst)) in pairs.iter().enumerate() {
        if let Err(e) = rename(src, dst) {
            if i == 0 {
                for (j, (_, d)) in pairs.iter().enumerate() {
                    if let Err(undo) = rename(&backups[j], d) {
                        warn!(file = %d.display(), error = %undo, "could not move original back");
                    }
                }
                return Err(e);
            }
            return Err(DbError::FatalInconsistency(format!(
                "{} was replaced but renaming {} over {} failed: {}; originals are in *{}",
                pairs[0].1.display(),
                src.display(),
                dst.display(),
                e,
                BACKUP_SUFFIX
            )));
        }
    }

    for b in &backups {
        if let Err(e) = remove_if_exists(b) {
            warn!(file = %b.display(), error = %e, "could not delete backup after replace");
        }
    }
    Ok(())
}

// ══════════════════════════════════════ FAIL POINTS ══════════════════════════════════════

/// Injected I/O failures for rollback tests. A no-op outside `cfg(test)`.
pub(crate) fn check_failpoint(name: &'static str) -> Result<(), DbError> {
    #[cfg(test)]
    {
        if failpoint::hit(name) {
            return Err(DbError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("injected failure at {}", name),
            )));
        }
    }
    let _ = name;
    Ok(())
}

#[cfg(not(test))]
mod failpoint {
    pub fn win32_forced() -> bool {
        false
    }
}
