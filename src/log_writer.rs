use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// A size-bounded, append-only log file with a bounded history of renamed
/// predecessors, per SPEC_FULL §4.1.
///
/// Grounded on the teacher's `process_run`'s stdout/stderr redirection
/// (`OpenOptions::new().create(true).append(true).open(...)` against
/// `global!("opm.logs.out")`/`global!("opm.logs.error")`); size-bound rotation
/// and bounded history are new, since the teacher never rotates its own logs.
pub struct RotatingWriter {
    inner: Mutex<Inner>,
}

struct Inner {
    path: PathBuf,
    max_size_bytes: u64,
    max_files: u32,
    file: Option<File>,
    written: u64,
    degraded: bool,
}

impl RotatingWriter {
    pub fn new(path: impl Into<PathBuf>, max_size_bytes: u64, max_files: u32) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let (file, written) = open_current(&path)?;

        Ok(RotatingWriter {
            inner: Mutex::new(Inner {
                path,
                max_size_bytes: max_size_bytes.max(1),
                max_files,
                file: Some(file),
                written,
                degraded: false,
            }),
        })
    }

    pub fn path(&self) -> PathBuf {
        self.inner.lock().unwrap().path.clone()
    }

    /// Whether the writer's most recent operation failed (SPEC_FULL §7:
    /// "I/O errors on logs ... the writer enters a degraded state").
    pub fn is_degraded(&self) -> bool {
        self.inner.lock().unwrap().degraded
    }

    /// Append `bytes`, rotating first if they would overflow `max_size_bytes`.
    pub fn write(&self, bytes: &[u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        let result = inner.write(bytes);
        inner.degraded = result.is_err();
        result
    }

    /// Empty the current file without disturbing rotated history.
    pub fn truncate(&self) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let result = inner.truncate();
        inner.degraded = result.is_err();
        result
    }

    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.file = None;
    }
}

impl Inner {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        if self.written + bytes.len() as u64 > self.max_size_bytes && self.written > 0 {
            self.rotate()?;
        }

        let file = match &mut self.file {
            Some(file) => file,
            None => {
                let (file, written) = open_current(&self.path)?;
                self.written = written;
                self.file = Some(file);
                self.file.as_mut().unwrap()
            }
        };

        file.write_all(bytes)?;
        file.flush()?;
        self.written += bytes.len() as u64;
        Ok(bytes.len())
    }

    fn truncate(&mut self) -> io::Result<()> {
        self.file = None;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        self.file = Some(file);
        self.written = 0;
        Ok(())
    }

    /// Shift `path.N-1 -> path.N` (dropping anything past `max_files`), move
    /// the current file to `path.1`, and open a fresh `path`. Must complete
    /// before any byte of the triggering chunk is appended (§4.1).
    fn rotate(&mut self) -> io::Result<()> {
        self.file = None;

        if self.max_files == 0 {
            // No history kept: just reset the current file in place.
            fs::write(&self.path, b"")?;
        } else {
            for n in (1..self.max_files).rev() {
                let from = numbered_path(&self.path, n);
                let to = numbered_path(&self.path, n + 1);
                if from.exists() {
                    let _ = fs::rename(&from, &to);
                }
            }

            let first = numbered_path(&self.path, 1);
            if self.path.exists() {
                fs::rename(&self.path, &first)?;
            }
        }

        let (file, written) = open_current(&self.path)?;
        self.file = Some(file);
        self.written = written;
        Ok(())
    }
}

fn numbered_path(path: &Path, n: u32) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(format!(".{n}"));
    PathBuf::from(os)
}

fn open_current(path: &Path) -> io::Result<(File, u64)> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let written = file.metadata()?.len();
    Ok((file, written))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn writes_append_and_count_bytes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app-out.log");
        let writer = RotatingWriter::new(&path, 1024, 3).unwrap();

        writer.write(b"hello ").unwrap();
        writer.write(b"world").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "hello world");
    }

    #[test]
    fn rotates_when_chunk_would_overflow() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app-out.log");
        let writer = RotatingWriter::new(&path, 10, 2).unwrap();

        writer.write(b"0123456789").unwrap(); // fills exactly to the limit
        writer.write(b"next-chunk").unwrap(); // triggers rotation first

        assert!(numbered_path(&path, 1).exists());
        assert_eq!(fs::read_to_string(&path).unwrap(), "next-chunk");
        assert_eq!(fs::read_to_string(numbered_path(&path, 1)).unwrap(), "0123456789");
    }

    #[test]
    fn bounded_history_drops_oldest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app-out.log");
        let writer = RotatingWriter::new(&path, 5, 2).unwrap();

        for _ in 0..6 {
            writer.write(b"12345").unwrap();
        }

        assert!(numbered_path(&path, 1).exists());
        assert!(numbered_path(&path, 2).exists());
        assert!(!numbered_path(&path, 3).exists());
    }

    #[test]
    fn truncate_empties_current_file_only() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app-out.log");
        let writer = RotatingWriter::new(&path, 5, 2).unwrap();

        writer.write(b"12345").unwrap();
        writer.write(b"67890").unwrap(); // rotates, path.1 now holds "12345"
        writer.truncate().unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "");
        assert_eq!(fs::read_to_string(numbered_path(&path, 1)).unwrap(), "12345");
    }

    #[test]
    fn max_files_zero_keeps_no_history() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app-out.log");
        let writer = RotatingWriter::new(&path, 5, 0).unwrap();

        writer.write(b"12345").unwrap();
        writer.write(b"67890").unwrap();

        assert!(!numbered_path(&path, 1).exists());
        assert_eq!(fs::read_to_string(&path).unwrap(), "67890");
    }
}
