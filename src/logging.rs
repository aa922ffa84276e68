//! Logging utilities
//!
//! Size-based rolling file writer used as a `tracing-subscriber` sink when
//! `--log-file` is given. `gateway.log` rolls over to `gateway.log.1`,
//! `gateway.log.1` to `gateway.log.2`, and so on; the oldest file beyond the
//! retention limit is deleted.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Default maximum log file size (10MB)
pub const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Default number of rotated files kept next to the active one
pub const DEFAULT_MAX_FILES: usize = 10;

#[derive(Debug, Clone)]
pub struct SizeBasedRollingWriter {
    inner: Arc<Mutex<RollingFile>>,
}

#[derive(Debug)]
struct RollingFile {
    dir: PathBuf,
    file_name: String,
    file: File,
    size: u64,
    max_size: u64,
    max_files: usize,
}

impl SizeBasedRollingWriter {
    /// Open (or create) `path` for appending, creating parent directories
    pub fn new(path: impl AsRef<Path>, max_size: u64, max_files: usize) -> io::Result<Self> {
        let path = path.as_ref();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("log path {} has no file name", path.display()),
                )
            })?;
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;

        let file = open_append(&dir.join(&file_name))?;
        let size = file.metadata().map(|m| m.len()).unwrap_or(0);

        Ok(Self {
            inner: Arc::new(Mutex::new(RollingFile {
                dir,
                file_name,
                file,
                size,
                max_size,
                max_files,
            })),
        })
    }

    /// 10MB per file, 10 rotated files
    pub fn with_defaults(path: impl AsRef<Path>) -> io::Result<Self> {
        Self::new(path, DEFAULT_MAX_FILE_SIZE, DEFAULT_MAX_FILES)
    }

    fn lock(&self) -> MutexGuard<'_, RollingFile> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

impl RollingFile {
    fn path(&self, index: usize) -> PathBuf {
        if index == 0 {
            self.dir.join(&self.file_name)
        } else {
            self.dir.join(format!("{}.{}", self.file_name, index))
        }
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;

        if self.max_files == 0 {
            fs::remove_file(self.path(0))?;
        } else {
            let oldest = self.path(self.max_files);
            if oldest.exists() {
                fs::remove_file(&oldest)?;
            }
            for index in (0..self.max_files).rev() {
                let from = self.path(index);
                if from.exists() {
                    fs::rename(&from, self.path(index + 1))?;
                }
            }
        }

        self.file = open_append(&self.path(0))?;
        self.size = 0;
        Ok(())
    }
}

impl Write for SizeBasedRollingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.lock();

        // An oversized record still goes into a fresh file rather than looping
        if inner.size > 0 && inner.size + buf.len() as u64 > inner.max_size {
            inner.rotate()?;
        }

        let written = inner.file.write(buf)?;
        inner.size += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.lock().file.flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SizeBasedRollingWriter {
    type Writer = SizeBasedRollingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
