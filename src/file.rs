use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Once;

use anyhow::{Context, Result};

use crate::stats;

static DIRECT_IO_WARN: Once = Once::new();

fn warn_direct_io_unsupported(use_direct_io: bool) {
    if use_direct_io {
        DIRECT_IO_WARN.call_once(|| {
            tracing::warn!("use_direct_io requested but not supported by this build, using buffered I/O");
        });
    }
}

/// A read-only file supporting positional reads from any thread.
pub struct FileObject {
    file: File,
    size: u64,
}

impl FileObject {
    pub fn open(path: &Path, use_direct_io: bool) -> Result<Self> {
        warn_direct_io_unsupported(use_direct_io);
        let file = File::options()
            .read(true)
            .open(path)
            .with_context(|| format!("fail to open {}", path.display()))?;
        let size = file.metadata()?.len();
        Ok(FileObject { file, size })
    }

    pub fn read(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        use std::os::unix::fs::FileExt;
        let mut data = vec![0; len as usize];
        self.file
            .read_exact_at(&mut data[..], offset)
            .with_context(|| format!("fail to read {} bytes at offset {}", len, offset))?;
        stats::add_read_bytes(len);
        Ok(data)
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

/// A sequential append-only writer with an owned buffer of
/// `write_buffer_size` bytes. `size()` counts every appended byte, buffered
/// or flushed, so builders can track the exact file layout while writing.
pub struct FileWriter {
    file: File,
    buf: Vec<u8>,
    buffer_size: usize,
    written: u64,
}

impl FileWriter {
    pub fn create(path: &Path, buffer_size: usize, use_direct_io: bool) -> Result<Self> {
        warn_direct_io_unsupported(use_direct_io);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("fail to create {}", path.display()))?;
        Ok(FileWriter {
            file,
            buf: Vec::with_capacity(buffer_size),
            buffer_size,
            written: 0,
        })
    }

    pub fn append(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let n = std::cmp::min(self.buffer_size - self.buf.len(), data.len());
            self.buf.extend_from_slice(&data[..n]);
            self.written += n as u64;
            if self.buf.len() == self.buffer_size {
                self.flush()?;
            }
            data = &data[n..];
        }
        Ok(())
    }

    pub fn append_u64(&mut self, v: u64) -> Result<()> {
        self.append(&v.to_le_bytes())
    }

    /// Bytes appended so far, including those still sitting in the buffer.
    pub fn size(&self) -> u64 {
        self.written
    }

    pub fn flush(&mut self) -> Result<()> {
        use std::io::Write;
        if !self.buf.is_empty() {
            self.file.write_all(&self.buf)?;
            stats::add_write_bytes(self.buf.len() as u64);
            self.buf.clear();
        }
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}

/// Buffered sequential reader used to decode the metadata file.
pub struct FileReader {
    inner: BufReader<File>,
}

impl FileReader {
    pub fn open(path: &Path, buffer_size: usize, use_direct_io: bool) -> Result<Self> {
        warn_direct_io_unsupported(use_direct_io);
        let file = File::options()
            .read(true)
            .open(path)
            .with_context(|| format!("fail to open {}", path.display()))?;
        Ok(FileReader {
            inner: BufReader::with_capacity(buffer_size, file),
        })
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.inner.read_exact(&mut buf)?;
        stats::add_read_bytes(8);
        Ok(u64::from_le_bytes(buf))
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.inner.read_exact(&mut buf)?;
        stats::add_read_bytes(len as u64);
        Ok(buf)
    }
}

/// Generates monotonic SSTable ids and their file paths under the database
/// directory. Shared by the flush and compaction threads.
pub struct FileNameGenerator {
    dir: PathBuf,
    next_id: AtomicU64,
}

impl FileNameGenerator {
    pub fn new(dir: impl AsRef<Path>, next_id: u64) -> Self {
        FileNameGenerator {
            dir: dir.as_ref().to_path_buf(),
            next_id: AtomicU64::new(next_id),
        }
    }

    pub fn next(&self) -> (u64, PathBuf) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        (id, self.dir.join(format!("{}.sst", id)))
    }

    /// The next id that would be handed out; persisted in the metadata file.
    pub fn current(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst)
    }
}
