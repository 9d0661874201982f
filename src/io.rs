//! I/O collaborator traits and the standard-filesystem implementation.
//!
//! The core consumes storage through two narrow traits: [`FileWrite`]
//! (append, sync, atomic publish) on the build side and [`FileRead`]
//! (positioned reads into pooled buffers, best-effort prefetch) on the read
//! side. Every call on either trait is a potential suspension point; the
//! implementation may block.
//!
//! Buffers come from a [`BufferPool`] with power-of-two size classes. A
//! [`BlockHandle`] is reference-counted; the backing bytes are immovable
//! while any handle exists and the buffer returns to the pool when the last
//! handle drops.

use parking_lot::Mutex;
use std::fs;
use std::io::{self, Write};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Smallest pooled buffer class.
const MIN_CLASS: usize = 4096;

/// Buffers up to `MIN_CLASS << (N_CLASSES - 1)` (4 MiB) are recycled;
/// larger ones are freed on drop.
const N_CLASSES: usize = 11;

/// Pooled buffers retained per size class.
const MAX_PER_CLASS: usize = 32;

// ============================================================================
// Buffer pool
// ============================================================================

#[derive(Debug)]
struct PoolShared {
    classes: Vec<Mutex<Vec<Vec<u8>>>>,
}

/// Fixed-size-class buffer pool. Cheap to clone; clones share the pool.
#[derive(Clone, Debug)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self {
            shared: Arc::new(PoolShared {
                classes: (0..N_CLASSES).map(|_| Mutex::new(Vec::new())).collect(),
            }),
        }
    }
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a zero-filled buffer of exactly `len` bytes.
    pub fn acquire(&self, len: usize) -> PooledBuf {
        let capacity = len.next_power_of_two().max(MIN_CLASS);
        let class = class_index(capacity);
        let mut data = match class {
            Some(i) => self.shared.classes[i].lock().pop().unwrap_or_default(),
            None => Vec::new(),
        };
        data.clear();
        data.reserve(capacity);
        data.resize(len, 0);
        PooledBuf {
            data,
            shared: Arc::downgrade(&self.shared),
        }
    }
}

fn class_index(capacity: usize) -> Option<usize> {
    let i = (capacity / MIN_CLASS).trailing_zeros() as usize;
    (capacity.is_power_of_two() && capacity >= MIN_CLASS && i < N_CLASSES).then_some(i)
}

/// A mutable buffer checked out of a [`BufferPool`]. Returns its allocation
/// to the pool on drop.
#[derive(Debug)]
pub struct PooledBuf {
    data: Vec<u8>,
    shared: std::sync::Weak<PoolShared>,
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl std::ops::DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let data = std::mem::take(&mut self.data);
        if let Some(i) = class_index(data.capacity()) {
            let mut class = shared.classes[i].lock();
            if class.len() < MAX_PER_CLASS {
                class.push(data);
            }
        }
    }
}

/// An immutable, reference-counted block image.
#[derive(Debug)]
pub struct BlockBuf {
    buf: PooledBuf,
}

impl BlockBuf {
    pub fn new(buf: PooledBuf) -> Self {
        Self { buf }
    }
}

impl Deref for BlockBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

/// Shared handle to a block image. While any handle exists the bytes are
/// pinned; the buffer becomes evictable (returns to its pool) when the last
/// handle drops.
pub type BlockHandle = Arc<BlockBuf>;

// ============================================================================
// Collaborator traits
// ============================================================================

/// Write side of the I/O collaborator: a single append-only file.
pub trait FileWrite: Send {
    /// Append `data`, returning the byte offset it starts at.
    fn append(&mut self, data: &[u8]) -> io::Result<u64>;

    /// Durably flush everything appended so far.
    fn sync(&mut self) -> io::Result<()>;

    /// Atomically publish the finished file. For filesystem implementations
    /// this is the tmp-to-final rename; until it succeeds the file is
    /// invisible. Called once, after the trailer has been synced.
    fn publish(&mut self) -> io::Result<()>;
}

/// Read side of the I/O collaborator: positioned reads over one file.
pub trait FileRead: Send + Sync {
    /// Total file length in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read exactly `len` bytes starting at `offset`.
    fn read(&self, offset: u64, len: usize) -> io::Result<BlockHandle>;

    /// Best-effort hint that `(offset, len)` runs will be read soon.
    fn prefetch(&self, _runs: &[(u64, usize)]) {}
}

// ============================================================================
// Standard filesystem implementation
// ============================================================================

/// [`FileWrite`] over a temporary file in the destination directory,
/// published by an atomic rename. Dropping an unpublished writer removes the
/// temporary file.
pub struct StdFileWriter {
    file: fs::File,
    tmp_path: PathBuf,
    final_path: PathBuf,
    len: u64,
    published: bool,
}

impl StdFileWriter {
    /// Create the temporary file next to `path`.
    pub fn create(path: &Path) -> io::Result<Self> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
        let tmp_path = path.with_file_name(format!(".{file_name}.tmp"));
        let file = fs::File::create(&tmp_path)?;
        Ok(Self {
            file,
            tmp_path,
            final_path: path.to_path_buf(),
            len: 0,
            published: false,
        })
    }

    /// The path the file will be published at.
    pub fn path(&self) -> &Path {
        &self.final_path
    }
}

impl FileWrite for StdFileWriter {
    fn append(&mut self, data: &[u8]) -> io::Result<u64> {
        let offset = self.len;
        self.file.write_all(data)?;
        self.len += data.len() as u64;
        Ok(offset)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }

    fn publish(&mut self) -> io::Result<()> {
        fs::rename(&self.tmp_path, &self.final_path)?;
        self.published = true;
        Ok(())
    }
}

impl Drop for StdFileWriter {
    fn drop(&mut self) {
        if !self.published {
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}

/// [`FileRead`] over a regular file using positioned reads.
pub struct StdFileReader {
    file: fs::File,
    len: u64,
    pool: BufferPool,
}

impl StdFileReader {
    pub fn open(path: &Path) -> io::Result<Self> {
        Self::open_with_pool(path, BufferPool::new())
    }

    pub fn open_with_pool(path: &Path, pool: BufferPool) -> io::Result<Self> {
        let file = fs::File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self { file, len, pool })
    }
}

impl FileRead for StdFileReader {
    fn len(&self) -> u64 {
        self.len
    }

    fn read(&self, offset: u64, len: usize) -> io::Result<BlockHandle> {
        let mut buf = self.pool.acquire(len);
        read_exact_at(&self.file, &mut buf, offset)?;
        Ok(Arc::new(BlockBuf::new(buf)))
    }
}

#[cfg(unix)]
fn read_exact_at(file: &fs::File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &fs::File, buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut buf = &mut buf[..];
    while !buf.is_empty() {
        let n = file.seek_read(buf, offset)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read past end of file",
            ));
        }
        buf = &mut std::mem::take(&mut buf)[n..];
        offset += n as u64;
    }
    Ok(())
}

// ============================================================================
// In-memory implementation
// ============================================================================

/// In-memory file, usable as both [`FileWrite`] and [`FileRead`]. Intended
/// for tests and embedded callers that never touch a filesystem.
#[derive(Clone, Default, Debug)]
pub struct MemFile {
    data: Arc<parking_lot::RwLock<Vec<u8>>>,
    pool: BufferPool,
}

impl MemFile {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FileWrite for MemFile {
    fn append(&mut self, data: &[u8]) -> io::Result<u64> {
        let mut guard = self.data.write();
        let offset = guard.len() as u64;
        guard.extend_from_slice(data);
        Ok(offset)
    }

    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn publish(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl FileRead for MemFile {
    fn len(&self) -> u64 {
        self.data.read().len() as u64
    }

    fn read(&self, offset: u64, len: usize) -> io::Result<BlockHandle> {
        let guard = self.data.read();
        let start = offset as usize;
        let end = start
            .checked_add(len)
            .filter(|&end| end <= guard.len())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::UnexpectedEof, "read past end of file")
            })?;
        let mut buf = self.pool.acquire(len);
        buf.copy_from_slice(&guard[start..end]);
        Ok(Arc::new(BlockBuf::new(buf)))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_recycles_buffers() {
        let pool = BufferPool::new();
        let buf = pool.acquire(5000);
        assert_eq!(buf.len(), 5000);
        let cap = buf.data.capacity();
        drop(buf);

        let buf = pool.acquire(4097);
        assert_eq!(buf.data.capacity(), cap);
    }

    #[test]
    fn test_pool_oversize_not_recycled() {
        let pool = BufferPool::new();
        let buf = pool.acquire(8 * 1024 * 1024);
        assert_eq!(buf.len(), 8 * 1024 * 1024);
        drop(buf);
        assert!(pool.shared.classes.iter().all(|c| c.lock().is_empty()));
    }

    #[test]
    fn test_mem_file_round_trip() {
        let mut file = MemFile::new();
        assert_eq!(file.append(b"abcd").unwrap(), 0);
        assert_eq!(file.append(b"efgh").unwrap(), 4);
        assert_eq!(FileRead::len(&file), 8);

        let block = file.read(2, 4).unwrap();
        assert_eq!(&block[..], b"cdef");
        assert!(file.read(6, 4).is_err());
    }

    #[test]
    fn test_std_file_publish() {
        let dir = std::env::temp_dir().join("stratafile_test_io_publish");
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("out.strata");

        let mut writer = StdFileWriter::create(&path).unwrap();
        writer.append(b"hello").unwrap();
        writer.sync().unwrap();
        assert!(!path.exists());
        writer.publish().unwrap();
        assert!(path.exists());
        drop(writer);
        assert!(path.exists());

        let reader = StdFileReader::open(&path).unwrap();
        let block = reader.read(0, 5).unwrap();
        assert_eq!(&block[..], b"hello");

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_std_file_drop_removes_unpublished() {
        let dir = std::env::temp_dir().join("stratafile_test_io_drop");
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("out.strata");

        let mut writer = StdFileWriter::create(&path).unwrap();
        writer.append(b"junk").unwrap();
        let tmp = writer.tmp_path.clone();
        assert!(tmp.exists());
        drop(writer);
        assert!(!tmp.exists());
        assert!(!path.exists());

        let _ = fs::remove_dir_all(&dir);
    }
}
