//! Fixed-geometry shared-memory buffer pool for frame reception.
//!
//! The receiver writes detector frames straight into pre-allocated memory
//! blocks and hands downstream consumers an integer [`BufferId`] rather than
//! an owned allocation. This crate owns those blocks:
//!
//! - a fixed number of blocks, all the same size, decided at creation
//! - blocks addressed by `BufferId` (`0..num_buffers`)
//! - anonymous maps for in-process pipelines, or a file-backed map
//!   (typically under `/dev/shm`) that a second process can [`open`]
//!
//! The pool does no ownership bookkeeping of its own. Which IDs are free and
//! which are filling is tracked by the frame decoder that the pool is
//! registered with; the pool only guarantees that each block is accessed
//! through a scoped borrow.
//!
//! # Shared Memory Layout
//!
//! File-backed pools start with a 64-byte header followed by the blocks:
//!
//! ```text
//! 0      magic        u64  "FRSHMBUF"
//! 8      version      u32
//! 12     reserved     u32
//! 16     manager_id   u64
//! 24     num_buffers  u64
//! 32     buffer_size  u64
//! 40..64 padding
//! 64     block 0, block 1, ...
//! ```
//!
//! # Example
//!
//! ```
//! use fr_pool::SharedBufferManager;
//!
//! let manager = SharedBufferManager::new("example", 4, 1024).unwrap();
//! manager.write_at(2, 0, b"frame").unwrap();
//!
//! let bytes = manager.copy_out(2, 0, 5).unwrap();
//! assert_eq!(&bytes[..], b"frame");
//! ```
//!
//! [`open`]: SharedBufferManager::open

pub mod error;

pub use error::{PoolError, PoolResult};

use bytes::{Buf, BufMut, Bytes};
use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Integer handle naming one block of a [`SharedBufferManager`].
pub type BufferId = usize;

/// Magic number at the start of a file-backed pool ("FRSHMBUF").
const MAGIC: u64 = 0x4652_5348_4D42_5546;

/// Layout version of the shared-memory header.
const LAYOUT_VERSION: u32 = 1;

/// Size of the shared-memory header in bytes.
pub const HEADER_SIZE: usize = 64;

static NEXT_MANAGER_SEQ: AtomicU64 = AtomicU64::new(1);

fn next_manager_id() -> u64 {
    (u64::from(std::process::id()) << 32) | NEXT_MANAGER_SEQ.fetch_add(1, Ordering::Relaxed)
}

/// Pool of fixed-size memory blocks addressed by [`BufferId`].
///
/// Each block sits behind its own mutex so that a writer filling one frame
/// never contends with a reader draining another.
pub struct SharedBufferManager {
    name: String,
    manager_id: u64,
    buffer_size: usize,
    blocks: Vec<Mutex<MmapMut>>,
    backing: Option<PathBuf>,
}

impl std::fmt::Debug for SharedBufferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBufferManager")
            .field("name", &self.name)
            .field("manager_id", &self.manager_id)
            .field("num_buffers", &self.blocks.len())
            .field("buffer_size", &self.buffer_size)
            .field("backing", &self.backing)
            .finish()
    }
}

impl SharedBufferManager {
    /// Create a pool backed by anonymous memory maps.
    ///
    /// # Errors
    /// Returns [`PoolError::InvalidGeometry`] if either dimension is zero, or
    /// [`PoolError::Io`] if the kernel refuses a mapping.
    pub fn new(name: &str, num_buffers: usize, buffer_size: usize) -> PoolResult<Arc<Self>> {
        validate_geometry(num_buffers, buffer_size)?;

        let blocks = (0..num_buffers)
            .map(|_| MmapMut::map_anon(buffer_size).map(Mutex::new))
            .collect::<Result<Vec<_>, _>>()?;

        let manager = Self {
            name: name.to_string(),
            manager_id: next_manager_id(),
            buffer_size,
            blocks,
            backing: None,
        };
        manager.log_created();
        Ok(Arc::new(manager))
    }

    /// Create a file-backed pool at `path`, truncating any existing file.
    ///
    /// Another process can attach to the same blocks with [`open`](Self::open).
    ///
    /// # Errors
    /// Returns an error for a zero dimension or if the file cannot be sized
    /// and mapped.
    pub fn create<P: AsRef<Path>>(
        path: P,
        num_buffers: usize,
        buffer_size: usize,
    ) -> PoolResult<Arc<Self>> {
        validate_geometry(num_buffers, buffer_size)?;
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let total = total_file_len(num_buffers, buffer_size)?;
        file.set_len(total)?;

        let manager_id = next_manager_id();
        write_header(&file, manager_id, num_buffers, buffer_size)?;
        let blocks = map_blocks(&file, num_buffers, buffer_size)?;

        let manager = Self {
            name: path.display().to_string(),
            manager_id,
            buffer_size,
            blocks,
            backing: Some(path.to_path_buf()),
        };
        manager.log_created();
        Ok(Arc::new(manager))
    }

    /// Attach to a pool previously created with [`create`](Self::create).
    ///
    /// # Errors
    /// Returns [`PoolError::HeaderMismatch`] if the file is not a pool or is
    /// shorter than its header claims.
    pub fn open<P: AsRef<Path>>(path: P) -> PoolResult<Arc<Self>> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        let (manager_id, num_buffers, buffer_size) = read_header(&file)?;
        let expected = total_file_len(num_buffers, buffer_size)?;
        let actual = file.metadata()?.len();
        if actual < expected {
            return Err(PoolError::HeaderMismatch(format!(
                "file is {actual} bytes but header describes {expected}"
            )));
        }

        let blocks = map_blocks(&file, num_buffers, buffer_size)?;
        debug!(
            path = %path.display(),
            manager_id,
            num_buffers,
            buffer_size,
            "Attached to shared buffer pool"
        );

        Ok(Arc::new(Self {
            name: path.display().to_string(),
            manager_id,
            buffer_size,
            blocks,
            backing: Some(path.to_path_buf()),
        }))
    }

    fn log_created(&self) {
        info!(
            name = %self.name,
            manager_id = self.manager_id,
            num_buffers = self.blocks.len(),
            buffer_size = self.buffer_size,
            total_mb = self.total_bytes() as f64 / (1024.0 * 1024.0),
            shared = self.backing.is_some(),
            "Created shared buffer pool"
        );
    }

    /// Pool name (the backing path for file-backed pools).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identifier unique to this pool instance.
    #[must_use]
    pub fn manager_id(&self) -> u64 {
        self.manager_id
    }

    /// Number of blocks in the pool.
    #[must_use]
    pub fn num_buffers(&self) -> usize {
        self.blocks.len()
    }

    /// Size of each block in bytes.
    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Total mapped bytes across all blocks.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.blocks.len() * self.buffer_size
    }

    /// Backing file, if the pool is file-backed.
    #[must_use]
    pub fn backing_path(&self) -> Option<&Path> {
        self.backing.as_deref()
    }

    /// Whether `id` names a block of this pool.
    #[must_use]
    pub fn contains(&self, id: BufferId) -> bool {
        id < self.blocks.len()
    }

    fn block(&self, id: BufferId) -> PoolResult<&Mutex<MmapMut>> {
        self.blocks.get(id).ok_or(PoolError::InvalidBufferId {
            id,
            num_buffers: self.blocks.len(),
        })
    }

    fn check_range(&self, offset: usize, len: usize) -> PoolResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.buffer_size => Ok(()),
            _ => Err(PoolError::OutOfBounds {
                offset,
                len,
                buffer_size: self.buffer_size,
            }),
        }
    }

    /// Run `f` with exclusive write access to block `id`.
    ///
    /// # Errors
    /// Returns [`PoolError::InvalidBufferId`] for an unknown block.
    pub fn with_buffer_mut<R>(&self, id: BufferId, f: impl FnOnce(&mut [u8]) -> R) -> PoolResult<R> {
        let mut block = self.block(id)?.lock();
        Ok(f(&mut block[..]))
    }

    /// Run `f` with read access to block `id`.
    ///
    /// # Errors
    /// Returns [`PoolError::InvalidBufferId`] for an unknown block.
    pub fn with_buffer<R>(&self, id: BufferId, f: impl FnOnce(&[u8]) -> R) -> PoolResult<R> {
        let block = self.block(id)?.lock();
        Ok(f(&block[..]))
    }

    /// Copy `data` into block `id` at `offset`.
    ///
    /// # Errors
    /// Fails for an unknown block or if the write would overrun the block.
    pub fn write_at(&self, id: BufferId, offset: usize, data: &[u8]) -> PoolResult<()> {
        self.check_range(offset, data.len())?;
        self.with_buffer_mut(id, |block| {
            block[offset..offset + data.len()].copy_from_slice(data);
        })
    }

    /// Copy `len` bytes starting at `offset` out of block `id`.
    ///
    /// # Errors
    /// Fails for an unknown block or if the range overruns the block.
    pub fn copy_out(&self, id: BufferId, offset: usize, len: usize) -> PoolResult<Bytes> {
        self.check_range(offset, len)?;
        self.with_buffer(id, |block| {
            Bytes::copy_from_slice(&block[offset..offset + len])
        })
    }

    /// Flush file-backed blocks to the backing file. No-op for anonymous pools.
    ///
    /// # Errors
    /// Propagates the first flush failure.
    pub fn flush(&self) -> PoolResult<()> {
        if self.backing.is_none() {
            return Ok(());
        }
        for block in &self.blocks {
            block.lock().flush()?;
        }
        Ok(())
    }
}

fn validate_geometry(num_buffers: usize, buffer_size: usize) -> PoolResult<()> {
    if num_buffers == 0 {
        return Err(PoolError::InvalidGeometry(
            "pool must contain at least one buffer".into(),
        ));
    }
    if buffer_size == 0 {
        return Err(PoolError::InvalidGeometry(
            "buffer size must be greater than 0".into(),
        ));
    }
    Ok(())
}

fn total_file_len(num_buffers: usize, buffer_size: usize) -> PoolResult<u64> {
    num_buffers
        .checked_mul(buffer_size)
        .and_then(|blocks| blocks.checked_add(HEADER_SIZE))
        .map(|total| total as u64)
        .ok_or_else(|| {
            PoolError::InvalidGeometry(format!(
                "{num_buffers} buffers of {buffer_size} bytes overflows the address space"
            ))
        })
}

#[allow(unsafe_code)]
fn write_header(file: &File, manager_id: u64, num_buffers: usize, buffer_size: usize) -> PoolResult<()> {
    // SAFETY: the file was just created and truncated by this process; no
    // other mapping of the header region exists yet.
    let mut header = unsafe { MmapOptions::new().len(HEADER_SIZE).map_mut(file)? };

    let mut cursor = &mut header[..];
    cursor.put_u64_le(MAGIC);
    cursor.put_u32_le(LAYOUT_VERSION);
    cursor.put_u32_le(0);
    cursor.put_u64_le(manager_id);
    cursor.put_u64_le(num_buffers as u64);
    cursor.put_u64_le(buffer_size as u64);

    header.flush()?;
    Ok(())
}

#[allow(unsafe_code)]
fn read_header(file: &File) -> PoolResult<(u64, usize, usize)> {
    if file.metadata()?.len() < HEADER_SIZE as u64 {
        return Err(PoolError::HeaderMismatch("file shorter than header".into()));
    }

    // SAFETY: read-only map of the header; the creating process writes it
    // once before any peer opens the file.
    let header = unsafe { MmapOptions::new().len(HEADER_SIZE).map(file)? };

    let mut cursor = &header[..];
    let magic = cursor.get_u64_le();
    if magic != MAGIC {
        return Err(PoolError::HeaderMismatch(format!("bad magic {magic:#018x}")));
    }
    let version = cursor.get_u32_le();
    if version != LAYOUT_VERSION {
        return Err(PoolError::HeaderMismatch(format!(
            "unsupported layout version {version}"
        )));
    }
    let _reserved = cursor.get_u32_le();
    let manager_id = cursor.get_u64_le();
    let num_buffers = cursor.get_u64_le() as usize;
    let buffer_size = cursor.get_u64_le() as usize;

    validate_geometry(num_buffers, buffer_size)
        .map_err(|e| PoolError::HeaderMismatch(e.to_string()))?;
    Ok((manager_id, num_buffers, buffer_size))
}

#[allow(unsafe_code)]
fn map_blocks(file: &File, num_buffers: usize, buffer_size: usize) -> PoolResult<Vec<Mutex<MmapMut>>> {
    (0..num_buffers)
        .map(|idx| {
            let offset = (HEADER_SIZE + idx * buffer_size) as u64;
            // SAFETY: blocks never overlap and the file length was checked
            // to cover every block. Cross-process writers coordinate through
            // buffer ID ownership, never through overlapping ranges.
            let map = unsafe {
                MmapOptions::new()
                    .offset(offset)
                    .len(buffer_size)
                    .map_mut(file)?
            };
            Ok(Mutex::new(map))
        })
        .collect()
}
