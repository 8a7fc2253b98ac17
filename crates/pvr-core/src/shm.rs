//! Shared-memory image channel.
//!
//! Segments are files named `pvr-<uuid>` in the configured shm directory
//! (tmpfs on Linux), mapped with `memmap2`. Each segment is a 32-byte
//! little-endian header followed by the pixel bytes:
//!
//! ```text
//! 0..4   magic "PVSH"
//! 4..6   u16 header version (1)
//! 6..8   u16 pixel format code
//! 8..12  u32 width
//! 12..16 u32 height
//! 16..24 u64 byte length
//! 24..32 reserved, zero
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapOptions};
use pvr_domain::{ImageMeta, PixelFormat};
use tracing::{trace, warn};
use uuid::Uuid;

use crate::error::{Result, RunnerError};

pub const SHM_MAGIC: [u8; 4] = *b"PVSH";
pub const SHM_HEADER_VERSION: u16 = 1;
pub const SHM_HEADER_LEN: usize = 32;
const SHM_PREFIX: &str = "pvr-";

/// Moves image bytes between processes outside the message channel.
pub trait ImageChannel: Send + Sync {
    /// Stores `bytes` in a fresh segment and returns its id. Ids are never
    /// reused.
    fn allocate(&self, bytes: &[u8], meta: &ImageMeta) -> Result<String>;
    fn release(&self, shm_id: &str) -> Result<()>;
    fn read(&self, shm_id: &str) -> Result<(Vec<u8>, ImageMeta)>;
}

/// A segment that is released when dropped.
pub struct ShmLease<'a> {
    channel: &'a dyn ImageChannel,
    id: String,
    released: bool,
}

impl<'a> ShmLease<'a> {
    pub fn allocate(channel: &'a dyn ImageChannel, bytes: &[u8], meta: &ImageMeta) -> Result<Self> {
        let id = channel.allocate(bytes, meta)?;
        Ok(Self {
            channel,
            id,
            released: false,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Releases now, surfacing the error the drop path would only log.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.channel.release(&self.id)
    }
}

impl Drop for ShmLease<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(err) = self.channel.release(&self.id) {
            warn!(shm_id = %self.id, error = %err, "failed to release image segment");
        }
    }
}

/// File-backed segments under one directory.
#[derive(Debug, Clone)]
pub struct FileShmChannel {
    dir: PathBuf,
}

impl FileShmChannel {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn segment_path(&self, shm_id: &str) -> Result<PathBuf> {
        let valid = shm_id
            .strip_prefix(SHM_PREFIX)
            .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|ch| ch.is_ascii_hexdigit()));
        if !valid {
            return Err(RunnerError::ImageTransfer(format!(
                "`{shm_id}` is not a segment id"
            )));
        }
        Ok(self.dir.join(shm_id))
    }

    fn write_segment(file: &File, bytes: &[u8], meta: &ImageMeta) -> std::io::Result<()> {
        let total = SHM_HEADER_LEN + bytes.len();
        file.set_len(total as u64)?;
        // SAFETY: the file was just created with `create_new` and is private
        // to this call until its id is handed out, so nothing else maps or
        // truncates it while the mapping is alive.
        let mut map = unsafe { MmapOptions::new().len(total).map_mut(file)? };
        map[..SHM_HEADER_LEN].copy_from_slice(&encode_header(meta));
        map[SHM_HEADER_LEN..].copy_from_slice(bytes);
        map.flush()
    }
}

impl ImageChannel for FileShmChannel {
    fn allocate(&self, bytes: &[u8], meta: &ImageMeta) -> Result<String> {
        meta.validate()
            .map_err(|err| RunnerError::ImageTransfer(format!("{err:#}")))?;
        if bytes.len() as u64 != meta.byte_len {
            return Err(RunnerError::ImageTransfer(format!(
                "image has {} bytes but metadata says {}",
                bytes.len(),
                meta.byte_len
            )));
        }
        fs::create_dir_all(&self.dir).map_err(|err| {
            RunnerError::ImageTransfer(format!("cannot create {}: {err}", self.dir.display()))
        })?;
        let id = format!("{SHM_PREFIX}{}", Uuid::new_v4().simple());
        let path = self.dir.join(&id);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|err| {
                RunnerError::ImageTransfer(format!("cannot create segment {id}: {err}"))
            })?;
        if let Err(err) = Self::write_segment(&file, bytes, meta) {
            drop(file);
            let _ = fs::remove_file(&path);
            return Err(RunnerError::ImageTransfer(format!(
                "cannot write segment {id}: {err}"
            )));
        }
        trace!(shm_id = %id, bytes = bytes.len(), "segment allocated");
        Ok(id)
    }

    fn release(&self, shm_id: &str) -> Result<()> {
        let path = self.segment_path(shm_id)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                trace!(shm_id, "segment released");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Err(RunnerError::ImageTransfer(
                format!("segment {shm_id} does not exist"),
            )),
            Err(err) => Err(RunnerError::ImageTransfer(format!(
                "cannot release segment {shm_id}: {err}"
            ))),
        }
    }

    fn read(&self, shm_id: &str) -> Result<(Vec<u8>, ImageMeta)> {
        let path = self.segment_path(shm_id)?;
        let file = File::open(&path)
            .map_err(|err| RunnerError::ImageTransfer(format!("cannot open segment {shm_id}: {err}")))?;
        // SAFETY: segments are written once before their id is published and
        // only removed by `release`, never truncated in place.
        let map: Mmap = unsafe { MmapOptions::new().map(&file) }
            .map_err(|err| RunnerError::ImageTransfer(format!("cannot map segment {shm_id}: {err}")))?;
        let meta = decode_header(&map)?;
        let end = usize::try_from(meta.byte_len)
            .ok()
            .and_then(|len| len.checked_add(SHM_HEADER_LEN))
            .filter(|end| *end <= map.len())
            .ok_or_else(|| {
                RunnerError::ImageTransfer(format!(
                    "segment {shm_id} is shorter than its header claims"
                ))
            })?;
        Ok((map[SHM_HEADER_LEN..end].to_vec(), meta))
    }
}

pub fn encode_header(meta: &ImageMeta) -> [u8; SHM_HEADER_LEN] {
    let mut header = [0_u8; SHM_HEADER_LEN];
    header[0..4].copy_from_slice(&SHM_MAGIC);
    header[4..6].copy_from_slice(&SHM_HEADER_VERSION.to_le_bytes());
    header[6..8].copy_from_slice(&meta.format.code().to_le_bytes());
    header[8..12].copy_from_slice(&meta.width.to_le_bytes());
    header[12..16].copy_from_slice(&meta.height.to_le_bytes());
    header[16..24].copy_from_slice(&meta.byte_len.to_le_bytes());
    header
}

pub fn decode_header(bytes: &[u8]) -> Result<ImageMeta> {
    let bad = |reason: &str| RunnerError::ImageTransfer(format!("bad segment header: {reason}"));
    let header = bytes.get(..SHM_HEADER_LEN).ok_or_else(|| bad("truncated"))?;
    if header[0..4] != SHM_MAGIC {
        return Err(bad("wrong magic"));
    }
    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != SHM_HEADER_VERSION {
        return Err(bad(&format!("unsupported version {version}")));
    }
    let code = u16::from_le_bytes([header[6], header[7]]);
    let format = PixelFormat::from_code(code).ok_or_else(|| bad(&format!("unknown format {code}")))?;
    let mut width = [0_u8; 4];
    width.copy_from_slice(&header[8..12]);
    let mut height = [0_u8; 4];
    height.copy_from_slice(&header[12..16]);
    let mut byte_len = [0_u8; 8];
    byte_len.copy_from_slice(&header[16..24]);
    Ok(ImageMeta {
        width: u32::from_le_bytes(width),
        height: u32::from_le_bytes(height),
        format,
        byte_len: u64::from_le_bytes(byte_len),
    })
}
