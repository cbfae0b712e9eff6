// Device-operations table
// Filesystem drivers talk to storage exclusively through `DeviceOps`; a backend is
// bound to its `DeviceHandle` once, at construction, and never swapped afterwards.

use crate::error::{BlockError, Result};
use crate::geometry::SectorGeometry;
use serde::{Deserialize, Serialize};
use std::io::SeekFrom;
use tracing::{debug, trace, warn};

/// Generic control codes understood by every backend shipped with this crate.
///
/// Backend-specific codes (for example resolved usbdevfs requests) go through
/// the same `control` entry point; anything a backend does not recognise is
/// `Unsupported`.
pub mod control {
    /// Returns the sector size in bytes
    pub const GET_SECTOR_SIZE: u64 = 0x4242_0001;
    /// Returns the number of addressable sectors
    pub const GET_SECTOR_COUNT: u64 = 0x4242_0002;
    /// Flushes buffered writes, returns 0
    pub const FLUSH: u64 = 0x4242_0003;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenFlags {
    pub read_only: bool,
    /// Exclusive lock when true, shared lock otherwise
    pub exclusive: bool,
}

impl OpenFlags {
    pub const READ_WRITE: OpenFlags = OpenFlags { read_only: false, exclusive: true };
    pub const READ_ONLY: OpenFlags = OpenFlags { read_only: true, exclusive: false };

    /// Two holders may coexist only if both asked for a shared lock
    pub fn compatible_with(&self, other: &OpenFlags) -> bool {
        !self.exclusive && !other.exclusive
    }
}

impl Default for OpenFlags {
    fn default() -> Self {
        Self::READ_WRITE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediumKind {
    Memory,
    File,
    BlockDevice,
    Stream,
    UsbMassStorage,
}

/// Size and medium metadata returned by `stat`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStat {
    pub size_bytes: u64,
    pub sector_size: u32,
    pub sector_count: u64,
    pub read_only: bool,
    pub medium: MediumKind,
}

impl DeviceStat {
    pub fn from_geometry(geometry: SectorGeometry, read_only: bool, medium: MediumKind) -> Self {
        Self {
            size_bytes: geometry.size_bytes(),
            sector_size: geometry.sector_size,
            sector_count: geometry.sector_count,
            read_only,
            medium,
        }
    }

    pub fn geometry(&self) -> Result<SectorGeometry> {
        SectorGeometry::new(self.sector_size, self.sector_count)
    }
}

/// The operation set every backend supplies.
///
/// Operations a backend cannot perform return `BlockError::Unsupported`; the
/// defaults below do exactly that, so a read-only backend simply leaves `write`
/// alone. `pread`/`pwrite` are provided in terms of `seek` + `read`/`write` and
/// refuse to transfer anything when the seek lands somewhere other than the
/// requested offset.
pub trait DeviceOps: Send {
    /// Short human-readable identity, used in logs
    fn name(&self) -> &str;

    fn open(&mut self, flags: OpenFlags) -> Result<()>;

    /// Release resources and locks. Must tolerate being called on a closed backend.
    fn close(&mut self) -> Result<()>;

    /// Returns the new absolute position
    fn seek(&mut self, pos: SeekFrom) -> Result<u64>;

    /// Read at the current position, returning the number of bytes transferred
    fn read(&mut self, _buf: &mut [u8]) -> Result<usize> {
        Err(BlockError::unsupported(format!("{}: read", self.name())))
    }

    /// Write at the current position, returning the number of bytes transferred
    fn write(&mut self, _buf: &[u8]) -> Result<usize> {
        Err(BlockError::unsupported(format!("{}: write", self.name())))
    }

    fn pread(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let landed = self.seek(SeekFrom::Start(offset))?;
        if landed != offset {
            return Err(BlockError::SeekFailure { expected: offset, actual: landed });
        }
        self.read(buf)
    }

    fn pwrite(&mut self, buf: &[u8], offset: u64) -> Result<usize> {
        let landed = self.seek(SeekFrom::Start(offset))?;
        if landed != offset {
            return Err(BlockError::SeekFailure { expected: offset, actual: landed });
        }
        self.write(buf)
    }

    /// Block until buffered writes are durable
    fn sync(&mut self) -> Result<()>;

    fn stat(&self) -> Result<DeviceStat> {
        Err(BlockError::unsupported(format!("{}: stat", self.name())))
    }

    fn control(&mut self, code: u64, _arg: u64) -> Result<u64> {
        Err(BlockError::unsupported(format!("{}: control code {:#x}", self.name(), code)))
    }
}

/// Exclusive owner of one backend.
///
/// The handle tracks open/closed state so that `close` is idempotent and so that
/// nothing is dispatched to a backend that was never opened. Callers serialise
/// access; there is no internal locking.
pub struct DeviceHandle {
    ops: Box<dyn DeviceOps>,
    flags: Option<OpenFlags>,
}

impl DeviceHandle {
    /// Bind `ops` without opening it yet
    pub fn new(ops: impl DeviceOps + 'static) -> Self {
        Self::from_boxed(Box::new(ops))
    }

    pub fn from_boxed(ops: Box<dyn DeviceOps>) -> Self {
        Self { ops, flags: None }
    }

    /// Bind and open in one step
    pub fn open_with(ops: impl DeviceOps + 'static, flags: OpenFlags) -> Result<Self> {
        let mut handle = Self::new(ops);
        handle.open(flags)?;
        Ok(handle)
    }

    pub fn name(&self) -> &str {
        self.ops.name()
    }

    pub fn is_open(&self) -> bool {
        self.flags.is_some()
    }

    pub fn flags(&self) -> Option<OpenFlags> {
        self.flags
    }

    /// Opening an already-open handle is a no-op
    pub fn open(&mut self, flags: OpenFlags) -> Result<()> {
        if self.flags.is_some() {
            trace!("{}: already open", self.ops.name());
            return Ok(());
        }
        self.ops.open(flags)?;
        debug!("{}: opened (read_only={}, exclusive={})", self.ops.name(), flags.read_only, flags.exclusive);
        self.flags = Some(flags);
        Ok(())
    }

    /// Second and later calls succeed without touching the backend
    pub fn close(&mut self) -> Result<()> {
        if self.flags.take().is_none() {
            trace!("{}: close on closed handle", self.ops.name());
            return Ok(());
        }
        debug!("{}: closing", self.ops.name());
        self.ops.close()
    }

    fn ensure_open(&self) -> Result<OpenFlags> {
        self.flags
            .ok_or_else(|| BlockError::io(format!("{}: device handle is not open", self.ops.name())))
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.ensure_open()?.read_only {
            return Err(BlockError::unsupported(format!("{}: opened read-only", self.ops.name())));
        }
        Ok(())
    }

    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.ensure_open()?;
        self.ops.seek(pos)
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.ensure_open()?;
        self.ops.read(buf)
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.ensure_writable()?;
        self.ops.write(buf)
    }

    pub fn pread(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.ensure_open()?;
        trace!("{}: pread {} bytes at {:#x}", self.ops.name(), buf.len(), offset);
        self.ops.pread(buf, offset)
    }

    pub fn pwrite(&mut self, buf: &[u8], offset: u64) -> Result<usize> {
        self.ensure_writable()?;
        trace!("{}: pwrite {} bytes at {:#x}", self.ops.name(), buf.len(), offset);
        self.ops.pwrite(buf, offset)
    }

    pub fn sync(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.ops.sync()
    }

    pub fn stat(&self) -> Result<DeviceStat> {
        self.ensure_open()?;
        self.ops.stat()
    }

    pub fn control(&mut self, code: u64, arg: u64) -> Result<u64> {
        self.ensure_open()?;
        self.ops.control(code, arg)
    }

    /// Geometry from `stat`, or from the generic control codes when `stat` is unsupported
    pub fn geometry(&mut self) -> Result<SectorGeometry> {
        match self.stat() {
            Ok(stat) => stat.geometry(),
            Err(BlockError::Unsupported(_)) => {
                let sector_size = self.control(control::GET_SECTOR_SIZE, 0)?;
                let sector_count = self.control(control::GET_SECTOR_COUNT, 0)?;
                let sector_size = u32::try_from(sector_size).map_err(|_| {
                    BlockError::OutOfRange(format!("reported sector size {} too large", sector_size))
                })?;
                SectorGeometry::new(sector_size, sector_count)
            }
            Err(e) => Err(e),
        }
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        if self.flags.is_some() {
            if let Err(e) = self.close() {
                warn!("{}: close on drop failed: {}", self.ops.name(), e);
            }
        }
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("backend", &self.ops.name())
            .field("flags", &self.flags)
            .finish()
    }
}
