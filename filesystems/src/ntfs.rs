// NTFS driver glue
// ntfs-3g style drivers want a plain Read + Write + Seek device. DeviceStream
// wraps a device handle with a cursor and only accepts absolute seeks.

use blockbridge_core::{BlockError, DeviceHandle, Result};
use log::{debug, trace};
use std::io::{self, Read, Seek, SeekFrom, Write};

pub struct DeviceStream {
    handle: DeviceHandle,
    position: u64,
    size: u64,
}

impl DeviceStream {
    /// Wrap an open handle; the extent comes from the handle's geometry
    pub fn new(mut handle: DeviceHandle) -> Result<Self> {
        let size = handle.geometry()?.size_bytes();
        debug!("{}: exposing {} bytes as a stream", handle.name(), size);
        Ok(Self { handle, position: 0, size })
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn handle(&self) -> &DeviceHandle {
        &self.handle
    }

    pub fn into_inner(self) -> DeviceHandle {
        self.handle
    }
}

impl Read for DeviceStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.position >= self.size {
            return Ok(0);
        }
        let left = self.size - self.position;
        let len = usize::try_from(left).map_or(buf.len(), |left| buf.len().min(left));
        let n = self.handle.pread(&mut buf[..len], self.position)?;
        trace!("{}: read {} bytes at {:#x}", self.handle.name(), n, self.position);
        self.position += n as u64;
        Ok(n)
    }
}

impl Write for DeviceStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let end = self.position.saturating_add(buf.len() as u64);
        if end > self.size {
            return Err(BlockError::OutOfRange(format!(
                "{}: write of {} bytes at {} past {} bytes",
                self.handle.name(),
                buf.len(),
                self.position,
                self.size
            ))
            .into());
        }
        let n = self.handle.pwrite(buf, self.position)?;
        trace!("{}: wrote {} bytes at {:#x}", self.handle.name(), n, self.position);
        self.position += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(self.handle.sync()?)
    }
}

impl Seek for DeviceStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let SeekFrom::Start(target) = pos else {
            return Err(BlockError::unsupported(format!("{}: seek {:?}, only absolute seeks", self.handle.name(), pos)).into());
        };
        if target > self.size {
            return Err(BlockError::OutOfRange(format!(
                "{}: seek to {} past {} bytes",
                self.handle.name(),
                target,
                self.size
            ))
            .into());
        }
        self.position = target;
        Ok(target)
    }
}
