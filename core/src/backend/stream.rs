// Stream backend
// Exposes any `Read + Write + Seek` value (an image file, a cursor, a SCSI-backed
// reader) as a device with caller-supplied geometry.

use crate::device::{control, DeviceOps, DeviceStat, MediumKind, OpenFlags};
use crate::error::{BlockError, Result};
use crate::geometry::SectorGeometry;
use crate::sector_io::{read_full, write_full};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};

pub struct StreamBackend<T> {
    inner: T,
    geometry: SectorGeometry,
    writable: bool,
    name: String,
}

impl<T: Read + Write + Seek + Send> StreamBackend<T> {
    pub fn new(inner: T, geometry: SectorGeometry) -> Self {
        Self {
            inner,
            geometry,
            writable: true,
            name: format!("stream:{}x{}", geometry.sector_count, geometry.sector_size),
        }
    }
}

impl<T: Read + Seek + Send> StreamBackend<ReadOnlyStream<T>> {
    /// Backend over a stream that can only be read; writes report `Unsupported`
    pub fn read_only(inner: T, geometry: SectorGeometry) -> Self {
        Self {
            inner: ReadOnlyStream(inner),
            geometry,
            writable: false,
            name: format!("stream-ro:{}x{}", geometry.sector_count, geometry.sector_size),
        }
    }
}

impl<T> StreamBackend<T> {
    pub fn into_inner(self) -> T {
        self.inner
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }
}

impl<T: Seek> StreamBackend<T> {
    /// How much of a `len`-byte transfer at the current position fits in the extent.
    /// The underlying stream may be longer than the geometry; bytes past it are not addressable.
    fn remaining(&mut self, len: usize) -> Result<usize> {
        let left = self.geometry.size_bytes().saturating_sub(self.inner.stream_position()?);
        Ok(usize::try_from(left).map_or(len, |left| len.min(left)))
    }
}

impl<T: Read + Write + Seek + Send> DeviceOps for StreamBackend<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self, flags: OpenFlags) -> Result<()> {
        if !flags.read_only && !self.writable {
            return Err(BlockError::unsupported(format!("{}: read-write open of a read-only stream", self.name)));
        }
        self.inner.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.writable {
            self.inner.flush()?;
        }
        Ok(())
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        if let SeekFrom::Start(p) = pos {
            if p > self.geometry.size_bytes() {
                return Err(BlockError::OutOfRange(format!(
                    "{}: seek to {} beyond {} bytes",
                    self.name,
                    p,
                    self.geometry.size_bytes()
                )));
            }
        }
        Ok(self.inner.seek(pos)?)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.remaining(buf.len())?;
        Ok(read_full(&mut self.inner, &mut buf[..n])?)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let n = self.remaining(buf.len())?;
        Ok(write_full(&mut self.inner, &buf[..n])?)
    }

    fn sync(&mut self) -> Result<()> {
        if self.writable {
            self.inner.flush()?;
        }
        Ok(())
    }

    fn stat(&self) -> Result<DeviceStat> {
        Ok(DeviceStat::from_geometry(self.geometry, !self.writable, MediumKind::Stream))
    }

    fn control(&mut self, code: u64, _arg: u64) -> Result<u64> {
        match code {
            control::GET_SECTOR_SIZE => Ok(u64::from(self.geometry.sector_size)),
            control::GET_SECTOR_COUNT => Ok(self.geometry.sector_count),
            control::FLUSH => self.sync().map(|_| 0),
            other => Err(BlockError::unsupported(format!("{}: control code {:#x}", self.name, other))),
        }
    }
}

/// Adds a refusing `Write` impl to a read-only stream
pub struct ReadOnlyStream<T>(T);

impl<T> ReadOnlyStream<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T: Read> Read for ReadOnlyStream<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl<T: Seek> Seek for ReadOnlyStream<T> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.0.seek(pos)
    }
}

impl<T> Write for ReadOnlyStream<T> {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(ErrorKind::Unsupported, "read-only stream"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
