// Sector I/O primitive
// Exact-length positioned transfers on top of a device handle. A backend returning
// fewer bytes than requested is reported as ShortTransfer, never as success.

use crate::device::DeviceHandle;
use crate::error::{BlockError, Result};
use crate::geometry::{SectorGeometry, Transfer};
use std::io::{self, Read, Write};
use tracing::trace;

/// Keep reading until `buf` is full or the stream ends; returns the bytes read.
/// Backends built on `std::io` streams use this for their `read` operation.
pub fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match reader.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

/// Write counterpart of [`read_full`]; stops early only when the sink accepts nothing
pub fn write_full<W: Write + ?Sized>(writer: &mut W, buf: &[u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match writer.write(&buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

pub fn read_exact_at(handle: &mut DeviceHandle, buf: &mut [u8], offset: u64) -> Result<()> {
    if buf.is_empty() {
        return Ok(());
    }
    let expected = buf.len();
    let actual = handle.pread(buf, offset)?;
    if actual != expected {
        return Err(BlockError::ShortTransfer { expected, actual });
    }
    Ok(())
}

pub fn write_exact_at(handle: &mut DeviceHandle, buf: &[u8], offset: u64) -> Result<()> {
    if buf.is_empty() {
        return Ok(());
    }
    let expected = buf.len();
    let actual = handle.pwrite(buf, offset)?;
    if actual != expected {
        return Err(BlockError::ShortTransfer { expected, actual });
    }
    Ok(())
}

/// Validate `transfer` against `geometry` and the buffer, then read it
pub fn read_sectors(
    handle: &mut DeviceHandle,
    geometry: &SectorGeometry,
    transfer: Transfer,
    buf: &mut [u8],
) -> Result<()> {
    if transfer.is_empty() {
        return Ok(());
    }
    transfer.check_buffer(geometry, buf.len())?;
    let offset = geometry.check(&transfer)?;
    trace!("read sectors {}+{} at {:#x}", transfer.start, transfer.count, offset);
    read_exact_at(handle, buf, offset)
}

/// Validate `transfer` against `geometry` and the buffer, then write it
pub fn write_sectors(
    handle: &mut DeviceHandle,
    geometry: &SectorGeometry,
    transfer: Transfer,
    buf: &[u8],
) -> Result<()> {
    if transfer.is_empty() {
        return Ok(());
    }
    transfer.check_buffer(geometry, buf.len())?;
    let offset = geometry.check(&transfer)?;
    trace!("write sectors {}+{} at {:#x}", transfer.start, transfer.count, offset);
    write_exact_at(handle, buf, offset)
}
