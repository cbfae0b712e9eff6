// Sector geometry and transfer validation
// Every sector-addressed request is checked here before it reaches a backend.

use crate::error::{BlockError, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_SECTOR_SIZE: u32 = 512;
pub const MIN_SECTOR_SIZE: u32 = 512;
pub const MAX_SECTOR_SIZE: u32 = 4096;

/// Sector size and extent reported by a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectorGeometry {
    pub sector_size: u32,
    pub sector_count: u64,
}

impl SectorGeometry {
    pub fn new(sector_size: u32, sector_count: u64) -> Result<Self> {
        validate_sector_size(sector_size)?;
        // size_bytes, offset_of and check multiply unchecked past this point
        if sector_count.checked_mul(u64::from(sector_size)).is_none() {
            return Err(BlockError::OutOfRange(format!(
                "{} sectors of {} bytes overflow a byte offset",
                sector_count, sector_size
            )));
        }
        Ok(Self { sector_size, sector_count })
    }

    /// Geometry covering `size_bytes`; a trailing partial sector is not addressable.
    pub fn from_size(sector_size: u32, size_bytes: u64) -> Result<Self> {
        validate_sector_size(sector_size)?;
        Ok(Self {
            sector_size,
            sector_count: size_bytes / u64::from(sector_size),
        })
    }

    pub fn size_bytes(&self) -> u64 {
        self.sector_count * u64::from(self.sector_size)
    }

    /// Byte offset of `sector`, which must lie inside the extent
    pub fn offset_of(&self, sector: u64) -> Result<u64> {
        if sector >= self.sector_count {
            return Err(BlockError::OutOfRange(format!(
                "sector {} beyond extent of {} sectors",
                sector, self.sector_count
            )));
        }
        Ok(sector * u64::from(self.sector_size))
    }

    /// Validate a transfer and return its starting byte offset.
    ///
    /// The whole range `start..start + count` must lie inside the extent; requests
    /// that would straddle the end are rejected, never clamped.
    pub fn check(&self, transfer: &Transfer) -> Result<u64> {
        let end = transfer.start.checked_add(u64::from(transfer.count)).ok_or_else(|| {
            BlockError::OutOfRange(format!(
                "sector range {}+{} overflows",
                transfer.start, transfer.count
            ))
        })?;
        if end > self.sector_count {
            return Err(BlockError::OutOfRange(format!(
                "sectors {}..{} exceed extent of {} sectors",
                transfer.start, end, self.sector_count
            )));
        }
        Ok(transfer.start * u64::from(self.sector_size))
    }

    /// Number of bytes a transfer of `count` sectors moves
    pub fn transfer_len(&self, count: u32) -> Result<usize> {
        u64::from(count)
            .checked_mul(u64::from(self.sector_size))
            .and_then(|len| usize::try_from(len).ok())
            .ok_or_else(|| BlockError::OutOfRange(format!("{} sectors do not fit in memory", count)))
    }
}

fn validate_sector_size(sector_size: u32) -> Result<()> {
    if !sector_size.is_power_of_two() || !(MIN_SECTOR_SIZE..=MAX_SECTOR_SIZE).contains(&sector_size) {
        return Err(BlockError::Configuration(format!(
            "sector size {} is not a power of two in {}..={}",
            sector_size, MIN_SECTOR_SIZE, MAX_SECTOR_SIZE
        )));
    }
    Ok(())
}

/// (address, sector count) half of a transfer descriptor; the buffer travels alongside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    pub start: u64,
    pub count: u32,
}

impl Transfer {
    pub fn new(start: u64, count: u32) -> Self {
        Self { start, count }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Check that `buffer_len` matches exactly `count × sector_size`
    pub fn check_buffer(&self, geometry: &SectorGeometry, buffer_len: usize) -> Result<()> {
        let expected = geometry.transfer_len(self.count)?;
        if buffer_len != expected {
            return Err(BlockError::InvalidBuffer { expected, actual: buffer_len });
        }
        Ok(())
    }
}
