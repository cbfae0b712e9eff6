// In-memory backend
// A RAM disk with shared storage, so several backends can contend for the same
// medium, and with eject/insert to simulate media removal.

use crate::device::{control, DeviceOps, DeviceStat, MediumKind, OpenFlags};
use crate::error::{BlockError, Result};
use crate::geometry::SectorGeometry;
use std::io::SeekFrom;
use std::sync::{Arc, Mutex, MutexGuard};

/// Which halves of the transfer set a backend exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadWrite,
    ReadOnly,
    WriteOnly,
}

#[derive(Debug)]
struct MediumState {
    data: Vec<u8>,
    geometry: SectorGeometry,
    present: bool,
    exclusive_held: bool,
    shared_holders: usize,
}

/// Storage shared between every `MemoryBackend` created from it
#[derive(Debug, Clone)]
pub struct MemoryMedium {
    state: Arc<Mutex<MediumState>>,
}

impl MemoryMedium {
    /// Zero-filled medium of `sector_count` sectors
    pub fn new(sector_size: u32, sector_count: u64) -> Result<Self> {
        let geometry = SectorGeometry::new(sector_size, sector_count)?;
        let len = usize::try_from(geometry.size_bytes())
            .map_err(|_| BlockError::OutOfRange(format!("{} bytes do not fit in memory", geometry.size_bytes())))?;
        Ok(Self::from_parts(vec![0u8; len], geometry))
    }

    /// Wrap existing bytes; the length must be a whole number of sectors
    pub fn from_bytes(data: Vec<u8>, sector_size: u32) -> Result<Self> {
        let geometry = SectorGeometry::from_size(sector_size, data.len() as u64)?;
        if geometry.size_bytes() != data.len() as u64 {
            return Err(BlockError::InvalidBuffer {
                expected: geometry.size_bytes() as usize,
                actual: data.len(),
            });
        }
        Ok(Self::from_parts(data, geometry))
    }

    fn from_parts(data: Vec<u8>, geometry: SectorGeometry) -> Self {
        Self {
            state: Arc::new(Mutex::new(MediumState {
                data,
                geometry,
                present: true,
                exclusive_held: false,
                shared_holders: 0,
            })),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, MediumState>> {
        self.state.lock().map_err(|_| BlockError::io("memory medium lock poisoned"))
    }

    pub fn geometry(&self) -> SectorGeometry {
        match self.state.lock() {
            Ok(state) => state.geometry,
            Err(poisoned) => poisoned.into_inner().geometry,
        }
    }

    /// Simulate the medium being pulled out; open backends start failing
    pub fn eject(&self) -> Result<()> {
        self.lock()?.present = false;
        Ok(())
    }

    pub fn insert(&self) -> Result<()> {
        self.lock()?.present = true;
        Ok(())
    }

    /// Copy of the current contents
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        Ok(self.lock()?.data.clone())
    }
}

pub struct MemoryBackend {
    medium: MemoryMedium,
    access: Access,
    name: String,
    position: u64,
    held: Option<OpenFlags>,
}

impl MemoryBackend {
    pub fn new(medium: MemoryMedium) -> Self {
        Self::with_access(medium, Access::ReadWrite)
    }

    pub fn with_access(medium: MemoryMedium, access: Access) -> Self {
        let geometry = medium.geometry();
        Self {
            medium,
            access,
            name: format!("mem:{}x{}", geometry.sector_count, geometry.sector_size),
            position: 0,
            held: None,
        }
    }

    pub fn medium(&self) -> &MemoryMedium {
        &self.medium
    }

    fn present_state(&self) -> Result<MutexGuard<'_, MediumState>> {
        let state = self.medium.lock()?;
        if !state.present {
            return Err(BlockError::io(format!("{}: medium removed", self.name)));
        }
        Ok(state)
    }
}

impl DeviceOps for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self, flags: OpenFlags) -> Result<()> {
        let mut state = self.medium.lock()?;
        if !state.present {
            return Err(BlockError::NotFound(format!("{}: no medium present", self.name)));
        }
        if state.exclusive_held || (flags.exclusive && state.shared_holders > 0) {
            return Err(BlockError::AlreadyLocked(format!("{}: held by another owner", self.name)));
        }
        if flags.exclusive {
            state.exclusive_held = true;
        } else {
            state.shared_holders += 1;
        }
        self.held = Some(flags);
        self.position = 0;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let Some(flags) = self.held.take() else {
            return Ok(());
        };
        let mut state = self.medium.lock()?;
        if flags.exclusive {
            state.exclusive_held = false;
        } else {
            state.shared_holders = state.shared_holders.saturating_sub(1);
        }
        Ok(())
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let size = self.present_state()?.data.len() as u64;
        let target = match pos {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
            SeekFrom::End(delta) => size.checked_add_signed(delta),
        };
        match target {
            Some(t) if t <= size => {
                self.position = t;
                Ok(t)
            }
            _ => Err(BlockError::OutOfRange(format!("{}: seek {:?} outside {} bytes", self.name, pos, size))),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.access == Access::WriteOnly {
            return Err(BlockError::unsupported(format!("{}: read", self.name)));
        }
        let state = self.present_state()?;
        let start = usize::try_from(self.position).unwrap_or(usize::MAX).min(state.data.len());
        let n = buf.len().min(state.data.len() - start);
        buf[..n].copy_from_slice(&state.data[start..start + n]);
        drop(state);
        self.position += n as u64;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.access == Access::ReadOnly {
            return Err(BlockError::unsupported(format!("{}: write", self.name)));
        }
        let mut state = self.present_state()?;
        let start = usize::try_from(self.position).unwrap_or(usize::MAX).min(state.data.len());
        let n = buf.len().min(state.data.len() - start);
        state.data[start..start + n].copy_from_slice(&buf[..n]);
        drop(state);
        self.position += n as u64;
        Ok(n)
    }

    fn sync(&mut self) -> Result<()> {
        // nothing is buffered
        self.present_state().map(|_| ())
    }

    fn stat(&self) -> Result<DeviceStat> {
        let state = self.medium.lock()?;
        if !state.present {
            return Err(BlockError::NotFound(format!("{}: no medium present", self.name)));
        }
        Ok(DeviceStat::from_geometry(
            state.geometry,
            self.access == Access::ReadOnly,
            MediumKind::Memory,
        ))
    }

    fn control(&mut self, code: u64, _arg: u64) -> Result<u64> {
        let state = self.present_state()?;
        match code {
            control::GET_SECTOR_SIZE => Ok(u64::from(state.geometry.sector_size)),
            control::GET_SECTOR_COUNT => Ok(state.geometry.sector_count),
            control::FLUSH => Ok(0),
            other => Err(BlockError::unsupported(format!("{}: control code {:#x}", self.name, other))),
        }
    }
}
