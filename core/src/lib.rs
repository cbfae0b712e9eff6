pub mod backend;
pub mod config;
pub mod device;
pub mod disk;
pub mod error;
pub mod geometry;
pub mod sector_io;

pub use backend::{Access, MemoryBackend, MemoryMedium, StreamBackend};
pub use config::DeviceConfig;
pub use device::{control, DeviceHandle, DeviceOps, DeviceStat, MediumKind, OpenFlags};
pub use disk::{DiskCommand, DiskIo, DiskStatus, Drive, DriveId, DriveState};
pub use error::{BlockError, ErrorKind, Result};
pub use geometry::{SectorGeometry, Transfer, DEFAULT_SECTOR_SIZE};
