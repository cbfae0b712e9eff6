// FAT driver glue
// FatFs calls disk_status/disk_initialize/disk_read/disk_write/disk_ioctl with a
// physical drive number and expects DSTATUS bytes and DRESULT codes back. This
// module speaks that protocol on top of the disk facade.

use blockbridge_core::{BlockError, DiskIo, DiskStatus, DriveId, ErrorKind};
use log::{debug, warn};

/// FatFs `DRESULT`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DResult {
    Ok = 0,
    Error = 1,
    WriteProtected = 2,
    NotReady = 3,
    ParameterError = 4,
}

impl From<DResult> for u8 {
    fn from(result: DResult) -> Self {
        result as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Request {
    Read,
    Write,
    Control,
}

impl DResult {
    fn from_error(err: &BlockError, request: Request) -> Self {
        match (err.kind(), request) {
            (ErrorKind::NotFound, _) => DResult::NotReady,
            (ErrorKind::OutOfRange, _) | (ErrorKind::InvalidBuffer, _) => DResult::ParameterError,
            (ErrorKind::Unsupported, Request::Write) => DResult::WriteProtected,
            (ErrorKind::Unsupported, Request::Control) => DResult::ParameterError,
            _ => DResult::Error,
        }
    }
}

/// `DSTATUS` byte for a facade status
pub fn dstatus(status: DiskStatus) -> u8 {
    status.bits()
}

/// Callback surface FatFs expects, one method per `disk_*` entry point
pub struct FatDisks {
    disks: DiskIo,
}

impl FatDisks {
    pub fn new(disks: DiskIo) -> Self {
        Self { disks }
    }

    pub fn disks(&self) -> &DiskIo {
        &self.disks
    }

    pub fn disks_mut(&mut self) -> &mut DiskIo {
        &mut self.disks
    }

    pub fn into_inner(self) -> DiskIo {
        self.disks
    }

    pub fn disk_status(&self, pdrv: DriveId) -> u8 {
        dstatus(self.disks.status(pdrv))
    }

    pub fn disk_initialize(&mut self, pdrv: DriveId) -> u8 {
        let status = self.disks.initialize(pdrv);
        debug!("disk_initialize({}) -> {:#04x}", pdrv, status.bits());
        dstatus(status)
    }

    pub fn disk_read(&mut self, pdrv: DriveId, buf: &mut [u8], sector: u64, count: u32) -> DResult {
        let ready = self.disks.status(pdrv).is_ready();
        let result = self.disks.read_sectors(pdrv, buf, sector, count);
        self.settle(pdrv, ready, result, Request::Read)
    }

    pub fn disk_write(&mut self, pdrv: DriveId, buf: &[u8], sector: u64, count: u32) -> DResult {
        let status = self.disks.status(pdrv);
        if count > 0 && status.is_ready() && status.contains(DiskStatus::WRITE_PROTECTED) {
            return DResult::WriteProtected;
        }
        let result = self.disks.write_sectors(pdrv, buf, sector, count);
        self.settle(pdrv, status.is_ready(), result, Request::Write)
    }

    /// `out` receives the command's value (sector count, sector size or block size)
    pub fn disk_ioctl(&mut self, pdrv: DriveId, cmd: u8, out: &mut u64) -> DResult {
        let ready = self.disks.status(pdrv).is_ready();
        let result = self.disks.control(pdrv, cmd).map(|value| *out = value);
        self.settle(pdrv, ready, result, Request::Control)
    }

    fn settle(&self, pdrv: DriveId, was_ready: bool, result: blockbridge_core::Result<()>, request: Request) -> DResult {
        match result {
            Ok(()) => DResult::Ok,
            Err(e) => {
                let code = if !was_ready && e.kind() != ErrorKind::Unsupported {
                    DResult::NotReady
                } else {
                    DResult::from_error(&e, request)
                };
                warn!("drive {}: {:?} failed: {} ({:?})", pdrv, request, e, code);
                code
            }
        }
    }
}
