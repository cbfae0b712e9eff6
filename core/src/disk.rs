// Disk-I/O facade
// The narrow status/initialize/read/write/control surface that sector-oriented
// drivers (FatFs-style) expect, layered over a device handle.

use crate::device::{DeviceHandle, OpenFlags};
use crate::error::{BlockError, ErrorKind, Result};
use crate::geometry::{SectorGeometry, Transfer};
use crate::sector_io;
use bitflags::bitflags;
use std::collections::BTreeMap;
use tracing::{debug, warn};

bitflags! {
    /// Drive status bits; an empty set means the drive is ready
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DiskStatus: u8 {
        const NOT_INITIALIZED = 0x01;
        const NO_DISK = 0x02;
        const WRITE_PROTECTED = 0x04;
    }
}

impl DiskStatus {
    pub const OK: DiskStatus = DiskStatus::empty();

    /// Ready for I/O (write protection does not count against readiness)
    pub fn is_ready(&self) -> bool {
        !self.intersects(DiskStatus::NOT_INITIALIZED | DiskStatus::NO_DISK)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveState {
    NotInitialized,
    Ready,
    /// Entered on medium removal or an I/O failure; only `initialize` leaves it
    Faulted,
}

/// Driver-level control requests, numbered as FatFs numbers its ioctl commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskCommand {
    Sync,
    GetSectorCount,
    GetSectorSize,
    GetBlockSize,
}

impl TryFrom<u8> for DiskCommand {
    type Error = BlockError;

    fn try_from(code: u8) -> Result<Self> {
        match code {
            0 => Ok(DiskCommand::Sync),
            1 => Ok(DiskCommand::GetSectorCount),
            2 => Ok(DiskCommand::GetSectorSize),
            3 => Ok(DiskCommand::GetBlockSize),
            other => Err(BlockError::unsupported(format!("disk control command {}", other))),
        }
    }
}

impl From<DiskCommand> for u8 {
    fn from(command: DiskCommand) -> u8 {
        match command {
            DiskCommand::Sync => 0,
            DiskCommand::GetSectorCount => 1,
            DiskCommand::GetSectorSize => 2,
            DiskCommand::GetBlockSize => 3,
        }
    }
}

/// One physical drive behind the facade
pub struct Drive {
    handle: DeviceHandle,
    flags: OpenFlags,
    state: DriveState,
    geometry: Option<SectorGeometry>,
    no_disk: bool,
    write_protected: bool,
    last_error: Option<ErrorKind>,
}

impl Drive {
    /// The handle is opened with `flags` on the first `initialize` if it is not open yet
    pub fn new(handle: DeviceHandle, flags: OpenFlags) -> Self {
        Self {
            handle,
            flags,
            state: DriveState::NotInitialized,
            geometry: None,
            no_disk: false,
            write_protected: flags.read_only,
            last_error: None,
        }
    }

    pub fn state(&self) -> DriveState {
        self.state
    }

    /// Geometry captured by the last successful `initialize`
    pub fn geometry(&self) -> Option<SectorGeometry> {
        self.geometry
    }

    /// Kind of the most recent failure seen by `initialize` or a transfer
    pub fn last_error(&self) -> Option<ErrorKind> {
        self.last_error
    }

    pub fn handle(&self) -> &DeviceHandle {
        &self.handle
    }

    pub fn into_handle(self) -> DeviceHandle {
        self.handle
    }

    /// Pure read of cached state
    pub fn status(&self) -> DiskStatus {
        let mut status = DiskStatus::OK;
        if self.state != DriveState::Ready {
            status |= DiskStatus::NOT_INITIALIZED;
        }
        if self.no_disk {
            status |= DiskStatus::NO_DISK;
        }
        if self.write_protected {
            status |= DiskStatus::WRITE_PROTECTED;
        }
        status
    }

    /// Bring the medium online; calling it on a ready drive changes nothing
    pub fn initialize(&mut self) -> DiskStatus {
        if self.state == DriveState::Ready {
            return self.status();
        }

        if let Err(e) = self.handle.open(self.flags) {
            self.record_init_failure(e);
            return self.status();
        }

        let geometry = match self.handle.geometry() {
            Ok(geometry) => geometry,
            Err(e) => {
                self.record_init_failure(e);
                return self.status();
            }
        };
        let medium_read_only = self.handle.stat().map(|stat| stat.read_only).unwrap_or(false);

        self.geometry = Some(geometry);
        self.no_disk = false;
        self.write_protected = self.flags.read_only || medium_read_only;
        self.state = DriveState::Ready;
        self.last_error = None;
        debug!(
            "{}: ready, {} sectors of {} bytes{}",
            self.handle.name(),
            geometry.sector_count,
            geometry.sector_size,
            if self.write_protected { " (write protected)" } else { "" }
        );
        self.status()
    }

    fn record_init_failure(&mut self, e: BlockError) {
        self.no_disk = e.kind() == ErrorKind::NotFound;
        self.last_error = Some(e.kind());
        if self.no_disk {
            debug!("{}: no medium: {}", self.handle.name(), e);
        } else {
            warn!("{}: initialize failed: {}", self.handle.name(), e);
        }
    }

    fn ready_geometry(&self) -> Result<SectorGeometry> {
        match (self.state, self.geometry) {
            (DriveState::Ready, Some(geometry)) => Ok(geometry),
            (state, _) => Err(BlockError::io(format!("{}: drive not ready ({:?})", self.handle.name(), state))),
        }
    }

    fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.last_error = Some(e.kind());
            if e.kind() == ErrorKind::IoFailure {
                warn!("{}: faulted: {}", self.handle.name(), e);
                self.state = DriveState::Faulted;
            }
        }
        result
    }

    /// `buf` must be exactly `count` sectors long; `count == 0` succeeds without I/O
    pub fn read_sectors(&mut self, buf: &mut [u8], start: u64, count: u32) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let geometry = self.ready_geometry()?;
        let result = sector_io::read_sectors(&mut self.handle, &geometry, Transfer::new(start, count), buf);
        self.settle(result)
    }

    pub fn write_sectors(&mut self, buf: &[u8], start: u64, count: u32) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let geometry = self.ready_geometry()?;
        if self.write_protected {
            return Err(BlockError::unsupported(format!("{}: write protected", self.handle.name())));
        }
        let result = sector_io::write_sectors(&mut self.handle, &geometry, Transfer::new(start, count), buf);
        self.settle(result)
    }

    pub fn control(&mut self, command: DiskCommand) -> Result<u64> {
        let geometry = self.ready_geometry()?;
        match command {
            DiskCommand::Sync => {
                let result = self.handle.sync().map(|_| 0);
                self.settle(result)
            }
            DiskCommand::GetSectorCount => Ok(geometry.sector_count),
            DiskCommand::GetSectorSize => Ok(u64::from(geometry.sector_size)),
            // erase block size unknown
            DiskCommand::GetBlockSize => Ok(1),
        }
    }
}

pub type DriveId = u8;

/// Drives addressed by number, as FatFs addresses physical drives
#[derive(Default)]
pub struct DiskIo {
    drives: BTreeMap<DriveId, Drive>,
}

impl DiskIo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a drive under `id`; an occupied slot is never silently replaced
    pub fn attach(&mut self, id: DriveId, drive: Drive) -> Result<()> {
        if self.drives.contains_key(&id) {
            return Err(BlockError::AlreadyLocked(format!("drive {} already attached", id)));
        }
        debug!("attaching {} as drive {}", drive.handle.name(), id);
        self.drives.insert(id, drive);
        Ok(())
    }

    pub fn detach(&mut self, id: DriveId) -> Option<Drive> {
        self.drives.remove(&id)
    }

    pub fn drive(&self, id: DriveId) -> Option<&Drive> {
        self.drives.get(&id)
    }

    fn drive_mut(&mut self, id: DriveId) -> Result<&mut Drive> {
        self.drives
            .get_mut(&id)
            .ok_or_else(|| BlockError::NotFound(format!("no drive {}", id)))
    }

    pub fn status(&self, id: DriveId) -> DiskStatus {
        self.drives
            .get(&id)
            .map_or(DiskStatus::NOT_INITIALIZED | DiskStatus::NO_DISK, Drive::status)
    }

    pub fn initialize(&mut self, id: DriveId) -> DiskStatus {
        match self.drives.get_mut(&id) {
            Some(drive) => drive.initialize(),
            None => DiskStatus::NOT_INITIALIZED | DiskStatus::NO_DISK,
        }
    }

    pub fn read_sectors(&mut self, id: DriveId, buf: &mut [u8], start: u64, count: u32) -> Result<()> {
        self.drive_mut(id)?.read_sectors(buf, start, count)
    }

    pub fn write_sectors(&mut self, id: DriveId, buf: &[u8], start: u64, count: u32) -> Result<()> {
        self.drive_mut(id)?.write_sectors(buf, start, count)
    }

    /// Raw command code entry point; unknown codes are `Unsupported`
    pub fn control(&mut self, id: DriveId, command: u8) -> Result<u64> {
        let command = DiskCommand::try_from(command)?;
        self.drive_mut(id)?.control(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{Access, MemoryBackend, MemoryMedium};

    fn drive_over(medium: &MemoryMedium, access: Access, flags: OpenFlags) -> Drive {
        Drive::new(DeviceHandle::new(MemoryBackend::with_access(medium.clone(), access)), flags)
    }

    #[test]
    fn starts_not_initialized() {
        let medium = MemoryMedium::new(512, 16).unwrap();
        let drive = drive_over(&medium, Access::ReadWrite, OpenFlags::READ_WRITE);
        assert_eq!(drive.status(), DiskStatus::NOT_INITIALIZED);
        assert_eq!(drive.state(), DriveState::NotInitialized);
    }

    #[test]
    fn initialize_is_idempotent() {
        let medium = MemoryMedium::new(512, 16).unwrap();
        let mut drive = drive_over(&medium, Access::ReadWrite, OpenFlags::READ_WRITE);
        assert_eq!(drive.initialize(), DiskStatus::OK);
        assert_eq!(drive.initialize(), DiskStatus::OK);
        assert_eq!(drive.geometry().unwrap().sector_count, 16);
    }

    #[test]
    fn reading_before_initialize_is_io_failure() {
        let medium = MemoryMedium::new(512, 16).unwrap();
        let mut drive = drive_over(&medium, Access::ReadWrite, OpenFlags::READ_WRITE);
        let mut buf = vec![0u8; 512];
        assert_eq!(drive.read_sectors(&mut buf, 0, 1).unwrap_err().kind(), ErrorKind::IoFailure);
    }

    #[test]
    fn read_only_medium_reports_write_protected() {
        let medium = MemoryMedium::new(512, 16).unwrap();
        let mut drive = drive_over(&medium, Access::ReadOnly, OpenFlags::READ_ONLY);
        let status = drive.initialize();
        assert!(status.is_ready());
        assert!(status.contains(DiskStatus::WRITE_PROTECTED));
    }

    #[test]
    fn ejected_medium_faults_drive_until_reinitialized() {
        let medium = MemoryMedium::new(512, 16).unwrap();
        let mut drive = drive_over(&medium, Access::ReadWrite, OpenFlags::READ_WRITE);
        drive.initialize();

        medium.eject().unwrap();
        let mut buf = vec![0u8; 512];
        assert_eq!(drive.read_sectors(&mut buf, 0, 1).unwrap_err().kind(), ErrorKind::IoFailure);
        assert_eq!(drive.state(), DriveState::Faulted);
        assert!(drive.status().contains(DiskStatus::NOT_INITIALIZED));

        // still gone: initialize reports no disk
        let status = drive.initialize();
        assert!(status.contains(DiskStatus::NO_DISK));
        assert_eq!(drive.state(), DriveState::Faulted);

        medium.insert().unwrap();
        assert_eq!(drive.initialize(), DiskStatus::OK);
        assert!(drive.read_sectors(&mut buf, 0, 1).is_ok());
    }

    #[test]
    fn control_reports_geometry() {
        let medium = MemoryMedium::new(4096, 32).unwrap();
        let mut drive = drive_over(&medium, Access::ReadWrite, OpenFlags::READ_WRITE);
        drive.initialize();
        assert_eq!(drive.control(DiskCommand::GetSectorSize).unwrap(), 4096);
        assert_eq!(drive.control(DiskCommand::GetSectorCount).unwrap(), 32);
        assert_eq!(drive.control(DiskCommand::Sync).unwrap(), 0);
    }

    #[test]
    fn unknown_command_code_is_unsupported() {
        let medium = MemoryMedium::new(512, 16).unwrap();
        let mut disks = DiskIo::new();
        disks.attach(0, drive_over(&medium, Access::ReadWrite, OpenFlags::READ_WRITE)).unwrap();
        disks.initialize(0);
        assert_eq!(disks.control(0, 4).unwrap_err().kind(), ErrorKind::Unsupported);
        assert_eq!(disks.control(0, 2).unwrap(), 512);
    }

    #[test]
    fn unknown_drive_has_no_disk() {
        let mut disks = DiskIo::new();
        assert_eq!(disks.status(3), DiskStatus::NOT_INITIALIZED | DiskStatus::NO_DISK);
        let mut buf = vec![0u8; 512];
        assert_eq!(disks.read_sectors(3, &mut buf, 0, 1).unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn attach_does_not_replace_existing_drive() {
        let medium = MemoryMedium::new(512, 16).unwrap();
        let mut disks = DiskIo::new();
        disks.attach(0, drive_over(&medium, Access::ReadWrite, OpenFlags::READ_ONLY)).unwrap();
        let err = disks
            .attach(0, drive_over(&medium, Access::ReadWrite, OpenFlags::READ_ONLY))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyLocked);
    }
}
