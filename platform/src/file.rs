// File and block-device backend
// Opens a path, takes an advisory flock on it, and serves positioned I/O.
// Block devices report their own geometry through BLKSSZGET/BLKGETSIZE64.

use blockbridge_core::{
    control, BlockError, DeviceConfig, DeviceOps, DeviceStat, MediumKind, OpenFlags, Result, SectorGeometry,
    DEFAULT_SECTOR_SIZE,
};
use blockbridge_core::sector_io::{read_full, write_full};
use log::{debug, trace};
use nix::fcntl::{flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom};
use std::os::unix::fs::{FileExt, FileTypeExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

#[cfg(target_os = "linux")]
mod blk {
    use std::os::raw::c_int;

    nix::ioctl_read_bad!(blksszget, nix::request_code_none!(0x12, 104), c_int);
    // declared with size_t in linux/fs.h, but the kernel always stores a u64
    nix::ioctl_read_bad!(
        blkgetsize64,
        nix::request_code_read!(0x12, 114, std::mem::size_of::<usize>()),
        u64
    );
}

pub struct FileBackend {
    path: PathBuf,
    name: String,
    sector_size_override: Option<u32>,
    file: Option<File>,
    read_only: bool,
    block_device: bool,
}

impl FileBackend {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        Self {
            name: path.display().to_string(),
            path,
            sector_size_override: None,
            file: None,
            read_only: false,
            block_device: false,
        }
    }

    pub fn from_config(config: &DeviceConfig) -> Self {
        let mut backend = Self::new(&config.path);
        backend.sector_size_override = config.sector_size;
        backend
    }

    /// Sector size to report for images (block devices report their own unless overridden)
    pub fn with_sector_size(mut self, sector_size: u32) -> Self {
        self.sector_size_override = Some(sector_size);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file(&self) -> Result<&File> {
        self.file
            .as_ref()
            .ok_or_else(|| BlockError::io(format!("{}: not open", self.name)))
    }

    fn file_mut(&mut self) -> Result<&mut File> {
        let name = &self.name;
        self.file
            .as_mut()
            .ok_or_else(|| BlockError::io(format!("{}: not open", name)))
    }

    #[cfg(target_os = "linux")]
    fn block_device_geometry(&self, file: &File) -> Result<(u32, u64)> {
        let fd = file.as_raw_fd();
        let mut sector_size: std::os::raw::c_int = 0;
        let mut size_bytes: u64 = 0;
        // SAFETY: fd is an open block device owned by `file`; both out-pointers
        // refer to live locals of the type each request writes.
        unsafe {
            blk::blksszget(fd, &mut sector_size).map_err(io::Error::from)?;
            blk::blkgetsize64(fd, &mut size_bytes).map_err(io::Error::from)?;
        }
        let sector_size = u32::try_from(sector_size)
            .map_err(|_| BlockError::io(format!("{}: bogus sector size {}", self.name, sector_size)))?;
        Ok((sector_size, size_bytes))
    }

    #[cfg(not(target_os = "linux"))]
    fn block_device_geometry(&self, file: &File) -> Result<(u32, u64)> {
        let size_bytes = file.metadata()?.len();
        Ok((DEFAULT_SECTOR_SIZE, size_bytes))
    }
}

impl DeviceOps for FileBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self, flags: OpenFlags) -> Result<()> {
        if self.file.is_some() {
            return Ok(());
        }
        let file = OpenOptions::new()
            .read(true)
            .write(!flags.read_only)
            .open(&self.path)?;

        let lock = if flags.exclusive {
            FlockArg::LockExclusiveNonblock
        } else {
            FlockArg::LockSharedNonblock
        };
        flock(file.as_raw_fd(), lock).map_err(|errno| match BlockError::from(io::Error::from(errno)) {
            BlockError::AlreadyLocked(_) => BlockError::AlreadyLocked(format!("{}: locked by another process", self.name)),
            other => other,
        })?;

        self.block_device = file.metadata()?.file_type().is_block_device();
        self.read_only = flags.read_only;
        debug!(
            "opened {} ({}, {})",
            self.name,
            if self.block_device { "block device" } else { "file" },
            if flags.exclusive { "exclusive" } else { "shared" }
        );
        self.file = Some(file);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        if !self.read_only {
            file.sync_all()?;
        }
        flock(file.as_raw_fd(), FlockArg::Unlock).map_err(io::Error::from)?;
        debug!("closed {}", self.name);
        Ok(())
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let name = self.name.clone();
        self.file_mut()?.seek(pos).map_err(|e| {
            if e.kind() == io::ErrorKind::InvalidInput {
                BlockError::OutOfRange(format!("{}: seek {:?} rejected: {}", name, pos, e))
            } else {
                BlockError::from(e)
            }
        })
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = read_full(self.file_mut()?, buf)?;
        trace!("{}: read {} of {} bytes", self.name, n, buf.len());
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let n = write_full(self.file_mut()?, buf)?;
        trace!("{}: wrote {} of {} bytes", self.name, n, buf.len());
        Ok(n)
    }

    // pread(2)/pwrite(2): one syscall per chunk and the file cursor is left alone
    fn pread(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let file = self.file()?;
        let mut total = 0;
        while total < buf.len() {
            match file.read_at(&mut buf[total..], offset + total as u64) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        trace!("{}: pread {} of {} bytes at {:#x}", self.name, total, buf.len(), offset);
        Ok(total)
    }

    fn pwrite(&mut self, buf: &[u8], offset: u64) -> Result<usize> {
        let file = self.file()?;
        let mut total = 0;
        while total < buf.len() {
            match file.write_at(&buf[total..], offset + total as u64) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        trace!("{}: pwrite {} of {} bytes at {:#x}", self.name, total, buf.len(), offset);
        Ok(total)
    }

    fn sync(&mut self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        Ok(self.file()?.sync_all()?)
    }

    fn stat(&self) -> Result<DeviceStat> {
        let file = self.file()?;
        let metadata = file.metadata()?;
        let (reported_sector_size, size_bytes, medium) = if self.block_device {
            let (sector_size, size) = self.block_device_geometry(file)?;
            (sector_size, size, MediumKind::BlockDevice)
        } else {
            (DEFAULT_SECTOR_SIZE, metadata.len(), MediumKind::File)
        };
        let sector_size = self.sector_size_override.unwrap_or(reported_sector_size);
        let geometry = SectorGeometry::from_size(sector_size, size_bytes)?;
        Ok(DeviceStat {
            size_bytes,
            sector_size: geometry.sector_size,
            sector_count: geometry.sector_count,
            read_only: self.read_only || metadata.permissions().readonly(),
            medium,
        })
    }

    fn control(&mut self, code: u64, _arg: u64) -> Result<u64> {
        match code {
            control::GET_SECTOR_SIZE => Ok(u64::from(self.stat()?.sector_size)),
            control::GET_SECTOR_COUNT => Ok(self.stat()?.sector_count),
            control::FLUSH => self.sync().map(|_| 0),
            other => Err(BlockError::unsupported(format!("{}: control code {:#x}", self.name, other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockbridge_core::{DeviceHandle, ErrorKind};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn image(sectors: u64) -> NamedTempFile {
        let file = NamedTempFile::new().unwrap();
        file.as_file().set_len(sectors * 512).unwrap();
        file
    }

    #[test]
    fn missing_path_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = FileBackend::new(dir.path().join("absent.img"));
        assert_eq!(backend.open(OpenFlags::READ_ONLY).unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn image_geometry_uses_override() {
        let img = image(16);
        let mut handle =
            DeviceHandle::open_with(FileBackend::new(img.path()).with_sector_size(4096), OpenFlags::READ_ONLY)
                .unwrap();
        let stat = handle.stat().unwrap();
        assert_eq!(stat.medium, MediumKind::File);
        assert_eq!(stat.sector_size, 4096);
        assert_eq!(stat.sector_count, 2);
        assert_eq!(handle.control(control::GET_SECTOR_COUNT, 0).unwrap(), 2);
    }

    #[test]
    fn second_exclusive_open_is_already_locked() {
        let img = image(4);
        let _first = DeviceHandle::open_with(FileBackend::new(img.path()), OpenFlags::READ_WRITE).unwrap();
        let err = DeviceHandle::open_with(FileBackend::new(img.path()), OpenFlags::READ_WRITE).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyLocked);
    }

    #[test]
    fn shared_opens_coexist() {
        let img = image(4);
        let _a = DeviceHandle::open_with(FileBackend::new(img.path()), OpenFlags::READ_ONLY).unwrap();
        assert!(DeviceHandle::open_with(FileBackend::new(img.path()), OpenFlags::READ_ONLY).is_ok());
    }

    #[test]
    fn positioned_io_hits_the_file() {
        let mut img = image(4);
        img.as_file_mut().write_all(&[0x11; 512]).unwrap();
        img.as_file_mut().flush().unwrap();

        let mut handle = DeviceHandle::open_with(FileBackend::new(img.path()), OpenFlags::READ_WRITE).unwrap();
        handle.pwrite(&[0x22; 512], 1024).unwrap();
        handle.sync().unwrap();

        let mut buf = [0u8; 512];
        handle.pread(&mut buf, 0).unwrap();
        assert!(buf.iter().all(|&b| b == 0x11));
        handle.pread(&mut buf, 1024).unwrap();
        assert!(buf.iter().all(|&b| b == 0x22));
        handle.close().unwrap();
        handle.close().unwrap();

        let on_disk = std::fs::read(img.path()).unwrap();
        assert!(on_disk[1024..1536].iter().all(|&b| b == 0x22));
    }

    #[test]
    fn positioned_io_leaves_the_cursor_alone() {
        let img = image(4);
        let mut handle = DeviceHandle::open_with(FileBackend::new(img.path()), OpenFlags::READ_WRITE).unwrap();
        assert_eq!(handle.seek(SeekFrom::Start(512)).unwrap(), 512);

        assert_eq!(handle.pwrite(b"boot", 0).unwrap(), 4);
        let mut buf = [0u8; 4];
        assert_eq!(handle.pread(&mut buf, 0).unwrap(), 4);
        assert_eq!(&buf, b"boot");
        assert_eq!(handle.seek(SeekFrom::Current(0)).unwrap(), 512);

        // reads stop at end of file
        let mut tail = [0u8; 64];
        assert_eq!(handle.pread(&mut tail, 4 * 512 - 16).unwrap(), 16);
    }

    #[test]
    fn negative_seek_is_out_of_range() {
        let img = image(4);
        let mut handle = DeviceHandle::open_with(FileBackend::new(img.path()), OpenFlags::READ_ONLY).unwrap();
        assert_eq!(handle.seek(SeekFrom::Current(-1)).unwrap_err().kind(), ErrorKind::OutOfRange);
    }
}
