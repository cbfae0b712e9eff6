// Integration tests for the driver glue over real image files
// An image is built on disk, bound through the stream backend, then probed and
// accessed the way FatFs and ntfs-3g would.

use blockbridge_core::{DeviceHandle, DiskIo, Drive, OpenFlags, SectorGeometry, StreamBackend};
use blockbridge_filesystems::*;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A 64-sector image whose boot sector carries the given OEM id or FAT label
fn image_with(boot: impl FnOnce(&mut [u8])) -> tempfile::NamedTempFile {
    let mut sector = vec![0u8; 512];
    boot(&mut sector);
    sector[510] = 0x55;
    sector[511] = 0xAA;

    let mut image = tempfile::NamedTempFile::new().unwrap();
    image.write_all(&sector).unwrap();
    image.as_file().set_len(64 * 512).unwrap();
    image
}

fn stream_handle(image: &tempfile::NamedTempFile) -> DeviceHandle {
    let file = OpenOptions::new().read(true).write(true).open(image.path()).unwrap();
    let geometry = SectorGeometry::new(512, 64).unwrap();
    DeviceHandle::new(StreamBackend::new(file, geometry))
}

#[test]
fn fat_glue_probes_and_writes_an_image() {
    init();
    let image = image_with(|bs| {
        bs[11..13].copy_from_slice(&512u16.to_le_bytes());
        bs[82..90].copy_from_slice(b"FAT32   ");
    });

    let mut disks = DiskIo::new();
    disks.attach(0, Drive::new(stream_handle(&image), OpenFlags::READ_WRITE)).unwrap();
    let mut fat = FatDisks::new(disks);
    assert_eq!(fat.disk_initialize(0), 0);

    let report = probe(fat.disks_mut(), 0).unwrap();
    assert_eq!(report.kind, FilesystemKind::Fat32);
    assert_eq!(report.bytes_per_sector, Some(512));

    // FSInfo-sized update in sector 1, then sync
    assert_eq!(fat.disk_write(0, &[0x52u8; 512], 1, 1), DResult::Ok);
    let mut out = 0;
    assert_eq!(fat.disk_ioctl(0, 0, &mut out), DResult::Ok);

    let mut on_disk = Vec::new();
    std::fs::File::open(image.path()).unwrap().read_to_end(&mut on_disk).unwrap();
    assert!(on_disk[512..1024].iter().all(|&b| b == 0x52));
    assert_eq!(&on_disk[82..87], b"FAT32");
}

#[test]
fn ntfs_stream_reads_the_boot_sector_and_patches_the_mft_area() {
    init();
    let image = image_with(|bs| bs[3..11].copy_from_slice(b"NTFS    "));

    let mut handle = stream_handle(&image);
    handle.open(OpenFlags::READ_WRITE).unwrap();
    let mut stream = DeviceStream::new(handle).unwrap();
    assert_eq!(stream.size(), 64 * 512);

    let mut boot = vec![0u8; 512];
    stream.read_exact(&mut boot).unwrap();
    assert_eq!(detect(&boot).kind, FilesystemKind::Ntfs);

    stream.seek(SeekFrom::Start(16 * 512)).unwrap();
    stream.write_all(b"FILE0").unwrap();
    stream.flush().unwrap();
    assert!(stream.seek(SeekFrom::Current(0)).is_err());

    let mut handle = stream.into_inner();
    let mut back = [0u8; 5];
    handle.pread(&mut back, 16 * 512).unwrap();
    assert_eq!(&back, b"FILE0");
}

#[test]
fn unformatted_image_probes_as_unknown() {
    let image = image_with(|_| {});
    let mut disks = DiskIo::new();
    disks.attach(2, Drive::new(stream_handle(&image), OpenFlags::READ_ONLY)).unwrap();
    disks.initialize(2);
    assert_eq!(probe(&mut disks, 2).unwrap().kind, FilesystemKind::Unknown);
}
