// Boot sector probing
// Reads sector 0 through the disk facade and recognises the filesystems the
// FAT and NTFS drivers can mount. Informational only; nothing is mounted.

use blockbridge_core::{DiskCommand, DiskIo, DriveId, Result};
use byteorder::{ByteOrder, LittleEndian};
use log::debug;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilesystemKind {
    Ntfs,
    ExFat,
    Fat32,
    Fat16,
    Fat12,
    Unknown,
}

impl FilesystemKind {
    pub fn name(self) -> &'static str {
        match self {
            FilesystemKind::Ntfs => "ntfs",
            FilesystemKind::ExFat => "exfat",
            FilesystemKind::Fat32 => "fat32",
            FilesystemKind::Fat16 => "fat16",
            FilesystemKind::Fat12 => "fat12",
            FilesystemKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FilesystemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeReport {
    pub kind: FilesystemKind,
    /// Bytes per sector recorded in the boot sector, when the format carries one
    pub bytes_per_sector: Option<u32>,
}

/// One recogniser per filesystem family
pub trait BootSectorDetector {
    fn detect(boot_sector: &[u8]) -> Option<FilesystemKind>;
}

pub struct NtfsDetector;
pub struct ExFatDetector;
pub struct Fat32Detector;
pub struct FatDetector;

impl BootSectorDetector for NtfsDetector {
    fn detect(boot_sector: &[u8]) -> Option<FilesystemKind> {
        // OEM id at offset 3
        (&boot_sector[3..11] == b"NTFS    ").then_some(FilesystemKind::Ntfs)
    }
}

impl BootSectorDetector for ExFatDetector {
    fn detect(boot_sector: &[u8]) -> Option<FilesystemKind> {
        (&boot_sector[3..11] == b"EXFAT   ").then_some(FilesystemKind::ExFat)
    }
}

impl BootSectorDetector for Fat32Detector {
    fn detect(boot_sector: &[u8]) -> Option<FilesystemKind> {
        (&boot_sector[82..87] == b"FAT32").then_some(FilesystemKind::Fat32)
    }
}

impl BootSectorDetector for FatDetector {
    fn detect(boot_sector: &[u8]) -> Option<FilesystemKind> {
        match &boot_sector[54..62] {
            b"FAT12   " => Some(FilesystemKind::Fat12),
            label if &label[..3] == b"FAT" => Some(FilesystemKind::Fat16),
            _ => None,
        }
    }
}

const BOOT_SECTOR_LEN: usize = 512;

/// Classify a boot sector; anything shorter than 512 bytes is `Unknown`
pub fn detect(boot_sector: &[u8]) -> ProbeReport {
    if boot_sector.len() < BOOT_SECTOR_LEN {
        return ProbeReport { kind: FilesystemKind::Unknown, bytes_per_sector: None };
    }

    // OEM id checks run before the FAT label scans
    let kind = NtfsDetector::detect(boot_sector)
        .or_else(|| ExFatDetector::detect(boot_sector))
        .or_else(|| Fat32Detector::detect(boot_sector))
        .or_else(|| FatDetector::detect(boot_sector))
        .unwrap_or(FilesystemKind::Unknown);

    let bytes_per_sector = match kind {
        FilesystemKind::Unknown => None,
        // BytesPerSectorShift
        FilesystemKind::ExFat => 1u32.checked_shl(u32::from(boot_sector[108])),
        _ => match LittleEndian::read_u16(&boot_sector[11..13]) {
            0 => None,
            n => Some(u32::from(n)),
        },
    };

    ProbeReport { kind, bytes_per_sector }
}

/// Read sector 0 of drive `id` and classify it
pub fn probe(disks: &mut DiskIo, id: DriveId) -> Result<ProbeReport> {
    let sector_size = disks.control(id, u8::from(DiskCommand::GetSectorSize))?;
    let mut boot_sector = vec![0u8; sector_size as usize];
    disks.read_sectors(id, &mut boot_sector, 0, 1)?;
    let report = detect(&boot_sector);
    debug!("drive {}: probed {} ({:?} bytes/sector)", id, report.kind, report.bytes_per_sector);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank() -> Vec<u8> {
        let mut sector = vec![0u8; 512];
        sector[510] = 0x55;
        sector[511] = 0xAA;
        sector
    }

    #[test]
    fn recognises_ntfs() {
        let mut bs = blank();
        bs[3..11].copy_from_slice(b"NTFS    ");
        LittleEndian::write_u16(&mut bs[11..13], 512);
        assert_eq!(
            detect(&bs),
            ProbeReport { kind: FilesystemKind::Ntfs, bytes_per_sector: Some(512) }
        );
    }

    #[test]
    fn recognises_exfat_sector_shift() {
        let mut bs = blank();
        bs[3..11].copy_from_slice(b"EXFAT   ");
        bs[108] = 12;
        let report = detect(&bs);
        assert_eq!(report.kind, FilesystemKind::ExFat);
        assert_eq!(report.bytes_per_sector, Some(4096));
    }

    #[test]
    fn distinguishes_fat_widths() {
        let mut fat32 = blank();
        fat32[82..90].copy_from_slice(b"FAT32   ");
        assert_eq!(detect(&fat32).kind, FilesystemKind::Fat32);

        let mut fat16 = blank();
        fat16[54..62].copy_from_slice(b"FAT16   ");
        assert_eq!(detect(&fat16).kind, FilesystemKind::Fat16);

        let mut fat12 = blank();
        fat12[54..62].copy_from_slice(b"FAT12   ");
        assert_eq!(detect(&fat12).kind, FilesystemKind::Fat12);
    }

    #[test]
    fn empty_or_short_sector_is_unknown() {
        assert_eq!(detect(&blank()).kind, FilesystemKind::Unknown);
        assert_eq!(detect(&[0u8; 100]).kind, FilesystemKind::Unknown);
        assert_eq!(detect(&blank()).bytes_per_sector, None);
    }
}
