// Driver-side bindings over the block layer
// FAT drivers talk to the disk facade, NTFS drivers to a seekable stream.

pub mod fat;
pub mod ntfs;
pub mod probe;

pub use fat::{dstatus, DResult, FatDisks};
pub use ntfs::DeviceStream;
pub use probe::{detect, probe, FilesystemKind, ProbeReport};
