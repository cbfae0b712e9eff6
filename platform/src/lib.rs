// Platform-specific device support
// File and block-device backends plus the usbdevfs capability codes.

pub mod usbdevfs;

#[cfg(unix)]
pub mod file;

pub use usbdevfs::{capabilities, CapabilityTable, CodeSource, KernelAbi, UsbdevfsOp};

#[cfg(unix)]
pub use file::FileBackend;
