// usbdevfs capability codes
// The numeric ioctl requests for USB mass-storage control come from the kernel
// headers the crate was built against, resolved once per process and then only
// looked up. Callers never embed the numbers themselves.

use blockbridge_core::{BlockError, Result};
use log::{debug, info};
use once_cell::sync::OnceCell;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UsbdevfsOp {
    SubmitUrb,
    ReapUrbNdelay,
    ReleaseInterface,
    Ioctl,
    DiscardUrb,
    GetCapabilities,
    DisconnectClaim,
    Reset,
}

impl UsbdevfsOp {
    pub const ALL: [UsbdevfsOp; 8] = [
        UsbdevfsOp::SubmitUrb,
        UsbdevfsOp::ReapUrbNdelay,
        UsbdevfsOp::ReleaseInterface,
        UsbdevfsOp::Ioctl,
        UsbdevfsOp::DiscardUrb,
        UsbdevfsOp::GetCapabilities,
        UsbdevfsOp::DisconnectClaim,
        UsbdevfsOp::Reset,
    ];

    /// Declaration order; the C shim numbers ops the same way
    fn index(self) -> usize {
        self as usize
    }

    /// Dashed symbolic name, e.g. `submit-urb`
    pub fn name(self) -> &'static str {
        match self {
            UsbdevfsOp::SubmitUrb => "submit-urb",
            UsbdevfsOp::ReapUrbNdelay => "reap-urb-nondelay",
            UsbdevfsOp::ReleaseInterface => "release-interface",
            UsbdevfsOp::Ioctl => "generic-ioctl",
            UsbdevfsOp::DiscardUrb => "discard-urb",
            UsbdevfsOp::GetCapabilities => "get-capabilities",
            UsbdevfsOp::DisconnectClaim => "disconnect-and-claim",
            UsbdevfsOp::Reset => "reset",
        }
    }

    /// Name of the constant in `linux/usbdevice_fs.h`
    pub fn kernel_name(self) -> &'static str {
        match self {
            UsbdevfsOp::SubmitUrb => "USBDEVFS_SUBMITURB",
            UsbdevfsOp::ReapUrbNdelay => "USBDEVFS_REAPURBNDELAY",
            UsbdevfsOp::ReleaseInterface => "USBDEVFS_RELEASEINTERFACE",
            UsbdevfsOp::Ioctl => "USBDEVFS_IOCTL",
            UsbdevfsOp::DiscardUrb => "USBDEVFS_DISCARDURB",
            UsbdevfsOp::GetCapabilities => "USBDEVFS_GET_CAPABILITIES",
            UsbdevfsOp::DisconnectClaim => "USBDEVFS_DISCONNECT_CLAIM",
            UsbdevfsOp::Reset => "USBDEVFS_RESET",
        }
    }
}

impl fmt::Display for UsbdevfsOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Accepts `submit-urb`, `submit_urb`, `submiturb` and `USBDEVFS_SUBMITURB` alike;
/// `reapurbndelay`, `ioctl` and `disconnect-claim` match through the kernel names
impl FromStr for UsbdevfsOp {
    type Err = BlockError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = normalize(s);
        UsbdevfsOp::ALL
            .iter()
            .copied()
            .find(|op| normalize(op.name()) == wanted || normalize(op.kernel_name()) == wanted)
            .ok_or_else(|| BlockError::UnknownOperation(s.to_string()))
    }
}

fn normalize(name: &str) -> String {
    let lower = name.to_ascii_lowercase();
    let bare = lower.strip_prefix("usbdevfs_").unwrap_or(&lower);
    bare.chars().filter(|c| c.is_ascii_alphanumeric()).collect()
}

/// Where numeric codes come from
pub trait CodeSource {
    fn name(&self) -> &str;

    /// `None` when this platform has no such request
    fn lookup(&self, op: UsbdevfsOp) -> Option<u64>;
}

/// Codes as the installed `linux/usbdevice_fs.h` defines them, read through the
/// C shim compiled by the build script. A constant the headers lack stays `None`.
pub struct KernelAbi;

impl CodeSource for KernelAbi {
    fn name(&self) -> &str {
        "kernel-headers"
    }

    #[cfg(target_os = "linux")]
    fn lookup(&self, op: UsbdevfsOp) -> Option<u64> {
        let mut code: u64 = 0;
        // SAFETY: the shim only writes through `out`, which points at a live local,
        // and any op number it does not know returns 0 without touching it.
        let defined = unsafe { ffi::blockbridge_usbdevfs_code(op.index() as std::os::raw::c_uint, &mut code) };
        (defined != 0).then_some(code)
    }

    #[cfg(not(target_os = "linux"))]
    fn lookup(&self, _op: UsbdevfsOp) -> Option<u64> {
        None
    }
}

#[cfg(target_os = "linux")]
mod ffi {
    use std::os::raw::{c_int, c_uint};

    extern "C" {
        /// Returns 1 and stores the code when the headers define op number `op`
        pub fn blockbridge_usbdevfs_code(op: c_uint, out: *mut u64) -> c_int;
    }
}

/// Resolved codes, immutable once built
#[derive(Debug, Clone)]
pub struct CapabilityTable {
    source: String,
    codes: [Option<u64>; 8],
}

impl CapabilityTable {
    pub fn resolve_from(source: &dyn CodeSource) -> Self {
        let mut codes = [None; 8];
        for op in UsbdevfsOp::ALL {
            codes[op.index()] = source.lookup(op);
            match codes[op.index()] {
                Some(code) => debug!("{} ({}) = {:#x}", op, op.kernel_name(), code),
                None => debug!("{} ({}) unavailable from {}", op, op.kernel_name(), source.name()),
            }
        }
        Self {
            source: source.name().to_string(),
            codes,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn code(&self, op: UsbdevfsOp) -> Result<u64> {
        self.codes[op.index()].ok_or_else(|| {
            BlockError::ResolutionUnavailable(format!("{} is not defined by {}", op.kernel_name(), self.source))
        })
    }

    /// Look up by symbolic name
    pub fn resolve(&self, name: &str) -> Result<u64> {
        self.code(name.parse()?)
    }

    /// Reverse lookup, for callers that received a code and want to log what it is
    pub fn op_for_code(&self, code: u64) -> Option<UsbdevfsOp> {
        UsbdevfsOp::ALL
            .iter()
            .copied()
            .find(|op| self.codes[op.index()] == Some(code))
    }

    pub fn entries(&self) -> impl Iterator<Item = (UsbdevfsOp, Option<u64>)> + '_ {
        UsbdevfsOp::ALL.iter().map(move |op| (*op, self.codes[op.index()]))
    }
}

static CAPABILITIES: OnceCell<CapabilityTable> = OnceCell::new();

/// Process-wide table, built on first use; concurrent first callers share one resolution
pub fn capabilities() -> &'static CapabilityTable {
    CAPABILITIES.get_or_init(|| {
        let table = CapabilityTable::resolve_from(&KernelAbi);
        let available = table.entries().filter(|(_, code)| code.is_some()).count();
        info!("resolved {}/{} usbdevfs request codes from {}", available, UsbdevfsOp::ALL.len(), table.source());
        table
    })
}

pub fn resolve(name: &str) -> Result<u64> {
    capabilities().resolve(name)
}

pub fn code(op: UsbdevfsOp) -> Result<u64> {
    capabilities().code(op)
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockbridge_core::ErrorKind;

    /// Headers from before USBDEVFS_RESET and friends existed
    struct OldHeaders;

    impl CodeSource for OldHeaders {
        fn name(&self) -> &str {
            "old-headers"
        }

        fn lookup(&self, op: UsbdevfsOp) -> Option<u64> {
            match op {
                UsbdevfsOp::Reset | UsbdevfsOp::GetCapabilities | UsbdevfsOp::DisconnectClaim => None,
                // a zero code is legal and must not read as "missing"
                UsbdevfsOp::DiscardUrb => Some(0),
                other => Some(0x5500 + other as u64),
            }
        }
    }

    #[test]
    fn parses_all_name_styles() {
        assert_eq!("submit-urb".parse::<UsbdevfsOp>().unwrap(), UsbdevfsOp::SubmitUrb);
        assert_eq!("USBDEVFS_SUBMITURB".parse::<UsbdevfsOp>().unwrap(), UsbdevfsOp::SubmitUrb);
        assert_eq!("reapurbndelay".parse::<UsbdevfsOp>().unwrap(), UsbdevfsOp::ReapUrbNdelay);
        assert_eq!("disconnect-and-claim".parse::<UsbdevfsOp>().unwrap(), UsbdevfsOp::DisconnectClaim);
        assert_eq!("USBDEVFS_DISCONNECT_CLAIM".parse::<UsbdevfsOp>().unwrap(), UsbdevfsOp::DisconnectClaim);
        assert_eq!("generic-ioctl".parse::<UsbdevfsOp>().unwrap(), UsbdevfsOp::Ioctl);
        assert_eq!("Reset".parse::<UsbdevfsOp>().unwrap(), UsbdevfsOp::Reset);
    }

    #[test]
    fn unknown_name_is_unknown_operation() {
        let table = CapabilityTable::resolve_from(&OldHeaders);
        assert_eq!(table.resolve("claim-everything").unwrap_err().kind(), ErrorKind::UnknownOperation);
        assert_eq!(table.resolve("").unwrap_err().kind(), ErrorKind::UnknownOperation);
    }

    #[test]
    fn missing_constant_is_resolution_unavailable_not_zero() {
        let table = CapabilityTable::resolve_from(&OldHeaders);
        assert_eq!(table.resolve("reset").unwrap_err().kind(), ErrorKind::ResolutionUnavailable);
        assert_eq!(table.resolve("discard-urb").unwrap(), 0);
    }

    #[test]
    fn source_name_is_recorded() {
        assert_eq!(CapabilityTable::resolve_from(&OldHeaders).source(), "old-headers");
        assert_eq!(CapabilityTable::resolve_from(&KernelAbi).source(), "kernel-headers");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn kernel_abi_agrees_with_the_cached_table() {
        for op in UsbdevfsOp::ALL {
            assert_eq!(KernelAbi.lookup(op), capabilities().code(op).ok(), "{op}");
        }
    }

    #[test]
    fn reverse_lookup() {
        let table = CapabilityTable::resolve_from(&OldHeaders);
        assert_eq!(table.op_for_code(0), Some(UsbdevfsOp::DiscardUrb));
        assert_eq!(table.op_for_code(0xffff_ffff), None);
    }

    // cross-check of the shim against the published x86_64 values
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    #[test]
    fn matches_x86_64_header_values() {
        let table = CapabilityTable::resolve_from(&KernelAbi);
        assert_eq!(table.code(UsbdevfsOp::SubmitUrb).unwrap(), 0x8038_550a);
        assert_eq!(table.code(UsbdevfsOp::DiscardUrb).unwrap(), 0x550b);
        assert_eq!(table.code(UsbdevfsOp::ReapUrbNdelay).unwrap(), 0x4008_550d);
        assert_eq!(table.code(UsbdevfsOp::ReleaseInterface).unwrap(), 0x8004_5510);
        assert_eq!(table.code(UsbdevfsOp::Ioctl).unwrap(), 0xc010_5512);
        assert_eq!(table.code(UsbdevfsOp::Reset).unwrap(), 0x5514);
        assert_eq!(table.code(UsbdevfsOp::GetCapabilities).unwrap(), 0x8004_551a);
        assert_eq!(table.code(UsbdevfsOp::DisconnectClaim).unwrap(), 0x8108_551b);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn every_code_resolves_on_linux() {
        for (op, code) in capabilities().entries() {
            let code = code.unwrap_or_else(|| panic!("{op} unresolved"));
            assert_ne!(code, 0, "{op}");
        }
    }
}
