// Backends that need nothing beyond the standard library.
// OS-specific backends live in blockbridge-platform.

pub mod memory;
pub mod stream;

pub use memory::{Access, MemoryBackend, MemoryMedium};
pub use stream::{ReadOnlyStream, StreamBackend};
