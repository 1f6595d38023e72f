//! Cache directory allocation and locking

mod lock;
mod paths;
mod registry;

pub use lock::{LockRegistry, PathGuard, RepoLock, canonical_key};
pub use paths::CachePaths;
pub use registry::{CacheDirectoryRegistry, CacheSlot, SignatureHasher, SlotGuard, sha256_hex};
