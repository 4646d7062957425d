//! Size-tiered persistence of agent working context.
//!
//! Payloads are routed by serialized size into one of three tiers:
//!
//! | Tier     | Size            | Backing                                   |
//! |----------|-----------------|-------------------------------------------|
//! | Active   | <= 1 MiB        | in-process TTL cache ([`MemoryCache`])    |
//! | Recent   | <= 10 MiB       | SQLite rows with version history          |
//! | Archived | > 10 MiB        | files on disk plus a metadata-only row    |
//!
//! [`ContextStore::recover_context`] cascades Active -> Recent -> Archived and
//! promotes hits into faster tiers.

pub mod active;
pub mod archive;
pub mod error;
pub mod recent;
pub mod store;
pub mod tier;

pub use active::{ActiveCache, MemoryCache};
pub use archive::{ArchiveStore, FsArchive};
pub use error::{ContextError, Result};
pub use recent::{ContextSnapshot, RecentStore, SqliteRecentStore};
pub use store::{ContextHealth, ContextStore, DeleteReport, RecoveredContext, TierHealth, TierOutcome};
pub use tier::{ContextTier, TierLimits};
