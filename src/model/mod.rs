//! The tracked fleet: records, persistence and reconciliation.

pub mod stale;
pub mod store;
pub mod sync;
pub mod types;

pub use stale::{RemoteHeads, StaleBranch, StalenessDetector};
pub use store::ModelStore;
pub use sync::{ActiveRepos, ReleaseBranch, RepoCatalog, RepoInspector, SyncReport, Synchronizer};
pub use types::{
    BranchProbe, BranchRecord, BuildFlags, Model, PackageInfo, RepoMetadata, RepoRecord,
};
