//! Unit enumerators
//!
//! The fetch stage reads its units from a CSV manifest. Every later stage
//! enumerates from the checkpoint store: the artifacts of the upstream stage's
//! succeeded units become the downstream units.

pub mod manifest;
pub mod upstream;

use async_trait::async_trait;
use geoharvest_common::{Result, UnitIdentity};

pub use manifest::ManifestEnumerator;
pub use upstream::{CheckpointEnumerator, MergeGroupEnumerator};

/// Unit attribute holding a local input file
pub const PATH_ATTRIBUTE: &str = "path";

/// Unit attribute holding the upstream unit that produced the input
pub const UPSTREAM_ATTRIBUTE: &str = "upstream";

/// Unit attribute holding a merge group's members (JSON)
pub const MEMBERS_ATTRIBUTE: &str = "members";

/// Yields the units of one stage; calling it again yields the same list
#[async_trait]
pub trait SourceEnumerator: Send + Sync {
    async fn enumerate(&self) -> Result<Vec<UnitIdentity>>;
}
