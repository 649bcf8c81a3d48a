use super::SystemId;

/// Storage sentinel for the unallocated bucket. Must never leak past the
/// store layer.
pub const UNALLOCATED_SENTINEL: &str = "unallocated";

/// Owner of a ledger position: a system, or the bucket holding broker shares
/// that no active system currently claims.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Bucket {
    System(SystemId),
    Unallocated,
}

impl Bucket {
    /// Translate from the stored string id at the storage boundary.
    pub fn from_db(id: &str) -> Bucket {
        if id == UNALLOCATED_SENTINEL {
            Bucket::Unallocated
        } else {
            Bucket::System(id.to_string())
        }
    }

    pub fn as_db(&self) -> &str {
        match self {
            Bucket::System(id) => id,
            Bucket::Unallocated => UNALLOCATED_SENTINEL,
        }
    }

    pub fn is_unallocated(&self) -> bool {
        matches!(self, Bucket::Unallocated)
    }

    pub fn system_id(&self) -> Option<&str> {
        match self {
            Bucket::System(id) => Some(id),
            Bucket::Unallocated => None,
        }
    }
}

impl std::fmt::Display for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_db())
    }
}
