pub(crate) mod identity;
mod plan;
mod row;
mod side;
mod snapshot;
mod tombstone;

pub use identity::{Identity, IdentityError, IdentityKind};
pub use plan::{ApplyPlan, MergeOutcome, PlannedDelete, PlannedUpsert, TableOutcome, TablePlan};
pub use row::{
    format_timestamp, parse_timestamp, Row, CREATED_AT_FIELD, UPDATED_AT_FIELD, UUID_FIELD,
};
pub use side::{Layout, ParseSideError, Side};
pub use snapshot::{Snapshot, TableSnapshot};
pub use tombstone::Tombstone;
