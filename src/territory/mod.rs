//! Territory core: visibility scope, assignment reconciliation and activity
//! aggregation over a [`TabularStore`](crate::db::TabularStore).

pub mod activity;
pub mod assignment;
pub mod audit;
pub mod chunking;
pub mod listing;
pub mod pager;
pub mod report;
pub mod scope;
pub mod window;

pub use activity::{ActivityAggregator, ActivityEvent, ActivityReport, ActivitySource};
pub use assignment::{AssignmentDiff, AssignmentReconciler, ReconcileError, ReconcileOutcome};
pub use chunking::{Chunked, IdChunk, chunk_ids, fetch_chunked, membership_filter};
pub use listing::{ClientListing, ClientQuery};
pub use pager::{PageOptions, Paged, read_all};
pub use report::{ActivitySummary, VisibleClients, WorkReport};
pub use scope::{Actor, Role, Scope, ScopeFilter, resolve_scope};
pub use window::{InvalidWindow, TimeWindow};
