//! The code knowledge graph
//!
//! Typed property-graph records ([`types`]), the storage abstraction and its
//! backends ([`store`], [`http_store`]), construction ([`builder`]),
//! change-driven updates ([`incremental`]), and the read-side summary API
//! ([`query`]).

pub mod builder;
pub mod http_store;
pub mod incremental;
pub mod query;
pub mod store;
pub mod types;

pub use builder::{BuildError, CkgBuilder, ProjectDescriptor};
pub use incremental::{IncrementalUpdater, UpdateError, UpdatePlan};
pub use query::{Page, ProjectOverview, QueryApi};
pub use store::{GraphBackend, GraphError, MemoryGraph};
pub use types::{
    BuildStats, CompositeId, EdgeKind, EdgeRecord, NodeKind, NodeRecord, ScopeType, UpdateStats,
    WriteBatch,
};
