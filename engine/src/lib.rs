//! # Ward Engine
//!
//! The replication core of a clinical records platform: it moves rows between
//! many intermittently connected facility stores and one central store.
//!
//! This crate holds the ordering, scoping, snapshotting and merge logic. It
//! has no knowledge of networks or databases beyond the [`RowSource`] and
//! [`ImportTarget`] seams, and ships an in-memory multi-version [`Store`]
//! that provides the repeatable-read isolation the snapshot builder relies
//! on.
//!
//! ## Core Concepts
//!
//! ### Ticks
//!
//! Every mutation of every entity type is stamped from one shared counter
//! (see [`clock`]). "Everything after tick N" therefore means the same thing
//! for every table at once. Local writes take even ticks, imported rows odd
//! ones.
//!
//! ### Channels
//!
//! A [`Channel`] names the rows exchanged together: a whole type
//! (`encounter`), the children of one parent (`patient/{id}/encounter`), or
//! the children of any parent (`encounter/all/labRequest`). The
//! [`ChannelRouter`] resolves them against the registry ([`Schema`]).
//!
//! ### Snapshots
//!
//! The [`SnapshotBuilder`] computes, through a single consistent view, every
//! row a peer has not seen yet and that falls inside its scope. A
//! [`SessionManager`] buffers the result for the peer to page through.
//!
//! ### Plans
//!
//! An [`ExportPlan`] pages a channel out as wire records, nesting the children
//! that travel with each root. An [`ImportPlan`] applies wire records,
//! including tombstones, with conflict checks.
//!
//! ## Quick Start
//!
//! ```rust
//! use ward_engine::{
//!     ChannelRouter, EntityType, ExportPlan, ExportQuery, FieldDef, FieldType, Schema,
//!     ScopeRule, Store,
//! };
//! use serde_json::json;
//!
//! // 1. Declare the registry
//! let schema = Schema::new(1)
//!     .with_entity(EntityType::new("patient", vec![
//!         FieldDef::required("displayId", FieldType::String),
//!     ]))
//!     .with_entity(
//!         EntityType::new("encounter", vec![])
//!             .scoped(ScopeRule::patient("patientId")),
//!     );
//!
//! // 2. Write some rows
//! let store = Store::new(schema);
//! let fields = json!({"patientId": "p-1", "reason": "cough"});
//! store.insert("encounter", "e-1", fields.as_object().cloned().unwrap()).unwrap();
//!
//! // 3. Export a patient's channel
//! let router = ChannelRouter::new(store.schema());
//! let channel = router.resolve("patient/p-1/encounter").unwrap();
//! let plan = ExportPlan::compile(store.schema(), channel).unwrap();
//! let page = plan.execute(&store, &ExportQuery::default()).unwrap();
//! assert_eq!(page.records.len(), 1);
//! assert_eq!(page.records[0].id(), Some("e-1"));
//! ```

pub mod channel;
pub mod clock;
pub mod config;
pub mod cursor;
pub mod error;
pub mod export;
pub mod import;
pub mod plan;
pub mod record;
pub mod schema;
pub mod session;
pub mod snapshot;
pub mod store;

// Re-export main types at crate root
pub use channel::{Channel, ChannelRouter, ChannelScope, ResolvedChannel};
pub use clock::{Provenance, SharedClock, TickSource, TickTock, TICK_STEP};
pub use config::{SessionConfig, SyncConfig};
pub use cursor::Cursor;
pub use error::{Error, ErrorKind};
pub use export::{ExportPage, ExportPlan, ExportQuery, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
pub use import::{
    decide, ImportOutcome, ImportPlan, ImportReport, ImportTarget, RecordOutcome, RejectedRecord,
    StagedRows,
};
pub use plan::{NestedPlan, Plan};
pub use record::{Fields, Row, SnapshotDirection, SnapshotRecord, SyncRecord};
pub use schema::{
    Association, AssociationKind, EntityType, FieldDef, FieldType, Schema, ScopeRule,
    SyncDirection,
};
pub use session::{SessionManager, SyncSession};
pub use snapshot::{row_scope, SnapshotBuilder, SnapshotPass, SnapshotRequest};
pub use store::{ReadTxn, RowQuery, RowScope, RowSource, Store, WriteTxn};

/// Type aliases for clarity
pub type Tick = i64;
pub type RecordId = String;
pub type EntityName = String;
pub type SessionId = uuid::Uuid;
pub type Timestamp = u64;
pub type SchemaVersion = u32;

/// The `since` a peer uses when it has never synced: every row qualifies.
pub const INITIAL_SYNC_TICK: Tick = -1;
