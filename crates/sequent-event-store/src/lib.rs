//! Sequent Event Store: concrete storage behind the pipeline's traits.
//!
//! `memory` holds the in-process stores; `pg` holds the `PostgreSQL` stores
//! whose schema is applied through [`schema::MIGRATOR`].

pub mod memory;
pub mod pg;
pub mod schema;

pub use memory::{
    InMemoryCommandStore, InMemoryEventStore, InMemorySnapshotStore, InMemoryWatermarkStore,
};
pub use pg::{PgCommandStore, PgEventStore, PgSnapshotStore, PgWatermarkStore};
