//! In-memory implementations of the collaborator contracts.
//!
//! These back the facade's standalone mode and the test suite, the same
//! way a database-backed implementation would plug in from outside the
//! crate.

mod memory;

pub use memory::{
    InMemoryIdempotencyStore, InMemoryMessageStorage, InMemorySagaRepository, InMemoryUnitOfWork,
};
