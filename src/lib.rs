//! HeroMessaging - In-process CQRS/messaging runtime
//!
//! A Rust implementation of a reliable in-process messaging runtime:
//! commands, queries, and events are dispatched through a composable
//! decorator pipeline to registered handlers, transported across local
//! queues and topics, and coordinated as multi-step saga workflows.

pub mod bootstrap;
pub mod config;
pub mod facade;
pub mod interfaces;
pub mod message;
pub mod pipeline;
pub mod resilience;
pub mod sagas;
pub mod storage;
pub mod transport;
pub mod versioning;

pub use facade::{HeroMessaging, HeroMessagingBuilder};
pub use message::{
    Address, AddressKind, Command, Envelope, Event, Message, ProcessingContext, ProcessingError,
    ProcessingResult, Query, ResponseValue,
};
