//! Offline-first data layer for the partner app: a durable local store, a
//! mutation queue, a response cache, a sync manager and the request gateway
//! that ties them together.

pub mod cache;
pub mod config;
pub mod error;
pub mod gateway;
pub mod model;
pub mod queue;
pub mod remote;
pub mod store;
pub mod sync;

pub use error::{Error, Result};
