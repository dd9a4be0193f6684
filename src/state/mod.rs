//! Persistent state: JSON document store

mod store;

pub use store::{State, StateError, Store};
