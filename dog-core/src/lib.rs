//! dog-core: framework-agnostic core for DogRS.
//!
//! Holds the pieces every relay crate shares: Feathers-style error
//! classes and the string key/value configuration store.

pub mod config;
pub mod errors;

pub use config::{DogConfig, DogConfigSnapshot};
pub use errors::{DogError, DogResult, ErrorKind};
