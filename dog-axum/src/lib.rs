//! dog-axum: Axum adapter for DogRS.
//!
//! Exposes a relay node over HTTP: the file routes that run a
//! [`RelayPipeline`](dog_relay::RelayPipeline), the [`ResponseEmitter`]
//! that writes its terminal envelope to the requester, and Feathers-style
//! JSON errors for anything that fails before the first body byte.

pub mod app;
mod emitter;
pub mod params;
pub mod routes;
pub mod state;
mod error;
pub use emitter::ResponseEmitter;
pub use error::DogAxumError;
pub use state::DogAxumState;

pub use app::{axum, AxumApp};
