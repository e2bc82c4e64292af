//! Outgoing API gateway
//!
//! Business code talks to the backend only through the [`RequestGate`]; it
//! never sees token attachment or refresh retries.

pub mod client;
pub mod gate;

pub use client::{ApiRequest, ApiResponse, HttpTransport, Transport};
pub use gate::RequestGate;
