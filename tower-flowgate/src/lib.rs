//! # tower-flowgate
//!
//! Tower middleware that brackets every request in a
//! [flowgate](flowgate) entry against a named resource.
//!
//! On each call the service opens an entry; if the core blocks, the request
//! fails immediately with [`GateError::Blocked`] and the inner service never
//! sees it. Otherwise the entry completes when the inner future resolves,
//! and inner-service errors are traced onto the entry so they show up in
//! the per-resource error statistics.
//!
//! ## Feature Flags
//! - `axum`: implements `axum::response::IntoResponse` for [`GateError`],
//!   mapping blocks to `429 Too Many Requests`.

mod error;
mod layer;
mod service;


pub use error::GateError;
pub use layer::FlowControlLayer;
pub use service::FlowControlService;
