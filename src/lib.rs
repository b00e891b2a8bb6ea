//! Gateway configuration operator library.
//!
//! Keeps an APISIX data-plane store eventually consistent with gateway
//! resources authored in a control-plane store.

pub mod config;
pub mod store;
pub mod resource;
pub mod source;
pub mod commit;
pub mod replica;
pub mod sync;
pub mod leader;
pub mod lifecycle;
pub mod observability;

pub use config::schema::OperatorConfig;
pub use lifecycle::{Operator, Shutdown};
