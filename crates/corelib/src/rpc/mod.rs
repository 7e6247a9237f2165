//! Remote procedure call envelopes.
//!
//! A [`ServiceCallRequest`] names a target node, a caller node, a service
//! and a method plus its parameters. The answer is always a
//! [`ServiceCallResult`]; failures on the way are folded into it by the
//! functions in [`factory`] and never surface as errors of their own.

pub mod factory;
pub mod request;
pub mod result;

pub use factory::ErrorInfo;
pub use request::{ServiceCallRequest, ServiceCallRequestBuilder};
pub use result::ServiceCallResult;
