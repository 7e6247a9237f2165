//! Construction of [`ServiceCallResult`]s from their three origins.
//!
//! Every infrastructure failure goes through one of the `represent_*`
//! functions. They log the internal detail once under an [`ErrorMarker`] and
//! build a user message that contains only the marker, the call signature
//! and the node ids involved. Raw error text never reaches that message.

use std::fmt;

use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error};

use super::{ServiceCallRequest, ServiceCallResult};
use crate::marker::{log_error_with_marker, log_warning_with_marker, ErrorMarker};
use crate::node::InstanceSessionId;

const FAILURES_METRIC: &str = "nodemesh_rpc_failures_total";

// ============================================================================
// Success and declared errors
// ============================================================================

/// Wrap the return value of a successful invocation.
pub fn wrap_return_value(value: Option<Value>) -> ServiceCallResult {
    ServiceCallResult::Success { value }
}

/// Wrap a declared error raised by the invoked method.
///
/// Only the error's type name and display text are kept. Undeclared
/// failures belong in [`represent_internal_error_at_handler`].
///
/// `E` must be the concrete error type. A `dyn Error` carries no type name,
/// so boxed errors are unboxed first (`boxed.as_ref()` on a
/// `Box<ConcreteError>`) or go through [`wrap_method_exception_parts`] with
/// an explicit name.
pub fn wrap_method_exception<E: std::error::Error>(error: &E) -> ServiceCallResult {
    wrap_method_exception_parts(error_type_name(error), error.to_string())
}

/// Type name recorded for a declared error.
pub fn error_type_name<E: std::error::Error>(_error: &E) -> &'static str {
    std::any::type_name::<E>()
}

/// Like [`wrap_method_exception`] for errors that are not Rust error types.
pub fn wrap_method_exception_parts(
    type_name: impl Into<String>,
    message: impl Into<String>,
) -> ServiceCallResult {
    ServiceCallResult::MethodException {
        type_name: type_name.into(),
        message: message.into(),
    }
}

// ============================================================================
// Infrastructure failures
// ============================================================================

/// A local failure on the calling node, before or after the network hop
/// (e.g. the parameters could not be serialized).
pub fn represent_internal_error_at_sender(
    request: &ServiceCallRequest,
    internal_detail: impl fmt::Display,
) -> ServiceCallResult {
    let marker = log_error_with_marker(format_args!(
        "Local error at sender while calling {}#{} on target node {}: {}",
        request.service_name(),
        request.method_name(),
        request.target(),
        internal_detail
    ));
    counter!(FAILURES_METRIC, "origin" => "sender").increment(1);
    failure(format!(
        "There was a local error while calling {}#{} on {}; you can find more information \
         by looking for the marker '{}' in the log files of {}",
        request.service_name(),
        request.method_name(),
        request.target(),
        marker,
        request.caller()
    ))
}

/// A failure on the handling node that is not a declared method error: a
/// panic, an undeclared error, or a result that could not be serialized.
pub fn represent_internal_error_at_handler(
    request: &ServiceCallRequest,
    internal_detail: impl fmt::Display,
) -> ServiceCallResult {
    let marker = log_error_with_marker(format_args!(
        "Internal error while handling {}#{} for caller {}: {}",
        request.service_name(),
        request.method_name(),
        request.caller(),
        internal_detail
    ));
    counter!(FAILURES_METRIC, "origin" => "handler").increment(1);
    failure(format!(
        "There was an internal error on {} while handling {}#{}; technical details were \
         logged there as error '{}'",
        request.target(),
        request.service_name(),
        request.method_name(),
        marker
    ))
}

/// A request the handling node refuses: unknown service, or a method that
/// is not remotely callable.
pub fn represent_invalid_request_at_handler(
    request: &ServiceCallRequest,
    internal_detail: impl fmt::Display,
) -> ServiceCallResult {
    let marker = log_error_with_marker(format_args!(
        "Refused request for invalid method {}#{} sent by {}: {}",
        request.service_name(),
        request.method_name(),
        request.caller(),
        internal_detail
    ));
    counter!(FAILURES_METRIC, "origin" => "invalid_request").increment(1);
    failure(format!(
        "Request {}#{} refused by destination {} (remote error id: {})",
        request.service_name(),
        request.method_name(),
        request.target(),
        marker
    ))
}

/// A failure of the message transport: timeout, broken channel, no route,
/// or an error response from the remote message layer.
///
/// `result_code` is the display form of the transport result code;
/// `error_info` is the optional encoded [`ErrorInfo`] that came with the
/// response.
pub fn represent_network_error(
    request: &ServiceCallRequest,
    result_code: impl fmt::Display,
    error_info: Option<&[u8]>,
) -> ServiceCallResult {
    let remote_detail = error_info.map(describe_error_info);
    let marker = log_warning_with_marker(format_args!(
        "Network error while calling {}#{} on {}: {}{}",
        request.service_name(),
        request.method_name(),
        request.target(),
        result_code,
        remote_detail
            .as_deref()
            .map(|detail| format!(" ({})", detail))
            .unwrap_or_default()
    ));
    counter!(FAILURES_METRIC, "origin" => "network").increment(1);

    let mut message = format!(
        "Failed to call {}#{} on {} from {}: {} (error '{}')",
        request.service_name(),
        request.method_name(),
        request.target(),
        request.caller(),
        result_code,
        marker
    );
    if let Some(detail) = remote_detail {
        message.push_str(". ");
        message.push_str(&detail);
    }
    failure(message)
}

fn failure(message: String) -> ServiceCallResult {
    debug!(%message, "Representing failed service call");
    ServiceCallResult::RemoteOperationFailure { message }
}

// ============================================================================
// Remote error information
// ============================================================================

/// Correlation data attached to an error response by the node that
/// detected the failure.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marker: Option<ErrorMarker>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reporting_node: Option<InstanceSessionId>,
}

impl ErrorInfo {
    pub fn new(marker: ErrorMarker, reporting_node: InstanceSessionId) -> Self {
        Self {
            marker: Some(marker),
            reporting_node: Some(reporting_node),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        // a struct of strings always serializes
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

fn describe_error_info(bytes: &[u8]) -> String {
    let info = match ErrorInfo::decode(bytes) {
        Ok(info) => info,
        Err(e) => {
            error!(error = %e, len = bytes.len(), "Received undecodable error information");
            return "The remote error information could not be decoded".to_owned();
        }
    };
    match (info.reporting_node, info.marker) {
        (Some(node), Some(marker)) => format!(
            "The error was reported by {}; technical details were logged there as error '{}'",
            node, marker
        ),
        (Some(node), None) => format!("The error was reported by {}", node),
        (None, Some(marker)) => format!(
            "Technical details were logged on the target instance as error '{}'",
            marker
        ),
        (None, None) => "No further information available".to_owned(),
    }
}
