//! Network-level request and response messages.
//!
//! Channels carry opaque payloads tagged with a message type. The message
//! layer does not look into payloads; higher layers (RPC, node properties)
//! register handlers per message type.

use std::fmt;

use bytes::Bytes;
use corelib::InstanceSessionId;
use serde::{Deserialize, Serialize};

/// Message type of service call requests.
pub const MESSAGE_TYPE_RPC: &str = "rpc";
/// Message type of the graceful close handshake.
pub const MESSAGE_TYPE_GOODBYE: &str = "channel.goodbye";

/// Outcome classification of a [`NetworkResponse`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum ResultCode {
    Success,
    /// The destination handler failed; the payload may carry an encoded
    /// [`ErrorInfo`](corelib::rpc::ErrorInfo).
    ExceptionAtDestination,
    NoHandlerForMessageType,
    NoRouteToDestination,
    Timeout,
    ChannelClosedOrBroken,
    /// The transport failed while delivering the request at the remote side.
    ExceptionDuringDelivery,
}

impl ResultCode {
    pub fn is_success(&self) -> bool {
        *self == ResultCode::Success
    }

    pub fn name(&self) -> &'static str {
        match self {
            ResultCode::Success => "Success",
            ResultCode::ExceptionAtDestination => "ExceptionAtDestination",
            ResultCode::NoHandlerForMessageType => "NoHandlerForMessageType",
            ResultCode::NoRouteToDestination => "NoRouteToDestination",
            ResultCode::Timeout => "Timeout",
            ResultCode::ChannelClosedOrBroken => "ChannelClosedOrBroken",
            ResultCode::ExceptionDuringDelivery => "ExceptionDuringDelivery",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A request travelling over one channel.
#[derive(Clone, Debug, PartialEq)]
pub struct NetworkRequest {
    request_id: u64,
    message_type: String,
    sender: InstanceSessionId,
    payload: Bytes,
}

impl NetworkRequest {
    pub fn new(
        request_id: u64,
        message_type: impl Into<String>,
        sender: InstanceSessionId,
        payload: Bytes,
    ) -> Self {
        Self {
            request_id,
            message_type: message_type.into(),
            sender,
            payload,
        }
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    /// Session of the node that sent the request.
    pub fn sender(&self) -> &InstanceSessionId {
        &self.sender
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

/// The answer to a [`NetworkRequest`].
#[derive(Clone, Debug, PartialEq)]
pub struct NetworkResponse {
    request_id: u64,
    result_code: ResultCode,
    payload: Bytes,
}

impl NetworkResponse {
    pub fn success(request_id: u64, payload: Bytes) -> Self {
        Self {
            request_id,
            result_code: ResultCode::Success,
            payload,
        }
    }

    /// An error response; `payload` is usually an encoded `ErrorInfo` or empty.
    pub fn failure(request_id: u64, result_code: ResultCode, payload: Bytes) -> Self {
        Self {
            request_id,
            result_code,
            payload,
        }
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn result_code(&self) -> ResultCode {
        self.result_code
    }

    pub fn is_success(&self) -> bool {
        self.result_code.is_success()
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

/// What a response handler receives: exactly one per sent request.
#[derive(Clone, Debug, PartialEq)]
pub enum ChannelOutcome {
    /// The remote side answered. The response may still carry an error code.
    Response(NetworkResponse),
    /// No answer arrived: timeout, or the channel closed or broke.
    Failure { code: ResultCode, reason: String },
}

impl ChannelOutcome {
    pub fn failure(code: ResultCode, reason: impl Into<String>) -> Self {
        ChannelOutcome::Failure {
            code,
            reason: reason.into(),
        }
    }

    pub fn result_code(&self) -> ResultCode {
        match self {
            ChannelOutcome::Response(response) => response.result_code(),
            ChannelOutcome::Failure { code, .. } => *code,
        }
    }

    pub fn is_success(&self) -> bool {
        self.result_code().is_success()
    }

    /// The payload of a successful response.
    pub fn success_payload(&self) -> Option<&Bytes> {
        match self {
            ChannelOutcome::Response(response) if response.is_success() => Some(response.payload()),
            _ => None,
        }
    }
}
