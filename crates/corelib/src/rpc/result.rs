//! Service call result envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Outcome of a service call; exactly one of three states.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServiceCallResult {
    /// The method returned normally. `None` is a legitimate "no value".
    Success { value: Option<Value> },
    /// The method itself reported a declared error.
    MethodException { type_name: String, message: String },
    /// Something between caller and method failed. The message is safe to
    /// show to a user.
    RemoteOperationFailure { message: String },
}

impl ServiceCallResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ServiceCallResult::Success { .. })
    }

    pub fn is_method_exception(&self) -> bool {
        matches!(self, ServiceCallResult::MethodException { .. })
    }

    pub fn is_remote_operation_failure(&self) -> bool {
        matches!(self, ServiceCallResult::RemoteOperationFailure { .. })
    }

    pub fn return_value(&self) -> Option<&Value> {
        match self {
            ServiceCallResult::Success { value } => value.as_ref(),
            _ => None,
        }
    }

    pub fn method_exception_type(&self) -> Option<&str> {
        match self {
            ServiceCallResult::MethodException { type_name, .. } => Some(type_name),
            _ => None,
        }
    }

    pub fn method_exception_message(&self) -> Option<&str> {
        match self {
            ServiceCallResult::MethodException { message, .. } => Some(message),
            _ => None,
        }
    }

    pub fn remote_operation_message(&self) -> Option<&str> {
        match self {
            ServiceCallResult::RemoteOperationFailure { message } => Some(message),
            _ => None,
        }
    }

    /// Decode the return value into a concrete type.
    ///
    /// Returns `Ok(None)` for non-success results and for a success without
    /// a value.
    pub fn decode_return_value<T: serde::de::DeserializeOwned>(&self) -> Result<Option<T>> {
        match self.return_value() {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
