//! Service call request envelope.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::node::LogicalNodeSessionId;

/// An immutable request to invoke `service_name#method_name` on `target`.
///
/// Construct through [`ServiceCallRequest::builder`]; a request that exists
/// is always complete.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceCallRequest {
    target: LogicalNodeSessionId,
    caller: LogicalNodeSessionId,
    service_name: String,
    method_name: String,
    parameters: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata: Option<String>,
}

impl ServiceCallRequest {
    pub fn builder() -> ServiceCallRequestBuilder {
        ServiceCallRequestBuilder::default()
    }

    pub fn target(&self) -> &LogicalNodeSessionId {
        &self.target
    }

    pub fn caller(&self) -> &LogicalNodeSessionId {
        &self.caller
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    pub fn parameters(&self) -> &[Value] {
        &self.parameters
    }

    /// Optional opaque metadata such as an authorization token.
    pub fn metadata(&self) -> Option<&str> {
        self.metadata.as_deref()
    }

    /// True if caller and target live in the same instance session.
    pub fn is_local(&self) -> bool {
        self.target.instance_session_id() == self.caller.instance_session_id()
    }

    /// Encode for the wire.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from the wire. Deserialization re-validates every id and the
    /// name fields.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let request: ServiceCallRequest = serde_json::from_slice(bytes)?;
        validate_name("service name", &request.service_name)?;
        validate_name("method name", &request.method_name)?;
        Ok(request)
    }
}

impl fmt::Display for ServiceCallRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{} on {} (caller {})",
            self.service_name, self.method_name, self.target, self.caller
        )
    }
}

fn validate_name(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::InvalidRequest(format!("{} must not be empty", field)));
    }
    Ok(())
}

/// Builder for [`ServiceCallRequest`].
#[derive(Debug, Default)]
pub struct ServiceCallRequestBuilder {
    target: Option<LogicalNodeSessionId>,
    caller: Option<LogicalNodeSessionId>,
    service_name: Option<String>,
    method_name: Option<String>,
    parameters: Vec<Value>,
    metadata: Option<String>,
}

impl ServiceCallRequestBuilder {
    pub fn target(mut self, target: LogicalNodeSessionId) -> Self {
        self.target = Some(target);
        self
    }

    pub fn caller(mut self, caller: LogicalNodeSessionId) -> Self {
        self.caller = Some(caller);
        self
    }

    pub fn service(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = Some(service_name.into());
        self
    }

    pub fn method(mut self, method_name: impl Into<String>) -> Self {
        self.method_name = Some(method_name.into());
        self
    }

    /// Append one parameter.
    pub fn param(mut self, value: impl Into<Value>) -> Self {
        self.parameters.push(value.into());
        self
    }

    /// Replace the parameter list.
    pub fn params(mut self, values: Vec<Value>) -> Self {
        self.parameters = values;
        self
    }

    pub fn metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }

    /// Validate and build.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidRequest`] if target, caller, service name or method
    /// name is missing, or a name is empty.
    pub fn build(self) -> Result<ServiceCallRequest> {
        let missing = |field: &str| Error::InvalidRequest(format!("missing {}", field));
        let target = self.target.ok_or_else(|| missing("target node"))?;
        let caller = self.caller.ok_or_else(|| missing("caller node"))?;
        let service_name = self.service_name.ok_or_else(|| missing("service name"))?;
        let method_name = self.method_name.ok_or_else(|| missing("method name"))?;
        validate_name("service name", &service_name)?;
        validate_name("method name", &method_name)?;

        Ok(ServiceCallRequest {
            target,
            caller,
            service_name,
            method_name,
            parameters: self.parameters,
            metadata: self.metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{InstanceId, InstanceSessionId};
    use serde_json::json;

    fn node() -> LogicalNodeSessionId {
        InstanceSessionId::new(&InstanceId::generate(), 1)
            .unwrap()
            .default_logical_node_session_id()
    }

    #[test]
    fn test_build_complete_request() {
        let (target, caller) = (node(), node());
        let request = ServiceCallRequest::builder()
            .target(target.clone())
            .caller(caller.clone())
            .service("Echo")
            .method("echo")
            .param("hello")
            .param(3)
            .build()
            .unwrap();

        assert_eq!(request.target(), &target);
        assert_eq!(request.caller(), &caller);
        assert_eq!(request.parameters(), &[json!("hello"), json!(3)]);
        assert_eq!(request.metadata(), None);
        assert!(!request.is_local());
    }

    #[test]
    fn test_missing_fields_fail_at_construction() {
        let complete = || {
            ServiceCallRequest::builder()
                .target(node())
                .caller(node())
                .service("Echo")
                .method("echo")
        };
        assert!(complete().build().is_ok());

        let builders = [
            ServiceCallRequest::builder().caller(node()).service("Echo").method("echo"),
            ServiceCallRequest::builder().target(node()).service("Echo").method("echo"),
            ServiceCallRequest::builder().target(node()).caller(node()).method("echo"),
            ServiceCallRequest::builder().target(node()).caller(node()).service("Echo"),
            complete().service(""),
            complete().method("  "),
        ];
        for builder in builders {
            assert!(matches!(builder.build(), Err(Error::InvalidRequest(_))));
        }
    }

    #[test]
    fn test_wire_form_revalidates() {
        let request = ServiceCallRequest::builder()
            .target(node())
            .caller(node())
            .service("Echo")
            .method("echo")
            .metadata("token")
            .build()
            .unwrap();
        let bytes = request.to_bytes().unwrap();
        assert_eq!(ServiceCallRequest::from_bytes(&bytes).unwrap(), request);

        let mut tampered: Value = serde_json::from_slice(&bytes).unwrap();
        tampered["service_name"] = json!("");
        let bytes = serde_json::to_vec(&tampered).unwrap();
        assert!(ServiceCallRequest::from_bytes(&bytes).is_err());

        tampered["service_name"] = json!("Echo");
        tampered["target"] = json!("not-a-node");
        let bytes = serde_json::to_vec(&tampered).unwrap();
        assert!(matches!(
            ServiceCallRequest::from_bytes(&bytes),
            Err(Error::Serialization(_))
        ));
    }
}
