//! Service calls over message channels.
//!
//! - [`ServiceCallHandler`]: the receiving side. Looks up the service,
//!   enforces its allow-list of remotely callable methods and turns every
//!   outcome into a [`ServiceCallResult`].
//! - [`RemoteServiceCaller`]: the calling side. Dispatches local targets
//!   in-process and remote targets over a channel, and normalizes every
//!   failure on the way into a `RemoteOperationFailure`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use corelib::rpc::factory;
use corelib::{InstanceSessionId, ServiceCallRequest, ServiceCallResult};
use dashmap::DashMap;
use metrics::counter;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::protocol::{ChannelOutcome, NetworkRequest, MESSAGE_TYPE_RPC};
use crate::service::{HandlerError, MessageChannelService, RequestHandler};

/// Failure of a remotely callable method.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MethodError {
    /// An error the method declares; the caller sees a method exception
    /// with this type name and message.
    #[error("{type_name}: {message}")]
    Declared { type_name: String, message: String },
    /// Anything else. Logged at the handling node; the caller only sees a
    /// marker.
    #[error("internal error: {0}")]
    Internal(String),
}

impl MethodError {
    /// Declare `error` as the method's failure.
    pub fn declared<E: std::error::Error>(error: &E) -> Self {
        MethodError::Declared {
            type_name: factory::error_type_name(error).to_owned(),
            message: error.to_string(),
        }
    }
}

/// A service whose methods can be called from other nodes.
#[async_trait]
pub trait RemotableService: Send + Sync + 'static {
    fn service_name(&self) -> &str;

    /// Methods that may be invoked remotely. Calls to any other method are
    /// refused before `invoke` runs.
    fn remote_methods(&self) -> &[&str];

    async fn invoke(&self, method: &str, params: &[Value]) -> Result<Option<Value>, MethodError>;
}

// ============================================================================
// Handling side
// ============================================================================

/// Dispatches service call requests to registered services.
pub struct ServiceCallHandler {
    local: InstanceSessionId,
    services: DashMap<String, Arc<dyn RemotableService>>,
}

impl ServiceCallHandler {
    pub fn new(local: InstanceSessionId) -> Arc<Self> {
        Arc::new(Self {
            local,
            services: DashMap::new(),
        })
    }

    pub fn register_service(&self, service: Arc<dyn RemotableService>) {
        self.services
            .insert(service.service_name().to_owned(), service);
    }

    pub fn unregister_service(&self, service_name: &str) {
        self.services.remove(service_name);
    }

    /// Handle one request addressed to this node.
    ///
    /// The method runs in its own task; a panic becomes an internal error
    /// at the handler.
    pub async fn handle(&self, request: ServiceCallRequest) -> ServiceCallResult {
        if request.target().instance_session_id() != self.local {
            return factory::represent_invalid_request_at_handler(
                &request,
                format!("request addressed to {}, but this is {}", request.target(), self.local),
            );
        }
        let service = self
            .services
            .get(request.service_name())
            .map(|entry| Arc::clone(entry.value()));
        let Some(service) = service else {
            return factory::represent_invalid_request_at_handler(&request, "no such service");
        };
        if !service
            .remote_methods()
            .iter()
            .any(|method| *method == request.method_name())
        {
            return factory::represent_invalid_request_at_handler(
                &request,
                "method is not remotely callable",
            );
        }

        let method = request.method_name().to_owned();
        let params = request.parameters().to_vec();
        let invocation = tokio::spawn(async move { service.invoke(&method, &params).await });
        match invocation.await {
            Ok(Ok(value)) => factory::wrap_return_value(value),
            Ok(Err(MethodError::Declared { type_name, message })) => {
                factory::wrap_method_exception_parts(type_name, message)
            }
            Ok(Err(MethodError::Internal(detail))) => {
                factory::represent_internal_error_at_handler(&request, detail)
            }
            Err(e) => factory::represent_internal_error_at_handler(&request, format!("method task failed: {}", e)),
        }
    }
}

#[async_trait]
impl RequestHandler for ServiceCallHandler {
    async fn handle_request(&self, request: &NetworkRequest) -> Result<Bytes, HandlerError> {
        let call = ServiceCallRequest::from_bytes(request.payload())?;
        debug!(call = %call, "Handling remote service call");
        let result = self.handle(call).await;
        Ok(Bytes::from(result.to_bytes()?))
    }
}

// ============================================================================
// Calling side
// ============================================================================

/// Performs service calls, local or remote.
pub struct RemoteServiceCaller {
    local: InstanceSessionId,
    channels: Arc<MessageChannelService>,
    local_handler: Arc<ServiceCallHandler>,
    timeout: Duration,
}

impl RemoteServiceCaller {
    pub fn new(channels: Arc<MessageChannelService>, local_handler: Arc<ServiceCallHandler>) -> Self {
        let timeout = channels.config().default_request_timeout;
        Self {
            local: channels.local_node().clone(),
            channels,
            local_handler,
            timeout,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Perform `request` and return its result. Never fails; every problem
    /// is represented in the result.
    pub async fn call(&self, request: ServiceCallRequest) -> ServiceCallResult {
        counter!("nodemesh_rpc_calls_total").increment(1);
        if request.target().instance_session_id() == self.local {
            return self.local_handler.handle(request).await;
        }

        let payload = match request.to_bytes() {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => return factory::represent_internal_error_at_sender(&request, e),
        };
        let target = request.target().instance_session_id();
        let outcome = self
            .channels
            .request(&target, MESSAGE_TYPE_RPC, payload, Some(self.timeout))
            .await;
        Self::interpret(&request, outcome)
    }

    /// Like [`call`](Self::call), delivering the result to `handler` from a
    /// runtime task instead.
    pub fn call_with_handler<F>(self: &Arc<Self>, request: ServiceCallRequest, handler: F)
    where
        F: FnOnce(ServiceCallResult) + Send + 'static,
    {
        let caller = Arc::clone(self);
        tokio::spawn(async move { handler(caller.call(request).await) });
    }

    fn interpret(request: &ServiceCallRequest, outcome: ChannelOutcome) -> ServiceCallResult {
        match outcome {
            ChannelOutcome::Response(response) if response.is_success() => {
                match ServiceCallResult::from_bytes(response.payload()) {
                    Ok(result) => result,
                    Err(e) => factory::represent_internal_error_at_sender(
                        request,
                        format!("undecodable result: {}", e),
                    ),
                }
            }
            ChannelOutcome::Response(response) => {
                let info = (!response.payload().is_empty()).then(|| &response.payload()[..]);
                factory::represent_network_error(request, response.result_code(), info)
            }
            ChannelOutcome::Failure { code, reason } => {
                debug!(call = %request, %code, %reason, "Service call failed in transport");
                factory::represent_network_error(request, code, None)
            }
        }
    }
}
