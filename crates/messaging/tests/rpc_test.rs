//! End-to-end service call tests over the virtual transport.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use corelib::marker::MARKER_PREFIX;
use corelib::{InstanceId, InstanceSessionId, LogicalNodeSessionId, ServiceCallRequest, ServiceCallResult};
use messaging::protocol::MESSAGE_TYPE_RPC;
use messaging::{
    ChannelServiceConfig, ContactPoint, MessageChannelService, MethodError, RemotableService,
    RemoteServiceCaller, ServiceCallHandler, VirtualNetwork, VirtualTransport,
};
use serde_json::{json, Value};

struct Calculator;

#[async_trait]
impl RemotableService for Calculator {
    fn service_name(&self) -> &str {
        "Calculator"
    }

    fn remote_methods(&self) -> &[&str] {
        &["add", "divide", "explode", "crash", "slow"]
    }

    async fn invoke(&self, method: &str, params: &[Value]) -> Result<Option<Value>, MethodError> {
        let arg = |i: usize| params.get(i).and_then(Value::as_i64).unwrap_or_default();
        match method {
            "add" => Ok(Some(json!(arg(0) + arg(1)))),
            "divide" if arg(1) == 0 => Err(MethodError::Declared {
                type_name: "DivisionByZero".into(),
                message: "cannot divide by zero".into(),
            }),
            "divide" => Ok(Some(json!(arg(0) / arg(1)))),
            "crash" => Err(MethodError::Internal("invariant violated at 0xdeadbeef".into())),
            "explode" => panic!("boom"),
            "slow" => {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(None)
            }
            // not on the allow-list; never reached remotely
            _ => Ok(Some(json!("internal"))),
        }
    }
}

struct Node {
    channels: Arc<MessageChannelService>,
    caller: Arc<RemoteServiceCaller>,
}

impl Node {
    fn id(&self) -> LogicalNodeSessionId {
        self.channels.local_node().default_logical_node_session_id()
    }

    fn request(&self, target: &Node, method: &str, params: Vec<Value>) -> ServiceCallRequest {
        ServiceCallRequest::builder()
            .target(target.id())
            .caller(self.id())
            .service("Calculator")
            .method(method)
            .params(params)
            .build()
            .unwrap()
    }
}

async fn start_node(network: &Arc<VirtualNetwork>, address: &str, timeout: Duration) -> Node {
    let session = InstanceSessionId::new(&InstanceId::generate(), 1).unwrap();
    let channels = MessageChannelService::new(
        session.clone(),
        ChannelServiceConfig::default().with_request_timeout(timeout),
    );
    channels.add_transport(Arc::new(VirtualTransport::new(Arc::clone(network))));
    channels
        .start_server(&ContactPoint::new("virtual", address))
        .await
        .unwrap();

    let handler = ServiceCallHandler::new(session);
    handler.register_service(Arc::new(Calculator));
    channels.register_request_handler(MESSAGE_TYPE_RPC, handler.clone());
    let caller = Arc::new(RemoteServiceCaller::new(Arc::clone(&channels), handler));
    Node { channels, caller }
}

async fn connected_pair() -> (Node, Node) {
    let network = VirtualNetwork::new();
    let a = start_node(&network, "a", Duration::from_secs(5)).await;
    let b = start_node(&network, "b", Duration::from_secs(5)).await;
    a.channels
        .connect(&ContactPoint::new("virtual", "b"), true)
        .await
        .unwrap();
    (a, b)
}

fn failure_message(result: &ServiceCallResult) -> &str {
    result
        .remote_operation_message()
        .unwrap_or_else(|| panic!("expected a remote operation failure, got {:?}", result))
}

#[tokio::test]
async fn test_remote_success() {
    let (a, b) = connected_pair().await;
    let result = a.caller.call(a.request(&b, "add", vec![json!(2), json!(40)])).await;
    assert!(result.is_success());
    assert_eq!(result.decode_return_value::<i64>().unwrap(), Some(42));

    // the reverse channel carries calls the other way
    let result = b.caller.call(b.request(&a, "add", vec![json!(1), json!(1)])).await;
    assert_eq!(result.return_value(), Some(&json!(2)));
}

#[tokio::test]
async fn test_remote_method_exception() {
    let (a, b) = connected_pair().await;
    let result = a.caller.call(a.request(&b, "divide", vec![json!(1), json!(0)])).await;
    assert!(!result.is_success());
    assert_eq!(result.method_exception_type(), Some("DivisionByZero"));
    assert_eq!(result.method_exception_message(), Some("cannot divide by zero"));
    assert_eq!(result.remote_operation_message(), None);
}

#[tokio::test]
async fn test_internal_errors_are_masked() {
    let (a, b) = connected_pair().await;

    let result = a.caller.call(a.request(&b, "crash", vec![])).await;
    let message = failure_message(&result);
    assert!(message.contains(MARKER_PREFIX));
    assert!(!message.contains("0xdeadbeef"));

    let result = a.caller.call(a.request(&b, "explode", vec![])).await;
    let message = failure_message(&result);
    assert!(message.contains(MARKER_PREFIX));
    assert!(!message.contains("boom"));
}

#[tokio::test]
async fn test_refused_requests() {
    let (a, b) = connected_pair().await;

    let hidden = a.request(&b, "internalOnly", vec![]);
    let result = a.caller.call(hidden).await;
    assert!(failure_message(&result).contains("refused"));

    let unknown_service = ServiceCallRequest::builder()
        .target(b.id())
        .caller(a.id())
        .service("Nope")
        .method("add")
        .build()
        .unwrap();
    let result = a.caller.call(unknown_service).await;
    assert!(failure_message(&result).contains("refused"));
}

#[tokio::test]
async fn test_no_route_and_stale_session() {
    let network = VirtualNetwork::new();
    let a = start_node(&network, "a", Duration::from_secs(5)).await;
    let b = start_node(&network, "b", Duration::from_secs(5)).await;

    // no channel yet
    let result = a.caller.call(a.request(&b, "add", vec![])).await;
    let message = failure_message(&result);
    assert!(message.contains("NoRouteToDestination"));
    assert!(message.contains(b.id().as_str()));

    // a later session of b is a different destination
    a.channels
        .connect(&ContactPoint::new("virtual", "b"), true)
        .await
        .unwrap();
    let later = b
        .channels
        .local_node()
        .next_session()
        .unwrap()
        .default_logical_node_session_id();
    let request = ServiceCallRequest::builder()
        .target(later)
        .caller(a.id())
        .service("Calculator")
        .method("add")
        .build()
        .unwrap();
    assert!(failure_message(&a.caller.call(request).await).contains("NoRouteToDestination"));
}

#[tokio::test]
async fn test_timeout_becomes_failure() {
    let network = VirtualNetwork::new();
    let a = start_node(&network, "a", Duration::from_millis(50)).await;
    let b = start_node(&network, "b", Duration::from_millis(50)).await;
    a.channels
        .connect(&ContactPoint::new("virtual", "b"), true)
        .await
        .unwrap();

    let result = a.caller.call(a.request(&b, "slow", vec![])).await;
    assert!(failure_message(&result).contains("Timeout"));
}

#[tokio::test]
async fn test_local_target_is_dispatched_in_process() {
    let network = VirtualNetwork::new();
    let a = start_node(&network, "a", Duration::from_secs(5)).await;
    let result = a.caller.call(a.request(&a, "add", vec![json!(3), json!(4)])).await;
    assert_eq!(result.return_value(), Some(&json!(7)));
}

#[tokio::test]
async fn test_call_with_handler() {
    let (a, b) = connected_pair().await;
    let (tx, rx) = tokio::sync::oneshot::channel();
    a.caller
        .call_with_handler(a.request(&b, "add", vec![json!(5), json!(5)]), move |result| {
            let _ = tx.send(result);
        });
    let result = rx.await.unwrap();
    assert_eq!(result.return_value(), Some(&json!(10)));
}
