//! Integration tests for channels over the virtual transport.
//!
//! # Test Strategy
//!
//! 1. **Connect**: duplex pairs, cross-linked mirror ids, refused connects
//! 2. **Close**: goodbye closes the mirror, simulated breakdown does not
//! 3. **Failure**: a vanished server breaks the channel on next use
//! 4. **Dispatch**: missing handlers and failing handlers produce error codes

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use corelib::rpc::ErrorInfo;
use corelib::{InstanceId, InstanceSessionId};
use messaging::service::HandlerError;
use messaging::{
    ChannelLifecycleListener, ChannelServiceConfig, ChannelState, ContactPoint, MessageChannel,
    MessageChannelService, NetworkRequest, RequestHandler, ResultCode, TransportError,
    VirtualNetwork, VirtualTransport,
};

fn contact(address: &str) -> ContactPoint {
    ContactPoint::new("virtual", address)
}

fn node(network: &Arc<VirtualNetwork>, config: ChannelServiceConfig) -> Arc<MessageChannelService> {
    let session = InstanceSessionId::new(&InstanceId::generate(), 1).unwrap();
    let service = MessageChannelService::new(session, config);
    service.add_transport(Arc::new(VirtualTransport::new(Arc::clone(network))));
    service
}

async fn server(network: &Arc<VirtualNetwork>, address: &str) -> Arc<MessageChannelService> {
    let service = node(network, ChannelServiceConfig::default());
    service.start_server(&contact(address)).await.unwrap();
    service
}

#[derive(Default)]
struct CountingListener {
    established: AtomicUsize,
    closed: AtomicUsize,
    broken: AtomicUsize,
}

impl ChannelLifecycleListener for CountingListener {
    fn on_outgoing_channel_established(&self, _channel: &Arc<MessageChannel>) {
        self.established.fetch_add(1, Ordering::SeqCst);
    }

    fn on_outgoing_channel_closed(&self, _channel: &Arc<MessageChannel>) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_outgoing_channel_broken(&self, _channel: &Arc<MessageChannel>) {
        self.broken.fetch_add(1, Ordering::SeqCst);
    }
}

struct EchoHandler;

#[async_trait]
impl RequestHandler for EchoHandler {
    async fn handle_request(&self, request: &NetworkRequest) -> Result<Bytes, HandlerError> {
        Ok(request.payload().clone())
    }
}

struct FailingHandler;

#[async_trait]
impl RequestHandler for FailingHandler {
    async fn handle_request(&self, _request: &NetworkRequest) -> Result<Bytes, HandlerError> {
        Err("disk full".into())
    }
}

// ============================================================================
// Connect
// ============================================================================

#[tokio::test]
async fn test_duplex_connect_cross_links_mirrors() {
    let network = VirtualNetwork::new();
    let a = server(&network, "a").await;
    let b = server(&network, "b").await;

    let outgoing = a.connect(&contact("b"), true).await.unwrap();
    assert_eq!(outgoing.state(), ChannelState::Established);
    assert_eq!(outgoing.remote_node(), b.local_node());
    assert!(!outgoing.is_initiated_by_remote());

    let reverse = b.channel_to(a.local_node()).expect("reverse channel");
    assert!(reverse.is_initiated_by_remote());
    assert_eq!(reverse.mirror_channel_id().as_deref(), Some(outgoing.channel_id()));
    assert_eq!(outgoing.mirror_channel_id().as_deref(), Some(reverse.channel_id()));
    assert_eq!(a.connected_nodes(), vec![b.local_node().clone()]);
}

#[tokio::test]
async fn test_simplex_connect_has_no_mirror() {
    let network = VirtualNetwork::new();
    let a = server(&network, "a").await;
    let b = server(&network, "b").await;

    let outgoing = a.connect(&contact("b"), false).await.unwrap();
    assert_eq!(outgoing.mirror_channel_id(), None);
    assert!(b.channel_to(a.local_node()).is_none());
}

#[tokio::test]
async fn test_connect_failures() {
    let network = VirtualNetwork::new();
    let _b = server(&network, "b").await;
    let a = node(&network, ChannelServiceConfig::default());

    assert!(matches!(
        a.connect(&contact("nowhere"), true).await,
        Err(TransportError::ConnectionRefused(_))
    ));
    assert!(matches!(
        a.connect(&ContactPoint::new("tcp", "b"), true).await,
        Err(TransportError::UnknownTransport(_))
    ));

    let newer = node(&network, ChannelServiceConfig::default().with_protocol_version(2));
    assert!(matches!(
        newer.connect(&contact("b"), true).await,
        Err(TransportError::ProtocolMismatch { local: 2, remote: 1 })
    ));
}

// ============================================================================
// Close
// ============================================================================

#[tokio::test]
async fn test_graceful_close_closes_mirror() {
    let network = VirtualNetwork::new();
    let a = server(&network, "a").await;
    let b = server(&network, "b").await;
    let listener = Arc::new(CountingListener::default());
    b.add_lifecycle_listener(listener.clone());

    let outgoing = a.connect(&contact("b"), true).await.unwrap();
    assert_eq!(listener.established.load(Ordering::SeqCst), 1);

    outgoing.close().await;
    assert_eq!(outgoing.state(), ChannelState::Closed);
    // the goodbye has been answered, so the mirror is gone already
    assert!(b.channel_to(a.local_node()).is_none());
    assert_eq!(listener.closed.load(Ordering::SeqCst), 1);
    assert!(a.outgoing_channels().is_empty());
}

#[tokio::test]
async fn test_simulated_breakdown_leaves_mirror_open() {
    let network = VirtualNetwork::new();
    let a = server(&network, "a").await;
    let b = server(&network, "b").await;

    let outgoing = a.connect(&contact("b"), true).await.unwrap();
    outgoing.set_simulating_breakdown(true);
    outgoing.close().await;

    assert_eq!(outgoing.state(), ChannelState::Closed);
    let reverse = b.channel_to(a.local_node()).expect("mirror stays open");
    assert_eq!(reverse.state(), ChannelState::Established);
}

#[tokio::test]
async fn test_close_all_is_idempotent() {
    let network = VirtualNetwork::new();
    let a = server(&network, "a").await;
    let _b = server(&network, "b").await;
    let _c = server(&network, "c").await;

    a.connect(&contact("b"), true).await.unwrap();
    a.connect(&contact("c"), true).await.unwrap();
    assert_eq!(a.outgoing_channels().len(), 2);

    a.close_all().await;
    a.close_all().await;
    assert!(a.outgoing_channels().is_empty());
}

// ============================================================================
// Failure
// ============================================================================

#[tokio::test]
async fn test_stopped_server_breaks_channel() {
    let network = VirtualNetwork::new();
    let a = server(&network, "a").await;
    let b = server(&network, "b").await;
    b.register_request_handler("echo", Arc::new(EchoHandler));
    let listener = Arc::new(CountingListener::default());
    a.add_lifecycle_listener(listener.clone());

    let outgoing = a.connect(&contact("b"), true).await.unwrap();
    let outcome = outgoing
        .request("echo", Bytes::from_static(b"hi"), Duration::from_secs(1))
        .await;
    assert!(outcome.is_success());

    b.stop_server(&contact("b")).await.unwrap();
    let outcome = outgoing
        .request("echo", Bytes::from_static(b"hi"), Duration::from_secs(1))
        .await;
    assert_eq!(outcome.result_code(), ResultCode::ChannelClosedOrBroken);
    assert_eq!(outgoing.state(), ChannelState::Broken);
    assert_eq!(listener.broken.load(Ordering::SeqCst), 1);

    // sending by node id now finds no route
    let outcome = a
        .request(b.local_node(), "echo", Bytes::new(), None)
        .await;
    assert_eq!(outcome.result_code(), ResultCode::NoRouteToDestination);
}

#[tokio::test]
async fn test_send_request_handler_runs_once() {
    let network = VirtualNetwork::new();
    let a = server(&network, "a").await;
    let b = server(&network, "b").await;
    b.register_request_handler("echo", Arc::new(EchoHandler));
    a.connect(&contact("b"), true).await.unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = tokio::sync::oneshot::channel();
    let counter = Arc::clone(&calls);
    a.send_request(b.local_node(), "echo", Bytes::from_static(b"x"), None, move |outcome| {
        counter.fetch_add(1, Ordering::SeqCst);
        let _ = tx.send(outcome);
    });
    let outcome = rx.await.unwrap();
    assert_eq!(outcome.success_payload(), Some(&Bytes::from_static(b"x")));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// ============================================================================
// Dispatch
// ============================================================================

#[tokio::test]
async fn test_missing_handler() {
    let network = VirtualNetwork::new();
    let a = server(&network, "a").await;
    let b = server(&network, "b").await;
    a.connect(&contact("b"), true).await.unwrap();

    let outcome = a.request(b.local_node(), "unknown", Bytes::new(), None).await;
    assert_eq!(outcome.result_code(), ResultCode::NoHandlerForMessageType);
}

#[tokio::test]
async fn test_failing_handler_reports_marker() {
    let network = VirtualNetwork::new();
    let a = server(&network, "a").await;
    let b = server(&network, "b").await;
    b.register_request_handler("store", Arc::new(FailingHandler));
    a.connect(&contact("b"), true).await.unwrap();

    let outcome = a.request(b.local_node(), "store", Bytes::new(), None).await;
    assert_eq!(outcome.result_code(), ResultCode::ExceptionAtDestination);
    let messaging::ChannelOutcome::Response(response) = outcome else {
        panic!("expected a response");
    };
    let info = ErrorInfo::decode(response.payload()).unwrap();
    assert_eq!(info.reporting_node.as_ref(), Some(b.local_node()));
    assert!(info.marker.is_some());
    // the handler's error text stays at the handling node
    assert!(!String::from_utf8_lossy(response.payload()).contains("disk full"));
}
