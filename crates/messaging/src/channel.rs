//! Message channels.
//!
//! A [`MessageChannel`] is one directed request/response connection from a
//! local node to a remote node. Its lifecycle is
//!
//! ```text
//! Establishing -> Established -> Closed
//!                             \-> Broken
//! ```
//!
//! `Closed` and `Broken` are terminal; a channel is never reused after
//! reaching either of them.
//!
//! # Thread Safety
//!
//! All methods take `&self` (or `&Arc<Self>`) and may be called from any
//! number of tasks at once. Every sent request has its own correlation
//! entry, and its response handler runs exactly once.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use corelib::InstanceSessionId;
use dashmap::DashMap;
use metrics::counter;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::protocol::{ChannelOutcome, NetworkRequest, ResultCode, MESSAGE_TYPE_GOODBYE};
use crate::transport::ChannelLink;

/// Lifecycle state of a [`MessageChannel`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ChannelState {
    Establishing,
    Established,
    Closed,
    Broken,
}

impl ChannelState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChannelState::Closed | ChannelState::Broken)
    }

    fn can_transition_to(&self, next: ChannelState) -> bool {
        match (self, next) {
            (ChannelState::Establishing, ChannelState::Established) => true,
            (ChannelState::Establishing | ChannelState::Established, next) => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Establishing => "ESTABLISHING",
            ChannelState::Established => "ESTABLISHED",
            ChannelState::Closed => "CLOSED",
            ChannelState::Broken => "BROKEN",
        };
        f.write_str(name)
    }
}

/// Receives the state changes of channels it was attached to.
pub trait ChannelStateObserver: Send + Sync {
    fn on_channel_state_changed(&self, channel: &Arc<MessageChannel>, state: ChannelState);
}

/// Generate a random channel id.
pub fn generate_channel_id() -> String {
    format!("{:016x}", rand::thread_rng().gen::<u64>())
}

/// One directed connection between a local and a remote node.
pub struct MessageChannel {
    channel_id: String,
    local: InstanceSessionId,
    remote: InstanceSessionId,
    initiated_by_remote: bool,
    protocol_version: u32,
    goodbye_timeout: Duration,
    link: Arc<dyn ChannelLink>,
    state: Mutex<ChannelState>,
    // id of the channel going the opposite way, for duplex pairs
    mirror_channel_id: Mutex<Option<String>>,
    simulating_breakdown: AtomicBool,
    // request id -> cancel signal of the in-flight send task
    pending: DashMap<u64, oneshot::Sender<ChannelOutcome>>,
    next_request_id: AtomicU64,
    observer: Mutex<Option<Weak<dyn ChannelStateObserver>>>,
}

impl MessageChannel {
    /// Create a channel in the `Establishing` state.
    ///
    /// # Arguments
    /// * `local` / `remote` - the two endpoints; requests flow local to remote
    /// * `initiated_by_remote` - true for the reverse half of a duplex connect
    /// * `link` - the transport half that moves the requests
    pub fn new(
        local: InstanceSessionId,
        remote: InstanceSessionId,
        initiated_by_remote: bool,
        protocol_version: u32,
        goodbye_timeout: Duration,
        link: Arc<dyn ChannelLink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            channel_id: generate_channel_id(),
            local,
            remote,
            initiated_by_remote,
            protocol_version,
            goodbye_timeout,
            link,
            state: Mutex::new(ChannelState::Establishing),
            mirror_channel_id: Mutex::new(None),
            simulating_breakdown: AtomicBool::new(false),
            pending: DashMap::new(),
            next_request_id: AtomicU64::new(1),
            observer: Mutex::new(None),
        })
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn local_node(&self) -> &InstanceSessionId {
        &self.local
    }

    pub fn remote_node(&self) -> &InstanceSessionId {
        &self.remote
    }

    pub fn is_initiated_by_remote(&self) -> bool {
        self.initiated_by_remote
    }

    pub fn protocol_version(&self) -> u32 {
        self.protocol_version
    }

    pub fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    pub fn is_established(&self) -> bool {
        self.state() == ChannelState::Established
    }

    pub fn mirror_channel_id(&self) -> Option<String> {
        self.mirror_channel_id.lock().clone()
    }

    pub fn set_mirror_channel_id(&self, mirror: impl Into<String>) {
        *self.mirror_channel_id.lock() = Some(mirror.into());
    }

    /// Number of requests waiting for their response.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// When set, closing the channel behaves like an abrupt disconnect: no
    /// goodbye is sent.
    pub fn set_simulating_breakdown(&self, value: bool) {
        self.simulating_breakdown.store(value, Ordering::SeqCst);
    }

    pub fn is_simulating_breakdown(&self) -> bool {
        self.simulating_breakdown.load(Ordering::SeqCst)
    }

    /// Attach the observer notified about state changes. Replaces any
    /// previous observer.
    pub fn set_state_observer(&self, observer: Weak<dyn ChannelStateObserver>) {
        *self.observer.lock() = Some(observer);
    }

    // ========================================================================
    // State transitions
    // ========================================================================

    /// Move from `Establishing` to `Established`.
    pub fn mark_established(self: &Arc<Self>) -> bool {
        self.transition(ChannelState::Established)
    }

    /// Mark the channel broken after a transport failure. Pending requests
    /// are resolved with `ChannelClosedOrBroken`.
    pub fn mark_broken(self: &Arc<Self>, reason: &TransportError) -> bool {
        let changed = self.transition(ChannelState::Broken);
        if changed {
            counter!("nodemesh_channels_broken_total").increment(1);
            warn!(
                channel = %self.channel_id,
                remote = %self.remote,
                error = %reason,
                "Channel broken"
            );
        }
        changed
    }

    /// Close without the goodbye handshake; used when the remote side
    /// already said goodbye.
    pub fn mark_closed_by_remote(self: &Arc<Self>) -> bool {
        let changed = self.transition(ChannelState::Closed);
        if changed {
            debug!(channel = %self.channel_id, remote = %self.remote, "Channel closed by remote side");
        }
        changed
    }

    /// Close the channel.
    ///
    /// Idempotent. Unless the channel is simulating a breakdown, a
    /// best-effort goodbye is sent to the remote side; its failure is only
    /// logged. Requests still in flight resolve with `ChannelClosedOrBroken`.
    pub async fn close(self: &Arc<Self>) {
        if !self.transition(ChannelState::Closed) {
            return;
        }
        if self.is_simulating_breakdown() {
            debug!(channel = %self.channel_id, "Closing channel without goodbye (simulated breakdown)");
            return;
        }

        let goodbye = NetworkRequest::new(
            self.next_request_id.fetch_add(1, Ordering::Relaxed),
            MESSAGE_TYPE_GOODBYE,
            self.local.clone(),
            Bytes::new(),
        );
        match tokio::time::timeout(self.goodbye_timeout, self.link.exchange(&self.channel_id, goodbye))
            .await
        {
            Ok(Ok(_)) => info!(channel = %self.channel_id, remote = %self.remote, "Channel closed"),
            Ok(Err(e)) => debug!(channel = %self.channel_id, error = %e, "Goodbye failed"),
            Err(_) => debug!(channel = %self.channel_id, "Goodbye timed out"),
        }
    }

    fn transition(self: &Arc<Self>, next: ChannelState) -> bool {
        {
            let mut state = self.state.lock();
            if !state.can_transition_to(next) {
                return false;
            }
            debug!(channel = %self.channel_id, from = %*state, to = %next, "Channel state change");
            *state = next;
        }

        if next.is_terminal() {
            self.fail_pending_requests(next);
        }
        let observer = self.observer.lock().as_ref().and_then(Weak::upgrade);
        if let Some(observer) = observer {
            observer.on_channel_state_changed(self, next);
        }
        true
    }

    fn fail_pending_requests(&self, state: ChannelState) {
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, cancel)) = self.pending.remove(&id) {
                // the send task may have finished in the meantime
                let _ = cancel.send(ChannelOutcome::failure(
                    ResultCode::ChannelClosedOrBroken,
                    format!("channel {} became {}", self.channel_id, state),
                ));
            }
        }
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Send a request without waiting for its response.
    ///
    /// `handler` is invoked exactly once, from a runtime task, with the
    /// response, a timeout, or a closed/broken channel notification. A
    /// transport failure additionally marks the channel broken.
    ///
    /// Must be called within a tokio runtime.
    pub fn send_request<F>(
        self: &Arc<Self>,
        message_type: &str,
        payload: Bytes,
        timeout: Duration,
        handler: F,
    ) where
        F: FnOnce(ChannelOutcome) + Send + 'static,
    {
        if !self.is_established() {
            let outcome = self.not_usable_outcome();
            tokio::spawn(async move { handler(outcome) });
            return;
        }

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let request = NetworkRequest::new(request_id, message_type, self.local.clone(), payload);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.pending.insert(request_id, cancel_tx);

        // a close that raced with the insert above has already drained the table
        if !self.is_established() && self.pending.remove(&request_id).is_some() {
            let outcome = self.not_usable_outcome();
            tokio::spawn(async move { handler(outcome) });
            return;
        }

        let channel = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = tokio::select! {
                result = tokio::time::timeout(timeout, channel.link.exchange(&channel.channel_id, request)) => {
                    match result {
                        Ok(Ok(response)) => ChannelOutcome::Response(response),
                        Ok(Err(e)) => {
                            channel.mark_broken(&e);
                            ChannelOutcome::failure(ResultCode::ChannelClosedOrBroken, e.to_string())
                        }
                        Err(_) => ChannelOutcome::failure(
                            ResultCode::Timeout,
                            format!("no response within {:?}", timeout),
                        ),
                    }
                }
                cancelled = cancel_rx => cancelled.unwrap_or_else(|_| {
                    ChannelOutcome::failure(ResultCode::ChannelClosedOrBroken, "request cancelled")
                }),
            };
            channel.pending.remove(&request_id);
            handler(outcome);
        });
    }

    /// Send a request and await the outcome.
    pub async fn request(
        self: &Arc<Self>,
        message_type: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> ChannelOutcome {
        let (tx, rx) = oneshot::channel();
        self.send_request(message_type, payload, timeout, move |outcome| {
            let _ = tx.send(outcome);
        });
        rx.await.unwrap_or_else(|_| {
            ChannelOutcome::failure(ResultCode::ChannelClosedOrBroken, "response handler dropped")
        })
    }

    fn not_usable_outcome(&self) -> ChannelOutcome {
        let error = TransportError::ChannelNotUsable {
            channel_id: self.channel_id.clone(),
            state: self.state().to_string(),
        };
        ChannelOutcome::failure(ResultCode::ChannelClosedOrBroken, error.to_string())
    }
}

impl fmt::Debug for MessageChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageChannel")
            .field("channel_id", &self.channel_id)
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("state", &self.state())
            .field("initiated_by_remote", &self.initiated_by_remote)
            .field("mirror_channel_id", &self.mirror_channel_id())
            .finish()
    }
}
