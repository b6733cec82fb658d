//! The broadcast relay hub.
//!
//! The hub owns the client set and serializes every mutation and every
//! broadcast fan-out into a single total order. External callers submit
//! commands through a [`HubHandle`]; the hub's control loop drains them one
//! at a time, so no two operations ever race on the set and a broadcast
//! always sees the membership as of the moment it was dequeued.

use crate::client::{Client, ClientId};
use relaycast_protocol::Envelope;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, trace, warn};

/// Default capacity of the command queue.
///
/// Submission blocks when the queue is full, backpressuring all callers
/// until the control loop catches up.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Hub errors.
#[derive(Debug, Error)]
pub enum HubError {
    /// The control loop has exited; the command was not accepted.
    #[error("Hub is stopped")]
    Stopped,
}

/// A command submitted to the control loop.
enum Command<T> {
    Register(Arc<dyn Client<T>>),
    Unregister(Arc<dyn Client<T>>),
    Broadcast {
        message: Envelope<T>,
        sender: Arc<dyn Client<T>>,
    },
    Stop,
}

/// The client set, shared between the control loop and diagnostics.
///
/// The write side is only ever taken by the control loop; handles take the
/// read side for [`HubHandle::client_count`].
type ClientSet<T> = Arc<RwLock<HashMap<ClientId, Arc<dyn Client<T>>>>>;

/// The relay hub: the consuming end of the command queue plus the client
/// set it exclusively mutates.
///
/// Create one with [`Hub::new`], spawn [`Hub::run`] before submitting
/// anything, and drive it through the returned [`HubHandle`].
pub struct Hub<T> {
    clients: ClientSet<T>,
    commands: mpsc::Receiver<Command<T>>,
    evictions: Arc<AtomicU64>,
}

/// Cloneable submitter for hub commands.
pub struct HubHandle<T> {
    clients: ClientSet<T>,
    commands: mpsc::Sender<Command<T>>,
    evictions: Arc<AtomicU64>,
}

impl<T> Clone for HubHandle<T> {
    fn clone(&self) -> Self {
        Self {
            clients: Arc::clone(&self.clients),
            commands: self.commands.clone(),
            evictions: Arc::clone(&self.evictions),
        }
    }
}

impl<T: Clone + Send + 'static> Hub<T> {
    /// Create a hub with the default queue capacity.
    #[must_use]
    pub fn new() -> (Self, HubHandle<T>) {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Create a hub with a specific command queue capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> (Self, HubHandle<T>) {
        let (tx, rx) = mpsc::channel(capacity);
        let clients: ClientSet<T> = Arc::new(RwLock::new(HashMap::new()));
        let evictions = Arc::new(AtomicU64::new(0));

        let hub = Self {
            clients: Arc::clone(&clients),
            commands: rx,
            evictions: Arc::clone(&evictions),
        };
        let handle = HubHandle {
            clients,
            commands: tx,
            evictions,
        };
        (hub, handle)
    }

    /// Run the control loop until [`HubHandle::stop`] is called or every
    /// handle is dropped.
    pub async fn run(mut self) {
        info!("Hub started");

        while let Some(command) = self.commands.recv().await {
            match command {
                Command::Register(client) => self.register(client).await,
                Command::Unregister(client) => self.unregister(client).await,
                Command::Broadcast { message, sender } => self.broadcast(message, sender).await,
                Command::Stop => break,
            }
        }

        info!("Hub stopped");
    }

    /// Add a client to the set.
    ///
    /// A handle that is already a member is re-inserted without effect; two
    /// distinct handles for the same endpoint are both kept.
    async fn register(&mut self, client: Arc<dyn Client<T>>) {
        let id = client.id();
        let mut clients = self.clients.write().await;
        clients.insert(id, client);
        debug!(client = %id, clients = clients.len(), "Client registered");
    }

    /// Remove a client from the set and tear it down.
    ///
    /// No-op if the client is not a member, so a second unregister of the
    /// same handle never closes it twice.
    async fn unregister(&mut self, client: Arc<dyn Client<T>>) {
        let id = client.id();
        let removed = {
            let mut clients = self.clients.write().await;
            let removed = clients.remove(&id).is_some();
            if removed {
                debug!(client = %id, clients = clients.len(), "Client unregistered");
            }
            removed
        };

        if removed {
            if let Err(e) = client.close().await {
                debug!(client = %id, error = %e, "Close failed during unregister");
            }
        }
    }

    /// Fan an update out to every member except the sender.
    ///
    /// Recipients get a derived envelope with the same content and the
    /// `sync` kind. A recipient whose send fails is closed and evicted
    /// within this same pass; delivery to the rest continues.
    async fn broadcast(&mut self, message: Envelope<T>, sender: Arc<dyn Client<T>>) {
        let outbound = message.into_sync();

        // Snapshot the membership. Insertions are serialized behind this
        // command, so the snapshot is complete as of dequeue time.
        let recipients: Vec<Arc<dyn Client<T>>> = {
            let clients = self.clients.read().await;
            clients
                .values()
                .filter(|client| !client.identity_eq(sender.as_ref()))
                .cloned()
                .collect()
        };

        trace!(sender = %sender.id(), recipients = recipients.len(), "Broadcasting");

        let mut dead = Vec::new();
        for client in recipients {
            if let Err(e) = client.send(outbound.clone()).await {
                warn!(client = %client.id(), error = %e, "Send failed, evicting client");
                if let Err(e) = client.close().await {
                    debug!(client = %client.id(), error = %e, "Close failed during eviction");
                }
                dead.push(client.id());
            }
        }

        if !dead.is_empty() {
            self.evictions
                .fetch_add(dead.len() as u64, Ordering::Relaxed);
            let mut clients = self.clients.write().await;
            for id in dead {
                clients.remove(&id);
            }
        }
    }
}

impl<T: Clone + Send + 'static> HubHandle<T> {
    /// Submit a registration.
    ///
    /// Blocks until the control loop accepts the command into its queue; it
    /// does not wait for the registration to take effect.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Stopped`] if the control loop has exited.
    pub async fn register(&self, client: Arc<dyn Client<T>>) -> Result<(), HubError> {
        self.submit(Command::Register(client)).await
    }

    /// Submit an unregistration.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Stopped`] if the control loop has exited.
    pub async fn unregister(&self, client: Arc<dyn Client<T>>) -> Result<(), HubError> {
        self.submit(Command::Unregister(client)).await
    }

    /// Submit a broadcast of `message` on behalf of `sender`.
    ///
    /// Every registered client except the sender receives the message as a
    /// `sync`. Per-recipient failures are absorbed by the hub and never
    /// surface here.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Stopped`] if the control loop has exited.
    pub async fn broadcast(
        &self,
        message: Envelope<T>,
        sender: Arc<dyn Client<T>>,
    ) -> Result<(), HubError> {
        self.submit(Command::Broadcast { message, sender }).await
    }

    /// Stop the control loop.
    ///
    /// Stop is serialized like any other command: commands accepted before
    /// it are applied first. Submissions racing with stop may be accepted
    /// into the queue and then dropped unprocessed; submissions after the
    /// loop exits fail with [`HubError::Stopped`].
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Stopped`] if the control loop already exited.
    pub async fn stop(&self) -> Result<(), HubError> {
        self.submit(Command::Stop).await
    }

    /// Current number of registered clients, for diagnostics.
    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Total number of clients evicted after a failed send, for diagnostics.
    pub fn eviction_count(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    async fn submit(&self, command: Command<T>) -> Result<(), HubError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| HubError::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientError, ClientId};
    use async_trait::async_trait;
    use relaycast_protocol::MessageKind;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::task::JoinHandle;

    /// Scripted client that records deliveries and can be told to fail.
    struct MockClient {
        id: ClientId,
        received: Mutex<Vec<Envelope<serde_json::Value>>>,
        fail_sends: AtomicBool,
        close_calls: AtomicUsize,
    }

    impl MockClient {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                id: ClientId::generate(),
                received: Mutex::new(Vec::new()),
                fail_sends: AtomicBool::new(false),
                close_calls: AtomicUsize::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            let client = Self::new();
            client.fail_sends.store(true, Ordering::SeqCst);
            client
        }

        fn received(&self) -> Vec<Envelope<serde_json::Value>> {
            self.received.lock().unwrap().clone()
        }

        fn close_calls(&self) -> usize {
            self.close_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Client<serde_json::Value> for MockClient {
        fn id(&self) -> ClientId {
            self.id
        }

        async fn send(&self, message: Envelope<serde_json::Value>) -> Result<(), ClientError> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(ClientError::SendFailed("scripted failure".into()));
            }
            self.received.lock().unwrap().push(message);
            Ok(())
        }

        async fn close(&self) -> Result<(), ClientError> {
            self.close_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn spawn_hub() -> (HubHandle<serde_json::Value>, JoinHandle<()>) {
        let (hub, handle) = Hub::new();
        let task = tokio::spawn(hub.run());
        (handle, task)
    }

    /// Stop the hub and wait for the loop to drain. Commands submitted
    /// before this are guaranteed applied once it returns.
    async fn drain(handle: &HubHandle<serde_json::Value>, task: JoinHandle<()>) {
        handle.stop().await.unwrap();
        task.await.unwrap();
    }

    fn update(json: serde_json::Value) -> Envelope<serde_json::Value> {
        Envelope::update(json)
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_but_sender() {
        let (handle, task) = spawn_hub();
        let (a, b, c) = (MockClient::new(), MockClient::new(), MockClient::new());

        handle.register(a.clone()).await.unwrap();
        handle.register(b.clone()).await.unwrap();
        handle.register(c.clone()).await.unwrap();
        handle
            .broadcast(update(serde_json::json!({"key": "value"})), a.clone())
            .await
            .unwrap();
        drain(&handle, task).await;

        for receiver in [&b, &c] {
            let received = receiver.received();
            assert_eq!(received.len(), 1);
            assert_eq!(received[0].kind, MessageKind::Sync);
            assert_eq!(received[0].content, serde_json::json!({"key": "value"}));
        }
        assert!(a.received().is_empty());
    }

    #[tokio::test]
    async fn test_unregistered_client_receives_nothing() {
        let (handle, task) = spawn_hub();
        let (a, b) = (MockClient::new(), MockClient::new());

        handle.register(a.clone()).await.unwrap();
        handle.register(b.clone()).await.unwrap();
        handle.unregister(a.clone()).await.unwrap();
        handle
            .broadcast(update(serde_json::json!("later")), b.clone())
            .await
            .unwrap();
        drain(&handle, task).await;

        assert!(a.received().is_empty());
        assert!(b.received().is_empty());
        // Closed once, at unregistration time.
        assert_eq!(a.close_calls(), 1);
        assert_eq!(b.close_calls(), 0);
    }

    #[tokio::test]
    async fn test_never_registered_client_receives_nothing() {
        let (handle, task) = spawn_hub();
        let (a, stranger) = (MockClient::new(), MockClient::new());

        handle.register(a.clone()).await.unwrap();
        for _ in 0..3 {
            handle
                .broadcast(update(serde_json::json!(1)), a.clone())
                .await
                .unwrap();
        }
        drain(&handle, task).await;

        assert!(stranger.received().is_empty());
    }

    #[tokio::test]
    async fn test_send_failure_evicts_and_closes_once() {
        let (handle, task) = spawn_hub();
        let (a, b, c) = (MockClient::new(), MockClient::failing(), MockClient::new());

        handle.register(a.clone()).await.unwrap();
        handle.register(b.clone()).await.unwrap();
        handle.register(c.clone()).await.unwrap();
        handle
            .broadcast(update(serde_json::json!(1)), a.clone())
            .await
            .unwrap();
        handle
            .broadcast(update(serde_json::json!(2)), a.clone())
            .await
            .unwrap();
        drain(&handle, task).await;

        // The failed recipient was closed exactly once and evicted; the
        // second broadcast never attempted delivery to it.
        assert_eq!(b.close_calls(), 1);
        assert!(b.received().is_empty());
        assert_eq!(handle.eviction_count(), 1);
        // Delivery to the healthy recipient was unaffected both times.
        assert_eq!(c.received().len(), 2);
    }

    #[tokio::test]
    async fn test_distinct_handles_for_one_endpoint_are_both_kept() {
        let (handle, task) = spawn_hub();
        // Two handles standing for the same logical endpoint: identity is
        // per handle, so neither deduplicates the other.
        let (first, second) = (MockClient::new(), MockClient::new());

        handle.register(first.clone()).await.unwrap();
        handle.register(second.clone()).await.unwrap();
        handle
            .broadcast(update(serde_json::json!("from-first")), first.clone())
            .await
            .unwrap();
        handle
            .broadcast(update(serde_json::json!("from-second")), second.clone())
            .await
            .unwrap();
        drain(&handle, task).await;

        assert_eq!(handle.client_count().await, 2);
        assert_eq!(first.received().len(), 1);
        assert_eq!(first.received()[0].content, serde_json::json!("from-second"));
        assert_eq!(second.received().len(), 1);
        assert_eq!(second.received()[0].content, serde_json::json!("from-first"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_backpressures_submitters() {
        let (hub, handle) = Hub::<serde_json::Value>::with_capacity(1);
        let (a, b) = (MockClient::new(), MockClient::new());

        // The loop is not running yet, so the first submission fills the
        // queue and the second stays pending.
        handle.register(a.clone()).await.unwrap();

        let mut blocked = {
            let handle = handle.clone();
            let b = b.clone();
            tokio::spawn(async move { handle.register(b).await })
        };

        assert!(
            tokio::time::timeout(std::time::Duration::from_secs(1), &mut blocked)
                .await
                .is_err(),
            "submission completed while the queue was full"
        );

        // Once the loop starts draining, the handoff completes.
        let task = tokio::spawn(hub.run());
        blocked.await.unwrap().unwrap();
        drain(&handle, task).await;

        assert_eq!(handle.client_count().await, 2);
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let (handle, task) = spawn_hub();
        let a = MockClient::new();

        handle.register(a.clone()).await.unwrap();
        handle.unregister(a.clone()).await.unwrap();
        handle.unregister(a.clone()).await.unwrap();
        handle.unregister(a.clone()).await.unwrap();
        drain(&handle, task).await;

        assert_eq!(a.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_reregistering_same_handle_keeps_one_entry() {
        let (handle, task) = spawn_hub();
        let a = MockClient::new();

        handle.register(a.clone()).await.unwrap();
        handle.register(a.clone()).await.unwrap();
        drain(&handle, task).await;

        assert_eq!(handle.client_count().await, 1);
    }

    #[tokio::test]
    async fn test_client_count() {
        let (handle, task) = spawn_hub();
        let (a, b) = (MockClient::new(), MockClient::new());

        handle.register(a.clone()).await.unwrap();
        handle.register(b.clone()).await.unwrap();
        handle.unregister(a.clone()).await.unwrap();
        drain(&handle, task).await;

        assert_eq!(handle.client_count().await, 1);
    }

    #[tokio::test]
    async fn test_submissions_after_stop_are_rejected() {
        let (handle, task) = spawn_hub();
        let a = MockClient::new();

        drain(&handle, task).await;

        assert!(matches!(
            handle.register(a.clone()).await,
            Err(HubError::Stopped)
        ));
        assert!(matches!(
            handle.broadcast(update(serde_json::json!(1)), a.clone()).await,
            Err(HubError::Stopped)
        ));
        assert!(matches!(handle.stop().await, Err(HubError::Stopped)));
    }

    #[tokio::test]
    async fn test_broadcast_order_is_arrival_order() {
        let (handle, task) = spawn_hub();
        let (a, b) = (MockClient::new(), MockClient::new());

        handle.register(a.clone()).await.unwrap();
        handle.register(b.clone()).await.unwrap();
        for i in 0..5 {
            handle
                .broadcast(update(serde_json::json!(i)), a.clone())
                .await
                .unwrap();
        }
        drain(&handle, task).await;

        let contents: Vec<_> = b.received().into_iter().map(|e| e.content).collect();
        assert_eq!(
            contents,
            (0..5).map(|i| serde_json::json!(i)).collect::<Vec<_>>()
        );
    }
}
