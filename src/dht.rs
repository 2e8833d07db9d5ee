//! Dht node.

use std::cell::Cell;
use std::fmt::{self, Debug, Formatter};
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use flume::{Receiver, Sender, TryRecvError};
use tracing::{debug, info};

use crate::actor::config::Config;
use crate::actor::socket::{Transport, MAX_THREAD_BLOCK_DURATION};
use crate::actor::{
    to_socket_address, Actor, BootstrapOutcome, Info, OperationError, ResultSender,
};
use crate::common::{Contact, Id, RouteTableEvent};
use crate::core::lookup::{LookupOutcome, ValueOutcome};
use crate::core::routing_maintenance::MaintenanceConfig;
use crate::core::server::RequestFilter;
use crate::core::store::PutOutcome;
use crate::core::timeout::{FixedTimeout, TimeoutStrategy};
use crate::core::value_store::ValueStore;
use crate::core::OperationId;

thread_local! {
    static ACTOR_THREAD: Cell<bool> = const { Cell::new(false) };
}

#[derive(Debug, Clone)]
/// Kademlia node.
pub struct Dht {
    sender: Sender<ActorMessage>,
    operation_ids: Arc<AtomicU64>,
    bootstrap: Arc<[SocketAddr]>,
}

#[derive(Debug, Default, Clone)]
/// A builder for the [Dht] node.
pub struct DhtBuilder(Config);

impl DhtBuilder {
    /// Set bootstrapping nodes.
    pub fn bootstrap<T: ToSocketAddrs>(&mut self, bootstrap: &[T]) -> &mut Self {
        self.0.bootstrap = to_socket_address(bootstrap);

        self
    }

    /// Add more bootstrap nodes to the existing ones.
    pub fn extra_bootstrap<T: ToSocketAddrs>(&mut self, extra_bootstrap: &[T]) -> &mut Self {
        self.0.bootstrap.extend(to_socket_address(extra_bootstrap));

        self
    }

    /// Set an explicit port to listen on.
    pub fn port(&mut self, port: u16) -> &mut Self {
        self.0.port = Some(port);

        self
    }

    /// Set the address to bind the socket to.
    pub fn bind_address(&mut self, bind_address: std::net::IpAddr) -> &mut Self {
        self.0.bind_address = Some(bind_address);

        self
    }

    /// Use this id instead of a random one.
    pub fn id(&mut self, id: Id) -> &mut Self {
        self.0.id = Some(id);

        self
    }

    /// Set the bucket size, also the size of the closest set lookups converge on.
    pub fn k(&mut self, k: usize) -> &mut Self {
        self.0.routing.k = k;
        self.0.lookup.k = k;

        self
    }

    /// Set the number of parallel requests of a lookup.
    pub fn alpha(&mut self, alpha: usize) -> &mut Self {
        self.0.lookup.alpha = alpha;

        self
    }

    /// Set how many values a get collects before completing.
    pub fn value_quorum(&mut self, values: usize) -> &mut Self {
        self.0.lookup.values = values;

        self
    }

    /// Keep querying every candidate a lookup discovers.
    pub fn exhaustive_lookups(&mut self, exhaustive: bool) -> &mut Self {
        self.0.lookup.exhaustive = exhaustive;

        self
    }

    /// Pick lookup candidates at random among the closest ones.
    pub fn randomize_lookups(&mut self, randomize: bool) -> &mut Self {
        self.0.lookup.randomize = randomize;

        self
    }

    /// Probe stalled lookups every `frequency` when no response arrived for `timeout`.
    pub fn boost(&mut self, frequency: Duration, timeout: Duration) -> &mut Self {
        self.0.lookup.boost_frequency = Some(frequency);
        self.0.lookup.boost_timeout = timeout;

        self
    }

    /// Set the number of parallel STORE requests of a put.
    pub fn store_parallelism(&mut self, parallelism: usize) -> &mut Self {
        self.0.store.parallelism = parallelism;

        self
    }

    /// Set how many acknowledgements a put aims for.
    pub fn replicas(&mut self, replicas: usize) -> &mut Self {
        self.0.store.replicas = replicas;

        self
    }

    /// Set a fixed timeout for every request.
    pub fn request_timeout(&mut self, request_timeout: Duration) -> &mut Self {
        self.0.request_timeout = Arc::new(FixedTimeout(request_timeout));

        self
    }

    /// Decide each request's timeout with a custom strategy.
    pub fn timeout_strategy(&mut self, strategy: Arc<dyn TimeoutStrategy>) -> &mut Self {
        self.0.request_timeout = strategy;

        self
    }

    /// Set the deadline of user operations.
    pub fn operation_timeout(&mut self, operation_timeout: Duration) -> &mut Self {
        self.0.operation_timeout = operation_timeout;

        self
    }

    /// Set the maximum active contacts from one network in a bucket, `None` to disable
    /// the limit.
    pub fn max_same_network_contacts(&mut self, max: Option<usize>) -> &mut Self {
        self.0.routing.max_same_network_contacts = max;

        self
    }

    /// Ping the existing contact before accepting a new address for a known id.
    pub fn verify_identity(&mut self, verify_identity: bool) -> &mut Self {
        self.0.routing.verify_identity = verify_identity;

        self
    }

    /// Set the maintenance schedule.
    pub fn maintenance(&mut self, maintenance: MaintenanceConfig) -> &mut Self {
        self.0.maintenance = maintenance;

        self
    }

    /// Set the largest value accepted in a STORE request.
    pub fn max_value_size(&mut self, max_value_size: usize) -> &mut Self {
        self.0.max_value_size = max_value_size;

        self
    }

    /// Set the capacity and time to live of the default value store.
    pub fn values(&mut self, max_values: usize, ttl: Duration) -> &mut Self {
        self.0.max_values = max_values;
        self.0.value_ttl = ttl;

        self
    }

    /// Replace the default in-memory value store.
    pub fn value_store(&mut self, value_store: Arc<dyn ValueStore>) -> &mut Self {
        self.0.value_store = Some(value_store);

        self
    }

    /// Filter incoming requests before handling them.
    pub fn request_filter(&mut self, filter: Arc<dyn RequestFilter>) -> &mut Self {
        self.0.filter = filter;

        self
    }

    /// Forward stored values to newly seen contacts closer to their keys.
    pub fn store_forward(&mut self, store_forward: bool) -> &mut Self {
        self.0.store_forward = store_forward;

        self
    }

    /// Settings for a local test network: bind to localhost on any port, and accept
    /// any number of contacts from the same network.
    pub fn testnet(&mut self) -> &mut Self {
        self.0.bind_address = Some(Ipv4Addr::LOCALHOST.into());
        self.0.port = Some(0);
        self.0.routing.max_same_network_contacts = None;

        self
    }

    /// Create a Dht node.
    pub fn build(&self) -> Result<Dht, std::io::Error> {
        Dht::new(self.0.clone())
    }
}

impl Dht {
    /// Create a new Dht node.
    ///
    /// Could return an error if it failed to bind to the specified
    /// port or other io errors while binding the udp socket.
    pub fn new(config: Config) -> Result<Self, std::io::Error> {
        let actor = Actor::new(config)?;

        Self::spawn(actor)
    }

    /// Create a new Dht node over a custom [Transport].
    pub fn with_transport(
        config: Config,
        transport: Box<dyn Transport>,
    ) -> Result<Self, std::io::Error> {
        Self::spawn(Actor::with_transport(config, transport))
    }

    /// Returns a builder to edit settings before creating a Dht node.
    pub fn builder() -> DhtBuilder {
        DhtBuilder::default()
    }

    // === Getters ===

    /// Information and statistics about this [Dht] node.
    pub fn info(&self) -> Result<Info, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Info>(1);

        self.sender
            .send(ActorMessage::Info(sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    /// Turn this node's routing table to a list of bootstraping nodes.
    pub fn to_bootstrap(&self) -> Result<Vec<String>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Vec<String>>(1);

        self.sender
            .send(ActorMessage::ToBootstrap(sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    // === Public Methods ===

    /// Shutdown the actor thread loop.
    pub fn shutdown(&mut self) {
        let (sender, receiver) = flume::bounded::<()>(1);

        let _ = self.sender.send(ActorMessage::Shutdown(sender));
        let _ = receiver.recv();
    }

    /// Bootstrap from every configured bootstrap node, and wait until done.
    ///
    /// Returns true if at least one of them answered.
    pub fn bootstrapped(&self) -> bool {
        let handles = self
            .bootstrap
            .iter()
            .map(|address| self.bootstrap(*address))
            .collect::<Vec<_>>();

        handles
            .into_iter()
            .fold(false, |bootstrapped, handle| handle.wait().is_ok() || bootstrapped)
    }

    /// Receive every change to the routing table from now on.
    pub fn subscribe(&self) -> Result<Receiver<RouteTableEvent>, DhtWasShutdown> {
        let (sender, receiver) = flume::unbounded();

        self.sender
            .send(ActorMessage::Subscribe(sender))
            .map_err(|_| DhtWasShutdown)?;

        Ok(receiver)
    }

    /// Ping an address, resolving to the contact that answered.
    pub fn ping(&self, address: SocketAddr) -> OperationHandle<Contact> {
        self.operation(|id, sender| ActorMessage::Ping(id, address, sender))
    }

    /// Ping `address`, then look up this node's id through it.
    pub fn bootstrap(&self, address: SocketAddr) -> OperationHandle<BootstrapOutcome> {
        self.operation(|id, sender| ActorMessage::Bootstrap(id, address, sender))
    }

    /// Find the closest nodes to `target`.
    pub fn lookup(&self, target: Id) -> OperationHandle<LookupOutcome> {
        self.operation(|id, sender| ActorMessage::Lookup(id, target, sender))
    }

    /// Find values stored under `key`.
    pub fn get(&self, key: Id) -> OperationHandle<ValueOutcome> {
        self.operation(|id, sender| ActorMessage::Get(id, key, sender))
    }

    /// Store `value` under `key` at the closest nodes to `key`.
    pub fn put(&self, key: Id, value: &[u8]) -> OperationHandle<PutOutcome> {
        let value: Box<[u8]> = value.into();

        self.operation(|id, sender| ActorMessage::Put(id, key, value, sender))
    }

    // === Private Methods ===

    #[cfg(feature = "async")]
    pub(crate) fn send(&self, message: ActorMessage) -> Result<(), flume::SendError<ActorMessage>> {
        self.sender.send(message)
    }

    #[cfg(feature = "async")]
    pub(crate) fn bootstrap_addresses(&self) -> &[SocketAddr] {
        &self.bootstrap
    }

    fn spawn(actor: Actor) -> Result<Self, std::io::Error> {
        let (sender, receiver) = flume::unbounded();

        let dht = Dht {
            sender,
            operation_ids: actor.operation_ids(),
            bootstrap: actor.bootstrap().into(),
        };

        let name = format!("kadnode-{}", actor.local_addr());

        thread::Builder::new()
            .name(name)
            .spawn(move || run(actor, receiver))?;

        Ok(dht)
    }

    fn operation<T>(
        &self,
        message: impl FnOnce(OperationId, ResultSender<T>) -> ActorMessage,
    ) -> OperationHandle<T> {
        let id = OperationId(self.operation_ids.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = flume::bounded(1);

        // If the actor is gone, the sender is dropped and the handle reports a shutdown.
        let _ = self.sender.send(message(id, sender));

        OperationHandle {
            id,
            receiver,
            actor: self.sender.clone(),
            started_at: Instant::now(),
            finished: false,
        }
    }
}

fn run(mut actor: Actor, receiver: Receiver<ActorMessage>) {
    ACTOR_THREAD.with(|flag| flag.set(true));

    let mut backoff = Duration::ZERO;

    loop {
        let busy = match receiver.try_recv() {
            Ok(ActorMessage::Shutdown(sender)) => {
                drop(receiver);
                let _ = sender.send(());
                break;
            }
            Ok(message) => {
                handle_actor_message(&mut actor, message);
                true
            }
            Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => false,
        };

        let received = actor.tick();

        if busy || received {
            backoff = Duration::ZERO;
        } else {
            backoff = (backoff + Duration::from_millis(1)).min(MAX_THREAD_BLOCK_DURATION);
            thread::sleep(backoff);
        }
    }

    info!(id = ?actor.id(), "Dht actor thread stopped");
}

fn handle_actor_message(actor: &mut Actor, message: ActorMessage) {
    match message {
        ActorMessage::Info(sender) => {
            let _ = sender.send(actor.info());
        }
        ActorMessage::ToBootstrap(sender) => {
            let _ = sender.send(actor.to_bootstrap());
        }
        ActorMessage::Subscribe(sender) => actor.subscribe(sender),
        ActorMessage::Ping(id, address, sender) => actor.ping(id, address, sender),
        ActorMessage::Bootstrap(id, address, sender) => {
            actor.bootstrap_from(id, address, Some(sender))
        }
        ActorMessage::Lookup(id, target, sender) => actor.lookup(id, target, Some(sender)),
        ActorMessage::Get(id, key, sender) => actor.get(id, key, sender),
        ActorMessage::Put(id, key, value, sender) => actor.put(id, key, value, sender),
        ActorMessage::Cancel(id) => actor.cancel(id),
        // Handled by the run loop.
        ActorMessage::Shutdown(_) => {}
    }
}

pub(crate) enum ActorMessage {
    Info(Sender<Info>),
    ToBootstrap(Sender<Vec<String>>),
    Subscribe(Sender<RouteTableEvent>),
    Ping(OperationId, SocketAddr, ResultSender<Contact>),
    Bootstrap(OperationId, SocketAddr, ResultSender<BootstrapOutcome>),
    Lookup(OperationId, Id, ResultSender<LookupOutcome>),
    Get(OperationId, Id, ResultSender<ValueOutcome>),
    Put(OperationId, Id, Box<[u8]>, ResultSender<PutOutcome>),
    Cancel(OperationId),
    Shutdown(Sender<()>),
}

impl Debug for ActorMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ActorMessage::Info(_) => write!(f, "Info"),
            ActorMessage::ToBootstrap(_) => write!(f, "ToBootstrap"),
            ActorMessage::Subscribe(_) => write!(f, "Subscribe"),
            ActorMessage::Ping(id, address, _) => write!(f, "Ping({id}, {address})"),
            ActorMessage::Bootstrap(id, address, _) => write!(f, "Bootstrap({id}, {address})"),
            ActorMessage::Lookup(id, target, _) => write!(f, "Lookup({id}, {target})"),
            ActorMessage::Get(id, key, _) => write!(f, "Get({id}, {key})"),
            ActorMessage::Put(id, key, value, _) => {
                write!(f, "Put({id}, {key}, {} bytes)", value.len())
            }
            ActorMessage::Cancel(id) => write!(f, "Cancel({id})"),
            ActorMessage::Shutdown(_) => write!(f, "Shutdown"),
        }
    }
}

/// A pending operation started on a [Dht] node.
///
/// Dropping the handle before the operation completes cancels it, unless it was
/// [detached](OperationHandle::detach).
#[derive(Debug)]
pub struct OperationHandle<T> {
    id: OperationId,
    receiver: Receiver<Result<T, OperationError>>,
    actor: Sender<ActorMessage>,
    started_at: Instant,
    finished: bool,
}

impl<T> OperationHandle<T> {
    // === Getters ===

    pub fn id(&self) -> OperationId {
        self.id
    }

    /// When the operation was started.
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    // === Public Methods ===

    /// Block until the operation completes.
    ///
    /// Returns [OperationError::WaitFromActorThread] if called from inside the node's actor
    /// thread, for example from a custom [ValueStore].
    pub fn wait(mut self) -> Result<T, OperationError> {
        if ACTOR_THREAD.with(Cell::get) {
            return Err(OperationError::WaitFromActorThread);
        }

        self.finished = true;

        self.receiver
            .recv()
            .unwrap_or(Err(OperationError::Shutdown))
    }

    /// Block until the operation completes, or `timeout` elapses.
    ///
    /// Returns `None` on timeout, the handle remains usable.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<Result<T, OperationError>> {
        if ACTOR_THREAD.with(Cell::get) {
            return Some(Err(OperationError::WaitFromActorThread));
        }

        match self.receiver.recv_timeout(timeout) {
            Ok(result) => {
                self.finished = true;
                Some(result)
            }
            Err(flume::RecvTimeoutError::Timeout) => None,
            Err(flume::RecvTimeoutError::Disconnected) => {
                self.finished = true;
                Some(Err(OperationError::Shutdown))
            }
        }
    }

    /// Returns the result if the operation already completed, without blocking.
    pub fn try_result(&mut self) -> Option<Result<T, OperationError>> {
        match self.receiver.try_recv() {
            Ok(result) => {
                self.finished = true;
                Some(result)
            }
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.finished = true;
                Some(Err(OperationError::Shutdown))
            }
        }
    }

    /// Cancel the operation and its pending requests.
    pub fn cancel(mut self) {
        self.finished = true;

        debug!(id = %self.id, "Cancelling operation");

        let _ = self.actor.send(ActorMessage::Cancel(self.id));
    }

    /// Let the operation run to completion without anyone waiting for it.
    pub fn detach(mut self) {
        self.finished = true;
    }

    /// Await the operation's completion.
    #[cfg(feature = "async")]
    pub async fn wait_async(mut self) -> Result<T, OperationError> {
        self.finished = true;

        self.receiver
            .recv_async()
            .await
            .unwrap_or(Err(OperationError::Shutdown))
    }
}

impl<T> Drop for OperationHandle<T> {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.actor.send(ActorMessage::Cancel(self.id));
        }
    }
}

/// Create a testnet of Dht nodes to run tests against instead of the real network.
#[derive(Debug)]
pub struct Testnet {
    pub bootstrap: Vec<String>,
    pub nodes: Vec<Dht>,
}

impl Testnet {
    /// Create `count` nodes, each bootstrapped from the first one.
    pub fn new(count: usize) -> Result<Testnet, std::io::Error> {
        let mut nodes: Vec<Dht> = vec![];
        let mut bootstrap = vec![];

        for i in 0..count {
            if i == 0 {
                let node = Dht::builder().testnet().build()?;

                let info = node.info().map_err(std::io::Error::other)?;
                bootstrap.push(info.local_addr().to_string());

                nodes.push(node)
            } else {
                let node = Dht::builder().testnet().bootstrap(&bootstrap).build()?;

                node.bootstrapped();

                nodes.push(node)
            }
        }

        Ok(Self { bootstrap, nodes })
    }
}

/// Dht Actor thread stopped.
#[derive(thiserror::Error, Debug)]
#[error("Dht actor thread was shutdown")]
pub struct DhtWasShutdown;

impl From<DhtWasShutdown> for OperationError {
    fn from(_: DhtWasShutdown) -> Self {
        OperationError::Shutdown
    }
}
