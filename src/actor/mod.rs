//! Actor implementation - I/O orchestration layer for the DHT.

pub(crate) mod config;
mod handle_request;
mod handle_response;
mod info;
pub(crate) mod socket;

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use flume::Sender;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::common::{
    Contact, Id, MessageId, MessageType, RequestSpecific, ResponseSpecific, RouteTable,
    RouteTableEvent, StoreRequestArguments,
};
use crate::core::correlator::RequestOwner;
use crate::core::lookup::{IterativeLookup, LookupConfig, LookupKind, LookupOutcome, ValueOutcome};
use crate::core::routing_maintenance::RoutingMaintenance;
use crate::core::server::Server;
use crate::core::store::{PutOutcome, StoreConfig, StoreError, StoreQuery};
use crate::core::store_forward::forward_keys;
use crate::core::value_store::MemoryValueStore;
use crate::core::OperationId;

use socket::{KrpcSocket, Transport, UdpTransport};

pub use config::Config;
pub use info::Info;

/// Why an operation completed without a result.
#[derive(Debug, Clone, Error)]
pub enum OperationError {
    #[error("No contact returned a value for the key")]
    NoSuchValue,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("No response to ping from {0}")]
    PingTimeout(SocketAddr),

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Operation did not complete before its deadline")]
    DeadlineExceeded,

    #[error("Dht was shutdown")]
    Shutdown,

    /// Waiting would block the thread that has to complete the operation.
    #[error("Can not wait on an operation from the node's own actor thread")]
    WaitFromActorThread,
}

/// Result of bootstrapping from one address.
#[derive(Debug, Clone)]
pub struct BootstrapOutcome {
    /// The bootstrap node, as it answered our ping.
    pub contact: Contact,
    /// The lookup of our own id through it.
    pub lookup: LookupOutcome,
}

pub(crate) type ResultSender<T> = Sender<Result<T, OperationError>>;

#[derive(Debug)]
struct Operation {
    deadline: Instant,
    kind: OperationKind,
}

#[derive(Debug)]
enum OperationKind {
    Ping {
        address: SocketAddr,
        sender: ResultSender<Contact>,
    },
    /// `sender` is `None` for refresh lookups.
    Lookup {
        lookup: IterativeLookup,
        sender: Option<ResultSender<LookupOutcome>>,
    },
    Get {
        lookup: IterativeLookup,
        sender: ResultSender<ValueOutcome>,
    },
    Put {
        value: Box<[u8]>,
        lookup: IterativeLookup,
        /// Set once the lookup is done.
        store: Option<(LookupOutcome, StoreQuery)>,
        sender: ResultSender<PutOutcome>,
    },
    /// Ping `address`, then look up our own id through it.
    Bootstrap {
        address: SocketAddr,
        lookup: Option<(Contact, IterativeLookup)>,
        sender: Option<ResultSender<BootstrapOutcome>>,
    },
}

/// What happened to one of an operation's requests, or [OperationEvent::Tick] for the
/// passage of time.
#[derive(Debug)]
enum OperationEvent<'a> {
    Response {
        message_id: MessageId,
        responder: Contact,
        response: &'a ResponseSpecific,
    },
    Failure {
        message_id: MessageId,
    },
    Tick,
}

impl Operation {
    fn fail(self, error: OperationError) {
        match self.kind {
            OperationKind::Ping { sender, .. } => {
                let _ = sender.send(Err(error));
            }
            OperationKind::Lookup { sender, .. } => {
                if let Some(sender) = sender {
                    let _ = sender.send(Err(error));
                }
            }
            OperationKind::Get { sender, .. } => {
                let _ = sender.send(Err(error));
            }
            OperationKind::Put { sender, .. } => {
                let _ = sender.send(Err(error));
            }
            OperationKind::Bootstrap { sender, .. } => {
                if let Some(sender) = sender {
                    let _ = sender.send(Err(error));
                }
            }
        }
    }
}

#[derive(Debug)]
/// Internal Actor called in the Dht thread loop, useful to create your own actor setup.
pub struct Actor {
    // Options
    bootstrap: Vec<SocketAddr>,
    lookup_config: LookupConfig,
    store_config: StoreConfig,
    operation_timeout: Duration,
    store_forward: bool,

    socket: KrpcSocket,

    // Routing
    routing_table: RouteTable,
    maintenance: RoutingMaintenance,

    server: Server,

    operations: HashMap<OperationId, Operation>,
    /// Shared with the handles creating operations from other threads.
    operation_ids: Arc<AtomicU64>,

    subscribers: Vec<Sender<RouteTableEvent>>,
}

impl Actor {
    /// Creates a new Actor listening on UDP. Does not perform network I/O; call
    /// [`Actor::tick`] to bootstrap and run scheduled maintenance.
    pub fn new(config: Config) -> Result<Self, std::io::Error> {
        let transport = UdpTransport::bind(config.bind_address, config.port)?;

        Ok(Self::with_transport(config, Box::new(transport)))
    }

    /// Creates a new Actor over a custom [Transport].
    pub fn with_transport(config: Config, transport: Box<dyn Transport>) -> Self {
        let id = config.id.unwrap_or_else(Id::random);
        let local_addr = transport.local_addr();

        let socket = KrpcSocket::new(transport, id, config.request_timeout.clone());
        let localhost = Contact::localhost(id, local_addr).with_instance_id(socket.instance_id());

        let values = config.value_store.clone().unwrap_or_else(|| {
            Arc::new(MemoryValueStore::new(config.max_values, config.value_ttl))
        });

        info!(?id, ?local_addr, "Node listening");

        Actor {
            bootstrap: config.bootstrap,
            lookup_config: config.lookup,
            store_config: config.store,
            operation_timeout: config.operation_timeout,
            store_forward: config.store_forward,

            socket,

            routing_table: RouteTable::new(localhost, config.routing),
            maintenance: RoutingMaintenance::new(config.maintenance),

            server: Server::new(values, config.filter, config.max_value_size),

            operations: HashMap::new(),
            operation_ids: Arc::new(AtomicU64::new(0)),

            subscribers: Vec::new(),
        }
    }

    // === Getters ===

    /// Returns the node's Id
    pub fn id(&self) -> &Id {
        self.routing_table.id()
    }

    /// Returns the address the server is listening to.
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    pub fn bootstrap(&self) -> &[SocketAddr] {
        &self.bootstrap
    }

    pub fn routing_table(&self) -> &RouteTable {
        &self.routing_table
    }

    /// Number of requests waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.socket.pending_requests()
    }

    /// Number of operations in progress, including internal ones.
    pub fn operations(&self) -> usize {
        self.operations.len()
    }

    pub fn stored_values(&self) -> usize {
        self.server.values().keys().len()
    }

    /// Source of [OperationId]s, shared with handles that start operations.
    pub fn operation_ids(&self) -> Arc<AtomicU64> {
        self.operation_ids.clone()
    }

    /// Returns a thread safe and lightweight summary of this node's
    /// information and statistics.
    pub fn info(&self) -> Info {
        Info::from(self)
    }

    /// Turn this node's routing table to a list of bootstraping nodes.
    pub fn to_bootstrap(&self) -> Vec<String> {
        self.routing_table
            .contacts()
            .map(|contact| contact.address().to_string())
            .collect()
    }

    // === Public Methods ===

    /// Advances timeouts, operations, and routing-table maintenance by one step, and
    /// handles at most one incoming message.
    ///
    /// Returns `true` if a message was received.
    pub fn tick(&mut self) -> bool {
        let now = Instant::now();

        self.expire_requests(now);
        self.enforce_deadlines(now);
        self.tick_operations(now);

        self.periodic_node_maintenance(now);

        let received = self.handle_message();

        self.process_table_updates();
        self.record_send_failures();

        received
    }

    /// Ping an address, resolving to the contact that answered.
    pub fn ping(&mut self, id: OperationId, address: SocketAddr, sender: ResultSender<Contact>) {
        let now = Instant::now();

        if self
            .socket
            .request(
                None,
                address,
                None,
                RequestOwner::Operation(id),
                RequestSpecific::Ping,
            )
            .is_none()
        {
            let _ = sender.send(Err(OperationError::PingTimeout(address)));
            return;
        }

        self.insert(id, OperationKind::Ping { address, sender }, now);
    }

    /// Start an iterative FIND_NODE lookup toward `target`.
    ///
    /// Without a sender, this is a refresh lookup whose only effect is on the routing table.
    pub fn lookup(
        &mut self,
        id: OperationId,
        target: Id,
        sender: Option<ResultSender<LookupOutcome>>,
    ) {
        let now = Instant::now();
        let lookup = self.new_lookup(target, LookupKind::FindNode, now);

        self.start(id, OperationKind::Lookup { lookup, sender }, now);
    }

    /// Start an iterative FIND_VALUE lookup for `key`.
    pub fn get(&mut self, id: OperationId, key: Id, sender: ResultSender<ValueOutcome>) {
        let now = Instant::now();
        let lookup = self.new_lookup(key, LookupKind::FindValue, now);

        self.start(id, OperationKind::Get { lookup, sender }, now);
    }

    /// Find the closest contacts to `key`, then store `value` at them.
    pub fn put(
        &mut self,
        id: OperationId,
        key: Id,
        value: Box<[u8]>,
        sender: ResultSender<PutOutcome>,
    ) {
        let now = Instant::now();
        let lookup = self.new_lookup(key, LookupKind::FindNode, now);

        self.start(
            id,
            OperationKind::Put {
                value,
                lookup,
                store: None,
                sender,
            },
            now,
        );
    }

    /// Ping `address`, then populate the routing table by looking up our own id.
    pub fn bootstrap_from(
        &mut self,
        id: OperationId,
        address: SocketAddr,
        sender: Option<ResultSender<BootstrapOutcome>>,
    ) {
        let now = Instant::now();

        if self
            .socket
            .request(
                None,
                address,
                None,
                RequestOwner::Operation(id),
                RequestSpecific::Ping,
            )
            .is_none()
        {
            if let Some(sender) = sender {
                let _ = sender.send(Err(OperationError::PingTimeout(address)));
            }
            return;
        }

        debug!(%id, ?address, "Bootstrapping");

        self.insert(
            id,
            OperationKind::Bootstrap {
                address,
                lookup: None,
                sender,
            },
            now,
        );
    }

    /// Cancel an operation and all of its pending requests.
    ///
    /// Does nothing if the operation already completed.
    pub fn cancel(&mut self, id: OperationId) {
        if let Some(operation) = self.operations.remove(&id) {
            let cancelled = self.socket.cancel_owner(&RequestOwner::Operation(id));

            debug!(%id, requests = cancelled.len(), "Operation cancelled");

            operation.fail(OperationError::Cancelled);
        }
    }

    /// Receive every future [RouteTableEvent] on `sender`.
    pub fn subscribe(&mut self, sender: Sender<RouteTableEvent>) {
        self.subscribers.push(sender);
    }

    // === Private Methods ===

    fn next_operation_id(&self) -> OperationId {
        OperationId(self.operation_ids.fetch_add(1, Ordering::Relaxed))
    }

    fn new_lookup(&mut self, target: Id, kind: LookupKind, now: Instant) -> IterativeLookup {
        self.routing_table.touch_bucket(&target);

        let mut lookup = IterativeLookup::new(
            self.routing_table.localhost(),
            target,
            kind,
            self.lookup_config.clone(),
            now,
        );
        lookup.seed(self.routing_table.select(&target, self.lookup_config.k));

        lookup
    }

    fn insert(&mut self, id: OperationId, kind: OperationKind, now: Instant) {
        self.operations.insert(
            id,
            Operation {
                deadline: now + self.operation_timeout,
                kind,
            },
        );
    }

    fn start(&mut self, id: OperationId, kind: OperationKind, now: Instant) {
        self.insert(id, kind, now);
        self.advance(id, OperationEvent::Tick, now);
    }

    /// Feed an event to an operation, completing it if it is done.
    fn advance(&mut self, id: OperationId, event: OperationEvent<'_>, now: Instant) {
        let Some(mut operation) = self.operations.remove(&id) else {
            return;
        };

        if self.step_operation(id, &mut operation.kind, event, now) {
            trace!(%id, "Operation done");
        } else {
            self.operations.insert(id, operation);
        }

        self.record_send_failures();
    }

    /// Returns `true` once the operation is done and its result was sent.
    fn step_operation(
        &mut self,
        id: OperationId,
        kind: &mut OperationKind,
        event: OperationEvent<'_>,
        now: Instant,
    ) -> bool {
        match kind {
            OperationKind::Ping { address, sender } => match event {
                OperationEvent::Response { responder, .. } => {
                    let _ = sender.send(Ok(responder));
                    true
                }
                OperationEvent::Failure { .. } => {
                    let _ = sender.send(Err(OperationError::PingTimeout(*address)));
                    true
                }
                OperationEvent::Tick => false,
            },
            OperationKind::Lookup { lookup, sender } => {
                if !self.drive_lookup(id, lookup, event, now) {
                    return false;
                }

                let outcome = lookup.outcome(now);

                debug!(
                    %id,
                    target = ?outcome.target,
                    responded = outcome.responded.len(),
                    hops = outcome.hops,
                    errors = outcome.errors,
                    "Lookup done"
                );

                if let Some(sender) = sender {
                    let _ = sender.send(Ok(outcome));
                }

                true
            }
            OperationKind::Get { lookup, sender } => {
                if !self.drive_lookup(id, lookup, event, now) {
                    return false;
                }

                let values = lookup.values().to_vec();
                let outcome = lookup.outcome(now);

                let result = if values.is_empty() {
                    Err(OperationError::NoSuchValue)
                } else {
                    Ok(ValueOutcome {
                        key: outcome.target,
                        values,
                        lookup: outcome,
                    })
                };

                let _ = sender.send(result);

                true
            }
            OperationKind::Put {
                value,
                lookup,
                store,
                sender,
            } => {
                match store {
                    None => {
                        if !self.drive_lookup(id, lookup, event, now) {
                            return false;
                        }

                        let outcome = lookup.outcome(now);
                        let mut query = StoreQuery::new(
                            lookup.target(),
                            value.clone(),
                            outcome.responded.clone(),
                            &self.store_config,
                            self.routing_table.config().k,
                            now,
                        );
                        query.step(&mut self.socket.requester(RequestOwner::Operation(id)), now);

                        *store = Some((outcome, query));
                    }
                    Some((_, query)) => {
                        match event {
                            OperationEvent::Response {
                                message_id,
                                responder,
                                response: ResponseSpecific::StoreAck(_),
                            } => {
                                query.on_ack(&message_id, responder);
                            }
                            OperationEvent::Response { message_id, .. }
                            | OperationEvent::Failure { message_id } => {
                                query.on_failure(&message_id);
                            }
                            OperationEvent::Tick => {}
                        }

                        query.step(&mut self.socket.requester(RequestOwner::Operation(id)), now);
                    }
                }

                let Some((outcome, query)) = store else {
                    return false;
                };

                if !query.is_done() {
                    return false;
                }

                for message_id in query.finish() {
                    self.socket.cancel(&message_id);
                }

                let result = query
                    .outcome(now)
                    .map(|store| PutOutcome {
                        lookup: outcome.clone(),
                        store,
                    })
                    .map_err(OperationError::from);

                match &result {
                    Ok(put) => debug!(
                        %id,
                        key = ?put.store.key,
                        acknowledgements = put.store.acknowledgements.len(),
                        "Put done"
                    ),
                    Err(error) => debug!(%id, ?error, "Put failed"),
                }

                let _ = sender.send(result);

                true
            }
            OperationKind::Bootstrap {
                address,
                lookup,
                sender,
            } => {
                let event = match (lookup.is_some(), event) {
                    (true, event) => event,
                    (false, OperationEvent::Tick) => return false,
                    (false, OperationEvent::Failure { .. }) => {
                        warn!(?address, "Bootstrap node did not respond");

                        if let Some(sender) = sender {
                            let _ = sender.send(Err(OperationError::PingTimeout(*address)));
                        }

                        return true;
                    }
                    (false, OperationEvent::Response { responder, .. }) => {
                        let target = *self.id();
                        let mut self_lookup = self.new_lookup(target, LookupKind::FindNode, now);
                        self_lookup.seed([responder.clone()]);

                        *lookup = Some((responder, self_lookup));

                        OperationEvent::Tick
                    }
                };

                let Some((contact, self_lookup)) = lookup else {
                    return false;
                };

                if !self.drive_lookup(id, self_lookup, event, now) {
                    return false;
                }

                let outcome = self_lookup.outcome(now);

                self.log_bootstrap();

                for target in self.routing_table.refresh_targets() {
                    let refresh = self.next_operation_id();
                    self.lookup(refresh, target, None);
                }

                if let Some(sender) = sender {
                    let _ = sender.send(Ok(BootstrapOutcome {
                        contact: contact.clone(),
                        lookup: outcome,
                    }));
                }

                true
            }
        }
    }

    /// Feed an event to a lookup, issue its next requests, and cancel its leftovers once
    /// it is done.
    ///
    /// Returns `true` if the lookup is done.
    fn drive_lookup(
        &mut self,
        id: OperationId,
        lookup: &mut IterativeLookup,
        event: OperationEvent<'_>,
        now: Instant,
    ) -> bool {
        let mut requester = self.socket.requester(RequestOwner::Operation(id));

        match event {
            OperationEvent::Response {
                message_id,
                responder,
                response,
            } => {
                lookup.on_response(&message_id, responder, response, now);
            }
            OperationEvent::Failure { message_id } => {
                lookup.on_failure(&message_id);
            }
            OperationEvent::Tick => lookup.boost(&mut requester, now),
        }

        lookup.step(&mut requester, now);

        if !lookup.is_done() {
            return false;
        }

        for message_id in lookup.finish() {
            self.socket.cancel(&message_id);
        }

        true
    }

    // === tick() helpers ===

    /// Count requests the transport could not send against their contacts, like timeouts.
    fn record_send_failures(&mut self) {
        for request in self.socket.take_send_failures() {
            if let Some(id) = request.to_id {
                self.routing_table.handle_io_error(&id, request.address);
            }
        }
    }

    /// Fail requests nobody answered in time.
    fn expire_requests(&mut self, now: Instant) {
        for request in self.socket.expire(now) {
            trace!(to = ?request.address, kind = ?request.kind, "Request timed out");

            self.request_failed(request, true, now);
        }
    }

    fn enforce_deadlines(&mut self, now: Instant) {
        let expired = self
            .operations
            .iter()
            .filter(|(_, operation)| now >= operation.deadline)
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();

        for id in expired {
            if let Some(operation) = self.operations.remove(&id) {
                self.socket.cancel_owner(&RequestOwner::Operation(id));

                debug!(%id, "Operation deadline exceeded");

                operation.fail(OperationError::DeadlineExceeded);
            }
        }
    }

    /// Let every operation boost or issue requests freed by expired ones.
    fn tick_operations(&mut self, now: Instant) {
        let ids = self.operations.keys().copied().collect::<Vec<_>>();

        for id in ids {
            self.advance(id, OperationEvent::Tick, now);
        }
    }

    fn periodic_node_maintenance(&mut self, now: Instant) {
        let decisions = self
            .maintenance
            .periodic_maintenance_decisions(&self.routing_table);

        if decisions.should_populate {
            self.populate();
        }

        for contact in &decisions.contacts_to_ping {
            self.socket.request(
                Some(*contact.id()),
                contact.address(),
                Some(contact),
                RequestOwner::Maintenance,
                RequestSpecific::Ping,
            );
        }

        for target in &decisions.refresh_targets {
            let id = self.next_operation_id();
            self.lookup(id, *target, None);
        }

        if decisions.should_prune {
            self.routing_table.prune();
        }

        if decisions.should_expire_values {
            let expired = self.server.values().expire(now);

            if expired > 0 {
                debug!(expired, "Dropped expired values");
            }
        }

        if !decisions.contacts_to_ping.is_empty() || !decisions.refresh_targets.is_empty() {
            debug!(
                pinged = decisions.contacts_to_ping.len(),
                refreshed = decisions.refresh_targets.len(),
                table_size = self.routing_table.size(),
                "Node maintenance executed"
            );
        }
    }

    /// Populate the routing table by bootstrapping from every bootstrap address.
    fn populate(&mut self) {
        let local_addr = self.local_addr();

        for address in self.bootstrap.clone() {
            if address == local_addr {
                continue;
            }

            let id = self.next_operation_id();
            self.bootstrap_from(id, address, None);
        }
    }

    /// Send the pings the routing table asked for, and publish its events.
    fn process_table_updates(&mut self) {
        for verification in self.routing_table.take_verifications() {
            let existing = verification.existing.clone();

            // The existing contact may answer with another id, which is what an identity
            // check has to find out.
            let sent = self.socket.request(
                None,
                existing.address(),
                Some(&existing),
                RequestOwner::Verify(verification.clone()),
                RequestSpecific::Ping,
            );

            if sent.is_none() {
                self.routing_table.verification_failed(&verification);
            }
        }

        for event in self.routing_table.take_events() {
            trace!(?event, "Routing table event");

            if self.store_forward {
                if let RouteTableEvent::ContactAdded(contact) = &event {
                    self.forward_values(contact);
                }
            }

            self.subscribers
                .retain(|subscriber| subscriber.send(event.clone()).is_ok());
        }
    }

    /// STORE the values a newly added contact is now responsible for.
    fn forward_values(&mut self, contact: &Contact) {
        let values = self.server.values().clone();
        let keys = values.keys();

        if keys.is_empty() {
            return;
        }

        for key in forward_keys(&self.routing_table, &keys, contact) {
            let Some(value) = values.get(&key) else {
                continue;
            };

            trace!(?key, to = ?contact.address(), "Forwarding stored value");

            self.socket.request(
                Some(*contact.id()),
                contact.address(),
                Some(contact),
                RequestOwner::StoreForward,
                RequestSpecific::Store(StoreRequestArguments { key, value }),
            );
        }
    }

    /// Handle one incoming message, either a request or a response message. One message per tick.
    fn handle_message(&mut self) -> bool {
        let Some((message, from)) = self.socket.recv_from() else {
            return false;
        };

        match message.message_type {
            MessageType::Request(_) => self.handle_request(from, message),
            _ => self.handle_response(from, message),
        }

        true
    }

    /// Check if routing table is empty and log an error if so.
    fn log_bootstrap(&self) {
        let table_size = self.routing_table.size();
        if table_size == 0 {
            error!("Could not bootstrap the routing table");
        } else {
            debug!(id = ?self.id(), table_size, "Populated the routing table");
        }
    }
}

pub(crate) fn to_socket_address<T: ToSocketAddrs>(bootstrap: &[T]) -> Vec<SocketAddr> {
    bootstrap
        .iter()
        .flat_map(|s| {
            s.to_socket_addrs()
                .map(|addrs| addrs.collect::<Vec<_>>())
                .map_err(|error| warn!(?error, "Could not resolve bootstrap address"))
        })
        .flatten()
        .collect()
}
