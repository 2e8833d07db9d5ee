use std::net::SocketAddr;

use crate::common::Id;

use super::Actor;

/// Information and statistics about this node.
#[derive(Debug, Clone)]
pub struct Info {
    id: Id,
    local_addr: SocketAddr,
    routing_table_size: usize,
    cached_contacts: usize,
    buckets: usize,
    pending_requests: usize,
    operations: usize,
    stored_values: usize,
}

impl Info {
    /// This Node's [Id]
    pub fn id(&self) -> &Id {
        &self.id
    }
    /// Local UDP socket address that this node is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
    /// Number of active contacts in the routing table.
    pub fn routing_table_size(&self) -> usize {
        self.routing_table_size
    }
    /// Number of contacts waiting in replacement caches.
    pub fn cached_contacts(&self) -> usize {
        self.cached_contacts
    }
    pub fn buckets(&self) -> usize {
        self.buckets
    }
    /// Requests sent and not answered yet.
    pub fn pending_requests(&self) -> usize {
        self.pending_requests
    }
    /// Operations in progress, including refresh lookups and bootstrapping.
    pub fn operations(&self) -> usize {
        self.operations
    }
    pub fn stored_values(&self) -> usize {
        self.stored_values
    }
}

impl From<&Actor> for Info {
    fn from(actor: &Actor) -> Self {
        let routing_table = actor.routing_table();

        Self {
            id: *actor.id(),
            local_addr: actor.local_addr(),
            routing_table_size: routing_table.size(),
            cached_contacts: routing_table.cache_size(),
            buckets: routing_table.buckets().count(),
            pending_requests: actor.pending_requests(),
            operations: actor.operations(),
            stored_values: actor.stored_values(),
        }
    }
}
