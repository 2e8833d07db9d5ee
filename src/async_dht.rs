//! AsyncDht node.

use std::net::SocketAddr;

use crate::actor::{BootstrapOutcome, Info, OperationError};
use crate::common::{Contact, Id, RouteTableEvent};
use crate::core::lookup::{LookupOutcome, ValueOutcome};
use crate::core::store::PutOutcome;
use crate::dht::{ActorMessage, Dht, DhtWasShutdown};

impl Dht {
    /// Return an async version of the Dht client.
    pub fn as_async(self) -> AsyncDht {
        AsyncDht(self)
    }
}

#[derive(Debug, Clone)]
/// Async version of the Dht node.
pub struct AsyncDht(Dht);

impl AsyncDht {
    // === Getters ===

    /// Information and statistics about this [Dht] node.
    pub async fn info(&self) -> Result<Info, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Info>(1);

        self.0
            .send(ActorMessage::Info(sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }

    /// Turn this node's routing table to a list of bootstraping nodes.
    pub async fn to_bootstrap(&self) -> Result<Vec<String>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Vec<String>>(1);

        self.0
            .send(ActorMessage::ToBootstrap(sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }

    /// Return the blocking version of this client.
    pub fn as_blocking(&self) -> &Dht {
        &self.0
    }

    // === Public Methods ===

    /// Shutdown the actor thread loop.
    pub async fn shutdown(&mut self) {
        let (sender, receiver) = flume::bounded::<()>(1);

        let _ = self.0.send(ActorMessage::Shutdown(sender));
        let _ = receiver.recv_async().await;
    }

    /// Bootstrap from every configured bootstrap node.
    ///
    /// Returns true if at least one of them answered.
    pub async fn bootstrapped(&self) -> bool {
        let handles = self
            .0
            .bootstrap_addresses()
            .iter()
            .map(|address| self.0.bootstrap(*address))
            .collect::<Vec<_>>();

        let mut bootstrapped = false;

        for handle in handles {
            bootstrapped |= handle.wait_async().await.is_ok();
        }

        bootstrapped
    }

    /// Receive every change to the routing table from now on, as a stream.
    pub fn subscribe(
        &self,
    ) -> Result<flume::r#async::RecvStream<'static, RouteTableEvent>, DhtWasShutdown> {
        Ok(self.0.subscribe()?.into_stream())
    }

    pub async fn ping(&self, address: SocketAddr) -> Result<Contact, OperationError> {
        self.0.ping(address).wait_async().await
    }

    pub async fn bootstrap(&self, address: SocketAddr) -> Result<BootstrapOutcome, OperationError> {
        self.0.bootstrap(address).wait_async().await
    }

    pub async fn lookup(&self, target: Id) -> Result<LookupOutcome, OperationError> {
        self.0.lookup(target).wait_async().await
    }

    pub async fn get(&self, key: Id) -> Result<ValueOutcome, OperationError> {
        self.0.get(key).wait_async().await
    }

    pub async fn put(&self, key: Id, value: &[u8]) -> Result<PutOutcome, OperationError> {
        self.0.put(key, value).wait_async().await
    }
}
