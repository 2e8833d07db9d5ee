//! Answer incoming requests.

use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::debug;

use super::value_store::ValueStore;
use crate::common::{
    Contact, ErrorSpecific, FindNodeRequestArguments, FindValueRequestArguments, MessageType,
    NodesResponseArguments, RequestSpecific, ResponseSpecific, RouteTable,
    StoreAckResponseArguments, StoreRequestArguments, ValueResponseArguments,
};

/// Default maximum size of a stored value in bytes.
pub const MAX_VALUE_SIZE: usize = 1000;

/// A trait for filtering incoming requests to a DHT node and
/// decide whether to allow handling it or rate limit or ban
/// the requester, or prohibit specific requests' details.
pub trait RequestFilter: Send + Sync + Debug {
    /// Returns true if the request from this source is allowed.
    fn allow_request(&self, request: &RequestSpecific, from: SocketAddr) -> bool;
}

#[derive(Debug, Clone)]
pub struct DefaultFilter;

impl RequestFilter for DefaultFilter {
    fn allow_request(&self, _request: &RequestSpecific, _from: SocketAddr) -> bool {
        true
    }
}

/// Handles incoming requests, one message kind per arm.
///
/// Doesn't implement any rate-limiting or blocking, see [RequestFilter].
#[derive(Debug)]
pub struct Server {
    values: Arc<dyn ValueStore>,
    filter: Arc<dyn RequestFilter>,
    max_value_size: usize,
}

impl Server {
    pub fn new(
        values: Arc<dyn ValueStore>,
        filter: Arc<dyn RequestFilter>,
        max_value_size: usize,
    ) -> Self {
        Server {
            values,
            filter,
            max_value_size,
        }
    }

    pub fn values(&self) -> &Arc<dyn ValueStore> {
        &self.values
    }

    /// Returns a response or an error for a request, or `None` if the request is filtered
    /// out and should not be answered.
    pub fn handle_request(
        &mut self,
        routing_table: &RouteTable,
        requester: &Contact,
        request: RequestSpecific,
    ) -> Option<MessageType> {
        let from = requester.address();

        if !self.filter.allow_request(&request, from) {
            debug!(?from, kind = ?request.kind(), "Request filtered out");
            return None;
        }

        let k = routing_table.config().k;

        Some(match request {
            RequestSpecific::Ping => MessageType::Response(ResponseSpecific::Pong),
            RequestSpecific::FindNode(FindNodeRequestArguments { target }) => {
                let contacts = routing_table
                    .select(&target, k + 1)
                    .into_iter()
                    .filter(|contact| contact.id() != requester.id())
                    .take(k)
                    .collect();

                MessageType::Response(ResponseSpecific::Nodes(NodesResponseArguments {
                    contacts,
                }))
            }
            RequestSpecific::FindValue(FindValueRequestArguments { key }) => {
                match self.values.get(&key) {
                    Some(value) => {
                        MessageType::Response(ResponseSpecific::Value(ValueResponseArguments {
                            key,
                            value,
                        }))
                    }
                    None => {
                        let contacts = routing_table
                            .select(&key, k + 1)
                            .into_iter()
                            .filter(|contact| contact.id() != requester.id())
                            .take(k)
                            .collect();

                        MessageType::Response(ResponseSpecific::Nodes(NodesResponseArguments {
                            contacts,
                        }))
                    }
                }
            }
            RequestSpecific::Store(StoreRequestArguments { key, value }) => {
                if value.len() > self.max_value_size {
                    debug!(?key, ?from, size = ?value.len(), "Message (v field) too big.");

                    return Some(MessageType::Error(ErrorSpecific {
                        code: 205,
                        description: "Message (v field) too big.".to_string(),
                    }));
                }

                if !self.values.store(requester, key, value) {
                    debug!(?key, ?from, "Value refused by the store");

                    return Some(MessageType::Error(ErrorSpecific {
                        code: 201,
                        description: "Value refused".to_string(),
                    }));
                }

                MessageType::Response(ResponseSpecific::StoreAck(StoreAckResponseArguments {
                    key,
                }))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;
    use crate::common::{Id, RouteTableConfig};
    use crate::core::value_store::MemoryValueStore;

    fn setup() -> (Server, RouteTable) {
        let server = Server::new(
            Arc::new(MemoryValueStore::default()),
            Arc::new(DefaultFilter),
            MAX_VALUE_SIZE,
        );

        let localhost = Contact::localhost(Id::random(), "127.0.0.1:6881".parse().unwrap());
        let mut table = RouteTable::new(localhost, RouteTableConfig::default());

        for i in 0..40_u8 {
            let address = SocketAddr::from(([10, 1, i, 1], 6881));
            table.add(Contact::unsolicited(Id::random(), address));
        }

        (server, table)
    }

    fn requester() -> Contact {
        Contact::unsolicited(Id::random(), "10.9.9.9:6881".parse().unwrap())
    }

    #[test]
    fn ping() {
        let (mut server, table) = setup();

        let response = server.handle_request(&table, &requester(), RequestSpecific::Ping);

        assert_eq!(response, Some(MessageType::Response(ResponseSpecific::Pong)));
    }

    #[test]
    fn find_node_excludes_requester() {
        let (mut server, mut table) = setup();
        let requester = requester();
        table.add(requester.clone());

        let target = *requester.id();
        let response = server.handle_request(
            &table,
            &requester,
            RequestSpecific::FindNode(FindNodeRequestArguments { target }),
        );

        let Some(MessageType::Response(ResponseSpecific::Nodes(args))) = response else {
            panic!("expected nodes");
        };

        assert!(!args.contacts.is_empty());
        assert!(args.contacts.len() <= table.config().k);
        assert!(args.contacts.iter().all(|c| c.id() != requester.id()));
    }

    #[test]
    fn store_then_find_value() {
        let (mut server, table) = setup();
        let key = Id::random();

        let response = server.handle_request(
            &table,
            &requester(),
            RequestSpecific::FindValue(FindValueRequestArguments { key }),
        );
        assert!(matches!(
            response,
            Some(MessageType::Response(ResponseSpecific::Nodes(_)))
        ));

        let response = server.handle_request(
            &table,
            &requester(),
            RequestSpecific::Store(StoreRequestArguments {
                key,
                value: b"value".to_vec().into(),
            }),
        );
        assert_eq!(
            response,
            Some(MessageType::Response(ResponseSpecific::StoreAck(
                StoreAckResponseArguments { key }
            )))
        );

        let response = server.handle_request(
            &table,
            &requester(),
            RequestSpecific::FindValue(FindValueRequestArguments { key }),
        );
        assert_eq!(
            response,
            Some(MessageType::Response(ResponseSpecific::Value(
                ValueResponseArguments {
                    key,
                    value: b"value".to_vec().into(),
                }
            )))
        );
    }

    #[test]
    fn oversized_store_is_refused() {
        let (mut server, table) = setup();
        let key = Id::random();

        let response = server.handle_request(
            &table,
            &requester(),
            RequestSpecific::Store(StoreRequestArguments {
                key,
                value: vec![0; MAX_VALUE_SIZE + 1].into(),
            }),
        );

        assert!(matches!(response, Some(MessageType::Error(ErrorSpecific { code: 205, .. }))));
        assert!(server.values().get(&key).is_none());
    }

    #[test]
    fn filtered_requests_are_dropped() {
        #[derive(Debug)]
        struct NoPings;

        impl RequestFilter for NoPings {
            fn allow_request(&self, request: &RequestSpecific, _from: SocketAddr) -> bool {
                !matches!(request, RequestSpecific::Ping)
            }
        }

        let (_, table) = setup();
        let mut server = Server::new(
            Arc::new(MemoryValueStore::default()),
            Arc::new(NoPings),
            MAX_VALUE_SIZE,
        );

        assert!(server
            .handle_request(&table, &requester(), RequestSpecific::Ping)
            .is_none());
    }
}
