//! Serialize and deserialize Kademlia RPC messages.

mod internal;

use std::convert::TryInto;
use std::fmt::{self, Debug, Display, Formatter};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::common::{Contact, Id, ID_SIZE};
use crate::{Error, Result};

/// Protocol version sent with every message: "KN" 0.1
pub const VERSION: [u8; 4] = [75, 78, 0, 1];

const COMPACT_V4_SIZE: usize = ID_SIZE + 6;
const COMPACT_V6_SIZE: usize = ID_SIZE + 18;

/// Unique id of an outstanding request, echoed by the response.
///
/// Issued by [MessageFactory](crate::core::correlator::MessageFactory) so that it is
/// bound to the address the request was sent to.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub [u8; 8]);

impl MessageId {
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }

        Ok(())
    }
}

impl Debug for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({self})")
    }
}

#[derive(Debug, PartialEq, Clone)]
pub struct Message {
    pub message_id: MessageId,

    /// The version of the requester or responder.
    pub version: Option<[u8; 4]>,

    /// Id of the sender, absent only on errors from nodes that did not identify.
    pub sender_id: Option<Id>,

    /// Distinguishes restarts of a node keeping the same id.
    pub instance_id: u8,

    pub message_type: MessageType,
}

#[derive(Debug, PartialEq, Clone)]
pub enum MessageType {
    Request(RequestSpecific),

    Response(ResponseSpecific),

    Error(ErrorSpecific),
}

#[derive(Debug, PartialEq, Clone)]
pub struct ErrorSpecific {
    pub code: i64,
    pub description: String,
}

/// Request kinds, also used as the expected shape of the matching response.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum RequestKind {
    Ping,
    FindNode,
    FindValue,
    Store,
}

#[derive(Debug, PartialEq, Clone)]
pub enum RequestSpecific {
    Ping,
    FindNode(FindNodeRequestArguments),
    FindValue(FindValueRequestArguments),
    Store(StoreRequestArguments),
}

#[derive(Debug, PartialEq, Clone)]
pub enum ResponseSpecific {
    Pong,
    Nodes(NodesResponseArguments),
    Value(ValueResponseArguments),
    StoreAck(StoreAckResponseArguments),
}

// === FIND_NODE ===

#[derive(Debug, PartialEq, Clone)]
pub struct FindNodeRequestArguments {
    pub target: Id,
}

#[derive(Debug, PartialEq, Clone)]
pub struct NodesResponseArguments {
    pub contacts: Vec<Contact>,
}

// === FIND_VALUE ===

#[derive(Debug, PartialEq, Clone)]
pub struct FindValueRequestArguments {
    pub key: Id,
}

#[derive(Debug, PartialEq, Clone)]
pub struct ValueResponseArguments {
    pub key: Id,
    pub value: Box<[u8]>,
}

// === STORE ===

#[derive(Debug, PartialEq, Clone)]
pub struct StoreRequestArguments {
    pub key: Id,
    pub value: Box<[u8]>,
}

#[derive(Debug, PartialEq, Clone)]
pub struct StoreAckResponseArguments {
    pub key: Id,
}

impl RequestSpecific {
    pub fn kind(&self) -> RequestKind {
        match self {
            RequestSpecific::Ping => RequestKind::Ping,
            RequestSpecific::FindNode(_) => RequestKind::FindNode,
            RequestSpecific::FindValue(_) => RequestKind::FindValue,
            RequestSpecific::Store(_) => RequestKind::Store,
        }
    }

    /// The id this request is about, if any.
    pub fn key(&self) -> Option<Id> {
        match self {
            RequestSpecific::Ping => None,
            RequestSpecific::FindNode(FindNodeRequestArguments { target }) => Some(*target),
            RequestSpecific::FindValue(FindValueRequestArguments { key }) => Some(*key),
            RequestSpecific::Store(StoreRequestArguments { key, .. }) => Some(*key),
        }
    }
}

impl ResponseSpecific {
    /// Returns `true` if this response is a valid answer to a request of `kind` about `key`.
    pub fn answers(&self, kind: RequestKind, key: Option<&Id>) -> bool {
        match (kind, self) {
            (RequestKind::Ping, ResponseSpecific::Pong) => true,
            (RequestKind::FindNode, ResponseSpecific::Nodes(_)) => true,
            (RequestKind::FindValue, ResponseSpecific::Nodes(_)) => true,
            (RequestKind::FindValue, ResponseSpecific::Value(args)) => key == Some(&args.key),
            (RequestKind::Store, ResponseSpecific::StoreAck(args)) => key == Some(&args.key),
            _ => false,
        }
    }
}

impl Message {
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Message> {
        Message::from_serde_message(internal::DHTMessage::from_bytes(bytes.as_ref())?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.clone().into_serde_message()?.to_bytes()?)
    }

    // === Getters ===

    pub fn is_request(&self) -> bool {
        matches!(self.message_type, MessageType::Request(_))
    }

    /// Contacts carried by a FIND_NODE or FIND_VALUE response.
    pub fn get_closer_contacts(&self) -> Option<&[Contact]> {
        match &self.message_type {
            MessageType::Response(ResponseSpecific::Nodes(args)) => Some(&args.contacts),
            _ => None,
        }
    }

    // === Private Methods ===

    fn into_serde_message(self) -> Result<internal::DHTMessage> {
        let instance_id = self.instance_id as i64;

        let id = || -> Result<[u8; ID_SIZE]> {
            self.sender_id
                .map(|id| *id.as_bytes())
                .ok_or(Error::InvalidMessage("missing sender id"))
        };

        Ok(internal::DHTMessage {
            message_id: self.message_id.0,
            version: self.version,
            variant: match &self.message_type {
                MessageType::Request(request) => internal::DHTMessageVariant::Request(match request {
                    RequestSpecific::Ping => internal::DHTRequestSpecific::Ping {
                        arguments: internal::DHTPingArguments {
                            id: id()?,
                            instance_id,
                        },
                    },
                    RequestSpecific::FindNode(FindNodeRequestArguments { target }) => {
                        internal::DHTRequestSpecific::FindNode {
                            arguments: internal::DHTFindNodeRequestArguments {
                                id: id()?,
                                instance_id,
                                target: *target.as_bytes(),
                            },
                        }
                    }
                    RequestSpecific::FindValue(FindValueRequestArguments { key }) => {
                        internal::DHTRequestSpecific::FindValue {
                            arguments: internal::DHTFindValueRequestArguments {
                                id: id()?,
                                instance_id,
                                k: *key.as_bytes(),
                            },
                        }
                    }
                    RequestSpecific::Store(StoreRequestArguments { key, value }) => {
                        internal::DHTRequestSpecific::Store {
                            arguments: internal::DHTStoreRequestArguments {
                                id: id()?,
                                instance_id,
                                k: *key.as_bytes(),
                                v: value.clone(),
                            },
                        }
                    }
                }),

                MessageType::Response(response) => {
                    internal::DHTMessageVariant::Response(match response {
                        ResponseSpecific::Pong => internal::DHTResponseSpecific::Pong {
                            arguments: internal::DHTPingArguments {
                                id: id()?,
                                instance_id,
                            },
                        },
                        ResponseSpecific::Nodes(NodesResponseArguments { contacts }) => {
                            let (v4, v6) = contacts_to_bytes(contacts);

                            internal::DHTResponseSpecific::Nodes {
                                arguments: internal::DHTNodesResponseArguments {
                                    id: id()?,
                                    instance_id,
                                    nodes: v4.into(),
                                    nodes6: if v6.is_empty() { None } else { Some(v6.into()) },
                                },
                            }
                        }
                        ResponseSpecific::Value(ValueResponseArguments { key, value }) => {
                            internal::DHTResponseSpecific::Value {
                                arguments: internal::DHTValueResponseArguments {
                                    id: id()?,
                                    instance_id,
                                    k: *key.as_bytes(),
                                    v: value.clone(),
                                },
                            }
                        }
                        ResponseSpecific::StoreAck(StoreAckResponseArguments { key }) => {
                            internal::DHTResponseSpecific::StoreAck {
                                arguments: internal::DHTStoreAckResponseArguments {
                                    id: id()?,
                                    instance_id,
                                    k: *key.as_bytes(),
                                },
                            }
                        }
                    })
                }

                MessageType::Error(err) => {
                    internal::DHTMessageVariant::Error(internal::DHTErrorSpecific {
                        error_info: (err.code, err.description.clone()),
                        id: self.sender_id.map(|id| *id.as_bytes()),
                    })
                }
            },
        })
    }

    fn from_serde_message(msg: internal::DHTMessage) -> Result<Message> {
        let (sender_id, instance_id, message_type) = match msg.variant {
            internal::DHTMessageVariant::Request(request) => match request {
                internal::DHTRequestSpecific::Ping { arguments } => (
                    Some(arguments.id.into()),
                    arguments.instance_id,
                    MessageType::Request(RequestSpecific::Ping),
                ),
                internal::DHTRequestSpecific::FindNode { arguments } => (
                    Some(arguments.id.into()),
                    arguments.instance_id,
                    MessageType::Request(RequestSpecific::FindNode(FindNodeRequestArguments {
                        target: arguments.target.into(),
                    })),
                ),
                internal::DHTRequestSpecific::FindValue { arguments } => (
                    Some(arguments.id.into()),
                    arguments.instance_id,
                    MessageType::Request(RequestSpecific::FindValue(FindValueRequestArguments {
                        key: arguments.k.into(),
                    })),
                ),
                internal::DHTRequestSpecific::Store { arguments } => (
                    Some(arguments.id.into()),
                    arguments.instance_id,
                    MessageType::Request(RequestSpecific::Store(StoreRequestArguments {
                        key: arguments.k.into(),
                        value: arguments.v,
                    })),
                ),
            },

            internal::DHTMessageVariant::Response(response) => match response {
                internal::DHTResponseSpecific::Pong { arguments } => (
                    Some(arguments.id.into()),
                    arguments.instance_id,
                    MessageType::Response(ResponseSpecific::Pong),
                ),
                internal::DHTResponseSpecific::Nodes { arguments } => {
                    let mut contacts = bytes_to_contacts(&arguments.nodes, COMPACT_V4_SIZE)?;

                    if let Some(nodes6) = &arguments.nodes6 {
                        contacts.extend(bytes_to_contacts(nodes6, COMPACT_V6_SIZE)?);
                    }

                    (
                        Some(arguments.id.into()),
                        arguments.instance_id,
                        MessageType::Response(ResponseSpecific::Nodes(NodesResponseArguments {
                            contacts,
                        })),
                    )
                }
                internal::DHTResponseSpecific::Value { arguments } => (
                    Some(arguments.id.into()),
                    arguments.instance_id,
                    MessageType::Response(ResponseSpecific::Value(ValueResponseArguments {
                        key: arguments.k.into(),
                        value: arguments.v,
                    })),
                ),
                internal::DHTResponseSpecific::StoreAck { arguments } => (
                    Some(arguments.id.into()),
                    arguments.instance_id,
                    MessageType::Response(ResponseSpecific::StoreAck(
                        StoreAckResponseArguments {
                            key: arguments.k.into(),
                        },
                    )),
                ),
            },

            internal::DHTMessageVariant::Error(err) => (
                err.id.map(Id::from),
                0,
                MessageType::Error(ErrorSpecific {
                    code: err.error_info.0,
                    description: err.error_info.1,
                }),
            ),
        };

        Ok(Message {
            message_id: MessageId(msg.message_id),
            version: msg.version,
            sender_id,
            instance_id: u8::try_from(instance_id)
                .map_err(|_| Error::InvalidMessage("instance id out of range"))?,
            message_type,
        })
    }
}

pub fn sockaddr_to_bytes(sockaddr: &SocketAddr) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(18);

    match sockaddr.ip() {
        IpAddr::V4(ip) => bytes.extend(ip.octets()),
        IpAddr::V6(ip) => bytes.extend(ip.octets()),
    }

    bytes.extend(sockaddr.port().to_be_bytes());

    bytes
}

fn bytes_to_sockaddr<T: AsRef<[u8]>>(bytes: T) -> Result<SocketAddr> {
    let bytes = bytes.as_ref();

    match bytes.len() {
        6 => {
            let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
            let port = u16::from_be_bytes([bytes[4], bytes[5]]);

            Ok(SocketAddr::new(IpAddr::V4(ip), port))
        }
        18 => {
            let octets: [u8; 16] = bytes[..16]
                .try_into()
                .map_err(|_| Error::InvalidMessage("wrong number of bytes for ipv6"))?;
            let port = u16::from_be_bytes([bytes[16], bytes[17]]);

            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => Err(Error::InvalidMessage("wrong number of bytes for sockaddr")),
    }
}

/// Compact encoding, split into IPv4 and IPv6 lists.
fn contacts_to_bytes(contacts: &[Contact]) -> (Vec<u8>, Vec<u8>) {
    let mut v4 = Vec::new();
    let mut v6 = Vec::new();

    for contact in contacts {
        let buf = if contact.address().is_ipv4() {
            &mut v4
        } else {
            &mut v6
        };

        buf.extend_from_slice(contact.id().as_bytes());
        buf.extend(sockaddr_to_bytes(&contact.address()));
    }

    (v4, v6)
}

fn bytes_to_contacts(bytes: &[u8], size: usize) -> Result<Vec<Contact>> {
    if bytes.len() % size != 0 {
        return Err(Error::InvalidMessage("wrong number of bytes for nodes"));
    }

    bytes
        .chunks_exact(size)
        .map(|chunk| {
            let id = Id::from_bytes(&chunk[..ID_SIZE])?;
            let address = bytes_to_sockaddr(&chunk[ID_SIZE..])?;

            Ok(Contact::unknown(id, address))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(message_type: MessageType) -> Message {
        Message {
            message_id: MessageId([1, 2, 3, 4, 5, 6, 7, 8]),
            version: Some(VERSION),
            sender_id: Some(Id::random()),
            instance_id: 7,
            message_type,
        }
    }

    fn round_trip(original: &Message) -> Message {
        Message::from_bytes(original.to_bytes().unwrap()).unwrap()
    }

    #[test]
    fn requests() {
        for request in [
            RequestSpecific::Ping,
            RequestSpecific::FindNode(FindNodeRequestArguments {
                target: Id::random(),
            }),
            RequestSpecific::FindValue(FindValueRequestArguments { key: Id::random() }),
            RequestSpecific::Store(StoreRequestArguments {
                key: Id::random(),
                value: b"hello".to_vec().into(),
            }),
        ] {
            let original = message(MessageType::Request(request));
            assert_eq!(round_trip(&original), original);
        }
    }

    #[test]
    fn value_and_store_ack_are_told_apart() {
        let key = Id::random();

        let value = message(MessageType::Response(ResponseSpecific::Value(
            ValueResponseArguments {
                key,
                value: b"v".to_vec().into(),
            },
        )));
        let ack = message(MessageType::Response(ResponseSpecific::StoreAck(
            StoreAckResponseArguments { key },
        )));
        let pong = message(MessageType::Response(ResponseSpecific::Pong));

        assert_eq!(round_trip(&value), value);
        assert_eq!(round_trip(&ack), ack);
        assert_eq!(round_trip(&pong), pong);
    }

    #[test]
    fn nodes_response_with_ipv4_and_ipv6_contacts() {
        let v4 = Contact::unknown(Id::random(), "49.50.52.52:5354".parse().unwrap());
        let v6 = Contact::unknown(Id::random(), "[2001:db8::1]:6881".parse().unwrap());

        let original = message(MessageType::Response(ResponseSpecific::Nodes(
            NodesResponseArguments {
                contacts: vec![v4.clone(), v6.clone()],
            },
        )));

        let parsed = round_trip(&original);
        let contacts = parsed.get_closer_contacts().unwrap();

        assert_eq!(
            contacts
                .iter()
                .map(|c| (*c.id(), c.address()))
                .collect::<Vec<_>>(),
            vec![(*v4.id(), v4.address()), (*v6.id(), v6.address())]
        );
        assert_eq!(parsed.sender_id, original.sender_id);
        assert_eq!(parsed.instance_id, 7);
    }

    #[test]
    fn error_message() {
        let mut original = message(MessageType::Error(ErrorSpecific {
            code: 203,
            description: "Protocol Error".to_string(),
        }));
        // Errors carry no instance id.
        original.instance_id = 0;

        assert_eq!(round_trip(&original), original);
    }

    #[test]
    fn answers() {
        let key = Id::random();
        let other = Id::random();

        let value = ResponseSpecific::Value(ValueResponseArguments {
            key,
            value: b"v".to_vec().into(),
        });
        let nodes = ResponseSpecific::Nodes(NodesResponseArguments { contacts: vec![] });

        assert!(value.answers(RequestKind::FindValue, Some(&key)));
        assert!(!value.answers(RequestKind::FindValue, Some(&other)));
        assert!(nodes.answers(RequestKind::FindValue, Some(&key)));
        assert!(nodes.answers(RequestKind::FindNode, Some(&key)));
        assert!(!nodes.answers(RequestKind::Store, Some(&key)));
        assert!(!ResponseSpecific::Pong.answers(RequestKind::FindNode, None));
    }

    #[test]
    fn invalid_bytes() {
        assert!(Message::from_bytes(b"d1:y1:qe").is_err());
        assert!(Message::from_bytes(b"garbage").is_err());
    }
}
