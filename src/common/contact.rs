//! Struct and implementation of the Contact entry in the Kademlia routing table

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use crate::common::Id;

/// How we learned about a contact, in increasing order of trust.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ContactKind {
    /// Learned second-hand, from another node's FIND_NODE response.
    Unknown,
    /// The contact sent us a request.
    Unsolicited,
    /// The contact answered a request we sent.
    Solicited,
    /// Explicitly asserted by the user, for example after an identity verification.
    Authoritative,
}

#[derive(Debug, Clone, PartialEq)]
/// A remote peer's identity, address and freshness.
pub struct Contact {
    id: Id,
    kind: ContactKind,
    instance_id: u8,
    address: SocketAddr,
    round_trip_time: Option<Duration>,
    created_at: Instant,
    last_seen_at: Option<Instant>,
    hidden: bool,
    localhost: bool,
}

impl Contact {
    /// Creates a new contact with the given provenance.
    pub fn new(id: Id, address: SocketAddr, kind: ContactKind) -> Contact {
        let now = Instant::now();

        Contact {
            id,
            kind,
            instance_id: 0,
            address,
            round_trip_time: None,
            created_at: now,
            last_seen_at: match kind {
                ContactKind::Unknown => None,
                _ => Some(now),
            },
            hidden: false,
            localhost: false,
        }
    }

    /// A contact learned from another node's response.
    pub fn unknown(id: Id, address: SocketAddr) -> Contact {
        Contact::new(id, address, ContactKind::Unknown)
    }

    /// A contact that sent us a request.
    pub fn unsolicited(id: Id, address: SocketAddr) -> Contact {
        Contact::new(id, address, ContactKind::Unsolicited)
    }

    /// A contact that answered our request after `round_trip_time`.
    pub fn solicited(id: Id, address: SocketAddr, round_trip_time: Duration) -> Contact {
        Contact::new(id, address, ContactKind::Solicited).with_round_trip_time(round_trip_time)
    }

    /// The local node's own contact.
    pub fn localhost(id: Id, address: SocketAddr) -> Contact {
        Contact {
            localhost: true,
            ..Contact::new(id, address, ContactKind::Authoritative)
        }
    }

    /// Creates a contact with a random id, for tests and simulations.
    pub fn random() -> Contact {
        let ip: u32 = rand::random();
        let port: u16 = rand::random();

        Contact::new(
            Id::random(),
            SocketAddr::from((ip.to_be_bytes(), port)),
            ContactKind::Solicited,
        )
    }

    // === Options ===

    pub fn with_kind(mut self, kind: ContactKind) -> Contact {
        self.kind = kind;
        if kind != ContactKind::Unknown && self.last_seen_at.is_none() {
            self.last_seen_at = Some(Instant::now());
        }
        self
    }

    pub fn with_instance_id(mut self, instance_id: u8) -> Contact {
        self.instance_id = instance_id;
        self
    }

    pub fn with_round_trip_time(mut self, round_trip_time: Duration) -> Contact {
        self.round_trip_time = Some(round_trip_time);
        self
    }

    pub fn with_hidden(mut self, hidden: bool) -> Contact {
        self.hidden = hidden;
        self
    }

    pub fn with_last_seen_at(mut self, last_seen_at: Instant) -> Contact {
        self.last_seen_at = Some(last_seen_at);
        self
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn kind(&self) -> ContactKind {
        self.kind
    }

    pub fn instance_id(&self) -> u8 {
        self.instance_id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn round_trip_time(&self) -> Option<Duration> {
        self.round_trip_time
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// When we last heard from this contact directly, `None` if never.
    pub fn last_seen_at(&self) -> Option<Instant> {
        self.last_seen_at
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden
    }

    pub fn is_localhost(&self) -> bool {
        self.localhost
    }

    /// Returns `true` if this contact was heard from first-hand, or asserted by the user.
    pub fn is_active(&self) -> bool {
        self.kind >= ContactKind::Solicited
    }

    /// Returns `true` if both contacts use the same ip and port.
    pub fn same_address(&self, other: &Contact) -> bool {
        self.address == other.address
    }

    /// Returns `true` if both contacts live in the same /24 (IPv4) or /48 (IPv6) network.
    pub fn same_network(&self, other: &Contact) -> bool {
        same_network(&self.address.ip(), &other.address.ip())
    }

    // === Public Methods ===

    /// Merge `other` into this contact.
    ///
    /// Identity fields come from whichever contact has the higher priority kind, timing
    /// fields keep the most recent or most informative value.
    pub fn merge(&mut self, other: &Contact) {
        if other.kind >= self.kind {
            self.kind = other.kind;
            self.address = other.address;
            self.instance_id = other.instance_id;
            self.hidden = other.hidden;
        }

        self.created_at = self.created_at.min(other.created_at);

        self.last_seen_at = match (self.last_seen_at, other.last_seen_at) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };

        if other.round_trip_time.is_some() {
            self.round_trip_time = other.round_trip_time;
        }
    }
}

/// Returns `true` if both ips share a /24 (IPv4) or /48 (IPv6) prefix.
pub fn same_network(a: &IpAddr, b: &IpAddr) -> bool {
    match (a, b) {
        (IpAddr::V4(a), IpAddr::V4(b)) => a.octets()[..3] == b.octets()[..3],
        (IpAddr::V6(a), IpAddr::V6(b)) => a.octets()[..6] == b.octets()[..6],
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::{Duration, Instant};

    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn kinds_are_ordered_by_priority() {
        assert!(ContactKind::Unknown < ContactKind::Unsolicited);
        assert!(ContactKind::Unsolicited < ContactKind::Solicited);
        assert!(ContactKind::Solicited < ContactKind::Authoritative);
    }

    #[test]
    fn merge_keeps_higher_priority_identity() {
        let id = Id::random();

        let mut solicited = Contact::solicited(id, addr("1.1.1.1:1"), Duration::from_millis(30));
        let unknown = Contact::unknown(id, addr("2.2.2.2:2")).with_instance_id(9);

        solicited.merge(&unknown);

        assert_eq!(solicited.kind(), ContactKind::Solicited);
        assert_eq!(solicited.address(), addr("1.1.1.1:1"));
        assert_eq!(solicited.instance_id(), 0);
        assert_eq!(solicited.round_trip_time(), Some(Duration::from_millis(30)));
        assert!(solicited.last_seen_at().is_some());
    }

    #[test]
    fn merge_takes_newer_identity_and_timing() {
        let id = Id::random();
        let earlier = Instant::now();

        let mut unknown = Contact::unknown(id, addr("2.2.2.2:2"));
        let solicited = Contact::solicited(id, addr("1.1.1.1:1"), Duration::from_millis(10))
            .with_instance_id(3)
            .with_last_seen_at(earlier + Duration::from_secs(5));

        unknown.merge(&solicited);

        assert_eq!(unknown.kind(), ContactKind::Solicited);
        assert_eq!(unknown.address(), addr("1.1.1.1:1"));
        assert_eq!(unknown.instance_id(), 3);
        assert_eq!(
            unknown.last_seen_at(),
            Some(earlier + Duration::from_secs(5))
        );
        assert!(unknown.created_at() <= solicited.created_at());
    }

    #[test]
    fn localhost_is_authoritative() {
        let local = Contact::localhost(Id::random(), addr("127.0.0.1:6881"));

        assert!(local.is_localhost());
        assert_eq!(local.kind(), ContactKind::Authoritative);
        assert!(local.is_active());
    }

    #[test]
    fn networks() {
        let a = Contact::random().with_kind(ContactKind::Unknown);
        let b = Contact::new(Id::random(), addr("10.0.0.1:1"), ContactKind::Solicited);
        let c = Contact::new(Id::random(), addr("10.0.0.200:2"), ContactKind::Solicited);
        let d = Contact::new(Id::random(), addr("10.0.1.1:1"), ContactKind::Solicited);

        assert!(b.same_network(&c));
        assert!(!b.same_network(&d));
        assert!(a.same_network(&a));
    }
}
