//! Decide which stored values to hand over to a newly seen contact.

use crate::common::{Contact, Id, RouteTable};

/// Keys among `keys` whose values the local node should STORE at `contact`.
///
/// A key qualifies when `contact` is among the `k` closest known contacts to it, and the
/// local node is closer to it than every other one of those contacts, so exactly one node
/// forwards each value.
pub fn forward_keys(routing_table: &RouteTable, keys: &[Id], contact: &Contact) -> Vec<Id> {
    let k = routing_table.config().k;
    let local = routing_table.id();

    keys.iter()
        .filter(|key| {
            let closest = routing_table.select(key, k);

            if !closest.iter().any(|c| c.id() == contact.id()) {
                return false;
            }

            closest
                .iter()
                .filter(|c| c.id() != contact.id())
                .all(|c| local.is_closer(c.id(), key))
        })
        .copied()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::RouteTableConfig;

    fn contact(id: Id, index: u8) -> Contact {
        Contact::unsolicited(id, ([10, 3, index, 1], 6881).into())
    }

    #[test]
    fn forwards_only_when_responsible() {
        let local = Id::random();
        let localhost = Contact::localhost(local, "127.0.0.1:6881".parse().unwrap());
        let mut table = RouteTable::new(localhost, RouteTableConfig::default());

        // A key right next to the local id.
        let key = local.with_bit(159, !local.bit(159));

        // Far from the key: the local node remains the closest.
        let far = contact(local.with_bit(0, !local.bit(0)), 1);
        table.add(far.clone());
        assert_eq!(forward_keys(&table, &[key], &far), vec![key]);

        // Closer to the key than the local node: it is responsible instead.
        let near = contact(key, 2);
        table.add(near.clone());

        let newcomer = contact(local.with_bit(1, !local.bit(1)), 3);
        table.add(newcomer.clone());
        assert!(forward_keys(&table, &[key], &newcomer).is_empty());
    }

    #[test]
    fn unknown_contact_gets_nothing() {
        let local = Id::random();
        let localhost = Contact::localhost(local, "127.0.0.1:6881".parse().unwrap());
        let table = RouteTable::new(localhost, RouteTableConfig::default());

        let stranger = contact(Id::random(), 1);
        assert!(forward_keys(&table, &[Id::random()], &stranger).is_empty());
    }
}
