use std::vec::IntoIter;

use crate::common::{Contact, Id};

/// Contacts kept sorted by ascending XOR distance to a target, optionally bounded.
///
/// Adding a contact that is already present (by id) is a no-op.
#[derive(Debug, Clone)]
pub struct ClosestContacts {
    target: Id,
    capacity: Option<usize>,
    contacts: Vec<Contact>,
}

impl ClosestContacts {
    pub fn new(target: Id) -> Self {
        Self {
            target,
            capacity: None,
            contacts: Vec::with_capacity(200),
        }
    }

    /// Keep at most `capacity` contacts, dropping the furthest on overflow.
    pub fn bounded(target: Id, capacity: usize) -> Self {
        Self {
            target,
            capacity: Some(capacity),
            contacts: Vec::with_capacity(capacity + 1),
        }
    }

    // === Getters ===

    pub fn target(&self) -> Id {
        self.target
    }

    pub fn contacts(&self) -> &[Contact] {
        &self.contacts
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    /// Returns `true` if a bounded set reached its capacity.
    pub fn is_full(&self) -> bool {
        self.capacity
            .map(|capacity| self.contacts.len() >= capacity)
            .unwrap_or(false)
    }

    pub fn closest(&self) -> Option<&Contact> {
        self.contacts.first()
    }

    pub fn furthest(&self) -> Option<&Contact> {
        self.contacts.last()
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.contacts.iter().any(|contact| contact.id() == id)
    }

    // === Public Methods ===

    /// Insert a contact at its distance rank. Returns `true` if it was kept.
    pub fn add(&mut self, contact: Contact) -> bool {
        if self.contains(contact.id()) {
            return false;
        }

        let seek = contact.id().xor(&self.target);
        let pos = self
            .contacts
            .partition_point(|probe| probe.id().xor(&self.target) < seek);

        if let Some(capacity) = self.capacity {
            if pos >= capacity {
                return false;
            }
        }

        self.contacts.insert(pos, contact);

        if let Some(capacity) = self.capacity {
            self.contacts.truncate(capacity);
        }

        true
    }

    /// Remove and return the contact at `index`.
    pub fn remove(&mut self, index: usize) -> Option<Contact> {
        if index < self.contacts.len() {
            Some(self.contacts.remove(index))
        } else {
            None
        }
    }
}

impl IntoIterator for ClosestContacts {
    type Item = Contact;
    type IntoIter = IntoIter<Contact>;

    fn into_iter(self) -> Self::IntoIter {
        self.contacts.into_iter()
    }
}

impl<'a> IntoIterator for &'a ClosestContacts {
    type Item = &'a Contact;
    type IntoIter = std::slice::Iter<'a, Contact>;

    fn into_iter(self) -> Self::IntoIter {
        self.contacts.iter()
    }
}
