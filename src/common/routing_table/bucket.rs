//! Buckets of the routing table trie and the entries they own.

use std::time::Instant;

use crate::common::{Contact, Id};

/// A [Contact] owned by the routing table, with its failure history.
#[derive(Debug, Clone)]
pub struct ContactEntry {
    contact: Contact,
    error_count: u32,
    last_error_at: Option<Instant>,
}

impl ContactEntry {
    pub fn new(contact: Contact) -> Self {
        ContactEntry {
            contact,
            error_count: 0,
            last_error_at: None,
        }
    }

    // === Getters ===

    pub fn contact(&self) -> &Contact {
        &self.contact
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn last_error_at(&self) -> Option<Instant> {
        self.last_error_at
    }

    /// Returns `true` once the entry failed at least `max_errors` times since it was last
    /// heard from.
    pub fn is_dead(&self, max_errors: u32) -> bool {
        self.error_count >= max_errors
    }

    // === Public Methods ===

    /// Record a failed exchange, returns `true` if the entry is now dead.
    pub fn error(&mut self, max_errors: u32, now: Instant) -> bool {
        self.error_count = self.error_count.saturating_add(1);
        self.last_error_at = Some(now);

        self.is_dead(max_errors)
    }

    /// Merge a fresher view of the same contact.
    pub fn update(&mut self, contact: &Contact) {
        self.contact.merge(contact);

        if contact.is_active() {
            self.error_count = 0;
        }
    }

    pub(crate) fn into_contact(self) -> Contact {
        self.contact
    }

    /// Sort key: most recently seen last. Contacts never seen directly sort first.
    fn seen_key(&self) -> Option<Instant> {
        self.contact.last_seen_at()
    }
}

/// A partition of the id space: every id sharing the first `depth` bits with `prefix`.
///
/// Active contacts are kept in least-recently-seen first order, and so is the replacement
/// cache.
#[derive(Debug, Clone)]
pub struct Bucket {
    prefix: Id,
    depth: usize,
    active: Vec<ContactEntry>,
    cache: Vec<ContactEntry>,
    touched_at: Instant,
}

impl Bucket {
    pub fn new(prefix: Id, depth: usize) -> Self {
        Bucket {
            prefix: prefix.masked(depth),
            depth,
            active: Vec::new(),
            cache: Vec::new(),
            touched_at: Instant::now(),
        }
    }

    // === Getters ===

    pub fn prefix(&self) -> &Id {
        &self.prefix
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn active(&self) -> &[ContactEntry] {
        &self.active
    }

    pub fn cache(&self) -> &[ContactEntry] {
        &self.cache
    }

    pub fn touched_at(&self) -> Instant {
        self.touched_at
    }

    /// Returns `true` if `id` falls into this bucket's key space.
    pub fn owns(&self, id: &Id) -> bool {
        id.has_prefix(&self.prefix, self.depth)
    }

    pub fn is_full(&self, k: usize) -> bool {
        self.active.len() >= k
    }

    pub fn active_position(&self, id: &Id) -> Option<usize> {
        self.active.iter().position(|e| e.contact.id() == id)
    }

    pub fn cache_position(&self, id: &Id) -> Option<usize> {
        self.cache.iter().position(|e| e.contact.id() == id)
    }

    pub fn get(&self, id: &Id) -> Option<&ContactEntry> {
        self.active
            .iter()
            .chain(self.cache.iter())
            .find(|e| e.contact.id() == id)
    }

    /// Number of active contacts in the same network as `contact`, not counting
    /// the entry with the same id.
    pub fn same_network_count(&self, contact: &Contact) -> usize {
        self.active
            .iter()
            .filter(|e| e.contact.id() != contact.id() && e.contact.same_network(contact))
            .count()
    }

    /// The active entry most worth checking: the most failed, then least recently seen.
    pub fn weakest_active(&self) -> Option<&ContactEntry> {
        // `max_by_key` returns the last maximum, so iterate from the most recently seen.
        self.active
            .iter()
            .rev()
            .max_by_key(|e| e.error_count)
    }

    // === Public Methods ===

    pub fn touch(&mut self, now: Instant) {
        self.touched_at = now;
    }

    pub(crate) fn active_mut(&mut self, index: usize) -> Option<&mut ContactEntry> {
        self.active.get_mut(index)
    }

    pub(crate) fn cache_mut(&mut self, index: usize) -> Option<&mut ContactEntry> {
        self.cache.get_mut(index)
    }

    /// Append as the most recently seen active entry.
    pub fn push_active(&mut self, entry: ContactEntry) {
        self.active.push(entry);
    }

    pub fn remove_active(&mut self, index: usize) -> ContactEntry {
        self.active.remove(index)
    }

    pub fn remove_cached(&mut self, index: usize) -> ContactEntry {
        self.cache.remove(index)
    }

    /// Move the active entry at `index` to the most recently seen position.
    pub fn move_to_back(&mut self, index: usize) {
        if index < self.active.len() {
            let entry = self.active.remove(index);
            self.active.push(entry);
        }
    }

    /// Insert into the replacement cache, evicting the least useful cached entry when
    /// full. Returns the evicted entry, if any.
    pub fn push_cached(&mut self, entry: ContactEntry, capacity: usize) -> Option<ContactEntry> {
        if capacity == 0 {
            return Some(entry);
        }

        if let Some(index) = self.cache_position(entry.contact.id()) {
            let existing = &mut self.cache[index];
            existing.update(&entry.contact);
            let updated = self.cache.remove(index);
            self.insert_cached_by_seen(updated);

            return None;
        }

        let evicted = if self.cache.len() >= capacity {
            self.least_useful_cached()
                .map(|index| self.cache.remove(index))
        } else {
            None
        };

        self.insert_cached_by_seen(entry);

        evicted
    }

    /// The most recently seen cached entry accepted by `filter`.
    pub fn replacement_candidate<F>(&self, filter: F) -> Option<usize>
    where
        F: Fn(&ContactEntry) -> bool,
    {
        self.cache
            .iter()
            .enumerate()
            .rev()
            .find(|(_, entry)| filter(entry))
            .map(|(index, _)| index)
    }

    /// Split into two children of `depth + 1`, partitioning every member by the bit at
    /// `depth`. Returns `(left, right)` where left holds the ids with that bit unset.
    pub fn split(self) -> (Bucket, Bucket) {
        let depth = self.depth;

        let mut left = Bucket::new(self.prefix.with_bit(depth, false), depth + 1);
        let mut right = Bucket::new(self.prefix.with_bit(depth, true), depth + 1);

        left.touched_at = self.touched_at;
        right.touched_at = self.touched_at;

        for entry in self.active {
            if entry.contact.id().bit(depth) {
                right.active.push(entry);
            } else {
                left.active.push(entry);
            }
        }

        for entry in self.cache {
            if entry.contact.id().bit(depth) {
                right.cache.push(entry);
            } else {
                left.cache.push(entry);
            }
        }

        (left, right)
    }

    pub(crate) fn drain(self) -> (Vec<ContactEntry>, Vec<ContactEntry>) {
        (self.active, self.cache)
    }

    // === Private Methods ===

    fn insert_cached_by_seen(&mut self, entry: ContactEntry) {
        let key = entry.seen_key();
        let pos = self.cache.partition_point(|e| e.seen_key() <= key);

        self.cache.insert(pos, entry);
    }

    /// The cached entry with the most errors, ties broken by least recently seen.
    fn least_useful_cached(&self) -> Option<usize> {
        self.cache
            .iter()
            .enumerate()
            .rev()
            .max_by_key(|(_, e)| e.error_count)
            .map(|(index, _)| index)
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::common::ContactKind;

    fn contact_with_id(id: Id) -> Contact {
        Contact::new(id, Contact::random().address(), ContactKind::Solicited)
    }

    #[test]
    fn split_partitions_by_next_bit() {
        let mut bucket = Bucket::new(Id::ZERO, 0);

        for _ in 0..20 {
            bucket.push_active(ContactEntry::new(Contact::random()));
        }
        for _ in 0..5 {
            bucket.push_cached(ContactEntry::new(Contact::random()), 10);
        }

        let members: Vec<Id> = bucket
            .active()
            .iter()
            .chain(bucket.cache().iter())
            .map(|e| *e.contact().id())
            .collect();

        let (left, right) = bucket.split();

        assert_eq!(left.depth(), 1);
        assert_eq!(right.depth(), 1);
        assert!(right.prefix().bit(0));
        assert!(!left.prefix().bit(0));

        for id in members {
            let in_left = left.get(&id).is_some();
            let in_right = right.get(&id).is_some();

            assert!(in_left ^ in_right, "member must land in exactly one child");
            assert_eq!(in_right, id.bit(0));
            assert!(left.owns(&id) == in_left);
        }
    }

    #[test]
    fn cache_evicts_least_useful() {
        let mut bucket = Bucket::new(Id::ZERO, 0);
        let now = Instant::now();

        let mut failing = ContactEntry::new(contact_with_id(Id::random()));
        failing.error(5, now);

        bucket.push_cached(failing.clone(), 2);
        bucket.push_cached(ContactEntry::new(Contact::random()), 2);

        let evicted = bucket.push_cached(ContactEntry::new(Contact::random()), 2);

        assert_eq!(bucket.cache().len(), 2);
        assert_eq!(evicted.unwrap().contact().id(), failing.contact().id());
    }

    #[test]
    fn cache_is_ordered_by_last_seen() {
        let mut bucket = Bucket::new(Id::ZERO, 0);
        let now = Instant::now();

        let newer = Contact::random().with_last_seen_at(now + Duration::from_secs(10));
        let older = Contact::random().with_last_seen_at(now);

        bucket.push_cached(ContactEntry::new(newer.clone()), 4);
        bucket.push_cached(ContactEntry::new(older.clone()), 4);

        let candidate = bucket.replacement_candidate(|_| true).unwrap();
        assert_eq!(bucket.cache()[candidate].contact().id(), newer.id());
    }

    #[test]
    fn entry_errors_and_resets() {
        let contact = Contact::random();
        let mut entry = ContactEntry::new(contact.clone());
        let now = Instant::now();

        assert!(!entry.error(2, now));
        assert!(entry.error(2, now));
        assert!(entry.is_dead(2));
        assert_eq!(entry.last_error_at(), Some(now));

        // Second hand information does not revive a contact.
        entry.update(&Contact::unknown(*contact.id(), contact.address()));
        assert!(entry.is_dead(2));

        entry.update(&contact);
        assert_eq!(entry.error_count(), 0);
    }

    #[test]
    fn weakest_is_most_failed_then_least_recently_seen() {
        let mut bucket = Bucket::new(Id::ZERO, 0);

        let first = ContactEntry::new(Contact::random());
        let second = ContactEntry::new(Contact::random());

        bucket.push_active(first.clone());
        bucket.push_active(second.clone());

        assert_eq!(
            bucket.weakest_active().unwrap().contact().id(),
            first.contact().id()
        );

        bucket.active_mut(1).unwrap().error(5, Instant::now());

        assert_eq!(
            bucket.weakest_active().unwrap().contact().id(),
            second.contact().id()
        );
    }
}
