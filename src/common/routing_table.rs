//! Kademlia routing table: a trie of buckets keyed by id prefix.

mod bucket;

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, trace, warn};

use crate::common::{ClosestContacts, Contact, ContactKind, Id, ID_BITS};

pub use bucket::{Bucket, ContactEntry};

/// K = the default maximum size of a k-bucket.
pub const MAX_BUCKET_SIZE_K: usize = 20;
/// Default capacity of each bucket's replacement cache.
pub const DEFAULT_MAX_CACHE_SIZE: usize = 16;
/// Buckets shallower than this may always split.
pub const DEFAULT_SPLIT_DEPTH_LIMIT: usize = 4;
/// Default maximum number of active contacts from one /24 network per bucket.
pub const DEFAULT_MAX_SAME_NETWORK_CONTACTS: usize = 4;
/// Default number of failures after which a contact is considered dead.
pub const DEFAULT_MAX_CONTACT_ERRORS: u32 = 4;
/// Default number of back to back I/O errors after which evictions are suspended.
pub const DEFAULT_MAX_CONSECUTIVE_ERRORS: u32 = 50;

/// Don't ping a bucket's weakest contact again if it was heard from this recently.
const MIN_VERIFY_AGE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
/// Routing table settings
pub struct RouteTableConfig {
    /// Capacity of each bucket's active list.
    ///
    /// Defaults to [MAX_BUCKET_SIZE_K]
    pub k: usize,
    /// No bucket ever splits past this depth.
    ///
    /// Defaults to [ID_BITS]
    pub max_depth: usize,
    /// Buckets shallower than this may split even when they are far from the local id.
    ///
    /// Defaults to [DEFAULT_SPLIT_DEPTH_LIMIT]
    pub split_depth_limit: usize,
    /// Capacity of each bucket's replacement cache.
    ///
    /// Defaults to [DEFAULT_MAX_CACHE_SIZE]
    pub max_cache_size: usize,
    /// Maximum active contacts sharing a /24 (IPv4) or /48 (IPv6) network in one bucket.
    /// `None` disables the check, which is useful for loopback test networks.
    ///
    /// Defaults to [DEFAULT_MAX_SAME_NETWORK_CONTACTS]
    pub max_same_network_contacts: Option<usize>,
    /// Number of back to back I/O errors after which the table stops evicting contacts,
    /// assuming our own network is down.
    ///
    /// Defaults to [DEFAULT_MAX_CONSECUTIVE_ERRORS]
    pub max_consecutive_errors: u32,
    /// Number of failures after which a contact is dead.
    ///
    /// Defaults to [DEFAULT_MAX_CONTACT_ERRORS]
    pub max_contact_errors: u32,
    /// Ping the existing contact before accepting a new address for a known id.
    ///
    /// Defaults to `true`
    pub verify_identity: bool,
    /// Probability of skipping a dead contact in [RouteTable::select].
    ///
    /// Defaults to `0.5`
    pub dead_contact_skip_probability: f64,
}

impl Default for RouteTableConfig {
    fn default() -> Self {
        Self {
            k: MAX_BUCKET_SIZE_K,
            max_depth: ID_BITS,
            split_depth_limit: DEFAULT_SPLIT_DEPTH_LIMIT,
            max_cache_size: DEFAULT_MAX_CACHE_SIZE,
            max_same_network_contacts: Some(DEFAULT_MAX_SAME_NETWORK_CONTACTS),
            max_consecutive_errors: DEFAULT_MAX_CONSECUTIVE_ERRORS,
            max_contact_errors: DEFAULT_MAX_CONTACT_ERRORS,
            verify_identity: true,
            dead_contact_skip_probability: 0.5,
        }
    }
}

/// Notifications about changes in the routing table.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteTableEvent {
    ContactAdded(Contact),
    /// `old` was evicted in favor of the different contact `new`.
    ContactReplaced { old: Contact, new: Contact },
    /// The contact with the same id changed its address.
    ContactChanged { old: Contact, new: Contact },
    ContactRemoved(Contact),
    /// The bucket at `prefix` / `depth` was split into two children.
    BucketSplit { prefix: Id, depth: usize },
    /// `candidate` claimed the id of `existing`, which proved to be still alive.
    IdentityCollision { existing: Contact, candidate: Contact },
}

/// What [RouteTable::add] did with a contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Inserted into a bucket's active list.
    Added,
    /// An existing entry was refreshed.
    Updated,
    /// An existing entry was replaced.
    Replaced,
    /// Inserted into a bucket's replacement cache.
    Cached,
    /// Same id with a different address: the existing contact is being verified first.
    Verifying,
    /// Ignored.
    Rejected,
}

/// A ping the owner of the table should send on its behalf.
#[derive(Debug, Clone, PartialEq)]
pub struct Verification {
    /// The contact to ping.
    pub existing: Contact,
    /// The contact claiming the same id from another address, if this is an identity
    /// check rather than a liveness check.
    pub candidate: Option<Contact>,
}

#[derive(Debug, Clone)]
/// Kademlia routing table
pub struct RouteTable {
    localhost: Contact,
    config: RouteTableConfig,
    /// Buckets keyed by their prefix. Buckets partition the id space, so the bucket owning
    /// an id is the one with the greatest prefix not above it.
    buckets: BTreeMap<Id, Bucket>,
    consecutive_errors: u32,
    events: Vec<RouteTableEvent>,
    verifications: Vec<Verification>,
    verifying: HashSet<Id>,
}

impl RouteTable {
    /// Create a new [RouteTable] for the local node's contact.
    pub fn new(localhost: Contact, config: RouteTableConfig) -> Self {
        let mut buckets = BTreeMap::new();
        buckets.insert(Id::ZERO, Bucket::new(Id::ZERO, 0));

        RouteTable {
            localhost,
            config,
            buckets,
            consecutive_errors: 0,
            events: Vec::new(),
            verifications: Vec::new(),
            verifying: HashSet::new(),
        }
    }

    // === Getters ===

    /// Returns the [Id] of this node, where the distance is measured from.
    pub fn id(&self) -> &Id {
        self.localhost.id()
    }

    pub fn localhost(&self) -> &Contact {
        &self.localhost
    }

    pub fn config(&self) -> &RouteTableConfig {
        &self.config
    }

    pub fn buckets(&self) -> impl Iterator<Item = &Bucket> {
        self.buckets.values()
    }

    /// The bucket owning `id`.
    pub fn bucket_of(&self, id: &Id) -> Option<&Bucket> {
        self.buckets.range(..=*id).next_back().map(|(_, b)| b)
    }

    pub fn get(&self, id: &Id) -> Option<&Contact> {
        self.bucket_of(id)
            .and_then(|bucket| bucket.get(id))
            .map(|entry| entry.contact())
    }

    pub fn entry(&self, id: &Id) -> Option<&ContactEntry> {
        self.bucket_of(id).and_then(|bucket| bucket.get(id))
    }

    /// Returns `true` if `id` is in any bucket's active list.
    pub fn contains(&self, id: &Id) -> bool {
        self.bucket_of(id)
            .map(|bucket| bucket.active_position(id).is_some())
            .unwrap_or(false)
    }

    /// Returns `true` if this routing table has no active contacts.
    pub fn is_empty(&self) -> bool {
        self.buckets.values().all(|bucket| bucket.active().is_empty())
    }

    /// Return the number of active contacts in this routing table.
    pub fn size(&self) -> usize {
        self.buckets
            .values()
            .fold(0, |acc, bucket| acc + bucket.active().len())
    }

    /// Return the number of cached contacts in this routing table.
    pub fn cache_size(&self) -> usize {
        self.buckets
            .values()
            .fold(0, |acc, bucket| acc + bucket.cache().len())
    }

    /// All active contacts.
    pub fn contacts(&self) -> impl Iterator<Item = &Contact> {
        self.buckets
            .values()
            .flat_map(|bucket| bucket.active().iter().map(|e| e.contact()))
    }

    /// All cached contacts.
    pub fn cached_contacts(&self) -> impl Iterator<Item = &Contact> {
        self.buckets
            .values()
            .flat_map(|bucket| bucket.cache().iter().map(|e| e.contact()))
    }

    /// Returns `true` while evictions are suspended after too many consecutive I/O errors.
    pub fn is_suspended(&self) -> bool {
        self.consecutive_errors > self.config.max_consecutive_errors
    }

    // === Public Methods ===

    /// Insert or update a contact.
    pub fn add(&mut self, contact: Contact) -> AddOutcome {
        if contact.id() == self.id() || contact.is_hidden() || contact.is_localhost() {
            return AddOutcome::Rejected;
        }

        if contact.kind() == ContactKind::Authoritative {
            return self.add_authoritative(contact);
        }

        if let Some(outcome) = self.update_existing(&contact) {
            return outcome;
        }

        let now = Instant::now();

        loop {
            let key = self.bucket_key(contact.id());
            let k = self.config.k;
            let network_ok = self.network_allows(&key, &contact);

            let Some(bucket) = self.buckets.get_mut(&key) else {
                return AddOutcome::Rejected;
            };

            if !bucket.is_full(k) {
                if network_ok {
                    bucket.push_active(ContactEntry::new(contact.clone()));
                    bucket.touch(now);

                    trace!(id = ?contact.id(), address = ?contact.address(), "Added contact");
                    self.events.push(RouteTableEvent::ContactAdded(contact));

                    return AddOutcome::Added;
                }

                debug!(address = ?contact.address(), "Too many contacts from the same network");

                return self.add_to_cache(key, contact, false);
            }

            if self.can_split(&key) {
                self.split(key);
                continue;
            }

            return self.add_to_cache(key, contact, true);
        }
    }

    /// Remove a contact from this routing table, whether active or cached.
    pub fn remove(&mut self, id: &Id) -> Option<Contact> {
        let key = self.bucket_key(id);
        let bucket = self.buckets.get_mut(&key)?;

        if let Some(index) = bucket.active_position(id) {
            let removed = bucket.remove_active(index).into_contact();
            self.events
                .push(RouteTableEvent::ContactRemoved(removed.clone()));

            return Some(removed);
        }

        bucket
            .cache_position(id)
            .map(|index| bucket.remove_cached(index).into_contact())
    }

    /// Return up to `count` active contacts ordered by ascending XOR distance to `target`.
    ///
    /// Dead contacts are skipped with [RouteTableConfig::dead_contact_skip_probability],
    /// so that they are occasionally retried without always surfacing first.
    pub fn select(&self, target: &Id, count: usize) -> Vec<Contact> {
        let mut rng = rand::thread_rng();
        let mut closest = ClosestContacts::bounded(*target, count);
        let skip = self.config.dead_contact_skip_probability.clamp(0.0, 1.0);

        for bucket in self.buckets.values() {
            for entry in bucket.active() {
                if entry.is_dead(self.config.max_contact_errors) && rng.gen_bool(skip) {
                    continue;
                }

                closest.add(entry.contact().clone());
            }
        }

        closest.into_iter().collect()
    }

    /// Record a failed exchange with the contact `id` at `address`.
    ///
    /// A contact that becomes dead is replaced with the most recently seen acceptable
    /// entry of its bucket's cache, or removed once it failed more than
    /// [RouteTableConfig::max_contact_errors] times.
    pub fn handle_io_error(&mut self, id: &Id, address: SocketAddr) {
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);

        if self.is_suspended() {
            debug!(
                consecutive_errors = self.consecutive_errors,
                "Too many consecutive I/O errors, not evicting contacts"
            );
            return;
        }

        let now = Instant::now();
        let key = self.bucket_key(id);
        let max_errors = self.config.max_contact_errors;
        let cap = self.config.max_same_network_contacts;

        let Some(bucket) = self.buckets.get_mut(&key) else {
            return;
        };

        if let Some(index) = bucket.active_position(id) {
            let Some(entry) = bucket.active_mut(index) else {
                return;
            };

            if entry.contact().address() != address {
                // The error is about an address this contact no longer uses.
                return;
            }

            if !entry.error(max_errors, now) {
                return;
            }

            let dead = entry.contact().clone();
            let error_count = entry.error_count();

            let candidate = bucket.replacement_candidate(|cached| {
                !cached.is_dead(max_errors)
                    && cap
                        .map(|cap| bucket.same_network_count(cached.contact()) < cap
                            || cached.contact().same_network(&dead)
                                && bucket.same_network_count(cached.contact()) <= cap)
                        .unwrap_or(true)
            });

            if let Some(cached_index) = candidate {
                let replacement = bucket.remove_cached(cached_index);
                bucket.remove_active(index);

                let new = replacement.contact().clone();
                bucket.push_active(replacement);
                bucket.touch(now);

                debug!(old = ?dead.id(), new = ?new.id(), "Replaced dead contact from cache");
                self.events
                    .push(RouteTableEvent::ContactReplaced { old: dead, new });
            } else if error_count > max_errors {
                bucket.remove_active(index);

                debug!(id = ?dead.id(), error_count, "Removed dead contact");
                self.events.push(RouteTableEvent::ContactRemoved(dead));
            }
        } else if let Some(index) = bucket.cache_position(id) {
            let Some(entry) = bucket.cache_mut(index) else {
                return;
            };

            if entry.contact().address() == address && entry.error(max_errors, now) {
                bucket.remove_cached(index);
            }
        }
    }

    /// Reset the consecutive I/O errors guard after any successful exchange.
    pub fn record_success(&mut self) {
        self.consecutive_errors = 0;
    }

    /// Rebuild the table from scratch, re-inserting alive active contacts (healthiest
    /// first), then cached contacts (most recently seen first), dropping dead ones.
    pub fn prune(&mut self) {
        let max_errors = self.config.max_contact_errors;

        let mut active = Vec::with_capacity(self.size());
        let mut cached = Vec::with_capacity(self.cache_size());

        for (_, bucket) in std::mem::take(&mut self.buckets) {
            let (a, c) = bucket.drain();
            active.extend(a.into_iter().filter(|e| !e.is_dead(max_errors)));
            cached.extend(c.into_iter().filter(|e| !e.is_dead(max_errors)));
        }

        active.sort_by(|a, b| {
            a.error_count()
                .cmp(&b.error_count())
                .then_with(|| b.contact().last_seen_at().cmp(&a.contact().last_seen_at()))
        });
        cached.sort_by(|a, b| b.contact().last_seen_at().cmp(&a.contact().last_seen_at()));

        let before = active.len() + cached.len();

        self.buckets.insert(Id::ZERO, Bucket::new(Id::ZERO, 0));
        self.verifying.clear();
        self.verifications.clear();

        for entry in active.into_iter().chain(cached) {
            self.place(entry);
        }

        debug!(
            kept = before,
            active = self.size(),
            cached = self.cache_size(),
            buckets = self.buckets.len(),
            "Pruned routing table"
        );
    }

    /// Drain notifications produced since the last call.
    pub fn take_events(&mut self) -> Vec<RouteTableEvent> {
        std::mem::take(&mut self.events)
    }

    /// Drain pings the owner should send on behalf of the table.
    pub fn take_verifications(&mut self) -> Vec<Verification> {
        std::mem::take(&mut self.verifications)
    }

    /// The contact pinged for `verification` answered as `responder`.
    pub fn verification_succeeded(&mut self, verification: &Verification, responder: Contact) {
        let existing = &verification.existing;
        self.verifying.remove(existing.id());

        if responder.id() != existing.id() {
            debug!(
                existing = ?existing.id(),
                responder = ?responder.id(),
                "A different node answered at a known contact's address"
            );
            self.add(responder);
            self.verification_failed(verification);
            return;
        }

        self.add(responder);

        if let Some(candidate) = &verification.candidate {
            warn!(
                id = ?existing.id(),
                existing = ?existing.address(),
                candidate = ?candidate.address(),
                "Identity collision: existing contact is still alive"
            );

            self.events.push(RouteTableEvent::IdentityCollision {
                existing: existing.clone(),
                candidate: candidate.clone(),
            });
        }
    }

    /// The contact pinged for `verification` did not answer.
    pub fn verification_failed(&mut self, verification: &Verification) {
        let existing = &verification.existing;
        self.verifying.remove(existing.id());

        self.handle_io_error(existing.id(), existing.address());

        let Some(candidate) = &verification.candidate else {
            return;
        };

        if self.is_suspended() {
            return;
        }

        let key = self.bucket_key(existing.id());
        let Some(bucket) = self.buckets.get_mut(&key) else {
            return;
        };

        let Some(index) = bucket.active_position(existing.id()) else {
            if let Some(entry) = bucket
                .cache_position(existing.id())
                .and_then(|index| bucket.cache_mut(index))
            {
                if entry.contact().address() == existing.address() {
                    debug!(id = ?existing.id(), new = ?candidate.address(), "Replaced stale cached address");
                    *entry = ContactEntry::new(candidate.clone());
                }
                return;
            }

            // Already evicted by the error above, insert the candidate normally.
            self.add(candidate.clone());
            return;
        };

        let Some(entry) = bucket.active_mut(index) else {
            return;
        };

        if entry.contact().address() != existing.address() {
            return;
        }

        let old = entry.contact().clone();
        *entry = ContactEntry::new(candidate.clone());
        bucket.move_to_back(index);
        bucket.touch(Instant::now());

        debug!(id = ?old.id(), old = ?old.address(), new = ?candidate.address(), "Replaced stale address");
        self.events.push(RouteTableEvent::ContactChanged {
            old,
            new: candidate.clone(),
        });
    }

    /// Active contacts not heard from within `max_age`.
    pub fn stale_contacts(&self, now: Instant, max_age: Duration) -> Vec<Contact> {
        self.contacts()
            .filter(|contact| {
                contact
                    .last_seen_at()
                    .map(|seen| now.saturating_duration_since(seen) >= max_age)
                    .unwrap_or(true)
            })
            .cloned()
            .collect()
    }

    /// A random id inside every bucket not touched within `max_age`.
    pub fn stale_buckets(&self, now: Instant, max_age: Duration) -> Vec<Id> {
        self.buckets
            .values()
            .filter(|bucket| now.saturating_duration_since(bucket.touched_at()) >= max_age)
            .map(|bucket| Id::random_with_prefix(bucket.prefix(), bucket.depth()))
            .collect()
    }

    /// A random id inside every bucket except the one holding the local id.
    pub fn refresh_targets(&self) -> Vec<Id> {
        self.buckets
            .values()
            .filter(|bucket| !bucket.owns(self.id()))
            .map(|bucket| Id::random_with_prefix(bucket.prefix(), bucket.depth()))
            .collect()
    }

    /// Mark the bucket owning `id` as recently looked up.
    pub fn touch_bucket(&mut self, id: &Id) {
        let key = self.bucket_key(id);

        if let Some(bucket) = self.buckets.get_mut(&key) {
            bucket.touch(Instant::now());
        }
    }

    // === Private Methods ===

    fn bucket_key(&self, id: &Id) -> Id {
        self.buckets
            .range(..=*id)
            .next_back()
            .map(|(key, _)| *key)
            .unwrap_or(Id::ZERO)
    }

    /// A full bucket may split if it holds the local id, if it is the sibling of the
    /// bucket holding the local id, or if it is shallower than the split depth limit.
    fn can_split(&self, key: &Id) -> bool {
        let Some(bucket) = self.buckets.get(key) else {
            return false;
        };

        let depth = bucket.depth();

        if depth >= self.config.max_depth.min(ID_BITS) {
            return false;
        }

        if bucket.owns(self.id()) {
            return true;
        }

        if let Some(local) = self.bucket_of(self.id()) {
            let is_sibling = local.depth() == depth
                && depth > 0
                && bucket.prefix().common_prefix_len(local.prefix()) == depth - 1;

            if is_sibling {
                return true;
            }
        }

        depth < self.config.split_depth_limit
    }

    fn split(&mut self, key: Id) {
        let Some(bucket) = self.buckets.remove(&key) else {
            return;
        };

        let prefix = *bucket.prefix();
        let depth = bucket.depth();

        let (left, right) = bucket.split();

        self.buckets.insert(*left.prefix(), left);
        self.buckets.insert(*right.prefix(), right);

        trace!(?prefix, depth, "Split bucket");
        self.events
            .push(RouteTableEvent::BucketSplit { prefix, depth });
    }

    fn network_allows(&self, key: &Id, contact: &Contact) -> bool {
        match (self.config.max_same_network_contacts, self.buckets.get(key)) {
            (Some(cap), Some(bucket)) => bucket.same_network_count(contact) < cap,
            _ => true,
        }
    }

    fn add_to_cache(&mut self, key: Id, contact: Contact, bucket_is_full: bool) -> AddOutcome {
        let capacity = self.config.max_cache_size;
        let now = Instant::now();

        let Some(bucket) = self.buckets.get_mut(&key) else {
            return AddOutcome::Rejected;
        };

        if let Some(evicted) = bucket.push_cached(ContactEntry::new(contact), capacity) {
            trace!(id = ?evicted.contact().id(), "Evicted contact from replacement cache");
        }

        if !bucket_is_full {
            return AddOutcome::Cached;
        }

        let weakest = bucket.weakest_active().and_then(|weakest| {
            let recently_seen = weakest
                .contact()
                .last_seen_at()
                .map(|seen| now.saturating_duration_since(seen) < MIN_VERIFY_AGE)
                .unwrap_or(false);

            if weakest.error_count() == 0 && recently_seen {
                None
            } else {
                Some(weakest.contact().clone())
            }
        });

        if let Some(weakest) = weakest {
            self.request_verification(weakest, None);
        }

        AddOutcome::Cached
    }

    fn add_authoritative(&mut self, contact: Contact) -> AddOutcome {
        let now = Instant::now();
        let replaced = self.take_existing(contact.id());

        loop {
            let key = self.bucket_key(contact.id());
            let k = self.config.k;
            let capacity = self.config.max_cache_size;

            if self
                .buckets
                .get(&key)
                .map(|bucket| bucket.is_full(k))
                .unwrap_or(false)
                && self.can_split(&key)
            {
                self.split(key);
                continue;
            }

            let Some(bucket) = self.buckets.get_mut(&key) else {
                return AddOutcome::Rejected;
            };

            let mut evicted = None;

            if bucket.is_full(k) {
                let lrs = bucket.remove_active(0);
                evicted = Some(lrs.contact().clone());
                bucket.push_cached(lrs, capacity);
            }

            bucket.push_active(ContactEntry::new(contact.clone()));
            bucket.touch(now);

            let event = match (replaced, evicted) {
                (Some(old), _) => RouteTableEvent::ContactChanged { old, new: contact },
                (None, Some(old)) => RouteTableEvent::ContactReplaced { old, new: contact },
                (None, None) => RouteTableEvent::ContactAdded(contact),
            };

            let outcome = match event {
                RouteTableEvent::ContactAdded(_) => AddOutcome::Added,
                _ => AddOutcome::Replaced,
            };

            self.events.push(event);

            return outcome;
        }
    }

    /// Merge into an existing entry for the same id, if any.
    fn update_existing(&mut self, contact: &Contact) -> Option<AddOutcome> {
        let key = self.bucket_key(contact.id());
        let max_errors = self.config.max_contact_errors;
        let verify = self.config.verify_identity;
        let now = Instant::now();

        let bucket = self.buckets.get_mut(&key)?;

        if let Some(index) = bucket.active_position(contact.id()) {
            let entry = bucket.active_mut(index)?;

            if entry.contact().same_address(contact) {
                entry.update(contact);

                if contact.kind() > ContactKind::Unknown {
                    bucket.move_to_back(index);
                    bucket.touch(now);
                }

                return Some(AddOutcome::Updated);
            }

            // Second hand information never moves a known contact.
            if contact.kind() == ContactKind::Unknown {
                return Some(AddOutcome::Rejected);
            }

            if verify && !entry.is_dead(max_errors) {
                let existing = entry.contact().clone();
                self.request_verification(existing, Some(contact.clone()));

                return Some(AddOutcome::Verifying);
            }

            let old = entry.contact().clone();
            *entry = ContactEntry::new(contact.clone());
            bucket.move_to_back(index);
            bucket.touch(now);

            self.events.push(RouteTableEvent::ContactChanged {
                old,
                new: contact.clone(),
            });

            return Some(AddOutcome::Replaced);
        }

        if let Some(index) = bucket.cache_position(contact.id()) {
            let entry = bucket.cache_mut(index)?;

            if entry.contact().same_address(contact) {
                entry.update(contact);
            } else if contact.kind() == ContactKind::Unknown {
                return Some(AddOutcome::Rejected);
            } else if verify && !entry.is_dead(max_errors) {
                // A cached contact is promoted as is, so it gets the same identity check.
                let existing = entry.contact().clone();
                self.request_verification(existing, Some(contact.clone()));

                return Some(AddOutcome::Verifying);
            } else {
                *entry = ContactEntry::new(contact.clone());
            }

            // Re-insert to keep the cache ordered by last seen.
            let entry = bucket.remove_cached(index);
            bucket.push_cached(entry, self.config.max_cache_size);

            return Some(AddOutcome::Cached);
        }

        None
    }

    /// Remove any entry for `id`, returning its contact.
    fn take_existing(&mut self, id: &Id) -> Option<Contact> {
        let key = self.bucket_key(id);
        let bucket = self.buckets.get_mut(&key)?;

        if let Some(index) = bucket.active_position(id) {
            return Some(bucket.remove_active(index).into_contact());
        }

        bucket
            .cache_position(id)
            .map(|index| bucket.remove_cached(index).into_contact())
    }

    /// Insert an entry preserving its error history, without side effects other than
    /// splitting. Used while rebuilding.
    fn place(&mut self, entry: ContactEntry) {
        loop {
            let key = self.bucket_key(entry.contact().id());
            let k = self.config.k;
            let capacity = self.config.max_cache_size;
            let network_ok = self.network_allows(&key, entry.contact());

            let Some(bucket) = self.buckets.get_mut(&key) else {
                return;
            };

            if !bucket.is_full(k) {
                if network_ok {
                    bucket.push_active(entry);
                } else {
                    bucket.push_cached(entry, capacity);
                }
                return;
            }

            if self.can_split(&key) {
                self.split(key);
                continue;
            }

            if let Some(bucket) = self.buckets.get_mut(&key) {
                bucket.push_cached(entry, capacity);
            }

            return;
        }
    }

    fn request_verification(&mut self, existing: Contact, candidate: Option<Contact>) {
        if !self.verifying.insert(*existing.id()) {
            return;
        }

        trace!(id = ?existing.id(), identity_check = candidate.is_some(), "Verifying contact");

        self.verifications.push(Verification {
            existing,
            candidate,
        });
    }
}
