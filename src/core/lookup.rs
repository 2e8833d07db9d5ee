//! Iterative FIND_NODE / FIND_VALUE lookups.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, trace};

use super::process_counter::ProcessCounter;
use super::Requester;
use crate::common::{
    ClosestContacts, Contact, FindNodeRequestArguments, FindValueRequestArguments, Id, MessageId,
    RequestSpecific, ResponseSpecific, MAX_BUCKET_SIZE_K,
};

/// Default number of parallel requests of one lookup.
pub const DEFAULT_ALPHA: usize = 4;
/// Default number of values a FIND_VALUE lookup collects before completing.
pub const DEFAULT_VALUE_QUORUM: usize = 1;

#[derive(Debug, Clone)]
pub struct LookupConfig {
    /// Size of the closest set a lookup converges on.
    ///
    /// Defaults to [MAX_BUCKET_SIZE_K]
    pub k: usize,
    /// Maximum parallel requests.
    ///
    /// Defaults to [DEFAULT_ALPHA]
    pub alpha: usize,
    /// Values to collect before a FIND_VALUE lookup completes.
    ///
    /// Defaults to [DEFAULT_VALUE_QUORUM]
    pub values: usize,
    /// Keep querying every candidate instead of stopping once the closest set is stable.
    ///
    /// Defaults to `false`
    pub exhaustive: bool,
    /// Pick the next candidate uniformly among the `k` closest instead of the closest one.
    ///
    /// Defaults to `false`
    pub randomize: bool,
    /// How often a lookup checks whether it is stalled, `None` disables boosting.
    ///
    /// Defaults to `None`
    pub boost_frequency: Option<Duration>,
    /// How long without any response before a lookup counts as stalled.
    ///
    /// Defaults to 1 second
    pub boost_timeout: Duration,
}

impl Default for LookupConfig {
    fn default() -> Self {
        LookupConfig {
            k: MAX_BUCKET_SIZE_K,
            alpha: DEFAULT_ALPHA,
            values: DEFAULT_VALUE_QUORUM,
            exhaustive: false,
            randomize: false,
            boost_frequency: None,
            boost_timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupKind {
    FindNode,
    FindValue,
}

/// Result of a completed lookup.
#[derive(Debug, Clone)]
pub struct LookupOutcome {
    pub target: Id,
    /// Contacts that answered, closest first.
    ///
    /// At most `k` of them unless the lookup was exhaustive.
    pub responded: Vec<Contact>,
    /// Longest chain of referrals followed.
    pub hops: usize,
    /// Requests that timed out or got an invalid or error response.
    pub errors: usize,
    pub elapsed: Duration,
}

/// Result of a FIND_VALUE lookup that found at least one value.
#[derive(Debug, Clone)]
pub struct ValueOutcome {
    pub key: Id,
    pub values: Vec<Box<[u8]>>,
    pub lookup: LookupOutcome,
}

#[derive(Debug)]
struct Inflight {
    contact: Contact,
    /// Sent by a boost, outside of the counter.
    boosted: bool,
}

/// One iterative lookup: repeatedly query the closest unvisited contacts, learning closer
/// contacts from their responses, until the closest set stops improving.
///
/// The lookup performs no I/O itself: requests go through a [Requester], responses and
/// failures are fed back by the owner, which calls [IterativeLookup::step] after each.
#[derive(Debug)]
pub struct IterativeLookup {
    kind: LookupKind,
    config: LookupConfig,
    localhost: Id,

    /// Every contact that answered, including the local node.
    responded: ClosestContacts,
    k_closest: ClosestContacts,
    to_query: ClosestContacts,
    /// Id -> hop it was discovered at.
    visited: HashMap<Id, usize>,
    inflight: HashMap<MessageId, Inflight>,
    counter: ProcessCounter,

    hops: usize,
    errors: usize,
    values: Vec<Box<[u8]>>,

    started_at: Instant,
    last_response_at: Instant,
    next_boost_at: Option<Instant>,
    done: bool,
}

impl IterativeLookup {
    pub fn new(
        localhost: &Contact,
        target: Id,
        kind: LookupKind,
        config: LookupConfig,
        now: Instant,
    ) -> Self {
        trace!(?target, ?kind, "New lookup");

        let mut responded = ClosestContacts::new(target);
        responded.add(localhost.clone());

        let mut visited = HashMap::new();
        visited.insert(*localhost.id(), 0);

        IterativeLookup {
            kind,
            localhost: *localhost.id(),
            responded,
            k_closest: ClosestContacts::bounded(target, config.k.max(1)),
            to_query: ClosestContacts::new(target),
            visited,
            inflight: HashMap::new(),
            counter: ProcessCounter::new(config.alpha),
            hops: 0,
            errors: 0,
            values: Vec::new(),
            started_at: now,
            last_response_at: now,
            next_boost_at: config.boost_frequency.map(|frequency| now + frequency),
            done: false,
            config,
        }
    }

    // === Getters ===

    pub fn target(&self) -> Id {
        self.to_query.target()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    #[cfg(test)]
    pub fn to_query(&self) -> &[Contact] {
        self.to_query.contacts()
    }

    #[cfg(test)]
    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    pub fn values(&self) -> &[Box<[u8]>] {
        &self.values
    }

    pub fn outcome(&self, now: Instant) -> LookupOutcome {
        let responded = if self.config.exhaustive {
            self.responded
                .contacts()
                .iter()
                .filter(|contact| contact.id() != &self.localhost)
                .cloned()
                .collect()
        } else {
            self.k_closest.contacts().to_vec()
        };

        LookupOutcome {
            target: self.target(),
            responded,
            hops: self.hops,
            errors: self.errors,
            elapsed: now.saturating_duration_since(self.started_at),
        }
    }

    // === Public Methods ===

    /// Queue candidates, normally the routing table's closest contacts to the target.
    pub fn seed<I: IntoIterator<Item = Contact>>(&mut self, candidates: I) {
        for contact in candidates {
            self.enqueue(contact, 0);
        }
    }

    /// Issue requests while there is headroom and a useful candidate, then check for
    /// termination.
    pub fn step<R: Requester>(&mut self, requester: &mut R, now: Instant) {
        if self.done {
            return;
        }

        while self.counter.has_headroom() && self.has_useful_candidate() {
            let Some(contact) = self.next_candidate() else {
                break;
            };

            if self.counter.try_start() && !self.send(requester, contact, false) {
                self.counter.finish();
            }
        }

        self.check_done(now);
    }

    /// Record a response to one of this lookup's requests.
    ///
    /// Returns `false` if the message id does not belong to this lookup.
    pub fn on_response(
        &mut self,
        message_id: &MessageId,
        responder: Contact,
        response: &ResponseSpecific,
        now: Instant,
    ) -> bool {
        let Some(inflight) = self.release(message_id) else {
            return false;
        };

        self.last_response_at = now;

        let hop = self
            .visited
            .get(responder.id())
            .copied()
            .unwrap_or_default()
            + 1;
        self.hops = self.hops.max(hop);

        // Prefer the fresher responder over the contact we queued.
        let mut responder = responder;
        responder.merge(&inflight.contact);

        self.responded.add(responder.clone());
        self.k_closest.add(responder);

        match response {
            ResponseSpecific::Nodes(args) => {
                for contact in &args.contacts {
                    self.enqueue(contact.clone(), hop);
                }
            }
            ResponseSpecific::Value(args) if self.kind == LookupKind::FindValue => {
                if self.values.len() < self.config.values {
                    self.values.push(args.value.clone());
                }

                if self.values.len() >= self.config.values {
                    debug!(target = ?self.target(), values = self.values.len(), "Lookup found enough values");
                    self.done = true;
                }
            }
            _ => {}
        }

        true
    }

    /// Record a timeout, an illegal response or an error response.
    ///
    /// Returns `false` if the message id does not belong to this lookup.
    pub fn on_failure(&mut self, message_id: &MessageId) -> bool {
        if self.release(message_id).is_none() {
            return false;
        }

        self.errors += 1;

        true
    }

    /// Inject one extra request if no response arrived for `boost_timeout`.
    pub fn boost<R: Requester>(&mut self, requester: &mut R, now: Instant) {
        let (Some(frequency), Some(next_boost_at)) =
            (self.config.boost_frequency, self.next_boost_at)
        else {
            return;
        };

        if self.done || now < next_boost_at {
            return;
        }

        self.next_boost_at = Some(now + frequency);

        if now.saturating_duration_since(self.last_response_at) < self.config.boost_timeout {
            return;
        }

        if let Some(contact) = self.next_candidate() {
            trace!(target = ?self.target(), to = ?contact.address(), "Boosting stalled lookup");

            self.send(requester, contact, true);
        }
    }

    /// Complete the lookup and return the ids of all requests still in flight, so the
    /// owner can cancel them.
    pub fn finish(&mut self) -> Vec<MessageId> {
        self.done = true;
        self.next_boost_at = None;

        self.inflight.drain().map(|(message_id, _)| message_id).collect()
    }

    // === Private Methods ===

    fn enqueue(&mut self, contact: Contact, hop: usize) {
        if contact.is_localhost() || self.visited.contains_key(contact.id()) {
            return;
        }

        self.visited.insert(*contact.id(), hop);
        self.to_query.add(contact);
    }

    fn request(&self) -> RequestSpecific {
        match self.kind {
            LookupKind::FindNode => RequestSpecific::FindNode(FindNodeRequestArguments {
                target: self.target(),
            }),
            LookupKind::FindValue => RequestSpecific::FindValue(FindValueRequestArguments {
                key: self.target(),
            }),
        }
    }

    fn send<R: Requester>(&mut self, requester: &mut R, contact: Contact, boosted: bool) -> bool {
        match requester.request(&contact, self.request()) {
            Some(message_id) => {
                self.inflight
                    .insert(message_id, Inflight { contact, boosted });
                true
            }
            None => {
                self.errors += 1;
                false
            }
        }
    }

    fn release(&mut self, message_id: &MessageId) -> Option<Inflight> {
        let inflight = self.inflight.remove(message_id)?;

        if !inflight.boosted {
            self.counter.finish();
        }

        Some(inflight)
    }

    fn has_useful_candidate(&self) -> bool {
        match self.to_query.closest() {
            None => false,
            Some(_) if self.config.exhaustive || !self.k_closest.is_full() => true,
            Some(candidate) => match self.k_closest.furthest() {
                Some(worst) => candidate.id().is_closer(worst.id(), &self.target()),
                None => true,
            },
        }
    }

    fn next_candidate(&mut self) -> Option<Contact> {
        if self.to_query.is_empty() {
            return None;
        }

        let index = if self.config.randomize {
            let window = self.to_query.len().min(self.config.k.max(1));
            rand::thread_rng().gen_range(0..window)
        } else {
            0
        };

        self.to_query.remove(index)
    }

    fn check_done(&mut self, now: Instant) {
        if self.done || !self.counter.is_idle() {
            return;
        }

        if self.to_query.is_empty() || !self.has_useful_candidate() {
            self.done = true;

            debug!(
                target = ?self.target(),
                responded = self.responded.len() - 1,
                visited = self.visited.len() - 1,
                hops = self.hops,
                errors = self.errors,
                elapsed = ?now.saturating_duration_since(self.started_at),
                "Done lookup"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;
    use crate::common::{NodesResponseArguments, ValueResponseArguments};
    use crate::core::testing::RecordingRequester;

    fn address(index: usize) -> SocketAddr {
        SocketAddr::from(([10, (index / 250) as u8, (index % 250) as u8, 1], 6881))
    }

    fn localhost() -> Contact {
        Contact::localhost(Id::random(), "127.0.0.1:6881".parse().unwrap())
    }

    fn nodes(contacts: Vec<Contact>) -> ResponseSpecific {
        ResponseSpecific::Nodes(NodesResponseArguments { contacts })
    }

    /// Contact whose id shares exactly `bits` leading bits with `target`.
    fn closer(target: &Id, bits: usize, index: usize) -> Contact {
        let id = Id::random_with_prefix(target, bits).with_bit(bits, !target.bit(bits));
        Contact::unknown(id, address(index))
    }

    #[test]
    fn learns_closer_contacts_and_terminates() {
        let now = Instant::now();
        let target = Id::random();

        let mut lookup = IterativeLookup::new(
            &localhost(),
            target,
            LookupKind::FindNode,
            LookupConfig::default(),
            now,
        );
        let mut requester = RecordingRequester::default();

        let seed = closer(&target, 1, 0);
        lookup.seed([seed.clone()]);
        lookup.step(&mut requester, now);

        let sent = requester.take();
        assert_eq!(sent.len(), 1);
        let (message_id, to, request) = &sent[0];
        assert_eq!(to.id(), seed.id());
        assert_eq!(
            request,
            &RequestSpecific::FindNode(FindNodeRequestArguments { target })
        );

        let learned = vec![
            closer(&target, 8, 1),
            closer(&target, 9, 2),
            closer(&target, 10, 3),
        ];
        assert!(lookup.on_response(message_id, seed.clone(), &nodes(learned.clone()), now));

        assert_eq!(lookup.to_query().len(), 3);
        for contact in &learned {
            assert!(lookup.to_query().iter().any(|c| c.id() == contact.id()));
        }

        lookup.step(&mut requester, now);
        let sent = requester.take();
        assert_eq!(sent.len(), 3);
        assert!(!lookup.is_done());

        for (message_id, to, _) in sent {
            // Each responder refers back to already visited contacts only.
            lookup.on_response(&message_id, to, &nodes(vec![seed.clone()]), now);
        }
        lookup.step(&mut requester, now);

        assert!(lookup.is_done());
        assert!(requester.take().is_empty());

        let outcome = lookup.outcome(now);
        assert_eq!(outcome.responded.len(), 4);
        assert_eq!(outcome.hops, 2);
        assert_eq!(outcome.errors, 0);
        assert_eq!(outcome.responded.last().map(|c| *c.id()), Some(*seed.id()));
    }

    #[test]
    fn value_quorum_completes_and_cancels_inflight() {
        let now = Instant::now();
        let key = Id::random();

        let mut lookup = IterativeLookup::new(
            &localhost(),
            key,
            LookupKind::FindValue,
            LookupConfig::default(),
            now,
        );
        let mut requester = RecordingRequester::default();

        lookup.seed((0..4).map(|i| closer(&key, 4, i)));
        lookup.step(&mut requester, now);

        let sent = requester.take();
        assert_eq!(sent.len(), 4);
        assert_eq!(lookup.inflight_len(), 4);

        let (message_id, to, _) = &sent[0];
        let value = ResponseSpecific::Value(ValueResponseArguments {
            key,
            value: b"hello".to_vec().into_boxed_slice(),
        });
        lookup.on_response(message_id, to.clone(), &value, now);

        assert!(lookup.is_done());
        assert_eq!(lookup.values(), &[b"hello".to_vec().into_boxed_slice()]);

        let mut cancelled = lookup.finish();
        cancelled.sort();
        let mut expected: Vec<MessageId> = sent[1..].iter().map(|(id, _, _)| *id).collect();
        expected.sort();
        assert_eq!(cancelled, expected);
        assert_eq!(lookup.inflight_len(), 0);
    }

    #[test]
    fn alpha_bounds_parallel_requests() {
        let now = Instant::now();
        let target = Id::random();
        let config = LookupConfig {
            alpha: 2,
            ..Default::default()
        };

        let mut lookup =
            IterativeLookup::new(&localhost(), target, LookupKind::FindNode, config, now);
        let mut requester = RecordingRequester::default();

        lookup.seed((0..10).map(|i| closer(&target, 0, i)));
        lookup.step(&mut requester, now);
        assert_eq!(lookup.inflight_len(), 2);

        let sent = requester.take();
        assert!(lookup.on_failure(&sent[0].0));
        assert!(!lookup.on_failure(&sent[0].0));

        lookup.step(&mut requester, now);
        assert_eq!(lookup.inflight_len(), 2);
        assert_eq!(lookup.outcome(now).errors, 1);
    }

    #[test]
    fn send_failures_do_not_stall() {
        let now = Instant::now();
        let target = Id::random();

        let mut lookup = IterativeLookup::new(
            &localhost(),
            target,
            LookupKind::FindNode,
            LookupConfig::default(),
            now,
        );
        let mut requester = RecordingRequester::offline();

        lookup.seed((0..6).map(|i| closer(&target, 0, i)));
        lookup.step(&mut requester, now);

        assert!(lookup.is_done());
        let outcome = lookup.outcome(now);
        assert!(outcome.responded.is_empty());
        assert_eq!(outcome.errors, 6);
    }

    #[test]
    fn converges_on_the_closest_nodes_of_a_simulated_network() {
        let now = Instant::now();
        let network: Vec<Contact> = (0..400)
            .map(|i| Contact::unknown(Id::random(), address(i)))
            .collect();

        let closest_to = |target: &Id| {
            let mut closest = ClosestContacts::bounded(*target, MAX_BUCKET_SIZE_K);
            for contact in &network {
                closest.add(contact.clone());
            }
            closest.contacts().to_vec()
        };

        let target = Id::random();
        let mut lookup = IterativeLookup::new(
            &localhost(),
            target,
            LookupKind::FindNode,
            LookupConfig::default(),
            now,
        );
        let mut requester = RecordingRequester::default();

        lookup.seed(network.iter().take(8).cloned());

        let mut rounds = 0;
        while !lookup.is_done() {
            rounds += 1;
            assert!(rounds < 1000, "lookup did not terminate");

            lookup.step(&mut requester, now);

            for (message_id, to, request) in requester.take() {
                let RequestSpecific::FindNode(args) = request else {
                    panic!("unexpected request");
                };
                lookup.on_response(&message_id, to, &nodes(closest_to(&args.target)), now);
            }
        }

        let outcome = lookup.outcome(now);
        assert!(outcome.responded.len() <= MAX_BUCKET_SIZE_K);

        let expected: Vec<Id> = closest_to(&target).iter().map(|c| *c.id()).collect();
        let found: Vec<Id> = outcome.responded.iter().map(|c| *c.id()).collect();
        assert_eq!(found, expected);
    }

    #[test]
    fn exhaustive_lookup_queries_every_candidate() {
        let now = Instant::now();
        let localhost = localhost();
        let network: Vec<Contact> = (0..3 * MAX_BUCKET_SIZE_K)
            .map(|i| Contact::unknown(Id::random(), address(i)))
            .collect();

        let target = Id::random();
        let config = LookupConfig {
            exhaustive: true,
            ..Default::default()
        };

        let mut lookup =
            IterativeLookup::new(&localhost, target, LookupKind::FindNode, config, now);
        let mut requester = RecordingRequester::default();

        lookup.seed(network.iter().take(1).cloned());

        // Every node knows the whole network, us included.
        let mut everyone = network.clone();
        everyone.push(localhost.clone());

        let mut queried = HashMap::new();
        let mut rounds = 0;
        while !lookup.is_done() {
            rounds += 1;
            assert!(rounds < 1000, "lookup did not terminate");

            lookup.step(&mut requester, now);

            for (message_id, to, _) in requester.take() {
                *queried.entry(*to.id()).or_insert(0) += 1;
                lookup.on_response(&message_id, to, &nodes(everyone.clone()), now);
            }
        }

        assert_eq!(queried.len(), network.len());
        assert!(queried.values().all(|count| *count == 1));
        assert!(!queried.contains_key(localhost.id()));

        let outcome = lookup.outcome(now);
        assert_eq!(outcome.responded.len(), network.len());
        assert!(outcome.responded.len() > MAX_BUCKET_SIZE_K);
        assert!(outcome
            .responded
            .iter()
            .all(|contact| contact.id() != localhost.id()));

        // Closest first.
        for pair in outcome.responded.windows(2) {
            assert!(pair[0].id().is_closer(pair[1].id(), &target));
        }
    }

    #[test]
    fn randomized_lookup_still_terminates() {
        let now = Instant::now();
        let target = Id::random();
        let config = LookupConfig {
            randomize: true,
            alpha: 3,
            ..Default::default()
        };

        let mut lookup =
            IterativeLookup::new(&localhost(), target, LookupKind::FindNode, config, now);
        let mut requester = RecordingRequester::default();

        lookup.seed((0..50).map(|i| closer(&target, 2, i)));

        while !lookup.is_done() {
            lookup.step(&mut requester, now);
            for (message_id, _, _) in requester.take() {
                lookup.on_failure(&message_id);
            }
        }

        assert_eq!(lookup.outcome(now).errors, 50);
    }

    #[test]
    fn boost_probes_a_stalled_lookup() {
        let now = Instant::now();
        let target = Id::random();
        let config = LookupConfig {
            alpha: 1,
            boost_frequency: Some(Duration::from_millis(100)),
            boost_timeout: Duration::from_millis(300),
            ..Default::default()
        };

        let mut lookup =
            IterativeLookup::new(&localhost(), target, LookupKind::FindNode, config, now);
        let mut requester = RecordingRequester::default();

        lookup.seed((0..5).map(|i| closer(&target, 0, i)));
        lookup.step(&mut requester, now);
        assert_eq!(requester.take().len(), 1);

        // Not stalled yet.
        lookup.boost(&mut requester, now + Duration::from_millis(150));
        assert!(requester.take().is_empty());

        lookup.boost(&mut requester, now + Duration::from_millis(400));
        let boosted = requester.take();
        assert_eq!(boosted.len(), 1);
        assert_eq!(lookup.inflight_len(), 2);

        // A boosted response does not free a counter slot.
        lookup.on_response(
            &boosted[0].0,
            boosted[0].1.clone(),
            &nodes(vec![]),
            now + Duration::from_millis(450),
        );
        lookup.step(&mut requester, now + Duration::from_millis(450));
        assert!(requester.take().is_empty());
    }
}
