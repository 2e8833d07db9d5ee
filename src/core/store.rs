//! Replicate a value to the closest contacts of its key.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

use super::lookup::LookupOutcome;
use super::process_counter::ProcessCounter;
use super::Requester;
use crate::common::{Contact, Id, MessageId, RequestSpecific, StoreRequestArguments};

/// Default number of parallel STORE requests.
pub const DEFAULT_STORE_PARALLELISM: usize = 4;
/// Default number of acknowledgements a store aims for.
pub const DEFAULT_STORE_REPLICAS: usize = 8;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Maximum parallel STORE requests (S).
    ///
    /// Defaults to [DEFAULT_STORE_PARALLELISM]
    pub parallelism: usize,
    /// Acknowledgements to collect before completing (W), clamped to the number of
    /// closest contacts a lookup returns.
    ///
    /// Defaults to [DEFAULT_STORE_REPLICAS]
    pub replicas: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            parallelism: DEFAULT_STORE_PARALLELISM,
            replicas: DEFAULT_STORE_REPLICAS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreOutcome {
    pub key: Id,
    /// Contacts that acknowledged, in the order they did.
    pub acknowledgements: Vec<Contact>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Error)]
#[error("No contact acknowledged storing key {key} after {elapsed:?}")]
pub struct StoreError {
    pub key: Id,
    pub value: Box<[u8]>,
    pub elapsed: Duration,
}

/// Result of a put: the lookup that found the key's closest contacts, and the store to them.
#[derive(Debug, Clone)]
pub struct PutOutcome {
    pub lookup: LookupOutcome,
    pub store: StoreOutcome,
}

/// Bounded fan-out of STORE requests until enough acknowledgements arrive or the
/// candidates run out.
#[derive(Debug)]
pub struct StoreQuery {
    key: Id,
    value: Box<[u8]>,
    replicas: usize,
    candidates: VecDeque<Contact>,
    inflight: HashMap<MessageId, Contact>,
    counter: ProcessCounter,
    acknowledgements: Vec<Contact>,
    attempted: usize,
    started_at: Instant,
    done: bool,
}

impl StoreQuery {
    /// `contacts` are tried in the given order, normally closest first.
    ///
    /// `k` is the upper bound for the number of replicas.
    pub fn new(
        key: Id,
        value: Box<[u8]>,
        contacts: Vec<Contact>,
        config: &StoreConfig,
        k: usize,
        now: Instant,
    ) -> Self {
        let mut replicas = config.replicas.max(1);

        if replicas > k {
            warn!(
                replicas,
                k, "Store replicas exceeds the bucket size, clamping"
            );
            replicas = k.max(1);
        }

        StoreQuery {
            key,
            value,
            replicas,
            candidates: contacts.into(),
            inflight: HashMap::new(),
            counter: ProcessCounter::new(config.parallelism),
            acknowledgements: Vec::new(),
            attempted: 0,
            started_at: now,
            done: false,
        }
    }

    // === Getters ===

    #[cfg(test)]
    pub fn key(&self) -> Id {
        self.key
    }

    #[cfg(test)]
    pub fn replicas(&self) -> usize {
        self.replicas
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    #[cfg(test)]
    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    #[cfg(test)]
    pub fn attempted(&self) -> usize {
        self.attempted
    }

    /// Only meaningful once [StoreQuery::is_done].
    pub fn outcome(&self, now: Instant) -> Result<StoreOutcome, StoreError> {
        let elapsed = now.saturating_duration_since(self.started_at);

        if self.acknowledgements.is_empty() {
            return Err(StoreError {
                key: self.key,
                value: self.value.clone(),
                elapsed,
            });
        }

        Ok(StoreOutcome {
            key: self.key,
            acknowledgements: self.acknowledgements.clone(),
            elapsed,
        })
    }

    // === Public Methods ===

    pub fn step<R: Requester>(&mut self, requester: &mut R, now: Instant) {
        if self.done {
            return;
        }

        while self.counter.has_headroom()
            && self.acknowledgements.len() + self.inflight.len() < self.replicas
        {
            let Some(contact) = self.candidates.pop_front() else {
                break;
            };

            if !self.counter.try_start() {
                self.candidates.push_front(contact);
                break;
            }

            self.attempted += 1;

            let request = RequestSpecific::Store(StoreRequestArguments {
                key: self.key,
                value: self.value.clone(),
            });

            match requester.request(&contact, request) {
                Some(message_id) => {
                    self.inflight.insert(message_id, contact);
                }
                None => self.counter.finish(),
            }
        }

        if self.counter.is_idle()
            && (self.acknowledgements.len() >= self.replicas || self.candidates.is_empty())
        {
            self.done = true;

            debug!(
                key = ?self.key,
                acknowledgements = self.acknowledgements.len(),
                attempted = self.attempted,
                elapsed = ?now.saturating_duration_since(self.started_at),
                "Done store"
            );
        }
    }

    /// Returns `false` if the message id does not belong to this store.
    pub fn on_ack(&mut self, message_id: &MessageId, responder: Contact) -> bool {
        let Some(mut contact) = self.inflight.remove(message_id) else {
            return false;
        };

        self.counter.finish();

        contact.merge(&responder);
        self.acknowledgements.push(contact);

        true
    }

    /// Timeout, illegal response or error response.
    pub fn on_failure(&mut self, message_id: &MessageId) -> bool {
        if self.inflight.remove(message_id).is_none() {
            return false;
        }

        self.counter.finish();

        true
    }

    /// Complete now, returning the ids of requests still in flight.
    pub fn finish(&mut self) -> Vec<MessageId> {
        self.done = true;

        self.inflight.drain().map(|(message_id, _)| message_id).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;
    use crate::core::testing::RecordingRequester;

    fn contacts(count: usize) -> Vec<Contact> {
        (0..count)
            .map(|i| Contact::unknown(Id::random(), SocketAddr::from(([10, 0, i as u8, 1], 6881))))
            .collect()
    }

    fn query(count: usize, parallelism: usize, replicas: usize) -> StoreQuery {
        let config = StoreConfig {
            parallelism,
            replicas,
        };

        StoreQuery::new(
            Id::random(),
            b"value".to_vec().into_boxed_slice(),
            contacts(count),
            &config,
            20,
            Instant::now(),
        )
    }

    #[test]
    fn parallelism_is_bounded_and_every_contact_is_tried() {
        let now = Instant::now();
        let mut store = query(5, 2, 5);
        let mut requester = RecordingRequester::default();

        let mut attempted = 0;
        while !store.is_done() {
            store.step(&mut requester, now);
            assert!(store.inflight_len() <= 2);

            for (message_id, _, request) in requester.take() {
                assert!(matches!(request, RequestSpecific::Store(_)));
                attempted += 1;
                store.on_failure(&message_id);
            }
        }

        assert_eq!(attempted, 5);
        assert_eq!(store.attempted(), 5);

        let error = store.outcome(now).unwrap_err();
        assert_eq!(error.key, store.key());
        assert_eq!(&*error.value, b"value");
    }

    #[test]
    fn one_acknowledgement_is_success() {
        let now = Instant::now();
        let mut store = query(3, 3, 3);
        let mut requester = RecordingRequester::default();

        store.step(&mut requester, now);
        let sent = requester.take();
        assert_eq!(sent.len(), 3);

        assert!(store.on_ack(&sent[1].0, sent[1].1.clone()));
        assert!(!store.on_ack(&sent[1].0, sent[1].1.clone()));
        store.on_failure(&sent[0].0);
        store.on_failure(&sent[2].0);
        store.step(&mut requester, now);

        assert!(store.is_done());
        let outcome = store.outcome(now).unwrap();
        assert_eq!(outcome.acknowledgements.len(), 1);
        assert_eq!(outcome.acknowledgements[0].id(), sent[1].1.id());
    }

    #[test]
    fn stops_at_replication_target() {
        let now = Instant::now();
        let mut store = query(10, 4, 2);
        let mut requester = RecordingRequester::default();

        store.step(&mut requester, now);
        let sent = requester.take();
        // Never more in flight than acknowledgements still needed.
        assert_eq!(sent.len(), 2);

        for (message_id, to, _) in sent {
            store.on_ack(&message_id, to);
        }
        store.step(&mut requester, now);

        assert!(store.is_done());
        assert!(requester.take().is_empty());
        assert_eq!(store.outcome(now).unwrap().acknowledgements.len(), 2);
    }

    #[test]
    fn replicas_are_clamped_to_k() {
        let config = StoreConfig {
            parallelism: 4,
            replicas: 50,
        };

        let store = StoreQuery::new(
            Id::random(),
            Box::new([]),
            contacts(3),
            &config,
            20,
            Instant::now(),
        );

        assert_eq!(store.replicas(), 20);
    }

    #[test]
    fn no_candidates_fails() {
        let now = Instant::now();
        let mut store = query(0, 2, 2);
        let mut requester = RecordingRequester::default();

        store.step(&mut requester, now);

        assert!(store.is_done());
        assert!(store.outcome(now).is_err());
    }
}
