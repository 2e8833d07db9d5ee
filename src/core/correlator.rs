//! Correlates outgoing requests with incoming responses.
//!
//! Every request is recorded as a [PendingRequest] keyed by its [MessageId] and is
//! resolved exactly once: by a response, by its deadline passing, or by cancellation,
//! whichever removes it from the table first.

use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use crc::{Crc, CRC_32_ISCSI};
use lru::LruCache;
use tracing::{debug, trace};

use crate::common::{
    sockaddr_to_bytes, ErrorSpecific, Id, Message, MessageId, MessageType, RequestKind,
    Verification,
};
use crate::core::OperationId;

const SECRET_SIZE: usize = 20;
const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Number of accepted message ids remembered to reject replays.
pub const SEEN_MESSAGES_HISTORY: usize = 512;

/// Issues message ids bound to the address they are sent to.
///
/// An id is a random nonce followed by a crc32c of a per-node secret, the nonce and
/// the destination address, so a response can only carry a valid id if it comes from
/// the address the request was sent to (or someone who saw the request).
#[derive(Clone)]
pub struct MessageFactory {
    secret: [u8; SECRET_SIZE],
}

impl Debug for MessageFactory {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "MessageFactory (_)")
    }
}

impl MessageFactory {
    pub fn new() -> Self {
        MessageFactory {
            secret: rand::random(),
        }
    }

    /// A fresh message id for a request to `to`.
    pub fn issue(&self, to: SocketAddr) -> MessageId {
        let nonce: [u8; 4] = rand::random();
        let signature = self.sign(&nonce, to);

        let mut bytes = [0_u8; 8];
        bytes[..4].copy_from_slice(&nonce);
        bytes[4..].copy_from_slice(&signature);

        MessageId(bytes)
    }

    /// Returns `true` if `message_id` was issued by this factory for `from`.
    pub fn verify(&self, message_id: &MessageId, from: SocketAddr) -> bool {
        let bytes = message_id.as_bytes();
        let mut nonce = [0_u8; 4];
        nonce.copy_from_slice(&bytes[..4]);

        bytes[4..] == self.sign(&nonce, from)
    }

    fn sign(&self, nonce: &[u8; 4], address: SocketAddr) -> [u8; 4] {
        let mut digest = CASTAGNOLI.digest();

        digest.update(&self.secret);
        digest.update(nonce);
        digest.update(&sockaddr_to_bytes(&address));

        digest.finalize().to_be_bytes()
    }
}

impl Default for MessageFactory {
    fn default() -> Self {
        Self::new()
    }
}

/// Why the [ResponseChecker] refused a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// This message id was already accepted recently.
    Duplicate,
    /// The message id was not issued for the sender's address.
    Spoofed,
}

/// Screens responses before they reach the pending requests table.
#[derive(Debug)]
pub struct ResponseChecker {
    factory: MessageFactory,
    seen: LruCache<MessageId, ()>,
}

impl ResponseChecker {
    pub fn new(factory: MessageFactory) -> Self {
        ResponseChecker {
            factory,
            seen: LruCache::new(
                NonZeroUsize::new(SEEN_MESSAGES_HISTORY).unwrap_or(NonZeroUsize::MIN),
            ),
        }
    }

    pub fn check(&mut self, message_id: &MessageId, from: SocketAddr) -> Result<(), Rejection> {
        if self.seen.contains(message_id) {
            return Err(Rejection::Duplicate);
        }

        if !self.factory.verify(message_id, from) {
            return Err(Rejection::Spoofed);
        }

        self.seen.put(*message_id, ());

        Ok(())
    }
}

/// Who is waiting for a request's outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOwner {
    /// A user-facing operation (lookup, store, ping, bootstrap).
    Operation(OperationId),
    /// A liveness or identity check requested by the routing table.
    Verify(Verification),
    /// A maintenance ping of a stale contact.
    Maintenance,
    /// Forwarding a stored value to a newly added contact.
    StoreForward,
}

/// An outstanding request.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub message_id: MessageId,
    /// Id of the contacted node, if known.
    pub to_id: Option<Id>,
    pub address: SocketAddr,
    pub owner: RequestOwner,
    pub kind: RequestKind,
    /// Target or key the request is about.
    pub key: Option<Id>,
    pub sent_at: Instant,
    pub deadline: Instant,
}

/// How an incoming response was resolved.
#[derive(Debug)]
pub enum Correlation {
    /// The response answers the pending request.
    Matched {
        request: PendingRequest,
        round_trip_time: Duration,
    },
    /// The response doesn't have the shape of an answer to the pending request.
    Illegal(PendingRequest),
    /// The responder answered with an error.
    Error {
        request: PendingRequest,
        error: ErrorSpecific,
    },
    /// No pending request for this id: it already timed out, or was never sent.
    Late,
    /// Refused by the [ResponseChecker].
    Rejected(Rejection),
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
/// Misuse of the [MessageCorrelator].
pub enum CorrelatorError {
    #[error("A request with message id {0} is already pending")]
    DuplicateMessageId(MessageId),
}

#[derive(Debug)]
/// Pending requests table.
pub struct MessageCorrelator {
    pending: HashMap<MessageId, PendingRequest>,
    checker: ResponseChecker,
}

impl MessageCorrelator {
    pub fn new(factory: MessageFactory) -> Self {
        MessageCorrelator {
            pending: HashMap::new(),
            checker: ResponseChecker::new(factory),
        }
    }

    // === Getters ===

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    #[cfg(test)]
    pub fn contains(&self, message_id: &MessageId) -> bool {
        self.pending.contains_key(message_id)
    }

    pub fn get(&self, message_id: &MessageId) -> Option<&PendingRequest> {
        self.pending.get(message_id)
    }

    // === Public Methods ===

    /// Record a request about to be sent.
    pub fn register(&mut self, request: PendingRequest) -> Result<(), CorrelatorError> {
        if self.pending.contains_key(&request.message_id) {
            return Err(CorrelatorError::DuplicateMessageId(request.message_id));
        }

        self.pending.insert(request.message_id, request);

        Ok(())
    }

    /// Resolve an incoming response or error message from `from`.
    pub fn on_response(&mut self, from: SocketAddr, message: &Message, now: Instant) -> Correlation {
        let message_id = message.message_id;

        if let Err(rejection) = self.checker.check(&message_id, from) {
            trace!(
                context = "response_checker",
                ?message_id,
                ?from,
                ?rejection,
                "Rejected response"
            );
            return Correlation::Rejected(rejection);
        }

        let Some(request) = self.pending.remove(&message_id) else {
            trace!(context = "correlator", ?message_id, ?from, "Late response");
            return Correlation::Late;
        };

        match &message.message_type {
            MessageType::Response(response) => {
                let expected_sender = request
                    .to_id
                    .map(|id| Some(id) == message.sender_id)
                    .unwrap_or(message.sender_id.is_some());

                if expected_sender && response.answers(request.kind, request.key.as_ref()) {
                    let round_trip_time = now.saturating_duration_since(request.sent_at);

                    Correlation::Matched {
                        request,
                        round_trip_time,
                    }
                } else {
                    debug!(
                        ?message_id,
                        ?from,
                        expected = ?request.kind,
                        "Illegal response"
                    );
                    Correlation::Illegal(request)
                }
            }
            MessageType::Error(error) => Correlation::Error {
                request,
                error: error.clone(),
            },
            MessageType::Request(_) => Correlation::Illegal(request),
        }
    }

    /// Remove and return every pending request whose deadline passed.
    pub fn expire(&mut self, now: Instant) -> Vec<PendingRequest> {
        let expired: Vec<MessageId> = self
            .pending
            .values()
            .filter(|request| request.deadline <= now)
            .map(|request| request.message_id)
            .collect();

        expired
            .iter()
            .filter_map(|message_id| self.pending.remove(message_id))
            .collect()
    }

    pub fn cancel(&mut self, message_id: &MessageId) -> Option<PendingRequest> {
        self.pending.remove(message_id)
    }

    /// Cancel every request issued on behalf of `owner`.
    pub fn cancel_owner(&mut self, owner: &RequestOwner) -> Vec<PendingRequest> {
        let ids: Vec<MessageId> = self
            .pending
            .values()
            .filter(|request| &request.owner == owner)
            .map(|request| request.message_id)
            .collect();

        ids.iter()
            .filter_map(|message_id| self.pending.remove(message_id))
            .collect()
    }
}
