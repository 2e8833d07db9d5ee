//! Core DHT logic - pure computation with no direct I/O.
//!
//! Contains the operation state machines (`lookup`, `store`), the request
//! correlator, the `server` request handler, and stateful helpers
//! (`routing_maintenance`, `store_forward`, `value_store`).
//! All I/O orchestration lives in `actor/`, which calls into this module.

pub(crate) mod correlator;
pub(crate) mod lookup;
pub(crate) mod process_counter;
pub(crate) mod routing_maintenance;
pub(crate) mod server;
pub(crate) mod store;
pub(crate) mod store_forward;
pub(crate) mod timeout;
pub(crate) mod value_store;

use std::fmt::{self, Display, Formatter};

use crate::common::{Contact, MessageId, RequestSpecific};

/// Identifies one user-facing operation inside the actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(pub u64);

impl Display for OperationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// Sends requests on behalf of an operation.
///
/// Implemented by the actor on top of the correlator and the transport, and by
/// simulated networks in tests.
pub trait Requester {
    /// Send `request` to `to`, returning the id of the pending request, or `None` if it
    /// could not be sent.
    fn request(&mut self, to: &Contact, request: RequestSpecific) -> Option<MessageId>;
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;

    use super::*;

    /// Records requests instead of sending them.
    #[derive(Debug, Default)]
    pub struct RecordingRequester {
        next: u64,
        pub sent: VecDeque<(MessageId, Contact, RequestSpecific)>,
        /// Fail every send when set.
        pub offline: bool,
    }

    impl RecordingRequester {
        /// A requester failing every send.
        pub fn offline() -> Self {
            RecordingRequester {
                offline: true,
                ..Default::default()
            }
        }

        pub fn take(&mut self) -> Vec<(MessageId, Contact, RequestSpecific)> {
            self.sent.drain(..).collect()
        }
    }

    impl Requester for RecordingRequester {
        fn request(&mut self, to: &Contact, request: RequestSpecific) -> Option<MessageId> {
            if self.offline {
                return None;
            }

            self.next += 1;
            let message_id = MessageId(self.next.to_be_bytes());
            self.sent.push_back((message_id, to.clone(), request));

            Some(message_id)
        }
    }
}
