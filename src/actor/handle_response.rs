use std::net::SocketAddr;
use std::time::Instant;

use tracing::{debug, trace};

use crate::common::{Contact, Message, MessageType};
use crate::core::correlator::{Correlation, PendingRequest, RequestOwner};

use super::{Actor, OperationEvent};

impl Actor {
    /// Handle an inbound response or error: resolve it against the pending requests,
    /// learn from it, and hand it to the operation that sent the request.
    pub(super) fn handle_response(&mut self, from: SocketAddr, message: Message) {
        let now = Instant::now();

        match self.socket.correlate(from, &message, now) {
            Correlation::Matched {
                request,
                round_trip_time,
            } => {
                let (MessageType::Response(response), Some(sender_id)) =
                    (&message.message_type, message.sender_id)
                else {
                    debug!(?from, "Response without a sender id");
                    self.request_failed(request, true, now);
                    return;
                };

                let responder = Contact::solicited(sender_id, from, round_trip_time)
                    .with_instance_id(message.instance_id);

                self.routing_table.record_success();

                if let Some(contacts) = message.get_closer_contacts() {
                    for contact in contacts {
                        if contact.id() != self.id() {
                            self.routing_table.add(contact.clone());
                        }
                    }
                }

                match request.owner {
                    RequestOwner::Verify(verification) => {
                        self.routing_table
                            .verification_succeeded(&verification, responder);
                    }
                    RequestOwner::Operation(id) => {
                        self.routing_table.add(responder.clone());

                        self.advance(
                            id,
                            OperationEvent::Response {
                                message_id: request.message_id,
                                responder,
                                response,
                            },
                            now,
                        );
                    }
                    RequestOwner::Maintenance | RequestOwner::StoreForward => {
                        self.routing_table.add(responder);
                    }
                }
            }
            Correlation::Illegal(request) => {
                debug!(?from, kind = ?request.kind, "Response does not answer the request");

                self.request_failed(request, true, now);
            }
            Correlation::Error { request, error } => {
                debug!(?from, kind = ?request.kind, ?error, "Error response");

                // The contact is alive, it just refused.
                self.request_failed(request, false, now);
            }
            Correlation::Late => {
                trace!(?from, "Late or duplicate response");
            }
            Correlation::Rejected(rejection) => {
                debug!(?from, ?rejection, "Rejected response");
            }
        }
    }

    /// Report a failed request to its owner, and to the routing table if `io_error`.
    pub(super) fn request_failed(&mut self, request: PendingRequest, io_error: bool, now: Instant) {
        if io_error {
            if let Some(id) = request.to_id {
                self.routing_table.handle_io_error(&id, request.address);
            }
        }

        match request.owner {
            RequestOwner::Verify(verification) => {
                self.routing_table.verification_failed(&verification);
            }
            RequestOwner::Operation(id) => {
                self.advance(
                    id,
                    OperationEvent::Failure {
                        message_id: request.message_id,
                    },
                    now,
                );
            }
            RequestOwner::Maintenance | RequestOwner::StoreForward => {}
        }
    }
}
