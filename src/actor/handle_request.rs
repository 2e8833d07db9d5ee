use std::net::SocketAddr;

use tracing::debug;

use crate::common::{Contact, Message, MessageType};

use super::Actor;

impl Actor {
    /// Answer an inbound request, then add the requester to the routing table. An answered
    /// request counts as a successful exchange.
    ///
    /// Requests without a sender id are dropped.
    pub(super) fn handle_request(&mut self, from: SocketAddr, message: Message) {
        let MessageType::Request(request) = message.message_type else {
            return;
        };

        let Some(sender_id) = message.sender_id else {
            debug!(?from, "Request without a sender id");
            return;
        };

        if sender_id == *self.id() {
            debug!(?from, "Request claiming our own id");
            return;
        }

        let requester = Contact::unsolicited(sender_id, from).with_instance_id(message.instance_id);

        match self
            .server
            .handle_request(&self.routing_table, &requester, request)
        {
            Some(MessageType::Response(response)) => {
                self.socket.response(from, message.message_id, response)
            }
            Some(MessageType::Error(error)) => self.socket.error(from, message.message_id, error),
            // Filtered out, don't learn from it either.
            _ => return,
        }

        self.routing_table.record_success();
        self.routing_table.add(requester);
    }
}
