//! UDP socket layer managing incoming/outgoing requests and responses.

use std::fmt::Debug;
use std::io::{self, ErrorKind};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::common::{
    Contact, ErrorSpecific, Id, Message, MessageId, MessageType, RequestSpecific,
    ResponseSpecific, VERSION,
};
use crate::core::correlator::{
    Correlation, MessageCorrelator, MessageFactory, PendingRequest, RequestOwner,
};
use crate::core::timeout::TimeoutStrategy;
use crate::core::Requester;

const MTU: usize = 2048;

pub const DEFAULT_PORT: u16 = 6881;
/// The maximum duration to backoff checking the socket buffer after it is empty.
/// Lower values increases CPU usage, but reduces latency, and drains the buffer faster,
/// reducing the risk of packet loss.
pub const MAX_THREAD_BLOCK_DURATION: Duration = Duration::from_millis(10);

/// Sends and receives raw datagrams.
pub trait Transport: Send + Debug {
    fn send_to(&mut self, bytes: &[u8], to: SocketAddr) -> io::Result<()>;

    /// Non-blocking receive, `Ok(None)` if nothing is waiting.
    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;

    fn local_addr(&self) -> SocketAddr;
}

/// [Transport] over a non-blocking [UdpSocket].
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
}

impl UdpTransport {
    /// Bind to `port` on `bind_address`, or if no port is given, to [DEFAULT_PORT] and
    /// then to any free port.
    pub fn bind(bind_address: Option<IpAddr>, port: Option<u16>) -> io::Result<Self> {
        let bind_address = bind_address.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

        let socket = if let Some(port) = port {
            UdpSocket::bind(SocketAddr::from((bind_address, port)))?
        } else {
            match UdpSocket::bind(SocketAddr::from((bind_address, DEFAULT_PORT))) {
                Ok(socket) => Ok(socket),
                Err(_) => UdpSocket::bind(SocketAddr::from((bind_address, 0))),
            }?
        };

        let local_addr = socket.local_addr()?;

        socket.set_nonblocking(true)?;

        Ok(UdpTransport { socket, local_addr })
    }
}

impl Transport for UdpTransport {
    fn send_to(&mut self, bytes: &[u8], to: SocketAddr) -> io::Result<()> {
        self.socket.send_to(bytes, to).map(|_| ())
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.socket.recv_from(buf) {
            Ok(received) => Ok(Some(received)),
            Err(error) if error.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(error) => Err(error),
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// A [Transport] wrapper that formats DHT messages and correlates requests and responses.
#[derive(Debug)]
pub struct KrpcSocket {
    transport: Box<dyn Transport>,
    factory: MessageFactory,
    correlator: MessageCorrelator,
    timeout: Arc<dyn TimeoutStrategy>,
    local_id: Id,
    instance_id: u8,
    /// Requests that could not be sent, see [KrpcSocket::take_send_failures].
    send_failures: Vec<PendingRequest>,
}

impl KrpcSocket {
    pub fn new(
        transport: Box<dyn Transport>,
        local_id: Id,
        timeout: Arc<dyn TimeoutStrategy>,
    ) -> Self {
        let factory = MessageFactory::new();

        KrpcSocket {
            transport,
            correlator: MessageCorrelator::new(factory.clone()),
            factory,
            timeout,
            local_id,
            instance_id: rand::random(),
            send_failures: Vec::new(),
        }
    }

    // === Getters ===

    /// Returns the address the server is listening to.
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn instance_id(&self) -> u8 {
        self.instance_id
    }

    /// Number of requests waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.correlator.len()
    }

    // === Public Methods ===

    /// Send a request on behalf of `owner`, returns its message id, or `None` if it could
    /// not be sent. Requests the transport failed to send are kept for
    /// [KrpcSocket::take_send_failures].
    ///
    /// `to_id` is the id the responder must answer with, if known.
    pub fn request(
        &mut self,
        to_id: Option<Id>,
        address: SocketAddr,
        contact: Option<&Contact>,
        owner: RequestOwner,
        request: RequestSpecific,
    ) -> Option<MessageId> {
        let message_id = self.factory.issue(address);
        let now = Instant::now();

        let pending = PendingRequest {
            message_id,
            to_id,
            address,
            owner,
            kind: request.kind(),
            key: request.key(),
            sent_at: now,
            deadline: now + self.timeout.timeout(contact),
        };

        if let Err(error) = self.correlator.register(pending) {
            warn!(?error, "Refusing to send request");
            return None;
        }

        let message = self.message(message_id, MessageType::Request(request));

        match self.send(address, &message) {
            Ok(()) => Some(message_id),
            Err(error) => {
                debug!(?error, ?address, "Error sending request message");
                if let Some(request) = self.correlator.cancel(&message_id) {
                    self.send_failures.push(request);
                }
                None
            }
        }
    }

    /// A [Requester] sending on behalf of `owner`.
    pub fn requester(&mut self, owner: RequestOwner) -> SocketRequester<'_> {
        SocketRequester {
            socket: self,
            owner,
        }
    }

    /// Send a response to the given address.
    pub fn response(
        &mut self,
        address: SocketAddr,
        message_id: MessageId,
        response: ResponseSpecific,
    ) {
        let message = self.message(message_id, MessageType::Response(response));

        let _ = self.send(address, &message).map_err(|e| {
            debug!(?e, "Error sending response message");
        });
    }

    /// Send an error to the given address.
    pub fn error(&mut self, address: SocketAddr, message_id: MessageId, error: ErrorSpecific) {
        let message = self.message(message_id, MessageType::Error(error));

        let _ = self.send(address, &message).map_err(|e| {
            debug!(?e, "Error sending error message");
        });
    }

    /// Receives a single krpc message on the socket.
    /// On success, returns the dht message and the origin.
    pub fn recv_from(&mut self) -> Option<(Message, SocketAddr)> {
        let mut buf = [0u8; MTU];

        match self.transport.recv_from(&mut buf) {
            Ok(Some((amt, from))) => {
                let bytes = &buf[..amt];

                if from.port() == 0 {
                    trace!(
                        context = "socket_validation",
                        message = "Response from port 0"
                    );
                    return None;
                }

                match Message::from_bytes(bytes) {
                    Ok(message) => {
                        trace!(
                            context = "socket_message_receiving",
                            ?message,
                            ?from,
                            "Received message"
                        );

                        return Some((message, from));
                    }
                    Err(error) => {
                        trace!(
                            context = "socket_error",
                            ?error,
                            ?from,
                            message = ?String::from_utf8_lossy(bytes),
                            "Received invalid Bencode message."
                        );
                    }
                }
            }
            Ok(None) => {}
            Err(error) => {
                warn!("IO error {error}")
            }
        }

        None
    }

    /// Resolve a response or error message against the pending requests.
    pub fn correlate(&mut self, from: SocketAddr, message: &Message, now: Instant) -> Correlation {
        self.correlator.on_response(from, message, now)
    }

    /// Remove and return requests whose deadline passed.
    pub fn expire(&mut self, now: Instant) -> Vec<PendingRequest> {
        self.correlator.expire(now)
    }

    pub fn cancel(&mut self, message_id: &MessageId) -> Option<PendingRequest> {
        self.correlator.cancel(message_id)
    }

    pub fn cancel_owner(&mut self, owner: &RequestOwner) -> Vec<PendingRequest> {
        self.correlator.cancel_owner(owner)
    }

    /// Drain requests the transport failed to send since the last call.
    ///
    /// Their owners already got `None` from [KrpcSocket::request].
    pub fn take_send_failures(&mut self) -> Vec<PendingRequest> {
        std::mem::take(&mut self.send_failures)
    }

    // === Private Methods ===

    fn message(&self, message_id: MessageId, message_type: MessageType) -> Message {
        Message {
            message_id,
            version: Some(VERSION),
            sender_id: Some(self.local_id),
            instance_id: self.instance_id,
            message_type,
        }
    }

    /// Send a raw dht message
    fn send(&mut self, address: SocketAddr, message: &Message) -> crate::Result<()> {
        self.transport.send_to(&message.to_bytes()?, address)?;
        trace!(context = "socket_message_sending", message = ?message);
        Ok(())
    }
}

/// Sends requests through a [KrpcSocket] on behalf of one owner.
#[derive(Debug)]
pub struct SocketRequester<'a> {
    socket: &'a mut KrpcSocket,
    owner: RequestOwner,
}

impl Requester for SocketRequester<'_> {
    fn request(&mut self, to: &Contact, request: RequestSpecific) -> Option<MessageId> {
        self.socket.request(
            Some(*to.id()),
            to.address(),
            Some(to),
            self.owner.clone(),
            request,
        )
    }
}

#[cfg(test)]
mod test {
    use std::thread;

    use crate::common::FindNodeRequestArguments;
    use crate::core::correlator::Rejection;
    use crate::core::timeout::FixedTimeout;
    use crate::core::OperationId;

    use super::*;

    fn socket() -> KrpcSocket {
        let transport = UdpTransport::bind(Some(Ipv4Addr::LOCALHOST.into()), Some(0)).unwrap();

        KrpcSocket::new(
            Box::new(transport),
            Id::random(),
            Arc::new(FixedTimeout::default()),
        )
    }

    fn receive(socket: &mut KrpcSocket) -> (Message, SocketAddr) {
        for _ in 0..1000 {
            if let Some(received) = socket.recv_from() {
                return received;
            }
            thread::sleep(Duration::from_millis(1));
        }

        panic!("nothing received");
    }

    #[test]
    fn request_and_response() {
        let mut server = socket();
        let mut client = socket();

        let server_id = server.local_id;
        let owner = RequestOwner::Operation(OperationId(1));
        let request = RequestSpecific::FindNode(FindNodeRequestArguments {
            target: Id::random(),
        });

        let message_id = client
            .request(
                Some(server_id),
                server.local_addr(),
                None,
                owner.clone(),
                request.clone(),
            )
            .unwrap();
        assert!(client.correlator.contains(&message_id));

        let (message, from) = receive(&mut server);
        assert_eq!(from, client.local_addr());
        assert_eq!(message.message_id, message_id);
        assert_eq!(message.sender_id, Some(client.local_id));
        assert_eq!(message.version, Some(VERSION));
        assert_eq!(message.message_type, MessageType::Request(request));

        server.response(from, message.message_id, ResponseSpecific::Pong);

        let (response, from) = receive(&mut client);
        assert_eq!(from, server.local_addr());

        // A pong doesn't answer a FIND_NODE.
        let correlation = client.correlate(from, &response, Instant::now());
        assert!(matches!(correlation, Correlation::Illegal(request) if request.owner == owner));
        assert!(!client.correlator.contains(&message_id));
    }

    #[test]
    fn response_from_wrong_address_is_rejected() {
        let mut server = socket();
        let mut impostor = socket();
        let mut client = socket();

        let message_id = client
            .request(
                None,
                server.local_addr(),
                None,
                RequestOwner::Maintenance,
                RequestSpecific::Ping,
            )
            .unwrap();

        let (message, from) = receive(&mut server);
        impostor.response(from, message.message_id, ResponseSpecific::Pong);

        let (response, from) = receive(&mut client);
        assert_eq!(from, impostor.local_addr());

        let correlation = client.correlate(from, &response, Instant::now());
        assert!(matches!(
            correlation,
            Correlation::Rejected(Rejection::Spoofed)
        ));
        assert!(client.correlator.contains(&message_id));

        server.response(client.local_addr(), message_id, ResponseSpecific::Pong);
        let (response, from) = receive(&mut client);

        assert!(matches!(
            client.correlate(from, &response, Instant::now()),
            Correlation::Matched { .. }
        ));
    }

    #[test]
    fn requests_time_out() {
        let mut client = socket();
        let address: SocketAddr = "127.0.0.1:9".parse().unwrap();

        let message_id = client
            .request(
                None,
                address,
                None,
                RequestOwner::Maintenance,
                RequestSpecific::Ping,
            )
            .unwrap();

        assert!(client.expire(Instant::now()).is_empty());

        let expired = client.expire(Instant::now() + Duration::from_secs(3));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].message_id, message_id);
        assert_eq!(client.pending_requests(), 0);
    }
}
