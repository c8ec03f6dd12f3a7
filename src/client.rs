//! Client-side reactor event loop.
//!
//! Mirrors the server loop for one outbound connection: a dedicated thread
//! initiates a non-blocking connect, then alternates between write interest
//! (send the next queued request) and read interest (receive response bytes
//! and deliver them to the caller-supplied callback). Callers never block
//! after construction: [`Client::send_request`] queues the request and wakes
//! the reactor, and the response arrives through the callback on the reactor
//! thread. One request is in flight at a time; further requests wait queued.
//!
//! Construction is the single bounded wait in this crate: the caller blocks
//! until the connect completes or the timeout elapses, because a client
//! without a connection is unusable.

use std::collections::VecDeque;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use log::{debug, info, trace, warn};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Registry, Token, Waker};

use thiserror::Error;

use crate::channel::{ChannelError, FramedBuffer};
use crate::protocol::{Protocol, Sendable};

const STREAM: Token = Token(0);
const WAKER: Token = Token(1);

const READ_BUFFER_SIZE: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("could not connect to {addr} within {timeout:?}")]
    ConnectTimeout { addr: SocketAddr, timeout: Duration },
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("connection closed by server")]
    Closed,
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("client i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Receives the asynchronous outcome of one request.
///
/// Protocols that stream a response invoke [`on_response`](Self::on_response)
/// multiple times; `end_of_stream` is true exactly once, on the final
/// invocation.
pub trait ResponseCallback: Send + 'static {
    fn on_response(&mut self, data: &[u8], end_of_stream: bool);

    fn on_error(&mut self, error: &ClientError);
}

/// An asynchronous client for one remote endpoint.
pub struct Client<P: Protocol> {
    shared: Arc<ClientShared<P>>,
    reactor: Option<thread::JoinHandle<()>>,
    peer: SocketAddr,
}

struct ClientShared<P: Protocol> {
    queue: Mutex<VecDeque<(P::Request, Box<dyn ResponseCallback>)>>,
    waker: Waker,
    stopping: AtomicBool,
}

impl<P: Protocol> Client<P> {
    /// Connects to the given endpoint, spawning the client reactor thread.
    /// Blocks the caller until the connection is established; a connect that
    /// does not complete within `timeout` fails construction.
    pub fn connect(protocol: P, addr: SocketAddr, timeout: Duration) -> Result<Self, ClientError> {
        let mut stream = TcpStream::connect(addr)?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut stream, STREAM, Interest::WRITABLE)?;
        let waker = Waker::new(poll.registry(), WAKER)?;

        let shared = Arc::new(ClientShared {
            queue: Mutex::new(VecDeque::new()),
            waker,
            stopping: AtomicBool::new(false),
        });

        let (connected_tx, connected_rx) = mpsc::channel();
        let reactor = ClientReactor {
            stream,
            protocol: Arc::new(protocol),
            shared: Arc::clone(&shared),
            state: ClientState::Connecting,
            connected: Some(connected_tx),
            received: Vec::new(),
        };
        let handle = thread::Builder::new()
            .name(format!("client->{addr}"))
            .spawn(move || reactor.run(poll))
            .map_err(ClientError::Io)?;

        info!("waiting to connect to {addr} within {timeout:?}");
        let client = Self {
            shared,
            reactor: Some(handle),
            peer: addr,
        };
        match connected_rx.recv_timeout(timeout) {
            Ok(Ok(())) => Ok(client),
            Ok(Err(source)) => Err(ClientError::Connect { addr, source }),
            Err(_) => Err(ClientError::ConnectTimeout { addr, timeout }),
        }
        // on failure `client` is dropped here, which stops and joins the
        // reactor thread
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Schedules the request to be sent and returns immediately. The callback
    /// is invoked on the reactor thread when response bytes arrive.
    pub fn send_request(
        &self,
        request: P::Request,
        callback: impl ResponseCallback,
    ) -> Result<(), ClientError> {
        self.shared
            .queue
            .lock()
            .unwrap()
            .push_back((request, Box::new(callback)));
        self.shared.waker.wake()?;
        Ok(())
    }
}

impl<P: Protocol> Drop for Client<P> {
    fn drop(&mut self) {
        self.shared.stopping.store(true, Ordering::SeqCst);
        let _ = self.shared.waker.wake();
        if let Some(handle) = self.reactor.take() {
            let _ = handle.join();
        }
    }
}

enum ClientState {
    Connecting,
    Idle,
    AwaitingResponse(Box<dyn ResponseCallback>),
}

struct ClientReactor<P: Protocol> {
    stream: TcpStream,
    protocol: Arc<P>,
    shared: Arc<ClientShared<P>>,
    state: ClientState,
    connected: Option<mpsc::Sender<Result<(), io::Error>>>,
    received: Vec<u8>,
}

impl<P: Protocol> ClientReactor<P> {
    fn run(mut self, mut poll: Poll) {
        let mut events = Events::with_capacity(64);
        loop {
            if let Err(e) = poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!("poll failed, stopping client: {e}");
                break;
            }

            for event in events.iter() {
                match event.token() {
                    WAKER => {}
                    STREAM if event.is_writable() => self.write_ready(poll.registry()),
                    STREAM if event.is_readable() => self.read_ready(poll.registry()),
                    _ => {}
                }
            }

            self.arm_next_request(poll.registry());

            if self.shared.stopping.load(Ordering::SeqCst) {
                break;
            }
        }
        debug!("client reactor stopped");
    }

    fn write_ready(&mut self, registry: &Registry) {
        match self.state {
            ClientState::Connecting => self.finish_connect(registry),
            ClientState::Idle => self.send_next(registry),
            // response still outstanding; the next request is armed only
            // after it arrives
            ClientState::AwaitingResponse(_) => {}
        }
    }

    /// Completes the non-blocking connect once the socket reports writable.
    fn finish_connect(&mut self, registry: &Registry) {
        match self.stream.take_error() {
            Ok(Some(err)) | Err(err) => {
                self.fail_connect(err);
                return;
            }
            Ok(None) => {}
        }
        match self.stream.peer_addr() {
            Ok(peer) => {
                info!("connected to {peer}");
                self.state = ClientState::Idle;
                if let Some(tx) = self.connected.take() {
                    let _ = tx.send(Ok(()));
                }
                let _ = registry.reregister(&mut self.stream, STREAM, Interest::READABLE);
            }
            Err(ref e) if e.kind() == io::ErrorKind::NotConnected => {
                // connect still in progress, stay write-interested
            }
            Err(e) => self.fail_connect(e),
        }
    }

    fn fail_connect(&mut self, err: io::Error) {
        warn!("connect failed: {err}");
        if let Some(tx) = self.connected.take() {
            let _ = tx.send(Err(err));
        }
        self.shared.stopping.store(true, Ordering::SeqCst);
    }

    /// Sends the next queued request and flips the connection to read
    /// interest with the request's callback armed.
    fn send_next(&mut self, registry: &Registry) {
        let next = self.shared.queue.lock().unwrap().pop_front();
        let Some((request, mut callback)) = next else {
            let _ = registry.reregister(&mut self.stream, STREAM, Interest::READABLE);
            return;
        };

        debug!("sending request to {:?}", self.stream.peer_addr());
        let mut buffer = FramedBuffer::with_channel(&mut self.stream);
        let result = request.send(&mut buffer);
        drop(buffer);

        match result {
            Ok(()) => {
                self.received.clear();
                self.state = ClientState::AwaitingResponse(callback);
                let _ = registry.reregister(&mut self.stream, STREAM, Interest::READABLE);
            }
            Err(e) => {
                let error = ClientError::Channel(e);
                warn!("failed to send request: {error}");
                callback.on_error(&error);
                self.shared.stopping.store(true, Ordering::SeqCst);
            }
        }
    }

    fn read_ready(&mut self, registry: &Registry) {
        let mut bytes = Vec::new();
        let mut scratch = [0u8; READ_BUFFER_SIZE];
        let ended = loop {
            match self.stream.read(&mut scratch) {
                Ok(0) => break Some(ClientError::Closed),
                Ok(n) => bytes.extend_from_slice(&scratch[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break None,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => break Some(ClientError::Io(e)),
            }
        };

        if !bytes.is_empty() {
            self.deliver(&bytes);
        }

        if let Some(error) = ended {
            warn!("connection to server lost: {error}");
            if let ClientState::AwaitingResponse(mut callback) =
                std::mem::replace(&mut self.state, ClientState::Idle)
            {
                callback.on_error(&error);
            }
            let _ = registry.deregister(&mut self.stream);
            self.shared.stopping.store(true, Ordering::SeqCst);
        }
    }

    fn deliver(&mut self, bytes: &[u8]) {
        let state = std::mem::replace(&mut self.state, ClientState::Idle);
        if let ClientState::AwaitingResponse(mut callback) = state {
            self.received.extend_from_slice(bytes);
            let end = self.protocol.response_complete(&self.received);
            trace!("delivering {} response bytes, end={end}", bytes.len());
            callback.on_response(bytes, end);
            if !end {
                self.state = ClientState::AwaitingResponse(callback);
            }
        } else {
            warn!("discarding {} bytes with no request in flight", bytes.len());
            self.state = state;
        }
    }

    /// Registers write interest when a request is queued and none in flight.
    fn arm_next_request(&mut self, registry: &Registry) {
        if matches!(self.state, ClientState::Idle) && !self.shared.queue.lock().unwrap().is_empty()
        {
            let _ = registry.reregister(&mut self.stream, STREAM, Interest::WRITABLE);
        }
    }
}
