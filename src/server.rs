//! Server-side reactor event loop.
//!
//! One thread owns the listening socket and every accepted connection: it
//! multiplexes readiness with [`mio::Poll`], reads raw request bytes, hands
//! them to the [`Router`](crate::router::Router), and writes completed
//! responses back on the connection that produced them. Request execution
//! never happens here — the router runs routes on worker threads and posts
//! results back through the reactor's mailbox, which wakes the blocked poll.
//! Keeping every socket read and write on this single thread is what makes
//! concurrent request processing safe without per-socket locking.
//!
//! Each connection carries an explicit state record:
//!
//! ```text
//! AwaitingRequest --bytes read--> Processing --response posted--> AwaitingWrite
//!        ^                                                            |
//!        +---------------------response written----------------------+
//! ```
//!
//! Exactly one interest (read or write) is registered per connection at any
//! time. A connection-level failure closes and deregisters that connection
//! only; the reactor loop itself runs until its [`Stopper`] is fired.

use std::collections::HashMap;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use log::{debug, info, trace, warn};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token, Waker};

use crate::channel::FramedBuffer;
use crate::protocol::{ConnectionId, Protocol, Response, Route, Sendable};
use crate::router::{ResponseSink, Router};

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_CONNECTION: u64 = 2;
const READ_BUFFER_SIZE: usize = 8 * 1024;

/// A server for asynchronous request/response processing over one protocol.
///
/// Construction binds the listener; [`start`](Server::start) spawns the
/// reactor thread and the router's completion thread and returns a
/// [`ServerHandle`] for shutdown.
pub struct Server<P: Protocol> {
    name: String,
    protocol: Arc<P>,
    router: Arc<Router<P>>,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl<P: Protocol> Server<P> {
    pub fn new(name: impl Into<String>, addr: SocketAddr, protocol: P) -> io::Result<Self> {
        let name = name.into();
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        let protocol = Arc::new(protocol);
        let router = Arc::new(Router::new(Arc::clone(&protocol), &name));
        Ok(Self {
            name,
            protocol,
            router,
            listener,
            local_addr,
        })
    }

    /// Registers a route; first registered match wins at dispatch time.
    pub fn add_route(&self, route: impl Route<P> + 'static) {
        self.router.add_route(route);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Diagnostic URL `<protocol>://<ip>:<port>`, purely informational.
    pub fn url(&self) -> String {
        format!(
            "{}://{}:{}",
            self.protocol.name(),
            self.local_addr.ip(),
            self.local_addr.port()
        )
    }

    /// Starts the reactor thread and the router completion thread.
    pub fn start(mut self) -> io::Result<ServerHandle<P>> {
        info!("starting {} at {}", self.name, self.url());
        if !self.router.has_routes() {
            warn!("no route is registered with {}", self.name);
        }

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut self.listener, LISTENER, Interest::READABLE)?;
        let waker = Waker::new(poll.registry(), WAKER)?;

        let mailbox = Arc::new(Mailbox {
            posted: Mutex::new(Vec::new()),
            waker,
            stopping: AtomicBool::new(false),
        });

        let completion_thread = {
            let router = Arc::clone(&self.router);
            let poster = ResponsePoster {
                mailbox: Arc::clone(&mailbox),
            };
            thread::Builder::new()
                .name(format!("{}-router", self.name))
                .spawn(move || router.run_completions(poster))?
        };

        let stopper = Stopper {
            mailbox: Arc::clone(&mailbox),
            router: Arc::clone(&self.router),
        };
        let url = self.url();
        let local_addr = self.local_addr;

        let reactor = Reactor {
            name: self.name.clone(),
            listener: self.listener,
            protocol: self.protocol,
            router: self.router,
            mailbox,
            connections: HashMap::new(),
            next_token: FIRST_CONNECTION,
        };
        let io_thread = thread::Builder::new()
            .name(format!("{}-io", self.name))
            .spawn(move || reactor.run(poll))?;

        Ok(ServerHandle {
            url,
            local_addr,
            stopper,
            io_thread,
            completion_thread,
        })
    }
}

/// Handle to a started server.
pub struct ServerHandle<P: Protocol> {
    url: String,
    local_addr: SocketAddr,
    stopper: Stopper<P>,
    io_thread: thread::JoinHandle<()>,
    completion_thread: thread::JoinHandle<()>,
}

impl<P: Protocol> ServerHandle<P> {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A clonable stopper, e.g. for wiring into a signal handler.
    pub fn stopper(&self) -> Stopper<P> {
        self.stopper.clone()
    }

    /// Stops both server threads and waits for them to finish.
    pub fn stop(self) {
        self.stopper.stop();
        let _ = self.io_thread.join();
        let _ = self.completion_thread.join();
    }
}

/// Terminates the reactor and completion loops on their next wake.
pub struct Stopper<P: Protocol> {
    mailbox: Arc<Mailbox<P>>,
    router: Arc<Router<P>>,
}

impl<P: Protocol> Clone for Stopper<P> {
    fn clone(&self) -> Self {
        Self {
            mailbox: Arc::clone(&self.mailbox),
            router: Arc::clone(&self.router),
        }
    }
}

impl<P: Protocol> Stopper<P> {
    pub fn stop(&self) {
        info!("shutdown requested");
        self.mailbox.stopping.store(true, Ordering::SeqCst);
        let _ = self.mailbox.waker.wake();
        self.router.shutdown();
    }
}

/// Cross-thread hand-off of completed responses back to the reactor.
struct Mailbox<P: Protocol> {
    posted: Mutex<Vec<(ConnectionId, P::Response)>>,
    waker: Waker,
    stopping: AtomicBool,
}

/// The single entry point worker threads use to reach the reactor: queues
/// the response under the originating connection and wakes the blocked poll
/// so the new write interest is observed promptly.
struct ResponsePoster<P: Protocol> {
    mailbox: Arc<Mailbox<P>>,
}

impl<P: Protocol> ResponseSink<P> for ResponsePoster<P> {
    fn post_response(&self, origin: ConnectionId, response: P::Response) {
        self.mailbox.posted.lock().unwrap().push((origin, response));
        if let Err(e) = self.mailbox.waker.wake() {
            warn!("failed to wake reactor: {e}");
        }
    }
}

enum ConnState<P: Protocol> {
    AwaitingRequest,
    Processing,
    AwaitingWrite(P::Response),
}

struct Connection<P: Protocol> {
    stream: TcpStream,
    peer: SocketAddr,
    state: ConnState<P>,
}

struct Reactor<P: Protocol> {
    name: String,
    listener: TcpListener,
    protocol: Arc<P>,
    router: Arc<Router<P>>,
    mailbox: Arc<Mailbox<P>>,
    connections: HashMap<Token, Connection<P>>,
    next_token: u64,
}

enum ReadOutcome {
    Data(Vec<u8>),
    Nothing,
    Eof,
    Failed(io::Error),
}

impl<P: Protocol> Reactor<P> {
    fn run(mut self, mut poll: Poll) {
        let mut events = Events::with_capacity(256);
        loop {
            if let Err(e) = poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!("poll failed, stopping reactor: {e}");
                break;
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept_ready(poll.registry()),
                    WAKER => {}
                    token if event.is_readable() => self.read_ready(poll.registry(), token),
                    token if event.is_writable() => self.write_ready(poll.registry(), token),
                    _ => {}
                }
            }

            self.drain_mailbox(poll.registry());

            if self.mailbox.stopping.load(Ordering::SeqCst) {
                break;
            }
        }
        info!("{} reactor stopped", self.name);
    }

    fn accept_ready(&mut self, registry: &Registry) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    let token = Token(self.next_token as usize);
                    self.next_token += 1;
                    if let Err(e) = registry.register(&mut stream, token, Interest::READABLE) {
                        warn!("failed to register connection from {peer}: {e}");
                        continue;
                    }
                    info!("accepted connection from {peer}");
                    self.connections.insert(
                        token,
                        Connection {
                            stream,
                            peer,
                            state: ConnState::AwaitingRequest,
                        },
                    );
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("broken connection: {e:?}");
                    break;
                }
            }
        }
    }

    /// Reads whatever bytes are available and hands them to the router. The
    /// reactor does not wait for the execution result; a synchronous dispatch
    /// failure is answered with the protocol's error response right here.
    fn read_ready(&mut self, registry: &Registry, token: Token) {
        let outcome = {
            let Some(conn) = self.connections.get_mut(&token) else {
                return;
            };
            let mut data = Vec::new();
            let mut scratch = [0u8; READ_BUFFER_SIZE];
            loop {
                match conn.stream.read(&mut scratch) {
                    Ok(0) => break ReadOutcome::Eof,
                    Ok(n) => data.extend_from_slice(&scratch[..n]),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        break if data.is_empty() {
                            // no data yet, keep read interest
                            ReadOutcome::Nothing
                        } else {
                            ReadOutcome::Data(data)
                        };
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => break ReadOutcome::Failed(e),
                }
            }
        };

        match outcome {
            ReadOutcome::Nothing => {}
            ReadOutcome::Eof => {
                debug!("connection closed by remote peer");
                self.close_connection(registry, token);
            }
            ReadOutcome::Failed(e) => {
                warn!("read failed: {e}");
                self.close_connection(registry, token);
            }
            ReadOutcome::Data(data) => {
                trace!("read {} bytes on {}", data.len(), ConnectionId(token.0 as u64));
                match self.router.process_request(ConnectionId(token.0 as u64), &data) {
                    Ok(()) => {
                        if let Some(conn) = self.connections.get_mut(&token) {
                            conn.state = ConnState::Processing;
                        }
                    }
                    Err(failure) => {
                        debug!("dispatch failed: {}", failure.error);
                        let response = self
                            .protocol
                            .error_response(failure.request.as_ref(), &failure.error);
                        self.queue_write(registry, token, response);
                    }
                }
            }
        }
    }

    /// Serializes the attached response on the connection, then either closes
    /// it (protocol close directive) or returns it to read interest.
    fn write_ready(&mut self, registry: &Registry, token: Token) {
        let result = {
            let Some(conn) = self.connections.get_mut(&token) else {
                return;
            };
            let state = std::mem::replace(&mut conn.state, ConnState::AwaitingRequest);
            let ConnState::AwaitingWrite(response) = state else {
                // spurious writable event; fall back to reading
                let _ = registry.reregister(&mut conn.stream, token, Interest::READABLE);
                return;
            };
            debug!("sending response to {}", conn.peer);
            let mut buffer = FramedBuffer::with_channel(&mut conn.stream);
            let sent = response.send(&mut buffer);
            drop(buffer);
            sent.map(|_| response.close_connection())
        };

        match result {
            Ok(true) => self.close_connection(registry, token),
            Ok(false) => {
                if let Some(conn) = self.connections.get_mut(&token) {
                    if let Err(e) = registry.reregister(&mut conn.stream, token, Interest::READABLE)
                    {
                        warn!("failed to rearm read interest: {e}");
                        self.close_connection(registry, token);
                    }
                }
            }
            Err(e) => {
                warn!("failed to write response: {e}");
                self.close_connection(registry, token);
            }
        }
    }

    /// Moves every posted response onto its connection and registers write
    /// interest for it.
    fn drain_mailbox(&mut self, registry: &Registry) {
        let posted: Vec<_> = self.mailbox.posted.lock().unwrap().drain(..).collect();
        for (origin, response) in posted {
            self.queue_write(registry, Token(origin.0 as usize), response);
        }
    }

    fn queue_write(&mut self, registry: &Registry, token: Token, response: P::Response) {
        let Some(conn) = self.connections.get_mut(&token) else {
            warn!(
                "dropping response for vanished {}",
                ConnectionId(token.0 as u64)
            );
            return;
        };
        conn.state = ConnState::AwaitingWrite(response);
        if let Err(e) = registry.reregister(&mut conn.stream, token, Interest::WRITABLE) {
            warn!("failed to arm write interest: {e}");
            self.close_connection(registry, token);
        }
    }

    fn close_connection(&mut self, registry: &Registry, token: Token) {
        if let Some(mut conn) = self.connections.remove(&token) {
            let _ = registry.deregister(&mut conn.stream);
            info!("closed connection to {}", conn.peer);
        }
    }
}
