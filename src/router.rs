//! Request routing and asynchronous dispatch.
//!
//! The router turns raw bytes read off a connection into a matched route
//! execution, runs the route on a worker pool, and correlates the asynchronous
//! result back to the originating connection. It never performs socket I/O
//! itself: completed responses are handed to a [`ResponseSink`], which the
//! owning reactor implements as its cross-thread mailbox.
//!
//! # Correlation
//!
//! Each submitted execution is keyed by an `ExecutionId` in a lock-guarded
//! pending table holding the originating connection and the request. Workers
//! push `(id, result)` pairs onto a completion channel; a dedicated completion
//! loop drains the channel, removes the pending entry, and posts the outcome.
//! The removal is the linearization point: every entry is delivered to exactly
//! one terminal handler, never twice.
//!
//! # Failure handling
//!
//! Parse failures and unroutable requests are reported synchronously to the
//! caller of [`Router::process_request`] — no task is submitted and the caller
//! (the reactor) is responsible for answering with an error response. Failures
//! inside a route handler are captured by the completion loop and posted as
//! the protocol's error response, exactly as a success would be.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, mpsc};

use log::{debug, warn};
use thiserror::Error;

use crate::pool::WorkerPool;
use crate::protocol::{
    ConnectionId, ExecutionContext, Protocol, ProtocolError, Request, Route, RouteError,
};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("no route matches the request")]
    NoRoute { code: Option<u16> },
    #[error("route execution failed: {0}")]
    Execution(#[source] RouteError),
}

/// A synchronous dispatch failure, paired with the parsed request when
/// parsing got that far. The request lets a protocol echo request context
/// (a path, a method) in the error response it builds for an unroutable
/// request; it is `None` only when the raw bytes could not be parsed.
pub struct DispatchFailure<P: Protocol> {
    pub error: DispatchError,
    pub request: Option<P::Request>,
}

impl<P: Protocol> fmt::Debug for DispatchFailure<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchFailure")
            .field("error", &self.error)
            .field("has_request", &self.request.is_some())
            .finish()
    }
}

/// Where completed responses go. Implemented by the server's reactor mailbox;
/// tests substitute recording sinks.
pub trait ResponseSink<P: Protocol>: Send + Sync + 'static {
    /// Callable from any thread; must not block on socket I/O.
    fn post_response(&self, origin: ConnectionId, response: P::Response);
}

/// Handle of one in-flight route execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ExecutionId(u64);

struct Pending<P: Protocol> {
    origin: ConnectionId,
    request: Arc<P::Request>,
}

enum Completion<P: Protocol> {
    Finished {
        id: ExecutionId,
        result: Result<P::Response, RouteError>,
    },
    Shutdown,
}

pub struct Router<P: Protocol> {
    protocol: Arc<P>,
    ctx: Arc<ExecutionContext>,
    routes: Mutex<Vec<Arc<dyn Route<P>>>>,
    pool: WorkerPool,
    pending: Mutex<HashMap<ExecutionId, Pending<P>>>,
    completions: mpsc::Sender<Completion<P>>,
    inbox: Mutex<Option<mpsc::Receiver<Completion<P>>>>,
    next_id: AtomicU64,
}

impl<P: Protocol> Router<P> {
    pub fn new(protocol: Arc<P>, name: &str) -> Self {
        let (completions, inbox) = mpsc::channel();
        Self {
            protocol,
            ctx: Arc::new(ExecutionContext::new(name)),
            routes: Mutex::new(Vec::new()),
            pool: WorkerPool::new(name),
            pending: Mutex::new(HashMap::new()),
            completions,
            inbox: Mutex::new(Some(inbox)),
            next_id: AtomicU64::new(0),
        }
    }

    /// Registers a route. Registration order is significant: an incoming
    /// request is handled by the first route that matches it.
    pub fn add_route(&self, route: impl Route<P> + 'static) {
        self.routes.lock().unwrap().push(Arc::new(route));
    }

    pub fn has_routes(&self) -> bool {
        !self.routes.lock().unwrap().is_empty()
    }

    /// Number of requests currently awaiting completion.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Parses the raw bytes, matches them to a route, and submits the
    /// execution to the worker pool.
    ///
    /// Returns synchronously with a [`DispatchFailure`] when the bytes cannot
    /// be parsed or no route matches; nothing is submitted in that case and
    /// the caller must answer the connection itself, using the parsed request
    /// the failure carries when there is one.
    pub fn process_request(
        &self,
        origin: ConnectionId,
        data: &[u8],
    ) -> Result<(), DispatchFailure<P>> {
        let request = match self.protocol.parse_request(data) {
            Ok(request) => request,
            Err(e) => {
                return Err(DispatchFailure {
                    error: e.into(),
                    request: None,
                });
            }
        };

        let found = self
            .routes
            .lock()
            .unwrap()
            .iter()
            .find(|route| route.matches(&request))
            .cloned();
        let Some(route) = found else {
            return Err(DispatchFailure {
                error: DispatchError::NoRoute { code: None },
                request: Some(request),
            });
        };

        let id = ExecutionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let request = Arc::new(request);
        self.pending.lock().unwrap().insert(
            id,
            Pending {
                origin,
                request: Arc::clone(&request),
            },
        );
        debug!("submitting {id:?} from {origin}");

        let ctx = Arc::clone(&self.ctx);
        let completions = self.completions.clone();
        self.pool.execute(move || {
            let result = route.execute(&ctx, &request);
            // a closed channel means the completion loop has already stopped
            let _ = completions.send(Completion::Finished { id, result });
        });
        Ok(())
    }

    /// Drains completed executions until [`shutdown`](Self::shutdown) is
    /// called. Runs on a dedicated thread owned by the server.
    pub fn run_completions<S: ResponseSink<P>>(&self, sink: S) {
        let Some(inbox) = self.inbox.lock().unwrap().take() else {
            warn!("completion loop is already draining this router");
            return;
        };
        loop {
            match inbox.recv() {
                Ok(Completion::Finished { id, result }) => self.deliver(id, result, &sink),
                Ok(Completion::Shutdown) | Err(_) => break,
            }
        }
        debug!("completion loop stopped");
    }

    /// Stops the completion loop on its next wake.
    pub fn shutdown(&self) {
        let _ = self.completions.send(Completion::Shutdown);
    }

    fn deliver<S: ResponseSink<P>>(
        &self,
        id: ExecutionId,
        result: Result<P::Response, RouteError>,
        sink: &S,
    ) {
        // removal is the linearization point: whoever removes the entry owns
        // the single terminal delivery for this execution
        let Some(Pending { origin, request }) = self.pending.lock().unwrap().remove(&id) else {
            warn!("dropping completion for unknown execution {id:?}");
            return;
        };

        match result {
            Ok(response) => {
                if request.one_way() {
                    // substitute an empty response so the connection still
                    // transitions write -> read like any other request
                    debug!("one-way request on {origin}, posting empty response");
                    sink.post_response(origin, self.protocol.empty_response(&request));
                } else {
                    sink.post_response(origin, response);
                }
            }
            Err(error) => {
                warn!("route execution failed for {origin}: {error}");
                let error = DispatchError::Execution(error);
                let response = self.protocol.error_response(Some(&request), &error);
                sink.post_response(origin, response);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{self, Read, Write};
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc::{Receiver, Sender, channel};
    use std::thread;
    use std::time::{Duration, Instant};

    use crate::channel::{Channel, ChannelError, FramedBuffer};
    use crate::protocol::{Request as RequestTrait, Response as ResponseTrait, Sendable};

    use super::*;

    struct TextRequest {
        line: String,
    }

    impl Sendable for TextRequest {
        fn send<C: Channel>(&self, buffer: &mut FramedBuffer<C>) -> Result<(), ChannelError> {
            buffer.write_str(&self.line)?.write_crlf()?;
            buffer.flush()
        }
    }

    impl RequestTrait for TextRequest {
        fn one_way(&self) -> bool {
            self.line.starts_with("notify ")
        }
    }

    #[derive(Debug, PartialEq)]
    struct TextResponse {
        body: String,
        error: bool,
    }

    impl Sendable for TextResponse {
        fn send<C: Channel>(&self, buffer: &mut FramedBuffer<C>) -> Result<(), ChannelError> {
            buffer.write_str(&self.body)?.write_crlf()?;
            buffer.flush()
        }
    }

    impl ResponseTrait for TextResponse {
        fn is_error(&self) -> bool {
            self.error
        }
    }

    struct TextProtocol;

    impl Protocol for TextProtocol {
        type Request = TextRequest;
        type Response = TextResponse;

        fn name(&self) -> &str {
            "text"
        }

        fn parse_request(&self, data: &[u8]) -> Result<TextRequest, ProtocolError> {
            let line = std::str::from_utf8(data)
                .map_err(|_| ProtocolError::new("request is not utf-8"))?
                .trim()
                .to_string();
            if line.is_empty() {
                return Err(ProtocolError::new("empty request").with_code(400));
            }
            Ok(TextRequest { line })
        }

        fn empty_response(&self, _request: &TextRequest) -> TextResponse {
            TextResponse {
                body: String::new(),
                error: false,
            }
        }

        fn error_response(
            &self,
            _request: Option<&TextRequest>,
            error: &DispatchError,
        ) -> TextResponse {
            TextResponse {
                body: format!("error: {error}"),
                error: true,
            }
        }
    }

    struct MatchAll {
        reply: &'static str,
    }

    impl Route<TextProtocol> for MatchAll {
        fn matches(&self, _request: &TextRequest) -> bool {
            true
        }

        fn execute(
            &self,
            _ctx: &ExecutionContext,
            _request: &TextRequest,
        ) -> Result<TextResponse, RouteError> {
            Ok(TextResponse {
                body: self.reply.to_string(),
                error: false,
            })
        }
    }

    struct MatchPath {
        path: &'static str,
        reply: &'static str,
    }

    impl Route<TextProtocol> for MatchPath {
        fn matches(&self, request: &TextRequest) -> bool {
            request.line == self.path
        }

        fn execute(
            &self,
            _ctx: &ExecutionContext,
            _request: &TextRequest,
        ) -> Result<TextResponse, RouteError> {
            Ok(TextResponse {
                body: self.reply.to_string(),
                error: false,
            })
        }
    }

    struct FailingRoute;

    impl Route<TextProtocol> for FailingRoute {
        fn matches(&self, _request: &TextRequest) -> bool {
            true
        }

        fn execute(
            &self,
            _ctx: &ExecutionContext,
            _request: &TextRequest,
        ) -> Result<TextResponse, RouteError> {
            Err("handler blew up".into())
        }
    }

    #[derive(Clone)]
    struct RecordingSink {
        posts: Sender<(ConnectionId, TextResponse)>,
    }

    impl RecordingSink {
        fn new() -> (Self, Receiver<(ConnectionId, TextResponse)>) {
            let (posts, drained) = channel();
            (Self { posts }, drained)
        }
    }

    impl ResponseSink<TextProtocol> for RecordingSink {
        fn post_response(&self, origin: ConnectionId, response: TextResponse) {
            self.posts.send((origin, response)).unwrap();
        }
    }

    fn running_router(
        routes: impl FnOnce(&Router<TextProtocol>),
    ) -> (
        Arc<Router<TextProtocol>>,
        Receiver<(ConnectionId, TextResponse)>,
        thread::JoinHandle<()>,
    ) {
        let router = Arc::new(Router::new(Arc::new(TextProtocol), "test"));
        routes(&router);
        let (sink, drained) = RecordingSink::new();
        let completion_router = Arc::clone(&router);
        let handle = thread::spawn(move || completion_router.run_completions(sink));
        (router, drained, handle)
    }

    #[test]
    fn first_registered_match_wins() {
        let (router, drained, handle) = running_router(|router| {
            router.add_route(MatchAll { reply: "first" });
            router.add_route(MatchPath {
                path: "/x",
                reply: "second",
            });
        });

        router.process_request(ConnectionId(1), b"/x").unwrap();

        let (origin, response) = drained.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(origin, ConnectionId(1));
        assert_eq!(response.body, "first");

        router.shutdown();
        handle.join().unwrap();
    }

    #[test]
    fn no_route_fails_synchronously_with_the_parsed_request() {
        let router: Router<TextProtocol> = Router::new(Arc::new(TextProtocol), "test");
        router.add_route(MatchPath {
            path: "/known",
            reply: "known",
        });

        let failure = router
            .process_request(ConnectionId(1), b"/unknown")
            .unwrap_err();

        assert!(matches!(failure.error, DispatchError::NoRoute { .. }));
        // the request parsed fine, so it rides back for the error response
        assert_eq!(failure.request.expect("parsed request").line, "/unknown");
        assert_eq!(router.pending_count(), 0);
    }

    #[test]
    fn parse_failure_fails_synchronously_without_a_request() {
        let router: Router<TextProtocol> = Router::new(Arc::new(TextProtocol), "test");
        router.add_route(MatchAll { reply: "any" });

        let failure = router.process_request(ConnectionId(1), b"   ").unwrap_err();

        assert!(matches!(failure.error, DispatchError::Protocol(_)));
        assert!(failure.request.is_none());
        assert_eq!(router.pending_count(), 0);
    }

    #[test]
    fn failed_execution_posts_error_response() {
        let (router, drained, handle) = running_router(|router| {
            router.add_route(FailingRoute);
        });

        router.process_request(ConnectionId(7), b"/boom").unwrap();

        let (origin, response) = drained.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(origin, ConnectionId(7));
        assert!(response.error);
        assert!(response.body.contains("handler blew up"));

        router.shutdown();
        handle.join().unwrap();
    }

    #[test]
    fn one_way_request_posts_empty_response() {
        let (router, drained, handle) = running_router(|router| {
            router.add_route(MatchAll { reply: "loud" });
        });

        router
            .process_request(ConnectionId(3), b"notify /event")
            .unwrap();

        let (origin, response) = drained.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(origin, ConnectionId(3));
        assert_eq!(response.body, "");
        assert!(!response.error);

        router.shutdown();
        handle.join().unwrap();
    }

    /// A fake channel that counts overlapping entries into `write`.
    #[derive(Clone)]
    struct CountingChannel {
        active: Arc<AtomicUsize>,
        overlaps: Arc<AtomicUsize>,
        written: Arc<Mutex<Vec<u8>>>,
    }

    impl CountingChannel {
        fn new() -> Self {
            Self {
                active: Arc::new(AtomicUsize::new(0)),
                overlaps: Arc::new(AtomicUsize::new(0)),
                written: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl Read for CountingChannel {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }
    }

    impl Write for CountingChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.active.fetch_add(1, Ordering::SeqCst) > 0 {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            // stay inside the write long enough for an overlap to be seen
            thread::sleep(Duration::from_millis(1));
            self.written.lock().unwrap().extend_from_slice(buf);
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct WiretapSink {
        buffer: Mutex<FramedBuffer<CountingChannel>>,
    }

    impl ResponseSink<TextProtocol> for WiretapSink {
        fn post_response(&self, _origin: ConnectionId, response: TextResponse) {
            // try_lock never waits: a simultaneous delivery panics here
            // instead of quietly serializing on the lock
            let mut buffer = self
                .buffer
                .try_lock()
                .expect("simultaneous response delivery");
            response.send(&mut buffer).unwrap();
        }
    }

    #[test]
    fn concurrent_requests_never_write_the_channel_simultaneously() {
        let channel = CountingChannel::new();
        let router = Arc::new(Router::new(Arc::new(TextProtocol), "test"));
        router.add_route(MatchAll { reply: "ack" });
        let sink = WiretapSink {
            buffer: Mutex::new(FramedBuffer::with_channel(channel.clone())),
        };
        let completion_router = Arc::clone(&router);
        let handle = thread::spawn(move || completion_router.run_completions(sink));

        const N: usize = 16;
        let submitters: Vec<_> = (0..N)
            .map(|i| {
                let router = Arc::clone(&router);
                thread::spawn(move || {
                    router
                        .process_request(ConnectionId(i as u64), b"/load")
                        .unwrap();
                })
            })
            .collect();
        for submitter in submitters {
            submitter.join().unwrap();
        }

        let expected = "ack\r\n".repeat(N);
        let deadline = Instant::now() + Duration::from_secs(5);
        while channel.written.lock().unwrap().len() < expected.len() {
            assert!(Instant::now() < deadline, "responses never finished");
            thread::sleep(Duration::from_millis(10));
        }

        assert_eq!(channel.overlaps.load(Ordering::SeqCst), 0);
        assert_eq!(*channel.written.lock().unwrap(), expected.as_bytes());

        router.shutdown();
        handle.join().unwrap();
    }

    #[test]
    fn each_request_is_delivered_exactly_once() {
        let (router, drained, handle) = running_router(|router| {
            router.add_route(MatchAll { reply: "ack" });
        });

        const N: u64 = 32;
        let submitters: Vec<_> = (0..N)
            .map(|i| {
                let router = Arc::clone(&router);
                thread::spawn(move || {
                    router
                        .process_request(ConnectionId(i), format!("/req/{i}").as_bytes())
                        .unwrap();
                })
            })
            .collect();
        for submitter in submitters {
            submitter.join().unwrap();
        }

        let mut seen = std::collections::HashSet::new();
        for _ in 0..N {
            let (origin, response) = drained.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(response.body, "ack");
            assert!(seen.insert(origin), "connection {origin} answered twice");
        }
        assert!(
            drained.recv_timeout(Duration::from_millis(200)).is_err(),
            "no extra deliveries expected"
        );
        assert_eq!(router.pending_count(), 0);

        router.shutdown();
        handle.join().unwrap();
    }
}
