//! Wire-format-agnostic request/response contracts.
//!
//! Everything the reactor and router know about a concrete wire protocol flows
//! through the traits in this module. A [`Protocol`] is pure construction policy:
//! it parses raw bytes into a request, builds empty and error responses, and names
//! itself for diagnostic URLs. It performs no I/O of its own.
//!
//! Requests and responses gain wire access through composition rather than
//! inheritance: both implement [`Sendable`], which serializes onto a
//! [`FramedBuffer`](crate::channel::FramedBuffer) already bound to the connection.
//!
//! Routes are plain matcher + handler pairs registered in an explicit table; an
//! incoming request is matched against the table in registration order and the
//! first match wins.

use std::error::Error;
use std::fmt;

use thiserror::Error as ThisError;

use crate::channel::{Channel, ChannelError, FramedBuffer};

/// Identity of a reactor-owned connection. Correlates a request with the
/// connection its response must be written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Serialization onto a connection-bound buffer.
pub trait Sendable {
    /// Writes this value onto the given buffer and flushes it.
    fn send<C: Channel>(&self, buffer: &mut FramedBuffer<C>) -> Result<(), ChannelError>;
}

/// Input payload of one operation.
pub trait Request: Sendable + Send + Sync + 'static {
    /// Affirms that no response is expected by the caller.
    fn one_way(&self) -> bool {
        false
    }
}

/// Output payload tied 1:1 to the request that produced it.
pub trait Response: Sendable + Send + 'static {
    /// Affirms that this response represents an error condition.
    fn is_error(&self) -> bool {
        false
    }

    /// Directs the server to close the connection after this response has
    /// been written.
    fn close_connection(&self) -> bool {
        false
    }
}

/// Error raised by a route handler.
pub type RouteError = Box<dyn Error + Send + Sync>;

/// Environment a route executes in.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    name: String,
}

impl ExecutionContext {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A matcher + handler pair. Stateless across invocations; handlers run on
/// worker threads, never on the reactor thread.
pub trait Route<P: Protocol>: Send + Sync {
    /// Affirms if this route accepts the given request.
    fn matches(&self, request: &P::Request) -> bool;

    /// Executes the request, producing its response.
    fn execute(
        &self,
        ctx: &ExecutionContext,
        request: &P::Request,
    ) -> Result<P::Response, RouteError>;
}

/// Construction policy for one wire format.
pub trait Protocol: Send + Sync + 'static {
    type Request: Request;
    type Response: Response;

    /// Protocol name, used as the scheme of diagnostic URLs (e.g. `"http"`).
    fn name(&self) -> &str;

    /// Parses raw bytes read off a connection into a request.
    fn parse_request(&self, data: &[u8]) -> Result<Self::Request, ProtocolError>;

    /// An empty response for the given request, substituted when a one-way
    /// request completes.
    fn empty_response(&self, request: &Self::Request) -> Self::Response;

    /// An error response for a failed request. The request is absent when the
    /// raw bytes could not be parsed at all.
    fn error_response(
        &self,
        request: Option<&Self::Request>,
        error: &crate::router::DispatchError,
    ) -> Self::Response;

    /// Decides, from the response bytes a client has accumulated so far,
    /// whether the response is complete. Streaming protocols override this;
    /// by default one network read is one complete response.
    fn response_complete(&self, _data: &[u8]) -> bool {
        true
    }
}

/// Raised when raw bytes do not conform to the protocol grammar.
#[derive(Debug, ThisError)]
#[error("malformed request: {message}")]
pub struct ProtocolError {
    message: String,
    code: Option<u16>,
}

impl ProtocolError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    /// Attaches a protocol-specific error code (e.g. an HTTP status).
    pub fn with_code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }

    pub fn code(&self) -> Option<u16> {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_error_carries_optional_code() {
        let plain = ProtocolError::new("bad preamble");
        assert_eq!(plain.code(), None);

        let coded = ProtocolError::new("bad preamble").with_code(400);
        assert_eq!(coded.code(), Some(400));
        assert_eq!(coded.to_string(), "malformed request: bad preamble");
    }

    #[test]
    fn execution_context_names_itself() {
        let ctx = ExecutionContext::new("echo");
        assert_eq!(ctx.name(), "echo");
    }
}
