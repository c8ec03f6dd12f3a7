pub mod channel;
pub mod client;
mod pool;
pub mod protocol;
pub mod router;
pub mod server;

pub use channel::{Channel, ChannelError, FramedBuffer};
pub use client::{Client, ClientError, ResponseCallback};
pub use protocol::{
    ConnectionId, ExecutionContext, Protocol, ProtocolError, Request, Response, Route, RouteError,
    Sendable,
};
pub use router::{DispatchError, DispatchFailure, ResponseSink, Router};
pub use server::{Server, ServerHandle, Stopper};
