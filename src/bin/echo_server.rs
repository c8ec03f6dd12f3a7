use std::error::Error;
use std::net::SocketAddr;
use std::sync::mpsc;

use clap::Parser;
use log::info;

use patchbay::channel::{Channel, ChannelError, FramedBuffer};
use patchbay::{
    DispatchError, ExecutionContext, Protocol, ProtocolError, Request, Response, Route, RouteError,
    Sendable, Server,
};

/// A line-echo server: every CRLF-terminated request line is answered with
/// the same line.
#[derive(Debug, Parser)]
struct Cli {
    /// Listen for new connections at address
    address: SocketAddr,
    /// Logical server name
    #[arg(long, default_value = "echo")]
    name: String,
}

struct EchoRequest {
    line: String,
}

impl Sendable for EchoRequest {
    fn send<C: Channel>(&self, buffer: &mut FramedBuffer<C>) -> Result<(), ChannelError> {
        buffer.write_str(&self.line)?.write_crlf()?;
        buffer.flush()
    }
}

impl Request for EchoRequest {}

struct EchoResponse {
    line: String,
    error: bool,
}

impl Sendable for EchoResponse {
    fn send<C: Channel>(&self, buffer: &mut FramedBuffer<C>) -> Result<(), ChannelError> {
        buffer.write_str(&self.line)?.write_crlf()?;
        buffer.flush()
    }
}

impl Response for EchoResponse {
    fn is_error(&self) -> bool {
        self.error
    }
}

struct EchoProtocol;

impl Protocol for EchoProtocol {
    type Request = EchoRequest;
    type Response = EchoResponse;

    fn name(&self) -> &str {
        "echo"
    }

    fn parse_request(&self, data: &[u8]) -> Result<EchoRequest, ProtocolError> {
        let line = std::str::from_utf8(data)
            .map_err(|_| ProtocolError::new("request is not utf-8"))?
            .trim_end()
            .to_string();
        Ok(EchoRequest { line })
    }

    fn empty_response(&self, _request: &EchoRequest) -> EchoResponse {
        EchoResponse {
            line: String::new(),
            error: false,
        }
    }

    fn error_response(&self, _request: Option<&EchoRequest>, error: &DispatchError) -> EchoResponse {
        EchoResponse {
            line: format!("error: {error}"),
            error: true,
        }
    }
}

/// Accepts every request and echoes its line back.
struct EchoRoute;

impl Route<EchoProtocol> for EchoRoute {
    fn matches(&self, _request: &EchoRequest) -> bool {
        true
    }

    fn execute(
        &self,
        _ctx: &ExecutionContext,
        request: &EchoRequest,
    ) -> Result<EchoResponse, RouteError> {
        Ok(EchoResponse {
            line: request.line.clone(),
            error: false,
        })
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let server = Server::new(cli.name, cli.address, EchoProtocol)?;
    server.add_route(EchoRoute);
    info!("echoing at {}", server.url());
    let handle = server.start()?;

    let stopper = handle.stopper();
    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        stopper.stop();
        let _ = tx.send(());
    })?;

    rx.recv()?;
    handle.stop();
    Ok(())
}
