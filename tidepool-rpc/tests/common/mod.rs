//! Shared fixtures for the integration suites.
#![allow(dead_code)]

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tidepool_core::{JsonCodec, TokioProviders};
use tidepool_rpc::{
    FrameCodec, RequestHandler, RpcResult, RpcServer, ServerConfig, ServerConnection,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EchoRequest {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EchoResponse {
    pub message: String,
    pub length: usize,
}

pub fn echo_request(message: &str) -> EchoRequest {
    EchoRequest {
        message: message.to_string(),
    }
}

/// Replies immediately, echoing the payload.
pub struct EchoHandler;

#[async_trait(?Send)]
impl RequestHandler for EchoHandler {
    type Request = EchoRequest;
    type Response = EchoResponse;

    async fn handle_request(
        &self,
        request: &EchoRequest,
        _conn: &ServerConnection,
    ) -> RpcResult<EchoResponse> {
        Ok(EchoResponse {
            message: request.message.clone(),
            length: request.message.len(),
        })
    }
}

/// Echoes after a fixed delay.
pub struct SlowEchoHandler {
    pub delay: Duration,
}

#[async_trait(?Send)]
impl RequestHandler for SlowEchoHandler {
    type Request = EchoRequest;
    type Response = EchoResponse;

    async fn handle_request(
        &self,
        request: &EchoRequest,
        _conn: &ServerConnection,
    ) -> RpcResult<EchoResponse> {
        tokio::time::sleep(self.delay).await;
        Ok(EchoResponse {
            message: request.message.clone(),
            length: request.message.len(),
        })
    }
}

/// Start a handler on an ephemeral localhost port.
///
/// Returns the server (dropping it shuts the listener down) and the
/// bound port.
pub async fn start_server<H>(
    providers: TokioProviders,
    handler: H,
) -> (RpcServer<TokioProviders, JsonCodec, H>, u16)
where
    H: RequestHandler,
{
    let server = RpcServer::new(
        providers,
        FrameCodec::new(JsonCodec),
        handler,
        ServerConfig::default().with_bind_address("127.0.0.1"),
    );
    let addr = server.listen(0).await.expect("listen");
    let port = parse_port(&addr);
    (server, port)
}

pub fn parse_port(addr: &str) -> u16 {
    addr.rsplit(':')
        .next()
        .and_then(|p| p.parse().ok())
        .expect("listener address has a port")
}
