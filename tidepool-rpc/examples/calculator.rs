//! Calculator example: one request enum, fallible operations.
//!
//! Shows the error hook: division by zero fails the handler, and
//! `handle_error` turns the failure into a structured error response
//! instead of leaving the request unanswered.
//!
//! ```bash
//! cargo run --example calculator
//! ```

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tidepool_core::{MsgpackCodec, TokioProviders};
use tidepool_rpc::{
    ClientConfig, ClientPeer, FrameCodec, RequestHandler, RpcError, RpcResult, RpcServer,
    ServerConfig, ServerConnection,
};

// ============================================================================
// Message Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum CalcRequest {
    Add(i64, i64),
    Div(i64, i64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum CalcResponse {
    Value(i64),
    Error(String),
}

// ============================================================================
// Server
// ============================================================================

struct Calculator;

#[async_trait(?Send)]
impl RequestHandler for Calculator {
    type Request = CalcRequest;
    type Response = CalcResponse;

    async fn handle_request(
        &self,
        request: &CalcRequest,
        _conn: &ServerConnection,
    ) -> RpcResult<CalcResponse> {
        match *request {
            CalcRequest::Add(a, b) => Ok(CalcResponse::Value(a + b)),
            CalcRequest::Div(_, 0) => Err(RpcError::Io("division by zero".to_string())),
            CalcRequest::Div(a, b) => Ok(CalcResponse::Value(a / b)),
        }
    }

    async fn handle_error(
        &self,
        error: RpcError,
        _request: Option<&CalcRequest>,
        _response: Option<&CalcResponse>,
        _conn: &ServerConnection,
    ) -> Option<CalcResponse> {
        // Answer the request with a structured error instead of leaving
        // the client's channel waiting.
        Some(CalcResponse::Error(error.to_string()))
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let providers = TokioProviders::new();
            let codec = FrameCodec::new(MsgpackCodec);

            let server = RpcServer::new(
                providers.clone(),
                codec.clone(),
                Calculator,
                ServerConfig::default().with_bind_address("127.0.0.1"),
            );
            let addr = server.listen(0).await?;
            let port: u16 = addr
                .rsplit(':')
                .next()
                .and_then(|p| p.parse().ok())
                .expect("listener address has a port");

            // A single peer, no pooling
            let peer = ClientPeer::connect(
                providers,
                "127.0.0.1",
                port,
                codec,
                ClientConfig::default(),
            )
            .await?;

            let requests = [
                CalcRequest::Add(2, 40),
                CalcRequest::Div(84, 2),
                CalcRequest::Div(1, 0),
            ];
            for request in &requests {
                let response: CalcResponse = peer
                    .send_message(request, Some(Duration::from_secs(5)))
                    .await?;
                println!("{:?} => {:?}", request, response);
            }

            println!("\npeer stats: {:?}", peer.stats());
            peer.close(None);
            server.shutdown();
            Ok(())
        })
        .await
}
