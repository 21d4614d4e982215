//! Echo example: request/response over real TCP.
//!
//! Starts an echo server and a pooled client in one process and runs a
//! handful of multiplexed requests through a single connection.
//!
//! ```bash
//! cargo run --example echo
//! ```

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tidepool_core::{JsonCodec, TokioProviders};
use tidepool_rpc::{
    ClientConfig, ClientSupervisor, FrameCodec, RequestHandler, RpcResult, RpcServer,
    ServerConfig, ServerConnection,
};

// ============================================================================
// Message Types
// ============================================================================

/// Request message for the echo service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct EchoRequest {
    /// Sequence number for tracking.
    seq: u32,
    /// Payload message.
    message: String,
}

/// Response message for the echo service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct EchoResponse {
    /// Echoed sequence number.
    seq: u32,
    /// Echoed message.
    echo: String,
}

// ============================================================================
// Server
// ============================================================================

struct EchoHandler;

#[async_trait(?Send)]
impl RequestHandler for EchoHandler {
    type Request = EchoRequest;
    type Response = EchoResponse;

    async fn handle_connection(&self, conn: &ServerConnection) {
        println!("server: connection #{} from {}", conn.id(), conn.peer_addr());
    }

    async fn handle_request(
        &self,
        request: &EchoRequest,
        _conn: &ServerConnection,
    ) -> RpcResult<EchoResponse> {
        Ok(EchoResponse {
            seq: request.seq,
            echo: format!("echo: {}", request.message),
        })
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

            // Server on an ephemeral port
            let server = RpcServer::new(
                providers.clone(),
                FrameCodec::new(JsonCodec),
                EchoHandler,
                ServerConfig::default().with_bind_address("127.0.0.1"),
            );
            let addr = server.listen(0).await?;
            let port: u16 = addr
                .rsplit(':')
                .next()
                .and_then(|p| p.parse().ok())
                .expect("listener address has a port");
            println!("server listening on {}\n", addr);

            // Pooled client
            let supervisor = ClientSupervisor::new(
                providers,
                FrameCodec::new(JsonCodec),
                ClientConfig::default(),
            );
            supervisor.add_host("127.0.0.1", port);
            supervisor.start().await?;

            for seq in 0..5u32 {
                let request = EchoRequest {
                    seq,
                    message: format!("hello #{}", seq),
                };
                let response: EchoResponse = supervisor
                    .send_request(&request, Some(Duration::from_secs(5)))
                    .await?;
                println!("client: {:?}", response);
            }

            supervisor.stop();
            server.shutdown();
            Ok(())
        })
        .await
}
