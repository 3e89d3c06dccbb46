/*!
 * @file server.rs
 * @brief Connection Server (A2): TCP accept loop and per-connection task
 */

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::shutdown::ShutdownReason;
use crate::wire_protocol::WireProtocolHandler;

pub struct RelayServer {
    host: String,
    port: u16,
    dispatcher: Arc<Dispatcher>,
}

impl RelayServer {
    pub fn new(host: String, port: u16, dispatcher: Arc<Dispatcher>) -> Self {
        Self { host, port, dispatcher }
    }

    /// Accept connections until `shutdown` fires, draining in-flight
    /// connections (each has its own task; this only stops new accepts).
    pub async fn run(&self, mut shutdown: broadcast::Receiver<ShutdownReason>) -> Result<()> {
        let addr = format!("{}:{}", self.host, self.port);
        let listener = TcpListener::bind(&addr).await?;
        info!(%addr, "relaydb listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            info!(%peer, "accepted connection");
                            let dispatcher = self.dispatcher.clone();
                            let mut conn_shutdown = shutdown.resubscribe();
                            tokio::spawn(async move {
                                tokio::select! {
                                    _ = handle_connection(stream, dispatcher) => {}
                                    _ = conn_shutdown.recv() => {}
                                }
                            });
                        }
                        Err(e) => error!(error = %e, "failed to accept connection"),
                    }
                }
                _ = shutdown.recv() => {
                    info!("connection server shutting down, no longer accepting new connections");
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, dispatcher: Arc<Dispatcher>) {
    let wire = WireProtocolHandler::new();
    let mut header = [0u8; 16];

    loop {
        if let Err(e) = stream.read_exact(&mut header).await {
            if e.kind() != std::io::ErrorKind::UnexpectedEof {
                warn!(error = %e, "failed to read message header");
            }
            return;
        }

        let message_length = u32::from_le_bytes(header[0..4].try_into().unwrap()) as usize;
        if message_length < 16 {
            warn!(message_length, "rejecting message shorter than its own header");
            return;
        }

        let mut rest = vec![0u8; message_length - 16];
        if let Err(e) = stream.read_exact(&mut rest).await {
            warn!(error = %e, "failed to read message body");
            return;
        }

        let mut full = Vec::with_capacity(message_length);
        full.extend_from_slice(&header);
        full.extend_from_slice(&rest);

        let message = match wire.parse_message(&full) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "failed to parse message");
                return;
            }
        };

        let command = match wire.parse_op_msg(&message.payload) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(error = %e, "failed to parse OP_MSG payload");
                return;
            }
        };

        let response = dispatcher.dispatch(command).await;

        let bytes = match wire.generate_response(message.request_id, message.request_id, &response) {
            Ok(b) => b,
            Err(e) => {
                error!(error = %e, "failed to encode response");
                return;
            }
        };

        if let Err(e) = stream.write_all(&bytes).await {
            warn!(error = %e, "failed to write response");
            return;
        }
    }
}
