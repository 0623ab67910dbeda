//! Local-only callback endpoint for sandbox→host tool calls.
//!
//! Listens on loopback TCP, speaks line-delimited JSON-RPC, and feeds every
//! request through the same pipeline the agent uses; the session bearer
//! token is what narrows the method surface.
//! Reads are bounded (oversize lines disconnect) and one request is handled
//! at a time per connection, which is the backpressure that keeps the
//! concurrency gate meaningful.

use std::sync::Arc;

use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::pipeline::PeerInfo;
use crate::pipeline::RequestPipeline;

/// Reads beyond this many bytes without a newline disconnect the peer.
pub const MAX_LINE_BYTES: u64 = 10 * 1024 * 1024;

pub struct ReverseIpcEndpoint {
    listener: TcpListener,
    address: String,
}

impl ReverseIpcEndpoint {
    /// Bind an ephemeral loopback port. The resulting address is what gets
    /// injected into sandboxes (and allow-listed in their network policy).
    pub async fn bind_loopback() -> std::io::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let address = listener.local_addr()?.to_string();
        Ok(Self { listener, address })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Accept loop; runs until `shutdown` fires.
    pub async fn serve(self, pipeline: Arc<RequestPipeline>, shutdown: Arc<Notify>) {
        info!("reverse IPC endpoint listening on {}", self.address);
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            let pipeline = pipeline.clone();
                            tokio::spawn(async move {
                                let (reader, writer) = stream.into_split();
                                serve_connection(reader, writer, peer_addr.to_string(), pipeline)
                                    .await;
                            });
                        }
                        Err(e) => {
                            warn!("reverse IPC accept failed: {e}");
                        }
                    }
                }
                _ = shutdown.notified() => {
                    info!("reverse IPC endpoint shutting down");
                    break;
                }
            }
        }
    }
}

/// One connection: bounded line reads, sequential handling, exactly one
/// response line per request (none for notifications). Shared with the
/// agent-facing local-socket transport, which has identical framing.
pub async fn serve_connection<R, W>(
    reader: R,
    mut writer: W,
    peer_addr: String,
    pipeline: Arc<RequestPipeline>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let peer = PeerInfo::new(peer_addr.clone());
    let mut reader = BufReader::new(reader);
    let mut line_buffer = Vec::new();

    loop {
        line_buffer.clear();
        // A fresh `take` each line bounds the buffer without limiting the
        // connection lifetime.
        let mut bounded = (&mut reader).take(MAX_LINE_BYTES + 1);
        let read = match bounded.read_until(b'\n', &mut line_buffer).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("reverse IPC read error from {peer_addr}: {e}");
                break;
            }
        };
        if read as u64 > MAX_LINE_BYTES {
            warn!("reverse IPC line from {peer_addr} exceeded the buffer bound; disconnecting");
            break;
        }

        let line = String::from_utf8_lossy(&line_buffer);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        // Backpressure: no further reads until this request resolves. A
        // parse error answers with the envelope and then disconnects.
        let (response, disconnect) = match RequestPipeline::parse_line(line) {
            Ok(request) => (pipeline.handle_request(request, &peer).await, false),
            Err(parse_error) => (Some(parse_error), true),
        };
        if let Some(response) = response {
            let mut payload = match serde_json::to_string(&response) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("could not serialize reverse IPC response: {e}");
                    continue;
                }
            };
            payload.push('\n');
            if writer.write_all(payload.as_bytes()).await.is_err() {
                break;
            }
            if writer.flush().await.is_err() {
                break;
            }
        }
        if disconnect {
            debug!("disconnecting {peer_addr} after a parse error");
            break;
        }
    }
    debug!("reverse IPC connection from {peer_addr} closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn binds_an_ephemeral_loopback_port() {
        let endpoint = ReverseIpcEndpoint::bind_loopback().await.expect("bind");
        let address = endpoint.address().to_string();
        assert!(address.starts_with("127.0.0.1:"));
        let port: u16 = address
            .rsplit(':')
            .next()
            .and_then(|p| p.parse().ok())
            .expect("port");
        assert!(port > 0);
    }

    #[test]
    fn line_bound_matches_the_documented_default() {
        assert_eq!(MAX_LINE_BYTES, 10 * 1024 * 1024);
    }
}
