//! Operational endpoints: `/healthz` and `/metrics` on a dedicated port,
//! served from a plain thread so the RPC runtime stays undisturbed.

use std::sync::Arc;
use std::thread;

use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tiny_http::Header;
use tiny_http::Response;
use tiny_http::Server;
use tracing::info;
use tracing::warn;

use conduit_core::Gateway;

pub(crate) fn spawn(
    port: u16,
    gateway: Arc<Gateway>,
    prometheus: PrometheusHandle,
) -> anyhow::Result<()> {
    let server = Server::http(("127.0.0.1", port))
        .map_err(|e| anyhow::anyhow!("could not bind ops listener on port {port}: {e}"))?;
    let runtime = tokio::runtime::Handle::current();
    info!("ops listener on 127.0.0.1:{port}");

    thread::spawn(move || {
        for request in server.incoming_requests() {
            let response = match request.url() {
                "/healthz" => {
                    let statuses = runtime.block_on(gateway.health_check());
                    let body = json!({
                        "status": "ok",
                        "upstreams": statuses,
                    })
                    .to_string();
                    with_content_type(Response::from_string(body), "application/json")
                }
                "/metrics" => with_content_type(
                    Response::from_string(prometheus.render()),
                    "text/plain; version=0.0.4",
                ),
                _ => Response::from_string("not found").with_status_code(404),
            };
            if let Err(e) = request.respond(response) {
                warn!("ops response failed: {e}");
            }
        }
    });

    Ok(())
}

fn with_content_type(
    response: Response<std::io::Cursor<Vec<u8>>>,
    content_type: &str,
) -> Response<std::io::Cursor<Vec<u8>>> {
    match Header::from_bytes(&b"Content-Type"[..], content_type.as_bytes()) {
        Ok(header) => response.with_header(header),
        Err(_) => response,
    }
}
