//! SSRF defense: upstreams pointing at private ranges are refused at call
//! time, before any connection is attempted.

mod common;

use pretty_assertions::assert_eq;
use serde_json::json;

use common::TestHostOptions;
use common::build_host;
use conduit_core::config::UpstreamConfig;
use conduit_core::config::UpstreamTransportConfig;

fn private_http_upstream(id: &str, url: &str) -> UpstreamConfig {
    UpstreamConfig {
        id: id.to_string(),
        transport: UpstreamTransportConfig::HttpRpc {
            url: url.to_string(),
        },
        credential: None,
    }
}

#[tokio::test]
async fn localhost_upstream_calls_are_blocked() {
    let host = build_host(TestHostOptions {
        upstreams: vec![private_http_upstream("bad", "http://localhost:8080")],
        ..TestHostOptions::default()
    })
    .await;

    let response = host
        .call("mcp.callTool", Some(json!({"name": "bad__anything"})))
        .await;
    let error = response.error.expect("must be blocked");
    assert_eq!(error.code, -32003);
    assert!(
        error.message.contains("private network"),
        "{}",
        error.message
    );
}

#[tokio::test]
async fn metadata_endpoint_upstreams_are_blocked() {
    let host = build_host(TestHostOptions {
        upstreams: vec![private_http_upstream(
            "meta",
            "http://169.254.169.254/latest/meta-data",
        )],
        ..TestHostOptions::default()
    })
    .await;

    let response = host
        .call("mcp.callTool", Some(json!({"name": "meta__read"})))
        .await;
    let error = response.error.expect("must be blocked");
    assert_eq!(error.code, -32003);
    assert!(error.message.contains("private network"));
}

#[tokio::test]
async fn streaming_upstreams_get_the_same_treatment() {
    let host = build_host(TestHostOptions {
        upstreams: vec![UpstreamConfig {
            id: "stream".to_string(),
            transport: UpstreamTransportConfig::HttpStreaming {
                url: "http://127.0.0.1:9999/mcp".to_string(),
            },
            credential: None,
        }],
        ..TestHostOptions::default()
    })
    .await;

    let response = host
        .call("mcp.callTool", Some(json!({"name": "stream__tool"})))
        .await;
    let error = response.error.expect("must be blocked");
    assert_eq!(error.code, -32003);
    assert!(error.message.contains("private network"));
}
