//! Federation + allowlist tests against a live mock upstream (a python
//! subprocess speaking line-delimited JSON-RPC).

mod common;

use pretty_assertions::assert_eq;
use serde_json::json;

use common::TestHostOptions;
use common::build_host;
use common::deno_available;
use common::mock_upstream_config;
use common::python_available;

#[tokio::test]
async fn raw_call_reaches_the_upstream_through_the_wildcard() {
    if !python_available() {
        eprintln!("python3 not available; skipping");
        return;
    }
    let host = build_host(TestHostOptions {
        upstreams: vec![mock_upstream_config("mock")],
        ..TestHostOptions::default()
    })
    .await;

    let response = host
        .call(
            "mcp.executeIsolate",
            Some(json!({
                "code": "const r = tools.$raw('mock.hello', {name: 'X'}); console.log(JSON.stringify(r))",
                "allowedTools": ["mock.*"],
            })),
        )
        .await;

    assert_eq!(response.error, None, "{response:?}");
    let result = response.result.expect("result");
    let stdout = result
        .get("stdout")
        .and_then(|v| v.as_str())
        .expect("stdout");
    // The serialized upstream response made it back into the sandbox, and
    // the upstream saw a tools/call for `hello` with the argument intact.
    assert!(stdout.contains("Hello X"), "stdout: {stdout}");
    assert!(stdout.contains("\"name\":\"hello\""), "stdout: {stdout}");
    assert!(result.get("exitCode") == Some(&json!(0)));
}

#[tokio::test]
async fn namespaced_sdk_method_works_like_raw() {
    if !python_available() {
        eprintln!("python3 not available; skipping");
        return;
    }
    let host = build_host(TestHostOptions {
        upstreams: vec![mock_upstream_config("mock")],
        ..TestHostOptions::default()
    })
    .await;

    let response = host
        .call(
            "mcp.executeIsolate",
            Some(json!({
                "code": "const r = tools.mock.hello({name: 'Y'}); console.log(r.message)",
            })),
        )
        .await;

    assert_eq!(response.error, None, "{response:?}");
    let stdout = response
        .result
        .and_then(|r| r.get("stdout").cloned())
        .and_then(|v| v.as_str().map(String::from))
        .expect("stdout");
    assert!(stdout.contains("Hello Y"), "stdout: {stdout}");
}

#[tokio::test]
async fn denied_raw_call_never_reaches_the_host() {
    if !python_available() {
        eprintln!("python3 not available; skipping");
        return;
    }
    let host = build_host(TestHostOptions {
        upstreams: vec![mock_upstream_config("mock")],
        ..TestHostOptions::default()
    })
    .await;

    let response = host
        .call(
            "mcp.executeIsolate",
            Some(json!({
                "code": "try { tools.$raw('other.forbidden', {}) } catch (e) { console.log('REJECTED:' + e.message) }",
                "allowedTools": ["mock.hello"],
            })),
        )
        .await;

    assert_eq!(response.error, None, "{response:?}");
    let stdout = response
        .result
        .and_then(|r| r.get("stdout").cloned())
        .and_then(|v| v.as_str().map(String::from))
        .expect("stdout");
    assert!(stdout.contains("REJECTED:"), "stdout: {stdout}");
    assert!(stdout.contains("not in the allowlist"), "stdout: {stdout}");
}

#[tokio::test]
async fn segment_boundary_holds_inside_the_sandbox() {
    if !python_available() {
        eprintln!("python3 not available; skipping");
        return;
    }
    // Allowlist `mock.*`: `mockery__hello` must not slip through even
    // though `mockery` starts with `mock`.
    let host = build_host(TestHostOptions {
        upstreams: vec![mock_upstream_config("mock"), mock_upstream_config("mockery")],
        ..TestHostOptions::default()
    })
    .await;

    let response = host
        .call(
            "mcp.executeIsolate",
            Some(json!({
                "code": "try { tools.$raw('mockery.hello', {name: 'Z'}); console.log('ALLOWED') } catch (e) { console.log('REJECTED:' + e.message) }",
                "allowedTools": ["mock.*"],
            })),
        )
        .await;

    assert_eq!(response.error, None, "{response:?}");
    let stdout = response
        .result
        .and_then(|r| r.get("stdout").cloned())
        .and_then(|v| v.as_str().map(String::from))
        .expect("stdout");
    assert!(stdout.contains("REJECTED:"), "stdout: {stdout}");
}

#[tokio::test]
async fn typescript_sandbox_reaches_the_upstream_over_reverse_ipc() {
    if !python_available() || !deno_available() {
        eprintln!("python3/deno not available; skipping");
        return;
    }
    let host = build_host(TestHostOptions {
        upstreams: vec![mock_upstream_config("mock")],
        ..TestHostOptions::default()
    })
    .await;

    let response = host
        .call(
            "mcp.executeTypeScript",
            Some(json!({
                // `Deno` forces the routing decision to the subprocess
                // backend, so the call travels the wire.
                "code": "const r = await tools.$raw('mock.hello', {name: 'X'}); console.log(JSON.stringify(r)); Deno.exit(0)",
                "allowedTools": ["mock.*"],
                "limits": {"timeoutMs": 30000},
            })),
        )
        .await;

    assert_eq!(response.error, None, "{response:?}");
    let stdout = response
        .result
        .and_then(|r| r.get("stdout").cloned())
        .and_then(|v| v.as_str().map(String::from))
        .expect("stdout");
    assert!(stdout.contains("Hello X"), "stdout: {stdout}");
}

#[tokio::test]
async fn typescript_sandbox_denial_happens_before_any_host_call() {
    if !python_available() || !deno_available() {
        eprintln!("python3/deno not available; skipping");
        return;
    }
    let host = build_host(TestHostOptions {
        upstreams: vec![mock_upstream_config("mock")],
        ..TestHostOptions::default()
    })
    .await;

    let response = host
        .call(
            "mcp.executeTypeScript",
            Some(json!({
                "code": "try { await tools.$raw('other.forbidden', {}) } catch (e) { console.log('REJECTED:' + e.message) } Deno.exit(0)",
                "allowedTools": ["mock.hello"],
                "limits": {"timeoutMs": 30000},
            })),
        )
        .await;

    assert_eq!(response.error, None, "{response:?}");
    let stdout = response
        .result
        .and_then(|r| r.get("stdout").cloned())
        .and_then(|v| v.as_str().map(String::from))
        .expect("stdout");
    assert!(stdout.contains("REJECTED:"), "stdout: {stdout}");
    assert!(stdout.contains("not in the allowlist"), "stdout: {stdout}");
}

#[tokio::test]
async fn schema_validation_guards_upstream_calls() {
    if !python_available() {
        eprintln!("python3 not available; skipping");
        return;
    }
    let host = build_host(TestHostOptions {
        upstreams: vec![mock_upstream_config("mock")],
        ..TestHostOptions::default()
    })
    .await;

    // `name` is required by the mock's inputSchema.
    let response = host
        .call(
            "mcp.callTool",
            Some(json!({"name": "mock__hello", "arguments": {}})),
        )
        .await;
    let error = response.error.expect("schema violation");
    assert_eq!(error.code, -32602);

    let response = host
        .call(
            "mcp.callTool",
            Some(json!({"name": "mock__hello", "arguments": {"name": "Q"}})),
        )
        .await;
    assert_eq!(response.error, None, "{response:?}");
    let message = response
        .result
        .and_then(|r| r.get("message").cloned())
        .expect("message");
    assert_eq!(message, json!("Hello Q"));
}

#[tokio::test]
async fn bare_names_resolve_against_the_federation() {
    if !python_available() {
        eprintln!("python3 not available; skipping");
        return;
    }
    let host = build_host(TestHostOptions {
        upstreams: vec![mock_upstream_config("mock")],
        ..TestHostOptions::default()
    })
    .await;

    let response = host
        .call(
            "mcp.callTool",
            Some(json!({"name": "hello", "arguments": {"name": "bare"}})),
        )
        .await;
    assert_eq!(response.error, None, "{response:?}");

    // Two upstreams with the same tool name: ambiguity is an error.
    let host = build_host(TestHostOptions {
        upstreams: vec![mock_upstream_config("mock"), mock_upstream_config("other")],
        ..TestHostOptions::default()
    })
    .await;
    let response = host
        .call(
            "mcp.callTool",
            Some(json!({"name": "hello", "arguments": {"name": "bare"}})),
        )
        .await;
    let error = response.error.expect("ambiguous");
    assert_eq!(error.code, -32601);
    assert!(error.message.contains("ambiguous"), "{}", error.message);
}

#[tokio::test]
async fn discovery_merges_upstream_and_builtin_stubs() {
    if !python_available() {
        eprintln!("python3 not available; skipping");
        return;
    }
    let host = build_host(TestHostOptions {
        upstreams: vec![mock_upstream_config("mock")],
        ..TestHostOptions::default()
    })
    .await;

    let response = host.call("mcp.discoverTools", None).await;
    let names: Vec<String> = response
        .result
        .and_then(|r| r.get("tools").cloned())
        .and_then(|t| t.as_array().cloned())
        .expect("tools")
        .iter()
        .filter_map(|t| t.get("name").and_then(|n| n.as_str()).map(String::from))
        .collect();
    assert!(names.contains(&"mock__hello".to_string()));
    assert!(names.contains(&"conduit__executeIsolate".to_string()));
}
