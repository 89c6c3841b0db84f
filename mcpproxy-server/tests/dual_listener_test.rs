//! Dual-listener integration tests
//!
//! One handler tree served from both listeners: the TCP path requires the
//! API key, the local IPC path authenticates by peer credentials at accept.

use std::sync::Arc;

use mcpproxy_config::ProxyConfig;
use mcpproxy_server::{api, ServiceContainer};
use mcpproxy_web::DualListener;

async fn start_server(api_key: Option<&str>) -> (DualListener, Arc<ServiceContainer>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = ProxyConfig {
        data_dir: dir.path().join("data"),
        api_key: api_key.map(|s| s.to_string()),
        ..Default::default()
    };
    let services = ServiceContainer::new(config).await.unwrap();
    let router = api::build_router(services.clone());
    let socket = dir.path().join("mcpproxy.sock");
    let listener = DualListener::serve("127.0.0.1:0", Some(&socket), router)
        .await
        .unwrap();
    (listener, services, dir)
}

#[tokio::test]
async fn tcp_requires_api_key_when_configured() {
    let (listener, _services, _dir) = start_server(Some("sekrit")).await;
    let base = format!("http://{}", listener.tcp_addr());
    let client = reqwest::Client::new();

    // Without the key: 401
    let response = client
        .get(format!("{}/api/v1/status", base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);

    // With the key: 200 and the envelope
    let response = client
        .get(format!("{}/api/v1/status", base))
        .header("x-api-key", "sekrit")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["running"], true);

    listener.shutdown().await;
}

#[cfg(unix)]
#[tokio::test]
async fn ipc_path_needs_no_api_key() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let (listener, _services, dir) = start_server(Some("sekrit")).await;
    let socket = dir.path().join("mcpproxy.sock");

    let mut stream = tokio::net::UnixStream::connect(&socket).await.unwrap();
    stream
        .write_all(
            b"GET /api/v1/status HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        )
        .await
        .unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let response = String::from_utf8_lossy(&raw);

    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);
    assert!(response.contains("\"success\":true"));

    listener.shutdown().await;
}

#[tokio::test]
async fn mcp_endpoint_serves_builtin_tools() {
    let (listener, _services, _dir) = start_server(None).await;
    let base = format!("http://{}", listener.tcp_addr());
    let client = reqwest::Client::new();

    let response: serde_json::Value = client
        .post(format!("{}/mcp", base))
        .json(&serde_json::json!({
            "jsonrpc": "2.0",
            "method": "tools/list",
            "id": 1
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let tools = response["result"]["tools"].as_array().unwrap();
    let names: Vec<&str> = tools.iter().filter_map(|t| t["name"].as_str()).collect();
    assert!(names.contains(&"retrieve_tools"));
    assert!(names.contains(&"call_tool_read"));
    assert!(names.contains(&"upstream_servers"));

    listener.shutdown().await;
}
