//! Integration tests for the pixbridge-rpc binary.
//!
//! Each test starts the reference canvas host as a child process, reads the
//! port it prints, and drives it through the client library or the `call`
//! subcommand.

use base64::{engine::general_purpose::STANDARD, Engine};
use pixbridge::{BitmapRequest, BridgeConfig, ClientBridge, Dispatcher, Region};
use serde_json::{json, Map, Value};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncBufReadExt;

const BINARY: &str = env!("CARGO_BIN_EXE_pixbridge-rpc");

struct HostProcess {
    child: tokio::process::Child,
    port: u16,
}

impl HostProcess {
    async fn stop(mut self) {
        let _ = self.child.kill().await;
        let _ = self.child.wait().await;
    }
}

impl Drop for HostProcess {
    fn drop(&mut self) {
        let _ = self.child.start_kill();
    }
}

/// Start `serve` on a free port and wait for its port line.
async fn start_host(extra: &[&str]) -> Result<HostProcess, String> {
    let mut child = tokio::process::Command::new(BINARY)
        .args(["serve", "--host", "127.0.0.1", "--port", "0", "--width", "32", "--height", "16"])
        .args(extra)
        .env_remove("PIXBRIDGE_PORT")
        .env_remove("PIXBRIDGE_HOST")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("failed to spawn pixbridge-rpc: {e}"))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "failed to capture stdout".to_string())?;
    let mut lines = tokio::io::BufReader::new(stdout).lines();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(250), lines.next_line()).await {
            Ok(Ok(Some(line))) => {
                if let Some(value) = line.strip_prefix("BRIDGE_PORT=") {
                    let port = value
                        .trim()
                        .parse::<u16>()
                        .map_err(|e| format!("invalid BRIDGE_PORT value '{value}': {e}"))?;
                    return Ok(HostProcess { child, port });
                }
            }
            Ok(Ok(None)) => break,
            Ok(Err(err)) => return Err(format!("failed to read stdout: {err}")),
            Err(_) => continue,
        }
    }
    Err("BRIDGE_PORT line not emitted by pixbridge-rpc".to_string())
}

fn dispatcher_for(port: u16) -> Dispatcher {
    Dispatcher::new(Arc::new(ClientBridge::new(BridgeConfig {
        host: "127.0.0.1".to_string(),
        port,
        timeout: Duration::from_secs(10),
        ..BridgeConfig::default()
    })))
}

fn args(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

/// Run the binary's `call` subcommand against `port`.
async fn run_call(port: u16, extra: &[&str]) -> (bool, Value) {
    let output = tokio::process::Command::new(BINARY)
        .args(["--host", "127.0.0.1", "--port", &port.to_string(), "call"])
        .args(extra)
        .stderr(Stdio::null())
        .output()
        .await
        .expect("failed to run pixbridge-rpc call");
    let outcome: Value = serde_json::from_slice(&output.stdout).expect("call output is not JSON");
    (output.status.success(), outcome)
}

#[tokio::test]
async fn test_bitmap_of_fresh_canvas() {
    let host = start_host(&[]).await.expect("host did not start");
    let dispatcher = dispatcher_for(host.port);

    let outcome = dispatcher.get_image_bitmap(&BitmapRequest::default()).await;
    assert!(outcome.success, "{:?}", outcome.error);

    let data = outcome.data.as_ref().unwrap();
    assert_eq!(data["format"], "ppm");
    assert_eq!(data["width"], 32);
    assert_eq!(data["original_height"], 16);

    let ppm = outcome.attachment("image_data").unwrap();
    let header = b"P6\n32 16\n255\n";
    assert!(ppm.starts_with(header));
    assert_eq!(ppm.len(), header.len() + 32 * 16 * 3);
    assert!(ppm[header.len()..].iter().all(|&b| b == 255));

    host.stop().await;
}

#[tokio::test]
async fn test_edits_show_up_in_region_capture() {
    let host = start_host(&[]).await.expect("host did not start");
    let dispatcher = dispatcher_for(host.port);

    let created = dispatcher
        .invoke_raw("create_layer", args(json!({"name": "ink"})), None)
        .await;
    assert!(created.success, "{:?}", created.error);

    let filled = dispatcher
        .invoke_raw(
            "fill_rect",
            args(json!({
                "layer": "ink", "x": 4, "y": 4, "width": 2, "height": 2, "color": "#0000ff",
            })),
            None,
        )
        .await;
    assert_eq!(filled.data.unwrap()["painted"], 4);

    let outcome = dispatcher
        .get_image_bitmap(&BitmapRequest {
            region: Some(Region {
                origin_x: 4,
                origin_y: 4,
                width: 2,
                height: 2,
            }),
            ..BitmapRequest::default()
        })
        .await;
    let ppm = outcome.attachment("image_data").unwrap();
    let pixels = &ppm[b"P6\n2 2\n255\n".len()..];
    assert_eq!(pixels, [0u8, 0, 255].repeat(4).as_slice());

    let metadata = dispatcher.get_image_metadata().await;
    assert_eq!(metadata.data.unwrap()["structure"]["num_layers"], 2);

    host.stop().await;
}

#[tokio::test]
async fn test_raw_bitmap_result_is_base64_text() {
    let host = start_host(&[]).await.expect("host did not start");
    let dispatcher = dispatcher_for(host.port);

    let outcome = dispatcher
        .invoke_raw("get_image_bitmap", args(json!({"max_width": 8})), None)
        .await;
    let data = outcome.data.unwrap();
    let bytes = STANDARD
        .decode(data["image_data"].as_str().unwrap())
        .unwrap();
    assert!(bytes.starts_with(b"P6\n8 4\n255\n"));

    host.stop().await;
}

#[tokio::test]
async fn test_unknown_operation_leaves_connection_usable() {
    let host = start_host(&[]).await.expect("host did not start");
    let dispatcher = dispatcher_for(host.port);

    let outcome = dispatcher.invoke_raw("sharpen_everything", Map::new(), None).await;
    assert_eq!(outcome.error_kind(), Some("UnknownOperation"));

    let info = dispatcher.get_host_info().await;
    assert!(info.success);
    assert_eq!(info.data.unwrap()["host"], "pixbridge-rpc");

    host.stop().await;
}

#[tokio::test]
async fn test_execute_reaches_native_api() {
    let host = start_host(&[]).await.expect("host did not start");
    let dispatcher = dispatcher_for(host.port);

    let outcome = dispatcher
        .execute(
            vec![
                json!({
                    "operation": "create_layer",
                    "arguments": {"name": "a", "fill": "foreground"},
                }),
                json!({"operation": "flatten"}),
            ],
            Some(Duration::from_secs(5)),
        )
        .await;
    assert!(outcome.success, "{:?}", outcome.error);
    assert_eq!(outcome.message.as_deref(), Some("Executed 2 step(s)"));

    let context = dispatcher.get_context_state().await;
    assert_eq!(context.data.unwrap()["foreground_color"], "#000000");

    let metadata = dispatcher.get_image_metadata().await;
    assert_eq!(metadata.data.unwrap()["structure"]["num_layers"], 1);

    host.stop().await;
}

#[tokio::test]
async fn test_call_subcommand_prints_outcome_and_saves_attachment() {
    let host = start_host(&[]).await.expect("host did not start");
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("canvas.ppm");

    let (ok, outcome) = run_call(
        host.port,
        &[
            "get_image_bitmap",
            "--args",
            r#"{"max_width": 16}"#,
            "--save-attachment",
            path.to_str().unwrap(),
        ],
    )
    .await;

    assert!(ok);
    assert_eq!(outcome["success"], true);
    assert_eq!(outcome["data"]["width"], 16);
    let saved = std::fs::read(&path).unwrap();
    assert_eq!(outcome["attachments"]["image_data"], saved.len());
    assert!(saved.starts_with(b"P6\n16 8\n"));

    host.stop().await;
}

#[tokio::test]
async fn test_call_subcommand_reports_validation_failure() {
    let host = start_host(&[]).await.expect("host did not start");

    let (ok, outcome) = run_call(
        host.port,
        &["get_image_bitmap", "--args", r#"{"region_x": 1}"#],
    )
    .await;

    assert!(!ok);
    assert_eq!(outcome["error"]["kind"], "ValidationError");
    assert_eq!(outcome["error"]["retryable"], false);

    host.stop().await;
}

#[tokio::test]
async fn test_call_subcommand_without_host() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let (ok, outcome) = run_call(port, &["get_host_info"]).await;
    assert!(!ok);
    assert_eq!(outcome["error"]["kind"], "ConnectionRefused");
    assert_eq!(outcome["error"]["retryable"], true);
}

#[tokio::test]
async fn test_operations_subcommand_lists_catalog() {
    let output = tokio::process::Command::new(BINARY)
        .arg("operations")
        .output()
        .await
        .unwrap();
    assert!(output.status.success());

    let text = String::from_utf8(output.stdout).unwrap();
    for name in [
        "execute",
        "get_context_state",
        "get_host_info",
        "get_image_bitmap",
        "get_image_metadata",
    ] {
        assert!(text.contains(name), "missing {name} in:\n{text}");
    }
    assert!(text.contains("120.0s"));
}
