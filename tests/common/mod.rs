//! Scripted in-process language server for integration tests.
//!
//! Speaks framed JSON-RPC over one half of a duplex pipe and answers the
//! engine's queries from canned tables keyed by (file name, line). Anything
//! not scripted gets the protocol's empty answer, which exercises the
//! engine's fallback paths.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncWrite, BufReader, DuplexStream};

use sinktrace::client::LspClient;
use sinktrace::protocol::{read_frame, write_frame, JsonRpcMessage};
use sinktrace::tracer::{Tracer, TracerOptions};
use sinktrace::uri::{from_uri, to_uri};

#[derive(Debug, Default)]
pub struct ScriptedServer {
    symbols: HashMap<String, Value>,
    definitions: HashMap<(String, usize), Value>,
    references: HashMap<(String, usize), Value>,
}

impl ScriptedServer {
    pub fn symbols_for(mut self, file: &str, value: Value) -> Self {
        self.symbols.insert(file.to_string(), value);
        self
    }

    pub fn definition_at(mut self, file: &str, line: usize, value: Value) -> Self {
        self.definitions.insert((file.to_string(), line), value);
        self
    }

    pub fn references_at(mut self, file: &str, line: usize, value: Value) -> Self {
        self.references.insert((file.to_string(), line), value);
        self
    }

    pub async fn run(self, stream: DuplexStream) {
        let (read, mut write) = tokio::io::split(stream);
        let mut reader = BufReader::new(read);

        // Index "ready" straight away.
        send(
            &mut write,
            &json!({
                "jsonrpc": "2.0",
                "method": "language/status",
                "params": {"type": "ServiceReady", "message": "ServiceReady"}
            }),
        )
        .await;

        while let Ok(Some(frame)) = read_frame(&mut reader).await {
            let Ok(message) = serde_json::from_slice::<JsonRpcMessage>(&frame) else {
                continue;
            };
            let Some(id) = message.id else {
                continue; // notification
            };
            let params = message.params.unwrap_or(Value::Null);
            let result = match message.method.as_deref().unwrap_or_default() {
                "initialize" => json!({"capabilities": {}}),
                "textDocument/documentSymbol" => self
                    .symbols
                    .get(&file_of(&params))
                    .cloned()
                    .unwrap_or_else(|| json!([])),
                "textDocument/definition" => self
                    .definitions
                    .get(&(file_of(&params), line_of(&params)))
                    .cloned()
                    .unwrap_or(Value::Null),
                "textDocument/references" => self
                    .references
                    .get(&(file_of(&params), line_of(&params)))
                    .cloned()
                    .unwrap_or_else(|| json!([])),
                _ => Value::Null,
            };
            send(
                &mut write,
                &json!({"jsonrpc": "2.0", "id": id.value(), "result": result}),
            )
            .await;
        }
    }
}

fn file_of(params: &Value) -> String {
    let uri = params
        .pointer("/textDocument/uri")
        .and_then(Value::as_str)
        .unwrap_or_default();
    from_uri(uri)
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn line_of(params: &Value) -> usize {
    params
        .pointer("/position/line")
        .and_then(Value::as_u64)
        .unwrap_or(0) as usize
}

async fn send<W: AsyncWrite + Unpin>(writer: &mut W, body: &Value) {
    let bytes = serde_json::to_vec(body).expect("scripted responses serialize");
    let _ = write_frame(writer, &bytes).await;
}

/// Wire a tracer to a scripted server over an in-memory pipe.
pub async fn tracer_with_server(
    root: &Path,
    options: TracerOptions,
    server: ScriptedServer,
) -> Arc<Tracer> {
    let (client_io, server_io) = tokio::io::duplex(1 << 16);
    tokio::spawn(server.run(server_io));
    let (read, write) = tokio::io::split(client_io);
    let client = Arc::new(LspClient::from_io(write, read));
    client
        .wait_for_service_ready(Duration::from_secs(5))
        .await
        .expect("scripted server announces readiness");
    Arc::new(Tracer::new(client, root.to_path_buf(), options))
}

/// An LSP `Location` value for a local file.
pub fn location(path: &Path, line: usize, character: usize) -> Value {
    json!({
        "uri": to_uri(path),
        "range": {
            "start": {"line": line, "character": character},
            "end": {"line": line, "character": character + 1}
        }
    })
}

/// A definition answer pointing into a binary class inside the JDK image.
pub fn binary_definition(class_path: &str) -> Value {
    json!([{
        "uri": format!("jdt://contents/rt.jar/java.base/{class_path}.class"),
        "range": {
            "start": {"line": 0, "character": 0},
            "end": {"line": 0, "character": 1}
        }
    }])
}

/// A hierarchical method symbol (kind 6).
pub fn method_symbol(
    name: &str,
    start_line: usize,
    end_line: usize,
    sel_line: usize,
    sel_col: usize,
) -> Value {
    json!({
        "name": name,
        "kind": 6,
        "range": {
            "start": {"line": start_line, "character": 0},
            "end": {"line": end_line, "character": 1}
        },
        "selectionRange": {
            "start": {"line": sel_line, "character": sel_col},
            "end": {"line": sel_line, "character": sel_col + name.len()}
        }
    })
}

/// A class symbol (kind 5) wrapping its method children.
pub fn class_symbol(name: &str, start_line: usize, end_line: usize, children: Vec<Value>) -> Value {
    json!({
        "name": name,
        "kind": 5,
        "range": {
            "start": {"line": start_line, "character": 0},
            "end": {"line": end_line, "character": 1}
        },
        "selectionRange": {
            "start": {"line": start_line, "character": 0},
            "end": {"line": start_line, "character": name.len()}
        },
        "children": children
    })
}
