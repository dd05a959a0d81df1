//! JSON-RPC 2.0 message model, `Content-Length` framing, and the subset of
//! LSP structures the engine consumes.
//!
//! Every message on the wire is `Content-Length: N\r\n\r\n{body}` with a
//! JSON-RPC 2.0 body. A message is a request (`id` + `method`), a response
//! (`id` + `result`/`error`), or a notification (`method` only).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// A JSON-RPC message id. Servers echo ids back as whatever JSON number type
/// their stack prefers, so both integer and float forms normalize to the same
/// integer key.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Int(i64),
    Float(f64),
}

impl RequestId {
    /// The integer key used by the pending-response registry.
    pub fn value(&self) -> i64 {
        match self {
            RequestId::Int(n) => *n,
            RequestId::Float(f) => *f as i64,
        }
    }
}

/// A JSON-RPC 2.0 message in any of its three shapes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcMessage {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl JsonRpcMessage {
    pub fn request(id: i64, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(RequestId::Int(id)),
            method: Some(method.to_string()),
            params: Some(params),
            result: None,
            error: None,
        }
    }

    pub fn notification(method: &str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: Some(method.to_string()),
            params: Some(params),
            result: None,
            error: None,
        }
    }

    /// A response carries an id but no method; a server-to-client request
    /// carries both and must not be dispatched as a response.
    pub fn is_response(&self) -> bool {
        self.id.is_some() && self.method.is_none()
    }
}

/// Write one framed message body.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> Result<()> {
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed message body. Returns `Ok(None)` on clean end of stream.
/// Headers other than `Content-Length` are ignored.
pub async fn read_frame<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut content_length: Option<usize> = None;
    loop {
        let mut line = String::new();
        let read = reader.read_line(&mut line).await?;
        if read == 0 {
            return Ok(None);
        }
        let line = line.trim_end();
        if line.is_empty() {
            if content_length.is_some() {
                break;
            }
            continue;
        }
        if let Some(rest) = line.strip_prefix("Content-Length:") {
            let length = rest
                .trim()
                .parse::<usize>()
                .context("invalid Content-Length header")?;
            content_length = Some(length);
        }
    }
    let length = content_length.context("frame without Content-Length")?;
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Zero-based line/character position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub line: usize,
    pub character: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub uri: String,
    #[serde(default)]
    pub range: Range,
}

/// LSP symbol kind for methods.
pub const SYMBOL_KIND_METHOD: u32 = 6;
/// LSP symbol kind for free functions.
pub const SYMBOL_KIND_FUNCTION: u32 = 12;

/// One node of a hierarchical `textDocument/documentSymbol` response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentSymbol {
    pub name: String,
    pub kind: u32,
    pub range: Range,
    #[serde(rename = "selectionRange")]
    pub selection_range: Range,
    #[serde(default)]
    pub children: Vec<DocumentSymbol>,
}

impl DocumentSymbol {
    /// Method-like symbols terminate the enclosing-function walk. Servers
    /// disagree on whether a Java method reports kind 6 or 12, so both count.
    pub fn is_method_like(&self) -> bool {
        self.kind == SYMBOL_KIND_METHOD || self.kind == SYMBOL_KIND_FUNCTION
    }

    /// Whether the symbol's full range spans the given zero-based line.
    pub fn encloses_line(&self, line: usize) -> bool {
        self.range.start.line <= line && self.range.end.line >= line
    }
}
