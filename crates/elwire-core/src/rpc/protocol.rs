//! Wire shapes shared by both transports.

use serde_json::Value;

use crate::error::{CoreError, RpcError};

/// One outbound request object: `{"id": .., "method": .., "params": [..]}`.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct WireRequest {
    pub id: u64,
    pub method: String,
    pub params: Vec<Value>,
}

/// A decoded inbound object. A present `id` marks a reply, an absent one a
/// notification; `error` may accompany either.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Vec<Value>>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

/// Serialize a batch as newline-terminated JSON objects.
pub(crate) fn encode_lines(requests: &[WireRequest]) -> Result<Vec<u8>, CoreError> {
    let mut out = Vec::new();
    for request in requests {
        serde_json::to_writer(&mut out, request).map_err(|e| {
            RpcError::InvalidResponse(format!("encode request {}: {e}", request.id))
        })?;
        out.push(b'\n');
    }
    Ok(out)
}

pub(crate) fn decode_line(line: &[u8]) -> Result<Envelope, CoreError> {
    serde_json::from_slice(line).map_err(|e| {
        RpcError::InvalidResponse(format!(
            "decode line: {e}; line={}",
            String::from_utf8_lossy(line)
        ))
        .into()
    })
}

/// Decode an HTTP poll body, which is empty, one object, or an array of
/// objects.
pub(crate) fn decode_body(body: &str) -> Result<Vec<Envelope>, CoreError> {
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }

    let value: Value = serde_json::from_str(body)
        .map_err(|e| RpcError::InvalidResponse(format!("decode poll body: {e}; body={body}")))?;
    let items = match value {
        Value::Array(items) => items,
        single => vec![single],
    };

    items
        .into_iter()
        .map(|item| {
            serde_json::from_value(item).map_err(|e| {
                RpcError::InvalidResponse(format!("decode poll item: {e}")).into()
            })
        })
        .collect()
}

/// The request id a reply answers. Only non-negative integers are ever
/// issued; a decimal string echo of one is accepted too.
pub(crate) fn correlation_id(id: &Value) -> Option<u64> {
    match id {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// The `error` member of a reply as an `RpcError`. A `code` plus `message`
/// object is a `ServerError`; any other shape is kept as text.
pub(crate) fn server_error(error: &Value) -> RpcError {
    let code = error.get("code").and_then(Value::as_i64);
    let message = error.get("message").and_then(Value::as_str);
    match (code, message) {
        (Some(code), Some(message)) => RpcError::ServerError {
            code,
            message: message.to_owned(),
        },
        _ => RpcError::InvalidResponse(format!(
            "server error without code and message: {error}"
        )),
    }
}

// ==============================================================================
// Notification Unwrapping
// ==============================================================================

/// Servers overload a notification's params slot with its payload. Move the
/// payload into `result` and leave params equal to the params the caller
/// originally subscribed with.
///
/// Returns `(params, result)`, or `None` when params are too short for the
/// method's shape.
pub(crate) fn unwrap_notification(
    method: &str,
    params: Vec<Value>,
) -> Option<(Vec<Value>, Option<Value>)> {
    if method.ends_with("numblocks.subscribe") || method.ends_with("headers.subscribe") {
        let result = params.into_iter().next()?;
        return Some((Vec::new(), Some(result)));
    }

    if method == "blockchain.address.subscribe" || method == "blockchain.scripthash.subscribe" {
        let mut params = params.into_iter();
        let subject = params.next()?;
        let status = params.next()?;
        return Some((vec![subject], Some(status)));
    }

    Some((params, None))
}
