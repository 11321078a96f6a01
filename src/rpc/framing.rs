use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Newline-delimited JSON over the Unix socket, per SPEC_FULL §4.6.
///
/// Grounded on the teacher's existing `serde_json` use for its Rocket API
/// payloads (`daemon/api`'s `Info`/`Process` JSON bodies); the line-delimited
/// transport itself is new, since the teacher only ever serves HTTP/WS, not
/// a raw Unix socket.
///
/// Comfortably above the spec's 1 MiB floor for log payloads; a line beyond
/// this is treated as a framing error rather than buffered without bound.
pub const MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    #[serde(default)]
    pub data: Value,
    pub error: Option<String>,
}

impl Response {
    pub fn ok(data: Value) -> Self {
        Response {
            success: true,
            data,
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Response {
            success: false,
            data: Value::Null,
            error: Some(message.into()),
        }
    }
}

pub fn encode(response: &Response) -> String {
    let mut line = serde_json::to_string(response)
        .unwrap_or_else(|_| r#"{"success":false,"data":null,"error":"failed to encode response"}"#.to_string());
    line.push('\n');
    line
}

pub fn decode(line: &str) -> Result<Request, String> {
    serde_json::from_str(line.trim_end()).map_err(|err| format!("malformed request: {err}"))
}

/// Client-side counterpart of [`decode`]: parses a line back into a
/// [`Response`], used by [`super::client::Client::request`].
pub fn decode_response(line: &str) -> std::io::Result<Response> {
    serde_json::from_str(line.trim_end())
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, format!("malformed response: {err}")))
}

/// Read one `\n`-terminated line, rejecting anything past [`MAX_LINE_BYTES`].
/// Returns `Ok(None)` at EOF.
pub async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> std::io::Result<Option<String>> {
    let mut buf = Vec::new();
    let n = reader.read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    if buf.len() > MAX_LINE_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("request line exceeds {MAX_LINE_BYTES} bytes"),
        ));
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_well_formed_request() {
        let request = decode(r#"{"method":"ping","params":{}}"#).unwrap();
        assert_eq!(request.method, "ping");
    }

    #[test]
    fn params_default_to_null_when_absent() {
        let request = decode(r#"{"method":"list"}"#).unwrap();
        assert_eq!(request.params, Value::Null);
    }

    #[test]
    fn rejects_unknown_top_level_fields() {
        assert!(decode(r#"{"method":"ping","bogus":1}"#).is_err());
    }

    #[test]
    fn encodes_success_with_trailing_newline() {
        let line = encode(&Response::ok(serde_json::json!({"a": 1})));
        assert!(line.ends_with('\n'));
        assert!(line.contains(r#""success":true"#));
    }
}
