//! Opening handshake (RFC 6455 Section 4) for both legs of the relay.
//!
//! The proxy acts as a server towards the downstream client and as a client
//! towards the upstream endpoint.

use base64::Engine;
use bytes::BytesMut;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// RFC 6455 GUID for Sec-WebSocket-Accept calculation.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const CRLF: &str = "\r\n";

/// Upper bound for a handshake request or response head.
pub const MAX_HEAD_LEN: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Upstream host is not configured")]
    MissingHost,

    #[error("Missing header: {0}")]
    MissingHeader(&'static str),

    #[error("Not a WebSocket upgrade request: {0:?}")]
    NotUpgradeRequest(String),

    #[error("Malformed status line: {0:?}")]
    MalformedStatus(String),

    #[error("Upstream refused the upgrade: {0:?}")]
    Rejected(String),

    #[error("Sec-WebSocket-Accept mismatch (expected {expected}, got {actual})")]
    AcceptMismatch { expected: String, actual: String },

    #[error("Handshake head exceeds 16 KiB")]
    HeadTooLarge,

    #[error("Connection closed during handshake")]
    Closed,

    #[error("I/O error during handshake")]
    Io(#[from] std::io::Error),
}

/// Upgrade request sent to the upstream endpoint, with the key it carries.
#[derive(Debug, Clone)]
pub struct ClientHandshake {
    pub request: String,
    pub key: String,
}

pub fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Random 16-byte nonce, base64 encoded.
pub fn generate_key() -> String {
    let nonce: [u8; 16] = rand::random();
    base64::engine::general_purpose::STANDARD.encode(nonce)
}

/// Builds the upgrade request the proxy sends upstream.
///
/// No `Sec-WebSocket-Extensions` header is sent: the relay never applies
/// compression to payloads, so it must not negotiate it.
pub fn build_upstream_request(
    host: &str,
    path: &str,
    user_agent: &str,
) -> Result<ClientHandshake, HandshakeError> {
    if host.is_empty() {
        return Err(HandshakeError::MissingHost);
    }
    let path = if path.is_empty() { "/" } else { path };
    let key = generate_key();

    let request = [
        format!("GET {path} HTTP/1.1"),
        format!("Host: {host}"),
        "Connection: Upgrade".to_string(),
        "Pragma: no-cache".to_string(),
        "Cache-Control: no-cache".to_string(),
        format!("User-Agent: {user_agent}"),
        "Upgrade: websocket".to_string(),
        format!("Origin: https://{host}"),
        "Sec-WebSocket-Version: 13".to_string(),
        format!("Sec-WebSocket-Key: {key}"),
        String::new(),
        String::new(),
    ]
    .join(CRLF);

    Ok(ClientHandshake { request, key })
}

/// Checks the upstream answer to a request built with `key`.
///
/// A missing `Sec-WebSocket-Accept` header is tolerated; a wrong one is not.
pub fn validate_upstream_response(response: &str, key: &str) -> Result<(), HandshakeError> {
    let status_line = response.split(CRLF).next().unwrap_or_default();
    let mut parts = status_line.splitn(3, ' ');
    let (Some(version), Some(code)) = (parts.next(), parts.next()) else {
        return Err(HandshakeError::MalformedStatus(status_line.to_string()));
    };
    if !version.starts_with("HTTP/1.") || code.len() != 3 || code.parse::<u16>().is_err() {
        return Err(HandshakeError::MalformedStatus(status_line.to_string()));
    }
    if code != "101" {
        return Err(HandshakeError::Rejected(status_line.to_string()));
    }

    if let Some(actual) = header_value(response, "Sec-WebSocket-Accept") {
        let expected = compute_accept_key(key);
        if actual != expected {
            return Err(HandshakeError::AcceptMismatch {
                expected,
                actual: actual.to_string(),
            });
        }
    }
    Ok(())
}

/// Builds the `101 Switching Protocols` answer for a downstream request.
pub fn build_downstream_response(request: &str) -> Result<String, HandshakeError> {
    let key = header_value(request, "Sec-WebSocket-Key")
        .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Key"))?;

    Ok([
        "HTTP/1.1 101 Switching Protocols".to_string(),
        "Upgrade: websocket".to_string(),
        "Connection: Upgrade".to_string(),
        format!("Sec-WebSocket-Accept: {}", compute_accept_key(key)),
        String::new(),
        String::new(),
    ]
    .join(CRLF))
}

/// Whether the first line of `text` is `GET <path> HTTP/1.1`.
pub fn is_handshake_request(text: &str) -> bool {
    let first_line = text.split(CRLF).next().unwrap_or_default();
    first_line
        .strip_prefix("GET ")
        .and_then(|rest| rest.strip_suffix(" HTTP/1.1"))
        .is_some_and(|path| !path.is_empty())
}

/// Looks up a header by case-insensitive name. Everything after the first
/// colon is the value, so values may themselves contain colons.
fn header_value<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.split(CRLF)
        .skip(1)
        .take_while(|line| !line.is_empty())
        .filter_map(|line| line.split_once(':'))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case(name))
        .map(|(_, value)| value.trim())
}

/// Reads from `stream` until a complete HTTP head (`\r\n\r\n`) is buffered.
///
/// Returns the head text. Bytes received after the head stay in `buf`; they
/// already belong to the WebSocket stream.
pub async fn read_http_head<S>(stream: &mut S, buf: &mut BytesMut) -> Result<String, HandshakeError>
where
    S: AsyncRead + Unpin,
{
    let mut scanned: usize = 0;
    loop {
        if let Some(pos) = find_head_end(&buf[scanned.saturating_sub(3)..]) {
            let end = scanned.saturating_sub(3) + pos + 4;
            let head = buf.split_to(end);
            return Ok(String::from_utf8_lossy(&head).into_owned());
        }
        if buf.len() > MAX_HEAD_LEN {
            return Err(HandshakeError::HeadTooLarge);
        }
        scanned = buf.len();
        if stream.read_buf(buf).await? == 0 {
            return Err(HandshakeError::Closed);
        }
    }
}

fn find_head_end(bytes: &[u8]) -> Option<usize> {
    bytes.windows(4).position(|window| window == b"\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_REQUEST: &str = "GET /student/arm/ HTTP/1.1\r\n\
        Host: 127.0.0.1:500\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Origin: http://127.0.0.1:80\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\r\n";

    #[test]
    fn test_rfc_accept_key() {
        assert_eq!(
            compute_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_downstream_response() {
        let response = build_downstream_response(SAMPLE_REQUEST).unwrap();
        assert_eq!(
            response,
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n"
        );
    }

    #[test]
    fn test_downstream_response_without_key() {
        let request = "GET / HTTP/1.1\r\nHost: localhost\r\n\r\n";
        assert!(matches!(
            build_downstream_response(request),
            Err(HandshakeError::MissingHeader("Sec-WebSocket-Key"))
        ));
    }

    #[test]
    fn test_header_values_keep_colons() {
        let request = "GET / HTTP/1.1\r\nOrigin: http://127.0.0.1:80\r\nsec-websocket-key:abc:def \r\n\r\n";
        assert_eq!(header_value(request, "Origin"), Some("http://127.0.0.1:80"));
        assert_eq!(header_value(request, "Sec-WebSocket-Key"), Some("abc:def"));
        assert_eq!(header_value(request, "Upgrade"), None);
    }

    #[test]
    fn test_is_handshake_request() {
        assert!(is_handshake_request(SAMPLE_REQUEST));
        assert!(is_handshake_request("GET / HTTP/1.1"));
        assert!(!is_handshake_request("POST / HTTP/1.1\r\n\r\n"));
        assert!(!is_handshake_request("GET / HTTP/1.0\r\n\r\n"));
        assert!(!is_handshake_request("\u{81}\u{5}hello"));
        assert!(!is_handshake_request(""));
    }

    #[test]
    fn test_upstream_request() {
        let handshake = build_upstream_request("example.org", "/student/arm/", "TestAgent/1.0").unwrap();
        let request = &handshake.request;
        assert!(request.starts_with("GET /student/arm/ HTTP/1.1\r\n"));
        assert!(request.ends_with("\r\n\r\n"));
        assert!(is_handshake_request(request));
        assert_eq!(header_value(request, "Host"), Some("example.org"));
        assert_eq!(header_value(request, "Upgrade"), Some("websocket"));
        assert_eq!(header_value(request, "Connection"), Some("Upgrade"));
        assert_eq!(header_value(request, "Sec-WebSocket-Version"), Some("13"));
        assert_eq!(header_value(request, "User-Agent"), Some("TestAgent/1.0"));
        assert_eq!(header_value(request, "Origin"), Some("https://example.org"));
        assert_eq!(header_value(request, "Sec-WebSocket-Extensions"), None);
        assert_eq!(header_value(request, "Sec-WebSocket-Key"), Some(handshake.key.as_str()));

        let nonce = base64::engine::general_purpose::STANDARD
            .decode(&handshake.key)
            .unwrap();
        assert_eq!(nonce.len(), 16);

        let other = build_upstream_request("example.org", "/", "ua").unwrap();
        assert_ne!(other.key, handshake.key);
    }

    #[test]
    fn test_upstream_request_requires_host() {
        assert!(matches!(
            build_upstream_request("", "/", "ua"),
            Err(HandshakeError::MissingHost)
        ));
    }

    #[test]
    fn test_validate_upstream_response() {
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        let ok = "HTTP/1.1 101 Switching Protocols\r\nSec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n";
        assert!(validate_upstream_response(ok, key).is_ok());

        let no_accept = "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\r\n";
        assert!(validate_upstream_response(no_accept, key).is_ok());

        let wrong = "HTTP/1.1 101 Switching Protocols\r\nSec-WebSocket-Accept: bogus\r\n\r\n";
        assert!(matches!(
            validate_upstream_response(wrong, key),
            Err(HandshakeError::AcceptMismatch { .. })
        ));

        let refused = "HTTP/1.1 403 Forbidden\r\n\r\n";
        assert!(matches!(
            validate_upstream_response(refused, key),
            Err(HandshakeError::Rejected(_))
        ));

        assert!(matches!(
            validate_upstream_response("garbage\r\n\r\n", key),
            Err(HandshakeError::MalformedStatus(_))
        ));
    }

    #[tokio::test]
    async fn test_read_http_head_keeps_trailing_bytes() {
        let mut input: &[u8] = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\r\n\x81\x02hi";
        let mut buf = BytesMut::new();
        let head = read_http_head(&mut input, &mut buf).await.unwrap();
        assert!(head.starts_with("HTTP/1.1 101"));
        assert!(head.ends_with("\r\n\r\n"));
        assert_eq!(&buf[..], b"\x81\x02hi");
    }

    #[tokio::test]
    async fn test_read_http_head_across_reads() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            for chunk in ["GET / HTTP/1.1\r", "\nHost: x\r\n", "\r", "\n"] {
                client.write_all(chunk.as_bytes()).await.unwrap();
                tokio::task::yield_now().await;
            }
            client
        });

        let mut buf = BytesMut::new();
        let head = read_http_head(&mut server, &mut buf).await.unwrap();
        assert_eq!(head, "GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(buf.is_empty());
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_read_http_head_rejects_oversized_head() {
        let mut request = b"GET / HTTP/1.1\r\n".to_vec();
        while request.len() <= MAX_HEAD_LEN + 64 {
            request.extend_from_slice(b"X-Padding: aaaaaaaaaaaaaaaa\r\n");
        }
        let mut input: &[u8] = &request;
        let mut buf = BytesMut::new();
        assert!(matches!(
            read_http_head(&mut input, &mut buf).await,
            Err(HandshakeError::HeadTooLarge)
        ));
    }

    #[tokio::test]
    async fn test_read_http_head_eof() {
        let mut input: &[u8] = b"GET / HTTP/1.1\r\n";
        let mut buf = BytesMut::new();
        assert!(matches!(
            read_http_head(&mut input, &mut buf).await,
            Err(HandshakeError::Closed)
        ));
    }
}
