//! One HTTP/1.1 request/response over an established tunnel
//!
//! The request always carries `Connection: close` and the response is read
//! until the peer closes; there is no Content-Length or chunked handling.

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, instrument};

use crate::error::{Result, VeilError};
use crate::proxy::dialer::find_header_end;
use crate::proxy::transport::Tunnel;

/// Ceiling on a buffered response, headers and body together
pub const MAX_RESPONSE_SIZE: usize = 16 * 1024 * 1024;

/// A request to be written onto a tunnel
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    /// Value of the `Host` header
    pub host: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
}

impl HttpRequest {
    pub fn get(host: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            path: path.into(),
            host: host.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Serialize the request head and body
    pub fn encode(&self) -> Vec<u8> {
        let mut head = format!("{} {} HTTP/1.1\r\nHost: {}\r\n", self.method, self.path, self.host);
        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("connection") || name.eq_ignore_ascii_case("host") {
                continue;
            }
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        head.push_str("Connection: close\r\n\r\n");

        let mut out = head.into_bytes();
        if let Some(body) = &self.body {
            out.extend_from_slice(body);
        }
        out
    }
}

/// Parsed response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status_code: u16,
    /// Raw header block including the status line
    pub headers: String,
    pub body: Bytes,
}

impl HttpResponse {
    /// Split a complete response at the first blank line and parse the status code
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let header_end = find_header_end(raw).ok_or_else(|| {
            VeilError::MalformedResponse("missing header terminator".to_string())
        })?;

        let headers = String::from_utf8_lossy(&raw[..header_end]).into_owned();
        let status_line = headers.split("\r\n").next().unwrap_or("");
        let status_code = status_line
            .split(' ')
            .nth(1)
            .and_then(|code| code.parse::<u16>().ok())
            .ok_or_else(|| {
                VeilError::MalformedResponse(format!("invalid status line {:?}", status_line))
            })?;

        Ok(Self {
            status_code,
            headers,
            body: Bytes::copy_from_slice(&raw[header_end + 4..]),
        })
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Write `request` onto `tunnel` and read until the peer closes.
///
/// The tunnel is consumed: it is closed when this returns, whatever the outcome.
#[instrument(skip(tunnel, request), fields(method = %request.method, path = %request.path))]
pub async fn exchange(
    mut tunnel: Tunnel,
    request: &HttpRequest,
    overall_timeout: Duration,
) -> Result<HttpResponse> {
    let payload = request.encode();

    let io = async {
        tunnel.write_all(&payload).await?;
        tunnel.flush().await?;
        read_until_close(&mut tunnel, MAX_RESPONSE_SIZE).await
    };

    let raw = match timeout(overall_timeout, io).await {
        Ok(result) => result?,
        Err(_) => return Err(VeilError::ExchangeTimeout(overall_timeout)),
    };
    drop(tunnel);

    debug!("Received {} bytes", raw.len());
    HttpResponse::parse(&raw)
}

async fn read_until_close(tunnel: &mut Tunnel, limit: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(8 * 1024);
    let mut chunk = [0u8; 8 * 1024];
    loop {
        match tunnel.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) if buf.len() + n > limit => {
                return Err(VeilError::MalformedResponse(format!(
                    "Response exceeds {} bytes",
                    limit
                )));
            }
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            // Many servers drop TLS without close_notify; treat it as EOF.
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_forces_connection_close() {
        let req = HttpRequest::get("ipinfo.io", "/json")
            .header("User-Agent", "veil-test")
            .header("Connection", "keep-alive");
        let encoded = String::from_utf8(req.encode()).unwrap();
        assert_eq!(
            encoded,
            "GET /json HTTP/1.1\r\nHost: ipinfo.io\r\nUser-Agent: veil-test\r\nConnection: close\r\n\r\n"
        );
    }

    #[test]
    fn test_encode_appends_body() {
        let mut req = HttpRequest::get("httpbin.org", "/post");
        req.method = "POST".to_string();
        req.body = Some(Bytes::from_static(b"a=1"));
        let encoded = req.encode();
        assert!(encoded.ends_with(b"Connection: close\r\n\r\na=1"));
    }

    #[test]
    fn test_parse_response() {
        let resp = HttpResponse::parse(
            b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\r\n{\"ip\":\"1.2.3.4\"}",
        )
        .unwrap();
        assert_eq!(resp.status_code, 200);
        assert!(resp.is_success());
        assert!(resp.headers.contains("Content-Type: application/json"));
        assert_eq!(resp.body_text(), "{\"ip\":\"1.2.3.4\"}");
    }

    #[test]
    fn test_parse_rejects_missing_terminator() {
        let err = HttpResponse::parse(b"HTTP/1.1 200 OK\r\nContent-Length: 3").unwrap_err();
        assert!(matches!(err, VeilError::MalformedResponse(_)));
    }

    #[test]
    fn test_parse_rejects_non_numeric_status() {
        let err = HttpResponse::parse(b"HTTP/1.1 OK\r\n\r\n").unwrap_err();
        assert!(matches!(err, VeilError::MalformedResponse(_)));
        let err = HttpResponse::parse(b"garbage\r\n\r\n").unwrap_err();
        assert!(matches!(err, VeilError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn test_exchange_reads_until_close() {
        let (client, mut server) = tokio::io::duplex(4096);
        let server_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let n = server.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).into_owned();
            server
                .write_all(b"HTTP/1.1 404 Not Found\r\nServer: test\r\n\r\nmis")
                .await
                .unwrap();
            server.write_all(b"sing").await.unwrap();
            drop(server);
            request
        });

        let resp = exchange(
            Box::new(client),
            &HttpRequest::get("example.com", "/x"),
            Duration::from_secs(2),
        )
        .await
        .unwrap();

        assert_eq!(resp.status_code, 404);
        assert!(!resp.is_success());
        assert_eq!(resp.body_text(), "missing");

        let request = server_task.await.unwrap();
        assert!(request.starts_with("GET /x HTTP/1.1\r\nHost: example.com\r\n"));
        assert!(request.contains("Connection: close\r\n"));
    }

    #[tokio::test]
    async fn test_exchange_times_out_when_peer_keeps_open() {
        let (client, mut server) = tokio::io::duplex(4096);
        let server_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let _ = server.read(&mut buf).await;
            server.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
            // Keep the stream open past the deadline, then observe the close.
            server.read(&mut buf).await.unwrap()
        });

        let started = std::time::Instant::now();
        let err = exchange(
            Box::new(client),
            &HttpRequest::get("example.com", "/"),
            Duration::from_millis(200),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, VeilError::ExchangeTimeout(_)));
        assert!(started.elapsed() < Duration::from_secs(2));
        // The tunnel was dropped, so the peer sees EOF.
        assert_eq!(server_task.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_exchange_malformed_response() {
        let (client, mut server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let _ = server.read(&mut buf).await;
            server.write_all(b"not http at all").await.unwrap();
        });

        let err = exchange(
            Box::new(client),
            &HttpRequest::get("example.com", "/"),
            Duration::from_secs(2),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, VeilError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn test_oversized_response_is_rejected() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let head = b"HTTP/1.1 200 OK\r\n\r\n";
            let filler = vec![b'x'; 64 * 1024];
            let _ = server.write_all(head).await;
            // Never closes on its own; the cap has to end the read.
            while server.write_all(&filler).await.is_ok() {}
        });

        let mut tunnel: Tunnel = Box::new(client);
        let err = read_until_close(&mut tunnel, 256 * 1024).await.unwrap_err();
        assert!(matches!(err, VeilError::MalformedResponse(ref msg) if msg.contains("262144")));
    }

    #[tokio::test]
    async fn test_response_at_limit_is_kept() {
        let (client, mut server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            server.write_all(&[b'y'; 1000]).await.unwrap();
        });

        let mut tunnel: Tunnel = Box::new(client);
        let raw = read_until_close(&mut tunnel, 1000).await.unwrap();
        assert_eq!(raw.len(), 1000);
    }
}
