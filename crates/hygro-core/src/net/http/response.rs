//! Response parsing

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use embedded_io_async::Read;
use log::{error, warn};

use super::HttpResponse;
use crate::net::error::NetError;

/// Longest status line plus headers accepted
pub const MAX_HEAD_LEN: usize = 2048;

/// Largest body accepted
pub const MAX_BODY_LEN: usize = 16 * 1024;

const HEAD_END: &[u8] = b"\r\n\r\n";

/// Read one response from `conn`: the head up to the blank line, then exactly
/// `Content-Length` body bytes.
pub async fn read_response<R: Read>(conn: &mut R) -> Result<HttpResponse, NetError> {
    let mut head = Vec::with_capacity(512);
    let mut chunk = [0u8; 256];

    let head_len = loop {
        let n = conn.read(&mut chunk).await.map_err(|e| {
            error!("Reading response head failed: {:?}", e);
            NetError::ReadFailed
        })?;
        if n == 0 {
            error!("Connection closed after {} bytes of response head", head.len());
            return Err(NetError::MalformedResponse);
        }

        // The terminator may straddle two reads
        let search_from = head.len().saturating_sub(HEAD_END.len() - 1);
        head.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find(&head[search_from..], HEAD_END) {
            break search_from + pos + HEAD_END.len();
        }
        if head.len() > MAX_HEAD_LEN {
            error!("Response head longer than {} bytes", MAX_HEAD_LEN);
            return Err(NetError::MalformedResponse);
        }
    };

    let mut body = head.split_off(head_len);
    let mut response = parse_head(&head[..head_len - HEAD_END.len()])?;

    let expected = response.content_length;
    if expected > MAX_BODY_LEN {
        error!("Response body of {} bytes is too large", expected);
        return Err(NetError::MalformedResponse);
    }

    body.truncate(expected);
    body.reserve(expected - body.len());
    while body.len() < expected {
        let want = (expected - body.len()).min(chunk.len());
        let n = conn.read(&mut chunk[..want]).await.map_err(|e| {
            error!("Reading response body failed: {:?}", e);
            NetError::ReadFailed
        })?;
        if n == 0 {
            error!("Response body ended after {} of {} bytes", body.len(), expected);
            return Err(NetError::ShortBody {
                expected,
                received: body.len(),
            });
        }
        body.extend_from_slice(&chunk[..n]);
    }

    response.body = body;
    Ok(response)
}

/// Parse the status line and headers, without the final blank line
pub fn parse_head(head: &[u8]) -> Result<HttpResponse, NetError> {
    let head = core::str::from_utf8(head).map_err(|_| NetError::MalformedResponse)?;
    let mut lines = head.split("\r\n");

    let status_line = lines.next().ok_or(NetError::MalformedResponse)?;
    let mut parts = status_line.splitn(3, ' ');
    let protocol = parts
        .next()
        .filter(|p| p.starts_with("HTTP/"))
        .ok_or(NetError::MalformedResponse)?;
    let status_code = parts
        .next()
        .filter(|code| code.len() == 3)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or(NetError::MalformedResponse)?;
    let status = parts.next().unwrap_or("").trim();

    let mut headers = Vec::new();
    let mut content_length = None;
    for line in lines {
        let (name, value) = line.split_once(':').ok_or(NetError::MalformedResponse)?;
        let (name, value) = (name.trim(), value.trim());
        if name.eq_ignore_ascii_case("content-length") {
            content_length = Some(
                value
                    .parse::<usize>()
                    .map_err(|_| NetError::MalformedResponse)?,
            );
        }
        headers.push((name.to_string(), value.to_string()));
    }

    let content_length = content_length.unwrap_or_else(|| {
        warn!("Response has no Content-Length, ignoring any body");
        0
    });

    Ok(HttpResponse {
        status_line: status_line.to_string(),
        protocol: protocol.to_string(),
        status_code,
        status: String::from(status),
        headers,
        content_length,
        body: Vec::new(),
    })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
