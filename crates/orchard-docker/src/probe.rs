//! HTTP liveness probe for running containers.

use std::time::Duration;

use bytes::Bytes;
use http_body_util::Empty;
use hyper_util::rt::TokioIo;
use tracing::debug;

use orchard_core::{OrchardError, OrchardResult};

/// GET `path` on `host:port`; healthy means a 200 response.
///
/// `host_header` overrides the Host header for proxy-routed probes.
pub async fn ping(
    host: &str,
    port: u16,
    path: &str,
    host_header: Option<&str>,
    timeout: Duration,
) -> OrchardResult<bool> {
    let address = format!("{host}:{port}");
    let result = tokio::time::timeout(timeout, async {
        let stream = tokio::net::TcpStream::connect(&address)
            .await
            .map_err(|e| OrchardError::backend(format!("probe connect {address}: {e}")))?;

        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| OrchardError::backend(format!("probe handshake {address}: {e}")))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let request = http::Request::builder()
            .method("GET")
            .uri(path)
            .header(http::header::HOST, host_header.unwrap_or(&address))
            .body(Empty::<Bytes>::new())
            .map_err(|e| OrchardError::backend(format!("probe request: {e}")))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| OrchardError::backend(format!("probe request {address}: {e}")))?;

        debug!(%address, %path, status = %response.status(), "probe response");
        Ok(response.status() == http::StatusCode::OK)
    })
    .await;

    match result {
        Ok(outcome) => outcome,
        Err(_) => Err(OrchardError::Timeout(format!("probe of {address} timed out"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closed_port_is_an_error() {
        let result = ping("127.0.0.1", 1, "/", None, Duration::from_millis(200)).await;
        assert!(result.is_err());
    }
}
