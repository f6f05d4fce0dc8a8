//! Health check endpoint
//!
//! Every worker process exposes a TCP echo listener on the registry port
//! plus one. External orchestration probes it for liveness; it carries no
//! protocol semantics beyond "process is alive and accepting connections"
//! and is deliberately unauthenticated.

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Bind the health listener
pub async fn bind(port: u16) -> Result<TcpListener> {
    let addr = format!("0.0.0.0:{}", port);
    TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind health endpoint on {}", addr))
}

/// Accept probes until the task is dropped: read up to 1024 bytes, echo
/// them back verbatim, close.
pub async fn serve(listener: TcpListener) -> Result<()> {
    loop {
        let (mut stream, _) = listener
            .accept()
            .await
            .context("Failed to accept health probe")?;

        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            if let Ok(n) = stream.read(&mut buf).await {
                let _ = stream.write_all(&buf[..n]).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_echo_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener));

        let mut probe = TcpStream::connect(addr).await.unwrap();
        probe.write_all(b"ping").await.unwrap();

        let mut buf = [0u8; 4];
        probe.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }
}
