//! Test client.
//!
//! Connects once, sends one message and logs whatever comes back until the
//! server closes the connection (or the optional linger time runs out).
//! There is no retry: a failed connect is logged and reported.

use crate::config::ClientConfig;
use crate::error::ClientError;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{error, info};

/// Read buffer size
const BUFFER_SIZE: usize = 4096;

/// Run the client against the configured server.
///
/// Returns the number of bytes received.
pub async fn run(config: &ClientConfig) -> Result<u64, ClientError> {
    let addr = format!("{}:{}", config.host, config.port);
    let mut stream = match TcpStream::connect((config.host.as_str(), config.port)).await {
        Ok(stream) => stream,
        Err(source) => {
            error!(addr = %addr, error = %source, "Client error");
            return Err(ClientError::Connect { addr, source });
        }
    };
    info!(addr = %addr, "Connected to server");

    let message = config.message.as_bytes();
    let mut received = 0u64;
    let result = match config.linger {
        Some(linger) => {
            let outcome =
                tokio::time::timeout(linger, converse(&mut stream, message, &mut received)).await;
            match outcome {
                Ok(result) => result,
                Err(_) => {
                    info!(
                        linger_ms = linger.as_millis() as u64,
                        "Linger elapsed, closing connection"
                    );
                    stream.shutdown().await.map_err(ClientError::from)
                }
            }
        }
        None => converse(&mut stream, message, &mut received).await,
    };

    match result {
        Ok(()) => {
            info!(received, "Connection closed");
            Ok(received)
        }
        Err(e) => {
            error!(received, error = %e, "Client error");
            Err(e)
        }
    }
}

/// Send `message` once, then log every chunk received until EOF.
///
/// `received` counts reply bytes as they arrive, so it stays accurate if
/// the conversation is cut short.
pub async fn converse<S>(
    stream: &mut S,
    message: &[u8],
    received: &mut u64,
) -> Result<(), ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(message).await?;
    stream.flush().await?;

    let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);
    loop {
        buffer.clear();
        let n = stream.read_buf(&mut buffer).await?;
        if n == 0 {
            return Ok(());
        }
        *received += n as u64;
        info!(
            bytes = n,
            "Received from server: {}",
            String::from_utf8_lossy(&buffer[..n])
        );
    }
}
