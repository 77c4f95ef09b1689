//! Bidirectional byte pump for CONNECT tunnels.
//!
//! The proxy never looks inside the tunneled stream; it dials the requested
//! destination, answers `200 Connection Established`, then pumps bytes both
//! ways until either leg closes, errors, or sits idle past the configured
//! timeout. Byte counts per direction are reported back for the traffic
//! record.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tracing::debug;

use crate::error::{QgateError, QgateResult};

/// Bytes moved in each direction by a finished tunnel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelStats {
    /// Client -> destination
    pub bytes_sent: u64,
    /// Destination -> client
    pub bytes_received: u64,
}

/// Split a CONNECT authority into host and port. Port defaults to 443, and
/// IPv6 literals keep their brackets stripped.
pub fn parse_authority(authority: &str) -> QgateResult<(String, u16)> {
    if authority.is_empty() {
        return Err(QgateError::proxy("empty CONNECT authority"));
    }

    if let Some((host, port_str)) = authority.rsplit_once(':') {
        if host.starts_with('[') && host.ends_with(']') {
            let port = port_str
                .parse::<u16>()
                .map_err(|_| QgateError::proxy(format!("invalid port: {}", port_str)))?;
            return Ok((host[1..host.len() - 1].to_string(), port));
        }

        if let Ok(port) = port_str.parse::<u16>() {
            return Ok((host.to_string(), port));
        }
        // No colon-delimited port; probably a bare IPv6 literal
    }

    Ok((authority.to_string(), 443))
}

/// Dial the tunnel destination under the connect timeout
pub async fn dial(destination: &str, connect_timeout: Duration) -> QgateResult<TcpStream> {
    match timeout(connect_timeout, TcpStream::connect(destination)).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(err)) => Err(QgateError::tunnel(destination, err.to_string())),
        Err(_) => Err(QgateError::timeout(
            connect_timeout,
            format!("connect to {}", destination),
        )),
    }
}

/// Pump both directions until EOF, error, or idle expiry on either leg.
///
/// The two directions run concurrently inside this future, so dropping it
/// cancels both legs at once; neither leg can leak past the other.
pub async fn relay<C, O>(client: C, origin: O, idle_timeout: Duration) -> TunnelStats
where
    C: AsyncRead + AsyncWrite + Send + Unpin,
    O: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (origin_read, origin_write) = tokio::io::split(origin);

    let (bytes_sent, bytes_received) = tokio::join!(
        pump(client_read, origin_write, idle_timeout),
        pump(origin_read, client_write, idle_timeout),
    );

    debug!(bytes_sent, bytes_received, "Tunnel relay finished");
    TunnelStats {
        bytes_sent,
        bytes_received,
    }
}

/// Copy one direction until EOF, error, or an idle read. Shuts down the
/// write side on exit so the peer sees FIN and the opposite leg unwinds.
async fn pump<R, W>(mut reader: R, mut writer: W, idle_timeout: Duration) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; 16 * 1024];
    let mut total: u64 = 0;

    loop {
        let n = match timeout(idle_timeout, reader.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
            Ok(Err(err)) => {
                debug!(error = %err, "Tunnel leg read error");
                break;
            }
            Err(_) => {
                debug!("Tunnel leg idle timeout");
                break;
            }
        };

        if writer.write_all(&buf[..n]).await.is_err() {
            break;
        }
        total += n as u64;
    }

    let _ = writer.shutdown().await;
    total
}
