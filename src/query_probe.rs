//! Query-protocol readiness probing.
//!
//! The real client library used to talk the server's query protocol is an
//! external collaborator and out of scope for the core; [`QueryProbe`] is the
//! seam it plugs into. The default implementation only distinguishes a raw
//! transport handshake from a working query, which is exactly the split the
//! readiness loop needs and nothing more.

use crate::ids::IpAddress;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Observable outcomes of a query-protocol connection attempt.
///
/// The split matters: the server accepts client connections before its role
/// manager finishes creating default credentials, so a bare handshake is not
/// sufficient evidence of readiness. Only [`Queried`](CqlUpState::Queried)
/// means "ready".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CqlUpState {
    /// Transport handshake failed.
    NotConnected,
    /// Handshake succeeded but a trivial query against the local system table failed.
    Connected,
    /// The trivial query succeeded.
    Queried,
}

/// A held query-protocol session, kept alive as the server's "control
/// connection" once it becomes ready.
#[async_trait]
pub trait QuerySession: Send + Sync {
    async fn close(&mut self);
}

/// The readiness probe the core depends on to distinguish [`CqlUpState`]s.
#[async_trait]
pub trait QueryProbe: Send + Sync {
    /// Attempts a connection restricted to `ip`, with `timeout` as the
    /// request-level timeout, and classifies the outcome.
    async fn probe(&self, ip: IpAddress, port: u16, timeout: Duration) -> CqlUpState;
}

/// Default transport-level probe: a plain TCP connect stands in for the
/// handshake, and a one-byte round trip stands in for the trivial query.
/// Sufficient to exercise the NOT_CONNECTED/CONNECTED/QUERIED split without
/// pulling in a full query-protocol driver.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpQueryProbe;

#[async_trait]
impl QueryProbe for TcpQueryProbe {
    async fn probe(&self, ip: IpAddress, port: u16, timeout: Duration) -> CqlUpState {
        let connect = tokio::time::timeout(timeout, TcpStream::connect((ip, port))).await;
        let Ok(Ok(mut stream)) = connect else {
            return CqlUpState::NotConnected;
        };
        let roundtrip = tokio::time::timeout(timeout, async {
            stream.write_all(b"\x00").await?;
            let mut buf = [0u8; 1];
            stream.read_exact(&mut buf).await?;
            Ok::<_, std::io::Error>(buf[0])
        })
        .await;
        match roundtrip {
            Ok(Ok(1)) => CqlUpState::Queried,
            _ => CqlUpState::Connected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_port_is_not_connected() {
        let probe = TcpQueryProbe;
        let outcome = probe
            .probe(std::net::Ipv4Addr::new(127, 0, 0, 1), 1, Duration::from_millis(200))
            .await;
        assert_eq!(outcome, CqlUpState::NotConnected);
    }
}
