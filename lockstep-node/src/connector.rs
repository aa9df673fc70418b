//! The transport seam: how the node opens byte streams.

use std::future::Future;
use std::io;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Opens a byte stream to an endpoint.
///
/// This is the only place the node touches a concrete socket type, so the
/// simulation tests can substitute their own network. Retry pacing is not
/// this trait's concern — the per-peer writer owns that bookkeeping.
pub trait Dial: Clone + Send + Sync + 'static {
    type Io: AsyncRead + AsyncWrite + Send + Unpin;

    fn dial(&self, endpoint: &str) -> impl Future<Output = io::Result<Self::Io>> + Send;
}

/// Plain TCP dialing.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioDial;

impl Dial for TokioDial {
    type Io = TcpStream;

    async fn dial(&self, endpoint: &str) -> io::Result<TcpStream> {
        TcpStream::connect(endpoint).await
    }
}
