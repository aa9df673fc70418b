//! Framed request/response serving for the registry.

use error_stack::{Report, ResultExt};
use futures::{SinkExt, StreamExt};
use lockstep_core::codec::RegistryServerCodec;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::{Registry, RegistryError};

/// Serve one node's connection until it closes.
///
/// Requests are answered strictly in order on the same connection, which
/// is the discipline the node-side client relies on.
///
/// # Errors
///
/// Returns a [`RegistryError`] report when the transport fails; a clean
/// close is `Ok`.
pub async fn serve_connection<S>(registry: Registry, stream: S) -> Result<(), Report<RegistryError>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, RegistryServerCodec::default());

    while let Some(request) = framed.next().await {
        let request = match request {
            Ok(request) => request,
            Err(err) => {
                warn!(%err, "dropping connection after malformed request");
                return Err(Report::new(RegistryError).attach(err.to_string()));
            }
        };
        debug!(?request, "registry request");
        let response = registry.handle(request).await;
        framed
            .send(response)
            .await
            .change_context(RegistryError)
            .attach("failed to send response")?;
    }

    debug!("connection closed");
    Ok(())
}
