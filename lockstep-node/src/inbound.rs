//! Inbound peer connections: decode envelopes, enqueue to the actor.
//!
//! Handlers never touch protocol state; everything is routed through the
//! actor's event channel, which is the serialization point.

use futures::StreamExt;
use lockstep_core::Envelope;
use lockstep_core::codec::PeerCodec;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{trace, warn};

/// Read envelopes from one peer connection until it closes or produces a
/// malformed frame. Malformed input drops the connection without
/// advancing any protocol state (the clock in particular); the peer's
/// writer will reconnect and retry.
pub async fn serve_peer<S>(stream: S, events: mpsc::UnboundedSender<Envelope>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, PeerCodec::default());

    while let Some(result) = framed.next().await {
        match result {
            Ok(envelope) => {
                trace!(from = envelope.sender, ts = envelope.send_ts, "inbound message");
                if events.send(envelope).is_err() {
                    // actor is gone; nothing left to deliver to
                    return;
                }
            }
            Err(err) => {
                warn!(%err, "dropping connection after malformed frame");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::SinkExt;
    use lockstep_core::{PeerMessage, RequestKey, Transfer};

    use super::*;

    #[tokio::test]
    async fn forwards_envelopes_and_stops_on_garbage() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (client_io, server_io) = tokio::io::duplex(1024);
        let server = tokio::spawn(serve_peer(server_io, events_tx));

        let mut client = Framed::new(client_io, PeerCodec::default());
        let envelope = Envelope {
            sender: 2,
            send_ts: 1,
            message: PeerMessage::Request {
                key: RequestKey::new(1, 2),
                transfer: Transfer { dst: 1, amount: 3 },
            },
        };
        client.send(envelope.clone()).await.unwrap();
        assert_eq!(events_rx.recv().await.unwrap(), envelope);

        // a corrupt frame ends the connection without forwarding anything
        use tokio::io::AsyncWriteExt;
        let mut io = client.into_inner();
        io.write_all(&[0, 0, 0, 2, 0xff, 0xff]).await.unwrap();
        server.await.unwrap();
        assert!(events_rx.try_recv().is_err());
    }
}
