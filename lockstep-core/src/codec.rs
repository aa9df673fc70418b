//! Length-delimited postcard framing for the wire types.

use std::io;
use std::marker::PhantomData;

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::message::{Envelope, RegistryRequest, RegistryResponse};

/// Protocol frames are tiny; anything larger than this is garbage.
const MAX_FRAME_LEN: usize = 64 * 1024;

fn length_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

/// Postcard serialization inside length-delimited frames, with distinct
/// encode and decode types so each side of a connection names what it
/// sends and what it expects back.
///
/// A decode failure is surfaced as [`io::ErrorKind::InvalidData`]; the
/// caller drops the message (and connection) without touching protocol
/// state.
#[derive(Debug)]
pub struct WireCodec<Enc, Dec> {
    inner: LengthDelimitedCodec,
    _marker: PhantomData<(Enc, Dec)>,
}

impl<Enc, Dec> Default for WireCodec<Enc, Dec> {
    fn default() -> Self {
        Self {
            inner: length_codec(),
            _marker: PhantomData,
        }
    }
}

impl<Enc, Dec> Clone for WireCodec<Enc, Dec> {
    fn clone(&self) -> Self {
        Self::default()
    }
}

impl<Enc: Serialize, Dec> Encoder<Enc> for WireCodec<Enc, Dec> {
    type Error = io::Error;

    fn encode(&mut self, item: Enc, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = postcard::to_allocvec(&item)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.inner.encode(Bytes::from(bytes), dst)
    }
}

impl<Enc, Dec: DeserializeOwned> Decoder for WireCodec<Enc, Dec> {
    type Item = Dec;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(frame) => {
                let item = postcard::from_bytes(&frame)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }
}

/// Either end of a peer link: envelopes in both directions.
pub type PeerCodec = WireCodec<Envelope, Envelope>;

/// Node side of the registry connection.
pub type RegistryClientCodec = WireCodec<RegistryRequest, RegistryResponse>;

/// Registry side of the same connection.
pub type RegistryServerCodec = WireCodec<RegistryResponse, RegistryRequest>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Outcome, PeerMessage, RequestKey, Transaction, Transfer};

    #[test]
    fn envelope_roundtrip() {
        let mut codec = PeerCodec::default();
        let envelope = Envelope {
            sender: 3,
            send_ts: 17,
            message: PeerMessage::Release {
                key: RequestKey::new(12, 3),
                outcome: Outcome::Committed,
                transaction: Transaction {
                    src: 3,
                    dst: 1,
                    amount: 40,
                    ts: 12,
                    initiator: 3,
                },
            },
        };

        let mut buf = BytesMut::new();
        codec.encode(envelope.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, envelope);
        // nothing left over
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn registry_roundtrip_across_codec_pair() {
        let mut client = RegistryClientCodec::default();
        let mut server = RegistryServerCodec::default();

        let request = RegistryRequest::Debit { node: 1, amount: 10 };
        let mut buf = BytesMut::new();
        client.encode(request.clone(), &mut buf).unwrap();
        assert_eq!(server.decode(&mut buf).unwrap().unwrap(), request);

        let response = RegistryResponse::Insufficient;
        let mut buf = BytesMut::new();
        server.encode(response.clone(), &mut buf).unwrap();
        assert_eq!(client.decode(&mut buf).unwrap().unwrap(), response);
    }

    #[test]
    fn partial_frame_waits_for_more() {
        let mut codec = PeerCodec::default();
        let envelope = Envelope {
            sender: 1,
            send_ts: 1,
            message: PeerMessage::Request {
                key: RequestKey::new(1, 1),
                transfer: Transfer { dst: 2, amount: 5 },
            },
        };

        let mut full = BytesMut::new();
        codec.encode(envelope.clone(), &mut full).unwrap();

        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&full[full.len() - 1..]);
        assert_eq!(codec.decode(&mut partial).unwrap().unwrap(), envelope);
    }

    #[test]
    fn garbage_frame_is_invalid_data() {
        let mut codec = PeerCodec::default();
        // valid length prefix, bogus payload
        let mut buf = BytesMut::from(&[0u8, 0, 0, 3, 0xff, 0xff, 0xff][..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
