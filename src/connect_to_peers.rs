use std::sync::Arc;

use anyhow::Result;
use futures::SinkExt;
use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_serde::formats::SymmetricalBincode;
use tokio_serde::SymmetricallyFramed;
use tokio_util::codec::Framed;
use tokio_util::codec::LengthDelimitedCodec;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config_models::cli_args::Args;
use crate::models::channel::ConnectionEvent;
use crate::models::peer::endpoint::Endpoint;
use crate::models::peer::handshake_data::HandshakeData;
use crate::models::peer::handshake_data::HandshakeMode;
use crate::models::peer::handshake_data::HandshakeValidationError;
use crate::models::peer::parcel::Parcel;
use crate::models::peer::parcel::ParcelType;
use crate::models::peer::PeerMessage;
use crate::peer::Peer;

// Max peer message size is 32MB
pub const MAX_PEER_FRAME_LENGTH_IN_BYTES: usize = 32 * 1024 * 1024;

/// A stream connection framed into length delimited, bincode encoded
/// [`PeerMessage`] records.
pub(crate) type PeerConnection<S> = SymmetricallyFramed<
    Framed<S, LengthDelimitedCodec>,
    PeerMessage,
    SymmetricalBincode<PeerMessage>,
>;

/// Use this function to ensure that the same rules apply for both
/// ingoing and outgoing connections. This limits the size of messages
/// peers can send.
fn get_codec_rules() -> LengthDelimitedCodec {
    let mut codec_rules = LengthDelimitedCodec::new();
    codec_rules.set_max_frame_length(MAX_PEER_FRAME_LENGTH_IN_BYTES);
    codec_rules
}

pub(crate) fn frame<S>(stream: S) -> PeerConnection<S>
where
    S: AsyncRead + AsyncWrite,
{
    let length_delimited = Framed::new(stream, get_codec_rules());
    SymmetricallyFramed::new(length_delimited, SymmetricalBincode::default())
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("handshake rejected: {0}")]
    Rejected(#[from] HandshakeValidationError),

    #[error("handshake timed out")]
    Timeout,

    #[error("transport error during handshake: {0}")]
    Io(#[from] std::io::Error),

    #[error("expected handshake or peer request, got {0}")]
    UnexpectedMessage(String),

    #[error("connection closed during handshake")]
    Closed,
}

/// What the remote revealed about itself during the handshake.
#[derive(Debug, Clone)]
pub(crate) struct HandshakeOutcome {
    pub remote: HandshakeData,
    pub listen_port: u16,

    /// The peer request carrying a piggybacked handshake. It is handled like
    /// any other inbound parcel once the peer is active.
    pub first_parcel: Option<Parcel>,
}

/// Exchange handshakes over a fresh connection. Both sides send before they
/// receive, so the exchange is symmetric for incoming and outgoing
/// connections. Either handshake generation is accepted from the remote; the
/// configured mode only decides what is sent.
pub(crate) async fn handshake<S>(
    connection: &mut PeerConnection<S>,
    args: &Args,
) -> Result<HandshakeOutcome, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let own_handshake_data = args.own_handshake_data();
    let opening = match args.handshake_mode() {
        HandshakeMode::Legacy => PeerMessage::Handshake(Box::new(own_handshake_data.clone())),
        HandshakeMode::Piggybacked => {
            let mut request = Parcel::new(ParcelType::PeerRequest, vec![]);
            request.header.stamp(&own_handshake_data);
            PeerMessage::Parcel(Box::new(request))
        }
    };
    connection.send(opening).await?;

    let (remote, first_parcel) = match connection.next().await {
        None => return Err(HandshakeError::Closed),
        Some(Err(err)) => return Err(err.into()),
        Some(Ok(PeerMessage::Handshake(remote))) => (*remote, None),
        Some(Ok(PeerMessage::Parcel(parcel))) => {
            if parcel.parcel_type() != ParcelType::PeerRequest {
                return Err(HandshakeError::UnexpectedMessage(
                    parcel.parcel_type().to_string(),
                ));
            }
            (HandshakeData::from(&parcel.header), Some(*parcel))
        }
    };

    let listen_port = remote.validate(
        own_handshake_data.node_id,
        args.protocol_version_minimum,
        args.network,
    )?;

    Ok(HandshakeOutcome {
        remote,
        listen_port,
        first_parcel,
    })
}

/// Handshake an accepted socket and report the result to the controller.
///
/// All incoming connections from peers must go through this function.
pub(crate) async fn answer_peer(
    stream: TcpStream,
    peer: Arc<Peer>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) {
    info!("Established incoming TCP connection");
    match peer.activate(stream).await {
        Ok(()) => {
            info!("Connection accepted from {}", peer.endpoint());
            let _ = events.send(ConnectionEvent::Activated(peer));
        }
        Err(err) => {
            warn!("Incoming connection failed: {err}");
        }
    }
}

/// Dial an endpoint, handshake, and report the result to the controller.
///
/// All outgoing connections to peers must go through this function.
pub(crate) async fn call_peer(
    endpoint: Endpoint,
    peer: Arc<Peer>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) {
    debug!("Attempting to initiate connection to {endpoint}");
    let outcome = match dial(endpoint, peer.args().dial_timeout).await {
        Ok(stream) => peer.activate(stream).await.map_err(|err| {
            let self_connect = matches!(
                err,
                HandshakeError::Rejected(HandshakeValidationError::SelfConnect)
            );
            (anyhow::Error::from(err), self_connect)
        }),
        Err(err) => {
            peer.stop(false);
            Err((err, false))
        }
    };

    let event = match outcome {
        Ok(()) => {
            info!("Connection established to {endpoint}");
            ConnectionEvent::Activated(peer)
        }
        Err((err, self_connect)) => {
            debug!("Failed to establish connection to {endpoint}: {err}");
            ConnectionEvent::DialFailed {
                endpoint,
                self_connect,
            }
        }
    };
    let _ = events.send(event);
}

async fn dial(endpoint: Endpoint, dial_timeout: std::time::Duration) -> Result<TcpStream> {
    let stream =
        tokio::time::timeout(dial_timeout, TcpStream::connect(endpoint.socket_addr())).await??;
    Ok(stream)
}
