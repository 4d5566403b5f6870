use std::sync::Arc;

use futures::stream::SplitSink;
use futures::stream::SplitStream;
use futures::SinkExt;
use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::connect_to_peers::PeerConnection;
use crate::models::peer::parcel::Parcel;
use crate::models::peer::parcel::ParcelType;
use crate::models::peer::PeerMessage;
use crate::peer::Peer;

/// Decode parcels until the connection fails, the read deadline expires, or
/// the peer is stopped. Any failure is fatal to the connection.
pub(crate) async fn inbound_pump<S>(peer: Arc<Peer>, mut stream: SplitStream<PeerConnection<S>>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let read_deadline = peer.args().read_deadline;
    loop {
        let next = select! {
            _ = peer.cancelled() => break,
            next = time::timeout(read_deadline, stream.next()) => next,
        };

        match next {
            Err(_elapsed) => {
                debug!("Read deadline of {read_deadline:?} expired. Closing connection");
                break;
            }
            Ok(None) => {
                debug!("Connection closed by remote");
                break;
            }
            Ok(Some(Err(err))) => {
                debug!("Failed to decode parcel: {err}. Closing connection");
                break;
            }
            Ok(Some(Ok(PeerMessage::Handshake(_)))) => {
                warn!("Got second handshake. Closing connection");
                break;
            }
            Ok(Some(Ok(PeerMessage::Parcel(parcel)))) => {
                trace!("Received {} parcel", parcel.parcel_type());
                let size = bincode::serialized_size(&parcel).unwrap_or_default();
                peer.receive(*parcel, size);
            }
        }
    }

    peer.stop(true);
}

/// Drain the outbound queue in order, stamping each parcel with this node's
/// current identity right before it is encoded. Sends a ping whenever nothing
/// was sent for the ping interval.
pub(crate) async fn outbound_pump<S>(
    peer: Arc<Peer>,
    mut sink: SplitSink<PeerConnection<S>, PeerMessage>,
    mut send_rx: mpsc::Receiver<Parcel>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ping_interval = peer.args().ping_interval;
    let ping_timer = time::sleep(ping_interval);
    tokio::pin!(ping_timer);

    loop {
        let parcel = select! {
            _ = peer.cancelled() => break,
            parcel = send_rx.recv() => match parcel {
                Some(parcel) => parcel,
                None => break,
            },
            _ = &mut ping_timer => Parcel::new(ParcelType::Ping, vec![]),
        };

        if let Err(err) = write_parcel(&peer, &mut sink, parcel).await {
            debug!("Failed to send parcel: {err}. Closing connection");
            break;
        }
        ping_timer
            .as_mut()
            .reset(time::Instant::now() + ping_interval);
    }

    peer.stop(true);
    let _ = time::timeout(peer.args().write_deadline, sink.close()).await;
}

async fn write_parcel<S>(
    peer: &Peer,
    sink: &mut SplitSink<PeerConnection<S>, PeerMessage>,
    mut parcel: Parcel,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let args = peer.args();
    parcel.header.stamp(&args.own_handshake_data());
    let size = bincode::serialized_size(&parcel).unwrap_or_default();
    let parcel_type = parcel.parcel_type();

    time::timeout(
        args.write_deadline,
        sink.send(PeerMessage::Parcel(Box::new(parcel))),
    )
    .await??;

    trace!("Sent {parcel_type} parcel");
    peer.record_send(size);
    Ok(())
}
