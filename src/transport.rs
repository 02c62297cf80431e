// Platea - Replicated seat reservation over a TCP peer mesh: Ricart-Agrawala mutual exclusion on Lamport time, length-framed JSON protocol
// Copyright (C) 2021  Platea contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Mutex, RwLock};

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Duration};
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, FramedWrite};

use futures::sink::SinkExt;

use crate::error::{PlateaError, PlateaResult};
use crate::protocol::{FrameCodec, Message, PeerAddr};

/// Connection-per-message peer transport.
///
/// Inbound connections are accepted on a background task; every decoded
/// frame is forwarded into the channel handed to [`PeerTransport::new`],
/// which the replica coordinator consumes. Outbound messages open a fresh
/// connection, write one frame and close.
///
/// There is no heartbeat. A failed send is the only signal that a peer is
/// gone, at which point `broadcast` prunes it from the directory.
pub struct PeerTransport {
    node_id: String,

    /// Known peers, this node included once a SYNC carried it.
    ///
    /// Replaced wholesale by SYNC, pruned entry-by-entry on send failure.
    /// Never held across I/O; reads take snapshots.
    directory: RwLock<HashMap<String, PeerAddr>>,

    /// Inbound frames funnel here, in arrival order per connection.
    tx_inbound: mpsc::UnboundedSender<Message>,

    /// Connect-and-send budget for one outgoing message.
    send_timeout: Duration,

    /// Flipped by `stop` to wind down the accept loop.
    tx_shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl PeerTransport {
    pub fn new(
        node_id: String,
        tx_inbound: mpsc::UnboundedSender<Message>,
        send_timeout: Duration,
    ) -> Self {
        Self {
            node_id,
            directory: RwLock::new(HashMap::new()),
            tx_inbound,
            send_timeout,
            tx_shutdown: Mutex::new(None),
        }
    }

    /// Bind the listening socket and spawn the accept loop.
    ///
    /// Returns the bound address, which differs from `bind` when an
    /// ephemeral port was requested.
    pub async fn start<A>(&self, bind: A) -> PlateaResult<SocketAddr>
    where
        A: ToSocketAddrs,
    {
        let listener = TcpListener::bind(bind).await?;
        let addr = listener.local_addr()?;

        let (tx_shutdown, mut rx_shutdown) = watch::channel(false);
        *self.tx_shutdown.lock().unwrap() = Some(tx_shutdown);

        let tx_inbound = self.tx_inbound.clone();

        tokio::spawn(async move {
            loop {
                select! {
                    _ = rx_shutdown.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!("Peer has connected (addr = {})", peer);

                            spawn_reader(stream, peer, tx_inbound.clone());
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                            break;
                        }
                    }
                }
            }

            debug!("Accept loop terminated (addr = {})", addr);
        });

        Ok(addr)
    }

    /// Stop accepting inbound connections. In-flight readers drain
    /// naturally on EOF.
    pub fn stop(&self) {
        if let Some(tx) = self.tx_shutdown.lock().unwrap().take() {
            let _ = tx.send(true);
        }
    }

    /// Replace the whole directory.
    pub fn update_directory(&self, peers: HashMap<String, PeerAddr>) {
        *self.directory.write().unwrap() = peers;
    }

    /// Snapshot of currently known peer ids, this node included.
    pub fn known_peers(&self) -> Vec<String> {
        self.directory.read().unwrap().keys().cloned().collect()
    }

    /// Send one message to a known peer; reports whether the send landed.
    ///
    /// The message is stamped with this node's id before serialization.
    /// An unknown destination or a timed-out connect/send yields `false`.
    pub async fn send_to(&self, target: &str, message: Message) -> bool {
        match self.try_send_to(target, message).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Send failed (node = {}): {}", target, e);

                false
            }
        }
    }

    async fn try_send_to(&self, target: &str, mut message: Message) -> PlateaResult<()> {
        let addr = self
            .directory
            .read()
            .unwrap()
            .get(target)
            .cloned()
            .ok_or_else(|| PlateaError::UnknownDestination(target.to_string()))?;

        message.stamp_sender(&self.node_id);

        send_message(&addr.endpoint(), &message, self.send_timeout).await
    }

    /// Send to every known peer except this node.
    ///
    /// Peers that could not be reached are removed from the directory; the
    /// returned list holds the ids that were.
    pub async fn broadcast(&self, message: Message) -> Vec<String> {
        let targets: Vec<String> = self
            .known_peers()
            .into_iter()
            .filter(|id| *id != self.node_id)
            .collect();

        let mut reached = Vec::with_capacity(targets.len());
        let mut lost = Vec::new();

        for target in targets {
            if self.send_to(&target, message.clone()).await {
                reached.push(target);
            } else {
                lost.push(target);
            }
        }

        if !lost.is_empty() {
            let mut directory = self.directory.write().unwrap();

            for target in &lost {
                directory.remove(target);

                info!("Pruned unreachable peer (node = {})", target);
            }
        }

        reached
    }
}

/// Read frames off one inbound connection until EOF or framing break.
fn spawn_reader(stream: TcpStream, peer: SocketAddr, tx_inbound: mpsc::UnboundedSender<Message>) {
    tokio::spawn(async move {
        let mut frames = FramedRead::new(stream, FrameCodec);

        while let Some(frame) = frames.next().await {
            match frame {
                Ok(message) => {
                    let _ = tx_inbound.send(message);
                }
                Err(e) => {
                    warn!("Dropping connection (addr = {}): {}", peer, e);
                    break;
                }
            }
        }
    });
}

/// Open a fresh connection, write one framed message, close.
///
/// The connect and the write together share `limit`; exceeding it counts
/// as a send failure.
pub async fn send_message(addr: &str, message: &Message, limit: Duration) -> PlateaResult<()> {
    let send = async {
        let stream = TcpStream::connect(addr).await?;
        let mut frames = FramedWrite::new(stream, FrameCodec);

        frames.send(message).await?;

        Ok::<(), PlateaError>(())
    };

    match timeout(limit, send).await {
        Ok(result) => result,
        Err(_) => Err(PlateaError::SendTimeout(addr.to_string())),
    }
}
