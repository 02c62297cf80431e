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

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;

use crate::error::PlateaResult;
use crate::protocol::{FrameCodec, Message, PeerAddr};
use crate::transport::send_message;

/// Directory of registered peers.
///
/// Re-registration under the same id replaces the previous entry.
#[derive(Debug, Default)]
pub struct Registry {
    peers: HashMap<String, PeerAddr>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            peers: HashMap::new(),
        }
    }

    pub fn register<I, H>(&mut self, node_id: I, host: H, port: u16)
    where
        I: Into<String>,
        H: Into<String>,
    {
        let node_id = node_id.into();
        let addr = PeerAddr::new(host, port);

        info!(
            "Registered peer (node = {}) (addr = {})",
            node_id,
            addr.endpoint()
        );

        self.peers.insert(node_id, addr);
    }

    pub fn remove(&mut self, node_id: &str) {
        if self.peers.remove(node_id).is_some() {
            info!("Removed peer (node = {})", node_id);
        }
    }

    pub fn peers(&self) -> &HashMap<String, PeerAddr> {
        &self.peers
    }
}

/// The single well-known registry every peer contacts on boot.
///
/// Registrations arrive as one REGISTER frame on a short-lived
/// connection; the registrant's host is taken from the connection itself,
/// its port from the frame. After each registration the full directory is
/// pushed to every member as SYNC, the newcomer included.
pub struct NameServer {
    listener: TcpListener,

    registry: Registry,

    /// Connect-and-send budget for one SYNC push.
    push_timeout: Duration,
}

impl NameServer {
    pub async fn new<A>(bind: A, push_timeout: Duration) -> PlateaResult<Self>
    where
        A: ToSocketAddrs,
    {
        Ok(Self {
            listener: TcpListener::bind(bind).await?,
            registry: Registry::new(),
            push_timeout,
        })
    }

    pub fn local_addr(&self) -> PlateaResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept registrations until ctrl-c.
    ///
    /// Push failures are logged and do not roll back the registration;
    /// the unreachable peer keeps its entry until it drops off on its
    /// own.
    pub async fn up(&mut self) -> PlateaResult<()> {
        info!("Name server running (addr = {})", self.listener.local_addr()?);

        let (tx, mut rx) = mpsc::unbounded_channel();

        loop {
            select! {
                _ = tokio::signal::ctrl_c() => {
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("Peer has connected (addr = {})", addr);

                        Self::read_registration(stream, addr, tx.clone());
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                },
                Some((message, host)) = rx.recv() => {
                    if let Message::Register { node_id, listening_port } = message {
                        self.registry.register(node_id, host, listening_port);
                        self.push_sync().await;
                    } else {
                        debug!("Ignoring message ({:?})", message);
                    }
                }
            }
        }
    }

    /// Read one frame off a short-lived registration connection.
    fn read_registration(
        stream: TcpStream,
        addr: SocketAddr,
        tx: mpsc::UnboundedSender<(Message, String)>,
    ) {
        tokio::spawn(async move {
            let mut frames = FramedRead::new(stream, FrameCodec);

            match frames.next().await {
                Some(Ok(message)) => {
                    let _ = tx.send((message, addr.ip().to_string()));
                }
                Some(Err(e)) => {
                    warn!("Dropping connection (addr = {}): {}", addr, e);
                }
                None => {}
            }
        });
    }

    async fn push_sync(&self) {
        let peers = self.registry.peers().clone();

        info!("Pushing directory (peers = {})", peers.len());

        for (node_id, addr) in &peers {
            let message = Message::Sync {
                peers: peers.clone(),
            };

            if let Err(e) = send_message(&addr.endpoint(), &message, self.push_timeout).await {
                warn!("Failed to push directory (node = {}): {}", node_id, e);
            }
        }
    }
}
