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

use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::clock::LamportClock;
use crate::protocol::Message;
use crate::transport::PeerTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Released,
    Wanted,
    Held,
}

/// Ricart-Agrawala mutual exclusion over the peer transport.
///
/// A request is stamped with the Lamport clock and broadcast; the section
/// is entered once every peer still in the directory has replied. Requests
/// that lose the `(ts, node_id)` ordering contest are deferred and paid on
/// release.
///
/// At most one local request may be outstanding: `acquire` refuses while a
/// previous one has not been released. Entry is signaled through a oneshot
/// handle, so no caller work ever runs under the engine lock.
pub struct RicartAgrawala {
    node_id: String,

    clock: Arc<LamportClock>,

    transport: Arc<PeerTransport>,

    inner: Mutex<Inner>,
}

struct Inner {
    state: State,

    /// Clock value stamped on the outstanding request.
    ///
    /// Meaningful only while WANTED or HELD.
    request_ts: u64,

    replies_received: usize,

    /// Requesters that lost the ordering contest; owed a REPLY on release.
    deferred: Vec<String>,

    /// Signals the waiting caller once the section is entered.
    entry_tx: Option<oneshot::Sender<()>>,
}

impl RicartAgrawala {
    pub fn new(
        node_id: String,
        clock: Arc<LamportClock>,
        transport: Arc<PeerTransport>,
    ) -> Self {
        Self {
            node_id,
            clock,
            transport,
            inner: Mutex::new(Inner {
                state: State::Released,
                request_ts: 0,
                replies_received: 0,
                deferred: Vec::new(),
                entry_tx: None,
            }),
        }
    }

    /// Request the critical section.
    ///
    /// Returns a handle that resolves once every required REPLY arrived,
    /// or `None` when a previous request is still outstanding. The holder
    /// must call [`release`](Self::release) once its work is done.
    pub async fn acquire(&self) -> Option<oneshot::Receiver<()>> {
        let (tx, rx) = oneshot::channel();

        let (ts, awaiting) = {
            let mut inner = self.inner.lock().unwrap();

            if inner.state != State::Released {
                warn!(
                    "Refusing request while one is outstanding (state = {:?})",
                    inner.state
                );

                return None;
            }

            inner.state = State::Wanted;
            inner.request_ts = self.clock.tick();
            inner.replies_received = 0;
            inner.entry_tx = Some(tx);

            (inner.request_ts, self.others().len())
        };

        info!(
            "Requesting critical section (ts = {}) (awaiting = {})",
            ts, awaiting
        );

        if awaiting > 0 {
            self.transport
                .broadcast(Message::Request {
                    sender: self.node_id.clone(),
                    ts,
                })
                .await;
        }

        // Peers pruned during the broadcast no longer owe a reply.
        self.try_enter();

        Some(rx)
    }

    /// Route a mutex protocol message, folding its timestamp into the
    /// clock first.
    pub async fn handle_message(&self, message: &Message) {
        match message {
            Message::Request { sender, ts } => {
                self.clock.observe(*ts);
                self.handle_request(sender, *ts).await;
            }
            Message::Reply { ts, .. } => {
                self.clock.observe(*ts);
                self.handle_reply();
            }
            _ => {}
        }
    }

    /// Leave the critical section and pay the deferred replies.
    pub async fn release(&self) {
        let deferred = {
            let mut inner = self.inner.lock().unwrap();

            inner.state = State::Released;

            std::mem::take(&mut inner.deferred)
        };

        info!("Released critical section (deferred = {})", deferred.len());

        for target in deferred {
            self.send_reply(&target).await;
        }
    }

    async fn handle_request(&self, sender: &str, ts: u64) {
        let defer = {
            let mut inner = self.inner.lock().unwrap();

            let defer = match inner.state {
                State::Held => true,
                // Earlier timestamp wins; on a tie the smaller node id does.
                State::Wanted => (inner.request_ts, self.node_id.as_str()) < (ts, sender),
                State::Released => false,
            };

            if defer {
                inner.deferred.push(sender.to_string());
            }

            defer
        };

        if defer {
            info!("Deferred request (from = {}) (ts = {})", sender, ts);
        } else {
            self.send_reply(sender).await;
        }
    }

    fn handle_reply(&self) {
        let (received, awaiting) = {
            let mut inner = self.inner.lock().unwrap();

            inner.replies_received += 1;

            (inner.replies_received, self.others().len())
        };

        debug!("Reply received ({}/{})", received, awaiting);

        self.try_enter();
    }

    /// Enter once every reply from the peers still in the directory has
    /// arrived.
    ///
    /// The required count is recomputed from the live directory on every
    /// check, so a peer pruned after a failed send is no longer waited on.
    fn try_enter(&self) {
        let awaiting = self.others().len();

        let entry = {
            let mut inner = self.inner.lock().unwrap();

            if inner.state == State::Wanted && inner.replies_received >= awaiting {
                inner.state = State::Held;

                inner.entry_tx.take()
            } else {
                None
            }
        };

        if let Some(tx) = entry {
            info!("Entered critical section (ts = {})", self.clock.value());

            let _ = tx.send(());
        }
    }

    /// Sending a reply is a local event; it carries a fresh tick.
    async fn send_reply(&self, target: &str) {
        let ts = self.clock.tick();

        debug!("Replying (to = {}) (ts = {})", target, ts);

        self.transport
            .send_to(
                target,
                Message::Reply {
                    sender: self.node_id.clone(),
                    ts,
                },
            )
            .await;
    }

    fn others(&self) -> Vec<String> {
        self.transport
            .known_peers()
            .into_iter()
            .filter(|id| *id != self.node_id)
            .collect()
    }
}
