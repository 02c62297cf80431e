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

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::ToSocketAddrs;
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Duration;

use crate::clock::LamportClock;
use crate::error::PlateaResult;
use crate::frontend::Frontend;
use crate::mutex::RicartAgrawala;
use crate::protocol::Message;
use crate::transport::{send_message, PeerTransport};

/// What a local click wants done with a seat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Book,
    Free,
}

/// Events funneled into the coordinator loop.
#[derive(Debug)]
pub enum Event {
    /// A local intent from the front end.
    Intent(usize, Intent),

    /// The mutex granted entry for a pending intent.
    Entered(usize, Intent),

    /// Front-end request to redraw the whole seat array.
    Show,
}

/// Clonable click surface handed to the front end.
#[derive(Clone)]
pub struct IntentHandle {
    tx: mpsc::UnboundedSender<Event>,
}

impl IntentHandle {
    pub fn book(&self, seat_id: usize) {
        let _ = self.tx.send(Event::Intent(seat_id, Intent::Book));
    }

    pub fn free(&self, seat_id: usize) {
        let _ = self.tx.send(Event::Intent(seat_id, Intent::Free));
    }

    pub fn show(&self) {
        let _ = self.tx.send(Event::Show);
    }
}

/// Replica coordinator, one per peer process.
///
/// Owns the seat array and the event loop gluing the front end, the peer
/// transport and the mutual exclusion engine together. Every seat
/// mutation happens on this loop, either inside the critical section or
/// in response to an authoritative announcement, so the replica applies
/// one serial order.
pub struct Platea {
    node_id: String,

    clock: Arc<LamportClock>,

    transport: Arc<PeerTransport>,

    engine: Arc<RicartAgrawala>,

    /// Replicated resource: `None` is a free seat, `Some(id)` its owner.
    seats: Vec<Option<String>>,

    /// Whether a SYNC naming another peer was seen yet.
    ///
    /// The first such directory triggers the one-shot state transfer.
    seen_directory: bool,

    frontend: Box<dyn Frontend>,

    /// Decoded inbound frames from the transport.
    rx_net: mpsc::UnboundedReceiver<Message>,

    /// Local events: intents, granted entries, redraw requests.
    rx_events: mpsc::UnboundedReceiver<Event>,

    /// Cloned out to the front end and to entry waiters.
    tx_events: mpsc::UnboundedSender<Event>,

    send_timeout: Duration,
}

impl Platea {
    pub fn new(
        node_id: String,
        seat_count: usize,
        send_timeout: Duration,
        frontend: Box<dyn Frontend>,
    ) -> Self {
        let (tx_net, rx_net) = mpsc::unbounded_channel();
        let (tx_events, rx_events) = mpsc::unbounded_channel();

        let clock = Arc::new(LamportClock::new());
        let transport = Arc::new(PeerTransport::new(
            node_id.clone(),
            tx_net,
            send_timeout,
        ));
        let engine = Arc::new(RicartAgrawala::new(
            node_id.clone(),
            Arc::clone(&clock),
            Arc::clone(&transport),
        ));

        Self {
            node_id,
            clock,
            transport,
            engine,
            seats: vec![None; seat_count],
            seen_directory: false,
            frontend,
            rx_net,
            rx_events,
            tx_events,
            send_timeout,
        }
    }

    /// Click surface for the front end.
    pub fn handle(&self) -> IntentHandle {
        IntentHandle {
            tx: self.tx_events.clone(),
        }
    }

    /// Bind the peer's listening socket; returns the bound address.
    pub async fn start<A>(&self, bind: A) -> PlateaResult<SocketAddr>
    where
        A: ToSocketAddrs,
    {
        self.transport.start(bind).await
    }

    /// Announce this peer to the name server.
    ///
    /// An unreachable name server leaves the node isolated: the directory
    /// stays empty and local requests enter immediately.
    pub async fn register(&self, nameserver: &str, listening_port: u16) {
        let message = Message::Register {
            node_id: self.node_id.clone(),
            listening_port,
        };

        match send_message(nameserver, &message, self.send_timeout).await {
            Ok(()) => info!("Registered with name server (addr = {})", nameserver),
            Err(e) => {
                error!("Name server unreachable (addr = {}): {}", nameserver, e);

                self.frontend
                    .status("name server unreachable, running isolated");
            }
        }
    }

    /// Run the coordinator loop until ctrl-c.
    pub async fn run(&mut self) -> PlateaResult<()> {
        info!(
            "Coordinator running (node = {}) (seats = {})",
            self.node_id,
            self.seats.len()
        );

        loop {
            select! {
                _ = tokio::signal::ctrl_c() => {
                    self.transport.stop();

                    return Ok(());
                }
                Some(message) = self.rx_net.recv() => self.handle_message(message).await,
                Some(event) = self.rx_events.recv() => self.handle_event(event).await,
            }
        }
    }

    async fn handle_message(&mut self, message: Message) {
        match message {
            Message::Request { .. } | Message::Reply { .. } => {
                self.engine.handle_message(&message).await;
            }
            Message::Sync { peers } => {
                info!("Directory updated (peers = {})", peers.len());

                self.frontend
                    .status(&format!("peers connected: {}", peers.len()));

                let first_directory = !self.seen_directory && !peers.is_empty();
                let target = peers
                    .keys()
                    .find(|id| **id != self.node_id)
                    .cloned();

                self.transport.update_directory(peers);

                // Only the first non-empty directory seeds the replica. A
                // peer that was alone in it is established, not joining,
                // and must never adopt a later newcomer's empty array.
                if first_directory {
                    self.seen_directory = true;

                    if let Some(target) = target {
                        self.request_state(&target).await;
                    }
                }
            }
            Message::StateRequest { sender } => {
                debug!("State requested (by = {})", sender);

                self.transport
                    .send_to(
                        &sender,
                        Message::StateReply {
                            sender: self.node_id.clone(),
                            seats: self.seats.clone(),
                        },
                    )
                    .await;
            }
            Message::StateReply { sender, seats } => {
                info!(
                    "Seat state adopted (from = {}) (seats = {})",
                    sender,
                    seats.len()
                );

                self.seats = seats;
                self.frontend.refresh(&self.seats);
            }
            Message::Acquire {
                seat_id,
                owner,
                ts,
                ..
            } => {
                self.clock.observe(ts);
                self.apply_acquire(seat_id, owner);
            }
            Message::Release { seat_id, sender, ts } => {
                self.clock.observe(ts);
                self.apply_release(seat_id, &sender);
            }
            other => {
                debug!("Ignoring message ({:?})", other);
            }
        }
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Intent(seat_id, intent) => self.handle_intent(seat_id, intent).await,
            Event::Entered(seat_id, intent) => self.handle_entered(seat_id, intent).await,
            Event::Show => self.frontend.refresh(&self.seats),
        }
    }

    async fn handle_intent(&mut self, seat_id: usize, intent: Intent) {
        if seat_id >= self.seats.len() {
            self.frontend.status(&format!("no such seat: {}", seat_id));

            return;
        }

        // Local precondition; a doomed intent causes no protocol traffic.
        match intent {
            Intent::Book => {
                if let Some(owner) = &self.seats[seat_id] {
                    self.frontend
                        .status(&format!("seat {} already taken by {}", seat_id, owner));

                    return;
                }
            }
            Intent::Free => {
                if self.seats[seat_id].as_deref() != Some(self.node_id.as_str()) {
                    self.frontend
                        .status(&format!("seat {} is not yours to free", seat_id));

                    return;
                }
            }
        }

        match self.engine.acquire().await {
            Some(entry) => {
                self.frontend
                    .status(&format!("requesting seat {}...", seat_id));

                self.await_entry(seat_id, intent, entry);
            }
            None => {
                self.frontend
                    .status("busy with a previous request, retry shortly");
            }
        }
    }

    /// Park a waiter for the granted entry; the critical-section work
    /// itself happens back on the coordinator loop.
    fn await_entry(&self, seat_id: usize, intent: Intent, entry: oneshot::Receiver<()>) {
        let tx_events = self.tx_events.clone();

        tokio::spawn(async move {
            if entry.await.is_ok() {
                let _ = tx_events.send(Event::Entered(seat_id, intent));
            }
        });
    }

    /// Inside the critical section: re-check the slot, mutate, announce.
    async fn handle_entered(&mut self, seat_id: usize, intent: Intent) {
        if seat_id >= self.seats.len() {
            // A state transfer shrank the array while we were waiting.
            self.engine.release().await;

            return;
        }

        match intent {
            Intent::Book if self.seats[seat_id].is_none() => {
                self.seats[seat_id] = Some(self.node_id.clone());
                self.frontend.seat_changed(seat_id, Some(self.node_id.as_str()));
                self.frontend.status(&format!("seat {} booked", seat_id));

                let ts = self.clock.tick();

                self.transport
                    .broadcast(Message::Acquire {
                        seat_id,
                        owner: self.node_id.clone(),
                        sender: self.node_id.clone(),
                        ts,
                    })
                    .await;
            }
            Intent::Free if self.seats[seat_id].as_deref() == Some(self.node_id.as_str()) => {
                self.seats[seat_id] = None;
                self.frontend.seat_changed(seat_id, None);
                self.frontend.status(&format!("seat {} freed", seat_id));

                let ts = self.clock.tick();

                self.transport
                    .broadcast(Message::Release {
                        seat_id,
                        sender: self.node_id.clone(),
                        ts,
                    })
                    .await;
            }
            _ => {
                // Lost the race to a peer whose announcement landed first.
                self.frontend
                    .status(&format!("seat {} changed hands first, nothing done", seat_id));
                self.frontend
                    .seat_changed(seat_id, self.seats[seat_id].as_deref());
            }
        }

        self.engine.release().await;
    }

    fn apply_acquire(&mut self, seat_id: usize, owner: String) {
        if seat_id >= self.seats.len() {
            warn!("Announcement for a seat out of range (seat = {})", seat_id);

            return;
        }

        info!("Seat taken (seat = {}) (owner = {})", seat_id, owner);

        self.frontend.seat_changed(seat_id, Some(owner.as_str()));
        self.seats[seat_id] = Some(owner);
    }

    fn apply_release(&mut self, seat_id: usize, sender: &str) {
        if seat_id >= self.seats.len() {
            warn!("Announcement for a seat out of range (seat = {})", seat_id);

            return;
        }

        // Only the owner should free a seat; apply regardless so replicas
        // never diverge over validation.
        if self.seats[seat_id].as_deref() != Some(sender) {
            warn!(
                "Release from a non-owner (seat = {}) (sender = {})",
                seat_id, sender
            );
        }

        info!("Seat freed (seat = {})", seat_id);

        self.seats[seat_id] = None;
        self.frontend.seat_changed(seat_id, None);
    }

    async fn request_state(&self, target: &str) {
        info!("Requesting seat state (from = {})", target);

        self.transport
            .send_to(
                target,
                Message::StateRequest {
                    sender: self.node_id.clone(),
                },
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    use tokio::time::timeout;

    use crate::protocol::PeerAddr;

    struct SilentFrontend;

    impl Frontend for SilentFrontend {
        fn seat_changed(&self, _seat_id: usize, _owner: Option<&str>) {}

        fn refresh(&self, _seats: &[Option<String>]) {}

        fn status(&self, _line: &str) {}
    }

    fn coordinator(node_id: &str, seat_count: usize) -> Platea {
        Platea::new(
            node_id.to_string(),
            seat_count,
            Duration::from_millis(500),
            Box::new(SilentFrontend),
        )
    }

    fn acquire_announcement(seat_id: usize, owner: &str, ts: u64) -> Message {
        Message::Acquire {
            seat_id,
            owner: owner.to_string(),
            sender: owner.to_string(),
            ts,
        }
    }

    #[tokio::test]
    async fn acquire_announcement_sets_the_owner() {
        let mut node = coordinator("a", 5);

        node.handle_message(acquire_announcement(2, "b", 5)).await;

        assert_eq!(node.seats[2].as_deref(), Some("b"));
        // Receipt is a clock event.
        assert_eq!(node.clock.value(), 6);
    }

    #[tokio::test]
    async fn release_announcement_clears_the_slot() {
        let mut node = coordinator("a", 5);

        node.handle_message(acquire_announcement(2, "b", 5)).await;
        node.handle_message(Message::Release {
            seat_id: 2,
            sender: "b".to_string(),
            ts: 7,
        })
        .await;

        assert_eq!(node.seats[2], None);
    }

    #[tokio::test]
    async fn release_from_a_non_owner_still_applies() {
        let mut node = coordinator("a", 5);

        node.handle_message(acquire_announcement(2, "b", 5)).await;
        node.handle_message(Message::Release {
            seat_id: 2,
            sender: "c".to_string(),
            ts: 7,
        })
        .await;

        assert_eq!(node.seats[2], None);
    }

    #[tokio::test]
    async fn out_of_range_announcements_are_ignored() {
        let mut node = coordinator("a", 5);

        node.handle_message(acquire_announcement(99, "b", 5)).await;

        assert!(node.seats.iter().all(|seat| seat.is_none()));
    }

    #[tokio::test]
    async fn state_reply_overwrites_the_array() {
        let mut node = coordinator("a", 3);

        node.seats[0] = Some("a".to_string());

        node.handle_message(Message::StateReply {
            sender: "b".to_string(),
            seats: vec![None, Some("b".to_string()), None],
        })
        .await;

        assert_eq!(
            node.seats,
            vec![None, Some("b".to_string()), None]
        );
    }

    #[tokio::test]
    async fn same_announcements_converge() {
        let mut left = coordinator("a", 4);
        let mut right = coordinator("b", 4);

        let announcements = vec![
            acquire_announcement(1, "x", 2),
            acquire_announcement(3, "y", 3),
            Message::Release {
                seat_id: 1,
                sender: "x".to_string(),
                ts: 5,
            },
        ];

        for announcement in &announcements {
            left.handle_message(announcement.clone()).await;
            right.handle_message(announcement.clone()).await;
        }

        assert_eq!(left.seats, right.seats);
        assert_eq!(left.seats, vec![None, None, None, Some("y".to_string())]);
    }

    #[tokio::test]
    async fn first_sync_requests_state_from_an_established_peer() {
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let a_transport = Arc::new(PeerTransport::new(
            "a".to_string(),
            tx_a,
            Duration::from_millis(500),
        ));
        let a_port = a_transport.start("127.0.0.1:0").await.unwrap().port();

        let mut b = coordinator("b", 5);

        let mut peers = HashMap::new();
        peers.insert("a".to_string(), PeerAddr::new("127.0.0.1", a_port));
        peers.insert("b".to_string(), PeerAddr::new("127.0.0.1", 1));

        b.handle_message(Message::Sync {
            peers: peers.clone(),
        })
        .await;

        let received = timeout(Duration::from_secs(2), rx_a.recv())
            .await
            .expect("no state request")
            .unwrap();

        assert_eq!(
            received,
            Message::StateRequest {
                sender: "b".to_string(),
            }
        );

        // A second SYNC does not re-request.
        b.handle_message(Message::Sync { peers }).await;

        assert!(timeout(Duration::from_millis(300), rx_a.recv())
            .await
            .is_err());

        a_transport.stop();
    }

    #[tokio::test]
    async fn established_node_never_requests_state() {
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let a_transport = Arc::new(PeerTransport::new(
            "a".to_string(),
            tx_a,
            Duration::from_millis(500),
        ));
        let a_port = a_transport.start("127.0.0.1:0").await.unwrap().port();

        let mut b = coordinator("b", 5);

        // b was the first registrant: its first directory names only b.
        let mut alone = HashMap::new();
        alone.insert("b".to_string(), PeerAddr::new("127.0.0.1", 1));

        b.handle_message(Message::Sync { peers: alone }).await;

        // When a joins later, b is established and must not re-seed.
        let mut peers = HashMap::new();
        peers.insert("a".to_string(), PeerAddr::new("127.0.0.1", a_port));
        peers.insert("b".to_string(), PeerAddr::new("127.0.0.1", 1));

        b.handle_message(Message::Sync { peers }).await;

        assert!(timeout(Duration::from_millis(300), rx_a.recv())
            .await
            .is_err());

        a_transport.stop();
    }

    #[tokio::test]
    async fn booking_an_owned_seat_causes_no_traffic() {
        let mut node = coordinator("a", 5);

        node.seats[1] = Some("b".to_string());

        node.handle_intent(1, Intent::Book).await;

        // No request went out and the engine stayed free.
        assert_eq!(node.seats[1].as_deref(), Some("b"));
        assert!(node.engine.acquire().await.is_some());
    }

    #[tokio::test]
    async fn freeing_someone_elses_seat_is_rejected() {
        let mut node = coordinator("a", 5);

        node.seats[1] = Some("b".to_string());

        node.handle_intent(1, Intent::Free).await;

        assert_eq!(node.seats[1].as_deref(), Some("b"));
        assert!(node.engine.acquire().await.is_some());
    }

    #[tokio::test]
    async fn book_flow_enters_and_takes_the_seat() {
        let mut node = coordinator("a", 5);

        node.handle_intent(0, Intent::Book).await;

        // Empty directory: entry is granted immediately and the waiter
        // posts back onto the event channel.
        let event = timeout(Duration::from_secs(2), node.rx_events.recv())
            .await
            .expect("entry never posted")
            .unwrap();

        node.handle_event(event).await;

        assert_eq!(node.seats[0].as_deref(), Some("a"));
        // The engine was released for the next intent.
        assert!(node.engine.acquire().await.is_some());
    }

    #[tokio::test]
    async fn losing_the_race_books_nothing() {
        let mut node = coordinator("a", 5);

        node.handle_intent(0, Intent::Book).await;

        let event = timeout(Duration::from_secs(2), node.rx_events.recv())
            .await
            .expect("entry never posted")
            .unwrap();

        // A competing announcement lands before our entry is serviced.
        node.handle_message(acquire_announcement(0, "b", 9)).await;

        node.handle_event(event).await;

        assert_eq!(node.seats[0].as_deref(), Some("b"));
        assert!(node.engine.acquire().await.is_some());
    }

    #[tokio::test]
    async fn free_flow_releases_the_seat() {
        let mut node = coordinator("a", 5);

        node.seats[0] = Some("a".to_string());

        node.handle_intent(0, Intent::Free).await;

        let event = timeout(Duration::from_secs(2), node.rx_events.recv())
            .await
            .expect("entry never posted")
            .unwrap();

        node.handle_event(event).await;

        assert_eq!(node.seats[0], None);
    }
}
