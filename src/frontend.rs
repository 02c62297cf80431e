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

/// Callback contract between the coordinator and a display surface.
///
/// Implementations are invoked from the coordinator loop and must return
/// promptly; anything slow belongs on the surface's own thread.
pub trait Frontend: Send {
    /// A single slot changed hands.
    fn seat_changed(&self, seat_id: usize, owner: Option<&str>);

    /// The whole array was replaced (state transfer or redraw request).
    fn refresh(&self, seats: &[Option<String>]);

    /// One line of user-facing feedback.
    fn status(&self, line: &str);
}

/// Log-backed surface used by the node binary.
pub struct ConsoleFrontend {
    node_id: String,
}

impl ConsoleFrontend {
    pub fn new<I: Into<String>>(node_id: I) -> Self {
        Self {
            node_id: node_id.into(),
        }
    }
}

impl Frontend for ConsoleFrontend {
    fn seat_changed(&self, seat_id: usize, owner: Option<&str>) {
        match owner {
            Some(owner) if owner == self.node_id => info!("[seat {}] yours", seat_id),
            Some(owner) => info!("[seat {}] taken by {}", seat_id, owner),
            None => info!("[seat {}] free", seat_id),
        }
    }

    fn refresh(&self, seats: &[Option<String>]) {
        let rendered: Vec<String> = seats
            .iter()
            .enumerate()
            .map(|(seat_id, owner)| match owner {
                Some(owner) if *owner == self.node_id => format!("{}:you", seat_id),
                Some(owner) => format!("{}:{}", seat_id, owner),
                None => format!("{}:-", seat_id),
            })
            .collect();

        info!("Seats [{}]", rendered.join(" "));
    }

    fn status(&self, line: &str) {
        info!("{}", line);
    }
}
