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

//! Every peer holds a full replica of a fixed-size seat array. Local
//! mutations are serialized through a Ricart-Agrawala distributed mutex
//! driven by Lamport time, then announced to the mesh from inside the
//! critical section, so all replicas apply the same total order.
//!
//! A single well-known name server bootstraps the peer directory; after
//! that the mesh is flat, with one fresh TCP connection per message.

#[macro_use]
extern crate log;

pub mod clock;
pub mod config;
pub mod error;
pub mod frontend;
pub mod mutex;
pub mod nameserver;
pub mod platea;
pub mod protocol;
pub mod transport;
