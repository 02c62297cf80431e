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

use std::sync::Mutex;

/// Lamport logical clock.
///
/// Local events advance the clock by one; receiving a message folds the
/// carried timestamp in with `max(local, received) + 1`. All updates are
/// serialized by a single lock.
pub struct LamportClock {
    value: Mutex<u64>,
}

impl LamportClock {
    pub fn new() -> Self {
        Self {
            value: Mutex::new(0),
        }
    }

    /// Advance for a local event, returning the new value.
    pub fn tick(&self) -> u64 {
        let mut value = self.value.lock().unwrap();

        *value += 1;

        *value
    }

    /// Fold in the timestamp carried by a received message.
    pub fn observe(&self, ts: u64) -> u64 {
        let mut value = self.value.lock().unwrap();

        *value = (*value).max(ts) + 1;

        *value
    }

    pub fn value(&self) -> u64 {
        *self.value.lock().unwrap()
    }
}

impl Default for LamportClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_zero() {
        assert_eq!(LamportClock::new().value(), 0);
    }

    #[test]
    fn tick_advances_by_one() {
        let clock = LamportClock::new();

        assert_eq!(clock.tick(), 1);
        assert_eq!(clock.value(), 1);
    }

    #[test]
    fn observe_folds_in_a_newer_timestamp() {
        let clock = LamportClock::new();

        clock.tick();

        assert_eq!(clock.observe(5), 6);
    }

    #[test]
    fn observe_still_advances_past_a_stale_timestamp() {
        let clock = LamportClock::new();

        for _ in 0..10 {
            clock.tick();
        }

        assert_eq!(clock.observe(3), 11);
    }
}
