// Platea - Replicated seat reservation over a TCP peer mesh: Ricart-Agrawala mutual exclusion on Lamport time, length-framed JSON protocol
// Copyright (C) 2021  Platea contributors

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::env::var;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::PlateaResult;

#[derive(Deserialize, Debug, Default)]
pub struct Config {
    #[serde(rename(deserialize = "General"), default)]
    pub general: General,
}

#[derive(Deserialize, Debug)]
#[serde(default)]
pub struct General {
    /// Host the peer's listening socket binds to.
    pub bind_host: String,

    /// Well-known name server endpoint contacted on boot.
    pub nameserver_address: String,

    /// Number of slots in the replicated seat array.
    /// Every peer of a mesh must agree on this.
    pub seat_count: usize,

    /// Connect-and-send budget for a single outgoing message, in
    /// milliseconds. A send that exceeds it counts as a peer failure.
    pub send_timeout_ms: u64,
}

impl Default for General {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            nameserver_address: "127.0.0.1:5000".to_string(),
            seat_count: 25,
            send_timeout_ms: 2000,
        }
    }
}

impl General {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

impl Config {
    /// Load the config named by `PLATEA_CONFIG`, defaulting to
    /// `platea.toml`. A missing file is not an error; defaults apply.
    pub fn load() -> PlateaResult<Self> {
        let config_loc = var("PLATEA_CONFIG").unwrap_or_else(|_| "platea.toml".into());

        if !Path::new(&config_loc).exists() {
            return Ok(Self::default());
        }

        Ok(toml::from_slice(&std::fs::read(config_loc)?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_config_parses() {
        let config: Config = toml::from_str(
            r#"
            [General]
            bind_host = "0.0.0.0"
            nameserver_address = "10.0.0.1:5000"
            seat_count = 9
            send_timeout_ms = 500
            "#,
        )
        .unwrap();

        assert_eq!(config.general.bind_host, "0.0.0.0");
        assert_eq!(config.general.nameserver_address, "10.0.0.1:5000");
        assert_eq!(config.general.seat_count, 9);
        assert_eq!(config.general.send_timeout(), Duration::from_millis(500));
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config: Config = toml::from_str(
            r#"
            [General]
            seat_count = 4
            "#,
        )
        .unwrap();

        assert_eq!(config.general.seat_count, 4);
        assert_eq!(config.general.bind_host, "127.0.0.1");
        assert_eq!(config.general.nameserver_address, "127.0.0.1:5000");
        assert_eq!(config.general.send_timeout_ms, 2000);
    }

    #[test]
    fn empty_config_is_all_defaults() {
        let config: Config = toml::from_str("").unwrap();

        assert_eq!(config.general.seat_count, 25);
    }
}
