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

#[macro_use]
extern crate log;

use clap::Parser;

use tokio::io::{stdin, AsyncBufReadExt, BufReader};

use platea::config::Config;
use platea::frontend::ConsoleFrontend;
use platea::platea::{IntentHandle, Platea};

/// One peer of the seat reservation mesh.
#[derive(Parser, Debug)]
#[command(name = "platea-node")]
struct Args {
    /// Stable identifier of this peer; also the mutex tie-breaker.
    node_id: String,

    /// TCP port the peer listens on.
    port: u16,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();
    let config = Config::load()?;

    let mut node = Platea::new(
        args.node_id.clone(),
        config.general.seat_count,
        config.general.send_timeout(),
        Box::new(ConsoleFrontend::new(args.node_id.clone())),
    );

    let bind = format!("{}:{}", config.general.bind_host, args.port);
    let addr = node.start(bind.as_str()).await?;

    info!("Node listening (node = {}) (addr = {})", args.node_id, addr);

    node.register(&config.general.nameserver_address, args.port)
        .await;

    read_commands(node.handle());

    node.run().await?;

    Ok(())
}

/// Thin console click surface: `book N`, `free N`, `seats`.
fn read_commands(handle: IntentHandle) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdin()).lines();

        while let Ok(Some(line)) = lines.next_line().await {
            dispatch(&handle, line.trim());
        }
    });
}

fn dispatch(handle: &IntentHandle, line: &str) {
    let mut words = line.split_whitespace();

    match (words.next(), words.next()) {
        (Some("book"), Some(seat)) => match seat.parse() {
            Ok(seat) => handle.book(seat),
            Err(_) => warn!("Not a seat number: {}", seat),
        },
        (Some("free"), Some(seat)) => match seat.parse() {
            Ok(seat) => handle.free(seat),
            Err(_) => warn!("Not a seat number: {}", seat),
        },
        (Some("seats"), None) => handle.show(),
        (None, _) => {}
        _ => warn!("Commands: book <seat>, free <seat>, seats"),
    }
}
