// Networked RAID-5 block storage array driven by a poll reactor.
//
// SPDX-License-Identifier: Apache-2.0
//
// Written in 2021-2025 by
//     Dr. Maxim Orlovsky <orlovsky@ubideco.org>
//     Alexis Sellier <alexis@cloudhead.io>
//
// Copyright 2022-2025 UBIDECO Labs, InDCS, Lugano, Switzerland. All Rights reserved.
// Copyright 2021-2023 Alexis Sellier <alexis@cloudhead.io>. All Rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except
// in compliance with the License. You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express
// or implied. See the License for the specific language governing permissions and limitations under
// the License.

//! Backend block device process of the RAID-5 array.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use crossbeam_channel as chan;
use raid5::config::BackendConfig;
use raid5::server::BackendServer;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "raid5-backend", about = "Block device backing one disk of a RAID-5 array")]
struct Args {
    /// Index of the disk within the array.
    #[arg(long)]
    index: usize,

    /// Frontend address to log in to.
    #[arg(long, default_value = "127.0.0.1:8000")]
    frontend: SocketAddr,

    /// Address announced to the frontend; defaults to `disk-<index>`.
    #[arg(long)]
    advertise: Option<String>,

    /// File holding the disk content; created zero-filled when missing.
    #[arg(long)]
    disk: PathBuf,

    #[arg(long, default_value_t = raid5::config::DEFAULT_BLOCK_SIZE)]
    block_size: usize,

    #[arg(long)]
    blocks: u64,

    #[arg(long, default_value_t = 1000)]
    poll_timeout_ms: u64,

    /// Interval between attempts to reach the frontend.
    #[arg(long, default_value_t = 1000)]
    retry_ms: u64,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let args = Args::parse();
    let mut config = BackendConfig::new(args.index, args.frontend, args.disk, args.blocks);
    if let Some(advertise) = args.advertise {
        config.advertise = advertise;
    }
    config.block_size = args.block_size;
    config.poll_timeout = Duration::from_millis(args.poll_timeout_ms);
    config.retry = Duration::from_millis(args.retry_ms);

    let (stop, stopped) = chan::bounded::<()>(1);
    if let Err(err) = ctrlc::set_handler(move || {
        let _ = stop.try_send(());
    }) {
        eprintln!("Unable to install the Ctrl-C handler: {err}");
        return ExitCode::FAILURE;
    }

    let server = match BackendServer::start(config) {
        Ok(server) => server,
        Err(err) => {
            eprintln!("Unable to start the backend: {err}");
            return ExitCode::FAILURE;
        }
    };

    let _ = stopped.recv();
    match server.stop() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Backend has stopped with an error: {err}");
            ExitCode::FAILURE
        }
    }
}
