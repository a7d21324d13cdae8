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

//! Frontend process of the RAID-5 array.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use crossbeam_channel as chan;
use raid5::config::{ArrayConfig, DegradedWrite, FrontendConfig, ParityPolicy};
use raid5::server::FrontendServer;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "raid5-frontend", about = "RAID-5 array frontend serving a virtual disk")]
struct Args {
    /// Address to accept clients and backends on.
    #[arg(long, default_value = "127.0.0.1:8000")]
    listen: SocketAddr,

    /// Backend addresses, one per disk, parity included. Shown until the backends log in.
    #[arg(long = "backend", required = true, num_args = 1.., value_delimiter = ',')]
    backends: Vec<String>,

    #[arg(long, default_value_t = raid5::config::DEFAULT_BLOCK_SIZE)]
    block_size: usize,

    /// Number of blocks on each disk.
    #[arg(long)]
    blocks: u64,

    /// Number of blocks kept by the block cache.
    #[arg(long, default_value_t = raid5::config::DEFAULT_CACHE_CAPACITY)]
    cache: usize,

    #[arg(long, default_value_t = 200)]
    poll_timeout_ms: u64,

    /// Reactor iterations a backend may take to answer before it is taken offline.
    #[arg(long, default_value_t = raid5::config::DEFAULT_RPC_TIMEOUT_TICKS)]
    rpc_timeout_ticks: u64,

    /// What a write does when its parity disk fails: `defer` or `abort`.
    #[arg(long, default_value = "defer")]
    parity_policy: ParityPolicy,

    /// What a write does when its data disk is unavailable: `refuse` or `reconstruct`.
    #[arg(long, default_value = "refuse")]
    degraded_writes: DegradedWrite,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let args = Args::parse();
    let array = ArrayConfig {
        data_disks: args.backends.len().saturating_sub(1),
        block_size: args.block_size,
        blocks_per_disk: args.blocks,
        backends: args.backends,
    };
    let mut config = FrontendConfig::new(args.listen, array);
    config.cache_capacity = args.cache;
    config.poll_timeout = Duration::from_millis(args.poll_timeout_ms);
    config.rpc_timeout_ticks = args.rpc_timeout_ticks;
    config.parity_policy = args.parity_policy;
    config.degraded_writes = args.degraded_writes;

    let (stop, stopped) = chan::bounded::<()>(1);
    if let Err(err) = ctrlc::set_handler(move || {
        let _ = stop.try_send(());
    }) {
        eprintln!("Unable to install the Ctrl-C handler: {err}");
        return ExitCode::FAILURE;
    }

    let server = match FrontendServer::start(config) {
        Ok(server) => server,
        Err(err) => {
            eprintln!("Unable to start the frontend: {err}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(addr) = server.local_addr() {
        println!("Frontend is listening on {addr}");
    }

    let _ = stopped.recv();
    match server.stop() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Frontend has stopped with an error: {err}");
            ExitCode::FAILURE
        }
    }
}
