/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

mod commands;

use clap::Parser;
use clap::Subcommand;
use tracing::level_filters::LevelFilter;

use crate::commands::emit::EmitCommand;
use crate::commands::launch::LaunchCommand;

#[derive(Parser)]
#[command(about = "GPU/RDMA topology detection and NCCL configuration")]
struct Cli {
    /// Raise log verbosity (repeat for more).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[clap(about = "Detect the local topology and write NCCL configuration artifacts")]
    Emit(EmitCommand),

    #[clap(about = "Apply an emitted configuration and exec a training process")]
    Launch(LaunchCommand),
}

fn main() -> Result<(), anyhow::Error> {
    let args = Cli::parse();
    init_logging(args.verbose);

    match args.command {
        Command::Emit(command) => command.run(),
        Command::Launch(command) => command.run(),
    }
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}
