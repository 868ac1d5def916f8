use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use intcode::network::{run_network, NetworkConfig};
use intcode::pipeline::{best_phase_setting, run_feedback};
use intcode::port::{Buffered, Traced};
use intcode::program::Program;
use intcode::vm::Vm;
use intcode::Word;

#[derive(Parser, Debug)]
#[command(name = "main")]
#[command(about = "Run integer-code programs standalone, in a ring, or in a mesh")]
struct Args {
  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run a single machine over a fixed input list
  Run {
    /// Path to the program file
    path: PathBuf,

    /// Comma separated input values
    #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
    input: Vec<Word>,

    /// Dump memory before every instruction (needs RUST_LOG=trace)
    #[arg(long)]
    trace: bool,
  },

  /// Chain one machine per phase into a feedback ring
  Amplify {
    path: PathBuf,

    /// Comma separated phase settings
    #[arg(long, value_delimiter = ',', required = true, allow_hyphen_values = true)]
    phases: Vec<Word>,

    /// Signal fed to the first amplifier
    #[arg(long, default_value = "0", allow_hyphen_values = true)]
    signal: Word,

    /// Try every ordering of the phases and report the best
    #[arg(long)]
    search: bool,
  },

  /// Boot a routed mesh and run it until the monitor converges
  Network {
    path: PathBuf,

    #[arg(long, default_value = "50")]
    nodes: usize,

    /// Destination address that routes to the monitor
    #[arg(long, default_value = "255")]
    monitor: Word,

    /// Value a node reads from an empty mailbox
    #[arg(long, default_value = "-1", allow_hyphen_values = true)]
    empty: Word,

    /// Consecutive empty reads before a node counts as idle
    #[arg(long, default_value = "2")]
    idle_threshold: u32,
  },
}

fn init_logging() {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  fmt().with_env_filter(filter).with_target(false).init();
}

fn load(path: &Path) -> Program {
  match Program::load(path) {
    Ok(program) => program,
    Err(e) => {
      error!("Error loading program '{}': {}", path.display(), e);
      process::exit(1);
    }
  }
}

#[tokio::main]
async fn main() {
  init_logging();

  let args = Args::parse();

  match args.command {
    Command::Run { path, input, trace } => {
      let program = load(&path);
      let mut vm = Vm::new(&program);
      let port = Buffered::new(input);
      let (result, output) = if trace {
        let mut port = Traced::new(port);
        let result = vm.run(&mut port).await;
        (result, port.into_inner().output)
      } else {
        let mut port = port;
        let result = vm.run(&mut port).await;
        (result, port.output)
      };
      if let Err(e) = result {
        error!("Program faulted: {}", e);
        process::exit(1);
      }
      if !vm.is_halted() {
        info!("Program stopped waiting for input at ip {}", vm.ip());
      }
      println!(
        "{}",
        output
          .iter()
          .map(Word::to_string)
          .collect::<Vec<_>>()
          .join(",")
      );
    }
    Command::Amplify {
      path,
      phases,
      signal,
      search,
    } => {
      let program = load(&path);
      let result = if search {
        best_phase_setting(&program, &phases, signal).await
      } else {
        let output = run_feedback(&program, &phases, signal).await;
        output.map(|output| (output, phases))
      };
      match result {
        Ok((output, phases)) => {
          info!("Phases {:?}", phases);
          println!("{output}");
        }
        Err(e) => {
          error!("Pipeline failed: {}", e);
          process::exit(1);
        }
      }
    }
    Command::Network {
      path,
      nodes,
      monitor,
      empty,
      idle_threshold,
    } => {
      let program = load(&path);
      let config = NetworkConfig {
        nodes,
        monitor_address: monitor,
        empty_input: empty,
        idle_threshold,
      };
      match run_network(&program, &config).await {
        Ok(report) => {
          println!("{}", report.first_monitor_packet.y);
          println!("{}", report.converged_y);
        }
        Err(e) => {
          error!("Network failed: {}", e);
          process::exit(1);
        }
      }
    }
  }
}
