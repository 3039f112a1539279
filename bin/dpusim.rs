use clap::Parser;
use dpusim::simulator::config::{load_and_merge_configs, CliOverrides};
use dpusim::simulator::utils::log::init_log;
use dpusim::simulator::Simulator;
use std::io;
use std::path::PathBuf;

/// dpusim - functional simulator of the DPU miscellaneous engines
#[derive(Parser, Debug)]
#[command(name = "dpusim")]
#[command(version = "0.1.0")]
#[command(about = "Bit-accurate DPU instruction simulator", long_about = None)]
struct Args {
  /// Program file (JSON: regions, bank preloads, instructions)
  #[arg(short, long, value_name = "FILE")]
  program: PathBuf,

  /// Custom configuration file
  #[arg(long, value_name = "FILE")]
  config: Option<String>,

  /// Target generation: DPUV2, XVDPU, XV2DPU or XV3DPU
  #[arg(short, long, value_name = "NAME")]
  target: Option<String>,

  /// Enable step mode (interactive stepping)
  #[arg(short, long)]
  step: bool,

  /// Quiet mode (suppress progress messages)
  #[arg(short, long)]
  quiet: bool,

  /// Output trace file path
  #[arg(long, value_name = "FILE")]
  trace_file: Option<String>,

  /// Write the final external regions to this file
  #[arg(short, long, value_name = "FILE")]
  output: Option<String>,

  /// Worker threads for the pixel loops (0 = one per core)
  #[arg(long, value_name = "N")]
  threads: Option<usize>,

  /// Warn when a save overwrites data written earlier by the same instruction
  #[arg(long)]
  double_write_check: bool,
}

fn main() -> io::Result<()> {
  init_log();

  let args = Args::parse();

  let root = std::env::current_dir()?;
  let cli = CliOverrides {
    quiet: args.quiet,
    step: args.step,
    target: args.target.as_deref(),
    trace_file: args.trace_file.as_deref(),
    output_file: args.output.as_deref(),
    threads: args.threads,
    double_write_check: args.double_write_check,
  };
  let app_config = load_and_merge_configs(args.config.as_deref(), &root, &cli)?;

  let program = if args.program.is_absolute() { args.program } else { root.join(args.program) };
  let mut simulator = Simulator::from_app_config(&app_config, &program).map_err(io::Error::other)?;

  simulator.run().map_err(io::Error::other)
}
