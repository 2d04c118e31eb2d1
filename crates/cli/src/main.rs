//! Trace synthesis CLI
//!
//! A command-line tool for replaying utilization traces into session events,
//! computing the resource maxima of a workload, generating events from
//! workload templates, and inspecting trace files.

mod commands;
mod output;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use commands::{inspect, prerun, replay, template};
use std::path::PathBuf;
use synth_lib::{MaximaPaths, ResourceKind, WorkloadSpec};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Trace synthesis CLI
#[derive(Parser)]
#[command(name = "tsynth")]
#[command(author, version, about = "Replay utilization traces as session events", long_about = None)]
pub struct Cli {
    /// Output format
    #[arg(long, short, global = true, default_value = "table")]
    pub format: output::OutputFormat,

    /// Enable verbose output
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Replay a workload and print the synthesized session events
    Replay {
        #[command(flatten)]
        workload: WorkloadArgs,

        /// Directory holding maxima files written by `prerun`
        #[arg(long, env = "TSYNTH_MAXIMA_DIR")]
        maxima_dir: Option<PathBuf>,

        /// Scale GPU reservations down to the observed peak utilization
        #[arg(long)]
        adjust_gpu_reservations: bool,
    },

    /// Compute per-session and per-task resource maxima
    Prerun {
        #[command(flatten)]
        workload: WorkloadArgs,

        /// Directory to write the maxima files into
        #[arg(long, short, env = "TSYNTH_MAXIMA_DIR", default_value = "maxima")]
        output: PathBuf,
    },

    /// Generate session events from a workload template file
    Template {
        /// JSON file listing the sessions and their trainings
        file: PathBuf,
    },

    /// Summarize a trace file
    Inspect {
        /// Resource kind of the trace
        #[arg(long, short)]
        kind: KindArg,

        /// Trace files, read in order
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum KindArg {
    Cpu,
    Gpu,
    Memory,
}

impl From<KindArg> for ResourceKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Cpu => ResourceKind::Cpu,
            KindArg::Gpu => ResourceKind::Gpu,
            KindArg::Memory => ResourceKind::Memory,
        }
    }
}

/// Trace inputs of a workload
#[derive(Args, Debug, Clone)]
pub struct WorkloadArgs {
    /// Workload name used in log records
    #[arg(long, env = "TSYNTH_WORKLOAD", default_value = "workload")]
    pub name: String,

    /// CPU trace files (comma separated)
    #[arg(long, env = "TSYNTH_CPU_TRACES", value_delimiter = ',')]
    pub cpu: Vec<PathBuf>,

    /// GPU trace files (comma separated)
    #[arg(long, env = "TSYNTH_GPU_TRACES", value_delimiter = ',')]
    pub gpu: Vec<PathBuf>,

    /// Memory trace files (comma separated)
    #[arg(long, env = "TSYNTH_MEMORY_TRACES", value_delimiter = ',')]
    pub memory: Vec<PathBuf>,

    /// Entity index to session id mapping of the CPU trace
    #[arg(long)]
    pub cpu_mapping: Option<PathBuf>,

    /// Entity index to session id mapping of the GPU trace
    #[arg(long)]
    pub gpu_mapping: Option<PathBuf>,

    /// Entity index to session id mapping of the memory trace
    #[arg(long)]
    pub memory_mapping: Option<PathBuf>,

    /// Nominal distance between trace readings, in seconds
    #[arg(long, default_value_t = 60)]
    pub tick_secs: u64,

    /// Seed of the sequence-key jitter
    #[arg(long, env = "TSYNTH_SEED", default_value_t = 0)]
    pub seed: u64,

    /// Ignore records after this timestamp (unix seconds or nanoseconds)
    #[arg(long)]
    pub last_timestamp: Option<i64>,
}

impl WorkloadArgs {
    pub fn into_spec(self) -> WorkloadSpec {
        WorkloadSpec {
            name: self.name,
            cpu_traces: self.cpu,
            gpu_traces: self.gpu,
            memory_traces: self.memory,
            cpu_mapping: self.cpu_mapping,
            gpu_mapping: self.gpu_mapping,
            memory_mapping: self.memory_mapping,
            tick_secs: self.tick_secs,
            rng_seed: self.seed,
            last_timestamp: self.last_timestamp,
            ..WorkloadSpec::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(fmt::layer().compact().with_writer(std::io::stderr))
        .init();

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        }
    });

    if let Err(e) = run(cli.command, cli.format, cancel).await {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}

async fn run(command: Commands, format: output::OutputFormat, cancel: CancellationToken) -> Result<()> {
    match command {
        Commands::Replay {
            workload,
            maxima_dir,
            adjust_gpu_reservations,
        } => {
            let mut spec = workload.into_spec();
            if let Some(dir) = maxima_dir {
                spec.maxima = MaximaPaths::in_dir(&dir, &spec.kinds());
            }
            spec.adjust_gpu_reservations = adjust_gpu_reservations;
            replay::replay(spec, cancel, format).await
        }
        Commands::Prerun { workload, output } => {
            prerun::prerun(workload.into_spec(), &output, cancel, format).await
        }
        Commands::Template { file } => template::template(&file, format).await,
        Commands::Inspect { kind, files } => inspect::inspect(kind.into(), files, format),
    }
}
