//! ringbench CLI - run one side of a shared memory ring benchmark
//!
//! Start a reader and a writer with the same token (by default both derive
//! it from their process group):
//!
//! ```text
//! ringbench run --role reader --message-size 64 --count 1000 --check &
//! ringbench run --role writer --message-size 64 --count 1000 --attach-wait-ms 5000
//! ```

use clap::{Args, Parser, Subcommand, ValueEnum};
use console::style;
use ringbench::names::DEFAULT_PREFIX;
use ringbench::{Ownership, ResourceNames, RingConfig, RingTransport, Role, RunToken, Session};
use std::process;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ringbench")]
#[command(about = "Shared memory ring buffer throughput benchmark", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the reader or writer side of a benchmark
    Run {
        /// Which end of the ring to drive
        #[arg(short, long, value_enum)]
        role: RoleArg,

        /// Bytes per message
        #[arg(short, long, default_value = "64")]
        message_size: usize,

        /// Number of messages to move
        #[arg(short, long, default_value = "1000")]
        count: u64,

        /// Verify every received byte (reader)
        #[arg(long)]
        check: bool,

        /// Number of ring slots
        #[arg(long, default_value = "10")]
        capacity: usize,

        /// Bytes per slot
        #[arg(long, default_value = "4096")]
        slot_size: usize,

        /// Create the ring, attach to it, or whichever applies
        /// (default: the reader creates, the writer attaches)
        #[arg(long, value_enum)]
        ownership: Option<OwnershipArg>,

        /// Give up on any single wait after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Keep retrying an attach for this long while the ring does not exist
        #[arg(long)]
        attach_wait_ms: Option<u64>,

        #[command(flatten)]
        names: NameArgs,
    },

    /// Remove objects left behind by a crashed run
    Clean {
        #[command(flatten)]
        names: NameArgs,
    },
}

#[derive(Args)]
struct NameArgs {
    /// Prefix of every shared object name
    #[arg(long, default_value = DEFAULT_PREFIX)]
    prefix: String,

    /// Run token shared by reader and writer (default: process group id)
    #[arg(long)]
    token: Option<String>,
}

impl NameArgs {
    fn resolve(&self) -> ringbench::Result<ResourceNames> {
        let token = match &self.token {
            Some(t) => RunToken::new(t.clone())?,
            None => RunToken::process_group(),
        };
        ResourceNames::new(&self.prefix, &token)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, ValueEnum)]
enum RoleArg {
    Reader,
    Writer,
}

impl From<RoleArg> for Role {
    fn from(r: RoleArg) -> Self {
        match r {
            RoleArg::Reader => Role::Reader,
            RoleArg::Writer => Role::Writer,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, ValueEnum)]
enum OwnershipArg {
    Auto,
    Create,
    Attach,
}

impl From<OwnershipArg> for Ownership {
    fn from(o: OwnershipArg) -> Self {
        match o {
            OwnershipArg::Auto => Ownership::Auto,
            OwnershipArg::Create => Ownership::Create,
            OwnershipArg::Attach => Ownership::Attach,
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    if let Err(e) = dispatch(cli.command) {
        eprintln!("{} {}", style("error:").red().bold(), e);
        process::exit(1);
    }
}

fn dispatch(command: Commands) -> ringbench::Result<()> {
    match command {
        Commands::Run {
            role,
            message_size,
            count,
            check,
            capacity,
            slot_size,
            ownership,
            timeout_ms,
            attach_wait_ms,
            names,
        } => {
            let names = names.resolve()?;
            let role = Role::from(role);
            let ownership = ownership.map_or_else(|| Ownership::for_role(role), Ownership::from);
            tracing::debug!(shm = names.shm(), ready = names.ready(), ?ownership, "resolved ring names");
            let session = Session {
                role,
                message_size,
                message_count: count,
                check,
                ring: RingConfig {
                    capacity,
                    slot_size,
                    timeout: timeout_ms.map(Duration::from_millis),
                },
                ownership,
                attach_wait: attach_wait_ms.map(Duration::from_millis),
            };

            println!(
                "{} {} ({})",
                style("[SHM]").cyan().bold(),
                style(format!("Start {} ...", session.role)).cyan(),
                names.shm()
            );
            let report = session.run(&names)?;
            println!("{}", style(format!("[SHM] End {}: {}", session.role, report.messages)).cyan());
            println!();
            println!("{}", report);
            Ok(())
        }
        Commands::Clean { names } => {
            let names = names.resolve()?;
            tracing::debug!(shm = names.shm(), "resolved ring names");
            let removed = RingTransport::remove_stale(&names)?;
            println!(
                "   {} removed {} object(s) for {}",
                style("✓").green(),
                removed,
                names.shm()
            );
            Ok(())
        }
    }
}
