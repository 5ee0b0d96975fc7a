use std::fmt;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, Subcommand};
use skiff_engine::{Engine, EngineConfig};
use tracing_subscriber::fmt::time::FormatTime;

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

#[derive(Parser)]
#[command(name = "skiff", version, about = "Minimal btrfs-backed container engine")]
struct Cli {
    /// Mounted btrfs root holding images and containers
    #[arg(long, global = true, value_name = "PATH", default_value = skiff_engine::DEFAULT_ROOT)]
    root: PathBuf,

    /// Host bridge the container veths are enslaved to
    #[arg(long, global = true, default_value = skiff_engine::DEFAULT_BRIDGE)]
    bridge: String,

    /// Upstream resolver written into each container
    #[arg(long, global = true, default_value = skiff_engine::DEFAULT_NAMESERVER)]
    nameserver: String,

    /// Legacy CPU share, converted to a cgroup v2 weight
    #[arg(long, global = true, value_name = "INT", default_value_t = skiff_engine::DEFAULT_CPU_SHARE)]
    cpu_share: u32,

    /// Memory ceiling in megabytes
    #[arg(long, global = true, value_name = "MB", default_value_t = skiff_engine::DEFAULT_MEM_LIMIT_MB)]
    mem_limit: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create an image from a local directory tree
    Init { directory: PathBuf },
    /// Fetch and materialize a remote image
    Pull { name: String, tag: String },
    /// List images with their origin
    Images,
    /// List containers with their command
    Ps,
    /// Create and run a container in the foreground
    Run {
        image_id: String,
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        cmd: Vec<String>,
    },
    /// Run a command inside a running container
    Exec {
        container_id: String,
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        cmd: Vec<String>,
    },
    /// Print a container's captured output
    Logs { container_id: String },
    /// Replace an image with a container's current state
    Commit {
        container_id: String,
        image_id: String,
    },
    /// Delete an image or container
    Rm { id: String },
}

impl Cli {
    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            root: self.root.clone(),
            bridge: self.bridge.clone(),
            nameserver: self.nameserver.clone(),
            cpu_share: self.cpu_share,
            mem_limit_mb: self.mem_limit,
            ..EngineConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Listings and logs go to stdout; diagnostics stay on stderr.
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_writer(std::io::stderr)
        .init();

    if !nix::unistd::getuid().is_root() {
        eprintln!("error: skiff must run as root (namespaces, btrfs, and cgroups require it)");
        return ExitCode::FAILURE;
    }

    let cli = Cli::parse();
    let engine = Engine::new(cli.engine_config());

    let result = match &cli.command {
        Command::Init { directory } => engine.init(directory).await.map(announce),
        Command::Pull { name, tag } => engine.pull(name, tag).await.map(announce),
        Command::Images => engine.images().await.map(|records| {
            println!("IMAGE_ID\t\tSOURCE");
            for record in records {
                println!("{}\t\t{}", record.id, record.source);
            }
        }),
        Command::Ps => engine.containers().await.map(|records| {
            println!("CONTAINER_ID\t\tCOMMAND");
            for record in records {
                println!("{}\t\t{}", record.id, record.command);
            }
        }),
        Command::Run { image_id, cmd } => {
            engine.run(image_id, &cmd.join(" ")).await.map(announce)
        }
        Command::Exec { container_id, cmd } => engine.exec(container_id, cmd).await,
        Command::Logs { container_id } => engine
            .logs(container_id)
            .await
            .map(|content| print!("{content}")),
        Command::Commit {
            container_id,
            image_id,
        } => engine.commit(container_id, image_id).await,
        Command::Rm { id } => engine.remove(id).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

fn announce(id: skiff_engine::ObjectId) {
    println!("Created: {id}");
}
