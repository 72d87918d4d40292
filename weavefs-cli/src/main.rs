use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use weavefs_core::{
    AccessIntent, LinkFlags, LogLevel, LogWait, NullInjector, StorageKind, Vfs, VfsParameters,
};

const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(name = "weavefs")]
#[command(about = "Virtual filesystem overlay for hooked processes")]
#[command(version)]
struct Cli {
    /// Name of the shared instance
    #[arg(short, long, global = true, default_value = "weavefs")]
    instance: String,

    /// Directory holding the shared instance state
    #[arg(long, global = true)]
    storage_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an instance from a mapping file and run a program inside it
    Run {
        /// JSON file describing rules and links
        #[arg(short, long)]
        map: PathBuf,

        /// Minimum level of records forwarded to the shared log queue
        #[arg(long, default_value = "info")]
        log_level: LogLevel,

        /// Program and arguments; without one the instance is held until Ctrl-C
        #[arg(last = true)]
        program: Vec<String>,
    },

    /// Print the virtual tree of an instance
    Dump,

    /// Show where a virtual path really lives
    Resolve {
        /// Virtual path to resolve
        path: String,

        /// Resolve for creating a file instead of reading it
        #[arg(long)]
        create: bool,
    },

    /// List processes attached to an instance
    Processes {
        /// Remove processes that no longer run first
        #[arg(long)]
        reap: bool,
    },

    /// Print records from the shared log queue
    Logs {
        /// Keep waiting for new records until Ctrl-C
        #[arg(short, long)]
        follow: bool,
    },

    /// Print version information
    Version,
}

/// Rules and links applied by `weavefs run`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MappingFile {
    skip_directories: Vec<String>,
    skip_file_suffixes: Vec<String>,
    blacklist: Vec<String>,
    force_load: Vec<ForceLoad>,
    links: Vec<LinkEntry>,
}

#[derive(Debug, Deserialize)]
struct ForceLoad {
    process: String,
    library: PathBuf,
}

#[derive(Debug, Deserialize)]
struct LinkEntry {
    source: PathBuf,
    destination: String,
    #[serde(default)]
    directory: bool,
    #[serde(default)]
    flags: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if matches!(cli.command, Commands::Run { .. }) {
        weavefs_core::init_logging(true);
    } else {
        init_local_logging();
    }

    let parameters = {
        let storage = match &cli.storage_dir {
            Some(directory) => StorageKind::SharedFile {
                directory: directory.clone(),
            },
            None => StorageKind::default_shared(),
        };
        VfsParameters::new(cli.instance.clone()).with_storage(storage)
    };

    match cli.command {
        Commands::Run {
            map,
            log_level,
            program,
        } => run(parameters.with_log_level(log_level), &map, &program).await,
        Commands::Dump => {
            let vfs = connect(&parameters)?;
            print!("{}", vfs.dump()?);
            Ok(())
        }
        Commands::Resolve { path, create } => {
            let vfs = connect(&parameters)?;
            let intent = if create {
                AccessIntent::Create
            } else {
                AccessIntent::Read
            };
            match vfs.resolve(&path, intent)? {
                Some(real) => println!("{}", real.display()),
                None => println!("{} (not virtualized)", path),
            }
            Ok(())
        }
        Commands::Processes { reap } => {
            let vfs = connect(&parameters)?;
            if reap {
                let removed = vfs.reap_exited_processes()?;
                info!("Removed {} exited processes", removed.len());
            }
            for pid in vfs.process_list()? {
                if pid != vfs.process_id() {
                    println!("{}", pid);
                }
            }
            Ok(())
        }
        Commands::Logs { follow } => logs(parameters, follow).await,
        Commands::Version => {
            println!("{}", weavefs_core::version_string());
            Ok(())
        }
    }
}

fn init_local_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "weavefs=warn,weavefs_core=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn connect(parameters: &VfsParameters) -> Result<Vfs> {
    let mut vfs = Vfs::new();
    vfs.connect(parameters)
        .with_context(|| format!("Failed to connect to instance '{}'", parameters.instance_name))?;
    Ok(vfs)
}

fn load_mapping(path: &Path) -> Result<MappingFile> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read mapping file {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Invalid mapping file {}", path.display()))
}

fn apply_mapping(vfs: &mut Vfs, mapping: &MappingFile) -> Result<()> {
    for name in &mapping.skip_directories {
        vfs.add_skip_directory(name)?;
    }
    for suffix in &mapping.skip_file_suffixes {
        vfs.add_skip_file_suffix(suffix)?;
    }
    for executable in &mapping.blacklist {
        vfs.blacklist_executable(executable)?;
    }
    for entry in &mapping.force_load {
        vfs.force_load_library(&entry.process, &entry.library)?;
    }

    for link in &mapping.links {
        let flags: LinkFlags = link
            .flags
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))
            .with_context(|| format!("Invalid flags for {}", link.destination))?;
        let result = if link.directory {
            vfs.link_directory_static(&link.source, &link.destination, flags)
        } else {
            vfs.link_file(&link.source, &link.destination, flags)
        };
        result.with_context(|| {
            format!("Failed to link {} to {}", link.source.display(), link.destination)
        })?;
    }
    Ok(())
}

async fn run(parameters: VfsParameters, map: &Path, program: &[String]) -> Result<()> {
    let mapping = load_mapping(map)?;
    let mut vfs = Vfs::new();
    vfs.create(&parameters)
        .with_context(|| format!("Failed to create instance '{}'", parameters.instance_name))?;
    apply_mapping(&mut vfs, &mapping)?;
    info!(instance = %parameters.instance_name, links = mapping.links.len(), "Instance ready");

    let Some((executable, args)) = program.split_first() else {
        info!("No program given, holding the instance until Ctrl-C");
        tokio::signal::ctrl_c().await?;
        vfs.disconnect()?;
        return Ok(());
    };

    let mut command = Command::new(executable);
    command.args(args);
    let mut child = vfs
        .create_process_hooked(&mut command, &NullInjector)
        .with_context(|| format!("Failed to start {}", executable))?;

    let status = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!(process_id = child.id(), "Interrupted, terminating child");
                let _ = child.kill();
                break child.wait()?;
            }
            _ = tokio::time::sleep(CHILD_POLL_INTERVAL) => {
                if let Some(status) = child.try_wait()? {
                    break status;
                }
            }
        }
    };

    vfs.unregister_process(child.id())?;
    vfs.disconnect()?;
    info!(%status, "Program exited");
    if !status.success() {
        std::process::exit(status.code().unwrap_or(1));
    }
    Ok(())
}

async fn logs(parameters: VfsParameters, follow: bool) -> Result<()> {
    let (cancel_tx, cancel_rx) = tokio::sync::oneshot::channel();
    let mut reader = tokio::task::spawn_blocking(move || -> Result<()> {
        let vfs = connect(&parameters)?;
        let _ = cancel_tx.send(vfs.log_cancel_handle());
        let wait = if follow {
            LogWait::Blocking { timeout: None }
        } else {
            LogWait::NonBlocking
        };
        while let Some(record) = vfs.next_log_record(wait)? {
            println!("{}", record);
        }
        Ok(())
    });

    if follow {
        if let Ok(cancel) = cancel_rx.await {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => cancel.cancel(),
                result = &mut reader => return result?,
            }
        }
    }
    reader.await?
}
