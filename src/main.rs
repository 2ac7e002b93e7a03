//! scripthost - supervise user-submitted scripts.
//!
//! Usage:
//!   scripthost serve [--listen 0.0.0.0:8080]             # Start HTTP server
//!   scripthost deploy <owner> <archive.zip> <entry-point>  # One-off deploy
//!   scripthost list <owner>
//!   scripthost terminate <owner> <id>
//!   scripthost reconcile

use clap::{Args, Parser, Subcommand};
use scripthost::config::{ExtractLimits, LauncherConfig, ProvisionerConfig};
use scripthost::http_server;
use scripthost::state::AppState;
use scripthost::{
    DeployRequest, DeploymentId, DeploymentStatus, EntryPoint, OwnerId, Supervisor,
    SupervisorConfig,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "scripthost")]
#[command(about = "Run user-submitted scripts as supervised background processes")]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct Settings {
    /// Directory deployments are unpacked under
    #[arg(long, env = "SCRIPTHOST_ROOT", default_value = "deployed_scripts", global = true)]
    root: PathBuf,

    /// JSON file the registry is persisted to
    #[arg(long, env = "SCRIPTHOST_STATE_FILE", global = true)]
    state_file: Option<PathBuf>,

    /// Program used to run entry points
    #[arg(long, env = "SCRIPTHOST_INTERPRETER", default_value = "python3", global = true)]
    interpreter: String,

    /// Discard script output instead of appending it to the output log
    #[arg(long, env = "SCRIPTHOST_NO_CAPTURE", global = true)]
    no_capture: bool,

    /// Program used to install requirements.txt
    #[arg(long, env = "SCRIPTHOST_INSTALLER", default_value = "python3", global = true)]
    installer: String,

    /// Installer arguments; {target} and {manifest} are substituted
    #[arg(
        long,
        env = "SCRIPTHOST_INSTALLER_ARGS",
        value_delimiter = ' ',
        allow_hyphen_values = true,
        default_values = ["-m", "pip", "install", "--target", "{target}", "-r", "{manifest}"],
        global = true
    )]
    installer_args: Vec<String>,

    /// Dependency install timeout in seconds
    #[arg(long, env = "SCRIPTHOST_INSTALL_TIMEOUT", default_value = "120", global = true)]
    install_timeout: u64,

    /// How long to wait for a killed script to exit, in milliseconds
    #[arg(long, env = "SCRIPTHOST_TERMINATE_GRACE_MS", default_value = "5000", global = true)]
    terminate_grace_ms: u64,

    /// Maximum number of entries in an archive
    #[arg(long, env = "SCRIPTHOST_MAX_ENTRIES", default_value = "10000", global = true)]
    max_entries: usize,

    /// Maximum total uncompressed archive size in bytes
    #[arg(long, env = "SCRIPTHOST_MAX_BYTES", default_value = "536870912", global = true)]
    max_bytes: u64,

    /// Seconds between liveness reconciliation passes; 0 disables them.
    /// Scripts that exit on their own stay zombies until a pass or a
    /// terminate collects them.
    #[arg(long, env = "SCRIPTHOST_RECONCILE_SECS", default_value = "60", global = true)]
    reconcile_secs: u64,
}

impl Settings {
    fn into_config(self) -> SupervisorConfig {
        SupervisorConfig {
            root: self.root,
            state_file: self.state_file,
            launcher: LauncherConfig {
                interpreter: self.interpreter,
                capture_output: !self.no_capture,
            },
            provisioner: ProvisionerConfig {
                program: self.installer,
                args: self.installer_args,
                timeout: Duration::from_secs(self.install_timeout),
            },
            extract: ExtractLimits {
                max_entries: self.max_entries,
                max_total_bytes: self.max_bytes,
            },
            terminate_grace: Duration::from_millis(self.terminate_grace_ms),
            reconcile_interval: (self.reconcile_secs > 0)
                .then(|| Duration::from_secs(self.reconcile_secs)),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Address to listen on
        #[arg(long, env = "SCRIPTHOST_LISTEN", default_value = "0.0.0.0:8080")]
        listen: SocketAddr,
    },
    /// Deploy an archive
    Deploy {
        owner: OwnerId,
        archive: PathBuf,
        entry_point: String,
        /// Value for the script's token variable
        #[arg(long, env = "SCRIPTHOST_SECRET", hide_env_values = true)]
        secret: Option<String>,
    },
    /// List an owner's deployments
    List { owner: OwnerId },
    /// Stop a deployment and delete its files
    Terminate { owner: OwnerId, id: u64 },
    /// Mark deployments whose process has exited
    Reconcile,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = cli.settings.into_config();
    let supervisor = match Supervisor::open(config) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    match run(cli.command, supervisor).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("Error: {message}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands, supervisor: Arc<Supervisor>) -> Result<(), String> {
    match command {
        Commands::Serve { listen } => {
            http_server::run_server(listen, AppState::new(supervisor))
                .await
                .map_err(|e| e.to_string())
        }
        Commands::Deploy {
            owner,
            archive,
            entry_point,
            secret,
        } => {
            let entry_point = EntryPoint::new(entry_point).map_err(|e| e.to_string())?;
            let bytes = tokio::fs::read(&archive)
                .await
                .map_err(|e| format!("{}: {e}", archive.display()))?;
            let archive_name = archive
                .file_name()
                .map(|n| n.to_string_lossy().into_owned());
            let deployed = supervisor
                .deploy(DeployRequest {
                    owner,
                    archive: bytes,
                    archive_name,
                    entry_point,
                    secret,
                })
                .await
                .map_err(|e| e.to_string())?;
            for warning in &deployed.warnings {
                eprintln!("warning: {warning}");
            }
            println!(
                "deployed #{} (pid {}, token variable {}) in {}",
                deployed.id,
                deployed.pid,
                deployed.secret_var,
                deployed.directory.display()
            );
            Ok(())
        }
        Commands::List { owner } => {
            let deployments = supervisor.list(&owner).await;
            if deployments.is_empty() {
                println!("no deployments");
            }
            for d in deployments {
                let status = match d.status {
                    DeploymentStatus::Running => "running",
                    DeploymentStatus::Exited => "exited",
                };
                println!("{:>4}  {:<8} pid {:<8} {}", d.id, status, d.pid, d.entry_point);
            }
            Ok(())
        }
        Commands::Terminate { owner, id } => {
            let removal = supervisor
                .terminate(&owner, DeploymentId::new(id))
                .await
                .map_err(|e| e.to_string())?;
            if removal.removed {
                println!("deployment {id} removed");
            } else {
                println!("no deployment {id}");
            }
            Ok(())
        }
        Commands::Reconcile => {
            for (owner, id) in supervisor.reconcile().await {
                println!("{owner}/{id} exited");
            }
            Ok(())
        }
    }
}
