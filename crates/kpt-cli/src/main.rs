//! kpt CLI - configuration as data for KRM packages

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use kpt_core::UpdateStrategy;
use kpt_repo::CACHE_DIR_ENV;

mod commands;
mod display;
mod error;
mod exit_codes;

use commands::RunArgs;
use commands::fn_eval::EvalFunction;
use error::CliError;

#[derive(Parser)]
#[command(name = "kpt")]
#[command(version)]
#[command(about = "Fetch, update and hydrate packages of Kubernetes resources", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug output
    #[arg(long, global = true)]
    debug: bool,

    /// Directory caching upstream git repositories
    #[arg(long, global = true, env = CACHE_DIR_ENV)]
    cache_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipelines of a package and its subpackages
    Render {
        /// Package path
        #[arg(default_value = ".")]
        pkg: PathBuf,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Fetch a package from a git repository or an OCI registry
    Get {
        /// REPO_URL[.git]/DIR[@REF] or oci://IMAGE
        upstream: String,

        /// Destination directory (default: the upstream directory name)
        dest: Option<PathBuf>,

        /// Strategy recorded for later updates
        #[arg(long)]
        strategy: Option<UpdateStrategy>,
    },

    /// Update a package to a new upstream revision
    Update {
        /// PKG[@REF]
        #[arg(default_value = ".")]
        pkg: String,

        /// resource-merge, fast-forward or force-delete-replace
        #[arg(long)]
        strategy: Option<UpdateStrategy>,

        /// Fail instead of taking upstream values on conflicts
        #[arg(long)]
        fail_on_conflict: bool,
    },

    /// Work with functions
    Fn {
        #[command(subcommand)]
        command: FnCommands,
    },

    /// Create a Kptfile in a directory
    Init {
        /// Package directory
        #[arg(default_value = ".")]
        dir: PathBuf,

        /// Package description
        #[arg(long)]
        description: Option<String>,
    },
}

#[derive(Subcommand)]
enum FnCommands {
    /// Run one function over a package
    Eval {
        /// Package path
        #[arg(default_value = ".")]
        pkg: PathBuf,

        /// Function image
        #[arg(short, long, conflicts_with = "exec", required_unless_present = "exec")]
        image: Option<String>,

        /// Local executable implementing the function
        #[arg(long)]
        exec: Option<String>,

        /// File holding the function config
        #[arg(long)]
        fn_config: Option<PathBuf>,

        #[command(flatten)]
        run: RunArgs,

        /// Function config as key=value pairs
        #[arg(last = true)]
        config: Vec<String>,
    },
}

fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    miette::set_panic_hook();

    let cli = Cli::parse();
    init_tracing(cli.debug);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling");
            on_interrupt.cancel();
        }
    });

    let code = match dispatch(cli, &cancel).await {
        Ok(()) => exit_codes::SUCCESS,
        Err(err) => {
            let code = err.exit_code();
            eprintln!("{:?}", miette::Report::new(err));
            code
        }
    };
    std::process::exit(code);
}

async fn dispatch(cli: Cli, cancel: &CancellationToken) -> Result<(), CliError> {
    let cache_dir = cli.cache_dir.as_deref();
    match cli.command {
        Commands::Render { pkg, run } => commands::render::run(&pkg, &run, cancel).await,

        Commands::Get {
            upstream,
            dest,
            strategy,
        } => commands::get::run(&upstream, dest.as_deref(), strategy, cache_dir, cancel).await,

        Commands::Update {
            pkg,
            strategy,
            fail_on_conflict,
        } => commands::update::run(&pkg, strategy, fail_on_conflict, cache_dir, cancel).await,

        Commands::Fn {
            command:
                FnCommands::Eval {
                    pkg,
                    image,
                    exec,
                    fn_config,
                    run,
                    config,
                },
        } => {
            let function = EvalFunction {
                image,
                exec,
                fn_config,
                config_args: config,
            };
            commands::fn_eval::run(&pkg, function, &run, cancel).await
        }

        Commands::Init { dir, description } => commands::init::run(&dir, description.as_deref()),
    }
}
