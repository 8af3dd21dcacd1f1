//! swap-manager - Main entry point

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::IsTerminal;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use swap_manager::download::{BarProgress, HfRemote, LogProgress, ProgressObserver};
use swap_manager::manager::RemoveOutcome;
use swap_manager::{
    AddRequest, CompileRequest, FileSystemStorage, HandoffMode, Manager, ModelEntry, Paths,
    PullOptions, ServeRequest, SwapError, SystemCommandRunner, args, process,
};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "swap-manager")]
#[command(about = "Manage GGUF models for llama-swap", long_about = None)]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error); defaults to RUST_LOG, else info
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty", global = true)]
    log_format: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the storage layout and global config
    Init {
        /// Replace an existing global config with defaults
        #[arg(long)]
        reset: bool,
    },
    /// Register a model from an alias, REPO:FILE or hub URL, then download it
    Add {
        spec: String,
        /// Model id (defaults to the file stem)
        #[arg(long)]
        name: Option<String>,
        /// Runtime argument KEY=VALUE (repeatable)
        #[arg(long = "arg", value_name = "KEY=VALUE")]
        args: Vec<String>,
        /// Overwrite an existing model with the same id
        #[arg(long)]
        force: bool,
        /// Skip GPU detection
        #[arg(long)]
        no_gpu: bool,
        /// Register only, do not download
        #[arg(long)]
        no_pull: bool,
    },
    /// Download or resume a model's artifact
    Pull {
        id: String,
        /// Discard any partial download and start over
        #[arg(long)]
        no_resume: bool,
    },
    /// Remove a model
    Remove {
        id: String,
        /// Also delete the downloaded artifact if no other model uses it
        #[arg(long)]
        delete_artifact: bool,
    },
    /// List models
    List {
        /// Print records as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show a model and its effective arguments
    Show {
        id: String,
        #[arg(long)]
        json: bool,
    },
    /// Duplicate a model definition
    Copy {
        source: String,
        target: String,
        #[arg(long)]
        force: bool,
    },
    /// List built-in aliases
    Aliases,
    /// Per-model runtime arguments
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Global settings
    Global {
        #[command(subcommand)]
        action: GlobalAction,
    },
    /// Detect GPUs and show offload suggestions
    Gpu,
    /// Write the llama-swap config
    Compile {
        #[command(flatten)]
        compile: CompileArgs,
        /// Also print the compiled YAML to stdout
        #[arg(long)]
        print: bool,
    },
    /// Compile and start llama-swap
    Serve {
        #[command(flatten)]
        compile: CompileArgs,
        /// Listen on all interfaces
        #[arg(long)]
        public: bool,
        /// Run llama-swap as a child process instead of replacing this one
        #[arg(long)]
        supervise: bool,
        /// Seconds to wait after SIGTERM before SIGKILL (supervise mode)
        #[arg(long, default_value_t = 10)]
        grace: u64,
    },
}

#[derive(clap::Args, Debug)]
struct CompileArgs {
    /// Serve only these models (repeatable)
    #[arg(long = "model", value_name = "ID")]
    models: Vec<String>,
    /// Override KEY=VALUE for every model (repeatable)
    #[arg(long = "arg", value_name = "KEY=VALUE")]
    overrides: Vec<String>,
    /// Detect GPUs now instead of using the cached profile
    #[arg(long)]
    detect_gpu: bool,
}

impl From<CompileArgs> for CompileRequest {
    fn from(args: CompileArgs) -> Self {
        Self {
            selection: (!args.models.is_empty()).then_some(args.models),
            overrides: args.overrides,
            detect_gpu: args.detect_gpu,
        }
    }
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Set KEY=VALUE arguments
    Set {
        id: String,
        #[arg(required = true, value_name = "KEY=VALUE")]
        assignments: Vec<String>,
    },
    Get { id: String, key: String },
    Unset {
        id: String,
        #[arg(required = true)]
        keys: Vec<String>,
    },
    List { id: String },
}

#[derive(Subcommand, Debug)]
enum GlobalAction {
    /// Set KEY VALUE or KEY=VALUE (default-args.FLAG for default arguments,
    /// macros.NAME for supervisor macros)
    Set { key: String, value: Option<String> },
    Get { key: String },
    /// Remove a default argument or macro
    Unset { key: String },
    List,
    Reset,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Logs go to stderr so command output stays parseable
    let filter = log_filter(cli.log_level.as_deref());
    match cli.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .json()
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }

    match run(cli.command).await {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(e) => {
            eprintln!("error: {:#}", e);
            let code = e
                .chain()
                .find_map(|cause| cause.downcast_ref::<SwapError>())
                .map(SwapError::exit_code)
                .unwrap_or(1);
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

/// `--log-level` wins, then `RUST_LOG`, then `info`
fn log_filter(level: Option<&str>) -> EnvFilter {
    level
        .and_then(|l| EnvFilter::try_new(l).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

async fn run(command: Command) -> Result<i32> {
    let paths = Paths::resolve();
    let remote = HfRemote::from_env().context("Failed to set up hub client")?;
    let manager = Manager::new(
        paths,
        Arc::new(FileSystemStorage::new()),
        Arc::new(SystemCommandRunner::new()),
        Arc::new(remote),
    );

    match command {
        Command::Init { reset } => {
            let global = manager.init(reset).await?;
            println!("Initialized {}", manager.paths().home.display());
            println!("Artifacts: {}", global.ggufs_dir(manager.paths()).display());
        }
        Command::Add {
            spec,
            name,
            args,
            force,
            no_gpu,
            no_pull,
        } => {
            let req = AddRequest {
                spec,
                name,
                args,
                overwrite: force,
                detect_gpu: !no_gpu,
            };
            let entry = manager.add(&req).await.context("Failed to add model")?;
            println!("Added {} ({}:{})", entry.id, entry.repo, entry.file);
            if !no_pull {
                pull(&manager, &entry.id, true).await?;
            }
        }
        Command::Pull { id, no_resume } => pull(&manager, &id, !no_resume).await?,
        Command::Remove {
            id,
            delete_artifact,
        } => {
            let outcome = manager.remove(&id, delete_artifact).await?;
            print_removal(&outcome);
        }
        Command::List { json } => {
            let global = manager.load_global().await?;
            let entries = manager.list().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
                return Ok(0);
            }
            if entries.is_empty() {
                println!("No models. Add one with: swap-manager add <alias>");
            }
            for entry in entries {
                let marker = if global.default_model.as_deref() == Some(entry.id.as_str()) {
                    "*"
                } else {
                    " "
                };
                println!(
                    "{} {:<32} {:<12} {}:{}",
                    marker, entry.id, entry.download.status, entry.repo, entry.file
                );
            }
        }
        Command::Show { id, json } => {
            let entry = manager.get(&id).await?;
            let effective = manager.effective_args(&id).await?;
            if json {
                let view = serde_json::json!({ "model": entry, "effective_args": effective });
                println!("{}", serde_json::to_string_pretty(&view)?);
                return Ok(0);
            }
            print_entry(&entry);
            println!("effective command line: {}", args::render(&effective).join(" "));
        }
        Command::Copy {
            source,
            target,
            force,
        } => {
            let copy = manager.copy(&source, &target, force).await?;
            println!("Copied {} to {}", source, copy.id);
        }
        Command::Aliases => {
            for def in manager.aliases() {
                println!("{:<20} {}:{}", def.alias, def.repo, def.file);
            }
        }
        Command::Config { action } => config_command(&manager, action).await?,
        Command::Global { action } => global_command(&manager, action).await?,
        Command::Gpu => {
            let (profile, suggestions) = manager.gpu_report().await?;
            println!("vendor:   {}", profile.vendor);
            if let Some(name) = &profile.name {
                println!("name:     {}", name);
            }
            println!("devices:  {}", profile.device_count);
            println!("memory:   {} MiB", profile.memory_bytes / (1024 * 1024));
            println!("layers:   {} (model of unknown size)", profile.recommended_layers);
            for s in suggestions {
                match s.explicit {
                    Some(explicit) => println!("  {:<32} {} (explicit, suggested {})", s.id, explicit, s.layers),
                    None => println!("  {:<32} {}", s.id, s.layers),
                }
            }
        }
        Command::Compile { compile, print } => {
            let (compiled, path) = manager.compile(&compile.into()).await?;
            if print {
                print!("{}", compiled.to_yaml()?);
            } else {
                println!("Wrote {} ({} models)", path.display(), compiled.models.len());
            }
        }
        Command::Serve {
            compile,
            public,
            supervise,
            grace,
        } => {
            let req = ServeRequest {
                compile: compile.into(),
                public,
                mode: if supervise {
                    HandoffMode::Supervise
                } else {
                    HandoffMode::Exec
                },
                grace: Duration::from_secs(grace),
            };
            return Ok(manager.serve(&req).await?);
        }
    }
    Ok(0)
}

async fn pull(manager: &Manager, id: &str, resume: bool) -> Result<()> {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let interrupt = tokio::spawn(async move {
        process::shutdown_signal().await;
        let _ = cancel_tx.send(true);
    });

    let progress: Arc<dyn ProgressObserver> = if std::io::stderr().is_terminal() {
        Arc::new(BarProgress::new())
    } else {
        Arc::new(LogProgress::new(256 * 1024 * 1024))
    };
    let options = PullOptions {
        resume,
        progress,
        cancel: Some(cancel_rx),
    };

    let result = manager.pull(id, options).await;
    interrupt.abort();

    let entry = result.with_context(|| format!("Failed to pull {}", id))?;
    if let Some(path) = &entry.artifact_path {
        println!("Downloaded {} to {}", entry.id, path.display());
    }
    Ok(())
}

async fn config_command(manager: &Manager, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Set { id, assignments } => {
            let entry = manager.set_args(&id, &assignments).await?;
            print_args(&entry);
        }
        ConfigAction::Get { id, key } => match manager.get_arg(&id, &key).await? {
            Some(value) => println!("{}", value),
            None => println!("{} is not set on {}", key, id),
        },
        ConfigAction::Unset { id, keys } => {
            let removed = manager.unset_args(&id, &keys).await?;
            if removed.is_empty() {
                println!("Nothing to remove");
            }
            for key in removed {
                println!("Removed {}", key);
            }
        }
        ConfigAction::List { id } => print_args(&manager.get(&id).await?),
    }
    Ok(())
}

async fn global_command(manager: &Manager, action: GlobalAction) -> Result<()> {
    match action {
        GlobalAction::Set { key, value } => {
            let (key, value) = match value {
                Some(value) => (key, value),
                None => {
                    let (k, v) = key
                        .split_once('=')
                        .context("expected KEY VALUE or KEY=VALUE")?;
                    (k.to_string(), v.to_string())
                }
            };
            manager.global_set(&key, &value).await?;
            println!("{} = {}", key, value);
        }
        GlobalAction::Get { key } => match manager.global_get(&key).await? {
            Some(value) => println!("{}", value),
            None => println!("{} is not set", key),
        },
        GlobalAction::Unset { key } => {
            if manager.global_unset(&key).await? {
                println!("Removed {}", key);
            } else {
                println!("{} is not set", key);
            }
        }
        GlobalAction::List => {
            let global = manager.load_global().await?;
            let text = toml::to_string_pretty(&global).context("Failed to render global config")?;
            print!("{}", text);
        }
        GlobalAction::Reset => {
            manager.global_reset().await?;
            println!("Global config reset");
        }
    }
    Ok(())
}

fn print_entry(entry: &ModelEntry) {
    println!("id:       {}", entry.id);
    println!("repo:     {}", entry.repo);
    println!("file:     {}", entry.file);
    println!("revision: {}", entry.revision());
    if let Some(alias) = &entry.source_alias {
        println!("alias:    {}", alias);
    }
    if let Some(layers) = entry.layers {
        println!("layers:   {}", layers);
    }
    println!("status:   {}", entry.download.status);
    if let Some(path) = &entry.artifact_path {
        println!("artifact: {}", path.display());
    }
    print_args(entry);
}

fn print_args(entry: &ModelEntry) {
    if entry.args.is_empty() {
        println!("(no arguments set on {})", entry.id);
    }
    for (key, value) in &entry.args {
        println!("{} = {}", key, value);
    }
}

fn print_removal(outcome: &RemoveOutcome) {
    println!("Removed {}", outcome.entry.id);
    if outcome.artifact_deleted {
        println!("Deleted artifact {}", outcome.entry.file);
    } else if outcome.artifact_shared {
        println!("Kept artifact {} (used by another model)", outcome.entry.file);
    }
}
