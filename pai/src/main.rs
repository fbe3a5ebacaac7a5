//! `pai` command-line entry point.
//!
//! `pai auto` runs the interactive session; `pai config ...` manages the
//! credential store. Configuration precedence is CLI > environment > file >
//! defaults.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};

use pai::error::AgentError;
use pai::exit_codes;
use pai::io::backend::GeminiBackend;
use pai::io::config::{AgentConfig, config_path, resolve_config};
use pai::io::credentials::{CredentialPool, CredentialStore};
use pai::io::inference::ThreadSleeper;
use pai::logging;
use pai::session::{RequestStop, Session, StepReport};

#[derive(Parser)]
#[command(
    name = "pai",
    version,
    about = "Terminal coding agent that executes one planned action at a time"
)]
struct Cli {
    /// Workspace root (defaults to the current directory).
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,
    /// Show plan commentary, unexecuted proposals and shell commands.
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Allow shell commands that look like they reach the network.
    #[arg(long, global = true)]
    allow_network: bool,
    /// Credential store path (defaults to the user config directory).
    #[arg(long, global = true)]
    credentials: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start an interactive session (`exit`, `quit` or EOF ends it).
    Auto,
    /// Manage API keys.
    Config {
        #[command(subcommand)]
        action: ConfigCommand,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Add a key. The secret is read from stdin unless `--key` is given.
    Add {
        id: String,
        #[arg(long)]
        key: Option<String>,
        #[arg(long)]
        label: Option<String>,
    },
    Remove {
        id: String,
    },
    Enable {
        id: String,
    },
    Disable {
        id: String,
    },
    /// Make `id` the first key used in rotation.
    Default {
        id: String,
    },
    /// List keys with masked secrets.
    List,
    /// Show one key; `--reveal` prints the raw secret.
    Show {
        id: String,
        #[arg(long)]
        reveal: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    if let Err(err) = run(cli) {
        eprintln!("{:#}", err);
        let fatal = err
            .downcast_ref::<AgentError>()
            .is_some_and(AgentError::is_session_fatal);
        std::process::exit(if fatal {
            exit_codes::FATAL
        } else {
            exit_codes::INVALID
        });
    }
}

fn run(cli: Cli) -> Result<()> {
    let store = match &cli.credentials {
        Some(path) => CredentialStore::new(path),
        None => CredentialStore::default_location()?,
    };
    match cli.command {
        Command::Auto => {
            let root = match &cli.workspace {
                Some(path) => path.clone(),
                None => std::env::current_dir().context("resolve current directory")?,
            };
            let mut cfg = resolve_config(&config_path(&root), std::env::vars())?;
            if cli.verbose {
                cfg.verbose = true;
            }
            if cli.allow_network {
                cfg.allow_network = true;
            }
            cfg.validate().context("invalid configuration after CLI overrides")?;
            cmd_auto(root, cfg, &store)
        }
        Command::Config { action } => cmd_config(action, &store),
    }
}

fn cmd_auto(root: PathBuf, cfg: AgentConfig, store: &CredentialStore) -> Result<()> {
    let pool = store.load()?;
    if pool.enabled_count() == 0 {
        bail!(
            "no enabled API keys in {} (add one with `pai config add <id>`)",
            store.path().display()
        );
    }
    let verbose = cfg.verbose;
    let backend = GeminiBackend::new(&cfg.model);
    let mut session = Session::new(
        &root,
        cfg,
        Box::new(backend),
        pool,
        Box::new(ThreadSleeper),
    )?;
    println!("pai: workspace {}", session.root().display());
    println!("Type a request, or `exit` to leave.");

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("pai> ");
        io::stdout().flush().context("flush stdout")?;
        let Some(line) = lines.next() else {
            session.terminate()?;
            println!();
            return Ok(());
        };
        let line = line.context("read stdin")?;
        if line.trim().is_empty() {
            continue;
        }

        let outcome = session.handle_request(&line, |report| print_step(report, verbose))?;
        match outcome.stop {
            RequestStop::Exited => return Ok(()),
            RequestStop::Finished { message } => println!("Done: {message}"),
            RequestStop::Stalled { message } => println!("Done: {message}"),
            RequestStop::StepLimit { max_steps } => {
                println!("Paused after {max_steps} steps; send another request to continue.");
            }
        }
    }
}

fn print_step(report: &StepReport, verbose: bool) {
    if verbose {
        for comment in report.plan.comments() {
            println!("  {comment}");
        }
    }
    match &report.executed {
        Some(action) => println!("[{}] {}", report.step, action.to_wire()),
        None => println!("[{}] (no valid action)", report.step),
    }
    println!("{}", report.result.render());
    if verbose && !report.not_executed.is_empty() {
        println!("Proposed but not executed:");
        for action in &report.not_executed {
            println!("  {}", action.to_wire());
        }
    }
}

fn cmd_config(action: ConfigCommand, store: &CredentialStore) -> Result<()> {
    let mut pool = store.load()?;
    match action {
        ConfigCommand::Add { id, key, label } => {
            let secret = match key {
                Some(key) => key,
                None => read_secret(&id)?,
            };
            pool.add(&id, &secret, label)?;
            save(store, &pool)?;
            println!("Added key {id}");
        }
        ConfigCommand::Remove { id } => {
            pool.remove(&id)?;
            save(store, &pool)?;
            println!("Removed key {id}");
        }
        ConfigCommand::Enable { id } => {
            pool.enable(&id)?;
            save(store, &pool)?;
            println!("Enabled key {id}");
        }
        ConfigCommand::Disable { id } => {
            pool.disable(&id)?;
            save(store, &pool)?;
            println!("Disabled key {id}");
        }
        ConfigCommand::Default { id } => {
            pool.set_default(&id)?;
            save(store, &pool)?;
            println!("Default key is now {id}");
        }
        ConfigCommand::List => {
            if pool.is_empty() {
                println!("No keys configured.");
            }
            for summary in pool.list() {
                println!("{summary}");
            }
        }
        ConfigCommand::Show { id, reveal } => {
            if reveal {
                println!("{}", pool.reveal(&id)?);
            } else {
                let summary = pool
                    .list()
                    .into_iter()
                    .find(|s| s.id == id)
                    .ok_or_else(|| anyhow!("no key with id: {id}"))?;
                println!("{summary}");
            }
        }
    }
    Ok(())
}

fn save(store: &CredentialStore, pool: &CredentialPool) -> Result<()> {
    store
        .save(pool)
        .with_context(|| format!("save {}", store.path().display()))
}

fn read_secret(id: &str) -> Result<String> {
    eprint!("API key for {id}: ");
    io::stderr().flush().context("flush stderr")?;
    let mut line = String::new();
    io::stdin().read_line(&mut line).context("read key from stdin")?;
    Ok(line.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_auto_with_global_flags() {
        let cli = Cli::parse_from(["pai", "auto", "--verbose", "--allow-network"]);
        assert!(matches!(cli.command, Command::Auto));
        assert!(cli.verbose);
        assert!(cli.allow_network);
    }

    #[test]
    fn parse_config_show_reveal() {
        let cli = Cli::parse_from(["pai", "config", "show", "work", "--reveal"]);
        match cli.command {
            Command::Config {
                action: ConfigCommand::Show { id, reveal },
            } => {
                assert_eq!(id, "work");
                assert!(reveal);
            }
            _ => panic!("expected config show"),
        }
    }

    #[test]
    fn parse_workspace_before_subcommand() {
        let cli = Cli::parse_from(["pai", "--workspace", "/tmp/proj", "auto"]);
        assert_eq!(cli.workspace, Some(PathBuf::from("/tmp/proj")));
    }

    #[test]
    fn config_commands_persist_through_the_store() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = CredentialStore::new(&temp.path().join("credentials.json"));
        cmd_config(
            ConfigCommand::Add {
                id: "work".to_string(),
                key: Some("sk-work-0123456789".to_string()),
                label: None,
            },
            &store,
        )
        .expect("add");
        cmd_config(
            ConfigCommand::Disable {
                id: "work".to_string(),
            },
            &store,
        )
        .expect("disable");

        let pool = store.load().expect("load");
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.enabled_count(), 0);
    }
}
