//! Thin command-line front end over the [`kvdb`] façade: one subcommand
//! per façade operation, each running inside a single implicit
//! transaction that commits on success. Exists so the façade has
//! something to drive from a shell; it is not part of the storage engine
//! itself.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use kvdb::{Config, Database, TxId, TxOutcome};
use kvdb_error::{KvError, Result};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kvdb", about = "Command-line client for a kvdb database directory")]
struct Cli {
    /// Database directory (created if it doesn't exist).
    #[arg(long, global = true, default_value = "./kvdb-data")]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create or verify a database directory, seeding its config.json sidecar.
    Open,
    /// Print the effective configuration for this directory as JSON.
    Config,
    /// Look up a key.
    Get { key: String },
    /// Set a key to a value.
    Set { key: String, value: String },
    /// Delete a key, if present.
    Delete { key: String },
    /// Print the smallest key strictly greater than `key` (or the first
    /// key in the store if `key` is omitted).
    Next { key: Option<String> },
    /// Print the keys flanking `key` on either side.
    Find { key: String },
    /// Force a checkpoint now.
    Checkpoint,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Every façade call in a CLI session runs alone against a fresh
/// transaction, so it can never actually observe lock contention; turn a
/// `Blocked` outcome into an error rather than assume it away with a
/// panic.
fn done<T>(outcome: TxOutcome<T>) -> Result<T> {
    match outcome {
        TxOutcome::Done(value) => Ok(value),
        TxOutcome::Blocked => Err(KvError::client("unexpected lock contention in a single-session command")),
    }
}

fn print_pair(label: &str, pair: Option<(Vec<u8>, Vec<u8>)>) {
    match pair {
        Some((k, v)) => println!("{label}: {}\t{}", String::from_utf8_lossy(&k), String::from_utf8_lossy(&v)),
        None => println!("{label}: (none)"),
    }
}

fn with_transaction<T>(db: &mut Database, f: impl FnOnce(&mut Database, TxId) -> Result<T>) -> Result<T> {
    let tx = db.begin();
    match f(db, tx) {
        Ok(value) => {
            db.commit(tx)?;
            Ok(value)
        }
        Err(e) => {
            db.rollback(tx)?;
            Err(e)
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = Config::load_or_default(&cli.root)?;

    if let Command::Config = cli.command {
        let json = serde_json::to_string_pretty(&config).expect("Config serializes infallibly");
        println!("{json}");
        return Ok(());
    }

    let mut db = Database::open(&cli.root, config.clone())?;

    match cli.command {
        Command::Open => {
            config.save(&cli.root)?;
            println!("opened {}", cli.root.display());
        }
        Command::Config => unreachable!("handled above"),
        Command::Get { key } => {
            let value = with_transaction(&mut db, |db, tx| done(db.get(tx, key.as_bytes())?))?;
            match value {
                Some(v) => println!("{}", String::from_utf8_lossy(&v)),
                None => println!("(not found)"),
            }
        }
        Command::Set { key, value } => {
            with_transaction(&mut db, |db, tx| done(db.set(tx, key.as_bytes(), value.as_bytes())?))?;
            println!("ok");
        }
        Command::Delete { key } => {
            with_transaction(&mut db, |db, tx| done(db.delete(tx, key.as_bytes())?))?;
            println!("ok");
        }
        Command::Next { key } => {
            let pair = with_transaction(&mut db, |db, tx| done(db.next(tx, key.as_deref().map(str::as_bytes))?))?;
            print_pair("next", pair);
        }
        Command::Find { key } => {
            let (prev, next) = with_transaction(&mut db, |db, tx| done(db.find(tx, key.as_bytes())?))?;
            print_pair("prev", prev);
            print_pair("next", next);
        }
        Command::Checkpoint => {
            db.checkpoint()?;
            println!("checkpoint written");
        }
    }

    db.close()
}
