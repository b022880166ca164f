use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use sensor_logbook::config::Config;
use sensor_logbook::convert::ConversionOutcome;
use sensor_logbook::error::ConvertError;
use sensor_logbook::notify::{Notifier, RecorderEvent, Subscription};
use sensor_logbook::store::{RecordFile, RecordStore};
use std::path::{Path, PathBuf};
use std::thread;
use tokio::runtime::Handle;

#[derive(Parser, Debug)]
#[command(name = "sensor-logbook", version, about = "Manage and convert recorded sensor logs")]
struct Cli {
    /// Use this config file instead of the default location
    #[arg(long, short)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List recorded channel logs
    List,
    /// Copy a recorded log into the temporary directory
    Stage {
        /// Log path, relative to the storage root or absolute
        log: PathBuf,
    },
    /// Convert a log to CSV next to it (Ctrl-C cancels)
    Convert { log: PathBuf },
    /// Delete a recorded log and its sidecar
    Remove { log: PathBuf },
    /// Cancel any conversion and empty the temporary directory
    ClearTemp,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")?;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.log_level)).init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads())
        .max_blocking_threads(config.worker_threads())
        .enable_all()
        .build()
        .context("Failed to start background pool")?;

    let notifier = Notifier::new();
    let store = RecordStore::new(config.storage_root(), config.temp_dir(), notifier.clone());
    log::debug!("Storage root {}", store.storage_root().display());

    // Errors are published as events; print them as they arrive
    let events = notifier.subscribe();
    let subscription_id = events.id;
    let printer = thread::spawn(move || print_events(events));

    let result = runtime.block_on(run(cli.command, &store));

    notifier.unsubscribe(subscription_id);
    let _ = printer.join();
    result
}

async fn run(command: Command, store: &RecordStore) -> anyhow::Result<()> {
    match command {
        Command::List => {
            for record in store.records() {
                println!(
                    "{}  {:<16} {:<10} {}",
                    record.start_date.format("%Y-%m-%d %H:%M:%S"),
                    record.serial_number,
                    record.operation.file_stem(),
                    record.file_path.display()
                );
            }
        }
        Command::Stage { log } => {
            let record = find_record(store, &log)?;
            match store.temp_copy(&record) {
                Some(path) => println!("{}", path.display()),
                None => bail!("Could not stage {}", log.display()),
            }
        }
        Command::Convert { log } => convert(store, log).await?,
        Command::Remove { log } => {
            let record = find_record(store, &log)?;
            store.remove_record(&record);
        }
        Command::ClearTemp => store.temp_clear(),
    }
    Ok(())
}

async fn convert(store: &RecordStore, log: PathBuf) -> anyhow::Result<()> {
    let job = store.convert(&Handle::current(), log);
    let cancel = job.cancel_flag();

    let join = job.join();
    tokio::pin!(join);
    let result = tokio::select! {
        result = &mut join => result,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Cancelling conversion");
            cancel.cancel();
            join.await
        }
    };

    match result {
        Ok(ConversionOutcome::Complete(path)) => println!("{}", path.display()),
        Ok(ConversionOutcome::Truncated { path, line, reason }) => {
            println!("{}", path.display());
            eprintln!("warning: stopped at line {}: {}", line, reason);
        }
        Err(ConvertError::Cancelled { partial }) => {
            eprintln!("cancelled, partial table at {}", partial.display());
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Match a record by its relative log path or its absolute location
fn find_record(store: &RecordStore, log: &Path) -> anyhow::Result<RecordFile> {
    store
        .records()
        .into_iter()
        .find(|r| r.file_path == log || store.storage_root().join(&r.file_path) == log)
        .with_context(|| format!("No recording at {}", log.display()))
}

fn print_events(events: Subscription<RecorderEvent>) {
    for event in events.receiver.iter() {
        match event {
            RecorderEvent::Converting { target, percent } => {
                eprint!("\r{} {:>3}%", target, percent);
                if percent == 100 {
                    eprintln!();
                }
            }
            RecorderEvent::Error(reason) => eprintln!("error: {}", reason),
            RecorderEvent::RecordsUpdated => eprintln!("records updated"),
            RecorderEvent::Idle | RecorderEvent::Recording => {}
        }
    }
}
