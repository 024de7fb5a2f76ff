use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, warn};
use tokio::sync::mpsc;

use crate::component::ComponentManager;
use crate::component::models::{CatalogEntry, Category, Outcome};
use crate::component::progress::ProgressEvent;
use crate::env::Settings;
use crate::util::{format_size, format_speed};

mod archive;
mod component;
mod env;
mod environment;
mod error;
mod fetch;
mod paths;
mod repository;
mod util;

#[derive(Parser, Debug)]
#[command(
    name = "bottles-components",
    author,
    version,
    about = "Install and remove runners, DXVK, VKD3D and other Bottles components"
)]
struct Cli {
    /// Bottles data directory (defaults to $BOTTLES_DATA_DIR or ~/.local/share/bottles).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Directory holding the component manifests and `index.json`.
    #[arg(long, global = true)]
    repository: Option<PathBuf>,

    /// How often a queued install checks whether the running one has finished.
    #[arg(long, global = true, value_name = "MS")]
    poll_interval_ms: Option<u64>,

    /// Overall HTTP timeout per request; unset leaves the client default.
    #[arg(long, global = true, value_name = "SECS")]
    timeout_secs: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download and install a component.
    Install { category: String, name: String },
    /// Remove an installed component that no bottle uses.
    Uninstall { category: String, name: String },
    /// Report whether a component is referenced by any bottle.
    InUse { category: String, name: String },
    /// Show the repository catalog with installed markers.
    Catalog {
        #[arg(long)]
        json: bool,
    },
    /// List installed components, optionally for a single category.
    List { category: Option<String> },
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let settings = settings_from(&cli);
    let manager = match ComponentManager::from_settings(&settings) {
        Ok(manager) => manager,
        Err(err) => {
            error!("unable to start: {err}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Command::Install { category, name } => match category.parse::<Category>() {
            Ok(category) => report(install_with_progress(&manager, category, &name).await),
            Err(err) => report(err.into()),
        },
        Command::Uninstall { category, name } => match category.parse::<Category>() {
            Ok(category) => report(manager.uninstall(category, &name)),
            Err(err) => report(err.into()),
        },
        Command::InUse { category, name } => match category.parse::<Category>() {
            Ok(category) => {
                let in_use = manager.is_in_use(category, &name);
                println!("{name}: {}", if in_use { "in use" } else { "unused" });
                ExitCode::SUCCESS
            }
            Err(err) => report(err.into()),
        },
        Command::Catalog { json } => {
            let catalog = manager.fetch_catalog();
            if json {
                match serde_json::to_string_pretty(&catalog) {
                    Ok(text) => println!("{text}"),
                    Err(err) => {
                        error!("catalog: serialization failed: {err}");
                        return ExitCode::FAILURE;
                    }
                }
                return ExitCode::SUCCESS;
            }
            if catalog.is_empty() {
                println!("catalog unavailable (offline or empty repository)");
            }
            for (sub_category, entries) in catalog.runners_by_sub_category() {
                println!("runners ({sub_category}):");
                for entry in entries {
                    print_entry(entry);
                }
            }
            for (category, entries) in &catalog.entries {
                if matches!(category, Category::Runner | Category::RunnerProton) {
                    continue;
                }
                println!("{category}:");
                for entry in entries {
                    print_entry(entry);
                }
            }
            ExitCode::SUCCESS
        }
        Command::List { category } => {
            let categories = match category.map(|c| c.parse::<Category>()).transpose() {
                Ok(Some(category)) => vec![category],
                Ok(None) => Category::ALL.to_vec(),
                Err(err) => return report(err.into()),
            };
            for category in categories {
                let names = manager.environments().installed_components(category);
                println!("{category}: {}", names.join(", "));
            }
            ExitCode::SUCCESS
        }
    }
}

/// Defaults and environment first, then command-line overrides.
fn settings_from(cli: &Cli) -> Settings {
    let mut settings = match &cli.data_dir {
        Some(dir) => Settings::new(dir),
        None => Settings::default(),
    };
    if let Some(dir) = &cli.repository {
        settings = settings.with_repository_dir(dir);
    }
    if let Some(ms) = cli.poll_interval_ms {
        settings = settings.with_poll_interval(Duration::from_millis(ms.max(1)));
    }
    if let Some(secs) = cli.timeout_secs {
        settings = settings.with_http_timeout(Some(Duration::from_secs(secs)));
    }
    settings
}

async fn install_with_progress(
    manager: &ComponentManager,
    category: Category,
    name: &str,
) -> Outcome {
    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("[{bar:40.cyan/blue}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓░"),
    );
    bar.set_message(format!("waiting for {name}"));

    let (tx, mut rx) = mpsc::unbounded_channel::<ProgressEvent>();
    let render = {
        let bar = bar.clone();
        let name = name.to_owned();
        tokio::spawn(async move {
            let started = Instant::now();
            while let Some(event) = rx.recv().await {
                let percent = event.fraction() * 100.0;
                bar.set_position(percent as u64);
                match event {
                    ProgressEvent::Transfer {
                        count,
                        block_size,
                        total_size,
                        ..
                    } => {
                        let done = (count * block_size).min(total_size);
                        let elapsed = started.elapsed().as_secs_f64().max(0.001);
                        bar.set_message(format!(
                            "{name} {percent:>5.1}% {} / {} {}",
                            format_size(done),
                            format_size(total_size),
                            format_speed(done as f64 / elapsed)
                        ));
                    }
                    ProgressEvent::Completed { .. } => {
                        bar.set_message(format!("{name} downloaded, installing"));
                    }
                    ProgressEvent::Failed { .. } => {
                        bar.set_message(format!("{name} download failed"));
                    }
                }
            }
        })
    };

    let outcome = {
        let install = manager.install(category, name, Some(&tx));
        tokio::pin!(install);
        loop {
            tokio::select! {
                outcome = &mut install => break outcome,
                signal = tokio::signal::ctrl_c() => match signal {
                    Ok(()) => {
                        bar.set_message(format!("cancelling {name}"));
                        manager.cancel_current();
                    }
                    Err(err) => {
                        warn!("install: unable to listen for Ctrl-C: {err}");
                        break (&mut install).await;
                    }
                },
            }
        }
    };
    drop(tx);
    let _ = render.await;
    bar.finish_and_clear();
    outcome
}

fn print_entry(entry: &CatalogEntry) {
    let marker = if entry.installed { "*" } else { " " };
    println!("  {marker} {}", entry.name);
}

fn report(outcome: Outcome) -> ExitCode {
    if outcome.ok {
        println!("done");
        ExitCode::SUCCESS
    } else {
        eprintln!(
            "failed: {}",
            outcome.message.as_deref().unwrap_or("unknown error")
        );
        ExitCode::FAILURE
    }
}
