use std::{io::Write as _, path::PathBuf, process::ExitCode};

use anyhow::{Context as _, bail};
use clap::{ArgAction, Parser, Subcommand};
use log::debug;
use serde_json::json;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;

use loadout::{
    bundler::{self, BuildReport},
    config::{Config, DEFAULT_CONFIG_FILE},
    dev_server::{self, DevEvent, DevSession, http},
    error::{BuildError, BuildFailed},
    lint::{self, CommandLinter},
};

/// loadout: resolve, transform and bundle front-end modules
#[derive(Debug, Parser)]
#[command(name = "loadout", author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Configuration file; its directory is the project root
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Turn off a named rule for this run
    #[arg(long = "disable-rule", global = true, value_name = "NAME")]
    disable_rules: Vec<String>,

    /// Machine-readable output: error summaries and dev server events as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Build every entry once
    Build,
    /// Rebuild on change and write to the output directory
    Watch,
    /// Rebuild on change and serve the result over HTTP with live reload
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run the configured linter
    Lint,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match run(&cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err, cli.json);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

async fn run(cli: &Cli) -> anyhow::Result<ExitCode> {
    let mut config = Config::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    config.disable_rules(&cli.disable_rules)?;

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("Received Ctrl+C, shutting down");
            on_signal.cancel();
        }
    });

    match &cli.command {
        Command::Build => {
            let report = bundler::build(config, shutdown).await?;
            print_report(&report, cli.json)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Watch => develop(config, shutdown, cli.json, None).await,
        Command::Serve { host, port } => {
            let host = host.clone().unwrap_or_else(|| config.dev_server.host.clone());
            let port = port.unwrap_or(config.dev_server.port);
            develop(config, shutdown, cli.json, Some((host, port))).await
        }
        Command::Lint => run_lint(&config, cli.json).await,
    }
}

/// Watch mode; with an address, also serve over HTTP instead of writing to disk
async fn develop(
    config: Config,
    shutdown: CancellationToken,
    json: bool,
    address: Option<(String, u16)>,
) -> anyhow::Result<ExitCode> {
    let mut session = DevSession::new(config, address.is_none())?;
    tokio::spawn(print_events(session.subscribe(), json));

    match session.start(shutdown.child_token()).await {
        Ok(_) => {}
        Err(BuildError::Cancelled) => return Ok(ExitCode::SUCCESS),
        Err(e) => return Err(e).context("initial build failed"),
    }

    let server = match address {
        Some((host, port)) => {
            let listener = http::bind(&host, port).await?;
            let router = http::router(&session, shutdown.clone());
            Some(tokio::spawn(http::serve(listener, router, shutdown.clone())))
        }
        None => None,
    };
    dev_server::watch(&mut session, shutdown.clone()).await?;
    if let Some(server) = server {
        server.await.context("dev server task failed")??;
    }
    Ok(ExitCode::SUCCESS)
}

async fn print_events(mut events: broadcast::Receiver<DevEvent>, json: bool) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                debug!("Skipped {skipped} dev server events");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let mut out = std::io::stdout().lock();
        let _ = if json {
            writeln!(out, "{}", event.to_json())
        } else {
            match &event {
                DevEvent::Reload { changed } => writeln!(out, "rebuilt: {}", changed.join(", ")),
                DevEvent::BuildFailed { errors } => {
                    writeln!(out, "build failed with {} error(s)", errors.len())
                }
            }
        };
    }
}

async fn run_lint(config: &Config, json: bool) -> anyhow::Result<ExitCode> {
    let Some(lint_config) = &config.lint else {
        bail!("no [lint] section in the configuration");
    };
    let diagnostics = CommandLinter::new(lint_config, &config.root).run().await?;
    let mut out = std::io::stdout().lock();
    if json {
        writeln!(out, "{}", serde_json::to_string_pretty(&diagnostics)?)?;
    } else {
        for diagnostic in &diagnostics {
            writeln!(out, "{diagnostic}")?;
        }
    }
    Ok(if lint::has_errors(&diagnostics) {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn print_report(report: &BuildReport, json: bool) -> anyhow::Result<()> {
    let mut out = std::io::stdout().lock();
    if json {
        let cycles: Vec<String> = report.cycles.iter().map(ToString::to_string).collect();
        let summary = json!({
            "status": "ok",
            "output_dir": report.output_dir.display().to_string(),
            "modules": report.module_count,
            "manifest": report.manifest,
            "cycles": cycles,
        });
        writeln!(out, "{}", serde_json::to_string_pretty(&summary)?)?;
        return Ok(());
    }
    for (name, files) in &report.manifest.entries {
        for file in files {
            writeln!(out, "{name}: {} ({} bytes)", file.path, file.size_bytes)?;
        }
    }
    writeln!(
        out,
        "Built {} entries from {} modules into {}",
        report.manifest.entries.len(),
        report.module_count,
        report.output_dir.display()
    )?;
    Ok(())
}

fn report_error(err: &anyhow::Error, json: bool) {
    let failed = err.downcast_ref::<BuildFailed>();
    if json {
        let summary = failed.map_or_else(
            || json!({ "status": "failed", "errors": [{ "message": format!("{err:#}") }] }),
            BuildFailed::to_json,
        );
        let _ = writeln!(std::io::stdout().lock(), "{summary}");
        return;
    }
    let mut out = std::io::stderr().lock();
    let _ = match failed {
        Some(failed) => writeln!(out, "error: {failed}").and_then(|()| {
            failed
                .0
                .iter()
                .try_for_each(|failure| writeln!(out, "  - {failure}"))
        }),
        None => writeln!(out, "error: {err:#}"),
    };
}
