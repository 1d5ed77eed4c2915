//! Servicerack: a supervisor for the services of local projects.
//!
//! This is the entry point of the command-line tool. It parses arguments, loads
//! `servicerack.toml`, and drives the supervisor for the requested subcommand.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::info;
use tracing_subscriber::EnvFilter;

use servicerack::catalog::{Catalog, ProjectSource};
use servicerack::clipboard;
use servicerack::config::{self, Config};
use servicerack::logs::{LogLine, LogStore, StreamKind};
use servicerack::model::{Project, RuntimeInfo, ScriptState, ServiceId};
use servicerack::outcome::BatchReport;
use servicerack::registry::ProcessSignal;
use servicerack::status::StatusStore;
use servicerack::supervisor::{Supervisor, SupervisorSettings};

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "servicerack",
    version,
    about = "Service supervisor for local projects",
    styles = help_styles(),
    color = clap::ColorChoice::Always,
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Path to servicerack.toml configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Max log lines kept per service.
    #[arg(long, global = true)]
    max_lines: Option<usize>,
    /// Time to wait after sending SIGINT before escalating (ms).
    #[arg(long, global = true)]
    shutdown_sigint_ms: Option<u64>,
    /// Time to wait after sending SIGTERM before force-killing (ms).
    #[arg(long, global = true)]
    shutdown_sigterm_ms: Option<u64>,
    /// Enable debug logging on stderr.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List projects and their services.
    List,
    /// Start a project's services and stream their output until interrupted.
    Up {
        /// Project id or name.
        project: String,
        /// Only start these services (repeatable).
        #[arg(long = "service", short = 's')]
        services: Vec<String>,
        /// Strip ANSI escapes from service output.
        #[arg(long)]
        plain: bool,
        /// Print the post-start status table as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Run a project script and stream its output until it finishes.
    Run {
        /// Script as project/name or script id.
        script: String,
        /// Strip ANSI escapes from script output.
        #[arg(long)]
        plain: bool,
    },
    /// Print the command line a service is launched with.
    Command {
        /// Service id, project/name, or unique name.
        service: String,
    },
    /// Copy the launch command of a service to the clipboard.
    Copy { service: String },
    /// Run a service in an external terminal, outside supervision.
    Open { service: String },
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("Error: {:#}", err);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = load_config(&cli)?;
    let catalog = Arc::new(Catalog::from_config(&config)?);

    if let Commands::List = &cli.command {
        print_projects(&catalog);
        return Ok(());
    }

    let supervisor = Supervisor::new(
        catalog.clone(),
        Arc::new(StatusStore::new()),
        Arc::new(LogStore::new(config.max_lines())),
        SupervisorSettings {
            shutdown: config.shutdown(),
            terminal: config.terminal.clone(),
        },
    );

    match &cli.command {
        Commands::List => {}
        Commands::Up {
            project,
            services,
            plain,
            json,
        } => run_up(&supervisor, &catalog, project, services, *plain, *json).await?,
        Commands::Run { script, plain } => run_script(&supervisor, &catalog, script, *plain).await?,
        Commands::Command { service } => {
            let id = catalog.resolve_service(service)?;
            println!("{}", supervisor.build_launch_command(&id)?);
        }
        Commands::Copy { service } => {
            let id = catalog.resolve_service(service)?;
            let line = clipboard::copy_launch_command(&supervisor, &id)?;
            println!("copied: {}", line);
        }
        Commands::Open { service } => {
            let id = catalog.resolve_service(service)?;
            let launch = supervisor.launch_external(&id)?;
            println!("opened {} in {}", launch.service_id, launch.terminal);
        }
    }
    Ok(())
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load_config(cli: &Cli) -> Result<Config> {
    let path = match cli.config.clone().or_else(config::default_config_path) {
        Some(path) => path,
        None => bail!("no servicerack.toml found (use --config <path>)"),
    };
    let mut config = config::load_config(&path)?;
    if cli.max_lines.is_some() {
        config.max_lines = cli.max_lines;
    }
    if cli.shutdown_sigint_ms.is_some() {
        config.shutdown_sigint_ms = cli.shutdown_sigint_ms;
    }
    if cli.shutdown_sigterm_ms.is_some() {
        config.shutdown_sigterm_ms = cli.shutdown_sigterm_ms;
    }
    Ok(config)
}

fn print_projects(catalog: &Catalog) {
    if catalog.projects().is_empty() {
        println!("no projects configured");
        return;
    }
    for project in catalog.projects() {
        println!("{} ({})  {}", project.name, project.id, project.root.display());
        for service in project.services_in_order() {
            let port = service
                .port
                .map(|port| format!(" :{}", port))
                .unwrap_or_default();
            println!("  {:<20} {}{}", service.name, service.command, port);
        }
        for script in &project.scripts {
            println!("  script {:<13} {}", script.name, script.command);
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusRow<'a> {
    name: &'a str,
    port: Option<u16>,
    #[serde(flatten)]
    runtime: RuntimeInfo,
}

fn print_status(supervisor: &Supervisor, project: &Project, json: bool) -> Result<()> {
    let rows: Vec<StatusRow<'_>> = project
        .services_in_order()
        .into_iter()
        .map(|service| StatusRow {
            name: &service.name,
            port: service.port,
            runtime: supervisor.runtime(&service.id),
        })
        .collect();
    if json {
        let out = serde_json::to_string_pretty(&rows).context("failed to encode status")?;
        println!("{}", out);
        return Ok(());
    }
    for row in rows {
        let pid = row
            .runtime
            .pid
            .map(|pid| pid.to_string())
            .unwrap_or_else(|| "-".to_string());
        let error = row.runtime.error.as_deref().unwrap_or("");
        println!(
            "{:<20} {:<9} {:>7}  {}",
            row.name, row.runtime.status, pid, error
        );
    }
    Ok(())
}

/// What `up` and `run` react to while processes run.
enum RunEvent {
    Log(LogLine),
    Status(RuntimeInfo),
    Shutdown(ProcessSignal),
}

async fn run_up(
    supervisor: &Supervisor,
    catalog: &Catalog,
    project: &str,
    services: &[String],
    plain: bool,
    json: bool,
) -> Result<()> {
    let project = catalog.resolve_project(project)?;
    let selected = services
        .iter()
        .map(|name| {
            let query = if name.contains('/') {
                name.clone()
            } else {
                format!("{}/{}", project.id, name)
            };
            catalog.resolve_service(&query)
        })
        .collect::<Result<Vec<ServiceId>>>()?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut prefixes = HashMap::new();
    for service in project.services_in_order() {
        prefixes.insert(
            service.id.clone(),
            apply_color(&format!("[{}]", service.name), service.color.as_deref()),
        );
        forward_logs(supervisor.subscribe_logs(&service.id), tx.clone());
        let mut status = supervisor.subscribe_status(&service.id);
        let status_tx = tx.clone();
        tokio::spawn(async move {
            while let Some(info) = status.recv().await {
                if status_tx.send(RunEvent::Status(info)).is_err() {
                    break;
                }
            }
        });
    }
    spawn_signal_listener(tx);

    let report = if selected.is_empty() {
        supervisor.start_all(&project.id).await?
    } else {
        supervisor.start_services(&project.id, &selected).await?
    };
    print_report(&report, &prefixes);
    print_status(supervisor, &project, json)?;

    while let Some(event) = rx.recv().await {
        match event {
            RunEvent::Log(line) => {
                let prefix = prefixes
                    .get(&line.service_id)
                    .map(String::as_str)
                    .unwrap_or("");
                print_line(prefix, line, plain);
            }
            RunEvent::Status(info) => {
                if let (Some(error), Some(prefix)) = (&info.error, prefixes.get(&info.service_id)) {
                    if !info.status.is_active() {
                        eprintln!("{} {}", prefix, error);
                    }
                }
                let any_active = project
                    .services
                    .iter()
                    .any(|service| supervisor.runtime(&service.id).status.is_active());
                if !any_active {
                    info!(project = %project.id, "all services exited");
                    break;
                }
            }
            RunEvent::Shutdown(signal) => {
                info!(?signal, "shutting down");
                break;
            }
        }
    }

    let report = supervisor.stop_all(&project.id).await?;
    supervisor.shutdown().await;
    if !report.is_success() {
        print_report(&report, &prefixes);
        bail!(report.summary());
    }
    Ok(())
}

async fn run_script(
    supervisor: &Supervisor,
    catalog: &Catalog,
    query: &str,
    plain: bool,
) -> Result<()> {
    let id = catalog.resolve_script(query)?;
    let name = catalog
        .script(&id)
        .map(|(_, script)| script.name)
        .unwrap_or_else(|| id.to_string());
    let prefix = format!("[{}]", name);

    let (tx, mut rx) = mpsc::unbounded_channel();
    forward_logs(supervisor.subscribe_logs(&id), tx.clone());
    spawn_signal_listener(tx);
    let mut state = supervisor.subscribe_script(&id);

    let pid = supervisor.run_script(&id).await?;
    eprintln!("{} running (pid {})", prefix, pid);

    loop {
        tokio::select! {
            Some(event) = rx.recv() => match event {
                RunEvent::Log(line) => print_line(&prefix, line, plain),
                RunEvent::Shutdown(signal) => {
                    info!(?signal, script = %id, "stopping script");
                    supervisor.stop_script(&id).await?;
                }
                RunEvent::Status(_) => {}
            },
            changed = state.changed() => {
                if changed.is_err() || state.borrow_and_update().is_finished() {
                    break;
                }
            }
        }
    }

    // Output readers can trail the exit notification.
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await {
        if let RunEvent::Log(line) = event {
            print_line(&prefix, line, plain);
        }
    }

    match supervisor.script_state(&id) {
        ScriptState::Failed { message, .. } => bail!("script {} failed: {}", name, message),
        ScriptState::Completed { .. } => {
            eprintln!("{} completed", prefix);
            Ok(())
        }
        ScriptState::Idle | ScriptState::Running { .. } => Ok(()),
    }
}

fn print_line(prefix: &str, line: LogLine, plain: bool) {
    let text = if plain { line.plain() } else { line.text };
    match line.stream {
        StreamKind::Stdout => println!("{} {}", prefix, text),
        StreamKind::Stderr => eprintln!("{} {}", prefix, text),
    }
}

fn forward_logs(mut live: broadcast::Receiver<LogLine>, tx: mpsc::UnboundedSender<RunEvent>) {
    tokio::spawn(async move {
        loop {
            match live.recv().await {
                Ok(line) => {
                    if tx.send(RunEvent::Log(line)).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn print_report(report: &BatchReport, prefixes: &HashMap<ServiceId, String>) {
    for outcome in &report.outcomes {
        let prefix = prefixes
            .get(&outcome.service_id)
            .cloned()
            .unwrap_or_else(|| format!("[{}]", outcome.name));
        match &outcome.result {
            Ok(info) => match info.pid {
                Some(pid) => eprintln!("{} {} (pid {})", prefix, info.status, pid),
                None => eprintln!("{} {}", prefix, info.status),
            },
            Err(err) => eprintln!("{} {} failed: {}", prefix, report.action, err),
        }
    }
    eprintln!("{}", report.summary());
}

fn spawn_signal_listener(tx: mpsc::UnboundedSender<RunEvent>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(_) => return,
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    let _ = tx.send(RunEvent::Shutdown(ProcessSignal::SigInt));
                }
                _ = sigterm.recv() => {
                    let _ = tx.send(RunEvent::Shutdown(ProcessSignal::SigTerm));
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            let _ = tx.send(RunEvent::Shutdown(ProcessSignal::SigInt));
        }
    });
}

fn apply_color(prefix: &str, color: Option<&str>) -> String {
    let code = match color.unwrap_or("").to_lowercase().as_str() {
        "black" => "30",
        "red" => "31",
        "green" => "32",
        "yellow" => "33",
        "blue" => "34",
        "magenta" => "35",
        "cyan" => "36",
        "gray" | "grey" => "90",
        _ => "0",
    };
    if code == "0" {
        prefix.to_string()
    } else {
        format!("\u{1b}[{}m{}\u{1b}[0m", code, prefix)
    }
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .valid(Style::new().fg_color(Some(AnsiColor::Green.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn up_accepts_repeated_services() {
        let cli = Cli::parse_from(["servicerack", "up", "shop", "-s", "api", "--service", "db"]);
        match cli.command {
            Commands::Up { project, services, .. } => {
                assert_eq!(project, "shop");
                assert_eq!(services, vec!["api", "db"]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn up_prints_status_as_json_on_request() {
        let cli = Cli::parse_from(["servicerack", "up", "shop", "--json"]);
        assert!(matches!(cli.command, Commands::Up { json: true, .. }));
        // Status only exists while `up` holds the processes.
        assert!(Cli::try_parse_from(["servicerack", "status", "shop"]).is_err());
    }

    #[test]
    fn run_takes_a_script_path() {
        let cli = Cli::parse_from(["servicerack", "run", "shop/build", "--plain"]);
        match cli.command {
            Commands::Run { script, plain } => {
                assert_eq!(script, "shop/build");
                assert!(plain);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn status_rows_flatten_runtime() {
        let row = StatusRow {
            name: "API",
            port: Some(4000),
            runtime: RuntimeInfo::stopped(ServiceId::new("shop.api").unwrap()),
        };
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["name"], "API");
        assert_eq!(json["port"], 4000);
        assert_eq!(json["serviceId"], "shop.api");
        assert_eq!(json["status"], "stopped");
    }

    #[test]
    fn known_colors_wrap_prefix() {
        assert_eq!(apply_color("[api]", Some("Red")), "\u{1b}[31m[api]\u{1b}[0m");
        assert_eq!(apply_color("[api]", Some("#ff0000")), "[api]");
    }
}
