//! podctl command-line interface

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use podctl::config::{Settings, TemplateRegistry};
use podctl::monitor::{LogEvent, LogWatcher, ResourceSnapshot};
use podctl::ssh::{ProcessOutput, ShellInput};
use podctl::{DeployOptions, EventBus, PodError, PodEvent, PodManager};

/// Session manager for ephemeral GPU pods
#[derive(Parser, Debug)]
#[command(name = "podctl")]
#[command(about = "Deploy, connect to and tear down GPU pods", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List deployable tiers
    Templates,
    /// Deploy a pod for a tier, or reuse the running one
    Deploy {
        /// Tier key, e.g. prod or wan2gp
        tier: String,
        /// Do not upload or start the startup script
        #[arg(long)]
        no_setup: bool,
        /// Always create a new pod
        #[arg(long)]
        no_reuse: bool,
    },
    /// List tracked pods
    List,
    /// Open the tier's tunnels and keep them up until Ctrl-C
    Connect {
        pod: Option<String>,
        /// Follow the pod's log while connected
        #[arg(long)]
        watch: bool,
    },
    /// Follow the startup or service log
    Watch { pod: Option<String> },
    /// GPU, memory and disk usage
    Status { pod: Option<String> },
    /// Mirror the pod's output directory locally
    Pull {
        pod: Option<String>,
        #[arg(long)]
        remote: Option<String>,
        #[arg(long)]
        local: Option<PathBuf>,
    },
    /// Upload workflow files
    Push {
        #[arg(short, long)]
        pod: Option<String>,
        /// Remote directory (defaults to the ComfyUI workflows directory)
        #[arg(long)]
        remote: Option<String>,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Upload a .blend file and render all frames headless
    Render {
        #[arg(short, long)]
        pod: Option<String>,
        file: PathBuf,
    },
    /// Run one command on the pod
    Exec {
        pod: Option<String>,
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Interactive shell on the pod
    Shell { pod: Option<String> },
    /// Hourly burn across running pods
    Wallet,
    /// Terminate a pod and stop its billing
    Terminate {
        pod: Option<String>,
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    podctl::init_logging(&cli.log_level);

    let settings = Settings::load().await.context("Failed to load settings")?;
    if let Commands::Templates = cli.command {
        print_templates(&TemplateRegistry::with_overrides(settings.tiers.clone()));
        return Ok(());
    }

    let events = EventBus::new(256);
    let manager = PodManager::from_settings(settings, events.clone())
        .context("Failed to initialise the pod manager")?;
    manager
        .reconcile()
        .await
        .context("Failed to reconcile the pod table")?;
    let printer = tokio::spawn(print_events(events.subscribe()));

    let result = dispatch(&manager, cli.command).await;
    printer.abort();
    result
}

async fn dispatch(manager: &PodManager, command: Commands) -> Result<()> {
    match command {
        Commands::Templates => Ok(()),
        Commands::Deploy {
            tier,
            no_setup,
            no_reuse,
        } => {
            let outcome = manager
                .deploy(
                    &tier,
                    DeployOptions {
                        reuse: !no_reuse,
                        run_setup: !no_setup,
                    },
                )
                .await?;
            if outcome.reused {
                println!("Reusing running pod {}", outcome.pod_id);
            } else {
                println!("Deployed pod {}", outcome.pod_id);
            }
            println!("Next: podctl connect {} --watch", outcome.pod_id);
            Ok(())
        }
        Commands::List => {
            print_pods(manager);
            Ok(())
        }
        Commands::Connect { pod, watch } => {
            let pod_id = manager.select_pod(pod.as_deref())?;
            run_connect(manager, &pod_id, watch).await
        }
        Commands::Watch { pod } => {
            let pod_id = manager.select_pod(pod.as_deref())?;
            let mut watcher = manager.watch(&pod_id).await?;
            println!("Following {} (Ctrl-C to stop)", watcher.path());
            follow(&mut watcher).await;
            watcher.cancel().await;
            Ok(())
        }
        Commands::Status { pod } => {
            let pod_id = manager.select_pod(pod.as_deref())?;
            let snapshot = manager.status(&pod_id).await?;
            print_snapshot(&pod_id, &snapshot);
            Ok(())
        }
        Commands::Pull { pod, remote, local } => {
            let pod_id = manager.select_pod(pod.as_deref())?;
            let report = manager
                .pull(&pod_id, remote.as_deref(), local.as_deref())
                .await?;
            for path in &report.transferred {
                println!("  + {}", path);
            }
            for (path, reason) in &report.failed {
                println!("  ! {}: {}", path, reason);
            }
            println!(
                "{} new, {} up to date, {} failed",
                report.count(),
                report.skipped,
                report.failed.len()
            );
            Ok(())
        }
        Commands::Push { pod, remote, files } => {
            let pod_id = manager.select_pod(pod.as_deref())?;
            let report = manager.push(&pod_id, &files, remote.as_deref()).await?;
            for path in &report.uploaded {
                println!("  + {}", path);
            }
            for (path, reason) in &report.failed {
                println!("  ! {}: {}", path, reason);
            }
            if report.failed.is_empty() {
                Ok(())
            } else {
                Err(PodError::PartialUpload {
                    failed: report.failed.len(),
                    total: files.len(),
                }
                .into())
            }
        }
        Commands::Exec { pod, command } => {
            let pod_id = manager.select_pod(pod.as_deref())?;
            let output = manager.exec(&pod_id, &command.join(" ")).await?;
            print!("{}", output.stdout);
            eprint!("{}", output.stderr);
            if !output.success() {
                std::process::exit(output.exit_code.map(|c| c as i32).unwrap_or(1));
            }
            Ok(())
        }
        Commands::Render { pod, file } => {
            let pod_id = manager.select_pod(pod.as_deref())?;
            run_render(manager, &pod_id, &file).await
        }
        Commands::Shell { pod } => {
            let pod_id = manager.select_pod(pod.as_deref())?;
            run_shell(manager, &pod_id).await
        }
        Commands::Wallet => {
            let wallet = manager.wallet().await;
            for record in &wallet.pods {
                let rate = record.last_cost.as_ref().map(|c| c.hourly_rate).unwrap_or(0.0);
                println!("  {:<16} {:<24} ${:.3}/hr", record.id, record.name, rate);
            }
            println!(
                "Burning ${:.2}/hr across {} pods (${:.2} so far)",
                wallet.burn.hourly, wallet.burn.pods, wallet.burn.accrued
            );
            if wallet.burn.pods > 0 {
                println!("Pods are still running. Terminate them with `podctl terminate <pod>` when done.");
            }
            Ok(())
        }
        Commands::Terminate { pod, yes } => {
            let pod_id = manager.select_pod(pod.as_deref())?;
            if !yes && !confirm(&format!("Terminate pod {}?", pod_id)).await? {
                println!("Aborted");
                return Ok(());
            }
            manager.terminate(&pod_id).await?;
            println!("Pod {} terminated", pod_id);
            Ok(())
        }
    }
}

async fn run_connect(manager: &PodManager, pod_id: &str, watch: bool) -> Result<()> {
    let tunnels = manager.connect_session(pod_id).await?;
    for tunnel in &tunnels {
        let note = if tunnel.relocated { " (relocated)" } else { "" };
        println!(
            "  {:<6} http://localhost:{} -> pod:{}{}",
            tunnel.service, tunnel.local_port, tunnel.remote_port, note
        );
    }
    let mut cost = manager.spawn_cost_monitor();

    if watch {
        let mut watcher = manager.watch(pod_id).await?;
        follow(&mut watcher).await;
        watcher.cancel().await;
    } else {
        println!("Connected to {} (Ctrl-C to disconnect)", pod_id);
        tokio::signal::ctrl_c().await?;
    }

    cost.stop().await;
    manager.disconnect_session(pod_id).await;
    println!("Disconnected. Pod {} is still running and billing.", pod_id);
    Ok(())
}

/// Print log lines until Ctrl-C or until the connection is gone for good
async fn follow(watcher: &mut LogWatcher) {
    let path = watcher.path().to_string();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = watcher.next() => match event {
                Some(LogEvent::Line(line)) => println!("{}", line),
                Some(LogEvent::ConnectionLost) => {
                    warn!("Lost the connection while following {}", path);
                    break;
                }
                None => {
                    debug!("Log follow ended");
                    let _ = tokio::signal::ctrl_c().await;
                    break;
                }
            }
        }
    }
}

async fn run_render(manager: &PodManager, pod_id: &str, file: &Path) -> Result<()> {
    println!("Uploading {} to pod {}", file.display(), pod_id);
    let mut process = manager.render(pod_id, file).await?;

    let mut stdout = tokio::io::stdout();
    let mut exit_code = None;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("Render interrupted, closing the remote process");
                process.close();
                break;
            }
            msg = process.recv() => match msg {
                Some(ProcessOutput::Stdout(data)) | Some(ProcessOutput::Stderr(data)) => {
                    stdout.write_all(&data).await?;
                    stdout.flush().await?;
                }
                Some(ProcessOutput::Exit(code)) => {
                    exit_code = code;
                    break;
                }
                None => break,
            }
        }
    }

    match exit_code {
        Some(0) => {
            println!("Render complete. Fetch the frames with `podctl pull --remote <dir>`.");
            Ok(())
        }
        Some(code) => Err(PodError::RemoteCommand {
            code,
            stderr: "blender render failed".to_string(),
        }
        .into()),
        None => Err(anyhow::anyhow!("render on pod {} ended without an exit status", pod_id)),
    }
}

async fn run_shell(manager: &PodManager, pod_id: &str) -> Result<()> {
    let term = std::env::var("TERM").unwrap_or_else(|_| "xterm-256color".to_string());
    let cols = env_dimension("COLUMNS", 80);
    let rows = env_dimension("LINES", 24);
    let mut shell = manager.shell(pod_id, &term, cols, rows).await?;

    let input = shell.input.clone();
    let stdin_task = tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = [0u8; 1024];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) | Err(_) => {
                    let _ = input.send(ShellInput::Eof).await;
                    break;
                }
                Ok(n) => {
                    if input.send(ShellInput::Data(buf[..n].to_vec())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();
    let mut exit_code = None;
    while let Some(output) = shell.output.recv().await {
        match output {
            ProcessOutput::Stdout(data) => {
                stdout.write_all(&data).await?;
                stdout.flush().await?;
            }
            ProcessOutput::Stderr(data) => {
                stderr.write_all(&data).await?;
                stderr.flush().await?;
            }
            ProcessOutput::Exit(code) => {
                exit_code = code;
                break;
            }
        }
    }
    stdin_task.abort();

    match exit_code {
        Some(code) if code != 0 => std::process::exit(code as i32),
        _ => Ok(()),
    }
}

fn env_dimension(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

async fn confirm(question: &str) -> Result<bool> {
    print!("{} [y/N] ", question);
    std::io::Write::flush(&mut std::io::stdout())?;
    let mut line = String::new();
    BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
    Ok(matches!(line.trim(), "y" | "Y" | "yes"))
}

/// Render the events the terminal user cares about
async fn print_events(mut rx: broadcast::Receiver<PodEvent>) {
    loop {
        match rx.recv().await {
            Ok(PodEvent::StateChanged { pod_id, from, to }) => {
                println!("[{}] {} -> {}", pod_id, from, to);
            }
            Ok(PodEvent::ConnectAttempt {
                pod_id,
                attempt,
                max_attempts,
                elapsed,
                error: Some(error),
            }) => {
                println!(
                    "[{}] connect attempt {}/{} failed after {:.1}s: {}",
                    pod_id,
                    attempt,
                    max_attempts,
                    elapsed.as_secs_f64(),
                    error
                );
            }
            Ok(PodEvent::TunnelStatus {
                pod_id,
                service,
                local_port,
                status,
                ..
            }) => {
                println!("[{}] tunnel {} on :{} is {:?}", pod_id, service, local_port, status);
            }
            Ok(PodEvent::TelemetryStale {
                pod_id,
                consecutive_failures,
            }) => {
                println!(
                    "[{}] telemetry stale after {} failed samples",
                    pod_id, consecutive_failures
                );
            }
            Ok(PodEvent::CostWarning {
                aggregate_hourly,
                threshold,
                pods,
            }) => {
                println!(
                    "Burning ${:.2}/hr across {} pods (threshold ${:.2}/hr)",
                    aggregate_hourly, pods, threshold
                );
            }
            Ok(PodEvent::TerminateFailed { pod_id, error }) => {
                println!("[{}] TERMINATE NOT CONFIRMED, pod may still bill: {}", pod_id, error);
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => debug!("Event printer skipped {} events", n),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn print_templates(templates: &TemplateRegistry) {
    for tier in templates.iter() {
        let ports: Vec<String> = tier
            .ports
            .iter()
            .map(|(name, port)| format!("{}:{}", name, port))
            .collect();
        println!(
            "  {:<12} {:<48} {:<9} {}",
            tier.key,
            tier.description,
            tier.cloud_type.as_str(),
            ports.join(", ")
        );
    }
}

fn print_pods(manager: &PodManager) {
    let pods = manager.list();
    if pods.is_empty() {
        println!("No tracked pods");
        return;
    }
    for record in pods {
        let endpoint = record
            .endpoint()
            .map(|(host, port)| format!("{}:{}", host, port))
            .unwrap_or_else(|| "-".to_string());
        let pending = if record.terminate_pending {
            " (terminate pending)"
        } else {
            ""
        };
        println!(
            "  {:<16} {:<12} {:<13} {}{}",
            record.id,
            record.tier,
            record.state.label(),
            endpoint,
            pending
        );
    }
}

fn print_snapshot(pod_id: &str, snapshot: &ResourceSnapshot) {
    println!("Pod {}", pod_id);
    if let Some(ref gpu) = snapshot.gpu_name {
        println!(
            "  GPU   {} at {:.0}%",
            gpu,
            snapshot.gpu_util_percent.unwrap_or(0.0)
        );
    }
    if let (Some(used), Some(total)) = (snapshot.vram_used_mb, snapshot.vram_total_mb) {
        println!("  VRAM  {} / {} MiB", used, total);
    }
    if let Some(pct) = snapshot.ram_percent() {
        println!("  RAM   {:.0}%", pct);
    }
    if let Some(pct) = snapshot.disk_percent() {
        println!("  Disk  {:.0}%", pct);
    }
}
