use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use keyswarm::anthropic::{AnthropicClient, AnthropicInvoker};
use keyswarm::breaker::CircuitBreaker;
use keyswarm::cli::{BacklogArgs, Cli, Command};
use keyswarm::config::KeyswarmConfig;
use keyswarm::git::GitManager;
use keyswarm::jobs::{FileCandidateSource, FileSink};
use keyswarm::orchestrator::{MissionEnd, MissionOrchestrator};
use keyswarm::pool::{CredentialPool, FailoverInvoker, Invoker};
use keyswarm::stop::StopReason;
use keyswarm::ui::{self, MissionProgress};

/// Exit code when a mission halts on a systemic outage.
const EXIT_OUTAGE: u8 = 2;

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "keyswarm=debug" } else { "keyswarm=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn build_failover(config: &KeyswarmConfig) -> Result<Arc<FailoverInvoker<AnthropicInvoker>>> {
    let keys = config.require_keys()?;
    let pool = Arc::new(CredentialPool::new(keys, config.pool_policy()));
    let breaker = Arc::new(CircuitBreaker::new(config.lockdown_threshold));
    let invoker = AnthropicInvoker::new(AnthropicClient::new()?, config.probe_model.as_str());
    info!(credentials = pool.count(), "credential pool ready");
    Ok(Arc::new(FailoverInvoker::new(invoker, pool, breaker)))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = KeyswarmConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Command::Run {
            backlog,
            workers,
            commit,
        } => run(config, &backlog, workers, commit).await,
        Command::Status { backlog } => status(config, &backlog).await,
        Command::Probe => probe(config).await,
    }
}

async fn run(
    mut config: KeyswarmConfig,
    backlog: &BacklogArgs,
    workers: Option<usize>,
    commit: bool,
) -> Result<ExitCode> {
    backlog.apply(&mut config);
    if let Some(workers) = workers {
        config.workers = workers;
    }
    config.auto_commit |= commit;
    config.validate()?;

    let failover = build_failover(&config)?;
    let source = Arc::new(FileCandidateSource::new(
        &config.jobs_file,
        &config.output_dir,
        config.model.as_str(),
        config.max_tokens,
    ));
    let sink = Arc::new(FileSink::new(&config.output_dir));
    let orchestrator = MissionOrchestrator::new(failover, source, sink, config.mission_config());

    let progress = MissionProgress::start("starting mission");
    orchestrator.start_mission();

    let wait = orchestrator.wait();
    tokio::pin!(wait);
    let mut tick = tokio::time::interval(Duration::from_millis(500));
    let mut stopping = false;
    let mut was_locked = false;

    let report = loop {
        tokio::select! {
            report = &mut wait => break report,
            signal = tokio::signal::ctrl_c(), if !stopping => {
                if let Err(e) = signal {
                    warn!(error = %e, "could not listen for Ctrl-C");
                }
                stopping = true;
                progress.note("stop requested; letting in-flight work finish");
                orchestrator.stop_mission();
            }
            _ = tick.tick() => {
                let status = orchestrator.status();
                let locked = orchestrator.is_locked();
                if locked != was_locked {
                    progress.note(if locked {
                        "breaker in LOCKDOWN; workers paused until a probe succeeds"
                    } else {
                        "breaker healthy; workers resumed"
                    });
                    was_locked = locked;
                }
                progress.update(&status);
            }
        }
    };

    let report = report.context("mission task failed")?;
    progress.complete(&report);
    progress.print_report(&report);

    if config.auto_commit && report.done() > 0 {
        let git = GitManager::open(Path::new("."))?;
        match git.commit_outputs(&config.output_dir, &report)? {
            Some(hash) => info!(commit = %hash, branch = %git.current_branch()?, "outputs committed"),
            None => info!("no new outputs to commit"),
        }
    }

    Ok(match report.outcome {
        MissionEnd::Stopped(StopReason::SystemicOutage(_)) => ExitCode::from(EXIT_OUTAGE),
        _ => ExitCode::SUCCESS,
    })
}

async fn status(mut config: KeyswarmConfig, backlog: &BacklogArgs) -> Result<ExitCode> {
    backlog.apply(&mut config);
    let source = FileCandidateSource::new(
        &config.jobs_file,
        &config.output_dir,
        config.model.as_str(),
        config.max_tokens,
    );

    let pending = source.pending().await?;
    let missing_prompt = pending
        .iter()
        .filter(|job| job.prompt.as_deref().is_none_or(|p| p.trim().is_empty()))
        .count();
    println!("Jobs file:  {}", config.jobs_file.display());
    println!("Output dir: {}", config.output_dir.display());
    println!("Pending:    {} ({missing_prompt} without a prompt)", pending.len());

    match config.require_keys() {
        Ok(keys) => {
            let pool = CredentialPool::new(keys, config.pool_policy());
            println!("Keys:       {}", pool.len());
            ui::print_credentials(&pool.snapshot());
        }
        Err(e) => println!("Keys:       none ({e})"),
    }
    Ok(ExitCode::SUCCESS)
}

async fn probe(config: KeyswarmConfig) -> Result<ExitCode> {
    let failover = build_failover(&config)?;
    let payload = failover.invoker().probe_payload();
    let limit = Duration::from_secs(config.probe_timeout_secs);

    let mut healthy = 0;
    for credential in failover.pool().live() {
        match failover.invoke_with(&credential, &payload, limit).await {
            Ok(_) => {
                healthy += 1;
                println!("  {credential}: ok");
            }
            Err(e) => println!("  {credential}: {e}"),
        }
    }
    ui::print_credentials(&failover.pool().snapshot());

    Ok(if healthy > 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
