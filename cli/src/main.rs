//! specfix — drive a remote agent to remediate spec build errors.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use specfix_core::agents::client::{AgentConfig, HttpAgentsClient};
use specfix_core::agents::conversation::ConversationManager;
use specfix_core::agents::lifecycle::AgentManager;
use specfix_core::analysis::LogPatternAnalyzer;
use specfix_core::auth::{CredentialOptions, RuntimeEnvironment, create_credential};
use specfix_core::config::Settings;
use specfix_core::orchestrator::FixOrchestrator;
use specfix_core::process::ProcessExecutor;
use specfix_core::prompts::FixPromptFormatter;
use specfix_core::spec_files::SpecFileStore;
use specfix_core::tools::ToolDispatcher;
use specfix_core::validation::validate_and_create;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod driver;

use driver::LoopStop;

#[derive(Debug, Parser)]
#[command(
    name = "specfix",
    about = "Remediate spec build errors with a remote agent",
    version
)]
struct Cli {
    /// Local spec directory, or a repository-relative path when
    /// --commit-id is given.
    spec_location: String,

    /// Commit id pinning a repository-relative spec location. Leave
    /// empty for local directories.
    #[arg(long, default_value = "")]
    commit_id: String,

    /// Directory for generated output and session temp files. Created
    /// if missing.
    #[arg(long)]
    output_dir: String,

    /// Runtime environment selecting the credential strategy
    /// (local | pipeline).
    #[arg(long, default_value = "local")]
    environment: String,

    /// Optional TOML settings file layered over the defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the configured iteration budget.
    #[arg(long)]
    max_iterations: Option<u32>,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let environment: RuntimeEnvironment = cli.environment.parse()?;
    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(max_iterations) = cli.max_iterations {
        settings.max_fix_iterations = max_iterations;
    }

    let ctx = validate_and_create(&cli.spec_location, &cli.commit_id, &cli.output_dir)?;
    let spec_dir = ctx
        .local_spec_dir()
        .context(
            "repository-pinned spec locations need their snapshot materialized by the spec \
             fetch service; run specfix against a local spec directory",
        )?
        .to_path_buf();

    // Ctrl-C cancels every in-flight remote call and tool dispatch.
    let cancel = CancellationToken::new();
    let ctrlc_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, cancelling");
            ctrlc_cancel.cancel();
        }
    });

    let credential = create_credential(
        environment,
        &CredentialOptions {
            timeout: Some(Duration::from_secs(30)),
            client_id: None,
        },
    )?;
    let client = Arc::new(HttpAgentsClient::new(
        &settings.agents_endpoint,
        &settings.api_version,
        credential,
    )?);

    let store = Arc::new(SpecFileStore::for_local(&ctx)?);
    let conversation = ConversationManager::new(
        client.clone(),
        ToolDispatcher::new(store.clone()),
        settings.run_poll_interval(),
        settings.run_max_wait(),
    );
    let agent_manager = Arc::new(AgentManager::new(
        client,
        AgentConfig {
            model: settings.model.clone(),
            name: settings.agent_name.clone(),
            instructions: settings.agent_instructions.clone(),
        },
    ));
    let mut orchestrator = FixOrchestrator::new(
        Arc::new(LogPatternAnalyzer::new()),
        store,
        conversation,
        agent_manager,
        FixPromptFormatter::new(settings.agent_instructions.clone()),
    );
    let executor = ProcessExecutor::new(settings.process_timeout());

    let outcome = driver::run(&mut orchestrator, &executor, &settings, &spec_dir, &cancel).await;

    // Teardown runs even after cancellation or a driver error, on a
    // fresh token so cleanup itself cannot be interrupted mid-flight.
    if let Err(e) = orchestrator.shutdown(&CancellationToken::new()).await {
        error!(error = %e, "teardown failed");
    }

    let outcome = outcome?;
    match outcome.stop {
        LoopStop::Clean => {
            info!(iterations = outcome.iterations, "remediation finished: build is clean");
            Ok(ExitCode::SUCCESS)
        }
        LoopStop::NoApplicableFixes => {
            error!(
                iterations = outcome.iterations,
                "remediation stopped: agent produced no applicable fixes"
            );
            Ok(ExitCode::FAILURE)
        }
        LoopStop::BudgetExhausted => {
            error!(
                iterations = outcome.iterations,
                "remediation stopped: iteration budget exhausted"
            );
            Ok(ExitCode::FAILURE)
        }
    }
}
