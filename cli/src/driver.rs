//! The external driver loop: build → analyze → fix → apply → rebuild.
//!
//! The orchestrator exposes single-iteration primitives and holds no
//! counter; this loop owns the bound, taken from configuration. It stops
//! on a clean build, on an agent reply with nothing applicable, or when
//! the iteration budget runs out.

use std::path::Path;

use specfix_core::config::Settings;
use specfix_core::error::{Error, Result};
use specfix_core::orchestrator::{FixOrchestrator, parse_file_updates};
use specfix_core::process::{ProcessExecutor, ProcessOutput};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Why the remediation loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// The spec builds cleanly.
    Clean,
    /// The agent's reply contained no applicable file updates.
    NoApplicableFixes,
    /// The configured iteration budget was exhausted with errors
    /// remaining.
    BudgetExhausted,
}

/// Summary of a driver invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverOutcome {
    /// Fix iterations executed (a clean initial build is zero).
    pub iterations: u32,
    pub stop: LoopStop,
}

/// Run the bounded remediation loop against `spec_dir`.
pub async fn run(
    orchestrator: &mut FixOrchestrator,
    executor: &ProcessExecutor,
    settings: &Settings,
    spec_dir: &Path,
    cancel: &CancellationToken,
) -> Result<DriverOutcome> {
    let mut build = run_build(executor, settings, spec_dir, cancel).await?;
    if build.success() {
        info!("spec already builds cleanly, nothing to remediate");
        return Ok(DriverOutcome {
            iterations: 0,
            stop: LoopStop::Clean,
        });
    }

    orchestrator.initialize_environment(cancel).await?;

    for iteration in 1..=settings.max_fix_iterations {
        info!(
            iteration,
            max = settings.max_fix_iterations,
            "starting fix iteration"
        );

        let fixes = orchestrator
            .analyze_errors(&build.combined_output(), cancel)
            .await?;
        let reply = orchestrator.fix_code(&fixes, cancel).await?;

        let updates = parse_file_updates(&reply);
        if updates.is_empty() {
            warn!(iteration, "agent reply contained no applicable file updates");
            return Ok(DriverOutcome {
                iterations: iteration,
                stop: LoopStop::NoApplicableFixes,
            });
        }
        info!(iteration, files = updates.len(), "applying proposed updates");
        orchestrator.apply_updates(&updates, cancel).await?;

        build = run_build(executor, settings, spec_dir, cancel).await?;
        if build.success() {
            info!(iteration, "spec builds cleanly after fixes");
            return Ok(DriverOutcome {
                iterations: iteration,
                stop: LoopStop::Clean,
            });
        }
    }

    warn!(
        max = settings.max_fix_iterations,
        "iteration budget exhausted with build errors remaining"
    );
    Ok(DriverOutcome {
        iterations: settings.max_fix_iterations,
        stop: LoopStop::BudgetExhausted,
    })
}

async fn run_build(
    executor: &ProcessExecutor,
    settings: &Settings,
    spec_dir: &Path,
    cancel: &CancellationToken,
) -> Result<ProcessOutput> {
    let [command, args @ ..] = settings.build_command.as_slice() else {
        return Err(Error::validation(
            "build_command",
            "build command cannot be empty",
        ));
    };
    executor.execute(command, args, Some(spec_dir), cancel).await
}

#[cfg(all(test, unix))]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use pretty_assertions::assert_eq;
    use specfix_core::agents::client::AgentConfig;
    use specfix_core::agents::conversation::ConversationManager;
    use specfix_core::agents::lifecycle::AgentManager;
    use specfix_core::agents::testing::MockAgentsClient;
    use specfix_core::analysis::LogPatternAnalyzer;
    use specfix_core::spec_files::SpecFileStore;
    use specfix_core::tools::ToolDispatcher;
    use specfix_core::validation::validate_and_create;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _spec: TempDir,
        _out: TempDir,
        spec_dir: std::path::PathBuf,
        client: Arc<MockAgentsClient>,
        orchestrator: FixOrchestrator,
        settings: Settings,
    }

    fn fixture(build_script: &str) -> Fixture {
        let spec = TempDir::new().unwrap();
        std::fs::write(spec.path().join("main.tsp"), "model Main {}").unwrap();
        let out = TempDir::new().unwrap();
        let ctx = validate_and_create(
            spec.path().to_str().unwrap(),
            "",
            out.path().to_str().unwrap(),
        )
        .unwrap();
        let spec_dir = ctx.local_spec_dir().unwrap().to_path_buf();
        let store = Arc::new(SpecFileStore::for_local(&ctx).unwrap());
        let client = Arc::new(MockAgentsClient::new());
        let orchestrator = FixOrchestrator::new(
            Arc::new(LogPatternAnalyzer::new()),
            store.clone(),
            ConversationManager::new(
                client.clone(),
                ToolDispatcher::new(store),
                Duration::from_millis(10),
                Duration::from_millis(500),
            ),
            Arc::new(AgentManager::new(
                client.clone(),
                AgentConfig {
                    model: "gpt-4o".to_string(),
                    name: "Spec Fix Agent".to_string(),
                    instructions: "fix".to_string(),
                },
            )),
            specfix_core::prompts::FixPromptFormatter::new("fix instructions"),
        );

        let settings = Settings {
            build_command: vec!["sh".to_string(), "-c".to_string(), build_script.to_string()],
            max_fix_iterations: 2,
            ..Settings::default()
        };

        Fixture {
            _spec: spec,
            _out: out,
            spec_dir,
            client,
            orchestrator,
            settings,
        }
    }

    fn executor() -> ProcessExecutor {
        ProcessExecutor::new(Duration::from_secs(30))
    }

    #[tokio::test]
    async fn clean_initial_build_skips_the_agent_entirely() {
        let mut fx = fixture("exit 0");
        let outcome = run(
            &mut fx.orchestrator,
            &executor(),
            &fx.settings,
            &fx.spec_dir,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(
            outcome,
            DriverOutcome {
                iterations: 0,
                stop: LoopStop::Clean,
            }
        );
        assert_eq!(fx.client.create_agent_calls(), 0);
    }

    #[tokio::test]
    async fn reply_without_updates_stops_the_loop() {
        // Build always fails; the mock agent's default reply has no
        // `### FILE:` sections.
        let mut fx = fixture("echo 'error bad-ref: broken' >&2; exit 1");
        let outcome = run(
            &mut fx.orchestrator,
            &executor(),
            &fx.settings,
            &fx.spec_dir,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.stop, LoopStop::NoApplicableFixes);
        assert_eq!(outcome.iterations, 1);
        assert_eq!(fx.client.create_agent_calls(), 1);
    }

    #[tokio::test]
    async fn failing_build_exhausts_the_iteration_budget() {
        let mut fx = fixture("echo 'error bad-ref: broken' >&2; exit 1");
        fx.client.set_reply(Some(
            "### FILE: main.tsp\n```tsp\nmodel Main { id: string; }\n```\n",
        ));

        let outcome = run(
            &mut fx.orchestrator,
            &executor(),
            &fx.settings,
            &fx.spec_dir,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.stop, LoopStop::BudgetExhausted);
        assert_eq!(outcome.iterations, 2);
        // The proposed content was applied each round.
        let content = std::fs::read_to_string(fx.spec_dir.join("main.tsp")).unwrap();
        assert!(content.contains("id: string;"));
    }

    #[tokio::test]
    async fn fixed_build_stops_clean_after_one_iteration() {
        // Fails until the agent's update lands, then succeeds: the build
        // greps for the fixed marker in the spec file.
        let mut fx = fixture(
            "grep -q 'id: string;' main.tsp || { echo 'error bad-ref: broken' >&2; exit 1; }",
        );
        fx.client.set_reply(Some(
            "### FILE: main.tsp\n```tsp\nmodel Main { id: string; }\n```\n",
        ));

        let outcome = run(
            &mut fx.orchestrator,
            &executor(),
            &fx.settings,
            &fx.spec_dir,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(
            outcome,
            DriverOutcome {
                iterations: 1,
                stop: LoopStop::Clean,
            }
        );
    }

    #[tokio::test]
    async fn empty_build_command_is_rejected() {
        let mut fx = fixture("exit 0");
        fx.settings.build_command.clear();
        let err = run(
            &mut fx.orchestrator,
            &executor(),
            &fx.settings,
            &fx.spec_dir,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("build_command"));
    }
}
