//! Settings for a remediation session.
//!
//! Plain data only — defaults first, then an optional TOML file layered
//! on top. Anything operational (polling cadence, iteration budget,
//! process timeout) lives here so callers, not components, own the
//! bounds.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::command_safety::npx_command;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Base URL of the remote agents service.
    pub agents_endpoint: String,
    /// API version query parameter sent with every request.
    pub api_version: String,
    /// Model the remote agent is created with.
    pub model: String,
    pub agent_name: String,
    /// System instructions for the remote agent; also the preamble of
    /// every fix prompt.
    pub agent_instructions: String,
    /// Spec build invocation as argv tokens; the first token must pass
    /// the command allow-list.
    pub build_command: Vec<String>,
    /// Cadence for run-status polling.
    pub run_poll_interval_ms: u64,
    /// Upper bound on waiting for a run to reach a terminal state.
    pub run_max_wait_secs: u64,
    /// Iteration budget for the external driver loop.
    pub max_fix_iterations: u32,
    /// Timeout for each spawned subprocess.
    pub process_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            agents_endpoint: String::new(),
            api_version: "2024-12-01".to_string(),
            model: "gpt-4o".to_string(),
            agent_name: "Spec Fix Agent".to_string(),
            agent_instructions: "You are an expert in TypeSpec and API specifications. \
                Use the available tools to inspect spec files, then return the complete \
                corrected file content for each fix. Modify only what the fix requires."
                .to_string(),
            build_command: {
                let (program, leading) = npx_command();
                let mut command = vec![program.to_string()];
                command.extend(leading.iter().map(|arg| (*arg).to_string()));
                command.extend(["tsp", "compile", "."].map(str::to_string));
                command
            },
            run_poll_interval_ms: 2_000,
            run_max_wait_secs: 300,
            max_fix_iterations: 5,
            process_timeout_secs: 600,
        }
    }
}

impl Settings {
    /// Defaults, optionally overlaid with a TOML file.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path).map_err(|e| Error::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        toml::from_str(&content).map_err(|e| Error::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    pub fn run_poll_interval(&self) -> Duration {
        Duration::from_millis(self.run_poll_interval_ms)
    }

    pub fn run_max_wait(&self) -> Duration {
        Duration::from_secs(self.run_max_wait_secs)
    }

    pub fn process_timeout(&self) -> Duration {
        Duration::from_secs(self.process_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_are_usable() {
        let settings = Settings::default();
        assert_eq!(settings.build_command[0], npx_command().0);
        assert!(settings.build_command.contains(&"compile".to_string()));
        assert!(settings.max_fix_iterations > 0);
        assert_eq!(settings.run_poll_interval(), Duration::from_secs(2));
    }

    #[test]
    fn file_overrides_defaults_field_by_field() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("specfix.toml");
        std::fs::write(
            &path,
            r#"
agents_endpoint = "https://agents.example.net"
max_fix_iterations = 2
run_poll_interval_ms = 50
"#,
        )
        .unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.agents_endpoint, "https://agents.example.net");
        assert_eq!(settings.max_fix_iterations, 2);
        assert_eq!(settings.run_poll_interval(), Duration::from_millis(50));
        // Untouched fields keep their defaults.
        assert_eq!(settings.model, "gpt-4o");
    }

    #[test]
    fn malformed_file_reports_the_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("specfix.toml");
        std::fs::write(&path, "max_fix_iterations = \"lots\"").unwrap();

        let err = Settings::load(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("specfix.toml"), "got: {err}");
    }

    #[test]
    fn missing_path_means_defaults() {
        let settings = Settings::load(None).unwrap();
        assert_eq!(settings.agent_name, "Spec Fix Agent");
    }
}
