//! Bare-executable allow-listing for process creation.
//!
//! Two independent surfaces live here. The fixed resolvers name the
//! handful of executables this tool spawns for itself (shell, node
//! runtime, package manager), with the platform quirk that on Windows
//! the npm family ships as `.cmd` shims that must be launched through
//! the shell. `is_command_allowed` is the gate for externally sourced
//! command tokens: exact-match, case-insensitive, single bare names
//! only — it is not a command-line validator.

use tracing::debug;

/// Broader allow-list used to gate externally sourced command tokens.
/// Bare executable names only; paths and arguments never match.
const ALLOWED_COMMANDS: &[&str] = &[
    "bash", "cargo", "cmd", "dotnet", "git", "java", "mvn", "node", "npm", "npx", "pip", "pwsh",
    "python", "python3", "sh", "tsc", "tsp",
];

/// Shell executable for this platform.
pub fn shell_command() -> &'static str {
    if cfg!(windows) { "cmd" } else { "sh" }
}

/// The shell's command-switch token (`cmd /c ...` vs `sh -c ...`).
pub fn shell_command_switch() -> &'static str {
    if cfg!(windows) { "/c" } else { "-c" }
}

/// JavaScript runtime executable.
pub fn node_command() -> &'static str {
    "node"
}

/// Package-manager invocation as `(program, leading_args)`.
///
/// On Windows `npm` is a `.cmd` shim, which cannot be spawned directly
/// by `CreateProcess`; it is routed through the shell token instead.
pub fn npm_command() -> (&'static str, &'static [&'static str]) {
    if cfg!(windows) {
        (shell_command(), &["/c", "npm.cmd"])
    } else {
        ("npm", &[])
    }
}

/// Package-runner invocation as `(program, leading_args)`, with the same
/// platform split as [`npm_command`].
pub fn npx_command() -> (&'static str, &'static [&'static str]) {
    if cfg!(windows) {
        (shell_command(), &["/c", "npx.cmd"])
    } else {
        ("npx", &[])
    }
}

/// Returns true if `token` is an allow-listed bare executable name.
///
/// Matching is case-insensitive and exact. Tokens that are empty,
/// whitespace-only, contain whitespace, or contain a path separator are
/// rejected outright — `node script.js`, `/usr/bin/node`, and `./node`
/// all fail even though `node` alone is accepted.
pub fn is_command_allowed(token: &str) -> bool {
    if token.trim().is_empty() {
        return false;
    }
    if token.chars().any(char::is_whitespace) || token.contains('/') || token.contains('\\') {
        debug!(token, "command token rejected: not a bare executable name");
        return false;
    }
    let allowed = ALLOWED_COMMANDS
        .iter()
        .any(|cmd| cmd.eq_ignore_ascii_case(token));
    if !allowed {
        debug!(token, "command token rejected: not allow-listed");
    }
    allowed
}
