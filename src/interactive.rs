//! Interactive-prompt capability: a small abstraction with two
//! implementations, interactive (reads stdin, writes stderr) and
//! non-interactive (returns the default choice immediately).
//!
//! Detection: `TICKETFLOW_NON_INTERACTIVE == "true"`, or any of the
//! recognized CI environment variables, or stdin not a terminal.

use std::io::{self, IsTerminal, Write};

/// The three choices offered when `start` finds an existing branch that has
/// diverged from its source branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DivergedBranchChoice {
    ReuseAsIs,
    RecreateAtHead,
    Abort,
}

impl DivergedBranchChoice {
    /// The default applied in non-interactive mode.
    pub fn default_choice() -> Self {
        Self::RecreateAtHead
    }
}

const CI_ENV_VARS: &[&str] = &[
    "CI",
    "GITHUB_ACTIONS",
    "GITLAB_CI",
    "CIRCLECI",
    "JENKINS_URL",
    "CONTINUOUS_INTEGRATION",
];

/// Whether prompts should be skipped in favor of the default choice.
pub fn non_interactive() -> bool {
    if std::env::var("TICKETFLOW_NON_INTERACTIVE").as_deref() == Ok("true") {
        return true;
    }
    if CI_ENV_VARS.iter().any(|var| std::env::var(var).is_ok()) {
        return true;
    }
    !io::stdin().is_terminal()
}

pub trait Prompter {
    fn diverged_branch(&self, branch: &str, behind: u32) -> io::Result<DivergedBranchChoice>;
}

/// Reads a single line from stdin, writing the prompt to stderr.
pub struct InteractivePrompter;

impl Prompter for InteractivePrompter {
    fn diverged_branch(&self, branch: &str, behind: u32) -> io::Result<DivergedBranchChoice> {
        let stderr = io::stderr();
        let mut handle = stderr.lock();
        writeln!(
            handle,
            "Branch '{branch}' exists but is {behind} commit(s) behind its source."
        )?;
        writeln!(handle, "  [1] Reuse as-is")?;
        writeln!(handle, "  [2] Recreate at current head of source (default)")?;
        writeln!(handle, "  [3] Abort")?;
        write!(handle, "Choice [2]: ")?;
        handle.flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        Ok(match input.trim() {
            "1" => DivergedBranchChoice::ReuseAsIs,
            "3" => DivergedBranchChoice::Abort,
            _ => DivergedBranchChoice::RecreateAtHead,
        })
    }
}

/// Returns the default choice immediately without touching stdin/stderr.
pub struct NonInteractivePrompter;

impl Prompter for NonInteractivePrompter {
    fn diverged_branch(&self, _branch: &str, _behind: u32) -> io::Result<DivergedBranchChoice> {
        Ok(DivergedBranchChoice::default_choice())
    }
}

pub fn prompter() -> Box<dyn Prompter> {
    if non_interactive() {
        Box::new(NonInteractivePrompter)
    } else {
        Box::new(InteractivePrompter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_interactive_env_var_forces_default() {
        std::env::set_var("TICKETFLOW_NON_INTERACTIVE", "true");
        assert!(non_interactive());
        std::env::remove_var("TICKETFLOW_NON_INTERACTIVE");
    }

    #[test]
    fn ci_indicator_forces_non_interactive() {
        std::env::set_var("CI", "true");
        assert!(non_interactive());
        std::env::remove_var("CI");
    }

    #[test]
    fn non_interactive_prompter_returns_default() {
        let prompter = NonInteractivePrompter;
        let choice = prompter.diverged_branch("250101-000000-x", 3).unwrap();
        assert_eq!(choice, DivergedBranchChoice::RecreateAtHead);
    }
}
