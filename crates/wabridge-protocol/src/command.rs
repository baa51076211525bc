//! Helper command line building.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Command build error.
#[derive(Debug, Error)]
pub enum CommandBuildError {
    #[error("Helper command cannot be parsed: {0}")]
    InvalidBase(String),
    #[error("Helper command is empty after parsing")]
    EmptyCommand,
    #[error("Executable not found: {0}")]
    NotFound(String),
}

/// Parsed command parts (program + args).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandParts {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandParts {
    /// Create new command parts.
    #[must_use]
    pub const fn new(program: String, args: Vec<String>) -> Self {
        Self { program, args }
    }

    /// Resolve the program to an absolute path.
    ///
    /// # Errors
    /// Returns error if the executable is not found.
    pub async fn into_resolved(self) -> Result<(PathBuf, Vec<String>), CommandBuildError> {
        let Self { program, args } = self;
        let executable = resolve_executable_path(&program)
            .await
            .ok_or(CommandBuildError::NotFound(program))?;
        Ok((executable, args))
    }
}

/// Builder for the helper command.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    /// Base command line, split with shell quoting rules.
    pub base: String,
}

impl CommandBuilder {
    /// Create a new command builder.
    #[must_use]
    pub fn new<S: Into<String>>(base: S) -> Self {
        Self { base: base.into() }
    }

    /// Build the program and argument list.
    ///
    /// # Errors
    /// Returns error if the command line is invalid or empty.
    pub fn build(&self) -> Result<CommandParts, CommandBuildError> {
        let mut parts = split_command_line(&self.base)?;

        if parts.is_empty() {
            return Err(CommandBuildError::EmptyCommand);
        }

        let program = parts.remove(0);
        Ok(CommandParts::new(program, parts))
    }
}

/// Resolve an executable by name.
///
/// Absolute paths are used as-is when they exist; anything else is looked
/// up on `PATH`.
pub async fn resolve_executable_path(executable: &str) -> Option<PathBuf> {
    if executable.trim().is_empty() {
        return None;
    }

    let path = Path::new(executable);
    if path.is_absolute() {
        return path.is_file().then(|| path.to_path_buf());
    }

    let executable = executable.to_string();
    tokio::task::spawn_blocking(move || which::which(executable))
        .await
        .ok()
        .and_then(Result::ok)
}

fn split_command_line(input: &str) -> Result<Vec<String>, CommandBuildError> {
    #[cfg(windows)]
    {
        Ok(winsplit::split(input))
    }

    #[cfg(not(windows))]
    {
        shlex::split(input).ok_or_else(|| CommandBuildError::InvalidBase(input.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_with_quotes() {
        let parts = CommandBuilder::new("node 'my helper.js' --quiet")
            .build()
            .unwrap();
        assert_eq!(parts.program, "node");
        assert_eq!(parts.args, vec!["my helper.js", "--quiet"]);
    }

    #[test]
    fn test_empty_command() {
        assert!(matches!(
            CommandBuilder::new("   ").build(),
            Err(CommandBuildError::EmptyCommand)
        ));
    }

    #[cfg(not(windows))]
    #[test]
    fn test_unbalanced_quotes() {
        assert!(matches!(
            CommandBuilder::new("node 'helper.js").build(),
            Err(CommandBuildError::InvalidBase(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_executable() {
        let parts = CommandParts::new("definitely-not-a-real-helper-binary".into(), vec![]);
        assert!(matches!(
            parts.into_resolved().await,
            Err(CommandBuildError::NotFound(_))
        ));
    }
}
