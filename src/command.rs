use std::fmt;
use std::io::ErrorKind;
use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::info;

use crate::domain::Stage;
use crate::error::CtatError;
use crate::stage::{Completed, StageGuard, StageOutcome};

const OUTPUT_TAIL_LINES: usize = 40;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<Utf8PathBuf>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: &Utf8Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn render(&self) -> String {
        let mut parts: Vec<String> = self
            .env
            .iter()
            .map(|(key, value)| format!("{key}={}", quote(value)))
            .collect();
        parts.push(quote(&self.program));
        parts.extend(self.args.iter().map(|arg| quote(arg)));
        let line = parts.join(" ");
        match &self.cwd {
            Some(dir) => format!("(cd {} && {line})", quote(dir.as_str())),
            None => line,
        }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

fn quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=+:,@%".contains(c))
    {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
    /// Stdout followed by stderr.
    pub output: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn status_text(&self) -> String {
        match self.code {
            Some(code) => format!("exit status {code}"),
            None => "terminated by signal".to_string(),
        }
    }

    pub fn tail(&self) -> String {
        let lines: Vec<&str> = self.output.lines().collect();
        let start = lines.len().saturating_sub(OUTPUT_TAIL_LINES);
        lines[start..].join("\n")
    }
}

pub trait CommandRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CtatError>;
}

/// Runs commands with `std::process`, without a timeout.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CtatError> {
        let mut command = Command::new(&spec.program);
        command.args(&spec.args);
        if let Some(dir) = &spec.cwd {
            command.current_dir(dir.as_std_path());
        }
        for (key, value) in &spec.env {
            command.env(key, value);
        }
        let output = command.output().map_err(|err| match err.kind() {
            ErrorKind::NotFound => CtatError::MissingTool(spec.program.clone()),
            _ => CtatError::ExternalCommand {
                command: spec.render(),
                status: "not started".to_string(),
                output: err.to_string(),
            },
        })?;
        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(CommandOutput {
            code: output.status.code(),
            output: combined,
        })
    }
}

pub trait ExternalStage {
    fn stage(&self) -> Stage;
    fn key(&self) -> String;
    fn marker_dir(&self) -> &Utf8Path;
    fn command(&self) -> Result<CommandSpec, CtatError>;

    fn check_preconditions(&self) -> Result<(), CtatError> {
        Ok(())
    }

    /// Runs after the preconditions hold, right before the command.
    fn prepare(&self) -> Result<(), CtatError> {
        Ok(())
    }

    fn validate_output(&self, _output: &CommandOutput) -> Result<(), CtatError> {
        Ok(())
    }

    fn describe(&self) -> String {
        format!("{} of {}", self.stage(), self.key())
    }
}

pub fn run_external_stage(
    stage: &dyn ExternalStage,
    runner: &dyn CommandRunner,
    force: bool,
) -> Result<StageOutcome<CommandOutput>, CtatError> {
    let guard = StageGuard::new(stage.marker_dir(), &stage.key(), stage.stage());
    guard.run(force, || {
        stage.check_preconditions()?;
        stage.prepare()?;
        let spec = stage.command()?;
        info!(stage = %stage.stage(), command = %spec, "running");
        let output = runner.run(&spec)?;
        if !output.success() {
            return Err(CtatError::ExternalCommand {
                command: spec.render(),
                status: output.status_text(),
                output: output.tail(),
            });
        }
        stage.validate_output(&output)?;
        Ok(Completed::new(output)
            .detail(stage.describe())
            .output(spec.render()))
    })
}
