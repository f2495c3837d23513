//! External process execution.
//!
//! Two surfaces start processes: [`ProcessRuntime`] for one-shot commands
//! and [`ProcessBuilder`] for configured commands and pipelines. Errors are
//! `io::Error`; a refused call carries the prologue error as its payload.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use tracing::{debug, warn};

use crate::loader::UnitHandle;
use crate::unit::CodeUnit;
use crate::{Result, Runtime};

pub const RUNTIME_UNIT: &str = "process.ProcessRuntime";
pub const BUILDER_UNIT: &str = "process.ProcessBuilder";

pub fn runtime_unit() -> CodeUnit {
    CodeUnit::new(RUNTIME_UNIT).methods(["exec", "exec_args", "exec_with", "available_processors"])
}

pub fn builder_unit() -> CodeUnit {
    CodeUnit::new(BUILDER_UNIT).methods(["start", "start_pipeline"])
}

fn enter(unit: &UnitHandle, method: &str) -> io::Result<()> {
    unit.enter(method).map_err(io::Error::other)
}

fn empty_command() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, "empty command")
}

fn command<S: AsRef<str>>(args: &[S]) -> io::Result<Command> {
    let (program, rest) = args.split_first().ok_or_else(empty_command)?;
    let mut command = Command::new(program.as_ref());
    command.args(rest.iter().map(AsRef::as_ref));
    Ok(command)
}

/// Runs commands in child processes.
#[derive(Debug, Clone)]
pub struct ProcessRuntime {
    unit: UnitHandle,
}

impl ProcessRuntime {
    pub fn new(runtime: &Runtime) -> Result<Self> {
        Ok(Self {
            unit: runtime.load(RUNTIME_UNIT)?,
        })
    }

    /// Run `command`, split on whitespace.
    pub fn exec(&self, command: &str) -> io::Result<Child> {
        enter(&self.unit, "exec")?;
        let args: Vec<&str> = command.split_whitespace().collect();
        spawn(&args, None, None)
    }

    /// Run a program with explicit arguments. The first element is the
    /// program.
    pub fn exec_args<S: AsRef<str>>(&self, args: &[S]) -> io::Result<Child> {
        enter(&self.unit, "exec_args")?;
        spawn(args, None, None)
    }

    /// Run with an optional replacement environment and working directory.
    ///
    /// When `env` is given the child sees exactly those variables.
    pub fn exec_with<S: AsRef<str>>(
        &self,
        args: &[S],
        env: Option<&[(&str, &str)]>,
        dir: Option<&Path>,
    ) -> io::Result<Child> {
        enter(&self.unit, "exec_with")?;
        spawn(args, env, dir)
    }

    /// Not gated.
    pub fn available_processors(&self) -> io::Result<usize> {
        enter(&self.unit, "available_processors")?;
        Ok(std::thread::available_parallelism()?.get())
    }
}

fn spawn<S: AsRef<str>>(
    args: &[S],
    env: Option<&[(&str, &str)]>,
    dir: Option<&Path>,
) -> io::Result<Child> {
    let mut command = command(args)?;
    if let Some(env) = env {
        command.env_clear();
        command.envs(env.iter().copied());
    }
    if let Some(dir) = dir {
        command.current_dir(dir);
    }
    command.stdout(Stdio::piped()).stderr(Stdio::piped());
    let child = command.spawn()?;
    debug!(program = args[0].as_ref(), pid = child.id(), "process started");
    Ok(child)
}

/// A command to start, configured step by step.
#[derive(Debug, Clone)]
pub struct ProcessBuilder {
    unit: UnitHandle,
    command: Vec<String>,
    env: Vec<(String, String)>,
    clear_env: bool,
    dir: Option<PathBuf>,
    capture: bool,
}

impl ProcessBuilder {
    pub fn new<I, S>(runtime: &Runtime, command: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Ok(Self {
            unit: runtime.load(BUILDER_UNIT)?,
            command: command.into_iter().map(Into::into).collect(),
            env: Vec::new(),
            clear_env: false,
            dir: None,
            capture: false,
        })
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Start from an empty environment.
    pub fn env_clear(mut self) -> Self {
        self.clear_env = true;
        self.env.clear();
        self
    }

    /// Pipe stdout and stderr back to the caller instead of inheriting them.
    pub fn capture_output(mut self) -> Self {
        self.capture = true;
        self
    }

    fn to_command(&self) -> io::Result<Command> {
        let mut command = command(&self.command)?;
        if self.clear_env {
            command.env_clear();
        }
        command.envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        if let Some(dir) = &self.dir {
            command.current_dir(dir);
        }
        if self.capture {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
        }
        Ok(command)
    }

    pub fn start(&self) -> io::Result<Child> {
        enter(&self.unit, "start")?;
        let child = self.to_command()?.spawn()?;
        debug!(program = %self.command[0], pid = child.id(), "process started");
        Ok(child)
    }

    /// Start every builder, feeding each process's stdout into the next
    /// one's stdin. The last process keeps its own output settings.
    pub fn start_pipeline(runtime: &Runtime, builders: &[ProcessBuilder]) -> io::Result<Vec<Child>> {
        let unit = runtime.load(BUILDER_UNIT).map_err(io::Error::other)?;
        enter(&unit, "start_pipeline")?;

        let mut commands = builders
            .iter()
            .map(ProcessBuilder::to_command)
            .collect::<io::Result<Vec<_>>>()?;
        let last = commands.len().saturating_sub(1);

        let mut children: Vec<Child> = Vec::with_capacity(commands.len());
        for (i, command) in commands.iter_mut().enumerate() {
            if let Some(stdout) = children.last_mut().and_then(|prev| prev.stdout.take()) {
                command.stdin(Stdio::from(stdout));
            }
            if i < last {
                command.stdout(Stdio::piped());
            }
            match command.spawn() {
                Ok(child) => children.push(child),
                Err(e) => {
                    abort_pipeline(children);
                    return Err(e);
                }
            }
        }
        debug!(stages = children.len(), "pipeline started");
        Ok(children)
    }
}

/// Stop the stages of a pipeline that failed to start.
fn abort_pipeline(children: Vec<Child>) {
    for mut child in children {
        if let Err(e) = child.kill() {
            debug!(pid = child.id(), error = %e, "pipeline stage already exited");
        }
        if let Err(e) = child.wait() {
            warn!(pid = child.id(), error = %e, "cannot reap pipeline stage");
        }
    }
}
