use anyhow::{Context, Result};
use log::{debug, info};
use std::{
    fmt,
    io::{BufRead, BufReader, Read},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::mpsc,
    thread,
};

use crate::{errors::Error, output::Reporter};

/// A program and its arguments, kept as a list so nothing is ever passed
/// through a shell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Extra environment; never shown when the command is displayed.
    pub env: Vec<(String, String)>,
}

impl CommandLine {
    pub fn new<S: Into<String>>(program: S) -> CommandLine {
        CommandLine {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
        }
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> CommandLine {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> CommandLine
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn path_arg<P: AsRef<Path>>(self, path: P) -> CommandLine {
        self.arg(path.as_ref().to_string_lossy().into_owned())
    }

    pub fn current_dir<P: Into<PathBuf>>(mut self, cwd: P) -> CommandLine {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> CommandLine {
        self.env.push((key.into(), value.into()));
        self
    }

    fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command.envs(self.env.iter().map(|(key, value)| (key, value)));
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        command
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fn quoted(value: &str) -> String {
            if value.is_empty() || value.contains(|c: char| c.is_whitespace() || c == '"') {
                format!("\"{}\"", value.replace('"', "\\\""))
            } else {
                value.to_owned()
            }
        }

        write!(f, "{}", quoted(&self.program))?;
        for arg in self.args.iter() {
            write!(f, " {}", quoted(arg))?;
        }

        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandResult {
    pub code: i32,
    /// Standard output only.
    pub output: String,
    pub errors: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    pub fn check(&self, command: &CommandLine) -> Result<(), Error> {
        if self.success() {
            Ok(())
        } else {
            Err(Error::CommandFailed {
                command: command.to_string(),
                code: self.code,
            })
        }
    }
}

pub trait CommandRunner {
    /// Runs the command to completion, forwarding its output line by line
    /// through the reporter.
    fn stream(&mut self, reporter: &mut Reporter, command: &CommandLine) -> Result<CommandResult>;

    /// Runs the command to completion and returns its output without
    /// displaying anything. Used for read-only queries.
    fn capture(&mut self, command: &CommandLine) -> Result<CommandResult>;
}

pub struct SystemRunner {
    dry_run: bool,
}

impl SystemRunner {
    pub fn new(dry_run: bool) -> SystemRunner {
        SystemRunner { dry_run }
    }
}

impl CommandRunner for SystemRunner {
    fn stream(&mut self, reporter: &mut Reporter, command: &CommandLine) -> Result<CommandResult> {
        reporter.write_verbose(&format!("Command Line: {}", command))?;

        if self.dry_run {
            info!("dry run, skipping {}", command);
            reporter.write_info(&format!("Dry run: {}", command))?;
            return Ok(CommandResult::default());
        }

        debug!("spawning {:?}", command);

        let mut child = command
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to start `{}`", command))?;

        let (sender, receiver) = mpsc::channel();
        let mut readers = Vec::new();

        if let Some(stdout) = child.stdout.take() {
            readers.push(forward_lines(stdout, Source::Stdout, sender.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(forward_lines(stderr, Source::Stderr, sender.clone()));
        }
        drop(sender);

        let mut output = String::new();
        let mut errors = String::new();
        for (source, line) in receiver {
            reporter.write_line(&line)?;

            let collected = match source {
                Source::Stdout => &mut output,
                Source::Stderr => &mut errors,
            };
            collected.push_str(&line);
            collected.push('\n');
        }

        for reader in readers {
            let _ = reader.join();
        }

        let status = child.wait()?;
        let code = status.code().unwrap_or(-1);
        debug!("{} exited with {}", command, code);

        Ok(CommandResult {
            code,
            output,
            errors,
        })
    }

    fn capture(&mut self, command: &CommandLine) -> Result<CommandResult> {
        debug!("capturing {:?}", command);

        let output = command
            .to_command()
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("failed to start `{}`", command))?;

        Ok(CommandResult {
            code: output.status.code().unwrap_or(-1),
            output: String::from_utf8_lossy(&output.stdout).into_owned(),
            errors: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[derive(Copy, Clone)]
enum Source {
    Stdout,
    Stderr,
}

fn forward_lines<R>(
    reader: R,
    source: Source,
    sender: mpsc::Sender<(Source, String)>,
) -> thread::JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        for line in BufReader::new(reader).lines() {
            match line {
                Ok(line) => {
                    if sender.send((source, line)).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    })
}

/// Streams `command` under its own heading and turns a non-zero exit code
/// into an error.
pub fn stream_command(
    reporter: &mut Reporter,
    runner: &mut dyn CommandRunner,
    heading: &str,
    command: &CommandLine,
) -> Result<CommandResult> {
    reporter.nested(heading, |reporter| {
        let result = runner.stream(reporter, command)?;
        result.check(command)?;
        Ok(result)
    })
}
