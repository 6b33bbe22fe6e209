//! Runs external programs, optionally streaming data through their stdin and stdout.
//!
//! When a reader or writer is attached, the child's pipes are serviced by two
//! scoped threads: one feeding stdin, one draining stdout. Both are joined
//! before the child is waited on, so a child blocked on a full pipe can never
//! deadlock the runner.

use std::io::{self, BufReader, Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, ScopedJoinHandle};

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

/// Printed in place of a redacted argument value.
const MASK: &str = "********";

/// User and group a child process is switched to when running as root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Credential {
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("failed to write process stdin: {0}")]
    Input(#[source] io::Error),
    #[error("failed to read process stdout: {0}")]
    Output(#[source] io::Error),
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("cannot start process {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to wait for process {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: io::Error,
    },
    /// Nonzero exit. A stream failure seen during the same run rides along.
    #[error(
        "{program} exited unsuccessfully ({status}){}",
        .stream.as_ref().map(|e| format!(", {e}")).unwrap_or_default()
    )]
    Exit {
        program: String,
        status: ExitStatus,
        stream: Option<StreamError>,
    },
    #[error("{program}: {source}")]
    Stream {
        program: String,
        #[source]
        source: StreamError,
    },
}

impl CommandError {
    /// True when the only failure is the exit code, with no stream error.
    pub fn is_exit_only(&self) -> bool {
        matches!(self, CommandError::Exit { stream: None, .. })
    }
}

/// Builder for a single external process invocation.
#[derive(Default)]
pub struct CommandRunner<'a> {
    env: Vec<(String, String)>,
    input: Option<Box<dyn Read + Send + 'a>>,
    output: Option<Box<dyn Write + Send + 'a>>,
    credential: Option<Credential>,
    redact: Option<String>,
}

impl<'a> CommandRunner<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an environment variable on top of the inherited environment.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Streams `reader` into the child's stdin, closing it at EOF.
    pub fn input(mut self, reader: impl Read + Send + 'a) -> Self {
        self.input = Some(Box::new(reader));
        self
    }

    /// Streams the child's stdout into `writer`.
    pub fn output(mut self, writer: impl Write + Send + 'a) -> Self {
        self.output = Some(Box::new(writer));
        self
    }

    /// Runs the child as `credential` when the caller is root.
    pub fn credential(mut self, credential: Option<Credential>) -> Self {
        self.credential = credential;
        self
    }

    /// Hides the value following `token` when the command line is logged.
    pub fn redact(mut self, token: impl Into<String>) -> Self {
        self.redact = Some(token.into());
        self
    }

    /// Executes `program` with `args` and waits for it to exit.
    ///
    /// # Errors
    /// Errors are reported in priority order: failure to start or wait for
    /// the process, a nonzero exit (carrying any stream error), a stdin copy
    /// failure, then a stdout copy failure.
    pub fn run(self, program: impl AsRef<Path>, args: &[String]) -> Result<(), CommandError> {
        let program = program.as_ref();
        let name = program.display().to_string();
        let shown = redact(args, self.redact.as_deref().unwrap_or_default()).join(" ");

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stderr(Stdio::inherit());
        apply_credential(&mut cmd, &name, self.credential);

        let CommandRunner { input, output, .. } = self;

        if input.is_none() && output.is_none() {
            info!("Running {name} {shown}");
            let status = cmd.status().map_err(|source| CommandError::Spawn {
                program: name.clone(),
                source,
            })?;
            return check_status(name, status, None);
        }

        cmd.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(if output.is_some() {
            Stdio::piped()
        } else {
            Stdio::inherit()
        });

        info!("Running {name} {shown}");
        let mut child = cmd.spawn().map_err(|source| CommandError::Spawn {
            program: name.clone(),
            source,
        })?;

        let (input_result, output_result) = copy_streams(&mut child, input, output);

        let status = child.wait().map_err(|source| CommandError::Wait {
            program: name.clone(),
            source,
        })?;

        let stream = match (input_result, output_result) {
            (Err(e), _) => Some(StreamError::Input(e)),
            (Ok(()), Err(e)) => Some(StreamError::Output(e)),
            (Ok(()), Ok(())) => None,
        };
        check_status(name, status, stream)
    }
}

fn check_status(
    program: String,
    status: ExitStatus,
    stream: Option<StreamError>,
) -> Result<(), CommandError> {
    if !status.success() {
        return Err(CommandError::Exit {
            program,
            status,
            stream,
        });
    }
    match stream {
        Some(source) => Err(CommandError::Stream { program, source }),
        None => Ok(()),
    }
}

/// Runs the stdin feeder and the stdout drainer concurrently and joins both.
/// A direction with nothing attached completes immediately.
fn copy_streams<'a>(
    child: &mut Child,
    input: Option<Box<dyn Read + Send + 'a>>,
    output: Option<Box<dyn Write + Send + 'a>>,
) -> (io::Result<()>, io::Result<()>) {
    let stdin = child.stdin.take();
    let stdout = child.stdout.take();

    thread::scope(|scope| {
        let feeder = scope.spawn(move || match (input, stdin) {
            (Some(mut reader), Some(mut pipe)) => {
                debug!("Sending input to command stdin");
                io::copy(&mut reader, &mut pipe)?;
                // dropping the pipe closes stdin and signals EOF
                drop(pipe);
                Ok(())
            }
            _ => Ok(()),
        });
        let drainer = scope.spawn(move || match (output, stdout) {
            (Some(mut writer), Some(pipe)) => {
                debug!("Sending command stdout to output");
                io::copy(&mut BufReader::new(pipe), &mut writer)?;
                writer.flush()
            }
            _ => Ok(()),
        });
        (join(feeder), join(drainer))
    })
}

fn join(handle: ScopedJoinHandle<'_, io::Result<()>>) -> io::Result<()> {
    handle
        .join()
        .unwrap_or_else(|_| Err(io::Error::other("stream copy thread panicked")))
}

#[cfg(unix)]
fn apply_credential(cmd: &mut Command, program: &str, credential: Option<Credential>) {
    use std::os::unix::process::CommandExt;

    // SAFETY: geteuid has no preconditions and always succeeds.
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        info!("Not running as root, starting {program} with UID {euid}");
    } else if let Some(credential) = credential {
        cmd.uid(credential.uid).gid(credential.gid);
    }
}

#[cfg(not(unix))]
fn apply_credential(_cmd: &mut Command, _program: &str, _credential: Option<Credential>) {}

/// Returns `args` with the secret introduced by `token` masked.
///
/// A token starting with `--` is a long flag whose value is the next
/// argument (`--password secret`). Any other token is a short flag with an
/// attached value (`-psecret`). Only the first occurrence is masked.
pub fn redact(args: &[String], token: &str) -> Vec<String> {
    if token.is_empty() {
        return args.to_vec();
    }

    let long = token.starts_with("--");
    let mut shown = Vec::with_capacity(args.len());
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        if long && arg == token {
            shown.push(arg.clone());
            if iter.next().is_some() {
                shown.push(MASK.to_string());
            }
            shown.extend(iter.cloned());
            break;
        }
        if !long && arg.starts_with(token) {
            shown.push(format!("{token}{MASK}"));
            shown.extend(iter.cloned());
            break;
        }
        shown.push(arg.clone());
    }

    shown
}
