//! Child processes with a deadline, bounded capture, and group teardown.

use std::io::{ErrorKind, Read, Write};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub fn stdout_truncated_notice(&self) -> String {
        truncated_notice("stdout", self.stdout_truncated)
    }

    pub fn stderr_truncated_notice(&self) -> String {
        truncated_notice("stderr", self.stderr_truncated)
    }
}

fn truncated_notice(stream: &str, bytes: usize) -> String {
    if bytes > 0 {
        format!("\n[{stream} truncated {bytes} bytes]\n")
    } else {
        String::new()
    }
}

/// Run `cmd` until it exits or `timeout` elapses, capturing at most
/// `output_limit_bytes` of each output stream.
///
/// Stdin and both pipes are serviced on worker threads so a chatty child can never
/// block on a full pipe. On expiry the whole process group is killed (unix) and all
/// workers are joined before returning; the partial capture comes back with
/// `timed_out` set.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let mut child = cmd
        .spawn()
        .inspect_err(|e| error!(err = %e, "spawn failed"))
        .context("spawn command")?;
    debug!(pid = child.id(), "child started");

    let feeder = match stdin {
        Some(input) => {
            let pipe = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("child has no stdin pipe"))?;
            Some(feed_stdin(pipe, input.to_vec()))
        }
        None => None,
    };
    let out = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("child has no stdout pipe"))?;
    let err = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("child has no stderr pipe"))?;
    let out = Capture::start(out, output_limit_bytes);
    let err = Capture::start(err, output_limit_bytes);

    let (status, timed_out) = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => (status, false),
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "deadline passed, killing process group"
            );
            kill_tree(&mut child);
            (child.wait().context("reap killed command")?, true)
        }
    };

    if let Some(feeder) = feeder {
        match feeder.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(err = %e, "failed to feed stdin"),
            Err(_) => warn!("stdin writer thread panicked"),
        }
    }
    let out = out.finish().context("collect stdout")?;
    let err = err.finish().context("collect stderr")?;

    if out.dropped > 0 || err.dropped > 0 {
        warn!(
            stdout_truncated = out.dropped,
            stderr_truncated = err.dropped,
            "output over limit"
        );
    }
    debug!(exit_code = ?status.code(), timed_out, "child finished");
    Ok(CommandOutput {
        status,
        stdout: out.kept,
        stderr: err.kept,
        stdout_truncated: out.dropped,
        stderr_truncated: err.dropped,
        timed_out,
    })
}

/// Write `input` to the child's stdin and close it. A child that exits without
/// reading everything is not an error.
fn feed_stdin(mut pipe: ChildStdin, input: Vec<u8>) -> JoinHandle<Result<()>> {
    thread::spawn(move || match pipe.write_all(&input) {
        Err(e) if e.kind() != ErrorKind::BrokenPipe => Err(e).context("write stdin"),
        _ => Ok(()),
    })
}

/// Kill the child and, on unix, every process in its group.
///
/// Grandchildren spawned by a shell keep the output pipes open; killing only the
/// direct child would leave the reader threads blocked on them.
fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        let group = format!("-{}", child.id());
        match Command::new("kill")
            .args(["-KILL", "--", &group])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(status) if status.success() => return,
            Ok(status) => warn!(code = ?status.code(), "group kill failed, killing child only"),
            Err(e) => warn!(err = %e, "could not run kill, killing child only"),
        }
    }
    if let Err(e) = child.kill() {
        warn!(err = %e, "kill child");
    }
}

/// Bytes kept from one stream, plus how many were read and discarded.
#[derive(Debug, Default, PartialEq)]
struct Captured {
    kept: Vec<u8>,
    dropped: usize,
}

impl Captured {
    fn push(&mut self, bytes: &[u8], limit: usize) {
        let room = limit.saturating_sub(self.kept.len()).min(bytes.len());
        self.kept.extend_from_slice(&bytes[..room]);
        self.dropped += bytes.len() - room;
    }
}

/// A stream being drained to EOF on its own thread.
struct Capture(JoinHandle<Result<Captured>>);

impl Capture {
    const CHUNK: usize = 8 * 1024;

    fn start<R: Read + Send + 'static>(mut reader: R, limit: usize) -> Self {
        Self(thread::spawn(move || {
            let mut captured = Captured::default();
            let mut chunk = vec![0u8; Self::CHUNK];
            loop {
                match reader.read(&mut chunk) {
                    Ok(0) => return Ok(captured),
                    Ok(n) => captured.push(&chunk[..n], limit),
                    Err(e) if e.kind() == ErrorKind::Interrupted => {}
                    Err(e) => return Err(e).context("read output"),
                }
            }
        }))
    }

    fn finish(self) -> Result<Captured> {
        self.0
            .join()
            .map_err(|_| anyhow!("output reader thread panicked"))?
    }
}
