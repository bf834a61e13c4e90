//! Unit interpreter processes: source on stdin, bounded capture, hard deadline.

use std::io::{self, Read, Write};
#[cfg(unix)]
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// One output stream, cut at the byte limit.
#[derive(Debug, Default)]
pub struct Captured {
    pub bytes: Vec<u8>,
    /// Bytes the child wrote past the limit and we discarded.
    pub dropped: u64,
}

impl Captured {
    pub fn lossy(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// What a finished (or killed) interpreter left behind.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Captured,
    pub stderr: Captured,
    /// The deadline passed and the interpreter's process group was killed.
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        self.stdout.lossy()
    }

    pub fn stderr_lossy(&self) -> String {
        self.stderr.lossy()
    }
}

/// How long reader threads get to drain after the process group is killed.
const KILL_GRACE: Duration = Duration::from_millis(500);

/// Spawn `cmd`, feed it `stdin`, and wait at most `timeout`.
///
/// On unix the interpreter leads its own process group, so a deadline kills
/// everything it forked. Output pipes held open by a straggler past the
/// deadline count as an overrun too.
#[instrument(skip_all, fields(timeout_ms = timeout.as_millis() as u64, output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: &[u8],
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    let deadline = Instant::now() + timeout;
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    cmd.process_group(0);
    let mut child = cmd.spawn().context("spawn unit interpreter")?;
    let pid = child.id();
    debug!(pid, "interpreter started");

    let feeder = feed_stdin(&mut child, stdin.to_vec())?;
    let limit = u64::try_from(output_limit_bytes).unwrap_or(u64::MAX);
    let stdout = child.stdout.take().ok_or_else(|| anyhow!("stdout not piped"))?;
    let stderr = child.stderr.take().ok_or_else(|| anyhow!("stderr not piped"))?;
    let stdout = spawn_capture(stdout, limit);
    let stderr = spawn_capture(stderr, limit);

    let (status, mut killed) = match child.wait_timeout(timeout).context("wait for interpreter")? {
        Some(status) => (status, false),
        None => {
            warn!("deadline passed, killing interpreter");
            kill_tree(&mut child)?;
            (child.wait().context("reap interpreter")?, true)
        }
    };

    let stdout = collect(&stdout, "stdout", deadline, pid, &mut killed)?;
    let stderr = collect(&stderr, "stderr", deadline, pid, &mut killed)?;
    let timed_out = killed;
    if feeder.is_finished() {
        // Fails only when the child stopped reading early.
        let _ = feeder.join();
    }
    if stdout.dropped > 0 || stderr.dropped > 0 {
        warn!(
            stdout_dropped = stdout.dropped,
            stderr_dropped = stderr.dropped,
            "unit output over limit"
        );
    }

    debug!(exit_code = ?status.code(), timed_out, "interpreter finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        timed_out,
    })
}

fn feed_stdin(child: &mut Child, input: Vec<u8>) -> Result<JoinHandle<io::Result<()>>> {
    let mut pipe = child.stdin.take().ok_or_else(|| anyhow!("stdin not piped"))?;
    // Dropping the pipe at the end of the thread closes the child's stdin.
    Ok(thread::spawn(move || pipe.write_all(&input)))
}

fn spawn_capture<R>(reader: R, limit: u64) -> Receiver<io::Result<Captured>>
where
    R: Read + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        // The receiver is gone only when the stream was abandoned.
        let _ = tx.send(capture(reader, limit));
    });
    rx
}

fn capture<R: Read>(mut reader: R, limit: u64) -> io::Result<Captured> {
    let mut bytes = Vec::new();
    reader.by_ref().take(limit).read_to_end(&mut bytes)?;
    let dropped = io::copy(&mut reader, &mut io::sink())?;
    Ok(Captured { bytes, dropped })
}

/// Wait for a stream to close, killing group `pgid` if it is still held open
/// at the deadline. `killed` records that the group has been killed.
fn collect(
    rx: &Receiver<io::Result<Captured>>,
    stream: &str,
    deadline: Instant,
    pgid: u32,
    killed: &mut bool,
) -> Result<Captured> {
    let wait = if *killed {
        KILL_GRACE
    } else {
        deadline.saturating_duration_since(Instant::now())
    };
    let result = match rx.recv_timeout(wait) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) if !*killed => {
            warn!(stream, "output held open past deadline, killing process group");
            kill_group(pgid)?;
            *killed = true;
            rx.recv_timeout(KILL_GRACE)
                .map_err(|_| anyhow!("unit {stream} still open after kill"))?
        }
        Err(RecvTimeoutError::Timeout) => {
            return Err(anyhow!("unit {stream} still open after kill"));
        }
        Err(RecvTimeoutError::Disconnected) => return Err(anyhow!("{stream} reader panicked")),
    };
    result.with_context(|| format!("read unit {stream}"))
}

#[cfg(unix)]
fn kill_tree(child: &mut Child) -> Result<()> {
    kill_group(child.id())
}

#[cfg(not(unix))]
fn kill_tree(child: &mut Child) -> Result<()> {
    child.kill().context("kill interpreter")
}

/// SIGKILL every process in group `pgid`. A group that is already gone is
/// not an error.
#[cfg(unix)]
#[allow(unsafe_code)]
fn kill_group(pgid: u32) -> Result<()> {
    let pgid = libc::pid_t::try_from(pgid).context("process group id out of range")?;
    // SAFETY: killpg has no memory-safety preconditions.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err).context("kill interpreter process group")
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) -> Result<()> {
    Ok(())
}
