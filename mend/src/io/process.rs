//! Child process execution with timeouts and bounded output capture.

use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// Captured output of one verification command.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub duration: Duration,
    pub timed_out: bool,
}

impl CommandOutput {
    /// Combined stdout/stderr, lossily decoded, stderr appended after stdout.
    pub fn combined(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&self.stderr);
        if !stderr.trim().is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&stderr);
        }
        text
    }
}

/// Run a command with a wall-clock timeout, capturing stdout/stderr.
///
/// Output is read concurrently while the child runs so pipes never deadlock;
/// `output_limit_bytes` bounds what is kept per stream (excess is drained and
/// discarded). On timeout the child's whole process group is killed so
/// spawned grandchildren do not linger, and `timed_out` is set.
///
/// A command that cannot be spawned at all returns `Err`; callers map that to
/// an ERROR step, distinct from FAIL.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    run_command_with_input(cmd, None, timeout, output_limit_bytes)
}

/// Like [`run_command_with_timeout`], but feeds `input` to the child's stdin
/// before waiting. Used for advisor commands, which read their prompt from
/// stdin.
pub fn run_command_with_input(
    mut cmd: Command,
    input: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    if input.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    isolate_process_group(&mut cmd);

    let start = Instant::now();
    debug!("spawning command");
    let mut child = cmd.spawn().context("spawn command")?;

    let stdin_handle = match input {
        Some(input) => {
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            let input = input.to_vec();
            // Written from a thread so a child that never reads cannot block us.
            Some(thread::spawn(move || {
                use std::io::Write;
                let _ = stdin.write_all(&input);
            }))
        }
        None => None,
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing process group");
            timed_out = true;
            kill_process_tree(&mut child)?;
            child.wait().context("wait command after kill")?
        }
    };

    let stdout = join_output(stdout_handle).context("join stdout")?;
    let stderr = join_output(stderr_handle).context("join stderr")?;
    if let Some(handle) = stdin_handle {
        let _ = handle.join();
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        duration: start.elapsed(),
        timed_out,
    })
}

/// Place the child in its own process group so a timeout kill reaches any
/// grandchildren (npm and pytest both spawn helpers).
#[cfg(unix)]
fn isolate_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn isolate_process_group(_cmd: &mut Command) {}

#[cfg(unix)]
#[allow(unsafe_code)]
fn kill_process_tree(child: &mut Child) -> Result<()> {
    let pid = child.id() as i32;
    // The child leads its own process group (see isolate_process_group), so
    // signalling the group id reaches the whole tree.
    let rc = unsafe { libc::killpg(pid, libc::SIGKILL) };
    if rc != 0 {
        // Group already gone; fall back to the direct kill.
        child.kill().context("kill command")?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn kill_process_tree(child: &mut Child) -> Result<()> {
    child.kill().context("kill command")
}

fn join_output(handle: thread::JoinHandle<Result<Vec<u8>>>) -> Result<Vec<u8>> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            buf.extend_from_slice(&chunk[..n.min(remaining)]);
        }
    }

    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout_and_exit_status() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo out; echo err >&2"]);
        let output =
            run_command_with_timeout(cmd, Duration::from_secs(5), 10_000).expect("run sh");
        assert!(output.status.success());
        assert!(!output.timed_out);
        let combined = output.combined();
        assert!(combined.contains("out"));
        assert!(combined.contains("err"));
    }

    #[test]
    fn output_is_bounded_by_limit() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "yes x | head -c 100000"]);
        let output = run_command_with_timeout(cmd, Duration::from_secs(5), 512).expect("run sh");
        assert!(output.stdout.len() <= 512);
    }

    #[test]
    fn timeout_kills_and_flags() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "sleep 30"]);
        let output =
            run_command_with_timeout(cmd, Duration::from_millis(100), 1024).expect("run sh");
        assert!(output.timed_out);
        assert!(!output.status.success());
    }

    #[test]
    fn stdin_input_reaches_the_child() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "cat"]);
        let output = run_command_with_input(
            cmd,
            Some(b"hello from stdin"),
            Duration::from_secs(5),
            10_000,
        )
        .expect("run sh");
        assert!(output.status.success());
        assert_eq!(output.stdout, b"hello from stdin");
    }

    #[test]
    fn missing_binary_is_a_spawn_error() {
        let cmd = Command::new("definitely-not-a-real-binary-xyz");
        let err = run_command_with_timeout(cmd, Duration::from_secs(1), 1024).unwrap_err();
        assert!(err.to_string().contains("spawn"));
    }
}
