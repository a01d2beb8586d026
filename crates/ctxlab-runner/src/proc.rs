use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Captured output of a bounded subprocess run.
#[derive(Debug)]
pub(crate) struct ProcOutput {
    pub status: Option<ExitStatus>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

impl ProcOutput {
    pub fn exit_ok(&self) -> bool {
        !self.timed_out && self.status.map(|s| s.success()).unwrap_or(false)
    }
}

/// Spawn `cmd` and wait for it under a hard deadline. The child is killed when
/// the deadline passes. Output pipes are drained on separate threads so a full
/// pipe buffer cannot stall the wait loop.
pub(crate) fn run_with_deadline(mut cmd: Command, timeout: Duration) -> std::io::Result<ProcOutput> {
    let start = Instant::now();
    let deadline = start + timeout;

    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd.spawn()?;
    let stdout_handle = child.stdout.take().map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    });
    let stderr_handle = child.stderr.take().map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    });

    let mut timed_out = false;
    let status = loop {
        match child.try_wait()? {
            Some(status) => break Some(status),
            None => {
                if Instant::now() >= deadline {
                    timed_out = true;
                    let _ = child.kill();
                    break child.wait().ok();
                }
                thread::sleep(Duration::from_millis(50));
            }
        }
    };

    let stdout = stdout_handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default();
    let stderr = stderr_handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default();

    Ok(ProcOutput {
        status,
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        timed_out,
        duration: start.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout_and_exit_status() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo hello; echo oops >&2"]);
        let out = run_with_deadline(cmd, Duration::from_secs(10)).expect("run");
        assert!(out.exit_ok());
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
        assert!(!out.timed_out);
    }

    #[test]
    fn kills_process_past_deadline() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "sleep 30"]);
        let out = run_with_deadline(cmd, Duration::from_millis(200)).expect("run");
        assert!(out.timed_out);
        assert!(!out.exit_ok());
        assert!(out.duration < Duration::from_secs(10));
    }

    #[test]
    fn missing_command_is_a_spawn_error() {
        let cmd = Command::new("ctxlab-definitely-not-a-real-binary");
        let err = run_with_deadline(cmd, Duration::from_secs(1)).expect_err("spawn must fail");
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }

    #[test]
    fn nonzero_exit_is_not_ok() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "exit 3"]);
        let out = run_with_deadline(cmd, Duration::from_secs(10)).expect("run");
        assert!(!out.exit_ok());
        assert_eq!(out.status.and_then(|s| s.code()), Some(3));
    }
}
