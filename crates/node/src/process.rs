use std::{
    ffi::OsStr,
    fs::OpenOptions,
    path::Path,
    process::{Child, Command, ExitStatus, Output, Stdio},
    time::{Duration, Instant},
};

use chainrunner_common::{Error, Result};
use tracing::{debug, warn};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A wrapper around a long running node process. Its stderr goes to a log file and stdout is
/// discarded. The process is killed when the wrapper is dropped unless it has been detached.
#[derive(Debug)]
pub struct Process {
    /// The handle of the child process.
    child: Child,

    /// The rendered command line, kept for error messages.
    command: String,

    /// Set once a termination signal has been sent.
    terminating: bool,

    /// Set when the process should outlive this wrapper.
    detached: bool,
}

impl Process {
    /// Spawns `binary` with `arguments`, truncating `log_file` and redirecting stderr into it.
    pub fn spawn<I, S>(
        binary: impl AsRef<Path>,
        arguments: I,
        log_file: impl AsRef<Path>,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let log_file = log_file.as_ref();
        let stderr = OpenOptions::new()
            .write(true)
            .truncate(true)
            .create(true)
            .open(log_file)
            .map_err(|error| Error::Process {
                command: format!("open {}", log_file.display()),
                reason: error.to_string(),
            })?;

        let mut command = Command::new(binary.as_ref());
        command
            .args(arguments)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(stderr);
        let rendered = render(&command);

        let child = command.spawn().map_err(|error| Error::Process {
            command: rendered.clone(),
            reason: error.to_string(),
        })?;
        debug!(pid = child.id(), command = %rendered, "Spawned process");

        Ok(Self {
            child,
            command: rendered,
            terminating: false,
            detached: false,
        })
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Asks the process to shut down gracefully and returns without waiting.
    #[cfg(unix)]
    pub fn terminate(&mut self) -> Result<()> {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        if self.terminating || self.has_exited()? {
            return Ok(());
        }
        let pid = Pid::from_raw(self.child.id() as i32);
        kill(pid, Signal::SIGTERM).map_err(|errno| Error::Process {
            command: self.command.clone(),
            reason: format!("failed to send SIGTERM: {errno}"),
        })?;
        self.terminating = true;
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn terminate(&mut self) -> Result<()> {
        self.terminating = true;
        self.kill()
    }

    /// Kills the process and reaps it.
    pub fn kill(&mut self) -> Result<()> {
        if self.has_exited()? {
            return Ok(());
        }
        self.child.kill()?;
        self.child.wait()?;
        Ok(())
    }

    pub fn has_exited(&mut self) -> Result<bool> {
        Ok(self.child.try_wait()?.is_some())
    }

    /// Waits until the process exits or `timeout` passes. Returns the exit status if the process
    /// is gone.
    pub async fn await_exit(&mut self, timeout: Duration) -> Result<Option<ExitStatus>> {
        let start = Instant::now();
        loop {
            if let Some(status) = self.child.try_wait()? {
                return Ok(Some(status));
            }
            if start.elapsed() >= timeout {
                return Ok(None);
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL.min(timeout.saturating_sub(start.elapsed())))
                .await;
        }
    }

    /// Releases the process so that it keeps running after the wrapper is dropped.
    pub fn detach(mut self) -> u32 {
        self.detached = true;
        self.child.id()
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        if let Err(error) = self.kill() {
            warn!(pid = self.child.id(), %error, "Failed to kill the process");
        }
    }
}

/// Runs a one-off invocation of `binary` to completion and returns its output. A non-zero exit
/// status is reported as [`Error::Process`] carrying the tail of stderr.
pub fn run_to_completion<I, S>(binary: impl AsRef<Path>, arguments: I) -> Result<Output>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut command = Command::new(binary.as_ref());
    command.args(arguments).stdin(Stdio::null()).env_remove("RUST_LOG");
    let rendered = render(&command);

    let output = command.output().map_err(|error| Error::Process {
        command: rendered.clone(),
        reason: error.to_string(),
    })?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Process {
            command: rendered,
            reason: format!("{}: {}", output.status, stderr.trim()),
        });
    }
    Ok(output)
}

fn render(command: &Command) -> String {
    std::iter::once(command.get_program())
        .chain(command.get_args())
        .map(|part| part.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(all(test, unix))]
mod tests {
    use temp_dir::TempDir;

    use super::*;

    #[tokio::test]
    async fn stderr_is_written_to_the_log_file() {
        let directory = TempDir::new().unwrap();
        let log = directory.child("node.log");
        std::fs::write(&log, "stale contents\n").unwrap();

        let mut process = Process::spawn(
            "/bin/sh",
            ["-c", "echo to-stdout; echo to-stderr >&2"],
            &log,
        )
        .unwrap();
        let status = process.await_exit(Duration::from_secs(10)).await.unwrap();

        assert!(status.is_some_and(|status| status.success()));
        assert_eq!(std::fs::read_to_string(&log).unwrap(), "to-stderr\n");
    }

    #[tokio::test]
    async fn terminate_does_not_wait_and_await_exit_observes_the_exit() {
        let directory = TempDir::new().unwrap();
        let mut process =
            Process::spawn("/bin/sh", ["-c", "sleep 30"], directory.child("sleep.log")).unwrap();

        assert_eq!(
            process.await_exit(Duration::from_millis(100)).await.unwrap(),
            None
        );
        process.terminate().unwrap();
        let status = process.await_exit(Duration::from_secs(10)).await.unwrap();
        assert!(status.is_some_and(|status| !status.success()));
    }

    #[test]
    fn failing_one_off_commands_report_stderr() {
        let error = run_to_completion("/bin/sh", ["-c", "echo broken >&2; exit 3"]).unwrap_err();
        match error {
            Error::Process { command, reason } => {
                assert!(command.starts_with("/bin/sh -c"));
                assert!(reason.contains("broken"), "{reason}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
