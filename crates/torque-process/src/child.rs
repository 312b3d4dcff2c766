//! A single supervised child process.
//!
//! Children are spawned into their own process group so that signalling
//! reaches grandchildren too. A background task owns the handle and follows
//! a small actor protocol: the [`Child`] handles held by callers send stop
//! and kill commands over a channel and observe the exit through a watch.

use std::{
    io::{self, Write},
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, BufReader},
    process::Command as TokioCommand,
    sync::{mpsc, watch},
};
use tracing::{debug, trace};

use super::Command;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChildExit {
    Finished(Option<i32>),
    /// The child was sent an interrupt and shut down on its own.
    Interrupted,
    /// The child was killed, either explicitly or because it ignored the
    /// interrupt within the grace period.
    Killed,
    /// The child was killed by someone else.
    KilledExternal,
    Failed,
}

#[derive(Debug, Clone)]
pub enum ShutdownStyle {
    /// Send SIGINT to the process group, wait up to the given duration, then
    /// kill.
    Graceful(Duration),
    Kill,
}

struct ChildHandle {
    pid: Option<u32>,
    child: tokio::process::Child,
}

impl ChildHandle {
    fn spawn(command: Command) -> io::Result<SpawnResult> {
        let mut command = TokioCommand::from(command);

        // Give the child its own process group so signals reach the whole
        // subtree.
        #[cfg(unix)]
        {
            use nix::unistd::setsid;
            unsafe {
                command.pre_exec(|| {
                    setsid()?;
                    Ok(())
                });
            }
        }

        let mut child = command.spawn()?;
        let pid = child.id();

        let stdout = child
            .stdout
            .take()
            .expect("child process was started with piped stdout");
        let stderr = child
            .stderr
            .take()
            .expect("child process was started with piped stderr");

        Ok(SpawnResult {
            handle: Self { pid, child },
            output: ChildOutput { stdout, stderr },
        })
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        self.child.wait().await.map(|status| status.code())
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.child.kill().await
    }
}

struct SpawnResult {
    handle: ChildHandle,
    output: ChildOutput,
}

#[derive(Debug)]
struct ChildOutput {
    stdout: tokio::process::ChildStdout,
    stderr: tokio::process::ChildStderr,
}

impl ShutdownStyle {
    async fn process(&self, child: &mut ChildHandle) -> ChildExit {
        match self {
            ShutdownStyle::Graceful(timeout) => {
                let fut = async {
                    if let Some(pid) = child.pid() {
                        debug!("sending SIGINT to child {}", pid);
                        // Negative pid targets the process group.
                        let pgid = -(pid as i32);
                        if unsafe { libc::kill(pgid, libc::SIGINT) } == -1 {
                            debug!("failed to send SIGINT to {pgid}");
                        }
                        debug!("waiting for child {}", pid);
                        child.wait().await
                    } else {
                        Ok(None)
                    }
                };

                debug!("starting graceful shutdown");

                match tokio::time::timeout(*timeout, fut).await {
                    // The exit code after a SIGINT we sent is meaningless;
                    // report the interrupt itself so a shutdown is never
                    // mistaken for a task failure.
                    Ok(Ok(_exit_code)) => ChildExit::Interrupted,
                    Ok(Err(_)) => ChildExit::Failed,
                    Err(_) => {
                        debug!("graceful shutdown timed out, killing child");
                        match child.kill().await {
                            Ok(_) => ChildExit::Killed,
                            Err(_) => ChildExit::Failed,
                        }
                    }
                }
            }
            ShutdownStyle::Kill => match child.kill().await {
                Ok(_) => ChildExit::Killed,
                Err(_) => ChildExit::Failed,
            },
        }
    }
}

#[derive(Debug)]
struct ChildStateManager {
    shutdown_style: ShutdownStyle,
    exit_tx: watch::Sender<Option<ChildExit>>,
    shutdown_initiated: bool,
}

/// A handle to a supervised child. Cheap to clone; all clones observe the
/// same exit.
#[derive(Clone, Debug)]
pub struct Child {
    pid: Option<u32>,
    command_channel: ChildCommandChannel,
    exit_channel: watch::Receiver<Option<ChildExit>>,
    output: Arc<Mutex<Option<ChildOutput>>>,
    label: String,
}

#[derive(Clone, Debug)]
struct ChildCommandChannel(mpsc::Sender<ChildCommand>);

impl ChildCommandChannel {
    fn new() -> (Self, mpsc::Receiver<ChildCommand>) {
        let (tx, rx) = mpsc::channel(1);
        (ChildCommandChannel(tx), rx)
    }

    async fn kill(&self) -> Result<(), mpsc::error::SendError<ChildCommand>> {
        self.0.send(ChildCommand::Kill).await
    }

    async fn stop(&self) -> Result<(), mpsc::error::SendError<ChildCommand>> {
        self.0.send(ChildCommand::Stop).await
    }
}

pub enum ChildCommand {
    Stop,
    Kill,
}

impl Child {
    /// Starts the command immediately and hands back the supervising handle.
    pub fn spawn(command: Command, shutdown_style: ShutdownStyle) -> io::Result<Self> {
        let label = command.label();
        let SpawnResult {
            handle: mut child,
            output,
        } = ChildHandle::spawn(command)?;

        let pid = child.pid();

        let (command_tx, mut command_rx) = ChildCommandChannel::new();

        // The watch carries the single interesting transition: the child
        // exited, was killed, or a syscall failed.
        let (exit_tx, exit_rx) = watch::channel(None);

        tokio::spawn(async move {
            debug!("waiting for child: {pid:?}");
            let mut manager = ChildStateManager {
                shutdown_style,
                exit_tx,
                shutdown_initiated: false,
            };
            tokio::select! {
                biased;
                command = command_rx.recv() => {
                    manager.shutdown_initiated = true;
                    manager.handle_child_command(command, &mut child).await;
                }
                status = child.wait() => {
                    manager.handle_child_exit(status).await;
                }
            }

            debug!("child process stopped");
        });

        Ok(Self {
            pid,
            command_channel: command_tx,
            exit_channel: exit_rx,
            output: Arc::new(Mutex::new(Some(output))),
            label,
        })
    }

    /// Waits for the child to exit and returns how it went.
    pub async fn wait(&mut self) -> Option<ChildExit> {
        trace!("watching exit channel of {}", self.label);
        // A closed channel still leaves the final value readable.
        match self.exit_channel.changed().await {
            Ok(()) => trace!("exit channel was updated"),
            Err(_) => trace!("exit channel sender was dropped"),
        }
        *self.exit_channel.borrow()
    }

    /// Graceful shutdown per the spawn-time [`ShutdownStyle`].
    pub async fn stop(&mut self) -> Option<ChildExit> {
        // A send failure means the supervision task is already gone, which
        // is fine.
        self.command_channel.stop().await.ok();
        self.wait().await
    }

    /// Immediate kill.
    pub async fn kill(&mut self) -> Option<ChildExit> {
        self.command_channel.kill().await.ok();
        self.wait().await
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn outputs(&self) -> Option<ChildOutput> {
        self.output.lock().expect("output lock poisoned").take()
    }

    /// Waits for the child while interleaving its stdout and stderr, line by
    /// line, into the given writer.
    pub async fn wait_with_piped_outputs<W: Write>(
        &mut self,
        stdout_pipe: W,
    ) -> Result<Option<ChildExit>, std::io::Error> {
        match self.outputs() {
            Some(ChildOutput { stdout, stderr }) => {
                self.wait_with_piped_async_outputs(
                    stdout_pipe,
                    Some(BufReader::new(stdout)),
                    Some(BufReader::new(stderr)),
                )
                .await
            }
            None => Ok(self.wait().await),
        }
    }

    async fn wait_with_piped_async_outputs<R1: AsyncBufRead + Unpin, R2: AsyncBufRead + Unpin>(
        &mut self,
        mut stdout_pipe: impl Write,
        mut stdout_lines: Option<R1>,
        mut stderr_lines: Option<R2>,
    ) -> Result<Option<ChildExit>, std::io::Error> {
        async fn next_line<R: AsyncBufRead + Unpin>(
            stream: &mut Option<R>,
            buffer: &mut Vec<u8>,
        ) -> Option<Result<(), io::Error>> {
            match stream {
                Some(stream) => match stream.read_until(b'\n', buffer).await {
                    Ok(0) => {
                        trace!("reached EOF");
                        None
                    }
                    Ok(_) => Some(Ok(())),
                    Err(e) => Some(Err(e)),
                },
                None => None,
            }
        }

        let mut stdout_buffer = Vec::new();
        let mut stderr_buffer = Vec::new();

        let mut is_exited = false;
        loop {
            tokio::select! {
                Some(result) = next_line(&mut stdout_lines, &mut stdout_buffer) => {
                    result?;
                    add_trailing_newline(&mut stdout_buffer);
                    stdout_pipe.write_all(&stdout_buffer)?;
                    stdout_buffer.clear();
                }
                Some(result) = next_line(&mut stderr_lines, &mut stderr_buffer) => {
                    result?;
                    add_trailing_newline(&mut stderr_buffer);
                    stdout_pipe.write_all(&stderr_buffer)?;
                    stderr_buffer.clear();
                }
                status = self.wait(), if !is_exited => {
                    trace!("child process exited: {}", self.label());
                    is_exited = true;
                    // On a zero exit we keep reading: the output may be
                    // cached and must be complete. Anything else and the
                    // remaining output is not worth waiting for.
                    if status != Some(ChildExit::Finished(Some(0))) {
                        debug!("child process failed, skipping reading stdout/stderr");
                        return Ok(status);
                    }
                }
                else => {
                    // Both streams hit EOF in the same select round; flush
                    // whatever partial line is left so the last line of
                    // output is not dropped.
                    if !stdout_buffer.is_empty() {
                        add_trailing_newline(&mut stdout_buffer);
                        stdout_pipe.write_all(&stdout_buffer)?;
                        stdout_buffer.clear();
                    }
                    if !stderr_buffer.is_empty() {
                        add_trailing_newline(&mut stderr_buffer);
                        stdout_pipe.write_all(&stderr_buffer)?;
                        stderr_buffer.clear();
                    }
                    break;
                }
            }
        }
        debug_assert!(stdout_buffer.is_empty(), "buffer should be empty");
        debug_assert!(stderr_buffer.is_empty(), "buffer should be empty");

        Ok(self.wait().await)
    }
}

// A missing trailing newline means we hit EOF mid-line; add one so output
// from other tasks doesn't land on the same line.
fn add_trailing_newline(buffer: &mut Vec<u8>) {
    if buffer.last() != Some(&b'\n') {
        buffer.push(b'\n');
    }
}

impl ChildStateManager {
    async fn handle_child_command(&self, command: Option<ChildCommand>, child: &mut ChildHandle) {
        let exit = match command {
            // A closed channel means every handle is gone; treat it as a
            // stop.
            Some(ChildCommand::Stop) | None => {
                debug!("stopping child process");
                self.shutdown_style.process(child).await
            }
            Some(ChildCommand::Kill) => {
                debug!("killing child process");
                ShutdownStyle::Kill.process(child).await
            }
        };
        trace!("sending child exit after shutdown");
        self.exit_tx.send(Some(exit)).ok();
    }

    async fn handle_child_exit(&self, status: io::Result<Option<i32>>) {
        // When a shutdown was initiated, `ShutdownStyle::process` already
        // produced the authoritative exit; the plain wait result would
        // misreport the child as externally killed.
        if self.shutdown_initiated {
            return;
        }

        debug!("child process exited normally");
        let child_exit = match status {
            Ok(Some(c)) => ChildExit::Finished(Some(c)),
            // No exit code means someone else killed it.
            Ok(None) => ChildExit::KilledExternal,
            Err(_e) => ChildExit::Failed,
        };

        trace!("sending child exit");
        self.exit_tx.send(Some(child_exit)).ok();
    }
}

#[cfg(test)]
impl Child {
    fn is_running(&self) -> bool {
        !self.command_channel.0.is_closed()
    }
}
