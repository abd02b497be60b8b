//! Process backend: each worker is a forked child connected to the consumer
//! by a unix socket pair.
//!
//! ```text
//!   consumer process                         worker process (fork)
//!  ┌──────────────────────┐   tasks        ┌──────────────────────┐
//!  │ ProcessWorker.stream ├───────────────>│ SocketPort           │
//!  │                      │   envelopes    │   run_worker(..)     │
//!  │ reader thread <──────┼────────────────┤                      │
//!  └─────────┬────────────┘                └──────────────────────┘
//!            │ WorkerEvent
//!            ↓
//!     shared result channel
//! ```
//!
//! Shutting down the parent's end of the socket wakes both the child (EOF on
//! its next read, EPIPE on its next write) and the parent's reader thread.
//! When the consumer process itself dies, the kernel closes its end and the
//! child exits the same way. A worker that dies unexpectedly is observed
//! through `waitpid`.

use crate::dataloader::workers::codec::{encode_envelope, read_frame, write_frame};
use crate::dataloader::workers::pool::WorkerRuntime;
use crate::dataloader::workers::routine::{run_worker, WorkerContext, WorkerPort};
use crate::dataloader::workers::{ResultEnvelope, WorkerEvent, WorkerTask};
use anyhow::{anyhow, Context, Result};
use crossbeam_channel::Sender;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Write;
use std::net::Shutdown;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::panic::{self, AssertUnwindSafe};
use std::thread;

/// The child's end of the socket.
struct SocketPort {
    stream: UnixStream,
}

impl<B: Serialize> WorkerPort<B> for SocketPort {
    fn recv(&mut self) -> Option<WorkerTask> {
        read_frame(&mut self.stream).ok().flatten()
    }

    /// Only a failed write ends the worker; an unencodable batch is answered
    /// with a failure envelope.
    fn send(&mut self, envelope: ResultEnvelope<B>) -> bool {
        encode_envelope(&envelope)
            .and_then(|frame| self.stream.write_all(&frame))
            .is_ok()
    }
}

pub(crate) struct ProcessWorker {
    id: usize,
    pid: Pid,
    stream: UnixStream,
    reader_fd: RawFd,
    reader: Option<thread::JoinHandle<()>>,
    status: Option<String>,
    stopping: bool,
}

impl ProcessWorker {
    /// Forks a worker.
    ///
    /// `inherited_fds` are the parent-side sockets of workers spawned earlier
    /// by the same pool. The child closes its copies so that an earlier
    /// worker's connection is owned by the consumer alone.
    pub(crate) fn spawn<B>(
        ctx: WorkerContext<B>,
        events: Sender<WorkerEvent<B>>,
        inherited_fds: &[RawFd],
    ) -> Result<Self>
    where
        B: Serialize + DeserializeOwned + Send + 'static,
    {
        let id = ctx.info.id;
        let (parent_end, child_end) =
            UnixStream::pair().context("Failed to create worker socket pair")?;

        // SAFETY: the child never returns into the caller. It runs the worker
        // loop, which takes no locks shared with other consumer threads, and
        // leaves through `_exit`.
        let fork_result =
            unsafe { fork() }.with_context(|| format!("Failed to fork worker process {id}"))?;

        match fork_result {
            ForkResult::Child => {
                drop(parent_end);
                for &fd in inherited_fds {
                    // SAFETY: these descriptors belong to the consumer's pool
                    // and are never touched by the child again.
                    unsafe {
                        nix::libc::close(fd);
                    }
                }
                let outcome = panic::catch_unwind(AssertUnwindSafe(move || {
                    let mut port = SocketPort { stream: child_end };
                    run_worker(&ctx, &mut port);
                }));
                let code = if outcome.is_ok() { 0 } else { 1 };
                // SAFETY: terminates the child without running the parent's
                // atexit handlers or destructors.
                unsafe { nix::libc::_exit(code) }
            }
            ForkResult::Parent { child } => {
                drop(child_end);
                let mut worker = Self {
                    id,
                    pid: child,
                    reader_fd: parent_end.as_raw_fd(),
                    stream: parent_end,
                    reader: None,
                    status: None,
                    stopping: false,
                };
                if let Err(e) = worker.start_reader(events) {
                    worker.request_stop();
                    worker.force_stop();
                    return Err(e);
                }
                Ok(worker)
            }
        }
    }

    fn start_reader<B>(&mut self, events: Sender<WorkerEvent<B>>) -> Result<()>
    where
        B: DeserializeOwned + Send + 'static,
    {
        let id = self.id;
        let stream = self
            .stream
            .try_clone()
            .with_context(|| format!("Failed to clone socket of worker {id}"))?;
        self.reader_fd = stream.as_raw_fd();
        let handle = thread::Builder::new()
            .name(format!("dataloader-reader-{id}"))
            .spawn(move || forward_results(id, stream, events))
            .with_context(|| format!("Failed to spawn reader thread for worker {id}"))?;
        self.reader = Some(handle);
        Ok(())
    }

    /// Parent-side descriptors a later fork must close.
    pub(crate) fn parent_fds(&self) -> [RawFd; 2] {
        [self.stream.as_raw_fd(), self.reader_fd]
    }

    fn record(&mut self, status: WaitStatus) {
        match status {
            WaitStatus::Exited(_, code) => {
                self.status = Some(format!("exited with code {code}"));
            }
            WaitStatus::Signaled(_, signal, _) => {
                self.status = Some(format!("killed by signal: {signal}"));
            }
            _ => {}
        }
    }
}

/// Decodes envelopes off one worker's socket onto the shared channel until
/// the connection closes.
fn forward_results<B: DeserializeOwned>(
    worker_id: usize,
    mut stream: UnixStream,
    events: Sender<WorkerEvent<B>>,
) {
    loop {
        let event = match read_frame::<_, ResultEnvelope<B>>(&mut stream) {
            Ok(Some(envelope)) => WorkerEvent::Envelope(envelope),
            Ok(None) | Err(_) => WorkerEvent::Disconnected { worker_id },
        };
        let closed = matches!(event, WorkerEvent::Disconnected { .. });
        if events.send(event).is_err() || closed {
            return;
        }
    }
}

impl WorkerRuntime for ProcessWorker {
    fn pid(&self) -> Option<u32> {
        u32::try_from(self.pid.as_raw()).ok()
    }

    fn send(&mut self, task: WorkerTask) -> Result<()> {
        if self.stopping {
            return Err(anyhow!("worker {} is already stopping", self.id));
        }
        write_frame(&mut self.stream, &task)
            .with_context(|| format!("Failed to send task to worker {} (pid {})", self.id, self.pid))
    }

    fn exit_status(&mut self) -> Option<String> {
        if self.status.is_none() {
            match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(status) => self.record(status),
                Err(Errno::ECHILD) => self.status = Some("already reaped".to_owned()),
                Err(_) => {}
            }
        }
        self.status.clone()
    }

    fn request_stop(&mut self) {
        if self.stopping {
            return;
        }
        self.stopping = true;
        // Best effort: the shutdown below is what the child reliably observes.
        if self.stream.set_nonblocking(true).is_ok() {
            let _ = write_frame(&mut self.stream, &WorkerTask::Shutdown);
        }
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    fn force_stop(&mut self) {
        if self.exit_status().is_some() {
            return;
        }
        tracing::warn!(
            worker_id = self.id,
            pid = self.pid.as_raw(),
            "worker process did not exit within the grace period, killing it"
        );
        let _ = kill(self.pid, Signal::SIGKILL);
        match waitpid(self.pid, None) {
            Ok(status) => self.record(status),
            Err(_) => self.status = Some("killed by signal: SIGKILL".to_owned()),
        }
    }

    fn reap(&mut self) {
        if self.status.is_none() {
            if let Ok(status) = waitpid(self.pid, None) {
                self.record(status);
            }
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}
