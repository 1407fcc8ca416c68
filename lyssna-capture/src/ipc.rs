//! Out-of-process worker transport.
//!
//! Spawns a capture worker with no shell, its stdin/stdout wired to a
//! framed endpoint and stderr surfaced line by line. Teardown is staged:
//! the outbound buffer drains to EOF, SIGTERM goes out immediately, and
//! SIGKILL follows if the worker is still alive after the configured grace.

use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use lyssna_config::CaptureConfig;
use lyssna_proto::endpoint::{CloseReason, EndpointConfig, FramedEndpoint};
use lyssna_proto::Frame;

use crate::driver::{SourceTransport, TransportEvents};
use crate::error::CaptureError;

struct ExitFlag {
    exited: Mutex<bool>,
    cv: Condvar,
}

pub struct IpcTransport {
    endpoint: Arc<FramedEndpoint>,
    pid: u32,
    kill_grace: Duration,
    exit: Arc<ExitFlag>,
    closed: AtomicBool,
}

impl IpcTransport {
    /// Spawns `executable` and starts the I/O threads. The returned
    /// transport owns the worker for its whole lifetime.
    pub fn spawn(
        executable: &Path,
        events: TransportEvents,
        config: &CaptureConfig,
    ) -> Result<Arc<Self>, CaptureError> {
        let TransportEvents {
            on_frame,
            mut on_closed,
            mut on_stderr,
            mut on_exit,
        } = events;

        let mut child = Command::new(executable)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| CaptureError::Spawn {
                command: executable.display().to_string(),
                source,
            })?;

        let pid = child.id();
        debug!(pid, command = %executable.display(), "capture worker spawned");

        let endpoint = Arc::new(FramedEndpoint::new(
            EndpointConfig {
                inbound_buffer_bytes: config.endpoint.inbound_bytes,
                outbound_buffer_bytes: config.endpoint.outbound_bytes,
            },
            on_frame,
        ));
        let exit = Arc::new(ExitFlag {
            exited: Mutex::new(false),
            cv: Condvar::new(),
        });

        let mut stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let writer_endpoint = Arc::clone(&endpoint);
        std::thread::Builder::new()
            .name("lyssna-io-w".into())
            .spawn(move || {
                while let Some(chunk) = writer_endpoint.next_outbound() {
                    if let Err(e) = stdin.write_all(&chunk) {
                        trace!(error = %e, "worker stdin rejected write");
                        writer_endpoint.close(CloseReason::TransportEof);
                        break;
                    }
                }
                // Dropping stdin is the worker's EOF.
            })
            .expect("failed to spawn worker writer thread");

        let reader_endpoint = Arc::clone(&endpoint);
        std::thread::Builder::new()
            .name("lyssna-io-r".into())
            .spawn(move || {
                let mut stdout = stdout;
                let mut buf = [0u8; 8192];
                loop {
                    match stdout.read(&mut buf) {
                        Ok(0) => {
                            reader_endpoint.close(CloseReason::TransportEof);
                            break;
                        }
                        Ok(n) => {
                            reader_endpoint.on_bytes_available(&buf[..n]);
                            if reader_endpoint.close_reason().is_some() {
                                break;
                            }
                        }
                        Err(e) => {
                            trace!(error = %e, "worker stdout read failed");
                            reader_endpoint.close(CloseReason::TransportEof);
                            break;
                        }
                    }
                }
                let reason = reader_endpoint
                    .close_reason()
                    .unwrap_or(CloseReason::TransportEof);
                on_closed(reason);
            })
            .expect("failed to spawn worker reader thread");

        std::thread::Builder::new()
            .name("lyssna-io-e".into())
            .spawn(move || {
                for line in BufReader::new(stderr).lines() {
                    match line {
                        Ok(line) => on_stderr(line),
                        Err(_) => break,
                    }
                }
            })
            .expect("failed to spawn worker stderr thread");

        let reaper_exit = Arc::clone(&exit);
        std::thread::Builder::new()
            .name("lyssna-reap".into())
            .spawn(move || {
                let status = child.wait();
                {
                    let mut exited = reaper_exit.exited.lock();
                    *exited = true;
                }
                reaper_exit.cv.notify_all();
                let code = status.ok().and_then(|s| s.code());
                debug!(pid, ?code, "capture worker exited");
                on_exit(code);
            })
            .expect("failed to spawn worker reaper thread");

        Ok(Arc::new(Self {
            endpoint,
            pid,
            kill_grace: config.kill_grace(),
            exit,
            closed: AtomicBool::new(false),
        }))
    }
}

impl SourceTransport for IpcTransport {
    fn write_frame(&self, frame: Frame) -> Result<(), CaptureError> {
        self.endpoint.write_frame(frame).map_err(CaptureError::from)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.endpoint.close(CloseReason::Shutdown);

        let pid = Pid::from_raw(self.pid as i32);
        if let Err(e) = signal::kill(pid, Signal::SIGTERM) {
            trace!(%pid, error = %e, "SIGTERM not delivered");
        }

        let exit = Arc::clone(&self.exit);
        let grace = self.kill_grace;
        let spawned = std::thread::Builder::new()
            .name("lyssna-kill".into())
            .spawn(move || {
                let mut exited = exit.exited.lock();
                if !*exited {
                    exit.cv.wait_for(&mut exited, grace);
                }
                if !*exited {
                    warn!(%pid, "worker ignored SIGTERM, escalating");
                    let _ = signal::kill(pid, Signal::SIGKILL);
                }
            });
        if spawned.is_err() {
            // Could not stage the escalation; take the blunt path now.
            let _ = signal::kill(pid, Signal::SIGKILL);
        }
    }

    fn child_pid(&self) -> Option<u32> {
        Some(self.pid)
    }
}

impl Drop for IpcTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lyssna_proto::frame::msg;
    use std::sync::mpsc;
    use std::time::Duration;

    fn quiet_events() -> (
        TransportEvents,
        mpsc::Receiver<Frame>,
        mpsc::Receiver<Option<i32>>,
    ) {
        let (frame_tx, frame_rx) = mpsc::channel();
        let (exit_tx, exit_rx) = mpsc::channel();
        let events = TransportEvents {
            on_frame: Box::new(move |f| {
                let _ = frame_tx.send(f);
            }),
            on_closed: Box::new(|_| {}),
            on_stderr: Box::new(|_| {}),
            on_exit: Box::new(move |code| {
                let _ = exit_tx.send(code);
            }),
        };
        (events, frame_rx, exit_rx)
    }

    #[test]
    fn spawn_failure_is_reported() {
        let (events, _frames, _exits) = quiet_events();
        let result = IpcTransport::spawn(
            Path::new("/nonexistent/lyssna-capture-worker"),
            events,
            &CaptureConfig::default(),
        );
        assert!(matches!(result, Err(CaptureError::Spawn { .. })));
    }

    #[test]
    fn echo_worker_roundtrips_frames() {
        // `cat` echoes our own frames back, exercising the whole
        // stdin -> stdout -> endpoint -> handler path.
        let (events, frames, _exits) = quiet_events();
        let transport =
            IpcTransport::spawn(Path::new("/bin/cat"), events, &CaptureConfig::default())
                .expect("cat should spawn");

        transport
            .write_frame(Frame::new(msg::HELLO).with_transaction(5))
            .unwrap();
        let echoed = frames
            .recv_timeout(Duration::from_secs(5))
            .expect("echoed frame");
        assert_eq!(echoed.frame_type, msg::HELLO);
        assert_eq!(echoed.transaction_id, 5);

        transport.close();
    }

    #[test]
    fn worker_exit_code_surfaces() {
        let (events, _frames, exits) = quiet_events();
        let _transport =
            IpcTransport::spawn(Path::new("/bin/false"), events, &CaptureConfig::default())
                .expect("false should spawn");
        let code = exits.recv_timeout(Duration::from_secs(5)).expect("exit");
        assert_eq!(code, Some(1));
    }

    #[test]
    fn close_terminates_worker() {
        let (events, _frames, exits) = quiet_events();
        let transport =
            IpcTransport::spawn(Path::new("/bin/cat"), events, &CaptureConfig::default())
                .expect("cat should spawn");
        assert!(transport.child_pid().is_some());
        transport.close();
        assert!(exits.recv_timeout(Duration::from_secs(5)).is_ok());
    }
}
