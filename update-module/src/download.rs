//! The `Download` state protocol.
//!
//! The driver creates a `stream-next` named pipe in the work directory and
//! invokes the module. A module that wants streaming opens `stream-next`
//! and reads one `streams/<filename>` path per line; the driver writes each
//! payload file into that pipe and finishes the list with an empty line. A
//! module that exits 0 without ever opening `stream-next` gets the payload
//! staged into `files/` instead, and finds it there from `ArtifactInstall`
//! onward. The driver decides between the two purely by whether the module
//! opened `stream-next` before exiting.
//!
//! Plumbing: the payload bytes come out of the (blocking) artifact parser,
//! so the pumping half of the protocol runs on the parser's thread
//! ([`pump_payload`]) while the async half ([`UpdateModule::download`])
//! supervises the child process, decides the mode, and enforces the module
//! timeout. The two halves are connected by [`handshake`].

use crate::error::{self, Error, Result};
use crate::{spawn_error, terminate, ModuleState, UpdateModule};
use log::{debug, info};
use mender_artifact::Payload;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use snafu::ResultExt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// How often the driver re-probes `stream-next`, and the pump re-probes a
/// stream pipe, while waiting for the other side.
const PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// How long the pump may lag behind the module's clean exit before the
/// download counts as incomplete.
const PUMP_GRACE: Duration = Duration::from_secs(10);

/// The driver's decision on how the module wants the payload.
pub enum Mode {
    /// The module opened `stream-next`; the carried file is the write end.
    Streams(File),
    /// The module exited without streaming; stage into `files/`.
    Files,
}

pub struct DriverHandle {
    mode_tx: mpsc::Sender<Option<Mode>>,
    abort: Arc<AtomicBool>,
    pump_done_rx: oneshot::Receiver<()>,
}

pub struct PumpHandle {
    mode_rx: mpsc::Receiver<Option<Mode>>,
    abort: Arc<AtomicBool>,
    pump_done_tx: oneshot::Sender<()>,
}

/// Creates the connected pair for one download.
pub fn handshake() -> (DriverHandle, PumpHandle) {
    let (mode_tx, mode_rx) = mpsc::channel();
    let (pump_done_tx, pump_done_rx) = oneshot::channel();
    let abort = Arc::new(AtomicBool::new(false));
    (
        DriverHandle {
            mode_tx,
            abort: Arc::clone(&abort),
            pump_done_rx,
        },
        PumpHandle {
            mode_rx,
            abort,
            pump_done_tx,
        },
    )
}

impl UpdateModule {
    /// Drives the module's `Download` invocation. Call [`pump_payload`]
    /// with the other half of the handshake from the payload's thread.
    pub async fn download(&self, handle: DriverHandle) -> Result<()> {
        let DriverHandle {
            mode_tx,
            abort,
            pump_done_rx,
        } = handle;
        let result = self.run_download(&mode_tx, pump_done_rx).await;
        if result.is_err() {
            // Unblock a pump still waiting for its instructions or probing
            // a pipe.
            abort.store(true, Ordering::SeqCst);
            let _ = mode_tx.send(None);
        }
        result
    }

    async fn run_download(
        &self,
        mode_tx: &mpsc::Sender<Option<Mode>>,
        pump_done_rx: oneshot::Receiver<()>,
    ) -> Result<()> {
        let state = ModuleState::Download;
        self.check_file_tree(state)?;

        let stream_next = self.work_dir().join("stream-next");
        let _ = fs::remove_file(&stream_next);
        nix::unistd::mkfifo(
            &stream_next,
            nix::sys::stat::Mode::S_IRUSR | nix::sys::stat::Mode::S_IWUSR,
        )
        .context(error::FifoSnafu { path: &stream_next })?;

        let mut child = self
            .spawn(state)
            .map_err(|e| spawn_error(state, self.module_path(), e))?;
        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");
        tokio::spawn(crate::forward_lines(
            stdout,
            "Update module output (stdout): ",
        ));
        tokio::spawn(crate::forward_lines(
            stderr,
            "Update module output (stderr): ",
        ));

        let deadline = tokio::time::Instant::now() + self.timeout();

        enum Decision {
            Streams(File),
            Exited(ExitStatus),
        }

        let decision = loop {
            match open_writer_nonblocking(&stream_next) {
                Ok(file) => break Decision::Streams(file),
                // No reader yet.
                Err(e) if e.raw_os_error() == Some(nix::errno::Errno::ENXIO as i32) => {}
                Err(e) => {
                    return Err(Error::FifoOpen {
                        path: stream_next,
                        source: e,
                    })
                }
            }
            if let Some(status) = child.try_wait().context(error::ModuleWaitSnafu {
                state: state.to_string(),
            })? {
                break Decision::Exited(status);
            }
            if tokio::time::Instant::now() >= deadline {
                terminate(&mut child).await;
                return error::TimeoutSnafu {
                    state: state.to_string(),
                }
                .fail();
            }
            tokio::time::sleep(PROBE_INTERVAL).await;
        };

        match decision {
            Decision::Streams(first_writer) => {
                debug!("Update module opened stream-next; streaming payload");
                mode_tx
                    .send(Some(Mode::Streams(first_writer)))
                    .map_err(|_| Error::Aborted)?;

                let status = match tokio::time::timeout_at(deadline, child.wait()).await {
                    Err(_) => {
                        terminate(&mut child).await;
                        return error::TimeoutSnafu {
                            state: state.to_string(),
                        }
                        .fail();
                    }
                    Ok(status) => status.context(error::ModuleWaitSnafu {
                        state: state.to_string(),
                    })?,
                };
                if !status.success() {
                    return error::NonZeroExitSnafu {
                        state: state.to_string(),
                        code: status.code().unwrap_or(-1),
                    }
                    .fail();
                }
                // The module is done; the pump should be at most a close
                // behind.
                match tokio::time::timeout(PUMP_GRACE, pump_done_rx).await {
                    Ok(Ok(())) => Ok(()),
                    _ => error::DownloadIncompleteSnafu.fail(),
                }
            }
            Decision::Exited(status) => {
                if !status.success() {
                    return error::NonZeroExitSnafu {
                        state: state.to_string(),
                        code: status.code().unwrap_or(-1),
                    }
                    .fail();
                }
                debug!("Update module did not open stream-next; staging payload into files/");
                mode_tx
                    .send(Some(Mode::Files))
                    .map_err(|_| Error::Aborted)?;
                // Staging isn't bounded by the module timeout; any pump
                // error travels back on the parser side.
                pump_done_rx.await.map_err(|_| Error::Aborted)
            }
        }
    }
}

/// Feeds the payload to the module per the driver's decision. Runs on the
/// artifact parser's (blocking) thread, inside the parse callback.
pub fn pump_payload(
    payload: &mut Payload<'_, '_>,
    work_dir: &Path,
    handle: PumpHandle,
) -> Result<()> {
    let PumpHandle {
        mode_rx,
        abort,
        pump_done_tx,
    } = handle;

    let mode = mode_rx
        .recv()
        .map_err(|_| Error::Aborted)?
        .ok_or(Error::Aborted)?;
    match mode {
        Mode::Streams(first_writer) => stream_files(payload, work_dir, first_writer, &abort)?,
        Mode::Files => stage_files(payload, work_dir)?,
    }
    let _ = pump_done_tx.send(());
    Ok(())
}

fn stream_files(
    payload: &mut Payload<'_, '_>,
    work_dir: &Path,
    first_writer: File,
    abort: &AtomicBool,
) -> Result<()> {
    let stream_next_path = work_dir.join("stream-next");
    let mut next_writer = Some(first_writer);
    let mut written: u64 = 0;

    loop {
        if abort.load(Ordering::SeqCst) {
            return Err(Error::Aborted);
        }

        // The module signals "ready for the next entry" by (re)opening
        // stream-next; the first open was performed by the driver.
        let mut writer = match next_writer.take() {
            Some(writer) => writer,
            None => open_fifo_writer(&stream_next_path, abort)?,
        };

        match payload.next_file()? {
            None => {
                // Empty line: end of the payload list.
                writer.write_all(b"\n").context(error::StreamWriteSnafu {
                    path: &stream_next_path,
                })?;
                info!("Update module finished all downloads");
                return Ok(());
            }
            Some(mut file) => {
                let rel = format!("streams/{}", file.name);
                let fifo = work_dir.join(&rel);
                match nix::unistd::mkfifo(
                    &fifo,
                    nix::sys::stat::Mode::S_IRUSR | nix::sys::stat::Mode::S_IWUSR,
                ) {
                    Err(nix::errno::Errno::EEXIST) => {}
                    other => other.context(error::FifoSnafu { path: &fifo })?,
                }

                writer
                    .write_all(format!("{}\n", rel).as_bytes())
                    .context(error::StreamWriteSnafu {
                        path: &stream_next_path,
                    })?;
                drop(writer);

                let mut stream = open_fifo_writer(&fifo, abort)?;
                written += io::copy(&mut file, &mut stream)
                    .context(error::StreamWriteSnafu { path: &fifo })?;
                debug!("Wrote {} bytes to update module", written);
            }
        }
    }
}

/// The fallback: write every payload file to `files/` where the module's
/// later states will find them. The unused pipes are removed first.
fn stage_files(payload: &mut Payload<'_, '_>, work_dir: &Path) -> Result<()> {
    let _ = fs::remove_file(work_dir.join("stream-next"));
    let streams = work_dir.join("streams");
    if let Ok(entries) = fs::read_dir(&streams) {
        for entry in entries.flatten() {
            let _ = fs::remove_file(entry.path());
        }
    }

    let files_dir = work_dir.join("files");
    fs::create_dir_all(&files_dir).context(error::DirCreateSnafu { path: &files_dir })?;

    while let Some(mut file) = payload.next_file()? {
        let path = files_dir.join(&file.name);
        let mut out = File::create(&path).context(error::FileStageSnafu { path: &path })?;
        io::copy(&mut file, &mut out).context(error::FileStageSnafu { path: &path })?;
        out.sync_all().context(error::FileStageSnafu { path: &path })?;
    }
    info!("Downloaded all files to `files` directory");
    Ok(())
}

/// One non-blocking open attempt; ENXIO means no reader has the pipe open.
fn open_writer_nonblocking(path: &Path) -> io::Result<File> {
    let file = OpenOptions::new()
        .write(true)
        .custom_flags(OFlag::O_NONBLOCK.bits())
        .open(path)?;
    // Writes from here on should block normally.
    fcntl(file.as_raw_fd(), FcntlArg::F_SETFL(OFlag::empty()))
        .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
    Ok(file)
}

/// Opens the write end of a pipe, waiting for the module to open the read
/// end, but never blocking past an abort.
fn open_fifo_writer(path: &Path, abort: &AtomicBool) -> Result<File> {
    loop {
        match open_writer_nonblocking(path) {
            Ok(file) => return Ok(file),
            Err(e) if e.raw_os_error() == Some(nix::errno::Errno::ENXIO as i32) => {
                if abort.load(Ordering::SeqCst) {
                    return Err(Error::Aborted);
                }
                std::thread::sleep(PROBE_INTERVAL);
            }
            Err(e) => return Err(Error::FifoOpen {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }
}
