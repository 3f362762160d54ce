//! Disk side of [`EncodedFileWriter`](super::file_writer::EncodedFileWriter).
//!
//! The render thread encodes into a byte ring; a `file-writer` thread drains
//! the ring to disk and keeps the container header current:
//!
//! ```text
//! render thread ──encode──▶ [SPSC byte ring] ──▶ file-writer thread ──▶ file
//!                                                  (write, patch header)
//! ```
//!
//! The render thread never touches the file. A failed write trims the file
//! back to the last complete write, so the header and the data on disk
//! always agree.

use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapCons};

use crate::models::error::RecorderError;
use crate::models::format::StreamFormatDescriptor;
use crate::storage::container::{Container, MAX_HEADER_SIZE};

/// Staged bytes are written out at least this often, even below the flush threshold.
const DRAIN_INTERVAL: Duration = Duration::from_millis(100);
const IO_CHUNK: usize = 64 * 1024;

/// Seekable byte destination of a recording. Implemented for [`File`].
pub trait Sink: Write + Seek + Send {
    /// Truncate or extend to exactly `len` bytes.
    fn set_len(&mut self, len: u64) -> io::Result<()>;
}

impl Sink for File {
    fn set_len(&mut self, len: u64) -> io::Result<()> {
        File::set_len(self, len)
    }
}

/// Failure state and progress shared by the render side and the disk thread.
#[derive(Debug, Default)]
pub(crate) struct DiskShared {
    failed: AtomicBool,
    error: Mutex<Option<RecorderError>>,
    /// Frames handed to the encoder so far, for headers of compressed streams.
    pub(crate) frames: AtomicU64,
}

impl DiskShared {
    pub(crate) fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// The first failure, if any.
    pub(crate) fn error(&self) -> Option<RecorderError> {
        if !self.has_failed() {
            return None;
        }
        self.error.lock().clone()
    }

    /// Record a failure. Later failures are ignored.
    pub(crate) fn fail(&self, error: RecorderError) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(error);
            self.failed.store(true, Ordering::Release);
        }
    }
}

/// The open file with its header bookkeeping. Owned by the disk thread while
/// recording, and handed back to the control thread for the final close.
pub(crate) struct DiskFile {
    sink: Box<dyn Sink>,
    path: PathBuf,
    container: Container,
    stream: StreamFormatDescriptor,
    header: Vec<u8>,
    header_len: usize,
    header_on_disk: bool,
    data_on_disk: u64,
    shared: Arc<DiskShared>,
}

impl DiskFile {
    /// Write the provisional header. A failure is recorded in `shared` and
    /// reported by the first append, like any later write failure.
    pub(crate) fn create(
        sink: Box<dyn Sink>,
        path: &Path,
        container: Container,
        stream: StreamFormatDescriptor,
        shared: Arc<DiskShared>,
    ) -> Self {
        let mut file = Self {
            sink,
            path: path.to_path_buf(),
            container,
            stream,
            header: Vec::with_capacity(MAX_HEADER_SIZE),
            header_len: container.header_len(&stream),
            header_on_disk: false,
            data_on_disk: 0,
            shared,
        };
        if file.header_len > 0 {
            file.container
                .write_header(&file.stream, 0, 0, false, &mut file.header);
            match file.sink.write_all(&file.header) {
                Ok(()) => file.header_on_disk = true,
                Err(e) => {
                    log::warn!("provisional header for {} not written: {}", path.display(), e);
                    file.roll_back();
                    file.shared.fail(write_error(path, e));
                }
            }
        }
        file
    }

    pub(crate) fn data_on_disk(&self) -> u64 {
        self.data_on_disk
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Append encoded bytes. Once a write has failed nothing more is written.
    pub(crate) fn write_data(&mut self, bytes: &[u8]) -> Result<(), RecorderError> {
        if let Some(error) = self.shared.error() {
            return Err(error);
        }
        if bytes.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.sink.write_all(bytes) {
            let error = write_error(&self.path, e);
            self.roll_back();
            self.shared.fail(error.clone());
            return Err(error);
        }
        self.data_on_disk += bytes.len() as u64;
        Ok(())
    }

    /// Trailing byte that keeps IFF chunks even-sized. Not counted as data.
    pub(crate) fn write_pad(&mut self) -> Result<(), RecorderError> {
        if let Err(e) = self.sink.write_all(&[0]) {
            let error = write_error(&self.path, e);
            self.roll_back();
            self.shared.fail(error.clone());
            return Err(error);
        }
        Ok(())
    }

    /// Regenerate the header in place for the data written so far.
    pub(crate) fn patch_header(&mut self, frames_appended: u64, finished: bool) -> Result<(), RecorderError> {
        if self.header_len == 0 || !self.header_on_disk {
            return Ok(());
        }
        let frames = match self.stream.bytes_per_frame {
            0 => frames_appended,
            bpf => self.data_on_disk / u64::from(bpf),
        };
        self.container
            .write_header(&self.stream, self.data_on_disk, frames, finished, &mut self.header);
        self.sink
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.sink.write_all(&self.header))
            .and_then(|_| self.sink.seek(SeekFrom::End(0)))
            .map(|_| ())
            .map_err(|e| write_error(&self.path, e))
    }

    pub(crate) fn sync(&mut self) -> Result<(), RecorderError> {
        self.sink.flush().map_err(|e| write_error(&self.path, e))
    }

    /// Cut off whatever a failed write left behind the last complete write.
    fn roll_back(&mut self) {
        let len = if self.header_on_disk {
            self.header_len as u64 + self.data_on_disk
        } else {
            0
        };
        let trimmed = self
            .sink
            .set_len(len)
            .and_then(|_| self.sink.seek(SeekFrom::Start(len)));
        if let Err(e) = trimmed {
            log::warn!("could not trim {} back to {} bytes: {}", self.path.display(), len, e);
        }
    }

    /// Move everything queued in the ring to disk, then refresh the header.
    fn drain(&mut self, consumer: &mut HeapCons<u8>, chunk: &mut [u8]) {
        let mut wrote = false;
        loop {
            let n = consumer.pop_slice(chunk);
            if n == 0 {
                break;
            }
            if self.shared.has_failed() {
                // Dropped: the session is over.
                continue;
            }
            match self.write_data(&chunk[..n]) {
                Ok(()) => wrote = true,
                Err(e) => log::error!("{}", e),
            }
        }
        if wrote {
            let frames = self.shared.frames.load(Ordering::Acquire);
            if let Err(e) = self.patch_header(frames, false) {
                log::error!("{}", e);
                self.shared.fail(e);
            }
        }
    }
}

pub(crate) enum DiskCommand {
    /// More than a flush threshold of bytes is waiting.
    Wake,
    /// Drain the ring and report whether everything so far reached the disk.
    Flush(Sender<Result<(), RecorderError>>),
    /// Drain the ring and hand the file back.
    Finish,
    /// Hand the file back without writing what is queued.
    Abort,
}

/// Handle to a running `file-writer` thread.
pub(crate) struct DiskThread {
    commands: Sender<DiskCommand>,
    handle: JoinHandle<DiskFile>,
}

impl DiskThread {
    pub(crate) fn spawn(file: DiskFile, consumer: HeapCons<u8>) -> io::Result<Self> {
        // Room for the control commands on top of a pending wake.
        let (commands, receiver) = bounded(4);
        let handle = thread::Builder::new()
            .name("file-writer".into())
            .spawn(move || run(file, consumer, receiver))?;
        Ok(Self { commands, handle })
    }

    /// Nudge the thread from the render side. Never blocks.
    pub(crate) fn wake(&self) {
        let _ = self.commands.try_send(DiskCommand::Wake);
    }

    /// Block until everything queued so far has been written.
    pub(crate) fn flush(&self) -> Result<(), RecorderError> {
        let (reply, done) = bounded(1);
        self.commands
            .send(DiskCommand::Flush(reply))
            .map_err(|_| RecorderError::Write("file writer thread has exited".into()))?;
        done.recv()
            .map_err(|_| RecorderError::Write("file writer thread has exited".into()))?
    }

    pub(crate) fn finish(self) -> Result<DiskFile, RecorderError> {
        self.stop(DiskCommand::Finish)
    }

    pub(crate) fn abort(self) -> Result<DiskFile, RecorderError> {
        self.stop(DiskCommand::Abort)
    }

    fn stop(self, command: DiskCommand) -> Result<DiskFile, RecorderError> {
        // A closed channel means the thread is already on its way out.
        let _ = self.commands.send(command);
        drop(self.commands);
        self.handle
            .join()
            .map_err(|_| RecorderError::Write("file writer thread panicked".into()))
    }
}

fn run(mut file: DiskFile, mut consumer: HeapCons<u8>, commands: Receiver<DiskCommand>) -> DiskFile {
    let mut chunk = vec![0u8; IO_CHUNK];
    loop {
        let command = commands.recv_timeout(DRAIN_INTERVAL);
        if matches!(command, Ok(DiskCommand::Abort)) {
            return file;
        }
        file.drain(&mut consumer, &mut chunk);
        match command {
            Ok(DiskCommand::Flush(reply)) => {
                let status = match file.shared.error() {
                    Some(error) => Err(error),
                    None => Ok(()),
                };
                let _ = reply.send(status);
            }
            Ok(DiskCommand::Finish) | Err(RecvTimeoutError::Disconnected) => return file,
            Ok(DiskCommand::Wake) | Ok(DiskCommand::Abort) | Err(RecvTimeoutError::Timeout) => {}
        }
    }
}

pub(crate) fn write_error(path: &Path, e: io::Error) -> RecorderError {
    RecorderError::Write(format!("{}: {}", path.display(), e))
}

/// A file on a disk with room for `limit` bytes. A write that crosses the
/// limit lands partially, then fails.
#[cfg(test)]
pub(crate) struct FillingSink {
    pub(crate) file: File,
    pub(crate) limit: u64,
}

#[cfg(test)]
impl Write for FillingSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let room = self.limit.saturating_sub(self.file.stream_position()?);
        if room == 0 {
            return Err(io::Error::other("no space left on device"));
        }
        let n = (buf.len() as u64).min(room) as usize;
        self.file.write(&buf[..n])
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

#[cfg(test)]
impl Seek for FillingSink {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

#[cfg(test)]
impl Sink for FillingSink {
    fn set_len(&mut self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm() -> StreamFormatDescriptor {
        StreamFormatDescriptor::linear_pcm(8000.0, 1, 16, false, false)
    }

    #[test]
    fn failed_write_trims_partial_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trim.wav");
        let sink = FillingSink {
            file: File::create(&path).unwrap(),
            limit: 44 + 100 + 30,
        };
        let shared = Arc::new(DiskShared::default());
        let mut file = DiskFile::create(Box::new(sink), &path, Container::Wave, pcm(), Arc::clone(&shared));

        file.write_data(&[1; 100]).unwrap();
        assert!(matches!(file.write_data(&[2; 100]), Err(RecorderError::Write(_))));
        assert!(shared.has_failed());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 44 + 100);

        // Nothing more goes out once failed.
        assert!(file.write_data(&[3; 2]).is_err());
        assert_eq!(file.data_on_disk(), 100);
    }

    #[test]
    fn unwritable_header_is_recorded_as_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("noheader.wav");
        let sink = FillingSink {
            file: File::create(&path).unwrap(),
            limit: 10,
        };
        let shared = Arc::new(DiskShared::default());
        let _file = DiskFile::create(Box::new(sink), &path, Container::Wave, pcm(), Arc::clone(&shared));

        assert!(matches!(shared.error(), Some(RecorderError::Write(_))));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn first_failure_wins() {
        let shared = DiskShared::default();
        assert_eq!(shared.error(), None);
        shared.fail(RecorderError::Write("first".into()));
        shared.fail(RecorderError::Write("second".into()));
        assert_eq!(shared.error(), Some(RecorderError::Write("first".into())));
    }
}
