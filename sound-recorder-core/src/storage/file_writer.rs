use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use ringbuf::{traits::*, HeapProd, HeapRb};
use sha2::{Digest, Sha256};

use crate::models::config::RecorderConfiguration;
use crate::models::error::RecorderError;
use crate::models::format::{FileType, OutputFormat, StreamFormatDescriptor};
use crate::processing::capture_buffer::CaptureBuffer;
use crate::processing::channel_map::interleave_mapped;
use crate::processing::resampler::LinearResampler;
use crate::storage::container::Container;
use crate::storage::disk_writer::{DiskFile, DiskShared, DiskThread, Sink};
use crate::storage::encoder::{encoder_for, PacketEncoder};

/// Flush thresholds of encoded bytes the ring holds before appends fail.
const RING_THRESHOLDS: usize = 8;

/// Streaming audio file writer.
///
/// Takes planar capture blocks in the client format, maps channels,
/// resamples to the output rate and encodes. Encoding happens on the caller's
/// thread; the encoded bytes go through a preallocated ring to a
/// `file-writer` thread, which writes them out whenever a flush threshold's
/// worth is waiting (and at least every 100 ms). After every write the
/// container header is regenerated in place, so the file on disk is always a
/// valid recording of everything written so far.
///
/// ## File layout
///
/// ```text
/// [fixed-length container header]    written by `open`
/// [encoded audio...]
/// [pad byte, when the container needs even-sized chunks]
/// ```
///
/// ## Failures
///
/// A failed write trims the file back to the last complete write and marks
/// the writer failed: every later `append`, `flush` and `close` returns the
/// same [`RecorderError::Write`]. `close` after a failure only patches the
/// header.
pub struct EncodedFileWriter {
    file_path: PathBuf,
    container: Container,
    stream: StreamFormatDescriptor,
    encoder: Box<dyn PacketEncoder>,
    resampler: LinearResampler,
    mapped: Vec<f32>,
    resampled: Vec<f32>,
    header_len: usize,
    staging: Vec<u8>,
    producer: HeapProd<u8>,
    disk: Option<DiskThread>,
    shared: Arc<DiskShared>,
    flush_threshold: usize,
    unflushed: usize,
    data_bytes: u64,
    pad_bytes: u64,
    frames_written: u64,
    checksum: Option<String>,
}

impl EncodedFileWriter {
    /// Create `path`, write a provisional header and prepare to write
    /// `format` into it.
    ///
    /// `format.file_type` must already be resolved. Blocks passed to
    /// [`append`](Self::append) hold at most `config.period_frames` frames of
    /// `client`; scratch and ring space for that is reserved here so appends
    /// never allocate.
    pub fn open(
        path: &Path,
        format: &OutputFormat,
        client: &StreamFormatDescriptor,
        config: &RecorderConfiguration,
    ) -> Result<Self, RecorderError> {
        Self::open_with(path, format, client, config, |path| {
            File::create(path).map(|file| Box::new(file) as Box<dyn Sink>)
        })
    }

    /// [`open`](Self::open) with the sink made by `create`.
    fn open_with(
        path: &Path,
        format: &OutputFormat,
        client: &StreamFormatDescriptor,
        config: &RecorderConfiguration,
        create: impl FnOnce(&Path) -> io::Result<Box<dyn Sink>>,
    ) -> Result<Self, RecorderError> {
        if path.as_os_str().is_empty() {
            return Err(RecorderError::FileOpen("output path is empty".into()));
        }
        let file_type = format.file_type.unwrap_or(FileType::Caf);
        let container = Container::for_output(file_type, &format.stream)?;
        let encoder = encoder_for(&format.stream)?;
        let sink = create(path).map_err(|e| {
            RecorderError::FileOpen(format!("failed to create {}: {}", path.display(), e))
        })?;

        let out_channels = format.stream.channels_per_frame.max(1) as usize;
        let period = config.period_frames as usize;
        let resampler = LinearResampler::new(client.sample_rate, format.stream.sample_rate, out_channels);
        let max_block_frames = resampler.max_output_frames(period);
        let max_block_bytes = encoder.max_encoded_len(max_block_frames);
        let flush_threshold = config.flush_threshold_bytes;

        let shared = Arc::new(DiskShared::default());
        let file = DiskFile::create(sink, path, container, format.stream, Arc::clone(&shared));
        let header_len = container.header_len(&format.stream);

        let (producer, consumer) =
            HeapRb::<u8>::new(flush_threshold * RING_THRESHOLDS + max_block_bytes).split();
        let disk = DiskThread::spawn(file, consumer).map_err(|e| {
            RecorderError::FileOpen(format!("failed to start file writer for {}: {}", path.display(), e))
        })?;

        log::debug!(
            "opened {} as {:?} ({}-byte header)",
            path.display(),
            container,
            header_len
        );

        Ok(Self {
            file_path: path.to_path_buf(),
            container,
            stream: format.stream,
            encoder,
            resampler,
            mapped: Vec::with_capacity(period * out_channels),
            resampled: Vec::with_capacity(max_block_frames * out_channels),
            header_len,
            staging: Vec::with_capacity(max_block_bytes),
            producer,
            disk: Some(disk),
            shared,
            flush_threshold,
            unflushed: 0,
            data_bytes: 0,
            pad_bytes: 0,
            frames_written: 0,
            checksum: None,
        })
    }

    /// Convert, encode and queue one capture block.
    pub fn append(&mut self, block: &CaptureBuffer) -> Result<(), RecorderError> {
        let out_channels = self.stream.channels_per_frame.max(1) as usize;
        interleave_mapped(block, out_channels, &mut self.mapped);
        let samples = if self.resampler.is_passthrough() {
            std::mem::take(&mut self.mapped)
        } else {
            self.resampler.process(&self.mapped, &mut self.resampled);
            std::mem::take(&mut self.resampled)
        };
        let result = self.append_interleaved(&samples);
        if self.resampler.is_passthrough() {
            self.mapped = samples;
        } else {
            self.resampled = samples;
        }
        result
    }

    /// Encode and queue interleaved f32 frames already in the output format.
    ///
    /// Never blocks on the file: a block that does not fit in the ring is a
    /// write failure, not a wait.
    pub fn append_interleaved(&mut self, samples: &[f32]) -> Result<(), RecorderError> {
        let Some(disk) = self.disk.as_ref() else {
            return Err(RecorderError::Write("file is not open for writing".into()));
        };
        if let Some(error) = self.shared.error() {
            return Err(error);
        }

        self.staging.clear();
        self.encoder.encode(samples, &mut self.staging)?;
        // All or nothing, so a partial packet never reaches the file.
        if self.producer.vacant_len() < self.staging.len() {
            let error = RecorderError::Write(format!(
                "{}: file writer fell behind, {} bytes dropped",
                self.file_path.display(),
                self.staging.len()
            ));
            self.shared.fail(error.clone());
            return Err(error);
        }
        let pushed = self.producer.push_slice(&self.staging);
        self.data_bytes += pushed as u64;
        self.frames_written += (samples.len() / self.stream.channels_per_frame.max(1) as usize) as u64;
        self.shared.frames.store(self.frames_written, Ordering::Release);

        self.unflushed += pushed;
        if self.unflushed >= self.flush_threshold {
            self.unflushed = 0;
            disk.wake();
        }
        Ok(())
    }

    /// Block until every queued byte is on disk under a current header.
    pub fn flush(&mut self) -> Result<(), RecorderError> {
        let disk = self
            .disk
            .as_ref()
            .ok_or_else(|| RecorderError::Write("file is not open".into()))?;
        self.unflushed = 0;
        disk.flush()
    }

    /// Finalize the file: drain, encode the tail, pad, patch sizes, compute
    /// the SHA-256 checksum.
    ///
    /// Calling it again after a successful close returns the same checksum.
    pub fn close(&mut self) -> Result<String, RecorderError> {
        let Some(disk) = self.disk.take() else {
            return self
                .checksum
                .clone()
                .ok_or_else(|| RecorderError::Write("file is not open".into()));
        };
        let mut file = disk.finish()?;

        if let Err(error) = self.write_tail(&mut file) {
            // Leave the file describing what did reach the disk.
            if let Err(e) = file.patch_header(self.frames_written, false) {
                log::debug!("header not patched after failure: {}", e);
            }
            return Err(error);
        }
        drop(file);

        let checksum = sha256_file(&self.file_path)?;
        self.checksum = Some(checksum.clone());
        log::debug!(
            "closed {} ({} bytes, {} frames)",
            self.file_path.display(),
            self.bytes_written(),
            self.frames_written
        );
        Ok(checksum)
    }

    /// Everything after the last queued block, written from the closing thread.
    fn write_tail(&mut self, file: &mut DiskFile) -> Result<(), RecorderError> {
        if let Some(error) = self.shared.error() {
            return Err(error);
        }
        self.staging.clear();
        self.encoder.finish(&mut self.staging)?;
        self.data_bytes += self.staging.len() as u64;
        file.write_data(&self.staging)?;

        if self.container.pads_odd_chunks() && file.data_on_disk() % 2 == 1 {
            file.write_pad()?;
            self.pad_bytes = 1;
        }
        file.patch_header(self.frames_written, true)?;
        file.sync()
    }

    /// Abandon the file and remove it from disk.
    pub fn discard(&mut self) {
        let Some(disk) = self.disk.take() else {
            return;
        };
        if let Err(e) = disk.abort() {
            log::warn!("{}: {}", self.file_path.display(), e);
        }
        // Only ever remove a regular file this writer created.
        let is_regular = fs::metadata(&self.file_path)
            .map(|m| m.is_file())
            .unwrap_or(false);
        if is_regular {
            if let Err(e) = fs::remove_file(&self.file_path) {
                log::warn!("failed to remove {}: {}", self.file_path.display(), e);
            }
        }
    }

    /// Total file size including header, queued data and padding.
    pub fn bytes_written(&self) -> u64 {
        self.header_len as u64 + self.data_bytes + self.pad_bytes
    }

    /// Frames handed to `append`, in the output sample rate.
    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn is_open(&self) -> bool {
        self.disk.is_some()
    }

    /// True once a write has failed; the session cannot continue.
    pub fn has_failed(&self) -> bool {
        self.shared.has_failed()
    }

    pub fn container(&self) -> Container {
        self.container
    }

    /// Path of the output file.
    pub fn file_path(&self) -> &Path {
        &self.file_path
    }
}

impl Drop for EncodedFileWriter {
    fn drop(&mut self) {
        let Some(disk) = self.disk.take() else {
            return;
        };
        match disk.finish() {
            Ok(mut file) => {
                if let Err(e) = file.patch_header(self.frames_written, false) {
                    log::debug!("{}: {}", file.path().display(), e);
                }
            }
            Err(e) => log::warn!("{}: {}", self.file_path.display(), e),
        }
    }
}

/// Compute SHA-256 hex digest of a file.
fn sha256_file(path: &Path) -> Result<String, RecorderError> {
    let mut file = File::open(path)
        .map_err(|e| RecorderError::Write(format!("failed to read file for checksum: {}", e)))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)
        .map_err(|e| RecorderError::Write(format!("failed to read file for checksum: {}", e)))?;
    Ok(hex_encode(&hasher.finalize()))
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::models::format::FormatTag;
    use crate::storage::disk_writer::FillingSink;

    fn u32_le(bytes: &[u8], at: usize) -> u32 {
        u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
    }

    fn wave_16_stereo() -> OutputFormat {
        OutputFormat::new(
            StreamFormatDescriptor::linear_pcm(48000.0, 2, 16, false, false),
            Some(FileType::Wave),
        )
    }

    fn open(path: &Path, format: &OutputFormat, flush_threshold_bytes: usize) -> Result<EncodedFileWriter, RecorderError> {
        let client = StreamFormatDescriptor::float32_non_interleaved(
            format.stream.sample_rate,
            format.stream.channels_per_frame,
        );
        let config = RecorderConfiguration {
            flush_threshold_bytes,
            ..Default::default()
        };
        EncodedFileWriter::open(path, format, &client, &config)
    }

    #[test]
    fn write_plain_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.wav");

        let mut writer = open(&path, &wave_16_stereo(), 4096).unwrap();
        writer.append_interleaved(&[0.0; 8]).unwrap();
        let checksum = writer.close().unwrap();
        assert_eq!(checksum.len(), 64);

        let file_data = fs::read(&path).unwrap();
        assert_eq!(file_data.len(), 44 + 16);
        assert_eq!(&file_data[0..4], b"RIFF");
        assert_eq!(&file_data[8..12], b"WAVE");
        assert_eq!(u32_le(&file_data, 40), 16);
        assert_eq!(writer.frames_written(), 4);
        assert_eq!(writer.bytes_written(), 60);
    }

    #[test]
    fn checksum_matches_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sum.wav");

        let mut writer = open(&path, &wave_16_stereo(), 4096).unwrap();
        writer.append_interleaved(&[0.25, -0.25, 0.5, -0.5]).unwrap();
        let checksum = writer.close().unwrap();

        let expected = hex_encode(&Sha256::digest(fs::read(&path).unwrap()));
        assert_eq!(checksum, expected);
    }

    #[test]
    fn header_is_on_disk_after_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("early.wav");

        let mut writer = open(&path, &wave_16_stereo(), 4096).unwrap();
        let on_disk = fs::read(&path).unwrap();
        assert_eq!(on_disk.len(), 44);
        assert_eq!(&on_disk[0..4], b"RIFF");
        assert_eq!(u32_le(&on_disk, 40), 0);
        writer.discard();
    }

    #[test]
    fn header_tracks_each_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flush.wav");

        let mut writer = open(&path, &wave_16_stereo(), 512).unwrap();

        // 256 stereo frames = 1024 bytes, over the threshold: the writer
        // thread picks them up without being asked.
        writer.append_interleaved(&vec![0.1; 512]).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        let on_disk = loop {
            let on_disk = fs::read(&path).unwrap();
            if on_disk.len() == 44 + 1024 && u32_le(&on_disk, 40) == 1024 {
                break on_disk;
            }
            assert!(Instant::now() < deadline, "data never reached the file");
            thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(u32_le(&on_disk, 4) as usize, on_disk.len() - 8);

        writer.append_interleaved(&vec![0.1; 4]).unwrap();
        writer.flush().unwrap();
        let on_disk = fs::read(&path).unwrap();
        assert_eq!(on_disk.len(), 44 + 1032);
        assert_eq!(u32_le(&on_disk, 40), 1032);

        writer.close().unwrap();
    }

    #[test]
    fn disk_filling_up_keeps_file_consistent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("full.wav");
        let format = OutputFormat::new(
            StreamFormatDescriptor::linear_pcm(8000.0, 1, 16, false, false),
            Some(FileType::Wave),
        );
        let client = StreamFormatDescriptor::float32_non_interleaved(8000.0, 1);
        let config = RecorderConfiguration {
            flush_threshold_bytes: 512,
            ..Default::default()
        };
        let mut writer = EncodedFileWriter::open_with(&path, &format, &client, &config, |path| {
            Ok(Box::new(FillingSink {
                file: File::create(path)?,
                limit: 44 + 2048 + 900,
            }) as Box<dyn Sink>)
        })
        .unwrap();

        writer.append_interleaved(&vec![0.25; 1024]).unwrap();
        writer.flush().unwrap();
        // Only 900 of these 2048 bytes fit.
        writer.append_interleaved(&vec![0.25; 1024]).unwrap();
        assert!(matches!(writer.flush(), Err(RecorderError::Write(_))));
        assert!(writer.has_failed());
        assert!(matches!(
            writer.append_interleaved(&[0.25; 2]),
            Err(RecorderError::Write(_))
        ));

        assert!(matches!(writer.close(), Err(RecorderError::Write(_))));
        let on_disk = fs::read(&path).unwrap();
        assert_eq!(on_disk.len(), 44 + 2048);
        assert_eq!(u32_le(&on_disk, 40), 2048);
        assert_eq!(u32_le(&on_disk, 4) as usize, on_disk.len() - 8);
    }

    #[test]
    fn append_maps_and_resamples_capture_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("converted.wav");
        let format = OutputFormat::new(
            StreamFormatDescriptor::linear_pcm(24000.0, 1, 16, false, false),
            Some(FileType::Wave),
        );
        let client = StreamFormatDescriptor::float32_non_interleaved(48000.0, 2);
        let mut writer =
            EncodedFileWriter::open(&path, &format, &client, &RecorderConfiguration::default()).unwrap();

        let mut block = CaptureBuffer::new(2, 512);
        let stereo: Vec<f32> = (0..200).map(|i| if i % 2 == 0 { 0.5 } else { -0.5 }).collect();
        block.load_interleaved(&stereo, 2);
        writer.append(&block).unwrap();
        writer.close().unwrap();

        assert_eq!(writer.frames_written(), 50);
        let on_disk = fs::read(&path).unwrap();
        assert_eq!(on_disk.len(), 44 + 100);
        // Opposite channels average to silence.
        assert!(on_disk[44..].iter().all(|&b| b == 0));
    }

    #[test]
    fn close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("twice.wav");
        let mut writer = open(&path, &wave_16_stereo(), 4096).unwrap();
        writer.append_interleaved(&[0.5, 0.5]).unwrap();
        let first = writer.close().unwrap();
        assert_eq!(writer.close().unwrap(), first);
    }

    #[test]
    fn odd_wave_data_gets_pad_byte() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("odd.wav");
        let format = OutputFormat::new(
            StreamFormatDescriptor::g711(FormatTag::ULAW, 8000.0, 1),
            Some(FileType::Wave),
        );

        let mut writer = open(&path, &format, 4096).unwrap();
        writer.append_interleaved(&[0.0; 3]).unwrap();
        writer.close().unwrap();

        let on_disk = fs::read(&path).unwrap();
        assert_eq!(on_disk.len(), 58 + 3 + 1);
        assert_eq!(*on_disk.last().unwrap(), 0);
        assert_eq!(u32_le(&on_disk, 54), 3);
    }

    #[test]
    fn missing_directory_is_file_open_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("no/such/dir/out.wav");
        assert!(matches!(
            open(&path, &wave_16_stereo(), 4096),
            Err(RecorderError::FileOpen(_))
        ));
        assert!(matches!(
            open(Path::new(""), &wave_16_stereo(), 4096),
            Err(RecorderError::FileOpen(_))
        ));
    }

    #[test]
    fn discard_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.caf");
        let format = OutputFormat::new(
            StreamFormatDescriptor::linear_pcm(44100.0, 1, 16, false, false),
            Some(FileType::Caf),
        );

        let mut writer = open(&path, &format, 4096).unwrap();
        assert!(path.exists());
        writer.discard();
        assert!(!path.exists());
        assert!(!writer.is_open());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn full_device_surfaces_write_error() {
        let format = OutputFormat::new(
            StreamFormatDescriptor::linear_pcm(44100.0, 1, 16, false, false),
            Some(FileType::Wave),
        );
        // The provisional header already fails; the first append reports it.
        let mut writer = open(Path::new("/dev/full"), &format, 512).unwrap();
        assert!(writer.has_failed());
        let result = writer.append_interleaved(&vec![0.5; 512]);
        assert!(matches!(result, Err(RecorderError::Write(_))));
        writer.discard();
        assert!(Path::new("/dev/full").exists());
    }
}
