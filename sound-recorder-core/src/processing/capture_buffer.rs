/// Pre-allocated, non-interleaved capture buffer.
///
/// Sized once during `prepare` for one callback period; the render callback
/// only ever copies into the existing storage.
#[derive(Debug)]
pub struct CaptureBuffer {
    channels: Vec<Vec<f32>>,
    frames: usize,
    capacity: usize,
}

impl CaptureBuffer {
    pub fn new(channel_count: usize, capacity_frames: usize) -> Self {
        let channel_count = channel_count.max(1);
        let capacity = capacity_frames.max(1);
        Self {
            channels: (0..channel_count).map(|_| vec![0.0; capacity]).collect(),
            frames: 0,
            capacity,
        }
    }

    /// De-interleave up to `capacity` frames from `samples`.
    ///
    /// If the source carries a different channel count, buffer channel `c`
    /// takes source channel `c % source_channels`. Returns the number of
    /// frames loaded.
    pub fn load_interleaved(&mut self, samples: &[f32], source_channels: usize) -> usize {
        if source_channels == 0 {
            self.frames = 0;
            return 0;
        }
        let frames = (samples.len() / source_channels).min(self.capacity);
        for (c, channel) in self.channels.iter_mut().enumerate() {
            let source = c % source_channels;
            for (frame, slot) in channel[..frames].iter_mut().enumerate() {
                *slot = samples[frame * source_channels + source];
            }
        }
        self.frames = frames;
        frames
    }

    /// Loaded samples of one channel.
    pub fn channel(&self, index: usize) -> &[f32] {
        &self.channels[index][..self.frames]
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.frames == 0
    }

    pub fn clear(&mut self) {
        self.frames = 0;
    }

    /// Peak absolute level across all loaded channels, in `[0.0, 1.0]`.
    pub fn peak_level(&self) -> f32 {
        self.channels
            .iter()
            .map(|channel| super::levels::peak_level(&channel[..self.frames]))
            .fold(0.0f32, f32::max)
    }
}
