/// Streaming linear-interpolation resampler for interleaved audio.
///
/// Carries the last input frame and the fractional read position across
/// calls, so a stream cut into blocks resamples exactly like the whole.
/// `process` writes into a caller-owned vector; once that vector has
/// [`max_output_frames`](Self::max_output_frames) of capacity it never
/// reallocates.
#[derive(Debug, Clone)]
pub struct LinearResampler {
    channels: usize,
    /// Input frames advanced per output frame.
    step: f64,
    /// Read position; 0.0 is the carried frame, 1.0 the first new input frame.
    position: f64,
    previous: Vec<f32>,
    primed: bool,
}

impl LinearResampler {
    pub fn new(source_sample_rate: f64, target_sample_rate: f64, channels: usize) -> Self {
        let channels = channels.max(1);
        Self {
            channels,
            step: source_sample_rate / target_sample_rate,
            position: 1.0,
            previous: vec![0.0; channels],
            primed: false,
        }
    }

    /// Returns input unchanged when rates match within 0.01 Hz-equivalent.
    pub fn is_passthrough(&self) -> bool {
        (self.step - 1.0).abs() < 1e-7
    }

    pub fn max_output_frames(&self, input_frames: usize) -> usize {
        (input_frames as f64 / self.step).ceil() as usize + 2
    }

    pub fn process(&mut self, input: &[f32], output: &mut Vec<f32>) {
        output.clear();
        let ch = self.channels;
        let frames = input.len() / ch;
        if frames == 0 {
            return;
        }
        if self.is_passthrough() {
            output.extend_from_slice(&input[..frames * ch]);
            return;
        }

        if !self.primed {
            self.previous.copy_from_slice(&input[..ch]);
            self.position = 1.0;
            self.primed = true;
        }

        while self.position < frames as f64 {
            let index = self.position as usize;
            let fraction = (self.position - index as f64) as f32;
            for c in 0..ch {
                let a = if index == 0 {
                    self.previous[c]
                } else {
                    input[(index - 1) * ch + c]
                };
                let b = input[index * ch + c];
                output.push(a + (b - a) * fraction);
            }
            self.position += self.step;
        }

        self.position -= frames as f64;
        self.previous
            .copy_from_slice(&input[(frames - 1) * ch..frames * ch]);
    }

    pub fn reset(&mut self) {
        self.position = 1.0;
        self.primed = false;
        self.previous.iter_mut().for_each(|s| *s = 0.0);
    }
}
