use super::capture_buffer::CaptureBuffer;

/// Interleave a planar capture into `output` with `out_channels` channels.
///
/// Channel layout rules:
/// - equal counts copy straight across,
/// - many-to-mono averages every input channel,
/// - mono-to-many duplicates the single input,
/// - anything else maps output channel `i` to input channel `i % inputs`.
///
/// `output` is cleared first and never shrinks its capacity.
pub fn interleave_mapped(buffer: &CaptureBuffer, out_channels: usize, output: &mut Vec<f32>) {
    output.clear();
    let frames = buffer.frames();
    let in_channels = buffer.channel_count();
    if frames == 0 || out_channels == 0 {
        return;
    }

    if out_channels == 1 && in_channels > 1 {
        let scale = 1.0 / in_channels as f32;
        for frame in 0..frames {
            let sum: f32 = (0..in_channels).map(|c| buffer.channel(c)[frame]).sum();
            output.push(sum * scale);
        }
        return;
    }

    for frame in 0..frames {
        for c in 0..out_channels {
            output.push(buffer.channel(c % in_channels)[frame]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded(samples: &[f32], channels: usize) -> CaptureBuffer {
        let mut buf = CaptureBuffer::new(channels, 16);
        buf.load_interleaved(samples, channels);
        buf
    }

    #[test]
    fn equal_channels_reinterleave() {
        let buf = loaded(&[0.1, 0.2, 0.3, 0.4], 2);
        let mut out = Vec::new();
        interleave_mapped(&buf, 2, &mut out);
        assert_eq!(out, vec![0.1, 0.2, 0.3, 0.4]);
    }

    #[test]
    fn stereo_to_mono_averages() {
        let buf = loaded(&[0.5, -0.5, 1.0, 0.0], 2);
        let mut out = Vec::new();
        interleave_mapped(&buf, 1, &mut out);
        assert_eq!(out.len(), 2);
        assert!((out[0] - 0.0).abs() < 1e-6);
        assert!((out[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn mono_to_stereo_duplicates() {
        let buf = loaded(&[0.25, 0.75], 1);
        let mut out = Vec::new();
        interleave_mapped(&buf, 2, &mut out);
        assert_eq!(out, vec![0.25, 0.25, 0.75, 0.75]);
    }

    #[test]
    fn wider_layouts_wrap_around() {
        let buf = loaded(&[1.0, 2.0, 3.0], 3);
        let mut out = Vec::new();
        interleave_mapped(&buf, 2, &mut out);
        assert_eq!(out, vec![1.0, 2.0]);

        let buf = loaded(&[1.0, 2.0], 2);
        interleave_mapped(&buf, 4, &mut out);
        assert_eq!(out, vec![1.0, 2.0, 1.0, 2.0]);
    }
}
