/// Peak absolute level of `samples`, clamped to `[0.0, 1.0]`.
///
/// This is the recorder's amplitude contract: one peak value per render
/// block, across all channels. NaN samples are ignored.
pub fn peak_level(samples: &[f32]) -> f32 {
    samples
        .iter()
        .map(|s| s.abs())
        .fold(0.0f32, f32::max)
        .min(1.0)
}

/// Convert a linear level to dBFS, floored at -96 dB.
pub fn level_to_dbfs(level: f32) -> f32 {
    if level <= 0.0 {
        return -96.0;
    }
    (20.0 * level.log10()).max(-96.0)
}
