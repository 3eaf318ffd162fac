//! PCM16 sample-rate conversion.
//!
//! Linear interpolation is enough for the 8 kHz ↔ 24 kHz hops between the
//! trunk codecs and the Realtime model; telephone audio is band-limited well
//! below the Nyquist of either rate.

/// Resample 16-bit mono PCM from `from_rate` to `to_rate`.
///
/// Returns the input untouched when the rates already match. Output length is
/// `ceil(len * to_rate / from_rate)`.
pub fn resample(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 || to_rate == 0 {
        return samples.to_vec();
    }

    let ratio = to_rate as f64 / from_rate as f64;
    let output_len = (samples.len() as f64 * ratio).ceil() as usize;
    let mut output = Vec::with_capacity(output_len);

    let step = 1.0 / ratio;
    let mut position = 0.0f64;

    while output.len() < output_len {
        let index = position as usize;
        if index >= samples.len() {
            break;
        }
        let fraction = position - index as f64;
        let current = samples[index] as f64;
        let next = if index + 1 < samples.len() {
            samples[index + 1] as f64
        } else {
            current
        };
        output.push((current + (next - current) * fraction).round() as i16);
        position += step;
    }

    output
}

/// Interpret little-endian PCM16 bytes as samples. A trailing odd byte is
/// dropped.
pub fn bytes_to_samples(data: &[u8]) -> Vec<i16> {
    data.chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Serialize samples as little-endian PCM16 bytes.
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}
