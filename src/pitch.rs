//! Fundamental-frequency detection for instrument recordings.
//!
//! Autocorrelation via the cumulative-mean-normalized difference
//! function, with parabolic refinement of the detected lag for
//! sub-sample accuracy. Tuned for the singing range.

/// Lowest detectable fundamental, in Hz.
const MIN_FREQ: f32 = 55.0;
/// Highest detectable fundamental, in Hz.
const MAX_FREQ: f32 = 2000.0;
/// First CMND dip below this value is taken as the period.
const DIP_THRESHOLD: f32 = 0.15;

/// Estimate the fundamental frequency of a mono buffer, in Hz.
///
/// Returns `None` when the buffer is too short to cover two periods of
/// the lowest detectable pitch, or when no periodicity is found at all.
pub fn detect_frequency(samples: &[f32], sample_rate: u32) -> Option<f32> {
    let sr = sample_rate as f32;
    let min_lag = (sr / MAX_FREQ).ceil() as usize;
    let max_lag = (sr / MIN_FREQ).floor() as usize;

    if min_lag == 0 || samples.len() < max_lag * 2 {
        return None;
    }

    let window = max_lag.min(samples.len() / 2);

    // Difference function: energy of the signal minus itself shifted by tau.
    let mut diff = vec![0.0f32; window + 1];
    for tau in 1..=window {
        let mut sum = 0.0;
        for j in 0..window {
            let d = samples[j] - samples[j + tau];
            sum += d * d;
        }
        diff[tau] = sum;
    }

    // Cumulative mean normalization keeps the zero-lag trough from
    // winning and makes the dip threshold scale-free.
    let mut cmnd = vec![1.0f32; window + 1];
    let mut running_sum = 0.0;
    for tau in 1..=window {
        running_sum += diff[tau];
        if running_sum > 0.0 {
            cmnd[tau] = diff[tau] * tau as f32 / running_sum;
        }
    }

    let hi = window.min(max_lag);
    let mut best_tau = 0usize;
    let mut best_val = 1.0f32;

    for tau in min_lag..=hi {
        if cmnd[tau] < DIP_THRESHOLD {
            // Walk down to the bottom of this dip.
            let mut t = tau;
            while t + 1 <= hi && cmnd[t + 1] < cmnd[t] {
                t += 1;
            }
            best_tau = t;
            break;
        }
    }

    // No dip under the threshold: fall back to the global minimum.
    if best_tau == 0 {
        for tau in min_lag..=hi {
            if cmnd[tau] < best_val {
                best_val = cmnd[tau];
                best_tau = tau;
            }
        }
    }

    if best_tau == 0 {
        return None;
    }

    let tau_refined = refine_lag(&cmnd, best_tau, window);
    Some(sr / tau_refined)
}

/// Parabolic interpolation over the minimum and its two neighbors.
fn refine_lag(cmnd: &[f32], tau: usize, window: usize) -> f32 {
    if tau == 0 || tau >= window {
        return tau as f32;
    }
    let alpha = cmnd[tau - 1];
    let beta = cmnd[tau];
    let gamma = cmnd[tau + 1];
    let denom = alpha - 2.0 * beta + gamma;
    if denom.abs() > 1e-12 {
        tau as f32 + 0.5 * (alpha - gamma) / denom
    } else {
        tau as f32
    }
}
