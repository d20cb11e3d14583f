// =============================================================================
// MACD — Moving Average Convergence Divergence
// =============================================================================
//
// MACD = EMA(12) - EMA(26); signal = EMA(9) of MACD; histogram = MACD - signal.
// =============================================================================

use super::ema::calculate_ema;

/// Result of a MACD calculation at the most recent close.
#[derive(Debug, Clone, Copy)]
pub struct MacdResult {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Calculate the latest MACD/signal/histogram triple for `closes`.
///
/// Returns `None` when there is not enough data to seed both the slow EMA
/// and the signal-line EMA of the MACD series.
pub fn calculate_macd(closes: &[f64], fast: usize, slow: usize, signal_period: usize) -> Option<MacdResult> {
    if fast == 0 || slow == 0 || signal_period == 0 || fast >= slow {
        return None;
    }

    let ema_fast = calculate_ema(closes, fast);
    let ema_slow = calculate_ema(closes, slow);
    if ema_fast.is_empty() || ema_slow.is_empty() {
        return None;
    }

    // `ema_fast` starts `slow - fast` samples earlier than `ema_slow` since
    // both are indexed from their own seed point; align on the tail.
    let offset = ema_fast.len().checked_sub(ema_slow.len())?;
    let macd_series: Vec<f64> = ema_slow
        .iter()
        .enumerate()
        .map(|(i, slow_v)| ema_fast[i + offset] - slow_v)
        .collect();

    if macd_series.len() < signal_period {
        return None;
    }

    let signal_series = calculate_ema(&macd_series, signal_period);
    let signal = *signal_series.last()?;
    let macd = *macd_series.last()?;

    Some(MacdResult {
        macd,
        signal,
        histogram: macd - signal,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_data_returns_none() {
        let closes = vec![1.0, 2.0, 3.0];
        assert!(calculate_macd(&closes, 12, 26, 9).is_none());
    }

    #[test]
    fn fast_must_be_less_than_slow() {
        let closes: Vec<f64> = (1..=100).map(|x| x as f64).collect();
        assert!(calculate_macd(&closes, 26, 12, 9).is_none());
    }

    #[test]
    fn trending_series_has_positive_macd() {
        let closes: Vec<f64> = (1..=200).map(|x| x as f64).collect();
        let result = calculate_macd(&closes, 12, 26, 9).expect("should compute");
        // A steadily rising series has the fast EMA above the slow EMA.
        assert!(result.macd > 0.0);
    }

    #[test]
    fn flat_series_has_zero_macd() {
        let closes = vec![100.0; 200];
        let result = calculate_macd(&closes, 12, 26, 9).expect("should compute");
        assert!(result.macd.abs() < 1e-9);
        assert!(result.histogram.abs() < 1e-9);
    }
}
