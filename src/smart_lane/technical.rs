//! Technical indicator battery
//!
//! Per-timeframe computation of the standard indicator set (RSI, MACD,
//! moving-average cross, Bollinger bands, Stochastic, Williams %R, CCI,
//! ROC), each voting buy/sell/neutral, aggregated into a per-timeframe
//! signal with a strength in [0, 1].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::risk::types::PricePoint;

/// Direction of an aggregated signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalDirection {
    Buy,
    Sell,
    Neutral,
}

/// Aggregated technical signal for one timeframe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TechnicalSignal {
    pub timeframe_minutes: u32,
    pub signal: SignalDirection,
    pub strength: f64,
    pub confidence: f64,
    /// Individual indicator votes (-1 sell, 0 neutral, +1 buy)
    pub votes: Vec<(String, i8)>,
}

/// Cross-timeframe summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TechnicalSummary {
    pub overall_signal: SignalDirection,
    pub average_strength: f64,
    pub average_confidence: f64,
    pub buy_timeframes: usize,
    pub sell_timeframes: usize,
    pub neutral_timeframes: usize,
}

impl Default for TechnicalSummary {
    fn default() -> Self {
        Self {
            overall_signal: SignalDirection::Neutral,
            average_strength: 0.0,
            average_confidence: 0.0,
            buy_timeframes: 0,
            sell_timeframes: 0,
            neutral_timeframes: 0,
        }
    }
}

/// Resample a price history into closes per `timeframe_minutes` bucket.
pub fn resample_closes(history: &[PricePoint], timeframe_minutes: u32) -> Vec<f64> {
    if history.is_empty() || timeframe_minutes == 0 {
        return Vec::new();
    }
    let mut sorted: Vec<&PricePoint> = history.iter().collect();
    sorted.sort_by_key(|p| p.timestamp);

    let bucket_secs = timeframe_minutes as i64 * 60;
    let mut closes = Vec::new();
    let mut current_bucket: Option<i64> = None;

    for point in sorted {
        let bucket = point.timestamp.timestamp() / bucket_secs;
        match current_bucket {
            Some(b) if b == bucket => {
                *closes.last_mut().unwrap() = point.price;
            }
            _ => {
                current_bucket = Some(bucket);
                closes.push(point.price);
            }
        }
    }
    closes
}

fn sma(values: &[f64], period: usize) -> Option<f64> {
    if values.len() < period || period == 0 {
        return None;
    }
    Some(values[values.len() - period..].iter().sum::<f64>() / period as f64)
}

fn ema(values: &[f64], period: usize) -> Option<f64> {
    if values.len() < period || period == 0 {
        return None;
    }
    let alpha = 2.0 / (period as f64 + 1.0);
    let mut ema = values[..period].iter().sum::<f64>() / period as f64;
    for v in &values[period..] {
        ema = alpha * v + (1.0 - alpha) * ema;
    }
    Some(ema)
}

fn stddev(values: &[f64], period: usize) -> Option<f64> {
    if values.len() < period || period < 2 {
        return None;
    }
    let window = &values[values.len() - period..];
    let mean = window.iter().sum::<f64>() / period as f64;
    let var = window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / period as f64;
    Some(var.sqrt())
}

/// Relative Strength Index over 14 closes
pub fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if closes.len() < period + 1 {
        return None;
    }
    let window = &closes[closes.len() - period - 1..];
    let mut gains = 0.0;
    let mut losses = 0.0;
    for pair in window.windows(2) {
        let delta = pair[1] - pair[0];
        if delta >= 0.0 {
            gains += delta;
        } else {
            losses -= delta;
        }
    }
    if losses == 0.0 {
        return Some(100.0);
    }
    let rs = gains / losses;
    Some(100.0 - 100.0 / (1.0 + rs))
}

/// MACD line minus signal line (12/26/9)
pub fn macd_histogram(closes: &[f64]) -> Option<f64> {
    if closes.len() < 35 {
        return None;
    }
    // Build the MACD series over the tail so the signal EMA has inputs.
    let mut macd_series = Vec::new();
    for end in 26..=closes.len() {
        let window = &closes[..end];
        let fast = ema(window, 12)?;
        let slow = ema(window, 26)?;
        macd_series.push(fast - slow);
    }
    let signal = ema(&macd_series, 9)?;
    Some(macd_series.last().unwrap() - signal)
}

fn vote_rsi(closes: &[f64]) -> Option<i8> {
    let value = rsi(closes, 14)?;
    Some(if value < 30.0 {
        1
    } else if value > 70.0 {
        -1
    } else {
        0
    })
}

fn vote_macd(closes: &[f64]) -> Option<i8> {
    let hist = macd_histogram(closes)?;
    Some(if hist > 0.0 { 1 } else if hist < 0.0 { -1 } else { 0 })
}

fn vote_ma_cross(closes: &[f64]) -> Option<i8> {
    let fast = sma(closes, 9)?;
    let slow = sma(closes, 21)?;
    let spread = (fast - slow) / slow;
    Some(if spread > 0.005 {
        1
    } else if spread < -0.005 {
        -1
    } else {
        0
    })
}

fn vote_bollinger(closes: &[f64]) -> Option<i8> {
    let mid = sma(closes, 20)?;
    let sd = stddev(closes, 20)?;
    let last = *closes.last()?;
    Some(if last < mid - 2.0 * sd {
        1
    } else if last > mid + 2.0 * sd {
        -1
    } else {
        0
    })
}

fn vote_stochastic(closes: &[f64]) -> Option<i8> {
    if closes.len() < 14 {
        return None;
    }
    let window = &closes[closes.len() - 14..];
    let low = window.iter().copied().fold(f64::MAX, f64::min);
    let high = window.iter().copied().fold(f64::MIN, f64::max);
    if high <= low {
        return Some(0);
    }
    let k = (closes.last()? - low) / (high - low) * 100.0;
    Some(if k < 20.0 {
        1
    } else if k > 80.0 {
        -1
    } else {
        0
    })
}

fn vote_williams_r(closes: &[f64]) -> Option<i8> {
    if closes.len() < 14 {
        return None;
    }
    let window = &closes[closes.len() - 14..];
    let low = window.iter().copied().fold(f64::MAX, f64::min);
    let high = window.iter().copied().fold(f64::MIN, f64::max);
    if high <= low {
        return Some(0);
    }
    let r = (high - closes.last()?) / (high - low) * -100.0;
    Some(if r < -80.0 {
        1
    } else if r > -20.0 {
        -1
    } else {
        0
    })
}

fn vote_cci(closes: &[f64]) -> Option<i8> {
    let period = 20;
    if closes.len() < period {
        return None;
    }
    let mean = sma(closes, period)?;
    let window = &closes[closes.len() - period..];
    let mean_dev =
        window.iter().map(|v| (v - mean).abs()).sum::<f64>() / period as f64;
    if mean_dev == 0.0 {
        return Some(0);
    }
    let cci = (closes.last()? - mean) / (0.015 * mean_dev);
    Some(if cci < -100.0 {
        1
    } else if cci > 100.0 {
        -1
    } else {
        0
    })
}

fn vote_roc(closes: &[f64]) -> Option<i8> {
    let period = 10;
    if closes.len() <= period {
        return None;
    }
    let past = closes[closes.len() - 1 - period];
    if past == 0.0 {
        return Some(0);
    }
    let roc = (closes.last()? - past) / past * 100.0;
    Some(if roc > 2.0 {
        1
    } else if roc < -2.0 {
        -1
    } else {
        0
    })
}

/// Compute the aggregated signal for one timeframe.
pub fn analyze_timeframe(history: &[PricePoint], timeframe_minutes: u32) -> TechnicalSignal {
    let closes = resample_closes(history, timeframe_minutes);

    let voters: [(&str, fn(&[f64]) -> Option<i8>); 8] = [
        ("rsi", vote_rsi),
        ("macd", vote_macd),
        ("ma_cross", vote_ma_cross),
        ("bollinger", vote_bollinger),
        ("stochastic", vote_stochastic),
        ("williams_r", vote_williams_r),
        ("cci", vote_cci),
        ("roc", vote_roc),
    ];

    let mut votes = Vec::new();
    for (name, voter) in voters {
        if let Some(vote) = voter(&closes) {
            votes.push((name.to_string(), vote));
        }
    }

    if votes.is_empty() {
        return TechnicalSignal {
            timeframe_minutes,
            signal: SignalDirection::Neutral,
            strength: 0.0,
            confidence: 0.0,
            votes,
        };
    }

    let sum: i32 = votes.iter().map(|(_, v)| *v as i32).sum();
    let mean = sum as f64 / votes.len() as f64;
    let signal = if mean > 0.15 {
        SignalDirection::Buy
    } else if mean < -0.15 {
        SignalDirection::Sell
    } else {
        SignalDirection::Neutral
    };

    // Confidence grows with indicator coverage and history depth
    let coverage = votes.len() as f64 / voters.len() as f64;
    let depth = (closes.len() as f64 / 50.0).min(1.0);
    let confidence = (0.5 * coverage + 0.5 * depth).clamp(0.0, 1.0);

    TechnicalSignal {
        timeframe_minutes,
        signal,
        strength: mean.abs().clamp(0.0, 1.0),
        confidence,
        votes,
    }
}

/// Summarize the per-timeframe signals into one direction.
pub fn summarize(signals: &[TechnicalSignal]) -> TechnicalSummary {
    if signals.is_empty() {
        return TechnicalSummary::default();
    }

    let buy = signals
        .iter()
        .filter(|s| s.signal == SignalDirection::Buy)
        .count();
    let sell = signals
        .iter()
        .filter(|s| s.signal == SignalDirection::Sell)
        .count();
    let neutral = signals.len() - buy - sell;

    let overall_signal = if buy > sell + neutral {
        SignalDirection::Buy
    } else if sell > buy + neutral {
        SignalDirection::Sell
    } else {
        SignalDirection::Neutral
    };

    TechnicalSummary {
        overall_signal,
        average_strength: signals.iter().map(|s| s.strength).sum::<f64>() / signals.len() as f64,
        average_confidence: signals.iter().map(|s| s.confidence).sum::<f64>()
            / signals.len() as f64,
        buy_timeframes: buy,
        sell_timeframes: sell,
        neutral_timeframes: neutral,
    }
}

/// Build a synthetic history helper for tests and paper mode
pub fn history_from_closes(closes: &[f64], spacing_minutes: u32) -> Vec<PricePoint> {
    let start: DateTime<Utc> =
        Utc::now() - chrono::Duration::minutes((closes.len() as i64) * spacing_minutes as i64);
    closes
        .iter()
        .enumerate()
        .map(|(i, price)| PricePoint {
            timestamp: start + chrono::Duration::minutes(i as i64 * spacing_minutes as i64),
            price: *price,
            volume_usd: 1_000.0,
        })
        .collect()
}
