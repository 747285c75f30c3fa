//! Technical indicators over candle closes
//!
//! Every series is aligned with its input: index `i` of the output belongs to
//! candle `i`, with `None` during the warm-up window.

use crate::types::Candle;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

pub type Series = Vec<Option<f64>>;

/// Display/config entry for an indicator shown on a chart
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorConfig {
    pub enabled: bool,
    /// "MA", "RSI", "MACD", "BB"
    pub kind: String,
    #[serde(default)]
    pub parameters: HashMap<String, f64>,
    pub color: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Macd {
    pub macd: Series,
    pub signal: Series,
    pub histogram: Series,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BollingerBands {
    pub upper: Series,
    pub middle: Series,
    pub lower: Series,
}

/// Registry of configured chart indicators
#[derive(Debug, Default)]
pub struct TechnicalIndicators {
    indicators: HashMap<String, IndicatorConfig>,
}

impl TechnicalIndicators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_indicator(&mut self, name: &str, config: IndicatorConfig) {
        self.indicators.insert(name.to_string(), config);
    }

    pub fn remove_indicator(&mut self, name: &str) -> Option<IndicatorConfig> {
        self.indicators.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&IndicatorConfig> {
        self.indicators.get(name)
    }

    pub fn enabled(&self) -> Vec<(String, IndicatorConfig)> {
        let mut list: Vec<_> = self
            .indicators
            .iter()
            .filter(|(_, c)| c.enabled)
            .map(|(n, c)| (n.clone(), c.clone()))
            .collect();
        list.sort_by(|a, b| a.0.cmp(&b.0));
        list
    }

    /// Chart defaults: MA 20/50, RSI 14, MACD 12/26/9, Bollinger 20/2
    pub fn with_defaults() -> Self {
        let entry = |kind: &str, params: &[(&str, f64)], color: &str| IndicatorConfig {
            enabled: true,
            kind: kind.to_string(),
            parameters: params.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            color: color.to_string(),
        };
        let mut registry = Self::new();
        registry.add_indicator("ma20", entry("MA", &[("period", 20.0)], "#ff9900"));
        registry.add_indicator("ma50", entry("MA", &[("period", 50.0)], "#2196f3"));
        registry.add_indicator("rsi", entry("RSI", &[("period", 14.0)], "#9c27b0"));
        registry.add_indicator(
            "macd",
            entry("MACD", &[("fast", 12.0), ("slow", 26.0), ("signal", 9.0)], "#4caf50"),
        );
        registry.add_indicator("bb", entry("BB", &[("period", 20.0), ("std", 2.0)], "#607d8b"));
        registry
    }

    /// Evaluate every enabled indicator. Unknown kinds are skipped.
    pub fn calculate(&self, candles: &[Candle]) -> BTreeMap<String, IndicatorOutput> {
        let mut out = BTreeMap::new();
        for (name, config) in self.enabled() {
            let param = |key: &str, default: f64| {
                config.parameters.get(key).copied().unwrap_or(default).max(0.0) as usize
            };
            let value = match config.kind.to_uppercase().as_str() {
                "MA" => IndicatorOutput::Series(moving_average(candles, param("period", 20.0))),
                "RSI" => IndicatorOutput::Series(rsi(candles, param("period", 14.0))),
                "MACD" => IndicatorOutput::Macd(macd(
                    candles,
                    param("fast", 12.0),
                    param("slow", 26.0),
                    param("signal", 9.0),
                )),
                "BB" => IndicatorOutput::Bands(bollinger_bands(
                    candles,
                    param("period", 20.0),
                    config.parameters.get("std").copied().unwrap_or(2.0),
                )),
                _ => continue,
            };
            out.insert(name, value);
        }
        out
    }
}

/// Result of one configured indicator
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum IndicatorOutput {
    Series(Series),
    Macd(Macd),
    Bands(BollingerBands),
}

fn closes(candles: &[Candle]) -> Vec<f64> {
    candles.iter().map(|c| c.close).collect()
}

/// Simple moving average. Empty when there are fewer candles than `period`.
pub fn moving_average(candles: &[Candle], period: usize) -> Series {
    sma(&closes(candles), period)
}

fn sma(prices: &[f64], period: usize) -> Series {
    if period == 0 || prices.len() < period {
        return Vec::new();
    }

    let mut out = vec![None; period - 1];
    let mut sum: f64 = prices[..period].iter().sum();
    out.push(Some(sum / period as f64));
    for i in period..prices.len() {
        sum += prices[i] - prices[i - period];
        out.push(Some(sum / period as f64));
    }
    out
}

/// Exponential moving average seeded with the SMA of the first `period` prices
pub fn ema(prices: &[f64], period: usize) -> Series {
    if period == 0 || prices.len() < period {
        return Vec::new();
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut prev = prices[..period].iter().sum::<f64>() / period as f64;

    let mut out = vec![None; period - 1];
    out.push(Some(prev));
    for price in &prices[period..] {
        prev = (price - prev) * multiplier + prev;
        out.push(Some(prev));
    }
    out
}

/// Relative Strength Index with Wilder smoothing
pub fn rsi(candles: &[Candle], period: usize) -> Series {
    if period == 0 || candles.len() < period + 1 {
        return Vec::new();
    }

    let prices = closes(candles);
    let deltas: Vec<f64> = prices.windows(2).map(|w| w[1] - w[0]).collect();
    let gains: Vec<f64> = deltas.iter().map(|d| d.max(0.0)).collect();
    let losses: Vec<f64> = deltas.iter().map(|d| (-d).max(0.0)).collect();

    let mut avg_gain = gains[..period].iter().sum::<f64>() / period as f64;
    let mut avg_loss = losses[..period].iter().sum::<f64>() / period as f64;

    let value = |gain: f64, loss: f64| {
        if loss == 0.0 {
            100.0
        } else {
            100.0 - 100.0 / (1.0 + gain / loss)
        }
    };

    let mut out = vec![None; period];
    out.push(Some(value(avg_gain, avg_loss)));

    for i in (period + 1)..prices.len() {
        let p = period as f64;
        avg_gain = (avg_gain * (p - 1.0) + gains[i - 1]) / p;
        avg_loss = (avg_loss * (p - 1.0) + losses[i - 1]) / p;
        out.push(Some(value(avg_gain, avg_loss)));
    }
    out
}

pub fn macd(candles: &[Candle], fast: usize, slow: usize, signal_period: usize) -> Macd {
    if candles.is_empty() || fast == 0 || slow == 0 || candles.len() < slow.max(fast) {
        return Macd::default();
    }

    let prices = closes(candles);
    let ema_fast = ema(&prices, fast);
    let ema_slow = ema(&prices, slow);

    let macd_line: Series = (0..prices.len())
        .map(|i| {
            if i + 1 < slow {
                return None;
            }
            match (ema_fast[i], ema_slow[i]) {
                (Some(f), Some(s)) => Some(f - s),
                _ => None,
            }
        })
        .collect();

    let defined: Vec<f64> = macd_line.iter().flatten().copied().collect();
    let signal_raw = ema(&defined, signal_period);
    let mut signal = vec![None; macd_line.len() - signal_raw.len()];
    signal.extend(signal_raw);

    let histogram = macd_line
        .iter()
        .zip(signal.iter())
        .map(|(m, s)| match (m, s) {
            (Some(m), Some(s)) => Some(m - s),
            _ => None,
        })
        .collect();

    Macd {
        macd: macd_line,
        signal,
        histogram,
    }
}

/// Bollinger bands using the population standard deviation of each window
pub fn bollinger_bands(candles: &[Candle], period: usize, num_std: f64) -> BollingerBands {
    if period == 0 || candles.len() < period {
        return BollingerBands::default();
    }

    let prices = closes(candles);
    let middle = sma(&prices, period);
    let mut upper = Vec::with_capacity(prices.len());
    let mut lower = Vec::with_capacity(prices.len());

    for (i, mid) in middle.iter().enumerate() {
        match mid {
            Some(mean) => {
                let window = &prices[i + 1 - period..=i];
                let variance = window.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / period as f64;
                let std = variance.sqrt();
                upper.push(Some(mean + num_std * std));
                lower.push(Some(mean - num_std * std));
            }
            None => {
                upper.push(None);
                lower.push(None);
            }
        }
    }

    BollingerBands { upper, middle, lower }
}

/// Last defined value of a series
pub fn last_value(series: &[Option<f64>]) -> Option<f64> {
    series.last().copied().flatten()
}
