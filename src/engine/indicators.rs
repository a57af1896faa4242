//! Whitelisted pure helper routines exposed to sandboxed strategy
//! evaluation: numeric conversion, moving averages, RSI, EMA, MACD,
//! Bollinger Bands, ATR, Stochastic. No I/O, no clocks, no allocation
//! beyond the output vectors.

use super::types::Kline;

pub fn closes(klines: &[Kline]) -> Vec<f64> {
    klines
        .iter()
        .map(|k| k.close.to_string().parse::<f64>().unwrap_or(f64::NAN))
        .collect()
}

fn highs(klines: &[Kline]) -> Vec<f64> {
    klines
        .iter()
        .map(|k| k.high.to_string().parse::<f64>().unwrap_or(f64::NAN))
        .collect()
}

fn lows(klines: &[Kline]) -> Vec<f64> {
    klines
        .iter()
        .map(|k| k.low.to_string().parse::<f64>().unwrap_or(f64::NAN))
        .collect()
}

pub fn calculate_sma(prices: &[f64], period: usize) -> Result<Vec<f64>, String> {
    if period == 0 || prices.len() < period {
        return Err("insufficient data for SMA calculation".to_string());
    }
    let mut out = Vec::new();
    for i in 0..=prices.len() - period {
        let sum: f64 = prices[i..i + period].iter().sum();
        out.push(sum / period as f64);
    }
    Ok(out)
}

pub fn calculate_ema(prices: &[f64], period: usize) -> Result<Vec<f64>, String> {
    if period == 0 || prices.len() < period {
        return Err("insufficient data for EMA calculation".to_string());
    }
    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut out = Vec::new();
    let first_sma: f64 = prices[0..period].iter().sum::<f64>() / period as f64;
    out.push(first_sma);
    for price in prices.iter().skip(period) {
        let ema = (price * multiplier) + (out.last().unwrap() * (1.0 - multiplier));
        out.push(ema);
    }
    Ok(out)
}

pub fn calculate_rsi(klines: &[Kline], period: usize) -> Result<Vec<f64>, String> {
    let prices = closes(klines);
    if prices.len() < period + 1 {
        return Err(format!("need at least {} candles for RSI", period + 1));
    }

    let mut gains = Vec::new();
    let mut losses = Vec::new();
    for i in 1..prices.len() {
        let change = prices[i] - prices[i - 1];
        if change > 0.0 {
            gains.push(change);
            losses.push(0.0);
        } else {
            gains.push(0.0);
            losses.push(-change);
        }
    }

    let mut avg_gain: f64 = gains.iter().take(period).sum::<f64>() / period as f64;
    let mut avg_loss: f64 = losses.iter().take(period).sum::<f64>() / period as f64;

    let mut rsi_values = Vec::new();
    let rs = if avg_loss == 0.0 { 100.0 } else { avg_gain / avg_loss };
    rsi_values.push(100.0 - (100.0 / (1.0 + rs)));

    for i in period..gains.len() {
        avg_gain = ((avg_gain * (period - 1) as f64) + gains[i]) / period as f64;
        avg_loss = ((avg_loss * (period - 1) as f64) + losses[i]) / period as f64;
        let rs = if avg_loss == 0.0 { 100.0 } else { avg_gain / avg_loss };
        rsi_values.push(100.0 - (100.0 / (1.0 + rs)));
    }

    Ok(rsi_values)
}

pub struct MacdResult {
    pub macd_line: Vec<f64>,
    pub signal_line: Vec<f64>,
}

pub fn calculate_macd(
    klines: &[Kline],
    fast: usize,
    slow: usize,
    signal: usize,
) -> Result<MacdResult, String> {
    let prices = closes(klines);
    if prices.len() < slow + signal {
        return Err("insufficient data for MACD calculation".to_string());
    }

    let ema_fast = calculate_ema(&prices, fast)?;
    let ema_slow = calculate_ema(&prices, slow)?;

    let start_idx = slow - fast;
    let mut macd_line = Vec::new();
    for i in start_idx..ema_fast.len() {
        macd_line.push(ema_fast[i] - ema_slow[i - start_idx]);
    }

    let signal_line = calculate_ema(&macd_line, signal)?;

    Ok(MacdResult {
        macd_line,
        signal_line,
    })
}

pub struct BollingerBands {
    pub upper: Vec<f64>,
    pub lower: Vec<f64>,
}

pub fn calculate_bollinger_bands(
    klines: &[Kline],
    period: usize,
    multiplier: f64,
) -> Result<BollingerBands, String> {
    let prices = closes(klines);
    if prices.len() < period {
        return Err("insufficient data for Bollinger Bands calculation".to_string());
    }
    let sma = calculate_sma(&prices, period)?;

    let mut upper = Vec::new();
    let mut lower = Vec::new();
    for (i, &mean) in sma.iter().enumerate() {
        let window = &prices[i..i + period];
        let variance: f64 =
            window.iter().map(|&p| (p - mean).powi(2)).sum::<f64>() / period as f64;
        let std_dev = variance.sqrt();
        upper.push(mean + multiplier * std_dev);
        lower.push(mean - multiplier * std_dev);
    }

    Ok(BollingerBands { upper, lower })
}

pub struct StochasticResult {
    pub k_percent: Vec<f64>,
    pub d_percent: Vec<f64>,
}

pub fn calculate_stochastic(
    klines: &[Kline],
    k_period: usize,
    d_period: usize,
) -> Result<StochasticResult, String> {
    if klines.len() < k_period + d_period {
        return Err("insufficient data for Stochastic calculation".to_string());
    }
    let highs = highs(klines);
    let lows = lows(klines);
    let closes = closes(klines);

    let mut k_percent = Vec::new();
    for i in k_period - 1..klines.len() {
        let window_high = highs[i - k_period + 1..=i]
            .iter()
            .cloned()
            .fold(f64::NEG_INFINITY, f64::max);
        let window_low = lows[i - k_period + 1..=i]
            .iter()
            .cloned()
            .fold(f64::INFINITY, f64::min);
        let k = if window_high == window_low {
            50.0
        } else {
            ((closes[i] - window_low) / (window_high - window_low)) * 100.0
        };
        k_percent.push(k);
    }

    let d_percent = calculate_sma(&k_percent, d_period)?;
    Ok(StochasticResult {
        k_percent,
        d_percent,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn kline(close: i64) -> Kline {
        Kline {
            open_time: 0,
            close_time: 0,
            open: Decimal::from(close),
            high: Decimal::from(close + 1),
            low: Decimal::from(close - 1),
            close: Decimal::from(close),
            volume: Decimal::from(10),
            quote_volume: Decimal::from(10),
            trade_count: 1,
            taker_buy_base: Decimal::from(0),
            taker_buy_quote: Decimal::from(0),
            is_closed: true,
        }
    }

    #[test]
    fn rsi_all_gains_approaches_100() {
        let klines: Vec<Kline> = (1..=20).map(kline).collect();
        let rsi = calculate_rsi(&klines, 14).unwrap();
        assert!(*rsi.last().unwrap() > 90.0);
    }

    #[test]
    fn sma_rejects_insufficient_data() {
        let prices = vec![1.0, 2.0];
        assert!(calculate_sma(&prices, 5).is_err());
    }
}
