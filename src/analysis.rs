//! Classification of scenario-analysis payloads from the side channel.
//!
//! Backend versions disagree on where scenario results live: a batch
//! envelope with summary statistics, a single-scenario object, or a bare
//! list of per-scenario rows. Detection is ordered and exclusive; a
//! present key that fails to decode makes the whole turn carry no
//! analysis output rather than silently picking a lesser source.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::logging::{log, next_id, obj, v_str, Domain, Level};

/// Baseline when a row omits its portfolio values outright.
const DEFAULT_PORTFOLIO_VALUE: f64 = 1_000_000.0;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Greeks {
    #[serde(default)]
    pub delta: f64,
    #[serde(default)]
    pub gamma: f64,
    #[serde(default)]
    pub vega: f64,
    #[serde(default)]
    pub theta: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryStatistics {
    pub scenario_count: usize,
    pub min_pnl: f64,
    pub max_pnl: f64,
    pub avg_pnl: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndividualScenarioResult {
    pub scenario_name: String,
    #[serde(default)]
    pub scenario_parameters: Map<String, Value>,
    pub original_portfolio_value: f64,
    pub new_portfolio_value: f64,
    pub pnl: f64,
    /// Per-pair Greeks before the shock, keyed by currency pair.
    #[serde(default)]
    pub original_greeks: BTreeMap<String, Greeks>,
    #[serde(default)]
    pub new_greeks: BTreeMap<String, Greeks>,
    #[serde(default)]
    pub totals: Map<String, Value>,
    /// Whole-portfolio Greeks injected from the prior turn's pricing,
    /// when the batch path had one stashed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_portfolio_greeks: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchScenarioAnalysis {
    pub summary_statistics: SummaryStatistics,
    pub scenario_results: Vec<IndividualScenarioResult>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// A classified artifact, ready for a results panel.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisOutput {
    pub id: String,
    pub kind: &'static str,
    pub title: String,
    pub description: String,
    pub created_at: chrono::DateTime<Utc>,
    pub data: BatchScenarioAnalysis,
}

/// Inspect a turn's side channel for scenario output. `prior_portfolio`
/// is the previous turn's `priced_portfolio`, used to backfill Greeks
/// the batch payload lacks.
pub fn classify(values: &Value, prior_portfolio: Option<&Value>) -> Option<AnalysisOutput> {
    let batch = detect(values, prior_portfolio)?;
    let stats = &batch.summary_statistics;
    let title = format!("Scenario Analysis ({} scenarios)", stats.scenario_count);
    let description = format!(
        "P&L range {:.2} to {:.2}, average {:.2}",
        stats.min_pnl, stats.max_pnl, stats.avg_pnl
    );
    log(
        Level::Info,
        Domain::Analysis,
        "analysis_classified",
        obj(&[
            ("scenarios", json!(stats.scenario_count)),
            ("avg_pnl", json!(stats.avg_pnl)),
        ]),
    );
    Some(AnalysisOutput {
        id: next_id("a"),
        kind: "scenario-analysis",
        title,
        description,
        created_at: Utc::now(),
        data: batch,
    })
}

/// Ordered detection over the three known payload shapes. Each arm owns
/// its key: once the key is present, a decode failure ends detection.
fn detect(values: &Value, prior_portfolio: Option<&Value>) -> Option<BatchScenarioAnalysis> {
    if let Some(raw) = values.get("batch_scenario_analysis") {
        let mut batch = decode::<BatchScenarioAnalysis>("batch_scenario_analysis", raw)?;
        inject_portfolio_greeks(&mut batch, prior_portfolio);
        return Some(batch);
    }
    if let Some(raw) = values.get("scenario_analysis") {
        let single = decode::<IndividualScenarioResult>("scenario_analysis", raw)?;
        return Some(wrap_single(single));
    }
    if let Some(raw) = values.get("scenario_results") {
        let rows = raw.as_array()?;
        if rows.is_empty() {
            return None;
        }
        return Some(adapt_raw(rows));
    }
    None
}

fn decode<T: serde::de::DeserializeOwned>(key: &str, raw: &Value) -> Option<T> {
    match serde_json::from_value(raw.clone()) {
        Ok(decoded) => Some(decoded),
        Err(err) => {
            log(
                Level::Warn,
                Domain::Analysis,
                "payload_decode_failed",
                obj(&[("key", v_str(key)), ("error", v_str(&err.to_string()))]),
            );
            None
        }
    }
}

fn wrap_single(result: IndividualScenarioResult) -> BatchScenarioAnalysis {
    let pnl = result.pnl;
    BatchScenarioAnalysis {
        summary_statistics: SummaryStatistics {
            scenario_count: 1,
            min_pnl: pnl,
            max_pnl: pnl,
            avg_pnl: pnl,
        },
        scenario_results: vec![result],
        timestamp: None,
    }
}

/// Adapt a bare result list. Rows that already look canonical are
/// decoded as-is; otherwise each row is synthesized from whatever
/// fields it offers.
fn adapt_raw(rows: &[Value]) -> BatchScenarioAnalysis {
    let canonical = rows.iter().all(|row| {
        row.get("scenario_name").is_some()
            && row.get("original_greeks").is_some()
            && row.get("new_greeks").is_some()
    });
    let results: Vec<IndividualScenarioResult> = rows
        .iter()
        .enumerate()
        .map(|(i, row)| {
            if canonical {
                decode("scenario_results", row).unwrap_or_else(|| synthesize_result(i, row))
            } else {
                synthesize_result(i, row)
            }
        })
        .collect();
    let pnls: Vec<f64> = results.iter().map(|r| r.pnl).collect();
    let min_pnl = pnls.iter().cloned().fold(f64::INFINITY, f64::min);
    let max_pnl = pnls.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let avg_pnl = pnls.iter().sum::<f64>() / pnls.len() as f64;
    BatchScenarioAnalysis {
        summary_statistics: SummaryStatistics {
            scenario_count: results.len(),
            min_pnl,
            max_pnl,
            avg_pnl,
        },
        scenario_results: results,
        timestamp: None,
    }
}

fn synthesize_result(index: usize, row: &Value) -> IndividualScenarioResult {
    let scenario_name = row
        .get("scenario_name")
        .or_else(|| row.get("name"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("Scenario {}", index + 1));
    let original = row
        .get("original_portfolio_value")
        .and_then(Value::as_f64)
        .unwrap_or(DEFAULT_PORTFOLIO_VALUE);
    let new = row
        .get("new_portfolio_value")
        .and_then(Value::as_f64)
        .unwrap_or(original);
    let pnl = row
        .get("pnl")
        .and_then(Value::as_f64)
        .unwrap_or(new - original);
    let scenario_parameters = row
        .get("scenario_parameters")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    IndividualScenarioResult {
        scenario_name,
        scenario_parameters,
        original_portfolio_value: original,
        new_portfolio_value: new,
        pnl,
        original_greeks: BTreeMap::new(),
        new_greeks: BTreeMap::new(),
        totals: Map::new(),
        original_portfolio_greeks: None,
    }
}

/// Backfill baseline Greeks from a prior pricing turn. The stash is
/// either the portfolio object itself or an envelope with a `greeks`
/// field.
fn inject_portfolio_greeks(batch: &mut BatchScenarioAnalysis, prior_portfolio: Option<&Value>) {
    let Some(prior) = prior_portfolio else { return };
    let greeks_source = prior.get("greeks").unwrap_or(prior);
    let typed: Option<BTreeMap<String, Greeks>> =
        serde_json::from_value(greeks_source.clone()).ok();
    for result in &mut batch.scenario_results {
        result.original_portfolio_greeks = Some(greeks_source.clone());
        if result.original_greeks.is_empty() {
            if let Some(typed) = &typed {
                result.original_greeks = typed.clone();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch_payload() -> Value {
        json!({
            "batch_scenario_analysis": {
                "summary_statistics": {
                    "scenario_count": 2, "min_pnl": -5000.0, "max_pnl": 12000.0, "avg_pnl": 3500.0
                },
                "scenario_results": [
                    {
                        "scenario_name": "EUR +5%",
                        "original_portfolio_value": 1000000.0,
                        "new_portfolio_value": 1012000.0,
                        "pnl": 12000.0
                    },
                    {
                        "scenario_name": "JPY -3%",
                        "original_portfolio_value": 1000000.0,
                        "new_portfolio_value": 995000.0,
                        "pnl": -5000.0
                    }
                ]
            }
        })
    }

    #[test]
    fn test_batch_takes_precedence_over_raw_list() {
        let mut values = batch_payload();
        values["scenario_results"] = json!([{"pnl": 1.0}]);
        let output = classify(&values, None).unwrap();
        assert_eq!(output.data.summary_statistics.scenario_count, 2);
        assert_eq!(output.title, "Scenario Analysis (2 scenarios)");
    }

    #[test]
    fn test_single_scenario_wrapped_with_degenerate_stats() {
        let values = json!({
            "scenario_analysis": {
                "scenario_name": "USD shock",
                "original_portfolio_value": 1000000.0,
                "new_portfolio_value": 990000.0,
                "pnl": -10000.0
            }
        });
        let output = classify(&values, None).unwrap();
        let stats = &output.data.summary_statistics;
        assert_eq!(stats.scenario_count, 1);
        assert_eq!(stats.min_pnl, -10000.0);
        assert_eq!(stats.max_pnl, -10000.0);
        assert_eq!(stats.avg_pnl, -10000.0);
    }

    #[test]
    fn test_raw_list_synthesis_fills_defaults() {
        let values = json!({
            "scenario_results": [
                {"name": "spot up", "new_portfolio_value": 1010000.0},
                {}
            ]
        });
        let output = classify(&values, None).unwrap();
        let results = &output.data.scenario_results;
        assert_eq!(results[0].scenario_name, "spot up");
        assert_eq!(results[0].original_portfolio_value, DEFAULT_PORTFOLIO_VALUE);
        assert_eq!(results[0].pnl, 10000.0);
        assert_eq!(results[1].scenario_name, "Scenario 2");
        assert_eq!(results[1].pnl, 0.0);
        assert_eq!(output.data.summary_statistics.max_pnl, 10000.0);
    }

    #[test]
    fn test_canonical_raw_list_passes_through() {
        let values = json!({
            "scenario_results": [{
                "scenario_name": "vol crush",
                "original_portfolio_value": 1000000.0,
                "new_portfolio_value": 998000.0,
                "pnl": -2000.0,
                "original_greeks": {"EURUSD": {"delta": 0.4}},
                "new_greeks": {"EURUSD": {"delta": 0.1}}
            }]
        });
        let output = classify(&values, None).unwrap();
        let result = &output.data.scenario_results[0];
        assert_eq!(result.original_greeks["EURUSD"].delta, 0.4);
        assert_eq!(result.new_greeks["EURUSD"].delta, 0.1);
    }

    #[test]
    fn test_malformed_batch_fails_closed() {
        let values = json!({
            "batch_scenario_analysis": {"summary_statistics": "not an object"},
            "scenario_results": [{"pnl": 1.0}]
        });
        assert!(classify(&values, None).is_none());
    }

    #[test]
    fn test_empty_raw_list_is_nothing() {
        assert!(classify(&json!({"scenario_results": []}), None).is_none());
    }

    #[test]
    fn test_prior_portfolio_backfills_greeks() {
        let prior = json!({"greeks": {"EURUSD": {"delta": 0.5, "vega": 120.0}}});
        let output = classify(&batch_payload(), Some(&prior)).unwrap();
        let result = &output.data.scenario_results[0];
        assert_eq!(result.original_greeks["EURUSD"].delta, 0.5);
        assert_eq!(
            result.original_portfolio_greeks,
            Some(json!({"EURUSD": {"delta": 0.5, "vega": 120.0}}))
        );
    }

    #[test]
    fn test_prior_greeks_do_not_overwrite_existing() {
        let mut values = batch_payload();
        values["batch_scenario_analysis"]["scenario_results"][0]["original_greeks"] =
            json!({"USDJPY": {"delta": -0.2}});
        let prior = json!({"greeks": {"EURUSD": {"delta": 0.5}}});
        let output = classify(&values, Some(&prior)).unwrap();
        let result = &output.data.scenario_results[0];
        assert_eq!(result.original_greeks["USDJPY"].delta, -0.2);
        assert!(!result.original_greeks.contains_key("EURUSD"));
    }
}
