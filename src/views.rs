//! Market-view reconciliation from the agent's structured side channel.
//!
//! The `market_views` map uses free-form composite keys such as
//! `EURUSD_spot_3_months` or `GLOBAL_inflation`. Keys are split on `_`:
//! the first token is the asset, `GLOBAL` marks a macro view, everything
//! else is a directional view on a currency pair or its volatility.
//!
//! Every reconciliation replaces the previous snapshot wholesale: the
//! remote state is the source of truth for "current views", not an
//! append log.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};

use crate::logging::{log, obj, Domain, Level};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Bullish,
    Bearish,
    Neutral,
}

impl Direction {
    fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("bullish") => Direction::Bullish,
            Some("bearish") => Direction::Bearish,
            _ => Direction::Neutral,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Direction::Bullish => "bullish",
            Direction::Bearish => "bearish",
            Direction::Neutral => "neutral",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Timeframe {
    ShortTerm,
    MediumTerm,
    LongTerm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outlook {
    Positive,
    Negative,
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MacroCategory {
    EconomicGrowth,
    Inflation,
    CentralBank,
    Geopolitical,
}

/// A stated bullish/bearish/neutral opinion on a currency pair or its
/// volatility.
#[derive(Debug, Clone, Serialize)]
pub struct MarketView {
    /// Source key from the `market_views` map.
    pub id: String,
    /// Display pair; volatility views carry a " Vol" suffix to
    /// disambiguate from the spot view on the same pair.
    pub currency_pair: String,
    pub direction: Direction,
    pub timeframe: Timeframe,
    /// 0..=100, mapped from the categorical `conviction` field.
    pub confidence: u8,
    pub reasoning: String,
    pub last_updated: DateTime<Utc>,
    pub conversation_id: Option<String>,
}

/// A stated opinion on a broader economic/geopolitical topic.
#[derive(Debug, Clone, Serialize)]
pub struct MacroView {
    pub id: String,
    pub topic: String,
    pub category: MacroCategory,
    pub outlook: Outlook,
    pub reasoning: String,
    pub last_updated: DateTime<Utc>,
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MarketViewsState {
    pub directional_views: Vec<MarketView>,
    pub macro_views: Vec<MacroView>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl MarketViewsState {
    /// Replace both collections wholesale. A partial remote snapshot
    /// therefore drops views it does not mention; full-snapshot
    /// semantics are assumed from observed backend behavior.
    pub fn replace(&mut self, directional: Vec<MarketView>, macros: Vec<MacroView>) {
        self.directional_views = directional;
        self.macro_views = macros;
        self.last_updated = Some(Utc::now());
    }

    pub fn clear(&mut self) {
        self.directional_views.clear();
        self.macro_views.clear();
        self.last_updated = None;
    }
}

/// Parse the side channel's `market_views` map into typed views. Returns
/// `None` when the payload has no such map; malformed entries degrade to
/// defaults rather than failing the whole snapshot.
pub fn reconcile(graph_state: &Value) -> Option<(Vec<MarketView>, Vec<MacroView>)> {
    let market_views = graph_state.get("market_views")?.as_object()?;
    let conversation_id = graph_state
        .get("current_query")
        .and_then(Value::as_str)
        .map(str::to_string);

    let mut directional = Vec::new();
    let mut macros = Vec::new();

    for (key, view) in market_views {
        let asset = key.split('_').next().unwrap_or_default();
        let is_global =
            asset == "GLOBAL" || view.get("asset").and_then(Value::as_str) == Some("GLOBAL");
        if is_global {
            macros.push(macro_view(key, asset, view, conversation_id.clone()));
        } else {
            directional.push(directional_view(key, asset, view, conversation_id.clone()));
        }
    }

    log(
        Level::Debug,
        Domain::Views,
        "views_reconciled",
        obj(&[
            ("directional", json!(directional.len())),
            ("macro", json!(macros.len())),
        ]),
    );
    Some((directional, macros))
}

fn macro_view(key: &str, asset: &str, view: &Value, conversation_id: Option<String>) -> MacroView {
    let direction = Direction::parse(view.get("direction").and_then(Value::as_str));
    let outlook = match direction {
        Direction::Bullish => Outlook::Positive,
        Direction::Bearish => Outlook::Negative,
        Direction::Neutral => Outlook::Neutral,
    };
    let instrument = view
        .get("instrument")
        .and_then(Value::as_str)
        .unwrap_or("market");
    MacroView {
        id: key.to_string(),
        topic: format!("{} {} outlook", asset, instrument),
        // No finer signal is available from the source data.
        category: MacroCategory::Geopolitical,
        outlook,
        reasoning: reasoning_or_default(view, direction, asset, instrument),
        last_updated: parse_created_at(view),
        conversation_id,
    }
}

fn directional_view(
    key: &str,
    asset: &str,
    view: &Value,
    conversation_id: Option<String>,
) -> MarketView {
    let direction = Direction::parse(view.get("direction").and_then(Value::as_str));
    let instrument = view
        .get("instrument")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| {
            if key.contains("_vol_") { "vol" } else { "spot" }.to_string()
        });
    let timeframe_raw = view
        .get("timeframe")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| remaining_key_tokens(key));
    let currency_pair = if instrument == "vol" {
        format!("{} Vol", asset)
    } else {
        asset.to_string()
    };

    MarketView {
        id: key.to_string(),
        currency_pair,
        direction,
        timeframe: bucket_timeframe(&timeframe_raw),
        confidence: confidence_from_conviction(view.get("conviction").and_then(Value::as_str)),
        reasoning: reasoning_or_default(view, direction, asset, &instrument),
        last_updated: parse_created_at(view),
        conversation_id,
    }
}

/// Key tokens past the asset and the instrument marker, e.g.
/// `EURUSD_vol_1_week` -> `1_week`.
fn remaining_key_tokens(key: &str) -> String {
    key.split('_')
        .skip(1)
        .skip_while(|token| *token == "spot" || *token == "vol")
        .collect::<Vec<_>>()
        .join("_")
}

fn bucket_timeframe(raw: &str) -> Timeframe {
    if raw.contains("week") || raw.contains("1_month") {
        Timeframe::ShortTerm
    } else if raw.contains("6_months") || raw.contains("long") || raw.contains("july") {
        Timeframe::LongTerm
    } else {
        Timeframe::MediumTerm
    }
}

fn confidence_from_conviction(conviction: Option<&str>) -> u8 {
    match conviction {
        Some("high") => 85,
        Some("medium") => 65,
        Some("low") => 35,
        _ => 50,
    }
}

fn reasoning_or_default(view: &Value, direction: Direction, asset: &str, instrument: &str) -> String {
    view.get("rationale")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("{} view on {} {}", direction.as_str(), asset, instrument))
}

fn parse_created_at(view: &Value) -> DateTime<Utc> {
    view.get("created_at")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}
