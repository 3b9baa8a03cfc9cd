//! Per-item similarity between two questionnaire answers.
//!
//! Every contribution lands in `[0, 1]`, higher meaning closer, so the
//! matching engine can take a plain weighted average across items of
//! different types.

use std::collections::HashSet;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde_json::Value;

use crate::error::ScoringError;
use crate::models::{DataType, QuestionnaireAnswer, QuestionnaireItem};

const SECONDS_PER_HOUR: f64 = 3_600.0;
const SECONDS_PER_DAY: f64 = 86_400.0;

/// Scalar unit a range item is measured in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeUnit {
    Number,
    Time,
    Date,
}

/// How an item's answers are compared, derived from its declared data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemRule {
    /// Notes and other text that is never matched.
    Skip,
    Number,
    /// Distance in hours, wrapping at midnight, so `1/(1+d)` stays meaningful.
    Time,
    Date,
    Range(RangeUnit),
    TextSet,
    /// Prose answers: numeric when both sides parse as numbers, embeddings otherwise.
    FreeText,
}

impl ItemRule {
    pub fn for_item(item: &QuestionnaireItem) -> Self {
        match item.data_type {
            DataType::Text if item.embed => ItemRule::FreeText,
            DataType::Text => ItemRule::Skip,
            DataType::Number => ItemRule::Number,
            DataType::Time => ItemRule::Time,
            DataType::Date => ItemRule::Date,
            DataType::NumberArray => ItemRule::Range(RangeUnit::Number),
            DataType::TimeArray => ItemRule::Range(RangeUnit::Time),
            DataType::DateArray => ItemRule::Range(RangeUnit::Date),
            DataType::TextArray => ItemRule::TextSet,
        }
    }
}

/// Maps a non-negative distance onto `(0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistanceCurve {
    /// `1 / (1 + d)`
    #[default]
    InverseDistance,
    /// `1 / (1 + d^2)`, harsher on large gaps.
    SquaredPenalty,
}

impl DistanceCurve {
    fn apply(self, distance: f64) -> f64 {
        let d = distance.abs();
        match self {
            DistanceCurve::InverseDistance => 1.0 / (1.0 + d),
            DistanceCurve::SquaredPenalty => 1.0 / (1.0 + d * d),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Similarity {
    Contribution(f64),
    /// Both sides are prose; the caller resolves embeddings and calls [`cosine_contribution`].
    NeedsEmbedding,
}

/// Weight governing an item in a directed comparison, taken from the target's answer.
///
/// A negative item default pins the weight to its magnitude for everyone;
/// a zero default removes the item from scoring.
pub fn effective_weight(item: &QuestionnaireItem, target: &QuestionnaireAnswer) -> Option<f64> {
    if item.weight == 0.0 {
        return None;
    }
    let weight = if item.weight < 0.0 {
        item.weight.abs()
    } else {
        target.weight
    };
    (weight.is_finite() && weight > 0.0).then_some(weight)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SimilarityScorer {
    curve: DistanceCurve,
}

impl SimilarityScorer {
    pub fn new(curve: DistanceCurve) -> Self {
        Self { curve }
    }

    /// Compares `from`'s answer against `to`'s answer for one shared item.
    pub fn compare(
        &self,
        rule: ItemRule,
        item_id: &str,
        from: &str,
        to: &str,
    ) -> Result<Option<Similarity>, ScoringError> {
        let contribution = match rule {
            ItemRule::Skip => return Ok(None),
            ItemRule::Number => {
                let gap = parse_number(item_id, from)? - parse_number(item_id, to)?;
                self.curve.apply(gap)
            }
            ItemRule::Time => {
                let gap = time_gap_hours(parse_time(item_id, from)?, parse_time(item_id, to)?);
                self.curve.apply(gap)
            }
            ItemRule::Date => {
                let gap = date_gap_days(parse_date(item_id, from)?, parse_date(item_id, to)?);
                self.curve.apply(gap)
            }
            ItemRule::Range(unit) => {
                let (from_start, from_end) = parse_range(item_id, unit, from)?;
                let (to_start, to_end) = parse_range(item_id, unit, to)?;
                let start = unit.gap(from_start, to_start);
                let end = unit.gap(from_end, to_end);
                1.0 / (1.0 + start * start + end * end)
            }
            ItemRule::TextSet => {
                let from_set = parse_text_set(item_id, from)?;
                let to_set = parse_text_set(item_id, to)?;
                let missing = from_set.difference(&to_set).count();
                self.curve.apply(missing as f64)
            }
            ItemRule::FreeText => {
                match (from.trim().parse::<f64>(), to.trim().parse::<f64>()) {
                    (Ok(a), Ok(b)) if a.is_finite() && b.is_finite() => self.curve.apply(a - b),
                    _ => return Ok(Some(Similarity::NeedsEmbedding)),
                }
            }
        };

        if !contribution.is_finite() {
            return Err(ScoringError::malformed(item_id, from, "non-finite similarity"));
        }
        Ok(Some(Similarity::Contribution(contribution)))
    }
}

/// Cosine similarity of two embeddings clamped to `[0, 1]`.
pub fn cosine_contribution(a: &[f32], b: &[f32]) -> f64 {
    cosine_similarity(a, b).map_or(0.0, |value| value.clamp(0.0, 1.0))
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        let x64 = f64::from(x);
        let y64 = f64::from(y);
        dot += x64 * y64;
        norm_a += x64 * x64;
        norm_b += y64 * y64;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom <= f64::EPSILON {
        return None;
    }
    Some(dot / denom)
}

impl RangeUnit {
    fn gap(self, a: f64, b: f64) -> f64 {
        match self {
            RangeUnit::Time => circular_hours(a - b),
            RangeUnit::Number | RangeUnit::Date => (a - b).abs(),
        }
    }

    /// Range bounds as hours since midnight, days since epoch, or raw numbers.
    fn scalar(self, item_id: &str, value: &Value) -> Result<f64, ScoringError> {
        let text = match value {
            Value::Number(n) if self == RangeUnit::Number => {
                return n
                    .as_f64()
                    .ok_or_else(|| ScoringError::malformed(item_id, &n.to_string(), "not a number"));
            }
            Value::String(s) => s.as_str(),
            other => {
                return Err(ScoringError::malformed(
                    item_id,
                    &other.to_string(),
                    "unexpected range bound",
                ))
            }
        };
        match self {
            RangeUnit::Number => parse_number(item_id, text),
            RangeUnit::Time => {
                let time = parse_time(item_id, text)?;
                Ok(f64::from(time.num_seconds_from_midnight()) / SECONDS_PER_HOUR)
            }
            RangeUnit::Date => {
                let date = parse_date(item_id, text)?;
                Ok(date.and_utc().timestamp() as f64 / SECONDS_PER_DAY)
            }
        }
    }
}

fn parse_number(item_id: &str, raw: &str) -> Result<f64, ScoringError> {
    match raw.trim().parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(ScoringError::malformed(item_id, raw, "not a number")),
    }
}

fn parse_time(item_id: &str, raw: &str) -> Result<NaiveTime, ScoringError> {
    let raw = raw.trim();
    NaiveTime::parse_from_str(raw, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M"))
        .map_err(|err| ScoringError::malformed(item_id, raw, err.to_string()))
}

fn parse_date(item_id: &str, raw: &str) -> Result<NaiveDateTime, ScoringError> {
    let raw = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Ok(date.and_time(NaiveTime::MIN));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| chrono::DateTime::parse_from_rfc3339(raw).map(|dt| dt.naive_utc()))
        .map_err(|err| ScoringError::malformed(item_id, raw, err.to_string()))
}

/// Hours between two times of day, going round the clock the short way.
fn time_gap_hours(a: NaiveTime, b: NaiveTime) -> f64 {
    let seconds = f64::from(a.num_seconds_from_midnight()) - f64::from(b.num_seconds_from_midnight());
    circular_hours(seconds / SECONDS_PER_HOUR)
}

fn circular_hours(hours: f64) -> f64 {
    let gap = hours.abs() % 24.0;
    gap.min(24.0 - gap)
}

fn date_gap_days(a: NaiveDateTime, b: NaiveDateTime) -> f64 {
    (a - b).num_seconds() as f64 / SECONDS_PER_DAY
}

fn parse_range(item_id: &str, unit: RangeUnit, raw: &str) -> Result<(f64, f64), ScoringError> {
    let values: Vec<Value> = serde_json::from_str(raw)
        .map_err(|err| ScoringError::malformed(item_id, raw, err.to_string()))?;
    match values.as_slice() {
        [start, end] => Ok((unit.scalar(item_id, start)?, unit.scalar(item_id, end)?)),
        _ => Err(ScoringError::malformed(item_id, raw, "range must have two bounds")),
    }
}

fn parse_text_set(item_id: &str, raw: &str) -> Result<HashSet<String>, ScoringError> {
    let values: Vec<Value> = serde_json::from_str(raw)
        .map_err(|err| ScoringError::malformed(item_id, raw, err.to_string()))?;
    Ok(values
        .into_iter()
        .map(|value| match value {
            Value::String(s) => s.trim().to_lowercase(),
            other => other.to_string(),
        })
        .collect())
}
