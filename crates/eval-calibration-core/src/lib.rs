use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CalibrationError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("persistence error: {0}")]
    Persistence(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct EvaluationId(pub String);

impl EvaluationId {
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for EvaluationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct EvaluatorId(pub String);

impl EvaluatorId {
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for EvaluatorId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ParameterId(pub String);

impl ParameterId {
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ParameterId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One entry of the externally-defined scoring catalog. The engine never
/// creates or deletes catalog entries; the catalog is injected into the
/// analyzer and the state reads.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ScoringParameter {
    pub id: ParameterId,
    pub label: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackType {
    Score,
    VoiceQuality,
}

impl FeedbackType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Score => "score",
            Self::VoiceQuality => "voice_quality",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "score" => Some(Self::Score),
            "voice_quality" => Some(Self::VoiceQuality),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VoiceMetric {
    Clarity,
    Volume,
    Pace,
    Tone,
    Overall,
}

impl VoiceMetric {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Clarity => "clarity",
            Self::Volume => "volume",
            Self::Pace => "pace",
            Self::Tone => "tone",
            Self::Overall => "overall",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "clarity" => Some(Self::Clarity),
            "volume" => Some(Self::Volume),
            "pace" => Some(Self::Pace),
            "tone" => Some(Self::Tone),
            "overall" => Some(Self::Overall),
            _ => None,
        }
    }
}

/// One numeric value per (evaluation, parameter) pair. Owned by the scorer;
/// writable by the immediate override path. Re-scoring overwrites in place
/// and keeps `score_id` stable.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Score {
    pub score_id: Ulid,
    pub evaluation_id: EvaluationId,
    pub parameter_id: ParameterId,
    pub value: u8,
    pub note: String,
}

/// Validates a score value against the 1..=5 scale.
///
/// # Errors
/// Returns [`CalibrationError::Validation`] when the value is outside [1, 5].
pub fn validate_score_value(value: u8) -> Result<(), CalibrationError> {
    if !(1..=5).contains(&value) {
        return Err(CalibrationError::Validation(format!(
            "score value MUST be in [1, 5], got {value}"
        )));
    }
    Ok(())
}

/// Named voice sub-scores plus the derived weighted overall, one snapshot
/// per evaluation. Components stay `None` until observed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VoiceMetricSnapshot {
    pub evaluation_id: EvaluationId,
    pub clarity: Option<f64>,
    pub volume: Option<f64>,
    pub pace: Option<f64>,
    pub tone: Option<f64>,
    pub overall: Option<f64>,
}

impl VoiceMetricSnapshot {
    #[must_use]
    pub fn empty(evaluation_id: EvaluationId) -> Self {
        Self {
            evaluation_id,
            clarity: None,
            volume: None,
            pace: None,
            tone: None,
            overall: None,
        }
    }

    #[must_use]
    pub fn metric(&self, metric: VoiceMetric) -> Option<f64> {
        match metric {
            VoiceMetric::Clarity => self.clarity,
            VoiceMetric::Volume => self.volume,
            VoiceMetric::Pace => self.pace,
            VoiceMetric::Tone => self.tone,
            VoiceMetric::Overall => self.overall,
        }
    }

    pub fn set_metric(&mut self, metric: VoiceMetric, value: f64) {
        match metric {
            VoiceMetric::Clarity => self.clarity = Some(value),
            VoiceMetric::Volume => self.volume = Some(value),
            VoiceMetric::Pace => self.pace = Some(value),
            VoiceMetric::Tone => self.tone = Some(value),
            VoiceMetric::Overall => self.overall = Some(value),
        }
    }
}

/// Recomputes the weighted overall voice score.
///
/// A component metric that was never observed contributes 0 to the sum.
/// That zero-fallback is inherited behavior: it penalizes `overall` for
/// missing data instead of excluding the term. Callers that need different
/// semantics must gather all four components before recomputing.
#[must_use]
pub fn recompute_overall(snapshot: &VoiceMetricSnapshot, ruleset: &CalibrationRuleset) -> f64 {
    ruleset.clarity_weight * snapshot.clarity.unwrap_or(0.0)
        + ruleset.volume_weight * snapshot.volume.unwrap_or(0.0)
        + ruleset.pace_weight * snapshot.pace.unwrap_or(0.0)
        + ruleset.tone_weight * snapshot.tone.unwrap_or(0.0)
}

/// Target of a feedback record: a score entry (by id or by parameter lookup
/// within the evaluation) or a named voice metric.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackTarget {
    ScoreById(Ulid),
    ScoreByParameter(ParameterId),
    VoiceMetric(VoiceMetric),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedbackInput {
    pub evaluation_id: EvaluationId,
    pub evaluator_id: EvaluatorId,
    pub feedback_type: FeedbackType,
    pub target: FeedbackTarget,
    pub original_score: Option<f64>,
    pub adjusted_score: Option<f64>,
    pub comment: String,
}

impl FeedbackInput {
    /// Validates a feedback submission before it reaches the ledger.
    ///
    /// # Errors
    /// Returns [`CalibrationError::Validation`] when the comment is empty,
    /// the target does not match the feedback type, or a score value is
    /// outside its scale.
    pub fn validate(&self) -> Result<(), CalibrationError> {
        if self.comment.trim().is_empty() {
            return Err(CalibrationError::Validation(
                "comment MUST be non-empty text".to_string(),
            ));
        }

        match (self.feedback_type, &self.target) {
            (FeedbackType::Score, FeedbackTarget::ScoreById(_) | FeedbackTarget::ScoreByParameter(_)) => {
                for (name, value) in [
                    ("original_score", self.original_score),
                    ("adjusted_score", self.adjusted_score),
                ] {
                    if let Some(raw) = value {
                        validate_whole_score(name, raw)?;
                    }
                }
            }
            (FeedbackType::VoiceQuality, FeedbackTarget::VoiceMetric(_)) => {
                for (name, value) in [
                    ("original_score", self.original_score),
                    ("adjusted_score", self.adjusted_score),
                ] {
                    if let Some(raw) = value {
                        if !(1.0..=5.0).contains(&raw) {
                            return Err(CalibrationError::Validation(format!(
                                "{name} MUST be in [1.0, 5.0], got {raw}"
                            )));
                        }
                    }
                }
            }
            (feedback_type, _) => {
                return Err(CalibrationError::Validation(format!(
                    "feedback target does not match feedback type {}",
                    feedback_type.as_str()
                )));
            }
        }

        Ok(())
    }
}

fn validate_whole_score(name: &str, raw: f64) -> Result<(), CalibrationError> {
    if !(1.0..=5.0).contains(&raw) || (raw - raw.round()).abs() > f64::EPSILON {
        return Err(CalibrationError::Validation(format!(
            "{name} MUST be a whole number in [1, 5], got {raw}"
        )));
    }
    Ok(())
}

/// An evaluator correction event. Immutable once created; the only permitted
/// mutation is whole-record deletion, which does NOT roll back the override
/// the record previously caused.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedbackRecord {
    pub feedback_id: Ulid,
    pub evaluation_id: EvaluationId,
    pub evaluator_id: EvaluatorId,
    pub feedback_type: FeedbackType,
    pub score_id: Option<Ulid>,
    pub voice_metric: Option<VoiceMetric>,
    pub original_score: Option<f64>,
    pub adjusted_score: Option<f64>,
    pub comment: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Versioned calibration constants. Defaults carry the v1 behavior; every
/// field is validated before use so a stored ruleset cannot smuggle
/// out-of-range constants into the analyzer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CalibrationRuleset {
    pub ruleset_version: u32,
    pub smoothing_prior_weight: f64,
    pub smoothing_batch_weight: f64,
    pub adjustment_min: f64,
    pub adjustment_max: f64,
    pub guidance_delta_threshold: f64,
    pub aligned_min_feedback: usize,
    pub comment_sample_size: usize,
    pub history_adjustment_threshold: f64,
    pub default_period_days: u32,
    pub clarity_weight: f64,
    pub volume_weight: f64,
    pub pace_weight: f64,
    pub tone_weight: f64,
}

impl CalibrationRuleset {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            ruleset_version: 1,
            smoothing_prior_weight: 0.3,
            smoothing_batch_weight: 0.7,
            adjustment_min: -2.0,
            adjustment_max: 2.0,
            guidance_delta_threshold: 0.3,
            aligned_min_feedback: 3,
            comment_sample_size: 5,
            history_adjustment_threshold: 0.1,
            default_period_days: 7,
            clarity_weight: 0.35,
            volume_weight: 0.25,
            pace_weight: 0.25,
            tone_weight: 0.15,
        }
    }

    /// Validates ruleset numeric bounds and weight invariants.
    ///
    /// # Errors
    /// Returns [`CalibrationError::Configuration`] when one or more fields
    /// are outside allowed bounds.
    pub fn validate(&self) -> Result<(), CalibrationError> {
        if self.ruleset_version == 0 {
            return Err(CalibrationError::Configuration(
                "ruleset_version MUST be >= 1".to_string(),
            ));
        }

        for (name, value) in [
            ("smoothing_prior_weight", self.smoothing_prior_weight),
            ("smoothing_batch_weight", self.smoothing_batch_weight),
            ("clarity_weight", self.clarity_weight),
            ("volume_weight", self.volume_weight),
            ("pace_weight", self.pace_weight),
            ("tone_weight", self.tone_weight),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(CalibrationError::Configuration(format!(
                    "{name} MUST be in [0.0, 1.0]"
                )));
            }
        }

        let smoothing_sum = self.smoothing_prior_weight + self.smoothing_batch_weight;
        if (smoothing_sum - 1.0).abs() > 1e-9 {
            return Err(CalibrationError::Configuration(
                "smoothing weights MUST sum to 1.0".to_string(),
            ));
        }

        let voice_sum =
            self.clarity_weight + self.volume_weight + self.pace_weight + self.tone_weight;
        if (voice_sum - 1.0).abs() > 1e-9 {
            return Err(CalibrationError::Configuration(
                "voice metric weights MUST sum to 1.0".to_string(),
            ));
        }

        if self.adjustment_min >= self.adjustment_max {
            return Err(CalibrationError::Configuration(
                "adjustment_min MUST be below adjustment_max".to_string(),
            ));
        }

        if self.guidance_delta_threshold <= 0.0 {
            return Err(CalibrationError::Configuration(
                "guidance_delta_threshold MUST be positive".to_string(),
            ));
        }

        if self.history_adjustment_threshold < 0.0 {
            return Err(CalibrationError::Configuration(
                "history_adjustment_threshold MUST be non-negative".to_string(),
            ));
        }

        if self.aligned_min_feedback == 0 || self.comment_sample_size == 0 {
            return Err(CalibrationError::Configuration(
                "aligned_min_feedback and comment_sample_size MUST be >= 1".to_string(),
            ));
        }

        if self.default_period_days == 0 {
            return Err(CalibrationError::Configuration(
                "default_period_days MUST be >= 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Decodes and validates a ruleset from JSON.
    ///
    /// # Errors
    /// Returns [`CalibrationError::Configuration`] when JSON decoding fails
    /// or decoded values violate ruleset constraints.
    pub fn from_json(value: &Value) -> Result<Self, CalibrationError> {
        let ruleset: Self = serde_json::from_value(value.clone()).map_err(|err| {
            CalibrationError::Configuration(format!("invalid ruleset JSON payload: {err}"))
        })?;
        ruleset.validate()?;
        Ok(ruleset)
    }
}

/// Per-parameter calibration signal. Exists only after at least one analysis
/// batch processed feedback for the parameter; readers substitute
/// [`CalibrationState::default_for`] for absent rows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CalibrationState {
    pub parameter_id: ParameterId,
    pub adjustment: f64,
    pub guidance: String,
    pub total_feedback_count: i64,
    pub last_batch_avg_adjustment: f64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_analyzed_at: Option<OffsetDateTime>,
}

impl CalibrationState {
    #[must_use]
    pub fn default_for(parameter_id: ParameterId) -> Self {
        Self {
            parameter_id,
            adjustment: 0.0,
            guidance: String::new(),
            total_feedback_count: 0,
            last_batch_avg_adjustment: 0.0,
            last_analyzed_at: None,
        }
    }
}

/// Append-only audit record of one calibration-state transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CalibrationHistoryEntry {
    pub history_id: Ulid,
    pub parameter_id: ParameterId,
    pub previous_adjustment: f64,
    pub new_adjustment: f64,
    pub previous_guidance: String,
    pub new_guidance: String,
    pub feedback_count: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub period_end: OffsetDateTime,
    pub evaluator_ids: Vec<EvaluatorId>,
    pub summary: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// One score correction inside an analysis window, with the evaluator name
/// already resolved (or `None` when resolution failed).
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreCorrection {
    pub evaluator_id: EvaluatorId,
    pub evaluator_name: Option<String>,
    pub original_score: f64,
    pub adjusted_score: f64,
    pub comment: String,
}

/// Per-parameter entry of the batch analysis report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParameterAnalysisResult {
    pub feedback_count: usize,
    pub avg_adjustment: f64,
    pub guidance: String,
    pub evaluators: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ParameterAnalysisResult {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            feedback_count: 0,
            avg_adjustment: 0.0,
            guidance: String::new(),
            evaluators: Vec::new(),
            error: None,
        }
    }

    #[must_use]
    pub fn failed(feedback_count: usize, message: String) -> Self {
        Self {
            feedback_count,
            avg_adjustment: 0.0,
            guidance: String::new(),
            evaluators: Vec::new(),
            error: Some(message),
        }
    }
}

/// Everything one parameter's batch produces: the state to persist, the
/// optional audit entry, and the caller-facing result.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterCalibration {
    pub state: CalibrationState,
    pub history: Option<CalibrationHistoryEntry>,
    pub result: ParameterAnalysisResult,
}

pub const GUIDANCE_RATE_HIGHER: &str =
    "Evaluators tend to rate this parameter higher than the AI; consider scoring more generously";
pub const GUIDANCE_RATE_LOWER: &str =
    "Evaluators tend to rate this parameter lower than the AI; consider scoring more strictly";
pub const GUIDANCE_ALIGNED: &str =
    "AI scoring for this parameter is generally aligned with evaluators";

#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn batch_avg_delta(corrections: &[ScoreCorrection]) -> f64 {
    if corrections.is_empty() {
        return 0.0;
    }

    let sum: f64 = corrections
        .iter()
        .map(|item| item.adjusted_score - item.original_score)
        .sum();
    sum / corrections.len() as f64
}

/// Selects guidance text from the batch average delta. The delta thresholds
/// are strict comparisons; the aligned branch needs at least
/// `aligned_min_feedback` records; anything else is an empty string
/// (insufficient signal).
#[must_use]
pub fn select_guidance(
    avg_delta: f64,
    feedback_count: usize,
    comments: &[String],
    ruleset: &CalibrationRuleset,
) -> String {
    let message = if avg_delta > ruleset.guidance_delta_threshold {
        GUIDANCE_RATE_HIGHER
    } else if avg_delta < -ruleset.guidance_delta_threshold {
        GUIDANCE_RATE_LOWER
    } else if feedback_count >= ruleset.aligned_min_feedback {
        GUIDANCE_ALIGNED
    } else {
        return String::new();
    };

    let sample = comments
        .iter()
        .take(ruleset.comment_sample_size)
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join("; ");

    if sample.is_empty() {
        message.to_string()
    } else {
        format!("{message}. Comments: {sample}")
    }
}

/// Exponentially blends the previous adjustment with the batch average, then
/// clamps. First-time calibration has no smoothing history and adopts the
/// batch average directly (still clamped).
#[must_use]
pub fn smooth_adjustment(
    previous: Option<f64>,
    avg_delta: f64,
    ruleset: &CalibrationRuleset,
) -> f64 {
    let raw = match previous {
        Some(prior) => {
            ruleset.smoothing_prior_weight * prior + ruleset.smoothing_batch_weight * avg_delta
        }
        None => avg_delta,
    };
    raw.clamp(ruleset.adjustment_min, ruleset.adjustment_max)
}

/// History is written only for materially different outcomes: no prior
/// state, an adjustment shift strictly above the threshold, or a guidance
/// change. `new_guidance` must be the guidance as persisted (after the
/// empty-falls-back-to-previous rule), otherwise an empty batch guidance
/// would always look like a change.
#[must_use]
pub fn should_record_history(
    previous: Option<&CalibrationState>,
    new_adjustment: f64,
    new_guidance: &str,
    ruleset: &CalibrationRuleset,
) -> bool {
    match previous {
        None => true,
        Some(prior) => {
            (new_adjustment - prior.adjustment).abs() > ruleset.history_adjustment_threshold
                || new_guidance != prior.guidance
        }
    }
}

#[must_use]
pub fn build_summary(feedback_count: usize, avg_delta: f64, evaluator_names: &[String]) -> String {
    let evaluators = if evaluator_names.is_empty() {
        "none resolved".to_string()
    } else {
        evaluator_names.join(", ")
    };
    format!(
        "Analyzed {feedback_count} feedbacks. Average adjustment: {avg_delta:.2}. Evaluators: {evaluators}"
    )
}

/// Computes one parameter's calibration batch from its window of score
/// corrections and its previous state.
///
/// Pure except for the generated history id: identical corrections, previous
/// state, and timestamps produce identical numeric output.
///
/// # Errors
/// Returns [`CalibrationError::Validation`] when called with an empty batch;
/// zero-record windows must be short-circuited by the caller because they
/// mutate no state.
#[allow(clippy::cast_possible_wrap)]
pub fn calibrate_parameter(
    parameter_id: &ParameterId,
    corrections: &[ScoreCorrection],
    previous: Option<&CalibrationState>,
    period_start: OffsetDateTime,
    period_end: OffsetDateTime,
    now: OffsetDateTime,
    ruleset: &CalibrationRuleset,
) -> Result<ParameterCalibration, CalibrationError> {
    if corrections.is_empty() {
        return Err(CalibrationError::Validation(
            "calibration batch MUST contain at least one correction".to_string(),
        ));
    }

    let avg_delta = batch_avg_delta(corrections);
    let comments: Vec<String> = corrections
        .iter()
        .map(|item| item.comment.clone())
        .collect();
    let batch_guidance = select_guidance(avg_delta, corrections.len(), &comments, ruleset);

    let mut evaluator_ids: Vec<EvaluatorId> = Vec::new();
    let mut evaluator_names: Vec<String> = Vec::new();
    for item in corrections {
        if !evaluator_ids.contains(&item.evaluator_id) {
            evaluator_ids.push(item.evaluator_id.clone());
        }
        if let Some(name) = &item.evaluator_name {
            if !evaluator_names.contains(name) {
                evaluator_names.push(name.clone());
            }
        }
    }

    let adjustment = smooth_adjustment(previous.map(|p| p.adjustment), avg_delta, ruleset);
    let persisted_guidance = if batch_guidance.is_empty() {
        previous.map(|p| p.guidance.clone()).unwrap_or_default()
    } else {
        batch_guidance.clone()
    };

    let state = CalibrationState {
        parameter_id: parameter_id.clone(),
        adjustment,
        guidance: persisted_guidance.clone(),
        total_feedback_count: previous.map_or(0, |p| p.total_feedback_count)
            + corrections.len() as i64,
        last_batch_avg_adjustment: avg_delta,
        last_analyzed_at: Some(now),
    };

    let history = if should_record_history(previous, adjustment, &persisted_guidance, ruleset) {
        Some(CalibrationHistoryEntry {
            history_id: Ulid::new(),
            parameter_id: parameter_id.clone(),
            previous_adjustment: previous.map_or(0.0, |p| p.adjustment),
            new_adjustment: adjustment,
            previous_guidance: previous.map(|p| p.guidance.clone()).unwrap_or_default(),
            new_guidance: persisted_guidance,
            feedback_count: corrections.len() as i64,
            period_start,
            period_end,
            evaluator_ids,
            summary: build_summary(corrections.len(), avg_delta, &evaluator_names),
            created_at: now,
        })
    } else {
        None
    };

    Ok(ParameterCalibration {
        state,
        history,
        result: ParameterAnalysisResult {
            feedback_count: corrections.len(),
            avg_adjustment: avg_delta,
            guidance: batch_guidance,
            evaluators: evaluator_names,
            error: None,
        },
    })
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`CalibrationError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, CalibrationError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| CalibrationError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(CalibrationError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`CalibrationError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, CalibrationError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            CalibrationError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

/// Current time, UTC, truncated to whole seconds so the stored RFC3339 text
/// stays fixed-width and compares correctly as a string.
#[must_use]
pub fn now_utc() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc().to_offset(UtcOffset::UTC);
    now.replace_nanosecond(0).unwrap_or(now)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp)]

    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_utc(value: &str) -> OffsetDateTime {
        must_ok(parse_rfc3339_utc(value))
    }

    fn correction(original: f64, adjusted: f64) -> ScoreCorrection {
        ScoreCorrection {
            evaluator_id: EvaluatorId::new("ev-1"),
            evaluator_name: Some("Alice".to_string()),
            original_score: original,
            adjusted_score: adjusted,
            comment: "fixture comment".to_string(),
        }
    }

    fn previous_state(adjustment: f64, guidance: &str) -> CalibrationState {
        CalibrationState {
            parameter_id: ParameterId::new("empathy"),
            adjustment,
            guidance: guidance.to_string(),
            total_feedback_count: 4,
            last_batch_avg_adjustment: 0.2,
            last_analyzed_at: Some(must_utc("2026-08-01T00:00:00Z")),
        }
    }

    #[test]
    fn smoothing_blends_prior_and_batch_then_clamps() {
        let ruleset = CalibrationRuleset::v1();
        let raw = 0.3 * 1.0 + 0.7 * 2.5;
        assert_eq!(raw, 2.05);
        assert_eq!(smooth_adjustment(Some(1.0), 2.5, &ruleset), 2.0);
        assert_eq!(smooth_adjustment(Some(0.5), 0.5, &ruleset), 0.5);
        assert_eq!(smooth_adjustment(Some(-1.0), -4.0, &ruleset), -2.0);
    }

    #[test]
    fn first_calibration_adopts_batch_average_directly() {
        let ruleset = CalibrationRuleset::v1();
        assert_eq!(smooth_adjustment(None, 1.0, &ruleset), 1.0);
        assert_eq!(smooth_adjustment(None, 3.7, &ruleset), 2.0);
        assert_eq!(smooth_adjustment(None, -3.7, &ruleset), -2.0);
    }

    #[test]
    fn guidance_threshold_is_strict() {
        let ruleset = CalibrationRuleset::v1();
        let comments = vec!["too low".to_string()];

        let above = select_guidance(0.31, 1, &comments, &ruleset);
        assert!(above.starts_with(GUIDANCE_RATE_HIGHER));

        let at_threshold = select_guidance(0.30, 1, &comments, &ruleset);
        assert!(at_threshold.is_empty());

        let below = select_guidance(-0.31, 1, &comments, &ruleset);
        assert!(below.starts_with(GUIDANCE_RATE_LOWER));
    }

    #[test]
    fn aligned_guidance_requires_minimum_feedback_count() {
        let ruleset = CalibrationRuleset::v1();
        let comments = vec!["fine".to_string()];

        let aligned = select_guidance(0.1, 3, &comments, &ruleset);
        assert!(aligned.starts_with(GUIDANCE_ALIGNED));

        let insufficient = select_guidance(0.1, 2, &comments, &ruleset);
        assert!(insufficient.is_empty());
    }

    #[test]
    fn guidance_samples_at_most_five_comments() {
        let ruleset = CalibrationRuleset::v1();
        let comments: Vec<String> = (1..=7).map(|index| format!("c{index}")).collect();

        let guidance = select_guidance(1.0, 7, &comments, &ruleset);
        assert!(guidance.contains("c1; c2; c3; c4; c5"));
        assert!(!guidance.contains("c6"));
    }

    #[test]
    fn history_threshold_is_strict_at_0_1() {
        let ruleset = CalibrationRuleset::v1();
        let previous = previous_state(0.5, "steady");

        assert!(!should_record_history(
            Some(&previous),
            0.60,
            "steady",
            &ruleset
        ));
        assert!(should_record_history(
            Some(&previous),
            0.61,
            "steady",
            &ruleset
        ));
        assert!(should_record_history(
            Some(&previous),
            0.5,
            "changed",
            &ruleset
        ));
        assert!(should_record_history(None, 0.0, "", &ruleset));
    }

    #[test]
    fn calibrate_parameter_matches_scenario() {
        let ruleset = CalibrationRuleset::v1();
        let corrections = vec![
            correction(3.0, 4.0),
            correction(3.0, 5.0),
            correction(4.0, 4.0),
        ];
        let now = must_utc("2026-08-24T12:00:00Z");
        let start = must_utc("2026-08-17T12:00:00Z");

        let batch = must_ok(calibrate_parameter(
            &ParameterId::new("empathy"),
            &corrections,
            None,
            start,
            now,
            now,
            &ruleset,
        ));

        assert_eq!(batch.result.avg_adjustment, 1.0);
        assert_eq!(batch.state.adjustment, 1.0);
        assert_eq!(batch.state.total_feedback_count, 3);
        assert_eq!(batch.state.last_batch_avg_adjustment, 1.0);
        assert!(batch.state.guidance.starts_with(GUIDANCE_RATE_HIGHER));

        let history = match batch.history {
            Some(entry) => entry,
            None => panic!("first calibration always writes history"),
        };
        assert_eq!(history.previous_adjustment, 0.0);
        assert_eq!(history.new_adjustment, 1.0);
        assert_eq!(history.feedback_count, 3);
        assert_eq!(history.evaluator_ids, vec![EvaluatorId::new("ev-1")]);
        assert!(history.summary.contains("Analyzed 3 feedbacks"));
        assert!(history.summary.contains("Average adjustment: 1.00"));
        assert!(history.summary.contains("Alice"));
    }

    #[test]
    fn empty_batch_guidance_keeps_previous_and_skips_history() {
        let ruleset = CalibrationRuleset::v1();
        let previous = previous_state(0.2, "hold steady");
        // avg delta 0.25 with 2 records: below threshold, below aligned count.
        let corrections = vec![correction(3.0, 3.0), correction(3.0, 3.5)];
        let now = must_utc("2026-08-24T12:00:00Z");
        let start = must_utc("2026-08-17T12:00:00Z");

        let batch = must_ok(calibrate_parameter(
            &ParameterId::new("empathy"),
            &corrections,
            Some(&previous),
            start,
            now,
            now,
            &ruleset,
        ));

        assert!(batch.result.guidance.is_empty());
        assert_eq!(batch.state.guidance, "hold steady");
        // 0.3*0.2 + 0.7*0.25 = 0.235; |0.235 - 0.2| <= 0.1 and guidance kept.
        assert!(batch.history.is_none());
        assert_eq!(batch.state.total_feedback_count, 6);
    }

    #[test]
    fn calibrate_parameter_rejects_empty_batch() {
        let ruleset = CalibrationRuleset::v1();
        let now = must_utc("2026-08-24T12:00:00Z");
        let result = calibrate_parameter(
            &ParameterId::new("empathy"),
            &[],
            None,
            now,
            now,
            now,
            &ruleset,
        );
        assert!(matches!(result, Err(CalibrationError::Validation(_))));
    }

    #[test]
    fn distinct_evaluators_preserve_first_seen_order() {
        let ruleset = CalibrationRuleset::v1();
        let mut second = correction(3.0, 4.0);
        second.evaluator_id = EvaluatorId::new("ev-2");
        second.evaluator_name = Some("Bob".to_string());
        let mut unresolved = correction(3.0, 4.0);
        unresolved.evaluator_id = EvaluatorId::new("ev-3");
        unresolved.evaluator_name = None;
        let corrections = vec![correction(3.0, 4.0), second, correction(2.0, 4.0), unresolved];
        let now = must_utc("2026-08-24T12:00:00Z");

        let batch = must_ok(calibrate_parameter(
            &ParameterId::new("empathy"),
            &corrections,
            None,
            now,
            now,
            now,
            &ruleset,
        ));

        assert_eq!(
            batch.result.evaluators,
            vec!["Alice".to_string(), "Bob".to_string()]
        );
        let history = match batch.history {
            Some(entry) => entry,
            None => panic!("first calibration always writes history"),
        };
        assert_eq!(
            history.evaluator_ids,
            vec![
                EvaluatorId::new("ev-1"),
                EvaluatorId::new("ev-2"),
                EvaluatorId::new("ev-3")
            ]
        );
    }

    #[test]
    fn voice_overall_uses_fixed_weights() {
        let ruleset = CalibrationRuleset::v1();
        let mut snapshot = VoiceMetricSnapshot::empty(EvaluationId::new("eval-1"));
        snapshot.clarity = Some(4.0);
        snapshot.volume = Some(4.0);
        snapshot.pace = Some(4.0);
        snapshot.tone = Some(4.0);
        assert_eq!(recompute_overall(&snapshot, &ruleset), 4.0);

        snapshot.tone = Some(2.0);
        assert!((recompute_overall(&snapshot, &ruleset) - 3.7).abs() < 1e-9);
    }

    #[test]
    fn voice_overall_zero_fills_unset_components() {
        let ruleset = CalibrationRuleset::v1();
        let mut snapshot = VoiceMetricSnapshot::empty(EvaluationId::new("eval-1"));
        snapshot.clarity = Some(4.0);
        assert_eq!(recompute_overall(&snapshot, &ruleset), 0.35 * 4.0);
    }

    #[test]
    fn feedback_input_rejects_blank_comment() {
        let input = FeedbackInput {
            evaluation_id: EvaluationId::new("eval-1"),
            evaluator_id: EvaluatorId::new("ev-1"),
            feedback_type: FeedbackType::Score,
            target: FeedbackTarget::ScoreByParameter(ParameterId::new("empathy")),
            original_score: Some(3.0),
            adjusted_score: Some(4.0),
            comment: "   ".to_string(),
        };
        assert!(matches!(
            input.validate(),
            Err(CalibrationError::Validation(_))
        ));
    }

    #[test]
    fn feedback_input_rejects_mismatched_target() {
        let input = FeedbackInput {
            evaluation_id: EvaluationId::new("eval-1"),
            evaluator_id: EvaluatorId::new("ev-1"),
            feedback_type: FeedbackType::Score,
            target: FeedbackTarget::VoiceMetric(VoiceMetric::Tone),
            original_score: Some(3.0),
            adjusted_score: Some(4.0),
            comment: "tone is off".to_string(),
        };
        assert!(matches!(
            input.validate(),
            Err(CalibrationError::Validation(_))
        ));
    }

    #[test]
    fn feedback_input_rejects_fractional_score_adjustment() {
        let input = FeedbackInput {
            evaluation_id: EvaluationId::new("eval-1"),
            evaluator_id: EvaluatorId::new("ev-1"),
            feedback_type: FeedbackType::Score,
            target: FeedbackTarget::ScoreByParameter(ParameterId::new("empathy")),
            original_score: Some(3.0),
            adjusted_score: Some(3.5),
            comment: "half points are not a thing here".to_string(),
        };
        assert!(matches!(
            input.validate(),
            Err(CalibrationError::Validation(_))
        ));
    }

    #[test]
    fn feedback_input_accepts_fractional_voice_adjustment() {
        let input = FeedbackInput {
            evaluation_id: EvaluationId::new("eval-1"),
            evaluator_id: EvaluatorId::new("ev-1"),
            feedback_type: FeedbackType::VoiceQuality,
            target: FeedbackTarget::VoiceMetric(VoiceMetric::Pace),
            original_score: Some(3.2),
            adjusted_score: Some(2.5),
            comment: "pacing dragged in the middle".to_string(),
        };
        must_ok(input.validate());
    }

    #[test]
    fn ruleset_v1_is_valid_and_json_roundtrips() {
        let ruleset = CalibrationRuleset::v1();
        must_ok(ruleset.validate());

        let value = must_ok(serde_json::to_value(&ruleset));
        let decoded = must_ok(CalibrationRuleset::from_json(&value));
        assert_eq!(decoded, ruleset);
    }

    #[test]
    fn ruleset_rejects_unbalanced_weights() {
        let mut ruleset = CalibrationRuleset::v1();
        ruleset.smoothing_prior_weight = 0.5;
        assert!(matches!(
            ruleset.validate(),
            Err(CalibrationError::Configuration(_))
        ));

        let mut ruleset = CalibrationRuleset::v1();
        ruleset.tone_weight = 0.5;
        assert!(matches!(
            ruleset.validate(),
            Err(CalibrationError::Configuration(_))
        ));
    }

    #[test]
    fn score_value_bounds_are_enforced() {
        must_ok(validate_score_value(1));
        must_ok(validate_score_value(5));
        assert!(validate_score_value(0).is_err());
        assert!(validate_score_value(6).is_err());
    }

    #[test]
    fn rfc3339_helpers_require_utc() {
        assert!(parse_rfc3339_utc("2026-08-24T12:00:00Z").is_ok());
        assert!(parse_rfc3339_utc("2026-08-24T12:00:00+02:00").is_err());
        assert!(parse_rfc3339_utc("not a timestamp").is_err());
    }
}
