use std::collections::BTreeMap;
use std::path::Path;

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use ulid::Ulid;

use eval_calibration_core::{
    calibrate_parameter, format_rfc3339, now_utc, parse_rfc3339_utc, recompute_overall,
    validate_score_value, CalibrationError, CalibrationHistoryEntry, CalibrationRuleset,
    CalibrationState, EvaluationId, EvaluatorId, FeedbackInput, FeedbackRecord, FeedbackTarget,
    FeedbackType, ParameterAnalysisResult, ParameterId, Score, ScoreCorrection, ScoringParameter,
    VoiceMetric, VoiceMetricSnapshot,
};

pub const ANALYSIS_REPORT_CONTRACT: &str = "calibration_report.v1";
pub const FEEDBACK_DELETION_CONTRACT: &str = "feedback_deletion.v1";

const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS evaluators (
  evaluator_id TEXT PRIMARY KEY,
  display_name TEXT NOT NULL CHECK (length(trim(display_name)) > 0)
);

CREATE TABLE IF NOT EXISTS scores (
  score_id TEXT PRIMARY KEY,
  evaluation_id TEXT NOT NULL,
  parameter_id TEXT NOT NULL,
  value INTEGER NOT NULL CHECK (value BETWEEN 1 AND 5),
  note TEXT NOT NULL DEFAULT '',
  UNIQUE (evaluation_id, parameter_id)
);

CREATE TABLE IF NOT EXISTS voice_metric_snapshots (
  evaluation_id TEXT PRIMARY KEY,
  clarity REAL,
  volume REAL,
  pace REAL,
  tone REAL,
  overall REAL
);

CREATE TABLE IF NOT EXISTS feedback_records (
  feedback_id TEXT PRIMARY KEY,
  evaluation_id TEXT NOT NULL,
  evaluator_id TEXT NOT NULL,
  feedback_type TEXT NOT NULL CHECK (feedback_type IN ('score', 'voice_quality')),
  score_id TEXT REFERENCES scores (score_id),
  voice_metric TEXT CHECK (voice_metric IN ('clarity', 'volume', 'pace', 'tone', 'overall')),
  original_score REAL,
  adjusted_score REAL,
  comment TEXT NOT NULL CHECK (length(trim(comment)) > 0),
  created_at TEXT NOT NULL,
  CHECK (
    (feedback_type = 'score' AND score_id IS NOT NULL AND voice_metric IS NULL)
    OR (feedback_type = 'voice_quality' AND voice_metric IS NOT NULL AND score_id IS NULL)
  )
);

CREATE INDEX IF NOT EXISTS idx_feedback_records_created_at
  ON feedback_records (created_at);
CREATE INDEX IF NOT EXISTS idx_feedback_records_evaluation
  ON feedback_records (evaluation_id, created_at);

CREATE TABLE IF NOT EXISTS calibration_states (
  parameter_id TEXT PRIMARY KEY,
  adjustment REAL NOT NULL CHECK (adjustment BETWEEN -2.0 AND 2.0),
  guidance TEXT NOT NULL DEFAULT '',
  total_feedback_count INTEGER NOT NULL DEFAULT 0 CHECK (total_feedback_count >= 0),
  last_batch_avg_adjustment REAL NOT NULL DEFAULT 0,
  last_analyzed_at TEXT
);

CREATE TABLE IF NOT EXISTS calibration_history (
  history_id TEXT PRIMARY KEY,
  parameter_id TEXT NOT NULL,
  previous_adjustment REAL NOT NULL,
  new_adjustment REAL NOT NULL,
  previous_guidance TEXT NOT NULL,
  new_guidance TEXT NOT NULL,
  feedback_count INTEGER NOT NULL CHECK (feedback_count >= 1),
  period_start TEXT NOT NULL,
  period_end TEXT NOT NULL,
  evaluator_ids_json TEXT NOT NULL,
  summary TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_calibration_history_parameter
  ON calibration_history (parameter_id, created_at DESC);

CREATE TABLE IF NOT EXISTS calibration_rulesets (
  ruleset_version INTEGER PRIMARY KEY,
  payload_json TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_calibration_history_no_update
BEFORE UPDATE ON calibration_history
BEGIN
  SELECT RAISE(FAIL, 'calibration_history is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_calibration_history_no_delete
BEFORE DELETE ON calibration_history
BEGIN
  SELECT RAISE(FAIL, 'calibration_history is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_feedback_records_no_update
BEFORE UPDATE ON feedback_records
BEGIN
  SELECT RAISE(FAIL, 'feedback_records are immutable');
END;
";

/// Result of a feedback deletion. `override_retained` is true when the
/// deleted record had applied a score or voice override: deletion removes
/// the record but never rolls the override back, and callers that need the
/// pre-feedback value must re-run scoring.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FeedbackDeletion {
    pub contract_version: String,
    pub feedback_id: Ulid,
    pub override_retained: bool,
}

/// Output of one batch analysis run over the whole parameter catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisReport {
    pub contract_version: String,
    #[serde(with = "time::serde::rfc3339")]
    pub period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub period_end: OffsetDateTime,
    pub total_feedbacks_analyzed: usize,
    pub results: BTreeMap<String, ParameterAnalysisResult>,
}

/// History entry with evaluator ids resolved to display names at read time.
/// Ids without a registry entry are omitted from `evaluator_names`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CalibrationHistoryView {
    #[serde(flatten)]
    pub entry: CalibrationHistoryEntry,
    pub evaluator_names: Vec<String>,
}

pub struct SqliteCalibrationStore {
    conn: Connection,
}

fn db(context: &'static str) -> impl Fn(rusqlite::Error) -> CalibrationError {
    move |err| CalibrationError::Persistence(format!("{context}: {err}"))
}

fn text_conversion_error(
    index: usize,
    err: CalibrationError,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(err))
}

fn parse_ulid_column(index: usize, raw: &str) -> rusqlite::Result<Ulid> {
    Ulid::from_string(raw).map_err(|err| {
        text_conversion_error(
            index,
            CalibrationError::Persistence(format!("invalid ULID column: {err}")),
        )
    })
}

fn parse_timestamp_column(index: usize, raw: &str) -> rusqlite::Result<OffsetDateTime> {
    parse_rfc3339_utc(raw).map_err(|err| text_conversion_error(index, err))
}

fn parse_score_row(row: &Row<'_>) -> rusqlite::Result<Score> {
    let score_id: String = row.get(0)?;
    Ok(Score {
        score_id: parse_ulid_column(0, &score_id)?,
        evaluation_id: EvaluationId::new(row.get::<_, String>(1)?),
        parameter_id: ParameterId::new(row.get::<_, String>(2)?),
        value: row.get(3)?,
        note: row.get(4)?,
    })
}

fn parse_snapshot_row(row: &Row<'_>) -> rusqlite::Result<VoiceMetricSnapshot> {
    Ok(VoiceMetricSnapshot {
        evaluation_id: EvaluationId::new(row.get::<_, String>(0)?),
        clarity: row.get(1)?,
        volume: row.get(2)?,
        pace: row.get(3)?,
        tone: row.get(4)?,
        overall: row.get(5)?,
    })
}

fn parse_feedback_row(row: &Row<'_>) -> rusqlite::Result<FeedbackRecord> {
    let feedback_id: String = row.get(0)?;
    let feedback_type: String = row.get(3)?;
    let feedback_type = FeedbackType::parse(&feedback_type).ok_or_else(|| {
        text_conversion_error(
            3,
            CalibrationError::Persistence(format!("unknown feedback type: {feedback_type}")),
        )
    })?;
    let score_id: Option<String> = row.get(4)?;
    let score_id = match score_id {
        Some(raw) => Some(parse_ulid_column(4, &raw)?),
        None => None,
    };
    let voice_metric: Option<String> = row.get(5)?;
    let voice_metric = match voice_metric {
        Some(raw) => Some(VoiceMetric::parse(&raw).ok_or_else(|| {
            text_conversion_error(
                5,
                CalibrationError::Persistence(format!("unknown voice metric: {raw}")),
            )
        })?),
        None => None,
    };
    let created_at: String = row.get(9)?;
    Ok(FeedbackRecord {
        feedback_id: parse_ulid_column(0, &feedback_id)?,
        evaluation_id: EvaluationId::new(row.get::<_, String>(1)?),
        evaluator_id: EvaluatorId::new(row.get::<_, String>(2)?),
        feedback_type,
        score_id,
        voice_metric,
        original_score: row.get(6)?,
        adjusted_score: row.get(7)?,
        comment: row.get(8)?,
        created_at: parse_timestamp_column(9, &created_at)?,
    })
}

fn parse_state_row(row: &Row<'_>) -> rusqlite::Result<CalibrationState> {
    let last_analyzed_at: Option<String> = row.get(5)?;
    let last_analyzed_at = match last_analyzed_at {
        Some(raw) => Some(parse_timestamp_column(5, &raw)?),
        None => None,
    };
    Ok(CalibrationState {
        parameter_id: ParameterId::new(row.get::<_, String>(0)?),
        adjustment: row.get(1)?,
        guidance: row.get(2)?,
        total_feedback_count: row.get(3)?,
        last_batch_avg_adjustment: row.get(4)?,
        last_analyzed_at,
    })
}

fn parse_history_row(row: &Row<'_>) -> rusqlite::Result<CalibrationHistoryEntry> {
    let history_id: String = row.get(0)?;
    let period_start: String = row.get(7)?;
    let period_end: String = row.get(8)?;
    let evaluator_ids_json: String = row.get(9)?;
    let evaluator_ids: Vec<EvaluatorId> =
        serde_json::from_str(&evaluator_ids_json).map_err(|err| {
            text_conversion_error(
                9,
                CalibrationError::Persistence(format!("invalid evaluator id list: {err}")),
            )
        })?;
    let created_at: String = row.get(11)?;
    Ok(CalibrationHistoryEntry {
        history_id: parse_ulid_column(0, &history_id)?,
        parameter_id: ParameterId::new(row.get::<_, String>(1)?),
        previous_adjustment: row.get(2)?,
        new_adjustment: row.get(3)?,
        previous_guidance: row.get(4)?,
        new_guidance: row.get(5)?,
        feedback_count: row.get(6)?,
        period_start: parse_timestamp_column(7, &period_start)?,
        period_end: parse_timestamp_column(8, &period_end)?,
        evaluator_ids,
        summary: row.get(10)?,
        created_at: parse_timestamp_column(11, &created_at)?,
    })
}

// Validated whole number in [1, 5] before this is called.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn score_value_from_adjusted(adjusted: f64) -> u8 {
    adjusted.round() as u8
}

fn load_score_by_id(conn: &Connection, score_id: Ulid) -> Result<Option<Score>, CalibrationError> {
    conn.query_row(
        "SELECT score_id, evaluation_id, parameter_id, value, note
         FROM scores WHERE score_id = ?1",
        params![score_id.to_string()],
        parse_score_row,
    )
    .optional()
    .map_err(db("load score by id"))
}

fn load_score_by_parameter(
    conn: &Connection,
    evaluation_id: &EvaluationId,
    parameter_id: &ParameterId,
) -> Result<Option<Score>, CalibrationError> {
    conn.query_row(
        "SELECT score_id, evaluation_id, parameter_id, value, note
         FROM scores WHERE evaluation_id = ?1 AND parameter_id = ?2",
        params![evaluation_id.as_str(), parameter_id.as_str()],
        parse_score_row,
    )
    .optional()
    .map_err(db("load score by parameter"))
}

fn load_snapshot(
    conn: &Connection,
    evaluation_id: &EvaluationId,
) -> Result<Option<VoiceMetricSnapshot>, CalibrationError> {
    conn.query_row(
        "SELECT evaluation_id, clarity, volume, pace, tone, overall
         FROM voice_metric_snapshots WHERE evaluation_id = ?1",
        params![evaluation_id.as_str()],
        parse_snapshot_row,
    )
    .optional()
    .map_err(db("load voice snapshot"))
}

fn write_snapshot(
    conn: &Connection,
    snapshot: &VoiceMetricSnapshot,
) -> Result<(), CalibrationError> {
    conn.execute(
        "INSERT INTO voice_metric_snapshots (evaluation_id, clarity, volume, pace, tone, overall)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT (evaluation_id) DO UPDATE SET
           clarity = excluded.clarity,
           volume = excluded.volume,
           pace = excluded.pace,
           tone = excluded.tone,
           overall = excluded.overall",
        params![
            snapshot.evaluation_id.as_str(),
            snapshot.clarity,
            snapshot.volume,
            snapshot.pace,
            snapshot.tone,
            snapshot.overall,
        ],
    )
    .map_err(db("write voice snapshot"))?;
    Ok(())
}

fn load_state(
    conn: &Connection,
    parameter_id: &ParameterId,
) -> Result<Option<CalibrationState>, CalibrationError> {
    conn.query_row(
        "SELECT parameter_id, adjustment, guidance, total_feedback_count,
                last_batch_avg_adjustment, last_analyzed_at
         FROM calibration_states WHERE parameter_id = ?1",
        params![parameter_id.as_str()],
        parse_state_row,
    )
    .optional()
    .map_err(db("load calibration state"))
}

fn upsert_state(conn: &Connection, state: &CalibrationState) -> Result<(), CalibrationError> {
    let last_analyzed_at = match state.last_analyzed_at {
        Some(stamp) => Some(format_rfc3339(stamp)?),
        None => None,
    };
    conn.execute(
        "INSERT INTO calibration_states
           (parameter_id, adjustment, guidance, total_feedback_count,
            last_batch_avg_adjustment, last_analyzed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT (parameter_id) DO UPDATE SET
           adjustment = excluded.adjustment,
           guidance = excluded.guidance,
           total_feedback_count = excluded.total_feedback_count,
           last_batch_avg_adjustment = excluded.last_batch_avg_adjustment,
           last_analyzed_at = excluded.last_analyzed_at",
        params![
            state.parameter_id.as_str(),
            state.adjustment,
            state.guidance,
            state.total_feedback_count,
            state.last_batch_avg_adjustment,
            last_analyzed_at,
        ],
    )
    .map_err(db("upsert calibration state"))?;
    Ok(())
}

fn insert_history(
    conn: &Connection,
    entry: &CalibrationHistoryEntry,
) -> Result<(), CalibrationError> {
    let evaluator_ids_json = serde_json::to_string(&entry.evaluator_ids).map_err(|err| {
        CalibrationError::Persistence(format!("encode evaluator id list: {err}"))
    })?;
    conn.execute(
        "INSERT INTO calibration_history
           (history_id, parameter_id, previous_adjustment, new_adjustment,
            previous_guidance, new_guidance, feedback_count, period_start,
            period_end, evaluator_ids_json, summary, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            entry.history_id.to_string(),
            entry.parameter_id.as_str(),
            entry.previous_adjustment,
            entry.new_adjustment,
            entry.previous_guidance,
            entry.new_guidance,
            entry.feedback_count,
            format_rfc3339(entry.period_start)?,
            format_rfc3339(entry.period_end)?,
            evaluator_ids_json,
            entry.summary,
            format_rfc3339(entry.created_at)?,
        ],
    )
    .map_err(db("insert calibration history entry"))?;
    Ok(())
}

fn window_corrections(
    conn: &Connection,
    parameter_id: &ParameterId,
    period_start: &str,
    period_end: &str,
) -> Result<Vec<ScoreCorrection>, CalibrationError> {
    let mut stmt = conn
        .prepare(
            "SELECT f.evaluator_id, e.display_name, f.original_score, f.adjusted_score, f.comment
             FROM feedback_records f
             JOIN scores s ON s.score_id = f.score_id
             LEFT JOIN evaluators e ON e.evaluator_id = f.evaluator_id
             WHERE f.feedback_type = 'score'
               AND f.adjusted_score IS NOT NULL
               AND f.original_score IS NOT NULL
               AND f.created_at >= ?1
               AND f.created_at <= ?2
               AND s.parameter_id = ?3
             ORDER BY f.created_at ASC, f.rowid ASC",
        )
        .map_err(db("prepare window query"))?;

    let rows = stmt
        .query_map(
            params![period_start, period_end, parameter_id.as_str()],
            |row| {
                Ok(ScoreCorrection {
                    evaluator_id: EvaluatorId::new(row.get::<_, String>(0)?),
                    evaluator_name: row.get(1)?,
                    original_score: row.get(2)?,
                    adjusted_score: row.get(3)?,
                    comment: row.get(4)?,
                })
            },
        )
        .map_err(db("run window query"))?;

    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(db("read window rows"))
}

fn analyze_parameter_in_tx(
    tx: &Transaction<'_>,
    parameter: &ScoringParameter,
    period_start: OffsetDateTime,
    period_end: OffsetDateTime,
    start_text: &str,
    end_text: &str,
    now: OffsetDateTime,
    ruleset: &CalibrationRuleset,
) -> Result<ParameterAnalysisResult, CalibrationError> {
    let corrections = window_corrections(tx, &parameter.id, start_text, end_text)?;
    if corrections.is_empty() {
        return Ok(ParameterAnalysisResult::empty());
    }

    let previous = load_state(tx, &parameter.id)?;
    let batch = calibrate_parameter(
        &parameter.id,
        &corrections,
        previous.as_ref(),
        period_start,
        period_end,
        now,
        ruleset,
    )?;

    upsert_state(tx, &batch.state)?;
    if let Some(entry) = &batch.history {
        insert_history(tx, entry)?;
    }

    Ok(batch.result)
}

impl SqliteCalibrationStore {
    /// Opens (or creates) the calibration database and applies connection
    /// pragmas. Call [`Self::migrate`] before first use.
    ///
    /// # Errors
    /// Returns [`CalibrationError::Persistence`] when the database cannot be
    /// opened or configured.
    pub fn open(path: &Path) -> Result<Self, CalibrationError> {
        let conn = Connection::open(path).map_err(db("open database"))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(db("configure sqlite pragmas"))?;
        Ok(Self { conn })
    }

    /// In-memory database for tests and throwaway runs.
    ///
    /// # Errors
    /// Returns [`CalibrationError::Persistence`] when the connection cannot
    /// be configured.
    pub fn open_in_memory() -> Result<Self, CalibrationError> {
        let conn = Connection::open_in_memory().map_err(db("open in-memory database"))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(db("configure sqlite pragmas"))?;
        Ok(Self { conn })
    }

    /// Applies the schema and seeds the v1 ruleset. Safe to call repeatedly.
    ///
    /// # Errors
    /// Returns [`CalibrationError::Persistence`] on schema or seed failures.
    pub fn migrate(&mut self) -> Result<(), CalibrationError> {
        let now_text = format_rfc3339(now_utc())?;
        let seed = CalibrationRuleset::v1();
        seed.validate()?;
        let payload = serde_json::to_string(&seed).map_err(|err| {
            CalibrationError::Persistence(format!("encode seed ruleset: {err}"))
        })?;

        let tx = self
            .conn
            .transaction()
            .map_err(db("begin migration transaction"))?;
        tx.execute_batch(SCHEMA).map_err(db("apply schema"))?;
        tx.execute(
            "INSERT OR IGNORE INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            params![SCHEMA_VERSION, now_text],
        )
        .map_err(db("record schema migration"))?;
        tx.execute(
            "INSERT OR IGNORE INTO calibration_rulesets (ruleset_version, payload_json, created_at)
             VALUES (?1, ?2, ?3)",
            params![seed.ruleset_version, payload, now_text],
        )
        .map_err(db("seed ruleset"))?;
        tx.commit().map_err(db("commit migration"))?;
        Ok(())
    }

    /// Stores a validated ruleset under its version. Existing versions are
    /// immutable.
    ///
    /// # Errors
    /// Returns [`CalibrationError::Configuration`] for invalid rulesets and
    /// [`CalibrationError::Persistence`] on write failures (including an
    /// attempt to overwrite an existing version).
    pub fn upsert_ruleset(&self, ruleset: &CalibrationRuleset) -> Result<(), CalibrationError> {
        ruleset.validate()?;
        let payload = serde_json::to_string(ruleset)
            .map_err(|err| CalibrationError::Persistence(format!("encode ruleset: {err}")))?;
        self.conn
            .execute(
                "INSERT INTO calibration_rulesets (ruleset_version, payload_json, created_at)
                 VALUES (?1, ?2, ?3)",
                params![ruleset.ruleset_version, payload, format_rfc3339(now_utc())?],
            )
            .map_err(db("insert ruleset"))?;
        Ok(())
    }

    /// Loads the highest-version persisted ruleset.
    ///
    /// # Errors
    /// Returns [`CalibrationError::Configuration`] when no ruleset exists or
    /// the stored payload fails validation.
    pub fn active_ruleset(&self) -> Result<CalibrationRuleset, CalibrationError> {
        let payload: Option<String> = self
            .conn
            .query_row(
                "SELECT payload_json FROM calibration_rulesets
                 ORDER BY ruleset_version DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(db("load ruleset"))?;

        let payload = payload.ok_or_else(|| {
            CalibrationError::Configuration(
                "no calibration ruleset persisted; run migrations first".to_string(),
            )
        })?;
        let value: serde_json::Value = serde_json::from_str(&payload).map_err(|err| {
            CalibrationError::Configuration(format!("stored ruleset is not valid JSON: {err}"))
        })?;
        CalibrationRuleset::from_json(&value)
    }

    /// Registers or renames an evaluator in the display-name registry.
    ///
    /// # Errors
    /// Returns [`CalibrationError::Validation`] for a blank name and
    /// [`CalibrationError::Persistence`] on write failures.
    pub fn upsert_evaluator(
        &self,
        evaluator_id: &EvaluatorId,
        display_name: &str,
    ) -> Result<(), CalibrationError> {
        if display_name.trim().is_empty() {
            return Err(CalibrationError::Validation(
                "evaluator display_name MUST be non-empty text".to_string(),
            ));
        }
        self.conn
            .execute(
                "INSERT INTO evaluators (evaluator_id, display_name) VALUES (?1, ?2)
                 ON CONFLICT (evaluator_id) DO UPDATE SET display_name = excluded.display_name",
                params![evaluator_id.as_str(), display_name],
            )
            .map_err(db("upsert evaluator"))?;
        Ok(())
    }

    /// Writes a score for an (evaluation, parameter) pair. Re-scoring
    /// overwrites value and note in place and keeps the original `score_id`.
    ///
    /// # Errors
    /// Returns [`CalibrationError::Validation`] for out-of-range values and
    /// [`CalibrationError::Persistence`] on write failures.
    pub fn upsert_score(
        &mut self,
        evaluation_id: &EvaluationId,
        parameter_id: &ParameterId,
        value: u8,
        note: &str,
    ) -> Result<Score, CalibrationError> {
        validate_score_value(value)?;
        let tx = self
            .conn
            .transaction()
            .map_err(db("begin score transaction"))?;
        tx.execute(
            "INSERT INTO scores (score_id, evaluation_id, parameter_id, value, note)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (evaluation_id, parameter_id) DO UPDATE SET
               value = excluded.value,
               note = excluded.note",
            params![
                Ulid::new().to_string(),
                evaluation_id.as_str(),
                parameter_id.as_str(),
                value,
                note,
            ],
        )
        .map_err(db("upsert score"))?;
        let score = load_score_by_parameter(&tx, evaluation_id, parameter_id)?.ok_or_else(|| {
            CalibrationError::Persistence("score row missing after upsert".to_string())
        })?;
        tx.commit().map_err(db("commit score transaction"))?;
        Ok(score)
    }

    /// Reads a score by (evaluation, parameter).
    ///
    /// # Errors
    /// Returns [`CalibrationError::Persistence`] on read failures.
    pub fn get_score(
        &self,
        evaluation_id: &EvaluationId,
        parameter_id: &ParameterId,
    ) -> Result<Option<Score>, CalibrationError> {
        load_score_by_parameter(&self.conn, evaluation_id, parameter_id)
    }

    /// Writes one named voice metric for an evaluation and recomputes the
    /// weighted overall. Setting `overall` directly skips the recompute.
    ///
    /// # Errors
    /// Returns [`CalibrationError::Validation`] for out-of-range values and
    /// [`CalibrationError::Persistence`] on write failures.
    pub fn set_voice_metric(
        &mut self,
        evaluation_id: &EvaluationId,
        metric: VoiceMetric,
        value: f64,
    ) -> Result<VoiceMetricSnapshot, CalibrationError> {
        if !(1.0..=5.0).contains(&value) {
            return Err(CalibrationError::Validation(format!(
                "voice metric value MUST be in [1.0, 5.0], got {value}"
            )));
        }
        let ruleset = self.active_ruleset()?;
        let tx = self
            .conn
            .transaction()
            .map_err(db("begin voice transaction"))?;
        let mut snapshot = load_snapshot(&tx, evaluation_id)?
            .unwrap_or_else(|| VoiceMetricSnapshot::empty(evaluation_id.clone()));
        snapshot.set_metric(metric, value);
        if metric != VoiceMetric::Overall {
            snapshot.overall = Some(recompute_overall(&snapshot, &ruleset));
        }
        write_snapshot(&tx, &snapshot)?;
        tx.commit().map_err(db("commit voice transaction"))?;
        Ok(snapshot)
    }

    /// Reads an evaluation's voice snapshot.
    ///
    /// # Errors
    /// Returns [`CalibrationError::Persistence`] on read failures.
    pub fn get_voice_snapshot(
        &self,
        evaluation_id: &EvaluationId,
    ) -> Result<Option<VoiceMetricSnapshot>, CalibrationError> {
        load_snapshot(&self.conn, evaluation_id)
    }

    /// Appends a feedback record and applies its immediate override in one
    /// transaction. A score-type feedback overwrites the target score's
    /// value; a voice-type feedback writes the named metric and recomputes
    /// the overall (unless the target is `overall` itself). When the caller
    /// omits `original_score` the currently stored value is captured as the
    /// original.
    ///
    /// # Errors
    /// Returns [`CalibrationError::Validation`] for malformed input, an
    /// unresolvable score target, or a score id belonging to a different
    /// evaluation, and [`CalibrationError::Persistence`] on write failures.
    /// On error nothing is persisted.
    pub fn submit_feedback(
        &mut self,
        input: &FeedbackInput,
    ) -> Result<FeedbackRecord, CalibrationError> {
        input.validate()?;
        let ruleset = self.active_ruleset()?;
        let now = now_utc();
        let tx = self
            .conn
            .transaction()
            .map_err(db("begin feedback transaction"))?;

        let mut score_id = None;
        let mut voice_metric = None;
        let mut original_score = input.original_score;

        match &input.target {
            FeedbackTarget::ScoreById(id) => {
                let score = load_score_by_id(&tx, *id)?.ok_or_else(|| {
                    CalibrationError::Validation(format!("no score found with id {id}"))
                })?;
                if score.evaluation_id != input.evaluation_id {
                    return Err(CalibrationError::Validation(format!(
                        "score {id} belongs to evaluation {}, not {}",
                        score.evaluation_id, input.evaluation_id
                    )));
                }
                if original_score.is_none() {
                    original_score = Some(f64::from(score.value));
                }
                if let Some(adjusted) = input.adjusted_score {
                    tx.execute(
                        "UPDATE scores SET value = ?1 WHERE score_id = ?2",
                        params![score_value_from_adjusted(adjusted), score.score_id.to_string()],
                    )
                    .map_err(db("apply score override"))?;
                }
                score_id = Some(score.score_id);
            }
            FeedbackTarget::ScoreByParameter(parameter_id) => {
                let score = load_score_by_parameter(&tx, &input.evaluation_id, parameter_id)?
                    .ok_or_else(|| {
                        CalibrationError::Validation(format!(
                            "no score found for evaluation {} and parameter {}",
                            input.evaluation_id, parameter_id
                        ))
                    })?;
                if original_score.is_none() {
                    original_score = Some(f64::from(score.value));
                }
                if let Some(adjusted) = input.adjusted_score {
                    tx.execute(
                        "UPDATE scores SET value = ?1 WHERE score_id = ?2",
                        params![score_value_from_adjusted(adjusted), score.score_id.to_string()],
                    )
                    .map_err(db("apply score override"))?;
                }
                score_id = Some(score.score_id);
            }
            FeedbackTarget::VoiceMetric(metric) => {
                let mut snapshot = load_snapshot(&tx, &input.evaluation_id)?
                    .unwrap_or_else(|| VoiceMetricSnapshot::empty(input.evaluation_id.clone()));
                if original_score.is_none() {
                    original_score = snapshot.metric(*metric);
                }
                if let Some(adjusted) = input.adjusted_score {
                    snapshot.set_metric(*metric, adjusted);
                    if *metric != VoiceMetric::Overall {
                        snapshot.overall = Some(recompute_overall(&snapshot, &ruleset));
                    }
                    write_snapshot(&tx, &snapshot)?;
                }
                voice_metric = Some(*metric);
            }
        }

        let record = FeedbackRecord {
            feedback_id: Ulid::new(),
            evaluation_id: input.evaluation_id.clone(),
            evaluator_id: input.evaluator_id.clone(),
            feedback_type: input.feedback_type,
            score_id,
            voice_metric,
            original_score,
            adjusted_score: input.adjusted_score,
            comment: input.comment.clone(),
            created_at: now,
        };

        tx.execute(
            "INSERT INTO feedback_records
               (feedback_id, evaluation_id, evaluator_id, feedback_type, score_id,
                voice_metric, original_score, adjusted_score, comment, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.feedback_id.to_string(),
                record.evaluation_id.as_str(),
                record.evaluator_id.as_str(),
                record.feedback_type.as_str(),
                record.score_id.map(|id| id.to_string()),
                record.voice_metric.map(VoiceMetric::as_str),
                record.original_score,
                record.adjusted_score,
                record.comment,
                format_rfc3339(record.created_at)?,
            ],
        )
        .map_err(db("append feedback record"))?;

        tx.commit().map_err(db("commit feedback transaction"))?;
        Ok(record)
    }

    /// Reads a feedback record by id.
    ///
    /// # Errors
    /// Returns [`CalibrationError::Persistence`] on read failures.
    pub fn get_feedback(
        &self,
        feedback_id: Ulid,
    ) -> Result<Option<FeedbackRecord>, CalibrationError> {
        self.conn
            .query_row(
                "SELECT feedback_id, evaluation_id, evaluator_id, feedback_type, score_id,
                        voice_metric, original_score, adjusted_score, comment, created_at
                 FROM feedback_records WHERE feedback_id = ?1",
                params![feedback_id.to_string()],
                parse_feedback_row,
            )
            .optional()
            .map_err(db("load feedback record"))
    }

    /// Lists feedback records, optionally filtered by evaluation, oldest
    /// first.
    ///
    /// # Errors
    /// Returns [`CalibrationError::Persistence`] on read failures.
    pub fn list_feedback(
        &self,
        evaluation_id: Option<&EvaluationId>,
    ) -> Result<Vec<FeedbackRecord>, CalibrationError> {
        let base = "SELECT feedback_id, evaluation_id, evaluator_id, feedback_type, score_id,
                           voice_metric, original_score, adjusted_score, comment, created_at
                    FROM feedback_records";
        match evaluation_id {
            Some(id) => {
                let mut stmt = self
                    .conn
                    .prepare(&format!(
                        "{base} WHERE evaluation_id = ?1 ORDER BY created_at ASC, rowid ASC"
                    ))
                    .map_err(db("prepare feedback list"))?;
                let rows = stmt
                    .query_map(params![id.as_str()], parse_feedback_row)
                    .map_err(db("list feedback"))?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(db("read feedback rows"))
            }
            None => {
                let mut stmt = self
                    .conn
                    .prepare(&format!("{base} ORDER BY created_at ASC, rowid ASC"))
                    .map_err(db("prepare feedback list"))?;
                let rows = stmt
                    .query_map([], parse_feedback_row)
                    .map_err(db("list feedback"))?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(db("read feedback rows"))
            }
        }
    }

    /// Deletes a feedback record. Allowed for the record's author or an
    /// admin requester. The score/voice override the record applied is NOT
    /// rolled back; the returned `override_retained` flag tells the caller
    /// whether an applied override outlives the record.
    ///
    /// # Errors
    /// Returns [`CalibrationError::NotFound`] for an unknown id,
    /// [`CalibrationError::Forbidden`] for a non-author non-admin requester,
    /// and [`CalibrationError::Persistence`] on write failures.
    pub fn delete_feedback(
        &mut self,
        feedback_id: Ulid,
        requester_id: &EvaluatorId,
        requester_is_admin: bool,
    ) -> Result<FeedbackDeletion, CalibrationError> {
        let record = self.get_feedback(feedback_id)?.ok_or_else(|| {
            CalibrationError::NotFound(format!("no feedback record with id {feedback_id}"))
        })?;

        if !requester_is_admin && record.evaluator_id != *requester_id {
            return Err(CalibrationError::Forbidden(format!(
                "feedback {feedback_id} can only be deleted by its author or an admin"
            )));
        }

        self.conn
            .execute(
                "DELETE FROM feedback_records WHERE feedback_id = ?1",
                params![feedback_id.to_string()],
            )
            .map_err(db("delete feedback record"))?;

        Ok(FeedbackDeletion {
            contract_version: FEEDBACK_DELETION_CONTRACT.to_string(),
            feedback_id,
            override_retained: record.adjusted_score.is_some(),
        })
    }

    /// Runs one batch calibration over the injected parameter catalog.
    ///
    /// Each parameter's read-compute-write runs in its own transaction; a
    /// failed parameter is reported in its result entry and the batch
    /// continues. Parameters with zero score corrections in the window emit
    /// the zero result and mutate nothing.
    ///
    /// # Errors
    /// Returns [`CalibrationError::Validation`] for a zero-day window and
    /// [`CalibrationError::Configuration`] when no ruleset is persisted.
    pub fn analyze(
        &mut self,
        catalog: &[ScoringParameter],
        period_days: Option<u32>,
    ) -> Result<AnalysisReport, CalibrationError> {
        let ruleset = self.active_ruleset()?;
        let days = period_days.unwrap_or(ruleset.default_period_days);
        if days == 0 {
            return Err(CalibrationError::Validation(
                "period_days MUST be a positive number of days".to_string(),
            ));
        }

        let period_end = now_utc();
        let period_start = period_end - Duration::days(i64::from(days));
        let start_text = format_rfc3339(period_start)?;
        let end_text = format_rfc3339(period_end)?;

        let mut results = BTreeMap::new();
        let mut total = 0;
        for parameter in catalog {
            let outcome = self
                .conn
                .transaction()
                .map_err(db("begin analysis transaction"))
                .and_then(|tx| {
                    let result = analyze_parameter_in_tx(
                        &tx,
                        parameter,
                        period_start,
                        period_end,
                        &start_text,
                        &end_text,
                        period_end,
                        &ruleset,
                    )?;
                    tx.commit().map_err(db("commit analysis transaction"))?;
                    Ok(result)
                });

            let result = match outcome {
                Ok(result) => result,
                Err(err) => ParameterAnalysisResult::failed(0, err.to_string()),
            };
            total += result.feedback_count;
            results.insert(parameter.id.as_str().to_string(), result);
        }

        Ok(AnalysisReport {
            contract_version: ANALYSIS_REPORT_CONTRACT.to_string(),
            period_start,
            period_end,
            total_feedbacks_analyzed: total,
            results,
        })
    }

    /// Returns the calibration state for every catalog parameter, in catalog
    /// order, substituting a zero-valued default for parameters no analysis
    /// batch has touched yet.
    ///
    /// # Errors
    /// Returns [`CalibrationError::Persistence`] on read failures.
    pub fn get_calibration_state(
        &self,
        catalog: &[ScoringParameter],
    ) -> Result<Vec<CalibrationState>, CalibrationError> {
        let mut states = Vec::with_capacity(catalog.len());
        for parameter in catalog {
            let state = load_state(&self.conn, &parameter.id)?
                .unwrap_or_else(|| CalibrationState::default_for(parameter.id.clone()));
            states.push(state);
        }
        Ok(states)
    }

    /// Reads calibration history, newest first, optionally filtered by
    /// parameter and bounded by `limit`. Evaluator ids are resolved to
    /// display names; ids missing from the registry are omitted from the
    /// name list.
    ///
    /// # Errors
    /// Returns [`CalibrationError::Persistence`] on read failures.
    pub fn get_calibration_history(
        &self,
        parameter_id: Option<&ParameterId>,
        limit: u32,
    ) -> Result<Vec<CalibrationHistoryView>, CalibrationError> {
        let base = "SELECT history_id, parameter_id, previous_adjustment, new_adjustment,
                           previous_guidance, new_guidance, feedback_count, period_start,
                           period_end, evaluator_ids_json, summary, created_at
                    FROM calibration_history";
        let entries = match parameter_id {
            Some(id) => {
                let mut stmt = self
                    .conn
                    .prepare(&format!(
                        "{base} WHERE parameter_id = ?1
                         ORDER BY created_at DESC, rowid DESC LIMIT ?2"
                    ))
                    .map_err(db("prepare history query"))?;
                let rows = stmt
                    .query_map(params![id.as_str(), i64::from(limit)], parse_history_row)
                    .map_err(db("run history query"))?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(db("read history rows"))?
            }
            None => {
                let mut stmt = self
                    .conn
                    .prepare(&format!(
                        "{base} ORDER BY created_at DESC, rowid DESC LIMIT ?1"
                    ))
                    .map_err(db("prepare history query"))?;
                let rows = stmt
                    .query_map(params![i64::from(limit)], parse_history_row)
                    .map_err(db("run history query"))?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(db("read history rows"))?
            }
        };

        let mut views = Vec::with_capacity(entries.len());
        for entry in entries {
            let mut evaluator_names = Vec::new();
            for evaluator_id in &entry.evaluator_ids {
                let name: Option<String> = self
                    .conn
                    .query_row(
                        "SELECT display_name FROM evaluators WHERE evaluator_id = ?1",
                        params![evaluator_id.as_str()],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(db("resolve evaluator name"))?;
                if let Some(name) = name {
                    if !evaluator_names.contains(&name) {
                        evaluator_names.push(name);
                    }
                }
            }
            views.push(CalibrationHistoryView {
                entry,
                evaluator_names,
            });
        }
        Ok(views)
    }
}
