#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use fillin_lifecycle_core::{
    apply_feedback, format_rfc3339, lifecycle_as_of, map_visibility, now_utc, parse_rfc3339_utc,
    project_report_lifecycle, FeedbackEvent, FeedbackEventInput, FeedbackKind, LifecycleError,
    LifecycleRuleset, LifecycleTransition, MapDecision, ReportCategory, ReportId, ReportInput,
    ReportLifecycle, ReportRecord, ReportStatus, TransitionReason,
};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;

const LIFECYCLE_MIGRATION_VERSION: i64 = 1;
const PROJECTOR_NAME: &str = "report_lifecycle_v1";
pub const DEFAULT_RULESET_VERSION: u32 = 1;

const SCHEMA_LIFECYCLE_V1: &str = r"
CREATE TABLE IF NOT EXISTS lifecycle_rulesets (
  ruleset_version INTEGER PRIMARY KEY,
  ruleset_json TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS reports (
  report_id TEXT PRIMARY KEY,
  category TEXT NOT NULL CHECK (category IN ('danger', 'inconvenience', 'discovery')),
  title TEXT NOT NULL,
  latitude REAL NOT NULL CHECK (latitude BETWEEN -90.0 AND 90.0),
  longitude REAL NOT NULL CHECK (longitude BETWEEN -180.0 AND 180.0),
  submitted_by TEXT NOT NULL,
  created_at TEXT NOT NULL,
  view_count INTEGER NOT NULL DEFAULT 0 CHECK (view_count >= 0)
);

CREATE TRIGGER IF NOT EXISTS trg_reports_identity_immutable
BEFORE UPDATE OF report_id, category, created_at ON reports
BEGIN
  SELECT RAISE(FAIL, 'report identity, category and created_at are immutable');
END;

CREATE TABLE IF NOT EXISTS feedback_events (
  event_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  event_id TEXT NOT NULL UNIQUE,
  ruleset_version INTEGER NOT NULL,
  report_id TEXT NOT NULL,
  kind TEXT NOT NULL CHECK (kind IN ('positive', 'negative')),
  occurred_at TEXT NOT NULL,
  recorded_at TEXT NOT NULL,
  voter_id TEXT NOT NULL,
  FOREIGN KEY (ruleset_version) REFERENCES lifecycle_rulesets(ruleset_version),
  FOREIGN KEY (report_id) REFERENCES reports(report_id)
);

CREATE TRIGGER IF NOT EXISTS trg_feedback_events_no_update
BEFORE UPDATE ON feedback_events
BEGIN
  SELECT RAISE(FAIL, 'feedback_events is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_feedback_events_no_delete
BEFORE DELETE ON feedback_events
BEGIN
  SELECT RAISE(FAIL, 'feedback_events is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_feedback_events_report_seq
  ON feedback_events(report_id, event_seq);
CREATE INDEX IF NOT EXISTS idx_feedback_events_report_voter
  ON feedback_events(report_id, voter_id);

CREATE TABLE IF NOT EXISTS report_lifecycle (
  report_id TEXT PRIMARY KEY,
  category TEXT NOT NULL CHECK (category IN ('danger', 'inconvenience', 'discovery')),
  status TEXT NOT NULL CHECK (status IN ('active', 'expiring', 'expired')),
  created_at TEXT NOT NULL,
  positive_count INTEGER NOT NULL CHECK (positive_count >= 0),
  negative_count INTEGER NOT NULL CHECK (negative_count >= 0),
  negative_window_json TEXT NOT NULL DEFAULT '[]',
  positive_sustained_since TEXT,
  balanced_sustained_since TEXT,
  condition_met_at TEXT,
  expiring_at TEXT,
  expired_at TEXT,
  last_event_seq INTEGER NOT NULL,
  last_event_at TEXT,
  last_ruleset_version INTEGER,
  revision INTEGER NOT NULL DEFAULT 0,
  updated_at TEXT NOT NULL,
  FOREIGN KEY (report_id) REFERENCES reports(report_id)
);

CREATE INDEX IF NOT EXISTS idx_report_lifecycle_status
  ON report_lifecycle(status, report_id);

CREATE TABLE IF NOT EXISTS lifecycle_transitions (
  report_id TEXT NOT NULL,
  transition_index INTEGER NOT NULL CHECK (transition_index >= 0),
  from_status TEXT NOT NULL CHECK (from_status IN ('active', 'expiring', 'expired')),
  to_status TEXT NOT NULL CHECK (to_status IN ('active', 'expiring', 'expired')),
  transitioned_at TEXT NOT NULL,
  event_seq INTEGER,
  reason TEXT NOT NULL,
  PRIMARY KEY (report_id, transition_index),
  FOREIGN KEY (report_id) REFERENCES reports(report_id)
);

CREATE TABLE IF NOT EXISTS lifecycle_projection_state (
  projector_name TEXT PRIMARY KEY,
  last_event_seq INTEGER NOT NULL,
  updated_at TEXT NOT NULL
);
";

const LIFECYCLE_COLUMNS: &str = "report_id, category, status, created_at,
    positive_count, negative_count, negative_window_json,
    positive_sustained_since, balanced_sustained_since, condition_met_at,
    expiring_at, expired_at, last_event_seq, last_event_at, last_ruleset_version,
    revision";

const EVENT_COLUMNS: &str = "event_seq, event_id, ruleset_version, report_id, kind,
    occurred_at, recorded_at, voter_id";

const REPORT_COLUMNS: &str =
    "report_id, category, title, latitude, longitude, submitted_by, created_at, view_count";

pub struct SqliteLifecycleStore {
    conn: Connection,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct FeedbackReceipt {
    pub event: FeedbackEvent,
    pub lifecycle: ReportLifecycle,
    pub new_transitions: Vec<LifecycleTransition>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct ReportView {
    pub report: ReportRecord,
    pub lifecycle: ReportLifecycle,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct ReplayReport {
    pub projected_reports: usize,
    pub processed_events: usize,
    pub last_event_seq: i64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct ProjectorStatus {
    pub contract_version: String,
    pub projector_name: String,
    pub projected_event_seq: i64,
    pub latest_event_seq: i64,
    pub lag_events: i64,
    pub tracked_reports: usize,
    pub lifecycle_rows: usize,
    pub stale_lifecycle_rows: usize,
    pub reports_without_lifecycle_row: usize,
    pub max_stale_seq_gap: i64,
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProjectorIssueSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct ProjectorIssue {
    pub code: String,
    pub severity: ProjectorIssueSeverity,
    pub message: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct ProjectorCheck {
    pub contract_version: String,
    pub healthy: bool,
    pub status: ProjectorStatus,
    pub issues: Vec<ProjectorIssue>,
    pub stale_report_sample: Vec<ProjectorStaleReport>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct ProjectorStaleReport {
    pub report_id: ReportId,
    pub max_event_seq: i64,
    pub projected_event_seq: Option<i64>,
}

impl SqliteLifecycleStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        ensure_reports_compatibility(&self.conn)?;

        self.conn
            .execute_batch(SCHEMA_LIFECYCLE_V1)
            .context("failed to apply lifecycle schema")?;

        let now = format_now()?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![LIFECYCLE_MIGRATION_VERSION, now],
            )
            .context("failed to register lifecycle schema migration")?;

        if !self.get_rulesets()?.contains_key(&DEFAULT_RULESET_VERSION) {
            self.upsert_ruleset(&LifecycleRuleset::v1())?;
        }

        self.conn
            .execute(
                "INSERT OR IGNORE INTO lifecycle_projection_state(projector_name, last_event_seq, updated_at)
                 VALUES (?1, 0, ?2)",
                params![PROJECTOR_NAME, now],
            )
            .context("failed to initialize projection state")?;

        tracing::debug!(version = LIFECYCLE_MIGRATION_VERSION, "lifecycle schema migrated");
        Ok(())
    }

    pub fn upsert_ruleset(&self, ruleset: &LifecycleRuleset) -> Result<()> {
        ruleset
            .validate()
            .map_err(|err| anyhow!("invalid ruleset configuration: {err}"))?;

        let payload = serde_json::to_string(ruleset).context("failed to serialize ruleset")?;
        let now = format_now()?;

        self.conn
            .execute(
                "INSERT INTO lifecycle_rulesets(ruleset_version, ruleset_json, created_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(ruleset_version) DO UPDATE SET
                   ruleset_json = excluded.ruleset_json,
                   created_at = excluded.created_at",
                params![i64::from(ruleset.ruleset_version), payload, now],
            )
            .context("failed to upsert ruleset")?;

        tracing::info!(
            ruleset_version = ruleset.ruleset_version,
            "lifecycle ruleset stored"
        );
        Ok(())
    }

    pub fn get_rulesets(&self) -> Result<BTreeMap<u32, LifecycleRuleset>> {
        load_rulesets(&self.conn)
    }

    pub fn create_report(&mut self, input: &ReportInput) -> Result<ReportRecord> {
        input
            .validate()
            .map_err(|err| anyhow!("report validation failed: {err}"))?;

        let record = input.clone().into_record();
        let lifecycle = ReportLifecycle::initial(&record);

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start report transaction")?;

        tx.execute(
            "INSERT INTO reports(
                report_id, category, title, latitude, longitude,
                submitted_by, created_at, view_count
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)",
            params![
                record.report_id.to_string(),
                record.category.as_str(),
                record.title,
                record.latitude,
                record.longitude,
                record.submitted_by,
                format_utc(record.created_at)?,
            ],
        )
        .with_context(|| format!("failed to insert report {}", record.report_id))?;

        upsert_lifecycle(&tx, &lifecycle)?;
        tx.commit().context("failed to commit report transaction")?;

        tracing::info!(
            report_id = %record.report_id,
            category = record.category.as_str(),
            "report registered"
        );
        Ok(record)
    }

    pub fn get_report(&self, report_id: ReportId) -> Result<Option<ReportRecord>> {
        query_report(&self.conn, report_id)
    }

    pub fn list_reports(
        &self,
        status: Option<ReportStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<ReportView>> {
        let mut query = format!(
            "SELECT {} FROM report_lifecycle
             WHERE ?1 IS NULL OR status = ?1
             ORDER BY report_id ASC",
            LIFECYCLE_COLUMNS
        );

        if let Some(raw_limit) = limit {
            query.push_str(" LIMIT ");
            query.push_str(&raw_limit.to_string());
        }

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(
            params![status.map(ReportStatus::as_str)],
            parse_lifecycle_row,
        )?;
        let lifecycles = collect_rows(rows)?;

        let mut views = Vec::with_capacity(lifecycles.len());
        for (mut lifecycle, _) in lifecycles {
            lifecycle.transitions = query_transitions(&self.conn, lifecycle.report_id)?;
            let report = query_report(&self.conn, lifecycle.report_id)?.ok_or_else(|| {
                anyhow!("lifecycle row without report for {}", lifecycle.report_id)
            })?;
            views.push(ReportView { report, lifecycle });
        }

        Ok(views)
    }

    pub fn record_view(&self, report_id: ReportId) -> Result<u64> {
        let changed = self
            .conn
            .execute(
                "UPDATE reports SET view_count = view_count + 1 WHERE report_id = ?1",
                params![report_id.to_string()],
            )
            .context("failed to record report view")?;

        if changed == 0 {
            return Err(anyhow!("report {report_id} not found"));
        }

        let count: i64 = self
            .conn
            .query_row(
                "SELECT view_count FROM reports WHERE report_id = ?1",
                params![report_id.to_string()],
                |row| row.get(0),
            )
            .context("failed to read view_count")?;

        u64::try_from(count).with_context(|| format!("invalid view_count: {count}"))
    }

    /// Appends one feedback event and advances the report's lifecycle in a
    /// single `IMMEDIATE` transaction, so submissions for a report are
    /// serialized and either fully applied or not at all.
    pub fn submit_feedback(&mut self, input: &FeedbackEventInput) -> Result<FeedbackReceipt> {
        input
            .validate()
            .map_err(|err| anyhow!("feedback validation failed: {err}"))?;

        let rulesets = self.get_rulesets()?;
        let ruleset = rulesets.get(&input.ruleset_version).ok_or_else(|| {
            anyhow!(
                "missing ruleset_version {} in lifecycle_rulesets",
                input.ruleset_version
            )
        })?;

        let event_id = input.event_id.unwrap_or_else(Ulid::new);
        let recorded_at = now_utc();

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start feedback transaction")?;

        let Some((lifecycle, revision)) = query_lifecycle(&tx, input.report_id)? else {
            return Err(anyhow!("report {} not found", input.report_id));
        };

        if lifecycle.status.is_terminal() {
            return Err(anyhow!(
                "report {} is expired and no longer accepts feedback",
                input.report_id
            ));
        }

        if ruleset.one_vote_per_voter && voter_has_feedback(&tx, input.report_id, &input.voter_id)?
        {
            return Err(anyhow!(
                "voter {} already submitted feedback for report {}",
                input.voter_id,
                input.report_id
            ));
        }

        tx.execute(
            "INSERT INTO feedback_events(
                event_id, ruleset_version, report_id, kind,
                occurred_at, recorded_at, voter_id
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event_id.to_string(),
                i64::from(input.ruleset_version),
                input.report_id.to_string(),
                input.kind.as_str(),
                format_utc(input.occurred_at)?,
                format_utc(recorded_at)?,
                input.voter_id,
            ],
        )
        .context("failed to append feedback event")?;

        let event = FeedbackEvent {
            event_seq: tx.last_insert_rowid(),
            event_id,
            ruleset_version: input.ruleset_version,
            report_id: input.report_id,
            kind: input.kind,
            occurred_at: input.occurred_at,
            recorded_at,
            voter_id: input.voter_id.clone(),
        };

        let next = apply_feedback(&lifecycle, &event, ruleset)
            .map_err(|err| anyhow!("feedback rejected for report {}: {err}", input.report_id))?;

        update_lifecycle(&tx, &next, revision)?;

        let already_logged = lifecycle.transitions.len();
        let new_transitions: Vec<LifecycleTransition> =
            next.transitions.iter().skip(already_logged).cloned().collect();
        insert_transitions(&tx, next.report_id, already_logged, &new_transitions)?;

        tx.execute(
            "UPDATE lifecycle_projection_state
             SET last_event_seq = MAX(last_event_seq, ?2), updated_at = ?3
             WHERE projector_name = ?1",
            params![PROJECTOR_NAME, event.event_seq, format_now()?],
        )
        .context("failed to advance projection state")?;

        tx.commit().context("failed to commit feedback transaction")?;

        tracing::debug!(
            report_id = %event.report_id,
            event_seq = event.event_seq,
            kind = event.kind.as_str(),
            status = next.status.as_str(),
            "feedback applied"
        );

        Ok(FeedbackReceipt {
            event,
            lifecycle: next,
            new_transitions,
        })
    }

    pub fn list_events_for_report(
        &self,
        report_id: ReportId,
        limit: Option<usize>,
    ) -> Result<Vec<FeedbackEvent>> {
        query_events(&self.conn, report_id, limit)
    }

    pub fn list_events_from_seq(&self, from_event_seq: i64) -> Result<Vec<FeedbackEvent>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM feedback_events
             WHERE event_seq >= ?1
             ORDER BY event_seq ASC",
            EVENT_COLUMNS
        ))?;

        let rows = stmt.query_map(params![from_event_seq], parse_event_row)?;
        collect_rows(rows)
    }

    pub fn list_transitions(&self, report_id: ReportId) -> Result<Vec<LifecycleTransition>> {
        query_transitions(&self.conn, report_id)
    }

    pub fn get_lifecycle(
        &self,
        report_id: ReportId,
        as_of: Option<OffsetDateTime>,
    ) -> Result<Option<ReportLifecycle>> {
        let Some((lifecycle, _)) = query_lifecycle(&self.conn, report_id)? else {
            return Ok(None);
        };

        let Some(as_of_value) = as_of else {
            return Ok(Some(lifecycle));
        };

        let ruleset = self.ruleset_for_lifecycle(&lifecycle)?;
        Ok(Some(lifecycle_as_of(&lifecycle, &ruleset, as_of_value)))
    }

    pub fn map_preview(
        &self,
        as_of: OffsetDateTime,
        report_ids: &[ReportId],
    ) -> Result<Vec<MapDecision>> {
        let mut decisions = Vec::with_capacity(report_ids.len());

        for report_id in report_ids {
            let Some((lifecycle, _)) = query_lifecycle(&self.conn, *report_id)? else {
                return Err(anyhow!("report {report_id} not found"));
            };
            let ruleset = self.ruleset_for_lifecycle(&lifecycle)?;
            decisions.push(map_visibility(&lifecycle, &ruleset, as_of));
        }

        Ok(decisions)
    }

    /// Rebuilds lifecycle projections from the feedback event log.
    ///
    /// A full replay covers every registered report; a partial replay
    /// re-projects only reports with events at or after `from_event_seq`.
    pub fn replay(&mut self, from_event_seq: Option<i64>) -> Result<ReplayReport> {
        let rulesets = self.get_rulesets()?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start replay transaction")?;

        let report_ids = match from_event_seq {
            Some(from) => reports_with_events_from(&tx, from)?,
            None => all_report_ids(&tx)?,
        };

        let mut projected_reports = 0_usize;
        let mut processed_events = 0_usize;

        for report_id in report_ids {
            let report = query_report(&tx, report_id)?
                .ok_or_else(|| anyhow!("feedback events reference unknown report {report_id}"))?;
            let events = query_events(&tx, report_id, None)?;
            processed_events += events.len();

            let lifecycle = project_report_lifecycle(&report, &events, &rulesets)
                .map_err(|err| anyhow!("failed projecting report {report_id}: {err}"))?;
            upsert_lifecycle(&tx, &lifecycle)?;
            replace_transitions(&tx, &lifecycle)?;
            projected_reports += 1;
        }

        let last_event_seq = latest_event_seq(&tx)?.unwrap_or(0);
        tx.execute(
            "INSERT INTO lifecycle_projection_state(projector_name, last_event_seq, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(projector_name) DO UPDATE SET
               last_event_seq = excluded.last_event_seq,
               updated_at = excluded.updated_at",
            params![PROJECTOR_NAME, last_event_seq, format_now()?],
        )
        .context("failed to update projection state")?;

        tx.commit().context("failed to commit replay transaction")?;

        tracing::info!(
            projected_reports,
            processed_events,
            last_event_seq,
            "lifecycle replay complete"
        );

        Ok(ReplayReport {
            projected_reports,
            processed_events,
            last_event_seq,
        })
    }

    pub fn projector_status(&self) -> Result<ProjectorStatus> {
        let (projected_event_seq, updated_at) = match self.projection_state(PROJECTOR_NAME)? {
            Some((seq, updated_at)) => (seq, Some(updated_at)),
            None => (0_i64, None),
        };

        let latest_event_seq = latest_event_seq(&self.conn)?.unwrap_or(0);
        let lag_events = (latest_event_seq - projected_event_seq).max(0);
        let tracked_reports = self.count_rows("reports")?;
        let lifecycle_rows = self.count_rows("report_lifecycle")?;
        let stale_reports = self.projector_stale_reports(None)?;
        let stale_lifecycle_rows = stale_reports.len();
        let reports_without_lifecycle_row = self.count_reports_without_lifecycle()?;
        let max_stale_seq_gap = stale_reports
            .iter()
            .map(|item| item.max_event_seq - item.projected_event_seq.unwrap_or(0))
            .max()
            .unwrap_or(0);

        Ok(ProjectorStatus {
            contract_version: "projector_status.v1".to_string(),
            projector_name: PROJECTOR_NAME.to_string(),
            projected_event_seq,
            latest_event_seq,
            lag_events,
            tracked_reports,
            lifecycle_rows,
            stale_lifecycle_rows,
            reports_without_lifecycle_row,
            max_stale_seq_gap,
            updated_at,
        })
    }

    pub fn projector_check(&self) -> Result<ProjectorCheck> {
        let status = self.projector_status()?;
        let mut issues = Vec::new();

        if status.lag_events > 0 {
            issues.push(ProjectorIssue {
                code: "projection_lag".to_string(),
                severity: ProjectorIssueSeverity::Error,
                message: format!(
                    "projection lag detected: {} events behind",
                    status.lag_events
                ),
            });
        }

        if status.stale_lifecycle_rows > 0 {
            issues.push(ProjectorIssue {
                code: "stale_lifecycle_rows".to_string(),
                severity: ProjectorIssueSeverity::Error,
                message: format!(
                    "stale lifecycle rows detected: {} reports out of date",
                    status.stale_lifecycle_rows
                ),
            });
        }

        if status.reports_without_lifecycle_row > 0 {
            issues.push(ProjectorIssue {
                code: "missing_lifecycle_rows".to_string(),
                severity: ProjectorIssueSeverity::Error,
                message: format!(
                    "reports without lifecycle rows: {}",
                    status.reports_without_lifecycle_row
                ),
            });
        }

        if status.tracked_reports != status.lifecycle_rows {
            issues.push(ProjectorIssue {
                code: "report_snapshot_mismatch".to_string(),
                severity: ProjectorIssueSeverity::Warning,
                message: format!(
                    "report/snapshot mismatch: tracked_reports={} lifecycle_rows={}",
                    status.tracked_reports, status.lifecycle_rows
                ),
            });
        }

        let stale_report_sample = self.projector_stale_reports(Some(25))?;
        let healthy = !issues
            .iter()
            .any(|item| item.severity == ProjectorIssueSeverity::Error);

        Ok(ProjectorCheck {
            contract_version: "projector_check.v1".to_string(),
            healthy,
            status,
            issues,
            stale_report_sample,
        })
    }

    pub fn projector_stale_reports(&self, limit: Option<usize>) -> Result<Vec<ProjectorStaleReport>> {
        let mut query = "SELECT
                events.report_id,
                events.max_event_seq,
                lifecycle.last_event_seq
             FROM (
                SELECT report_id, MAX(event_seq) AS max_event_seq
                FROM feedback_events
                GROUP BY report_id
             ) events
             LEFT JOIN report_lifecycle lifecycle
               ON lifecycle.report_id = events.report_id
             WHERE lifecycle.last_event_seq IS NULL
                OR lifecycle.last_event_seq < events.max_event_seq
             ORDER BY events.report_id ASC"
            .to_string();

        if let Some(raw_limit) = limit {
            query.push_str(" LIMIT ");
            query.push_str(&raw_limit.to_string());
        }

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map([], |row| {
            let report_id_raw: String = row.get(0)?;
            Ok(ProjectorStaleReport {
                report_id: parse_report_id(0, &report_id_raw)?,
                max_event_seq: row.get(1)?,
                projected_event_seq: row.get(2)?,
            })
        })?;

        collect_rows(rows)
    }

    fn ruleset_for_lifecycle(&self, lifecycle: &ReportLifecycle) -> Result<LifecycleRuleset> {
        let version = lifecycle
            .last_ruleset_version
            .unwrap_or(DEFAULT_RULESET_VERSION);
        let rulesets = self.get_rulesets()?;
        rulesets
            .get(&version)
            .cloned()
            .ok_or_else(|| anyhow!("missing ruleset {version} for report {}", lifecycle.report_id))
    }

    fn projection_state(&self, projector_name: &str) -> Result<Option<(i64, String)>> {
        let row = self
            .conn
            .query_row(
                "SELECT last_event_seq, updated_at
                 FROM lifecycle_projection_state
                 WHERE projector_name = ?1",
                params![projector_name],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .context("failed to query projection state")?;

        Ok(row)
    }

    fn count_rows(&self, table_name: &str) -> Result<usize> {
        let count = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {table_name}"), [], |row| {
                row.get::<_, i64>(0)
            })
            .with_context(|| format!("failed to count {table_name} rows"))?;
        usize::try_from(count).with_context(|| format!("invalid {table_name} row count: {count}"))
    }

    fn count_reports_without_lifecycle(&self) -> Result<usize> {
        let count = self
            .conn
            .query_row(
                "SELECT COUNT(*)
                 FROM reports report
                 LEFT JOIN report_lifecycle lifecycle
                   ON lifecycle.report_id = report.report_id
                 WHERE lifecycle.report_id IS NULL",
                [],
                |row| row.get::<_, i64>(0),
            )
            .context("failed to count reports without lifecycle rows")?;
        usize::try_from(count)
            .with_context(|| format!("invalid reports without lifecycle count: {count}"))
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn load_rulesets(conn: &Connection) -> Result<BTreeMap<u32, LifecycleRuleset>> {
    let mut stmt = conn.prepare(
        "SELECT ruleset_version, ruleset_json FROM lifecycle_rulesets ORDER BY ruleset_version ASC",
    )?;

    let mut rows = stmt.query([])?;
    let mut map = BTreeMap::new();

    while let Some(row) = rows.next()? {
        let version_i64: i64 = row.get(0)?;
        let version = u32::try_from(version_i64)
            .with_context(|| format!("invalid ruleset_version: {version_i64}"))?;
        let json: String = row.get(1)?;
        let value: Value = serde_json::from_str(&json).context("invalid stored ruleset JSON")?;
        let ruleset = LifecycleRuleset::from_json(&value)
            .map_err(|err| anyhow!("failed to parse ruleset {version}: {err}"))?;
        map.insert(version, ruleset);
    }

    Ok(map)
}

fn query_report(conn: &Connection, report_id: ReportId) -> Result<Option<ReportRecord>> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM reports WHERE report_id = ?1", REPORT_COLUMNS),
            params![report_id.to_string()],
            parse_report_row,
        )
        .optional()
        .with_context(|| format!("failed to load report {report_id}"))?;
    Ok(row)
}

fn all_report_ids(conn: &Connection) -> Result<Vec<ReportId>> {
    let mut stmt = conn.prepare("SELECT report_id FROM reports ORDER BY report_id ASC")?;
    let rows = stmt.query_map([], |row| {
        let raw: String = row.get(0)?;
        parse_report_id(0, &raw)
    })?;
    collect_rows(rows)
}

fn reports_with_events_from(conn: &Connection, from_event_seq: i64) -> Result<Vec<ReportId>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT report_id
         FROM feedback_events
         WHERE event_seq >= ?1
         ORDER BY report_id ASC",
    )?;
    let rows = stmt.query_map(params![from_event_seq], |row| {
        let raw: String = row.get(0)?;
        parse_report_id(0, &raw)
    })?;
    collect_rows(rows)
}

fn query_events(
    conn: &Connection,
    report_id: ReportId,
    limit: Option<usize>,
) -> Result<Vec<FeedbackEvent>> {
    let mut query = format!(
        "SELECT {} FROM feedback_events
         WHERE report_id = ?1
         ORDER BY event_seq ASC",
        EVENT_COLUMNS
    );

    if let Some(raw_limit) = limit {
        query.push_str(" LIMIT ");
        query.push_str(&raw_limit.to_string());
    }

    let mut stmt = conn.prepare(&query)?;
    let rows = stmt.query_map(params![report_id.to_string()], parse_event_row)?;
    collect_rows(rows)
}

fn voter_has_feedback(conn: &Connection, report_id: ReportId, voter_id: &str) -> Result<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM feedback_events WHERE report_id = ?1 AND voter_id = ?2 LIMIT 1",
            params![report_id.to_string(), voter_id],
            |_| Ok(()),
        )
        .optional()
        .context("failed to check for duplicate feedback")?
        .is_some();
    Ok(found)
}

fn latest_event_seq(conn: &Connection) -> Result<Option<i64>> {
    let value = conn
        .query_row("SELECT MAX(event_seq) FROM feedback_events", [], |row| {
            row.get::<_, Option<i64>>(0)
        })
        .context("failed to query latest event_seq")?;
    Ok(value)
}

fn query_lifecycle(
    conn: &Connection,
    report_id: ReportId,
) -> Result<Option<(ReportLifecycle, i64)>> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {} FROM report_lifecycle WHERE report_id = ?1",
                LIFECYCLE_COLUMNS
            ),
            params![report_id.to_string()],
            parse_lifecycle_row,
        )
        .optional()
        .with_context(|| format!("failed to load lifecycle for report {report_id}"))?;

    let Some((mut lifecycle, revision)) = row else {
        return Ok(None);
    };

    lifecycle.transitions = query_transitions(conn, report_id)?;
    lifecycle
        .validate()
        .map_err(|err| anyhow!("stored lifecycle for report {report_id} is malformed: {err}"))?;
    Ok(Some((lifecycle, revision)))
}

fn query_transitions(conn: &Connection, report_id: ReportId) -> Result<Vec<LifecycleTransition>> {
    let mut stmt = conn.prepare(
        "SELECT from_status, to_status, transitioned_at, event_seq, reason
         FROM lifecycle_transitions
         WHERE report_id = ?1
         ORDER BY transition_index ASC",
    )?;

    let rows = stmt.query_map(params![report_id.to_string()], |row| {
        let from_raw: String = row.get(0)?;
        let to_raw: String = row.get(1)?;
        let reason_raw: String = row.get(4)?;
        Ok(LifecycleTransition {
            from: parse_status(0, &from_raw)?,
            to: parse_status(1, &to_raw)?,
            at: parse_utc_column(&row.get::<_, String>(2)?)?,
            event_seq: row.get(3)?,
            reason: TransitionReason::parse(&reason_raw).ok_or_else(|| {
                invalid_column(4, Type::Text, format!("invalid reason: {reason_raw}"))
            })?,
        })
    })?;

    collect_rows(rows)
}

fn insert_transitions(
    conn: &Connection,
    report_id: ReportId,
    first_index: usize,
    transitions: &[LifecycleTransition],
) -> Result<()> {
    for (offset, transition) in transitions.iter().enumerate() {
        let index = i64::try_from(first_index + offset)
            .context("transition index exceeds sqlite integer range")?;
        conn.execute(
            "INSERT INTO lifecycle_transitions(
                report_id, transition_index, from_status, to_status,
                transitioned_at, event_seq, reason
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                report_id.to_string(),
                index,
                transition.from.as_str(),
                transition.to.as_str(),
                format_utc(transition.at)?,
                transition.event_seq,
                transition.reason.as_str(),
            ],
        )
        .with_context(|| format!("failed to record transition for report {report_id}"))?;
    }

    Ok(())
}

fn replace_transitions(conn: &Connection, lifecycle: &ReportLifecycle) -> Result<()> {
    conn.execute(
        "DELETE FROM lifecycle_transitions WHERE report_id = ?1",
        params![lifecycle.report_id.to_string()],
    )
    .context("failed to clear projected transitions")?;
    insert_transitions(conn, lifecycle.report_id, 0, &lifecycle.transitions)
}

struct LifecycleColumns {
    report_id: String,
    category: &'static str,
    status: &'static str,
    created_at: String,
    positive_count: i64,
    negative_count: i64,
    negative_window_json: String,
    positive_sustained_since: Option<String>,
    balanced_sustained_since: Option<String>,
    condition_met_at: Option<String>,
    expiring_at: Option<String>,
    expired_at: Option<String>,
    last_event_seq: i64,
    last_event_at: Option<String>,
    last_ruleset_version: Option<i64>,
    updated_at: String,
}

impl LifecycleColumns {
    fn encode(lifecycle: &ReportLifecycle) -> Result<Self> {
        let window = lifecycle
            .negative_window
            .iter()
            .map(|at| format_utc(*at))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            report_id: lifecycle.report_id.to_string(),
            category: lifecycle.category.as_str(),
            status: lifecycle.status.as_str(),
            created_at: format_utc(lifecycle.created_at)?,
            positive_count: i64::try_from(lifecycle.positive_count)
                .context("positive_count exceeds sqlite integer range")?,
            negative_count: i64::try_from(lifecycle.negative_count)
                .context("negative_count exceeds sqlite integer range")?,
            negative_window_json: serde_json::to_string(&window)
                .context("failed to serialize negative window")?,
            positive_sustained_since: format_optional(lifecycle.positive_sustained_since)?,
            balanced_sustained_since: format_optional(lifecycle.balanced_sustained_since)?,
            condition_met_at: format_optional(lifecycle.condition_met_at)?,
            expiring_at: format_optional(lifecycle.expiring_at)?,
            expired_at: format_optional(lifecycle.expired_at)?,
            last_event_seq: lifecycle.last_event_seq,
            last_event_at: format_optional(lifecycle.last_event_at)?,
            last_ruleset_version: lifecycle.last_ruleset_version.map(i64::from),
            updated_at: format_now()?,
        })
    }
}

fn upsert_lifecycle(conn: &Connection, lifecycle: &ReportLifecycle) -> Result<()> {
    let columns = LifecycleColumns::encode(lifecycle)?;
    conn.execute(
        "INSERT INTO report_lifecycle(
            report_id, category, status, created_at,
            positive_count, negative_count, negative_window_json,
            positive_sustained_since, balanced_sustained_since, condition_met_at,
            expiring_at, expired_at, last_event_seq, last_event_at, last_ruleset_version,
            revision, updated_at
         ) VALUES (
            ?1, ?2, ?3, ?4,
            ?5, ?6, ?7,
            ?8, ?9, ?10,
            ?11, ?12, ?13, ?14, ?15,
            0, ?16
         )
         ON CONFLICT(report_id) DO UPDATE SET
            status = excluded.status,
            positive_count = excluded.positive_count,
            negative_count = excluded.negative_count,
            negative_window_json = excluded.negative_window_json,
            positive_sustained_since = excluded.positive_sustained_since,
            balanced_sustained_since = excluded.balanced_sustained_since,
            condition_met_at = excluded.condition_met_at,
            expiring_at = excluded.expiring_at,
            expired_at = excluded.expired_at,
            last_event_seq = excluded.last_event_seq,
            last_event_at = excluded.last_event_at,
            last_ruleset_version = excluded.last_ruleset_version,
            revision = report_lifecycle.revision + 1,
            updated_at = excluded.updated_at",
        params![
            columns.report_id,
            columns.category,
            columns.status,
            columns.created_at,
            columns.positive_count,
            columns.negative_count,
            columns.negative_window_json,
            columns.positive_sustained_since,
            columns.balanced_sustained_since,
            columns.condition_met_at,
            columns.expiring_at,
            columns.expired_at,
            columns.last_event_seq,
            columns.last_event_at,
            columns.last_ruleset_version,
            columns.updated_at,
        ],
    )
    .with_context(|| format!("failed to upsert lifecycle for report {}", lifecycle.report_id))?;

    Ok(())
}

/// Writes a lifecycle snapshot only if its stored revision still equals
/// `expected_revision`.
fn update_lifecycle(
    conn: &Connection,
    lifecycle: &ReportLifecycle,
    expected_revision: i64,
) -> Result<()> {
    let columns = LifecycleColumns::encode(lifecycle)?;
    let changed = conn
        .execute(
            "UPDATE report_lifecycle SET
                status = ?2,
                positive_count = ?3,
                negative_count = ?4,
                negative_window_json = ?5,
                positive_sustained_since = ?6,
                balanced_sustained_since = ?7,
                condition_met_at = ?8,
                expiring_at = ?9,
                expired_at = ?10,
                last_event_seq = ?11,
                last_event_at = ?12,
                last_ruleset_version = ?13,
                revision = revision + 1,
                updated_at = ?14
             WHERE report_id = ?1 AND revision = ?15",
            params![
                columns.report_id,
                columns.status,
                columns.positive_count,
                columns.negative_count,
                columns.negative_window_json,
                columns.positive_sustained_since,
                columns.balanced_sustained_since,
                columns.condition_met_at,
                columns.expiring_at,
                columns.expired_at,
                columns.last_event_seq,
                columns.last_event_at,
                columns.last_ruleset_version,
                columns.updated_at,
                expected_revision,
            ],
        )
        .with_context(|| format!("failed to update lifecycle for report {}", lifecycle.report_id))?;

    if changed == 0 {
        return Err(anyhow!(
            "concurrent lifecycle update detected for report {} (expected revision {})",
            lifecycle.report_id,
            expected_revision
        ));
    }

    Ok(())
}

fn parse_report_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReportRecord> {
    let report_id_raw: String = row.get(0)?;
    let category_raw: String = row.get(1)?;
    let view_count_i64: i64 = row.get(7)?;

    Ok(ReportRecord {
        report_id: parse_report_id(0, &report_id_raw)?,
        category: parse_category(1, &category_raw)?,
        title: row.get(2)?,
        latitude: row.get(3)?,
        longitude: row.get(4)?,
        submitted_by: row.get(5)?,
        created_at: parse_utc_column(&row.get::<_, String>(6)?)?,
        view_count: parse_count(7, view_count_i64)?,
    })
}

fn parse_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FeedbackEvent> {
    let event_id_raw: String = row.get(1)?;
    let ruleset_version_i64: i64 = row.get(2)?;
    let report_id_raw: String = row.get(3)?;
    let kind_raw: String = row.get(4)?;

    let event_id = Ulid::from_string(&event_id_raw).map_err(|_| {
        invalid_column(1, Type::Text, format!("invalid event_id ULID: {event_id_raw}"))
    })?;

    let ruleset_version = u32::try_from(ruleset_version_i64).map_err(|_| {
        invalid_column(
            2,
            Type::Integer,
            format!("invalid ruleset_version: {ruleset_version_i64}"),
        )
    })?;

    let kind = FeedbackKind::parse(&kind_raw)
        .ok_or_else(|| invalid_column(4, Type::Text, format!("invalid kind: {kind_raw}")))?;

    Ok(FeedbackEvent {
        event_seq: row.get(0)?,
        event_id,
        ruleset_version,
        report_id: parse_report_id(3, &report_id_raw)?,
        kind,
        occurred_at: parse_utc_column(&row.get::<_, String>(5)?)?,
        recorded_at: parse_utc_column(&row.get::<_, String>(6)?)?,
        voter_id: row.get(7)?,
    })
}

fn parse_lifecycle_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(ReportLifecycle, i64)> {
    let report_id_raw: String = row.get(0)?;
    let category_raw: String = row.get(1)?;
    let status_raw: String = row.get(2)?;
    let positive_i64: i64 = row.get(4)?;
    let negative_i64: i64 = row.get(5)?;
    let window_json: String = row.get(6)?;
    let last_ruleset_i64: Option<i64> = row.get(14)?;

    let window_raw: Vec<String> = serde_json::from_str(&window_json).map_err(|err| {
        invalid_column(6, Type::Text, format!("invalid negative_window_json: {err}"))
    })?;
    let negative_window = window_raw
        .iter()
        .map(String::as_str)
        .map(parse_utc_column)
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let last_ruleset_version = last_ruleset_i64
        .map(|value| {
            u32::try_from(value).map_err(|_| {
                invalid_column(14, Type::Integer, format!("invalid ruleset version: {value}"))
            })
        })
        .transpose()?;

    let lifecycle = ReportLifecycle {
        report_id: parse_report_id(0, &report_id_raw)?,
        category: parse_category(1, &category_raw)?,
        status: parse_status(2, &status_raw)?,
        created_at: parse_utc_column(&row.get::<_, String>(3)?)?,
        positive_count: parse_count(4, positive_i64)?,
        negative_count: parse_count(5, negative_i64)?,
        negative_window,
        positive_sustained_since: parse_optional_utc_column(row, 7)?,
        balanced_sustained_since: parse_optional_utc_column(row, 8)?,
        condition_met_at: parse_optional_utc_column(row, 9)?,
        expiring_at: parse_optional_utc_column(row, 10)?,
        expired_at: parse_optional_utc_column(row, 11)?,
        last_event_seq: row.get(12)?,
        last_event_at: parse_optional_utc_column(row, 13)?,
        last_ruleset_version,
        transitions: Vec::new(),
    };

    Ok((lifecycle, row.get(15)?))
}

fn parse_report_id(index: usize, raw: &str) -> rusqlite::Result<ReportId> {
    ReportId::parse(raw).map_err(|err| invalid_column(index, Type::Text, err.to_string()))
}

fn parse_category(index: usize, raw: &str) -> rusqlite::Result<ReportCategory> {
    ReportCategory::parse(raw)
        .ok_or_else(|| invalid_column(index, Type::Text, format!("invalid category: {raw}")))
}

fn parse_status(index: usize, raw: &str) -> rusqlite::Result<ReportStatus> {
    ReportStatus::parse(raw)
        .ok_or_else(|| invalid_column(index, Type::Text, format!("invalid status: {raw}")))
}

fn parse_count(index: usize, value: i64) -> rusqlite::Result<u64> {
    u64::try_from(value).map_err(|_| {
        invalid_column(
            index,
            Type::Integer,
            format!("counter MUST be non-negative, got {value}"),
        )
    })
}

fn parse_utc_column(raw: &str) -> rusqlite::Result<OffsetDateTime> {
    parse_rfc3339_utc(raw).map_err(to_sql_error)
}

fn parse_optional_utc_column(
    row: &rusqlite::Row<'_>,
    index: usize,
) -> rusqlite::Result<Option<OffsetDateTime>> {
    row.get::<_, Option<String>>(index)?
        .as_deref()
        .map(parse_utc_column)
        .transpose()
}

fn invalid_column(index: usize, kind: Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        kind,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            message,
        )),
    )
}

#[allow(clippy::needless_pass_by_value)]
fn to_sql_error(err: LifecycleError) -> rusqlite::Error {
    invalid_column(0, Type::Text, err.to_string())
}

fn format_utc(value: OffsetDateTime) -> Result<String> {
    format_rfc3339(value).map_err(|err| anyhow!(err.to_string()))
}

fn format_optional(value: Option<OffsetDateTime>) -> Result<Option<String>> {
    value.map(format_utc).transpose()
}

fn format_now() -> Result<String> {
    format_utc(now_utc())
}

fn ensure_reports_compatibility(conn: &Connection) -> Result<()> {
    if !table_exists(conn, "reports")? {
        return Ok(());
    }

    ensure_table_has_columns(
        conn,
        "reports",
        &[
            "report_id",
            "category",
            "title",
            "latitude",
            "longitude",
            "submitted_by",
            "created_at",
            "view_count",
        ],
    )
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();

    Ok(exists)
}

fn ensure_table_has_columns(conn: &Connection, table_name: &str, columns: &[&str]) -> Result<()> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table_name})"))
        .with_context(|| format!("failed to inspect table_info for {table_name}"))?;
    let mut rows = stmt.query([])?;

    let mut available = Vec::new();
    while let Some(row) = rows.next()? {
        available.push(row.get::<_, String>(1)?);
    }

    for required in columns {
        if !available.iter().any(|candidate| candidate == required) {
            return Err(anyhow!(
                "schema compatibility check failed: {table_name} is missing column {required}"
            ));
        }
    }

    Ok(())
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines)]

    use super::*;
    use fillin_lifecycle_core::from_unix_millis;
    use proptest::prelude::*;
    use time::Duration;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn fixture_store() -> SqliteLifecycleStore {
        let store = must(SqliteLifecycleStore::open(Path::new(":memory:")));
        must(store.migrate());
        store
    }

    fn t0() -> OffsetDateTime {
        match parse_rfc3339_utc("2026-02-07T12:00:00Z") {
            Ok(value) => value,
            Err(err) => panic!("invalid fixture timestamp: {err}"),
        }
    }

    fn fixture_report_input() -> ReportInput {
        ReportInput {
            report_id: None,
            category: ReportCategory::Inconvenience,
            title: "Sidewalk blocked by construction".to_string(),
            latitude: 37.4979,
            longitude: 127.0276,
            submitted_by: "reporter-1".to_string(),
            created_at: t0(),
        }
    }

    fn seed_report(store: &mut SqliteLifecycleStore) -> ReportId {
        must(store.create_report(&fixture_report_input())).report_id
    }

    fn feedback(
        report_id: ReportId,
        kind: FeedbackKind,
        voter: &str,
        occurred_at: OffsetDateTime,
    ) -> FeedbackEventInput {
        FeedbackEventInput {
            event_id: None,
            ruleset_version: 1,
            report_id,
            kind,
            occurred_at,
            voter_id: voter.to_string(),
        }
    }

    fn must_lifecycle(store: &SqliteLifecycleStore, report_id: ReportId) -> ReportLifecycle {
        match must(store.get_lifecycle(report_id, None)) {
            Some(value) => value,
            None => panic!("missing lifecycle snapshot for {report_id}"),
        }
    }

    fn drive_to_expired(store: &mut SqliteLifecycleStore, report_id: ReportId) {
        for (voter, offset) in [("v1", 0), ("v2", 7), ("v3", 10)] {
            must(store.submit_feedback(&feedback(
                report_id,
                FeedbackKind::Negative,
                voter,
                t0() + Duration::days(offset),
            )));
        }
    }

    fn count_events(store: &SqliteLifecycleStore) -> i64 {
        match store
            .connection()
            .query_row("SELECT COUNT(*) FROM feedback_events", [], |row| row.get(0))
        {
            Ok(value) => value,
            Err(err) => panic!("failed to count events: {err}"),
        }
    }

    #[test]
    fn created_report_starts_active_with_empty_lifecycle() {
        let mut store = fixture_store();
        let report_id = seed_report(&mut store);

        let lifecycle = must_lifecycle(&store, report_id);
        assert_eq!(lifecycle.status, ReportStatus::Active);
        assert_eq!(lifecycle.positive_count, 0);
        assert_eq!(lifecycle.condition_met_at, None);
        assert!(lifecycle.transitions.is_empty());

        let report = match must(store.get_report(report_id)) {
            Some(value) => value,
            None => panic!("missing report"),
        };
        assert_eq!(report.category, ReportCategory::Inconvenience);
        assert_eq!(report.view_count, 0);
    }

    #[test]
    fn append_only_trigger_blocks_updates_and_deletes() {
        let mut store = fixture_store();
        let report_id = seed_report(&mut store);
        let receipt =
            must(store.submit_feedback(&feedback(report_id, FeedbackKind::Positive, "v1", t0())));

        let update_result = store.connection().execute(
            "UPDATE feedback_events SET voter_id = 'mutated' WHERE event_seq = ?1",
            params![receipt.event.event_seq],
        );
        assert!(update_result.is_err());

        let delete_result = store.connection().execute(
            "DELETE FROM feedback_events WHERE event_seq = ?1",
            params![receipt.event.event_seq],
        );
        assert!(delete_result.is_err());
    }

    #[test]
    fn report_category_is_immutable() {
        let mut store = fixture_store();
        let report_id = seed_report(&mut store);
        let result = store.connection().execute(
            "UPDATE reports SET category = 'danger' WHERE report_id = ?1",
            params![report_id.to_string()],
        );
        assert!(result.is_err());
    }

    #[test]
    fn inline_projection_matches_full_replay() {
        let mut store = fixture_store();
        let report_id = seed_report(&mut store);

        let stream = [
            (FeedbackKind::Negative, "v1", 0),
            (FeedbackKind::Negative, "v2", 2),
            (FeedbackKind::Positive, "v3", 5),
            (FeedbackKind::Negative, "v4", 8),
            (FeedbackKind::Negative, "v5", 12),
        ];
        for (kind, voter, days) in stream {
            must(store.submit_feedback(&feedback(
                report_id,
                kind,
                voter,
                t0() + Duration::days(days),
            )));
        }

        let inline = must_lifecycle(&store, report_id);
        let report = must(store.replay(None));
        assert_eq!(report.processed_events, 5);
        assert_eq!(report.projected_reports, 1);

        let replayed = must_lifecycle(&store, report_id);
        assert_eq!(inline, replayed);
        assert_eq!(must(store.list_transitions(report_id)), replayed.transitions);
    }

    #[test]
    fn transitions_are_persisted_with_their_triggering_event() {
        let mut store = fixture_store();
        let report_id = seed_report(&mut store);
        must(store.submit_feedback(&feedback(report_id, FeedbackKind::Negative, "v1", t0())));
        let receipt = must(store.submit_feedback(&feedback(
            report_id,
            FeedbackKind::Negative,
            "v2",
            t0() + Duration::days(7),
        )));

        assert_eq!(receipt.lifecycle.status, ReportStatus::Expiring);
        assert_eq!(receipt.new_transitions.len(), 1);
        assert_eq!(
            receipt.new_transitions[0].event_seq,
            Some(receipt.event.event_seq)
        );

        let stored = must(store.list_transitions(report_id));
        assert_eq!(stored, receipt.new_transitions);
        let listed = must(store.list_reports(Some(ReportStatus::Expiring), None));
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].lifecycle.report_id, report_id);
        assert!(must(store.list_reports(Some(ReportStatus::Active), None)).is_empty());
    }

    #[test]
    fn duplicate_voter_is_rejected_without_appending() {
        let mut store = fixture_store();
        let report_id = seed_report(&mut store);
        must(store.submit_feedback(&feedback(report_id, FeedbackKind::Positive, "v1", t0())));

        let result = store.submit_feedback(&feedback(
            report_id,
            FeedbackKind::Negative,
            "v1",
            t0() + Duration::hours(1),
        ));
        let err = match result {
            Ok(_) => panic!("expected duplicate vote rejection"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("already submitted feedback"));
        assert_eq!(count_events(&store), 1);
    }

    #[test]
    fn duplicate_votes_are_accepted_when_ruleset_allows() {
        let mut store = fixture_store();
        let mut ruleset = LifecycleRuleset::v1();
        ruleset.ruleset_version = 2;
        ruleset.one_vote_per_voter = false;
        must(store.upsert_ruleset(&ruleset));

        let report_id = seed_report(&mut store);
        for hours in [0, 1] {
            let mut input = feedback(
                report_id,
                FeedbackKind::Positive,
                "v1",
                t0() + Duration::hours(hours),
            );
            input.ruleset_version = 2;
            must(store.submit_feedback(&input));
        }

        assert_eq!(must_lifecycle(&store, report_id).positive_count, 2);
        let replay = must(store.replay(None));
        assert_eq!(replay.processed_events, 2);
    }

    #[test]
    fn out_of_order_feedback_rolls_back_the_append() {
        let mut store = fixture_store();
        let report_id = seed_report(&mut store);
        must(store.submit_feedback(&feedback(
            report_id,
            FeedbackKind::Positive,
            "v1",
            t0() + Duration::hours(5),
        )));
        let before = must_lifecycle(&store, report_id);

        let result = store.submit_feedback(&feedback(
            report_id,
            FeedbackKind::Negative,
            "v2",
            t0() + Duration::hours(1),
        ));
        assert!(result.is_err());
        assert_eq!(count_events(&store), 1);
        assert_eq!(must_lifecycle(&store, report_id), before);
    }

    #[test]
    fn expired_report_rejects_feedback() {
        let mut store = fixture_store();
        let report_id = seed_report(&mut store);
        drive_to_expired(&mut store, report_id);
        assert_eq!(must_lifecycle(&store, report_id).status, ReportStatus::Expired);

        let result = store.submit_feedback(&feedback(
            report_id,
            FeedbackKind::Positive,
            "v9",
            t0() + Duration::days(11),
        ));
        let err = match result {
            Ok(_) => panic!("expected expired report rejection"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("expired"));
        assert_eq!(count_events(&store), 3);
    }

    #[test]
    fn unknown_report_is_rejected() {
        let mut store = fixture_store();
        let result = store.submit_feedback(&feedback(
            ReportId::generate(),
            FeedbackKind::Positive,
            "v1",
            t0(),
        ));
        assert!(result.is_err());
        assert!(store.record_view(ReportId::generate()).is_err());
    }

    #[test]
    fn stale_revision_is_reported_as_concurrent_update() {
        let mut store = fixture_store();
        let report_id = seed_report(&mut store);
        must(store.submit_feedback(&feedback(report_id, FeedbackKind::Positive, "v1", t0())));

        let lifecycle = must_lifecycle(&store, report_id);
        let err = match update_lifecycle(store.connection(), &lifecycle, 0) {
            Ok(()) => panic!("expected revision conflict"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("concurrent lifecycle update"));
    }

    #[test]
    fn record_view_increments_counter() {
        let mut store = fixture_store();
        let report_id = seed_report(&mut store);
        assert_eq!(must(store.record_view(report_id)), 1);
        assert_eq!(must(store.record_view(report_id)), 2);
        assert_eq!(must_lifecycle(&store, report_id).status, ReportStatus::Active);
    }

    #[test]
    fn as_of_lookup_and_map_preview_apply_clock_transitions() {
        let mut store = fixture_store();
        let report_id = seed_report(&mut store);
        let quiet_id = seed_report(&mut store);
        must(store.submit_feedback(&feedback(report_id, FeedbackKind::Negative, "v1", t0())));

        let as_of = t0() + Duration::days(7);
        let viewed = match must(store.get_lifecycle(report_id, Some(as_of))) {
            Some(value) => value,
            None => panic!("missing lifecycle"),
        };
        assert_eq!(viewed.status, ReportStatus::Expiring);
        assert_eq!(must_lifecycle(&store, report_id).status, ReportStatus::Active);

        let decisions = must(store.map_preview(as_of, &[report_id, quiet_id]));
        assert_eq!(decisions.len(), 2);
        assert!(decisions[0].visible);
        assert_eq!(decisions[0].reason_codes, vec!["included.expiring"]);
        assert_eq!(decisions[1].reason_codes, vec!["included.active.no_feedback"]);
    }

    #[test]
    fn map_preview_hides_expired_reports() {
        let mut store = fixture_store();
        let report_id = seed_report(&mut store);
        drive_to_expired(&mut store, report_id);

        let decisions = must(store.map_preview(t0() + Duration::days(12), &[report_id]));
        assert!(!decisions[0].visible);
        assert_eq!(decisions[0].status, ReportStatus::Expired);
    }

    #[test]
    fn projector_check_detects_and_recovers_from_unprojected_events() {
        let mut store = fixture_store();
        let report_id = seed_report(&mut store);
        must(store.submit_feedback(&feedback(report_id, FeedbackKind::Positive, "v1", t0())));
        assert!(must(store.projector_check()).healthy);

        let inserted = store.connection().execute(
            "INSERT INTO feedback_events(
                event_id, ruleset_version, report_id, kind, occurred_at, recorded_at, voter_id
             ) VALUES (?1, 1, ?2, 'negative', ?3, ?3, 'v2')",
            params![
                Ulid::new().to_string(),
                report_id.to_string(),
                "2026-02-08T12:00:00Z"
            ],
        );
        if let Err(err) = inserted {
            panic!("failed to insert raw event: {err}");
        }

        let check = must(store.projector_check());
        assert!(!check.healthy);
        assert_eq!(check.status.lag_events, 1);
        assert_eq!(check.stale_report_sample.len(), 1);
        assert_eq!(check.stale_report_sample[0].report_id, report_id);

        let replay = must(store.replay(Some(2)));
        assert_eq!(replay.projected_reports, 1);
        assert!(must(store.projector_check()).healthy);
        assert_eq!(must_lifecycle(&store, report_id).negative_count, 1);
    }

    #[test]
    fn invalid_ruleset_json_is_reported_clearly() {
        let store = fixture_store();
        let inserted = store.connection().execute(
            "INSERT INTO lifecycle_rulesets(ruleset_version, ruleset_json, created_at)
             VALUES (?1, ?2, ?3)",
            params![99_i64, "not-json", "2026-02-07T00:00:00Z"],
        );
        if let Err(err) = inserted {
            panic!("failed to insert invalid ruleset fixture: {err}");
        }

        let err = match store.get_rulesets() {
            Ok(_) => panic!("expected get_rulesets failure on invalid ruleset JSON"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("invalid stored ruleset JSON"));
    }

    #[test]
    fn negative_stored_counter_is_rejected() {
        let mut store = fixture_store();
        let report_id = seed_report(&mut store);

        let forced = store.connection().execute_batch(
            "PRAGMA ignore_check_constraints = ON;",
        );
        if let Err(err) = forced {
            panic!("failed to relax check constraints: {err}");
        }
        let updated = store.connection().execute(
            "UPDATE report_lifecycle SET positive_count = -1 WHERE report_id = ?1",
            params![report_id.to_string()],
        );
        if let Err(err) = updated {
            panic!("failed to corrupt counter: {err}");
        }

        assert!(store.get_lifecycle(report_id, None).is_err());
    }

    #[test]
    fn schema_contract_contains_expected_tables_and_triggers() {
        let store = fixture_store();
        for table in [
            "reports",
            "feedback_events",
            "report_lifecycle",
            "lifecycle_transitions",
            "lifecycle_rulesets",
            "lifecycle_projection_state",
        ] {
            assert!(must(table_exists(store.connection(), table)), "missing {table}");
        }

        must(ensure_table_has_columns(
            store.connection(),
            "report_lifecycle",
            &[
                "status",
                "positive_count",
                "negative_count",
                "negative_window_json",
                "positive_sustained_since",
                "balanced_sustained_since",
                "condition_met_at",
                "expiring_at",
                "revision",
            ],
        ));

        let trigger_count = match store.connection().query_row(
            "SELECT COUNT(*) FROM sqlite_master
             WHERE type='trigger'
               AND name IN ('trg_feedback_events_no_update', 'trg_feedback_events_no_delete')",
            [],
            |row| row.get::<_, i64>(0),
        ) {
            Ok(value) => value,
            Err(err) => panic!("failed to query trigger contract: {err}"),
        };
        assert_eq!(trigger_count, 2);
    }

    #[test]
    fn migrate_rejects_incompatible_reports_table() {
        let store = must(SqliteLifecycleStore::open(Path::new(":memory:")));
        if let Err(err) = store
            .connection()
            .execute_batch("CREATE TABLE reports (report_id TEXT PRIMARY KEY);")
        {
            panic!("failed to create legacy table: {err}");
        }

        let err = match store.migrate() {
            Ok(()) => panic!("expected compatibility failure"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("missing column"));
    }

    #[test]
    fn migration_is_idempotent_and_preserves_existing_data() {
        let mut store = fixture_store();
        let report_id = seed_report(&mut store);
        must(store.submit_feedback(&feedback(report_id, FeedbackKind::Negative, "v1", t0())));
        let before = must_lifecycle(&store, report_id);

        must(store.migrate());
        let after = must_lifecycle(&store, report_id);
        assert_eq!(before, after);
        assert_eq!(must(store.get_rulesets()).len(), 1);
    }

    #[test]
    fn sqlite_busy_timeout_allows_feedback_after_lock_release() {
        let db_path =
            std::env::temp_dir().join(format!("fillin-lock-test-{}.sqlite3", Ulid::new()));

        let mut setup_store = must(SqliteLifecycleStore::open(&db_path));
        must(setup_store.migrate());
        let report_id = seed_report(&mut setup_store);
        drop(setup_store);

        let lock_conn = match Connection::open(&db_path) {
            Ok(value) => value,
            Err(err) => panic!("failed to open lock connection: {err}"),
        };
        if let Err(err) = lock_conn.execute_batch("BEGIN IMMEDIATE;") {
            panic!("failed to acquire write lock: {err}");
        }

        let submit_path = db_path.clone();
        let submit_handle = std::thread::spawn(move || {
            let mut submit_store = match SqliteLifecycleStore::open(&submit_path) {
                Ok(value) => value,
                Err(err) => panic!("failed to open submit store: {err}"),
            };
            submit_store.submit_feedback(&feedback(
                report_id,
                FeedbackKind::Positive,
                "v1",
                t0(),
            ))
        });

        std::thread::sleep(std::time::Duration::from_millis(150));
        if let Err(err) = lock_conn.execute_batch("COMMIT;") {
            panic!("failed to release write lock: {err}");
        }

        let submit_result = match submit_handle.join() {
            Ok(result) => result,
            Err(err) => panic!("submit thread join failed: {err:?}"),
        };
        assert!(
            submit_result.is_ok(),
            "submit should succeed after lock release: {:?}",
            submit_result.err()
        );

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn concurrent_submissions_for_one_report_are_serialized() {
        let db_path =
            std::env::temp_dir().join(format!("fillin-serial-test-{}.sqlite3", Ulid::new()));

        let mut setup_store = must(SqliteLifecycleStore::open(&db_path));
        must(setup_store.migrate());
        let report_id = seed_report(&mut setup_store);
        drop(setup_store);

        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let path = db_path.clone();
                std::thread::spawn(move || -> Result<()> {
                    let mut store = SqliteLifecycleStore::open(&path)?;
                    for index in 0..5 {
                        let occurred_at = from_unix_millis(4_102_444_800_000)
                            .map_err(|err| anyhow!(err.to_string()))?;
                        store.submit_feedback(&feedback(
                            report_id,
                            FeedbackKind::Positive,
                            &format!("voter-{worker}-{index}"),
                            occurred_at,
                        ))?;
                    }
                    Ok(())
                })
            })
            .collect();

        for handle in handles {
            match handle.join() {
                Ok(result) => must(result),
                Err(err) => panic!("worker join failed: {err:?}"),
            }
        }

        let store = must(SqliteLifecycleStore::open(&db_path));
        let lifecycle = must_lifecycle(&store, report_id);
        assert_eq!(lifecycle.positive_count, 20);
        assert!(must(store.projector_check()).healthy);

        let _ = std::fs::remove_file(&db_path);
    }

    fn kind_from_flag(positive: bool) -> FeedbackKind {
        if positive {
            FeedbackKind::Positive
        } else {
            FeedbackKind::Negative
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_incremental_submission_matches_replay(
            stream in prop::collection::vec((any::<bool>(), 0i64..72), 1..40)
        ) {
            let mut store = fixture_store();
            let report_id = seed_report(&mut store);

            let mut at = t0();
            let mut split_seq = None;
            for (index, (positive, gap_hours)) in stream.iter().copied().enumerate() {
                at += Duration::hours(gap_hours);
                let result = store.submit_feedback(&feedback(
                    report_id,
                    kind_from_flag(positive),
                    &format!("voter-{index}"),
                    at,
                ));
                match result {
                    Ok(receipt) => {
                        if index == stream.len() / 2 {
                            split_seq = Some(receipt.event.event_seq);
                        }
                    }
                    Err(err) => {
                        prop_assert!(err.to_string().contains("expired"));
                        break;
                    }
                }
            }

            let inline = must_lifecycle(&store, report_id);
            let _ = must(store.replay(split_seq));
            let partial = must_lifecycle(&store, report_id);
            let _ = must(store.replay(None));
            let full = must_lifecycle(&store, report_id);

            prop_assert_eq!(&inline, &partial);
            prop_assert_eq!(&inline, &full);
        }
    }
}
