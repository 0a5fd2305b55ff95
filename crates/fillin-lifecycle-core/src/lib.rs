use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{Duration, OffsetDateTime, UtcOffset};
use ulid::Ulid;

/// Fixed-point scale for ratio thresholds (`1_000_000 = 1.0`).
pub const RATIO_SCALE: u32 = 1_000_000;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LifecycleError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("projection error: {0}")]
    Projection(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ReportId(pub Ulid);

impl ReportId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Parses a report id from its ULID text form.
    ///
    /// # Errors
    /// Returns [`LifecycleError::Validation`] when `raw` is not a ULID.
    pub fn parse(raw: &str) -> Result<Self, LifecycleError> {
        Ulid::from_string(raw)
            .map(Self)
            .map_err(|err| LifecycleError::Validation(format!("invalid report_id {raw}: {err}")))
    }
}

impl Display for ReportId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReportCategory {
    Danger,
    Inconvenience,
    Discovery,
}

impl ReportCategory {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Danger => "danger",
            Self::Inconvenience => "inconvenience",
            Self::Discovery => "discovery",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "danger" => Some(Self::Danger),
            "inconvenience" => Some(Self::Inconvenience),
            "discovery" => Some(Self::Discovery),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Active,
    Expiring,
    Expired,
}

impl ReportStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Expiring => "expiring",
            Self::Expired => "expired",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "expiring" => Some(Self::Expiring),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Expired)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackKind {
    Positive,
    Negative,
}

impl FeedbackKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Positive => "positive",
            Self::Negative => "negative",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "positive" => Some(Self::Positive),
            "negative" => Some(Self::Negative),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    ExpiryConditionSustained,
    ExpiryConditionCleared,
    GracePeriodElapsed,
}

impl TransitionReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExpiryConditionSustained => "expiry_condition_sustained",
            Self::ExpiryConditionCleared => "expiry_condition_cleared",
            Self::GracePeriodElapsed => "grace_period_elapsed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "expiry_condition_sustained" => Some(Self::ExpiryConditionSustained),
            "expiry_condition_cleared" => Some(Self::ExpiryConditionCleared),
            "grace_period_elapsed" => Some(Self::GracePeriodElapsed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportRecord {
    pub report_id: ReportId,
    pub category: ReportCategory,
    pub title: String,
    pub latitude: f64,
    pub longitude: f64,
    pub submitted_by: String,
    pub created_at: OffsetDateTime,
    pub view_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportInput {
    pub report_id: Option<ReportId>,
    pub category: ReportCategory,
    pub title: String,
    pub latitude: f64,
    pub longitude: f64,
    pub submitted_by: String,
    pub created_at: OffsetDateTime,
}

impl ReportInput {
    /// Validates a report submission before it is registered.
    ///
    /// # Errors
    /// Returns [`LifecycleError::Validation`] when the title or submitter is
    /// blank, the coordinates are out of range, or `created_at` is not UTC.
    pub fn validate(&self) -> Result<(), LifecycleError> {
        if self.title.trim().is_empty() {
            return Err(LifecycleError::Validation(
                "title MUST be provided".to_string(),
            ));
        }

        if self.submitted_by.trim().is_empty() {
            return Err(LifecycleError::Validation(
                "submitted_by MUST be provided".to_string(),
            ));
        }

        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(LifecycleError::Validation(
                "latitude MUST be in [-90, 90]".to_string(),
            ));
        }

        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(LifecycleError::Validation(
                "longitude MUST be in [-180, 180]".to_string(),
            ));
        }

        if self.created_at.offset() != UtcOffset::UTC {
            return Err(LifecycleError::Validation(
                "created_at MUST be UTC (offset Z)".to_string(),
            ));
        }

        Ok(())
    }

    #[must_use]
    pub fn into_record(self) -> ReportRecord {
        ReportRecord {
            report_id: self.report_id.unwrap_or_else(ReportId::generate),
            category: self.category,
            title: self.title,
            latitude: self.latitude,
            longitude: self.longitude,
            submitted_by: self.submitted_by,
            created_at: self.created_at,
            view_count: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeedbackEvent {
    pub event_seq: i64,
    pub event_id: Ulid,
    pub ruleset_version: u32,
    pub report_id: ReportId,
    pub kind: FeedbackKind,
    pub occurred_at: OffsetDateTime,
    pub recorded_at: OffsetDateTime,
    pub voter_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeedbackEventInput {
    pub event_id: Option<Ulid>,
    pub ruleset_version: u32,
    pub report_id: ReportId,
    pub kind: FeedbackKind,
    pub occurred_at: OffsetDateTime,
    pub voter_id: String,
}

impl FeedbackEventInput {
    /// Validates a feedback submission before append.
    ///
    /// # Errors
    /// Returns [`LifecycleError::Validation`] when required fields are missing
    /// or violate schema constraints.
    pub fn validate(&self) -> Result<(), LifecycleError> {
        if self.ruleset_version == 0 {
            return Err(LifecycleError::Validation(
                "ruleset_version MUST be >= 1".to_string(),
            ));
        }

        if self.voter_id.trim().is_empty() {
            return Err(LifecycleError::Validation(
                "voter_id MUST be provided for every feedback event".to_string(),
            ));
        }

        if self.occurred_at.offset() != UtcOffset::UTC {
            return Err(LifecycleError::Validation(
                "occurred_at MUST be UTC (offset Z)".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LifecycleRuleset {
    pub ruleset_version: u32,
    pub positive_sustain_min: u32,
    pub balanced_band_min: u32,
    pub balanced_band_max: u32,
    pub expiry_positive_max: u32,
    pub expiry_negative_min: u32,
    pub negative_window_days: u32,
    pub expiry_sustain_days: u32,
    pub expiring_grace_days: u32,
    pub allow_expiring_recovery: bool,
    pub one_vote_per_voter: bool,
}

impl LifecycleRuleset {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            ruleset_version: 1,
            positive_sustain_min: 700_000,
            balanced_band_min: 400_000,
            balanced_band_max: 600_000,
            expiry_positive_max: 300_000,
            expiry_negative_min: 700_000,
            negative_window_days: 7,
            expiry_sustain_days: 7,
            expiring_grace_days: 3,
            allow_expiring_recovery: true,
            one_vote_per_voter: true,
        }
    }

    /// Validates ruleset thresholds and window lengths.
    ///
    /// # Errors
    /// Returns [`LifecycleError::Configuration`] when one or more
    /// ruleset fields are outside allowed bounds.
    pub fn validate(&self) -> Result<(), LifecycleError> {
        if self.ruleset_version == 0 {
            return Err(LifecycleError::Configuration(
                "ruleset_version MUST be >= 1".to_string(),
            ));
        }

        for (name, value) in [
            ("positive_sustain_min", self.positive_sustain_min),
            ("balanced_band_min", self.balanced_band_min),
            ("balanced_band_max", self.balanced_band_max),
            ("expiry_positive_max", self.expiry_positive_max),
            ("expiry_negative_min", self.expiry_negative_min),
        ] {
            if value > RATIO_SCALE {
                return Err(LifecycleError::Configuration(format!(
                    "{name} MUST be in [0, {RATIO_SCALE}] millionths"
                )));
            }
        }

        if self.balanced_band_min > self.balanced_band_max {
            return Err(LifecycleError::Configuration(
                "balanced_band_min cannot exceed balanced_band_max".to_string(),
            ));
        }

        for (name, value) in [
            ("negative_window_days", self.negative_window_days),
            ("expiry_sustain_days", self.expiry_sustain_days),
            ("expiring_grace_days", self.expiring_grace_days),
        ] {
            if value == 0 {
                return Err(LifecycleError::Configuration(format!("{name} MUST be >= 1")));
            }
        }

        Ok(())
    }

    /// Decodes and validates a ruleset from JSON.
    ///
    /// # Errors
    /// Returns [`LifecycleError::Configuration`] when JSON decoding fails
    /// or decoded values violate ruleset constraints.
    pub fn from_json(value: &Value) -> Result<Self, LifecycleError> {
        let ruleset: Self = serde_json::from_value(value.clone()).map_err(|err| {
            LifecycleError::Configuration(format!("invalid ruleset JSON payload: {err}"))
        })?;
        ruleset.validate()?;
        Ok(ruleset)
    }

    #[must_use]
    pub fn negative_window(&self) -> Duration {
        Duration::days(i64::from(self.negative_window_days))
    }

    #[must_use]
    pub fn expiry_sustain(&self) -> Duration {
        Duration::days(i64::from(self.expiry_sustain_days))
    }

    #[must_use]
    pub fn expiring_grace(&self) -> Duration {
        Duration::days(i64::from(self.expiring_grace_days))
    }

    #[must_use]
    pub fn read_bands(&self, ratio: FeedbackRatio) -> BandReading {
        BandReading {
            positive_sustained: ratio.positive_at_least(self.positive_sustain_min),
            balanced: ratio.positive_at_least(self.balanced_band_min)
                && ratio.positive_at_most(self.balanced_band_max),
            expiry_condition: ratio.positive_at_most(self.expiry_positive_max)
                || ratio.negative_at_least(self.expiry_negative_min),
        }
    }
}

/// Positive/negative tallies with exact threshold comparisons.
///
/// An empty tally has no defined ratio and meets no threshold.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct FeedbackRatio {
    pub positive: u64,
    pub negative: u64,
}

impl FeedbackRatio {
    #[must_use]
    pub fn total(self) -> u128 {
        u128::from(self.positive) + u128::from(self.negative)
    }

    #[must_use]
    pub fn positive_millionths(self) -> Option<u32> {
        let total = self.total();
        if total == 0 {
            return None;
        }
        let scaled = u128::from(self.positive) * u128::from(RATIO_SCALE) / total;
        Some(u32::try_from(scaled).unwrap_or(RATIO_SCALE))
    }

    #[must_use]
    pub fn positive_at_least(self, threshold: u32) -> bool {
        let total = self.total();
        total > 0
            && u128::from(self.positive) * u128::from(RATIO_SCALE)
                >= u128::from(threshold) * total
    }

    #[must_use]
    pub fn positive_at_most(self, threshold: u32) -> bool {
        let total = self.total();
        total > 0
            && u128::from(self.positive) * u128::from(RATIO_SCALE)
                <= u128::from(threshold) * total
    }

    #[must_use]
    pub fn negative_at_least(self, threshold: u32) -> bool {
        let total = self.total();
        total > 0
            && u128::from(self.negative) * u128::from(RATIO_SCALE)
                >= u128::from(threshold) * total
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct BandReading {
    pub positive_sustained: bool,
    pub balanced: bool,
    pub expiry_condition: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LifecycleTransition {
    pub from: ReportStatus,
    pub to: ReportStatus,
    pub at: OffsetDateTime,
    /// `None` when the transition was derived from a clock evaluation
    /// rather than a feedback event.
    pub event_seq: Option<i64>,
    pub reason: TransitionReason,
}

/// Projected lifecycle state of one report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReportLifecycle {
    pub report_id: ReportId,
    pub category: ReportCategory,
    pub status: ReportStatus,
    pub created_at: OffsetDateTime,
    pub positive_count: u64,
    pub negative_count: u64,
    pub negative_window: Vec<OffsetDateTime>,
    pub positive_sustained_since: Option<OffsetDateTime>,
    pub balanced_sustained_since: Option<OffsetDateTime>,
    pub condition_met_at: Option<OffsetDateTime>,
    pub expiring_at: Option<OffsetDateTime>,
    pub expired_at: Option<OffsetDateTime>,
    pub last_event_seq: i64,
    pub last_event_at: Option<OffsetDateTime>,
    pub last_ruleset_version: Option<u32>,
    pub transitions: Vec<LifecycleTransition>,
}

impl ReportLifecycle {
    #[must_use]
    pub fn initial(report: &ReportRecord) -> Self {
        Self {
            report_id: report.report_id,
            category: report.category,
            status: ReportStatus::Active,
            created_at: report.created_at,
            positive_count: 0,
            negative_count: 0,
            negative_window: Vec::new(),
            positive_sustained_since: None,
            balanced_sustained_since: None,
            condition_met_at: None,
            expiring_at: None,
            expired_at: None,
            last_event_seq: 0,
            last_event_at: None,
            last_ruleset_version: None,
            transitions: Vec::new(),
        }
    }

    #[must_use]
    pub fn ratio(&self) -> FeedbackRatio {
        FeedbackRatio {
            positive: self.positive_count,
            negative: self.negative_count,
        }
    }

    /// Checks the snapshot for internal consistency.
    ///
    /// # Errors
    /// Returns [`LifecycleError::Validation`] when the window, markers, or
    /// status fields contradict each other.
    pub fn validate(&self) -> Result<(), LifecycleError> {
        if self.created_at.offset() != UtcOffset::UTC {
            return Err(LifecycleError::Validation(
                "created_at MUST be UTC (offset Z)".to_string(),
            ));
        }

        if self.last_event_seq < 0 {
            return Err(LifecycleError::Validation(
                "last_event_seq MUST be >= 0".to_string(),
            ));
        }

        let window_len = u64::try_from(self.negative_window.len()).unwrap_or(u64::MAX);
        if window_len > self.negative_count {
            return Err(LifecycleError::Validation(
                "negative_window cannot hold more entries than negative_count".to_string(),
            ));
        }

        if self.negative_window.windows(2).any(|pair| pair[0] > pair[1]) {
            return Err(LifecycleError::Validation(
                "negative_window MUST be ordered by time".to_string(),
            ));
        }

        for (name, marker) in [
            ("positive_sustained_since", self.positive_sustained_since),
            ("balanced_sustained_since", self.balanced_sustained_since),
            ("condition_met_at", self.condition_met_at),
            ("expiring_at", self.expiring_at),
            ("expired_at", self.expired_at),
            ("last_event_at", self.last_event_at),
        ] {
            if marker.is_some_and(|at| at < self.created_at) {
                return Err(LifecycleError::Validation(format!(
                    "{name} cannot precede report creation"
                )));
            }
        }

        let consistent = match self.status {
            ReportStatus::Active => self.expiring_at.is_none() && self.expired_at.is_none(),
            ReportStatus::Expiring => self.expiring_at.is_some() && self.expired_at.is_none(),
            ReportStatus::Expired => self.expired_at.is_some(),
        };
        if !consistent {
            return Err(LifecycleError::Validation(format!(
                "status {} is inconsistent with expiring_at/expired_at markers",
                self.status.as_str()
            )));
        }

        Ok(())
    }
}

/// Applies one feedback event to a lifecycle snapshot and returns the next
/// snapshot. The input snapshot is never modified.
///
/// # Errors
/// Returns [`LifecycleError::Validation`] when the snapshot is malformed or
/// the event targets another report, precedes report creation, arrives out
/// of order, or reuses an event sequence; and
/// [`LifecycleError::Configuration`] when the ruleset is invalid or does
/// not match the event's ruleset version.
pub fn apply_feedback(
    lifecycle: &ReportLifecycle,
    event: &FeedbackEvent,
    ruleset: &LifecycleRuleset,
) -> Result<ReportLifecycle, LifecycleError> {
    lifecycle.validate()?;
    ruleset.validate()?;

    if event.report_id != lifecycle.report_id {
        return Err(LifecycleError::Validation(format!(
            "event {} targets report {} but snapshot is for {}",
            event.event_id, event.report_id, lifecycle.report_id
        )));
    }

    if event.ruleset_version != ruleset.ruleset_version {
        return Err(LifecycleError::Configuration(format!(
            "event recorded under ruleset {} but ruleset {} was supplied",
            event.ruleset_version, ruleset.ruleset_version
        )));
    }

    if event.occurred_at.offset() != UtcOffset::UTC {
        return Err(LifecycleError::Validation(
            "occurred_at MUST be UTC (offset Z)".to_string(),
        ));
    }

    if event.event_seq <= lifecycle.last_event_seq {
        return Err(LifecycleError::Validation(
            "event_seq MUST be strictly increasing".to_string(),
        ));
    }

    if event.occurred_at < lifecycle.created_at {
        return Err(LifecycleError::Validation(
            "feedback cannot precede report creation".to_string(),
        ));
    }

    if lifecycle
        .last_event_at
        .is_some_and(|last| event.occurred_at < last)
    {
        return Err(LifecycleError::Validation(
            "feedback occurred_at is earlier than the last applied event".to_string(),
        ));
    }

    if lifecycle.status.is_terminal() {
        tracing::debug!(
            report_id = %lifecycle.report_id,
            event_seq = event.event_seq,
            "ignoring feedback for expired report"
        );
        return Ok(lifecycle.clone());
    }

    let now = event.occurred_at;
    let mut next = lifecycle.clone();

    match event.kind {
        FeedbackKind::Positive => {
            next.positive_count = next.positive_count.checked_add(1).ok_or_else(|| {
                LifecycleError::Validation("positive_count overflow".to_string())
            })?;
        }
        FeedbackKind::Negative => {
            next.negative_count = next.negative_count.checked_add(1).ok_or_else(|| {
                LifecycleError::Validation("negative_count overflow".to_string())
            })?;
            next.negative_window.push(now);
        }
    }
    prune_window(&mut next.negative_window, now, ruleset.negative_window());

    next.last_event_seq = event.event_seq;
    next.last_event_at = Some(now);
    next.last_ruleset_version = Some(event.ruleset_version);

    let bands = ruleset.read_bands(next.ratio());
    track_marker(&mut next.positive_sustained_since, bands.positive_sustained, now);
    track_marker(&mut next.balanced_sustained_since, bands.balanced, now);
    track_marker(&mut next.condition_met_at, bands.expiry_condition, now);

    advance_status(
        &mut next,
        bands.expiry_condition,
        now,
        Evaluation::Event(event.event_seq),
        ruleset,
    );

    Ok(next)
}

/// Replays a report's feedback events into a lifecycle snapshot.
///
/// # Errors
/// Returns [`LifecycleError::Projection`] for invalid event streams
/// (including duplicate voters when the ruleset enforces one vote per
/// voter) and [`LifecycleError::Configuration`] when referenced rulesets
/// are missing or invalid.
pub fn project_report_lifecycle(
    report: &ReportRecord,
    events: &[FeedbackEvent],
    rulesets: &BTreeMap<u32, LifecycleRuleset>,
) -> Result<ReportLifecycle, LifecycleError> {
    let mut lifecycle = ReportLifecycle::initial(report);
    let mut voters = BTreeSet::new();

    for event in events {
        let ruleset = ruleset_for(event.ruleset_version, rulesets)?;

        let first_vote = voters.insert(event.voter_id.as_str());
        if ruleset.one_vote_per_voter && !first_vote {
            return Err(LifecycleError::Projection(format!(
                "duplicate feedback from voter {} on report {}",
                event.voter_id, event.report_id
            )));
        }

        lifecycle = apply_feedback(&lifecycle, event, ruleset).map_err(|err| match err {
            LifecycleError::Validation(message) => LifecycleError::Projection(message),
            other => other,
        })?;
    }

    Ok(lifecycle)
}

/// Evaluates the time-driven transitions of a snapshot at `as_of` without
/// a new feedback event. Read-side only; the result is never persisted.
///
/// Transitions are stamped at the instant they became due, not at `as_of`,
/// so evaluating once at a late `as_of` matches evaluating through any
/// sequence of earlier query times.
#[must_use]
pub fn lifecycle_as_of(
    lifecycle: &ReportLifecycle,
    ruleset: &LifecycleRuleset,
    as_of: OffsetDateTime,
) -> ReportLifecycle {
    if lifecycle.status.is_terminal() {
        return lifecycle.clone();
    }

    let reference = lifecycle.last_event_at.unwrap_or(lifecycle.created_at);
    if as_of <= reference {
        return lifecycle.clone();
    }

    let mut view = lifecycle.clone();
    prune_window(&mut view.negative_window, as_of, ruleset.negative_window());
    let condition = view.condition_met_at.is_some();
    advance_status(&mut view, condition, as_of, Evaluation::Clock, ruleset);
    view
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MapDecision {
    pub report_id: ReportId,
    pub category: ReportCategory,
    pub visible: bool,
    pub status: ReportStatus,
    pub positive_millionths: Option<u32>,
    pub reason_codes: Vec<String>,
}

#[must_use]
pub fn map_visibility(
    lifecycle: &ReportLifecycle,
    ruleset: &LifecycleRuleset,
    as_of: OffsetDateTime,
) -> MapDecision {
    let view = lifecycle_as_of(lifecycle, ruleset, as_of);
    let mut reason_codes = Vec::new();

    let visible = match view.status {
        ReportStatus::Expired => {
            reason_codes.push("excluded.expired".to_string());
            false
        }
        ReportStatus::Expiring => {
            reason_codes.push("included.expiring".to_string());
            true
        }
        ReportStatus::Active => {
            if view.ratio().total() == 0 {
                reason_codes.push("included.active.no_feedback".to_string());
            } else if view.positive_sustained_since.is_some() {
                reason_codes.push("included.active.well_received".to_string());
            } else if view.balanced_sustained_since.is_some() {
                reason_codes.push("included.active.contested".to_string());
            } else if view.condition_met_at.is_some() {
                reason_codes.push("included.active.expiry_pending".to_string());
            } else {
                reason_codes.push("included.active".to_string());
            }
            true
        }
    };

    MapDecision {
        report_id: view.report_id,
        category: view.category,
        visible,
        status: view.status,
        positive_millionths: view.ratio().positive_millionths(),
        reason_codes,
    }
}

fn ruleset_for(
    version: u32,
    rulesets: &BTreeMap<u32, LifecycleRuleset>,
) -> Result<&LifecycleRuleset, LifecycleError> {
    let ruleset = rulesets.get(&version).ok_or_else(|| {
        LifecycleError::Configuration(format!(
            "missing ruleset configuration for version {version}"
        ))
    })?;
    ruleset.validate()?;
    Ok(ruleset)
}

fn track_marker(marker: &mut Option<OffsetDateTime>, holds: bool, now: OffsetDateTime) {
    if !holds {
        *marker = None;
    } else if marker.is_none() {
        *marker = Some(now);
    }
}

fn prune_window(window: &mut Vec<OffsetDateTime>, now: OffsetDateTime, length: Duration) {
    window.retain(|at| now - *at <= length);
}

/// What drives a status evaluation: a feedback event (transitions happen
/// at the event time) or the clock alone (transitions happen when due).
#[derive(Debug, Clone, Copy)]
enum Evaluation {
    Event(i64),
    Clock,
}

impl Evaluation {
    fn event_seq(self) -> Option<i64> {
        match self {
            Self::Event(seq) => Some(seq),
            Self::Clock => None,
        }
    }

    fn stamp(self, now: OffsetDateTime, due: OffsetDateTime) -> OffsetDateTime {
        match self {
            Self::Event(_) => now,
            Self::Clock => due,
        }
    }
}

fn advance_status(
    lifecycle: &mut ReportLifecycle,
    condition_holds: bool,
    now: OffsetDateTime,
    evaluation: Evaluation,
    ruleset: &LifecycleRuleset,
) {
    let event_seq = evaluation.event_seq();

    if lifecycle.status == ReportStatus::Active {
        if let Some(met) = lifecycle.condition_met_at {
            if now - met >= ruleset.expiry_sustain() {
                let at = evaluation.stamp(now, met + ruleset.expiry_sustain());
                record_transition(
                    lifecycle,
                    ReportStatus::Expiring,
                    at,
                    event_seq,
                    TransitionReason::ExpiryConditionSustained,
                );
                lifecycle.expiring_at = Some(at);
            }
        }
    }

    // Only a feedback event can clear the expiry condition.
    let allow_recovery =
        matches!(evaluation, Evaluation::Event(_)) && ruleset.allow_expiring_recovery;
    if lifecycle.status == ReportStatus::Expiring && !condition_holds && allow_recovery {
        record_transition(
            lifecycle,
            ReportStatus::Active,
            now,
            event_seq,
            TransitionReason::ExpiryConditionCleared,
        );
        lifecycle.expiring_at = None;
    }

    if lifecycle.status == ReportStatus::Expiring && condition_holds {
        if let Some(since) = lifecycle.expiring_at {
            if now - since >= ruleset.expiring_grace() {
                let at = evaluation.stamp(now, since + ruleset.expiring_grace());
                record_transition(
                    lifecycle,
                    ReportStatus::Expired,
                    at,
                    event_seq,
                    TransitionReason::GracePeriodElapsed,
                );
                lifecycle.expired_at = Some(at);
            }
        }
    }
}

fn record_transition(
    lifecycle: &mut ReportLifecycle,
    to: ReportStatus,
    at: OffsetDateTime,
    event_seq: Option<i64>,
    reason: TransitionReason,
) {
    tracing::info!(
        report_id = %lifecycle.report_id,
        from = lifecycle.status.as_str(),
        to = to.as_str(),
        reason = reason.as_str(),
        "report lifecycle transition"
    );
    lifecycle.transitions.push(LifecycleTransition {
        from: lifecycle.status,
        to,
        at,
        event_seq,
        reason,
    });
    lifecycle.status = to;
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`LifecycleError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, LifecycleError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| LifecycleError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(LifecycleError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`LifecycleError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, LifecycleError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            LifecycleError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

/// Converts milliseconds since the Unix epoch into a UTC timestamp.
///
/// # Errors
/// Returns [`LifecycleError::Validation`] when the value is out of range.
pub fn from_unix_millis(millis: i64) -> Result<OffsetDateTime, LifecycleError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .map_err(|err| LifecycleError::Validation(format!("invalid epoch millis {millis}: {err}")))
}

#[must_use]
pub fn unix_millis(value: OffsetDateTime) -> i64 {
    let millis = value.unix_timestamp_nanos() / 1_000_000;
    i64::try_from(millis).unwrap_or(if millis < 0 { i64::MIN } else { i64::MAX })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
