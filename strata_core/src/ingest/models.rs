use crate::connectors::sql::validate_read_only;
use crate::error::AUTH_ERROR_CODE;
use crate::models::{DataSourceId, JobRunId, OrgId};
use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Discriminator for the configured source kind.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Sql,
    CsvUpload,
    GoogleSheets,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Sql => "sql",
            SourceKind::CsvUpload => "csv_upload",
            SourceKind::GoogleSheets => "google_sheets",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "sql" => Some(SourceKind::Sql),
            "csv_upload" => Some(SourceKind::CsvUpload),
            "google_sheets" => Some(SourceKind::GoogleSheets),
            _ => None,
        }
    }

    /// Uploads need a human to supply the file, so they never recur.
    pub fn supports_recurring(&self) -> bool {
        !matches!(self, SourceKind::CsvUpload)
    }

    /// Human-authored spreadsheets get the looser header matching rules.
    pub fn is_spreadsheet(&self) -> bool {
        matches!(self, SourceKind::CsvUpload | SourceKind::GoogleSheets)
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileFormat {
    #[default]
    Csv,
    Xlsx,
}

impl FileFormat {
    /// Guess from a file name; anything that is not a workbook is read as delimited text.
    pub fn from_path(path: &std::path::Path) -> Self {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("xlsx") | Some("xlsm") | Some("xls") | Some("ods") => FileFormat::Xlsx,
            _ => FileFormat::Csv,
        }
    }
}

/// Kind-specific source configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    Sql {
        connection_url: String,
        query: String,
        #[serde(default)]
        creditor_code: Option<String>,
    },
    CsvUpload {
        /// Stored file handle; uploads may also hand bytes over directly.
        #[serde(default)]
        path: Option<String>,
        #[serde(default)]
        format: FileFormat,
        #[serde(default)]
        delimiter: Option<char>,
        #[serde(default)]
        creditor_code: Option<String>,
    },
    GoogleSheets {
        spreadsheet_id: String,
        range: String,
        #[serde(default)]
        creditor_code: Option<String>,
    },
}

impl SourceConfig {
    pub fn kind(&self) -> SourceKind {
        match self {
            SourceConfig::Sql { .. } => SourceKind::Sql,
            SourceConfig::CsvUpload { .. } => SourceKind::CsvUpload,
            SourceConfig::GoogleSheets { .. } => SourceKind::GoogleSheets,
        }
    }

    /// Creditor code applied to every fact curated from this source, if configured.
    pub fn creditor_code(&self) -> Option<&str> {
        match self {
            SourceConfig::Sql { creditor_code, .. }
            | SourceConfig::CsvUpload { creditor_code, .. }
            | SourceConfig::GoogleSheets { creditor_code, .. } => creditor_code
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty()),
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub fn validate(&self) -> Result<()> {
        match self {
            SourceConfig::Sql {
                connection_url,
                query,
                ..
            } => {
                if connection_url.trim().is_empty() {
                    return Err(Error::InvalidInput("sql connection_url is empty".to_string()));
                }
                validate_read_only(query)?;
            }
            SourceConfig::CsvUpload { delimiter, .. } => {
                if let Some(d) = delimiter {
                    if !d.is_ascii() || d.is_ascii_alphanumeric() || *d == '"' {
                        return Err(Error::InvalidInput(format!(
                            "unsupported csv delimiter {d:?}"
                        )));
                    }
                }
            }
            SourceConfig::GoogleSheets {
                spreadsheet_id,
                range,
                ..
            } => {
                if spreadsheet_id.trim().is_empty() {
                    return Err(Error::InvalidInput("spreadsheet_id is empty".to_string()));
                }
                if range.trim().is_empty() {
                    return Err(Error::InvalidInput("spreadsheet range is empty".to_string()));
                }
            }
        }
        Ok(())
    }
}

/// A configured ingestion origin owned by one organization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSource {
    pub id: DataSourceId,
    pub organization_id: OrgId,
    pub name: String,
    pub config: SourceConfig,
    pub is_recurring: bool,
    /// Falls back to the scheduler default when unset.
    #[serde(default)]
    pub interval_minutes: Option<u32>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of the discovery predicate for one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DueDecision {
    /// Kind or configuration has no recurring semantics.
    NotRecurring,
    Disabled,
    /// A pending or running run exists and has not exceeded the lease.
    Active(JobRunId),
    NotYetDue { next_due_at: DateTime<Utc> },
    Due,
    /// The previous run holds an expired lease and must be failed first.
    DueAfterStaleLease(JobRunId),
    /// The last run failed on credentials and the source has not been
    /// reconfigured since. Only a manual trigger clears it.
    BlockedOnAuth(JobRunId),
}

impl DueDecision {
    pub fn should_dispatch(&self) -> bool {
        matches!(self, DueDecision::Due | DueDecision::DueAfterStaleLease(_))
    }
}

impl DataSource {
    #[tracing::instrument(level = "debug", skip(config))]
    pub fn new(
        organization_id: OrgId,
        name: impl Into<String> + fmt::Debug,
        config: SourceConfig,
        is_recurring: bool,
        interval_minutes: Option<u32>,
        now: Option<DateTime<Utc>>,
    ) -> Result<Self> {
        let now = now.unwrap_or_else(Utc::now);
        let source = Self {
            id: DataSourceId::new(),
            organization_id,
            name: name.into(),
            config,
            is_recurring,
            interval_minutes,
            enabled: true,
            created_at: now,
            updated_at: now,
        };
        source.validate()?;
        Ok(source)
    }

    pub fn kind(&self) -> SourceKind {
        self.config.kind()
    }

    #[tracing::instrument(level = "debug", skip(self), fields(data_source_id = %self.id))]
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidInput("data source name is empty".to_string()));
        }
        if self.interval_minutes == Some(0) {
            return Err(Error::InvalidInput(
                "interval_minutes must be > 0".to_string(),
            ));
        }
        if self.is_recurring && !self.kind().supports_recurring() {
            return Err(Error::InvalidInput(format!(
                "{} sources cannot be recurring",
                self.kind()
            )));
        }
        self.config.validate()
    }

    pub fn touch(&mut self, at: DateTime<Utc>) {
        self.updated_at = at;
    }

    pub fn interval(&self, default_interval: Duration) -> Duration {
        self.interval_minutes
            .map(|m| Duration::minutes(i64::from(m)))
            .unwrap_or(default_interval)
    }

    /// Total discovery predicate. `last_run` is the most recently created run for this source.
    pub fn due_decision(
        &self,
        now: DateTime<Utc>,
        last_run: Option<&JobRun>,
        default_interval: Duration,
        stale_after: Duration,
    ) -> DueDecision {
        if !self.kind().supports_recurring() || !self.is_recurring {
            return DueDecision::NotRecurring;
        }
        if !self.enabled {
            return DueDecision::Disabled;
        }
        let Some(run) = last_run else {
            return DueDecision::Due;
        };
        if !run.status.is_terminal() {
            return if run.is_stale(now, stale_after) {
                DueDecision::DueAfterStaleLease(run.id)
            } else {
                DueDecision::Active(run.id)
            };
        }
        if run.failed_with(AUTH_ERROR_CODE)
            && self.updated_at <= run.finished_at.unwrap_or(run.created_at)
        {
            return DueDecision::BlockedOnAuth(run.id);
        }
        let next_due_at = run.created_at + self.interval(default_interval);
        if next_due_at <= now {
            DueDecision::Due
        } else {
            DueDecision::NotYetDue { next_due_at }
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobRunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobRunStatus::Pending => "pending",
            JobRunStatus::Running => "running",
            JobRunStatus::Succeeded => "succeeded",
            JobRunStatus::Failed => "failed",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobRunStatus::Pending),
            "running" => Some(JobRunStatus::Running),
            "succeeded" => Some(JobRunStatus::Succeeded),
            "failed" => Some(JobRunStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobRunStatus::Succeeded | JobRunStatus::Failed)
    }

    /// Forward-only lifecycle. `pending -> failed` covers runs whose lease expired
    /// before any worker claimed them.
    pub fn can_transition_to(&self, next: JobRunStatus) -> bool {
        matches!(
            (self, next),
            (JobRunStatus::Pending, JobRunStatus::Running)
                | (JobRunStatus::Pending, JobRunStatus::Failed)
                | (JobRunStatus::Running, JobRunStatus::Succeeded)
                | (JobRunStatus::Running, JobRunStatus::Failed)
        )
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobTrigger {
    Scheduled,
    OnDemand,
    Upload,
}

impl JobTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobTrigger::Scheduled => "scheduled",
            JobTrigger::OnDemand => "on_demand",
            JobTrigger::Upload => "upload",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(JobTrigger::Scheduled),
            "on_demand" => Some(JobTrigger::OnDemand),
            "upload" => Some(JobTrigger::Upload),
            _ => None,
        }
    }
}

/// A staged row the transformer could not curate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedRow {
    /// Zero-based position within the run's staged rows.
    pub row_index: u64,
    pub code: String,
    pub message: String,
}

/// Maximum rejected rows kept on a job run for inspection.
pub const REJECTED_SAMPLE_LIMIT: usize = 20;

/// One auditable execution of a data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    pub id: JobRunId,
    pub data_source_id: DataSourceId,
    pub organization_id: OrgId,
    pub trigger: JobTrigger,
    pub status: JobRunStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub rows_staged: u64,
    pub rows_transformed: u64,
    pub rows_rejected: u64,
    #[serde(default)]
    pub rejected_sample: Vec<RejectedRow>,
    pub error_detail: Option<String>,
}

impl JobRun {
    #[tracing::instrument(level = "debug", skip(source), fields(data_source_id = %source.id))]
    pub fn new_pending(source: &DataSource, trigger: JobTrigger, now: DateTime<Utc>) -> Self {
        Self {
            id: JobRunId::new(),
            data_source_id: source.id,
            organization_id: source.organization_id,
            trigger,
            status: JobRunStatus::Pending,
            created_at: now,
            started_at: None,
            finished_at: None,
            rows_staged: 0,
            rows_transformed: 0,
            rows_rejected: 0,
            rejected_sample: Vec::new(),
            error_detail: None,
        }
    }

    /// Lease start: `started_at` once claimed, dispatch time before that.
    pub fn lease_started_at(&self) -> DateTime<Utc> {
        self.started_at.unwrap_or(self.created_at)
    }

    /// True for a failed run whose `error_detail` carries `code`.
    pub fn failed_with(&self, code: &str) -> bool {
        self.status == JobRunStatus::Failed
            && self
                .error_detail
                .as_deref()
                .and_then(|d| d.strip_prefix(code))
                .is_some_and(|rest| rest.starts_with(": "))
    }

    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        !self.status.is_terminal() && now - self.lease_started_at() > stale_after
    }

    fn transition(&mut self, next: JobRunStatus) -> Result<JobRunStatus> {
        if !self.status.can_transition_to(next) {
            return Err(Error::Conflict(format!(
                "job run {} cannot move from {} to {}",
                self.id,
                self.status.as_str(),
                next.as_str()
            )));
        }
        let prev = self.status;
        self.status = next;
        Ok(prev)
    }

    /// Returns the previous status for compare-and-set persistence.
    pub fn mark_running(&mut self, now: DateTime<Utc>) -> Result<JobRunStatus> {
        let prev = self.transition(JobRunStatus::Running)?;
        self.started_at = Some(now);
        Ok(prev)
    }

    pub fn mark_succeeded(&mut self, now: DateTime<Utc>) -> Result<JobRunStatus> {
        let prev = self.transition(JobRunStatus::Succeeded)?;
        self.finished_at = Some(now);
        self.error_detail = None;
        Ok(prev)
    }

    pub fn mark_failed(&mut self, now: DateTime<Utc>, error: &Error) -> Result<JobRunStatus> {
        let prev = self.transition(JobRunStatus::Failed)?;
        self.finished_at = Some(now);
        self.error_detail = Some(error.detail());
        Ok(prev)
    }

    /// Fail an abandoned run whose lease ran out.
    pub fn mark_lease_expired(&mut self, now: DateTime<Utc>) -> Result<JobRunStatus> {
        let prev = self.transition(JobRunStatus::Failed)?;
        self.finished_at = Some(now);
        self.error_detail = Some(format!(
            "LeaseExpired: run left {} since {}",
            prev.as_str(),
            self.lease_started_at().to_rfc3339()
        ));
        Ok(prev)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRunQuery {
    pub data_source_id: Option<DataSourceId>,
    pub status: Option<JobRunStatus>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for JobRunQuery {
    fn default() -> Self {
        Self {
            data_source_id: None,
            status: None,
            since: None,
            until: None,
            limit: 100,
            offset: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sheets_source(org: OrgId, now: DateTime<Utc>) -> DataSource {
        DataSource::new(
            org,
            "carteira",
            SourceConfig::GoogleSheets {
                spreadsheet_id: "sheet-1".to_string(),
                range: "A1:Z".to_string(),
                creditor_code: None,
            },
            true,
            Some(30),
            Some(now),
        )
        .unwrap()
    }

    #[test]
    fn source_config_uses_kind_tag() {
        let cfg: SourceConfig = serde_json::from_value(serde_json::json!({
            "kind": "sql",
            "connection_url": "postgres://db/app",
            "query": "SELECT * FROM titulos",
            "creditor_code": "C01"
        }))
        .unwrap();
        assert_eq!(cfg.kind(), SourceKind::Sql);
        assert_eq!(cfg.creditor_code(), Some("C01"));
        cfg.validate().unwrap();
    }

    #[test]
    fn csv_upload_cannot_be_recurring() {
        let err = DataSource::new(
            OrgId::new(),
            "planilha",
            SourceConfig::CsvUpload {
                path: None,
                format: FileFormat::Csv,
                delimiter: None,
                creditor_code: None,
            },
            true,
            None,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn due_decision_is_total() {
        let now = Utc::now();
        let mut source = sheets_source(OrgId::new(), now);
        let default = Duration::minutes(60);
        let stale = Duration::minutes(180);

        assert_eq!(source.due_decision(now, None, default, stale), DueDecision::Due);

        let mut run = JobRun::new_pending(&source, JobTrigger::Scheduled, now - Duration::minutes(10));
        assert_eq!(
            source.due_decision(now, Some(&run), default, stale),
            DueDecision::Active(run.id)
        );

        run.mark_running(now - Duration::minutes(200)).unwrap();
        assert_eq!(
            source.due_decision(now, Some(&run), default, stale),
            DueDecision::DueAfterStaleLease(run.id)
        );

        run.mark_succeeded(now).unwrap();
        assert!(matches!(
            source.due_decision(now, Some(&run), default, stale),
            DueDecision::NotYetDue { .. }
        ));
        assert_eq!(
            source.due_decision(now + Duration::minutes(31), Some(&run), default, stale),
            DueDecision::Due
        );

        source.enabled = false;
        assert_eq!(source.due_decision(now, None, default, stale), DueDecision::Disabled);

        source.is_recurring = false;
        assert_eq!(
            source.due_decision(now, None, default, stale),
            DueDecision::NotRecurring
        );
    }

    #[test]
    fn auth_failures_block_until_reconfigured() {
        let now = Utc::now();
        let mut source = sheets_source(OrgId::new(), now - Duration::hours(2));
        let default = Duration::minutes(60);
        let stale = Duration::minutes(180);

        let mut run = JobRun::new_pending(&source, JobTrigger::Scheduled, now - Duration::hours(1));
        run.mark_running(now - Duration::hours(1)).unwrap();
        run.mark_failed(now - Duration::hours(1), &Error::Auth("token revoked".to_string()))
            .unwrap();
        assert!(run.failed_with(AUTH_ERROR_CODE));
        assert_eq!(
            source.due_decision(now, Some(&run), default, stale),
            DueDecision::BlockedOnAuth(run.id)
        );
        assert!(!source
            .due_decision(now, Some(&run), default, stale)
            .should_dispatch());

        source.touch(now - Duration::minutes(5));
        assert_eq!(source.due_decision(now, Some(&run), default, stale), DueDecision::Due);

        let mut unreachable = JobRun::new_pending(&source, JobTrigger::Scheduled, now - Duration::hours(1));
        unreachable.mark_running(now - Duration::hours(1)).unwrap();
        unreachable
            .mark_failed(now - Duration::hours(1), &Error::Connection("refused".to_string()))
            .unwrap();
        assert!(!unreachable.failed_with(AUTH_ERROR_CODE));
        assert_eq!(
            source.due_decision(now, Some(&unreachable), default, stale),
            DueDecision::Due
        );
    }

    #[test]
    fn status_only_moves_forward() {
        let now = Utc::now();
        let source = sheets_source(OrgId::new(), now);
        let mut run = JobRun::new_pending(&source, JobTrigger::OnDemand, now);

        assert!(run.mark_succeeded(now).is_err());
        assert_eq!(run.mark_running(now).unwrap(), JobRunStatus::Pending);
        let err = Error::Auth("no credential".to_string());
        assert_eq!(run.mark_failed(now, &err).unwrap(), JobRunStatus::Running);
        assert!(run.error_detail.as_deref().unwrap().starts_with("AuthError:"));
        assert!(run.mark_running(now).is_err());
        assert!(run.mark_lease_expired(now).is_err());
    }

    #[test]
    fn pending_run_lease_counts_from_dispatch() {
        let now = Utc::now();
        let source = sheets_source(OrgId::new(), now);
        let mut run = JobRun::new_pending(&source, JobTrigger::Scheduled, now - Duration::hours(4));
        assert!(run.is_stale(now, Duration::hours(3)));
        run.mark_lease_expired(now).unwrap();
        assert_eq!(run.status, JobRunStatus::Failed);
        assert!(run.error_detail.as_deref().unwrap().starts_with("LeaseExpired:"));
        assert!(!run.is_stale(now, Duration::hours(3)));
    }
}
