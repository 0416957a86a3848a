//! Aggregation fan-out.
//!
//! After the last batch, one scalar job per entity group combines the
//! per-entity projections into group-level maps. Jobs are independent: a
//! group whose submission fails is reported without holding back the rest.

mod groups;

pub use groups::{discover_groups, evaluation_years, AggregationGroup};

use crate::config::{ParameterSet, ResourceProfile, WallTime};
use crate::errors::{AggregationSubmissionError, ConfigurationError, SdmflowError};
use crate::events::{EventSink, NoOpEventSink, PipelineEvent};
use crate::scheduler::{JobScheduler, SubmissionRequest, WaitMode};
use crate::session::{read_combinations, SessionContext};
use futures::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Stage name used for resource overrides and logs.
pub const AGGREGATION_STAGE: &str = "aggregate";

/// Where the aggregation jobs read from and write to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationSettings {
    /// Directory of group files.
    pub groups_dir: PathBuf,
    /// Root of the per-entity projections.
    pub input_root: PathBuf,
    /// Root of the group outputs; one subdirectory per group.
    pub output_root: PathBuf,
    /// Raster defining the output grid and mask.
    pub reference_raster: PathBuf,
    /// Aggregation work unit.
    pub command: PathBuf,
    /// Evaluation years.
    pub periods: Vec<u32>,
    /// Block until every job is terminal.
    pub wait: bool,
    /// Resources per job.
    pub profile: ResourceProfile,
}

impl AggregationSettings {
    /// Reads the `aggregation.*` settings.
    ///
    /// # Errors
    ///
    /// Returns an error if a required setting is missing or malformed.
    pub fn from_params(
        params: &ParameterSet,
        session: &SessionContext,
    ) -> Result<Self, ConfigurationError> {
        let periods = evaluation_years(
            params.require_u32("aggregation.period_start")?,
            params.require_u32("aggregation.period_end")?,
            params.optional_u32("aggregation.period_step")?.unwrap_or(1),
        )?;
        let command = params
            .optional_path("aggregation.command")?
            .unwrap_or_else(|| session.pipeline_dir().join(format!("{AGGREGATION_STAGE}.sh")));

        Ok(Self {
            groups_dir: params.require_path("aggregation.groups_dir")?,
            input_root: params.require_path("aggregation.input_root")?,
            output_root: params.require_path("aggregation.output_root")?,
            reference_raster: params.require_path("aggregation.reference_raster")?,
            command,
            periods,
            wait: params.flag("aggregation.wait", false)?,
            profile: ResourceProfile::new("16G", WallTime::from_hours(4), 1)
                .with_overrides(params, AGGREGATION_STAGE)?,
        })
    }
}

/// Result of one aggregation fan-out.
#[derive(Debug, Clone, Default)]
pub struct AggregationReport {
    /// Groups submitted, with their job ids.
    pub submitted: Vec<(String, Option<String>)>,
    /// Groups that failed.
    pub failed: Vec<AggregationSubmissionError>,
}

impl AggregationReport {
    /// Returns true if every group was submitted.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Converts the first failure into an error.
    ///
    /// # Errors
    ///
    /// Returns the first group failure, if any.
    pub fn into_result(self) -> Result<Self, SdmflowError> {
        match self.failed.first() {
            Some(e) => Err(e.clone().into()),
            None => Ok(self),
        }
    }
}

/// Submits one aggregation job per group.
pub struct Aggregator {
    settings: AggregationSettings,
    session: Arc<SessionContext>,
    scheduler: Arc<dyn JobScheduler>,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregator")
            .field("settings", &self.settings)
            .field("scheduler", &self.scheduler.name())
            .finish_non_exhaustive()
    }
}

impl Aggregator {
    /// Creates an aggregator.
    #[must_use]
    pub fn new(
        settings: AggregationSettings,
        session: Arc<SessionContext>,
        scheduler: Arc<dyn JobScheduler>,
    ) -> Self {
        Self {
            settings,
            session,
            scheduler,
            events: Arc::new(NoOpEventSink),
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Scenario identifiers: the session's simulation combinations.
    fn scenarios(&self) -> Vec<String> {
        if !self.session.combinations().is_empty() {
            return self.session.combinations().to_vec();
        }
        read_combinations(&self.session.layout().combinations_file()).unwrap_or_default()
    }

    /// The request for one group.
    #[must_use]
    pub fn request(&self, group: &AggregationGroup, scenarios: &[String]) -> SubmissionRequest {
        let periods: Vec<String> = self.settings.periods.iter().map(u32::to_string).collect();
        let args = vec![
            group.entity_list.display().to_string(),
            self.settings.input_root.display().to_string(),
            self.settings.output_root.join(&group.name).display().to_string(),
            self.settings.reference_raster.display().to_string(),
            scenarios.join(" "),
            periods.join(" "),
            group.name.clone(),
        ];
        let wait = if self.settings.wait {
            WaitMode::Blocking
        } else {
            WaitMode::Detached
        };
        SubmissionRequest::new(
            format!("{AGGREGATION_STAGE}_{}", group.name),
            self.settings.profile.clone(),
            &self.settings.command,
            self.session.layout().stage_log_dir(AGGREGATION_STAGE),
        )
        .with_args(args)
        .with_wait(wait)
    }

    async fn record_failure(&self, report: &mut AggregationReport, error: AggregationSubmissionError) {
        warn!(group = %error.group, error = %error, "Aggregation failed");
        self.events
            .emit(&PipelineEvent::AggregationFailed {
                group: error.group.clone(),
                error: error.message.clone(),
            })
            .await;
        report.failed.push(error);
    }

    /// Submits every group concurrently.
    ///
    /// # Errors
    ///
    /// Returns an error only if the groups cannot be listed or the log
    /// directory cannot be created; per-group failures are in the report.
    pub async fn run(&self) -> Result<AggregationReport, SdmflowError> {
        let groups = discover_groups(&self.settings.groups_dir)?;
        let mut report = AggregationReport::default();
        if groups.is_empty() {
            warn!(dir = %self.settings.groups_dir.display(), "No aggregation groups found");
            return Ok(report);
        }

        let scenarios = self.scenarios();
        if scenarios.is_empty() {
            warn!("No simulation combinations; aggregation jobs get an empty scenario list");
        }
        std::fs::create_dir_all(self.session.layout().stage_log_dir(AGGREGATION_STAGE))?;

        let mut ready = Vec::with_capacity(groups.len());
        for group in &groups {
            let output = self.settings.output_root.join(&group.name);
            match std::fs::create_dir_all(&output) {
                Ok(()) => ready.push(group),
                Err(e) => {
                    self.record_failure(
                        &mut report,
                        AggregationSubmissionError::new(
                            &group.name,
                            format!("cannot create {}: {e}", output.display()),
                        ),
                    )
                    .await;
                }
            }
        }

        let submissions = ready.iter().map(|group| {
            let request = self.request(group, &scenarios);
            async move {
                match self.scheduler.submit(&request).await {
                    Ok(outcome) if outcome.succeeded => Ok(outcome.job_id),
                    Ok(outcome) => Err(AggregationSubmissionError::new(
                        &group.name,
                        format!("job ended {}", outcome.terminal_state),
                    )),
                    Err(e) => Err(AggregationSubmissionError::new(&group.name, e.to_string())),
                }
            }
        });

        for (group, result) in ready.iter().zip(join_all(submissions).await) {
            match result {
                Ok(job_id) => {
                    info!(group = %group.name, job_id = job_id.as_deref().unwrap_or("-"), "Aggregation submitted");
                    self.events
                        .emit(&PipelineEvent::AggregationSubmitted {
                            group: group.name.clone(),
                            job_id: job_id.clone(),
                        })
                        .await;
                    report.submitted.push((group.name.clone(), job_id));
                }
                Err(e) => self.record_failure(&mut report, e).await,
            }
        }

        info!(
            submitted = report.submitted.len(),
            failed = report.failed.len(),
            "Aggregation fan-out finished"
        );
        Ok(report)
    }
}
