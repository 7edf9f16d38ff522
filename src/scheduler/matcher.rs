use std::fmt;
use std::sync::Arc;

use crate::endpoint::{Endpoint, Vocabulary};
use crate::error::ExternalResult;
use crate::external::{JobAttributes, ReplicaCatalog, TaskQueue};
use crate::ledger::JobId;

/// A job pulled from the task queue, with everything matching needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateJob {
    pub job_id: JobId,
    pub arguments: Option<String>,
    pub input_dataset: Option<String>,
    pub attributes: JobAttributes,
}

impl CandidateJob {
    /// Look up arguments, dataset and attributes of a freshly taken job.
    pub async fn fetch(task_queue: &dyn TaskQueue, job_id: JobId) -> ExternalResult<Self> {
        let arguments = task_queue
            .job_arguments(job_id)
            .await?
            .filter(|a| !a.trim().is_empty());
        let input_dataset = task_queue
            .input_dataset(job_id)
            .await?
            .filter(|d| !d.trim().is_empty());
        let attributes = task_queue.job_attributes(job_id).await?;
        Ok(Self {
            job_id,
            arguments,
            input_dataset,
            attributes,
        })
    }

    pub fn dataset(&self) -> &str {
        self.input_dataset.as_deref().unwrap_or_default()
    }
}

/// Software selector parsed from a job's arguments:
/// `<software> <version> <language> <language-version> ...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector<'a> {
    pub software: &'a str,
    pub version: &'a str,
    pub language: &'a str,
    pub language_version: &'a str,
}

impl<'a> Selector<'a> {
    pub fn parse(arguments: &'a str) -> Self {
        let mut tokens = arguments.split_whitespace();
        let mut next = || tokens.next().unwrap_or_default();
        Self {
            software: next(),
            version: next(),
            language: next(),
            language_version: next(),
        }
    }

    fn fits(&self, endpoint: &Endpoint) -> bool {
        self.software == endpoint.software
            && self.version == endpoint.software_version
            && self.language == endpoint.language.name
            && self.language_version == endpoint.language.version
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// Neither arguments nor an input dataset.
    MissingSelector,
    InvalidSoftware(String),
    InvalidVersion(String),
    InvalidLanguage(String),
    /// A replica lives at the endpoint's site but the software differs, or
    /// the dataset has no replica there.
    SiteHasNoSoftware,
    DatasetNoSiteMatch,
    CatalogUnavailable(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::MissingSelector => write!(f, "job has neither arguments nor input data"),
            RejectReason::InvalidSoftware(t) => write!(f, "software '{}' is not accepted", t),
            RejectReason::InvalidVersion(t) => write!(f, "software version '{}' is not accepted", t),
            RejectReason::InvalidLanguage(t) => write!(f, "language '{}' is not accepted", t),
            RejectReason::SiteHasNoSoftware => {
                write!(f, "dataset matches the site but the site does not have the software")
            }
            RejectReason::DatasetNoSiteMatch => write!(f, "dataset does not match any site"),
            RejectReason::CatalogUnavailable(e) => write!(f, "replica lookup failed: {}", e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    Admit,
    Reject(RejectReason),
}

impl MatchOutcome {
    pub fn is_admit(&self) -> bool {
        matches!(self, MatchOutcome::Admit)
    }
}

/// Decides whether a candidate job may run on an endpoint.
///
/// Checks run in a fixed order: selector presence, vocabulary, then
/// replica site and software equality. A job with arguments but no dataset
/// is rejected without asking the catalog.
pub struct Matcher {
    vocabulary: Vocabulary,
    catalog: Arc<dyn ReplicaCatalog>,
}

impl Matcher {
    pub fn new(vocabulary: Vocabulary, catalog: Arc<dyn ReplicaCatalog>) -> Self {
        Self {
            vocabulary,
            catalog,
        }
    }

    pub async fn check(&self, candidate: &CandidateJob, endpoint: &Endpoint) -> MatchOutcome {
        let outcome = self.evaluate(candidate, endpoint).await;
        match &outcome {
            MatchOutcome::Admit => {
                tracing::debug!(job_id = candidate.job_id, endpoint = %endpoint.name, "Job matches endpoint");
            }
            MatchOutcome::Reject(reason) => {
                tracing::debug!(job_id = candidate.job_id, endpoint = %endpoint.name, reason = %reason, "Job does not match endpoint");
            }
        }
        outcome
    }

    async fn evaluate(&self, candidate: &CandidateJob, endpoint: &Endpoint) -> MatchOutcome {
        let arguments = match (&candidate.arguments, &candidate.input_dataset) {
            (None, None) => return MatchOutcome::Reject(RejectReason::MissingSelector),
            (None, Some(dataset)) => {
                return match self.site_matches(dataset, endpoint).await {
                    Ok(true) => MatchOutcome::Admit,
                    Ok(false) => MatchOutcome::Reject(RejectReason::SiteHasNoSoftware),
                    Err(reason) => MatchOutcome::Reject(reason),
                };
            }
            (Some(arguments), _) => arguments,
        };

        let selector = Selector::parse(arguments);
        if !self.vocabulary.accepts_software(selector.software) {
            return MatchOutcome::Reject(RejectReason::InvalidSoftware(selector.software.to_string()));
        }
        if !self.vocabulary.accepts_version(selector.version) {
            return MatchOutcome::Reject(RejectReason::InvalidVersion(selector.version.to_string()));
        }
        if !self.vocabulary.accepts_language(selector.language) {
            return MatchOutcome::Reject(RejectReason::InvalidLanguage(selector.language.to_string()));
        }

        let Some(dataset) = &candidate.input_dataset else {
            return MatchOutcome::Reject(RejectReason::DatasetNoSiteMatch);
        };
        match self.site_matches(dataset, endpoint).await {
            Ok(true) if selector.fits(endpoint) => MatchOutcome::Admit,
            Ok(true) => MatchOutcome::Reject(RejectReason::SiteHasNoSoftware),
            Ok(false) => MatchOutcome::Reject(RejectReason::DatasetNoSiteMatch),
            Err(reason) => MatchOutcome::Reject(reason),
        }
    }

    async fn site_matches(&self, dataset: &str, endpoint: &Endpoint) -> Result<bool, RejectReason> {
        let sites = self
            .catalog
            .replica_sites(dataset)
            .await
            .map_err(|e| RejectReason::CatalogUnavailable(e.to_string()))?;
        let identity = endpoint.site_identity();
        Ok(sites.iter().any(|site| site.contains(identity)))
    }
}
