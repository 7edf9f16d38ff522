//! Submission façade between the scheduler and the backend drivers.

use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use crate::driver::{DriverError, DriverKey, DriverTable, SubmissionContext};
use crate::endpoint::{Endpoint, EndpointRegistry};
use crate::external::JobAttributes;
use crate::ledger::{JobId, LedgerError, NewLedgerEntry};
use crate::tracking::{StatusRecorder, ORIGIN_SCHEDULER};
use crate::transport::CredentialRef;

#[derive(Error, Debug)]
pub enum DirectorError {
    #[error("Endpoint {endpoint} has no free submission slots")]
    CapacityExceeded { endpoint: String },

    #[error("Name node {name_node} is not registered for endpoint {endpoint}")]
    UnknownTarget { endpoint: String, name_node: String },

    #[error("No driver registered for {0}")]
    UnknownDriver(DriverKey),

    #[error("Job {0} already has a ledger entry")]
    AlreadySubmitted(JobId),

    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

/// One admitted (job, endpoint) pair, as queued to a submit worker.
#[derive(Debug, Clone)]
pub struct SubmissionRequest {
    /// Correlates the queued task with its outcome in the logs.
    pub task_id: Uuid,
    pub job_id: JobId,
    pub job_name: String,
    /// Endpoint snapshot taken when the job was matched. Carries software,
    /// language, public address, interactivity and pilot settings.
    pub endpoint: Endpoint,
    /// Name node the job is addressed to.
    pub name_node: String,
    /// Free slots the endpoint had when the job was admitted.
    pub allowed_slots: i64,
    pub input_dataset: String,
    pub attributes: JobAttributes,
}

impl SubmissionRequest {
    pub fn new(
        job_id: JobId,
        endpoint: &Endpoint,
        allowed_slots: i64,
        input_dataset: impl Into<String>,
        attributes: JobAttributes,
    ) -> Self {
        let job_name = if attributes.name.trim().is_empty() {
            format!("job_{}", job_id)
        } else {
            attributes.name.clone()
        };
        Self {
            task_id: Uuid::new_v4(),
            job_id,
            job_name,
            endpoint: endpoint.clone(),
            name_node: endpoint.name_node.clone(),
            allowed_slots,
            input_dataset: input_dataset.into(),
            attributes,
        }
    }

    pub fn credential(&self) -> CredentialRef {
        CredentialRef {
            owner: self.attributes.owner.clone(),
            group: self.attributes.owner_group.clone(),
        }
    }
}

pub struct Director {
    registry: Arc<EndpointRegistry>,
    drivers: DriverTable,
    recorder: StatusRecorder,
}

impl Director {
    pub fn new(registry: Arc<EndpointRegistry>, drivers: DriverTable, recorder: StatusRecorder) -> Self {
        Self {
            registry,
            drivers,
            recorder,
        }
    }

    /// Submit one job and return the backend-assigned id.
    ///
    /// The ledger entry is created before any remote call. If the driver
    /// fails afterwards the entry stays `Submitted` with an empty backend
    /// id and the failure in its error message.
    pub async fn submit(&self, request: &SubmissionRequest) -> Result<String, DirectorError> {
        let endpoint = &request.endpoint;

        if request.allowed_slots <= 0 {
            return Err(DirectorError::CapacityExceeded {
                endpoint: endpoint.name.clone(),
            });
        }

        let registered = self
            .registry
            .snapshot()
            .get(&endpoint.name)
            .map(|e| e.name_node == request.name_node)
            .unwrap_or(false);
        if !registered {
            return Err(DirectorError::UnknownTarget {
                endpoint: endpoint.name.clone(),
                name_node: request.name_node.clone(),
            });
        }

        let ledger = self.recorder.ledger();
        let entry = match ledger.insert(NewLedgerEntry {
            job_id: request.job_id,
            name: request.job_name.clone(),
            endpoint_address: request.name_node.clone(),
            site: endpoint.site.clone(),
            public_address: endpoint.public_address.clone(),
            input_dataset: request.input_dataset.clone(),
            output_dataset: String::new(),
            software: endpoint.software.clone(),
            software_version: endpoint.software_version.clone(),
            language: endpoint.language.name.clone(),
            language_version: endpoint.language.version.clone(),
        }) {
            Ok(entry) => entry,
            Err(LedgerError::AlreadyExists(job_id)) => {
                return Err(DirectorError::AlreadySubmitted(job_id))
            }
            Err(e) => return Err(e.into()),
        };
        if let Err(e) = self
            .recorder
            .tracker()
            .set_site(request.job_id, &endpoint.site)
            .await
        {
            tracing::warn!(job_id = request.job_id, error = %e, "Could not set job site");
        }
        self.recorder.notify(&entry, ORIGIN_SCHEDULER).await;

        let key = endpoint.driver_key();
        let Some(driver) = self.drivers.resolve(&key) else {
            let err = DirectorError::UnknownDriver(key);
            ledger.set_error(request.job_id, &err.to_string())?;
            return Err(err);
        };

        if endpoint.use_pilot {
            tracing::info!(job_id = request.job_id, endpoint = %endpoint.name, "Pilot requested, submitting job directly");
        }

        let ctx = SubmissionContext {
            job_id: request.job_id,
            job_name: request.job_name.clone(),
            endpoint: endpoint.clone(),
            input_dataset: request.input_dataset.clone(),
            attributes: request.attributes.clone(),
        };
        match driver.submit(&ctx).await {
            Ok(backend_id) => {
                ledger.set_backend_id(request.job_id, &backend_id)?;
                if let Some(entry) = ledger.get(request.job_id)? {
                    self.recorder.notify(&entry, ORIGIN_SCHEDULER).await;
                }
                tracing::info!(
                    job_id = request.job_id,
                    endpoint = %endpoint.name,
                    backend_id = %backend_id,
                    "Job submitted"
                );
                Ok(backend_id)
            }
            Err(e) => {
                ledger.set_error(request.job_id, &e.to_string())?;
                Err(e.into())
            }
        }
    }
}
