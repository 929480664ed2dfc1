//! Brokers callback requests from running job scripts.
//!
//! Each request is answered on the executor that sent it: a
//! [`CallbackReply`] on success, otherwise the error's text.

use codefarm_core::callback::{
    CallbackReply, CallbackRequest, ReplyKind, TypeName, UploadKind, UploadSpec,
};
use codefarm_core::executor::{Executor, ExecutorRecord};
use codefarm_core::services::PlatformServices;
use codefarm_core::{ExecutorId, Job, JobId};
use codefarm_db::{DbError, JobRepo};
use serde_json::{Value, json};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, warn};

#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("Job {0} not found")]
    JobNotFound(JobId),

    #[error("executor {0} is not bound to a job")]
    Unbound(ExecutorId),

    #[error("Type {0} not supported")]
    UnsupportedType(TypeName),

    #[error("upload_file of {0} not supported")]
    UnsupportedUpload(UploadKind),

    #[error("{0}")]
    MissingField(String),

    #[error(transparent)]
    Service(#[from] codefarm_core::Error),

    #[error(transparent)]
    Store(#[from] DbError),
}

type CallbackResult<T> = std::result::Result<T, CallbackError>;

/// Answers `executor.type_*`, `executor.file_upload` and
/// `executor.revision_merge` requests.
#[derive(Clone)]
pub struct CallbackBroker {
    jobs: Arc<dyn JobRepo>,
    services: Arc<dyn PlatformServices>,
}

impl CallbackBroker {
    pub fn new(jobs: Arc<dyn JobRepo>, services: Arc<dyn PlatformServices>) -> Self {
        Self { jobs, services }
    }

    /// Serve `request` and report the outcome back to `executor`.
    pub async fn handle(
        &self,
        executor: &dyn Executor,
        record: &ExecutorRecord,
        request: CallbackRequest,
    ) {
        let topic = request.topic();
        let answered = match self.dispatch(executor, record, request).await {
            Ok(reply) => executor.notify_info(reply).await,
            Err(e) => {
                warn!(executor_id = %record.id, topic, error = %e, "Callback failed");
                executor.notify_error(e.to_string()).await
            }
        };
        if let Err(e) = answered {
            error!(executor_id = %record.id, topic, error = %e, "Failed to answer callback");
        }
    }

    pub async fn dispatch(
        &self,
        executor: &dyn Executor,
        record: &ExecutorRecord,
        request: CallbackRequest,
    ) -> CallbackResult<CallbackReply> {
        match request {
            CallbackRequest::TypeRead {
                type_name,
                id,
                getter,
            } => {
                let data = self
                    .services
                    .read_type(&type_name, id.as_deref(), getter.as_deref())
                    .await?;
                Ok(CallbackReply::new(ReplyKind::TypeRead, data))
            }
            CallbackRequest::TypeCreate { type_name, data } => {
                self.type_create(record, type_name, data).await
            }
            CallbackRequest::TypeAction {
                type_name,
                id,
                action,
                data,
            } => {
                let data = self
                    .services
                    .type_action(&type_name, &id, &action, data)
                    .await?;
                Ok(CallbackReply::new(ReplyKind::TypeActionDone, data))
            }
            CallbackRequest::TypeUpdate {
                type_name,
                id,
                data,
            } => {
                if !is_sub_job(&type_name) {
                    return Err(CallbackError::UnsupportedType(type_name));
                }
                let data = self.services.update_type(&type_name, &id, data).await?;
                Ok(CallbackReply::new(ReplyKind::TypeUpdated, data))
            }
            CallbackRequest::FileUpload { upload, data } => {
                self.file_upload(executor, record, upload, data).await
            }
            CallbackRequest::RevisionMerge { revision_id } => {
                self.revision_merge(record, revision_id).await
            }
        }
    }

    async fn type_create(
        &self,
        record: &ExecutorRecord,
        type_name: TypeName,
        data: Value,
    ) -> CallbackResult<CallbackReply> {
        let job = self.job_of(record).await?;

        let created = if is_artifact(&type_name) {
            let created = self.services.create_type(&type_name, data).await?;
            let id = string_field(&created, "_id")
                .ok_or_else(|| CallbackError::MissingField("No artifact id".to_string()))?;
            let name = string_field(&created, "name").unwrap_or_default();
            let repository = string_field(&created, "repository").unwrap_or_default();
            let version = string_field(&created, "version");
            self.record_on_job(
                job.id,
                Box::new(move |job: &mut Job| job.add_artifact(name, repository, version, id)),
            )
            .await?;
            created
        } else if is_sub_job(&type_name) {
            let mut data = data;
            if let Value::Object(fields) = &mut data {
                fields
                    .entry("jobId")
                    .or_insert_with(|| Value::String(job.id.to_string()));
            } else {
                data = json!({ "jobId": job.id.to_string() });
            }
            let created = self.services.create_type(&type_name, data).await?;
            let id = string_field(&created, "_id")
                .ok_or_else(|| CallbackError::MissingField("No subJob id".to_string()))?;
            let name = string_field(&created, "name").unwrap_or_default();
            self.record_on_job(job.id, Box::new(move |job: &mut Job| job.add_sub_job(name, id)))
                .await?;
            created
        } else {
            return Err(CallbackError::UnsupportedType(type_name));
        };

        Ok(CallbackReply::new(ReplyKind::TypeCreated, created))
    }

    async fn file_upload(
        &self,
        executor: &dyn Executor,
        record: &ExecutorRecord,
        upload: UploadKind,
        spec: UploadSpec,
    ) -> CallbackResult<CallbackReply> {
        let path = spec
            .path
            .clone()
            .ok_or_else(|| CallbackError::MissingField("data.path is required".to_string()))?;
        let job = self.job_of(record).await?;

        let uploaded = match upload {
            UploadKind::Artifact => {
                let artifact_id = match &spec.artifact_id {
                    Some(id) => id.clone(),
                    None => self.create_artifact(&spec).await?,
                };
                let content = executor.download_file(&path).await?;
                self.services
                    .upload_file(&TypeName::new("artifactrepo", "artifact"), &artifact_id, content)
                    .await?
            }
            UploadKind::Log => {
                let log_id = match (&spec.log_id, &spec.name) {
                    (Some(id), _) => id.clone(),
                    (None, Some(name)) => self.services.allocate_log(name, &spec.tags).await?,
                    (None, None) => {
                        return Err(CallbackError::MissingField(format!(
                            "data must contain either logId or name, data={}",
                            describe(&spec)
                        )));
                    }
                };
                let content = executor.download_file(&path).await?;
                let uploaded = self
                    .services
                    .upload_file(&TypeName::new("logrepo", "log"), &log_id, content)
                    .await?;
                let name = string_field(&uploaded, "name")
                    .or_else(|| spec.name.clone())
                    .unwrap_or_else(|| path.clone());
                let id = string_field(&uploaded, "_id").unwrap_or(log_id);
                self.record_on_job(job.id, Box::new(move |job: &mut Job| job.add_log(name, id)))
                    .await?;
                uploaded
            }
            UploadKind::Other(_) => return Err(CallbackError::UnsupportedUpload(upload)),
        };

        Ok(CallbackReply::new(ReplyKind::FileUploaded, uploaded))
    }

    async fn create_artifact(&self, spec: &UploadSpec) -> CallbackResult<String> {
        let (Some(name), Some(repository)) = (&spec.name, &spec.repository) else {
            return Err(CallbackError::MissingField(format!(
                "data must contain either artifactId or name and repository, data={}",
                describe(spec)
            )));
        };

        let created = self
            .services
            .create_type(
                &TypeName::new("artifactrepo", "artifact"),
                json!({
                    "name": name,
                    "repository": repository,
                    "version": spec.version,
                    "tags": spec.tags,
                }),
            )
            .await?;
        string_field(&created, "_id")
            .ok_or_else(|| CallbackError::MissingField("No artifact id".to_string()))
    }

    async fn revision_merge(
        &self,
        record: &ExecutorRecord,
        revision_id: Option<String>,
    ) -> CallbackResult<CallbackReply> {
        let job = self.job_of(record).await?;
        let revision_id = revision_id
            .ok_or_else(|| CallbackError::MissingField("No revision id".to_string()))?;

        let merged = self.services.merge_revision(&revision_id).await?;
        let id = string_field(&merged, "_id").unwrap_or(revision_id);
        self.record_on_job(job.id, Box::new(move |job: &mut Job| job.add_revision(id, "merged")))
            .await?;

        Ok(CallbackReply::new(ReplyKind::RevisionMerged, merged))
    }

    async fn job_of(&self, record: &ExecutorRecord) -> CallbackResult<Job> {
        let job_id = record.job_id.ok_or(CallbackError::Unbound(record.id))?;
        match self.jobs.get(job_id).await {
            Ok(job) => Ok(job),
            Err(DbError::NotFound(_)) => Err(CallbackError::JobNotFound(job_id)),
            Err(e) => Err(e.into()),
        }
    }

    async fn record_on_job(
        &self,
        job_id: JobId,
        mutation: codefarm_db::JobMutation,
    ) -> CallbackResult<()> {
        match self.jobs.update(job_id, mutation).await {
            Ok(_) => Ok(()),
            Err(DbError::NotFound(_)) => Err(CallbackError::JobNotFound(job_id)),
            Err(e) => Err(e.into()),
        }
    }
}

fn is_artifact(type_name: &TypeName) -> bool {
    type_name.service == "artifactrepo" && type_name.kind == "artifact"
}

fn is_sub_job(type_name: &TypeName) -> bool {
    type_name.service == "exec" && type_name.kind == "subjob"
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

fn describe(spec: &UploadSpec) -> String {
    serde_json::to_string(spec).unwrap_or_default()
}
