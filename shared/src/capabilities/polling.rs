use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument, warn};

use super::{
    AdapterCapability, AdapterError, AdapterFactory, AdapterSettings, MediaRequest, ModelInfo,
    PartialTextCallback, ProviderTuning,
};
use crate::config::PollDefaults;
use crate::model::Credential;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Running { partial: Option<String> },
    Completed(String),
    Failed(String),
}

/// Host-provided transport for submit-then-poll backends.
#[async_trait::async_trait]
pub trait PollTransport: Send + Sync {
    async fn submit(&self, request: MediaRequest) -> Result<JobId, AdapterError>;

    async fn poll(&self, job: &JobId) -> Result<JobStatus, AdapterError>;

    async fn list_models(
        &self,
        _endpoint: &str,
        _credential: &Credential,
    ) -> Result<Vec<ModelInfo>, AdapterError> {
        Err(AdapterError::Unsupported("model listing"))
    }
}

pub struct PollingAdapter {
    settings: AdapterSettings,
    system_prompt: Option<String>,
    interval: Duration,
    timeout: Duration,
    transport: Arc<dyn PollTransport>,
}

impl PollingAdapter {
    /// Interval and timeout come from the settings' polling tuning, or the
    /// given defaults when the source carries streaming tuning.
    pub fn new(
        settings: AdapterSettings,
        defaults: &PollDefaults,
        transport: Arc<dyn PollTransport>,
    ) -> Self {
        let (interval, timeout) = match settings.tuning {
            ProviderTuning::Polling { interval, timeout } => (interval, timeout),
            ProviderTuning::Streaming { .. } => (defaults.interval(), defaults.timeout()),
        };
        Self {
            settings,
            system_prompt: None,
            interval,
            timeout,
            transport,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait::async_trait]
impl AdapterCapability for PollingAdapter {
    fn set_system_prompt(&mut self, prompt: String) {
        self.system_prompt = Some(prompt);
    }

    #[instrument(skip_all, fields(source = %self.settings.source_id))]
    async fn send_media(
        &self,
        payload: Bytes,
        mime_type: &str,
        prompt: Option<&str>,
        model: Option<&str>,
        on_partial: Option<PartialTextCallback>,
    ) -> Result<String, AdapterError> {
        let request = MediaRequest::from_settings(
            &self.settings,
            self.system_prompt.as_ref(),
            payload,
            mime_type,
            prompt,
            model,
        );
        let job = self.transport.submit(request).await?;
        info!(job = %job, interval = ?self.interval, timeout = ?self.timeout, "job submitted");

        let started = Instant::now();
        let mut polls = 0u32;
        loop {
            sleep(self.interval).await;
            polls += 1;

            match self.transport.poll(&job).await? {
                JobStatus::Completed(text) => {
                    debug!(job = %job, polls, "job completed");
                    if let Some(cb) = &on_partial {
                        cb(&text);
                    }
                    return Ok(text);
                }
                JobStatus::Failed(reason) => {
                    warn!(job = %job, %reason, "job failed");
                    return Err(AdapterError::JobFailed {
                        job: job.to_string(),
                        reason,
                    });
                }
                JobStatus::Running { partial } => {
                    if let (Some(cb), Some(text)) = (&on_partial, partial.as_deref()) {
                        cb(text);
                    }
                }
            }

            let elapsed = started.elapsed();
            if elapsed >= self.timeout {
                warn!(job = %job, polls, ?elapsed, "giving up on job");
                return Err(AdapterError::PollTimeout {
                    job: job.to_string(),
                    elapsed,
                });
            }
        }
    }

    async fn available_models(&self) -> Result<Vec<ModelInfo>, AdapterError> {
        self.transport
            .list_models(&self.settings.endpoint, &self.settings.credential)
            .await
    }
}

pub struct PollingAdapterFactory {
    transport: Arc<dyn PollTransport>,
    defaults: PollDefaults,
}

impl PollingAdapterFactory {
    pub fn new(transport: Arc<dyn PollTransport>, defaults: PollDefaults) -> Self {
        Self {
            transport,
            defaults,
        }
    }
}

impl AdapterFactory for PollingAdapterFactory {
    fn build(&self, settings: AdapterSettings) -> Box<dyn AdapterCapability> {
        Box::new(PollingAdapter::new(
            settings,
            &self.defaults,
            Arc::clone(&self.transport),
        ))
    }
}

/// In-memory job queue that answers polls from a fixed script. Once the
/// script runs out every poll reports the job still running.
#[derive(Default)]
pub struct ScriptedJobTransport {
    script: Mutex<VecDeque<JobStatus>>,
    polls: AtomicUsize,
    submitted: Mutex<Vec<MediaRequest>>,
}

impl ScriptedJobTransport {
    pub fn new(script: impl IntoIterator<Item = JobStatus>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn poll_count(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn submitted(&self) -> Vec<MediaRequest> {
        self.submitted.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl PollTransport for ScriptedJobTransport {
    async fn submit(&self, request: MediaRequest) -> Result<JobId, AdapterError> {
        let mut submitted = self
            .submitted
            .lock()
            .map_err(|_| AdapterError::Transport("queue lock poisoned".into()))?;
        submitted.push(request);
        Ok(JobId::new(format!("job-{}", submitted.len())))
    }

    async fn poll(&self, _job: &JobId) -> Result<JobStatus, AdapterError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .script
            .lock()
            .map_err(|_| AdapterError::Transport("queue lock poisoned".into()))?
            .pop_front();
        Ok(next.unwrap_or(JobStatus::Running { partial: None }))
    }
}
