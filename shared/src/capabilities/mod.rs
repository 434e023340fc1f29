mod display;
mod kv;
mod polling;
mod streaming;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{Credential, SourceId};

pub use self::display::{DisplayHandleHost, MemoryHandleHost};
pub use self::kv::{
    FileSlots, KeyNamespace, KvError, KvKey, MemorySlots, SlotStore, TypedSlot, MAX_KEY_LENGTH,
    MAX_VALUE_SIZE,
};
pub use self::polling::{
    JobId, JobStatus, PollTransport, PollingAdapter, PollingAdapterFactory, ScriptedJobTransport,
};
pub use self::streaming::{
    ScriptedStreamTransport, StreamTransport, StreamingAdapter, StreamingAdapterFactory,
    TextStream,
};

/// Receives the text produced so far while a response streams in.
pub type PartialTextCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub display_name: String,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("remote job {job} failed: {reason}")]
    JobFailed { job: String, reason: String },

    #[error("gave up polling job {job} after {elapsed:?}")]
    PollTimeout { job: String, elapsed: Duration },

    #[error("stream ended without any output")]
    EmptyResponse,

    #[error("operation not supported by this adapter: {0}")]
    Unsupported(&'static str),
}

/// The operations every external-service client offers, whatever its
/// transport.
#[async_trait::async_trait]
pub trait AdapterCapability: Send + Sync {
    fn set_system_prompt(&mut self, prompt: String);

    async fn send_media(
        &self,
        payload: Bytes,
        mime_type: &str,
        prompt: Option<&str>,
        model: Option<&str>,
        on_partial: Option<PartialTextCallback>,
    ) -> Result<String, AdapterError>;

    async fn available_models(&self) -> Result<Vec<ModelInfo>, AdapterError> {
        Err(AdapterError::Unsupported("model listing"))
    }
}

/// Provider-specific knobs forwarded from a source configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderTuning {
    Streaming { thinking_budget: Option<u32> },
    Polling { interval: Duration, timeout: Duration },
}

/// Everything an adapter needs from a resolved, credentialed source.
#[derive(Debug, Clone)]
pub struct AdapterSettings {
    pub source_id: SourceId,
    pub endpoint: String,
    pub model: String,
    pub credential: Credential,
    pub trait_text: Option<String>,
    pub tuning: ProviderTuning,
}

/// Builds the adapter for one provider family.
pub trait AdapterFactory: Send + Sync {
    fn build(&self, settings: AdapterSettings) -> Box<dyn AdapterCapability>;
}

/// The request handed to a transport. Fields beyond the payload are passed
/// through untouched; their meaning belongs to the transport.
#[derive(Debug, Clone)]
pub struct MediaRequest {
    pub endpoint: String,
    pub model: String,
    pub credential: Credential,
    pub system_prompt: Option<String>,
    pub trait_text: Option<String>,
    pub thinking_budget: Option<u32>,
    pub payload: Bytes,
    pub mime_type: String,
    pub prompt: Option<String>,
}

impl MediaRequest {
    fn from_settings(
        settings: &AdapterSettings,
        system_prompt: Option<&String>,
        payload: Bytes,
        mime_type: &str,
        prompt: Option<&str>,
        model: Option<&str>,
    ) -> Self {
        let thinking_budget = match settings.tuning {
            ProviderTuning::Streaming { thinking_budget } => thinking_budget,
            ProviderTuning::Polling { .. } => None,
        };
        Self {
            endpoint: settings.endpoint.clone(),
            model: model.map_or_else(|| settings.model.clone(), str::to_string),
            credential: settings.credential.clone(),
            system_prompt: system_prompt.cloned(),
            trait_text: settings.trait_text.clone(),
            thinking_budget,
            payload,
            mime_type: mime_type.to_string(),
            prompt: prompt.map(str::to_string),
        }
    }
}
