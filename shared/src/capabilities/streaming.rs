use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use super::{
    AdapterCapability, AdapterError, AdapterFactory, AdapterSettings, MediaRequest, ModelInfo,
    PartialTextCallback,
};
use crate::model::Credential;

/// Chunks of response text in arrival order. A chunk-level error ends the
/// response.
pub type TextStream = mpsc::Receiver<Result<String, AdapterError>>;

/// Host-provided transport for backends that answer with a chunked text
/// stream.
#[async_trait::async_trait]
pub trait StreamTransport: Send + Sync {
    async fn open_stream(&self, request: MediaRequest) -> Result<TextStream, AdapterError>;

    async fn list_models(
        &self,
        _endpoint: &str,
        _credential: &Credential,
    ) -> Result<Vec<ModelInfo>, AdapterError> {
        Err(AdapterError::Unsupported("model listing"))
    }
}

pub struct StreamingAdapter {
    settings: AdapterSettings,
    system_prompt: Option<String>,
    transport: Arc<dyn StreamTransport>,
}

impl StreamingAdapter {
    pub fn new(settings: AdapterSettings, transport: Arc<dyn StreamTransport>) -> Self {
        Self {
            settings,
            system_prompt: None,
            transport,
        }
    }

    pub fn settings(&self) -> &AdapterSettings {
        &self.settings
    }
}

#[async_trait::async_trait]
impl AdapterCapability for StreamingAdapter {
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
        let mut stream = self.transport.open_stream(request).await?;

        let mut text = String::new();
        let mut chunks = 0usize;
        while let Some(chunk) = stream.recv().await {
            let chunk = chunk.inspect_err(|e| warn!(error = %e, chunks, "stream aborted"))?;
            chunks += 1;
            text.push_str(&chunk);
            if let Some(cb) = &on_partial {
                cb(&text);
            }
        }

        if chunks == 0 {
            return Err(AdapterError::EmptyResponse);
        }
        debug!(chunks, len = text.len(), "stream complete");
        Ok(text)
    }

    async fn available_models(&self) -> Result<Vec<ModelInfo>, AdapterError> {
        self.transport
            .list_models(&self.settings.endpoint, &self.settings.credential)
            .await
    }
}

pub struct StreamingAdapterFactory {
    transport: Arc<dyn StreamTransport>,
}

impl StreamingAdapterFactory {
    pub fn new(transport: Arc<dyn StreamTransport>) -> Self {
        Self { transport }
    }
}

impl AdapterFactory for StreamingAdapterFactory {
    fn build(&self, settings: AdapterSettings) -> Box<dyn AdapterCapability> {
        Box::new(StreamingAdapter::new(settings, Arc::clone(&self.transport)))
    }
}

/// In-memory transport that replays fixed chunks and records requests.
#[derive(Default)]
pub struct ScriptedStreamTransport {
    chunks: Vec<Result<String, String>>,
    models: Option<Vec<ModelInfo>>,
    requests: Mutex<Vec<MediaRequest>>,
}

impl ScriptedStreamTransport {
    pub fn new(chunks: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            chunks: chunks.into_iter().map(|c| Ok(c.into())).collect(),
            ..Self::default()
        }
    }

    /// Ends the replay with a transport error after the given chunks.
    pub fn failing_after(chunks: impl IntoIterator<Item = impl Into<String>>, reason: &str) -> Self {
        let mut transport = Self::new(chunks);
        transport.chunks.push(Err(reason.to_string()));
        transport
    }

    pub fn with_models(mut self, models: Vec<ModelInfo>) -> Self {
        self.models = Some(models);
        self
    }

    pub fn requests(&self) -> Vec<MediaRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl StreamTransport for ScriptedStreamTransport {
    async fn open_stream(&self, request: MediaRequest) -> Result<TextStream, AdapterError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        let (tx, rx) = mpsc::channel(self.chunks.len().max(1));
        for chunk in &self.chunks {
            let item = chunk.clone().map_err(AdapterError::Transport);
            if tx.send(item).await.is_err() {
                break;
            }
        }
        Ok(rx)
    }

    async fn list_models(
        &self,
        _endpoint: &str,
        _credential: &Credential,
    ) -> Result<Vec<ModelInfo>, AdapterError> {
        self.models
            .clone()
            .ok_or(AdapterError::Unsupported("model listing"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::ProviderTuning;
    use crate::model::SourceId;

    fn settings() -> AdapterSettings {
        AdapterSettings {
            source_id: SourceId::new("gem"),
            endpoint: "https://generativelanguage.example.com".into(),
            model: "flash".into(),
            credential: Credential::new("key"),
            trait_text: Some("be concise".into()),
            tuning: ProviderTuning::Streaming {
                thinking_budget: Some(1024),
            },
        }
    }

    #[tokio::test]
    async fn partial_callback_sees_accumulated_text() {
        let transport = Arc::new(ScriptedStreamTransport::new(["The ", "answer ", "is 4"]));
        let adapter = StreamingAdapter::new(settings(), transport.clone());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let cb: PartialTextCallback = Arc::new(move |t: &str| sink.lock().unwrap().push(t.to_string()));

        let text = adapter
            .send_media(Bytes::from_static(b"png"), "image/png", Some("solve"), None, Some(cb))
            .await
            .unwrap();

        assert_eq!(text, "The answer is 4");
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["The ", "The answer ", "The answer is 4"]
        );
    }

    #[tokio::test]
    async fn system_prompt_and_tuning_reach_transport() {
        let transport = Arc::new(ScriptedStreamTransport::new(["ok"]));
        let mut adapter = StreamingAdapter::new(settings(), transport.clone());
        adapter.set_system_prompt("you solve homework".into());
        adapter
            .send_media(Bytes::new(), "image/jpeg", None, Some("pro"), None)
            .await
            .unwrap();

        let req = &transport.requests()[0];
        assert_eq!(req.system_prompt.as_deref(), Some("you solve homework"));
        assert_eq!(req.thinking_budget, Some(1024));
        assert_eq!(req.model, "pro");
        assert_eq!(req.trait_text.as_deref(), Some("be concise"));
    }

    #[tokio::test]
    async fn mid_stream_error_fails_the_request() {
        let transport = Arc::new(ScriptedStreamTransport::failing_after(["partial"], "reset"));
        let adapter = StreamingAdapter::new(settings(), transport);
        let err = adapter
            .send_media(Bytes::new(), "image/png", None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Transport(r) if r == "reset"));
    }

    #[tokio::test]
    async fn empty_stream_is_an_error() {
        let empty: [&str; 0] = [];
        let adapter = StreamingAdapter::new(settings(), Arc::new(ScriptedStreamTransport::new(empty)));
        let err = adapter
            .send_media(Bytes::new(), "image/png", None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::EmptyResponse));
    }

    #[tokio::test]
    async fn model_listing_delegates_to_transport() {
        let models = vec![ModelInfo {
            name: "models/flash".into(),
            display_name: "Flash".into(),
        }];
        let transport = ScriptedStreamTransport::new(["x"]).with_models(models.clone());
        let factory = StreamingAdapterFactory::new(Arc::new(transport));
        let adapter = factory.build(settings());
        assert_eq!(adapter.available_models().await.unwrap(), models);
    }
}
