use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::capabilities::{
    AdapterCapability, AdapterFactory, AdapterSettings, KeyNamespace, KvError, KvKey,
    ProviderTuning, SlotStore, TypedSlot,
};
use crate::config::{CoreConfig, PollDefaults, RegistryConfig};
use crate::error::ValidationError;
use crate::model::{Credential, SourceId};

/// Active id used when no source remains.
pub const FALLBACK_SOURCE_ID: &str = "default";

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    #[serde(rename = "gemini")]
    Gemini,
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "job-queue")]
    JobQueue,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SourceConfig {
    pub id: SourceId,
    pub name: String,
    pub provider: ProviderKind,
    pub credential: Option<Credential>,
    pub endpoint: String,
    pub model: String,
    #[serde(default)]
    pub trait_text: Option<String>,
    #[serde(default)]
    pub thinking_budget: Option<u32>,
    pub enabled: bool,
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    #[serde(default)]
    pub poll_timeout_ms: Option<u64>,
}

impl SourceConfig {
    pub fn has_credential(&self) -> bool {
        self.credential.as_ref().is_some_and(|c| !c.is_blank())
    }

    /// Enabled and credentialed.
    pub fn is_usable(&self) -> bool {
        self.enabled && self.has_credential()
    }

    fn tuning(&self, defaults: &PollDefaults) -> ProviderTuning {
        match self.provider {
            ProviderKind::Gemini => ProviderTuning::Streaming {
                thinking_budget: self.thinking_budget,
            },
            ProviderKind::OpenAi => ProviderTuning::Streaming {
                thinking_budget: None,
            },
            ProviderKind::JobQueue => ProviderTuning::Polling {
                interval: self
                    .poll_interval_ms
                    .map_or_else(|| defaults.interval(), Duration::from_millis),
                timeout: self
                    .poll_timeout_ms
                    .map_or_else(|| defaults.timeout(), Duration::from_millis),
            },
        }
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::source_field("name", "cannot be empty"));
        }
        validate_endpoint(&self.endpoint)?;
        if self.poll_interval_ms == Some(0) {
            return Err(ValidationError::source_field("poll_interval_ms", "must be > 0"));
        }
        if let (Some(interval), Some(timeout)) = (self.poll_interval_ms, self.poll_timeout_ms) {
            if timeout < interval {
                return Err(ValidationError::source_field(
                    "poll_timeout_ms",
                    "must be at least one poll interval",
                ));
            }
        }
        Ok(())
    }
}

fn validate_endpoint(endpoint: &str) -> Result<(), ValidationError> {
    let parsed = Url::parse(endpoint)
        .map_err(|e| ValidationError::source_field("endpoint", e.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ValidationError::source_field(
            "endpoint",
            format!("unsupported scheme '{}'", parsed.scheme()),
        ));
    }
    if parsed.host_str().is_none() {
        return Err(ValidationError::source_field("endpoint", "missing host"));
    }
    Ok(())
}

/// A source as entered by the user, before it has an id.
#[derive(Clone, Debug, PartialEq)]
pub struct SourceDraft {
    pub name: String,
    pub provider: ProviderKind,
    pub credential: Option<Credential>,
    pub endpoint: String,
    pub model: String,
    pub trait_text: Option<String>,
    pub thinking_budget: Option<u32>,
    pub enabled: bool,
    pub poll_interval_ms: Option<u64>,
    pub poll_timeout_ms: Option<u64>,
}

impl SourceDraft {
    pub fn new(
        name: impl Into<String>,
        provider: ProviderKind,
        endpoint: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            provider,
            credential: None,
            endpoint: endpoint.into(),
            model: model.into(),
            trait_text: None,
            thinking_budget: None,
            enabled: true,
            poll_interval_ms: None,
            poll_timeout_ms: None,
        }
    }

    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(Credential::new(credential));
        self
    }

    fn into_config(self, id: SourceId) -> SourceConfig {
        SourceConfig {
            id,
            name: self.name,
            provider: self.provider,
            credential: self.credential,
            endpoint: self.endpoint,
            model: self.model,
            trait_text: self.trait_text,
            thinking_budget: self.thinking_budget,
            enabled: self.enabled,
            poll_interval_ms: self.poll_interval_ms,
            poll_timeout_ms: self.poll_timeout_ms,
        }
    }
}

/// Fields to merge into an existing source. `None` leaves a field alone; the
/// doubly optional fields can also clear it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SourcePatch {
    pub name: Option<String>,
    pub provider: Option<ProviderKind>,
    pub credential: Option<Option<Credential>>,
    pub endpoint: Option<String>,
    pub model: Option<String>,
    pub trait_text: Option<Option<String>>,
    pub thinking_budget: Option<Option<u32>>,
    pub poll_interval_ms: Option<Option<u64>>,
    pub poll_timeout_ms: Option<Option<u64>>,
}

impl SourcePatch {
    fn apply(self, source: &mut SourceConfig) {
        if let Some(v) = self.name {
            source.name = v;
        }
        if let Some(v) = self.provider {
            source.provider = v;
        }
        if let Some(v) = self.credential {
            source.credential = v;
        }
        if let Some(v) = self.endpoint {
            source.endpoint = v;
        }
        if let Some(v) = self.model {
            source.model = v;
        }
        if let Some(v) = self.trait_text {
            source.trait_text = v;
        }
        if let Some(v) = self.thinking_budget {
            source.thinking_budget = v;
        }
        if let Some(v) = self.poll_interval_ms {
            source.poll_interval_ms = v;
        }
        if let Some(v) = self.poll_timeout_ms {
            source.poll_timeout_ms = v;
        }
    }
}

/// The persisted registry, always saved whole.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegistryDocument {
    pub sources: Vec<SourceConfig>,
    pub active_source_id: SourceId,
}

/// Single-provider settings written by older releases.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LegacyProviderConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub thinking_budget: Option<u32>,
    #[serde(default)]
    pub trait_text: Option<String>,
}

// ============================================================================
// Registry
// ============================================================================

pub struct ProviderRegistry {
    document: RegistryDocument,
    slots: Arc<dyn SlotStore>,
    slot: TypedSlot<RegistryDocument>,
    fallback_id: SourceId,
    polling: PollDefaults,
    factories: HashMap<ProviderKind, Arc<dyn AdapterFactory>>,
    rng: Box<dyn RngCore + Send>,
}

impl ProviderRegistry {
    /// Loads the persisted registry, or seeds a first source (importing the
    /// legacy settings when present) and saves it.
    #[instrument(skip_all)]
    pub fn load(slots: Arc<dyn SlotStore>, config: &CoreConfig) -> Result<Self, KvError> {
        let registry = &config.registry;
        let slot = TypedSlot::new(KvKey::new(KeyNamespace::Settings, &registry.registry_slot)?);
        let fallback_id = SourceId::new(registry.fallback_source_id.clone());

        let stored = match slot.load(slots.as_ref()) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(error = %e, "registry document unreadable, starting fresh");
                None
            }
        };

        let (document, seeded) = match stored {
            Some(doc) => (doc, false),
            None => {
                let legacy = Self::read_legacy(slots.as_ref(), registry)?;
                (Self::seed(registry, legacy), true)
            }
        };

        let this = Self {
            document,
            slots,
            slot,
            fallback_id,
            polling: config.polling,
            factories: HashMap::new(),
            rng: Box::new(StdRng::from_entropy()),
        };
        if seeded {
            this.persist();
        }
        info!(sources = this.document.sources.len(), seeded, "provider registry loaded");
        Ok(this)
    }

    fn read_legacy(
        slots: &dyn SlotStore,
        config: &RegistryConfig,
    ) -> Result<Option<LegacyProviderConfig>, KvError> {
        let legacy: TypedSlot<LegacyProviderConfig> =
            TypedSlot::new(KvKey::new(KeyNamespace::Settings, &config.legacy_slot)?);
        match legacy.load(slots) {
            Ok(found) => Ok(found),
            Err(e) => {
                warn!(error = %e, "legacy provider settings unreadable, ignoring");
                Ok(None)
            }
        }
    }

    fn seed(config: &RegistryConfig, legacy: Option<LegacyProviderConfig>) -> RegistryDocument {
        let id = SourceId::new(config.fallback_source_id.clone());
        let mut source = SourceDraft::new(
            "Gemini",
            ProviderKind::Gemini,
            config.default_endpoint.clone(),
            config.default_model.clone(),
        )
        .into_config(id.clone());

        if let Some(legacy) = legacy {
            info!("importing legacy provider settings");
            source.credential = legacy.api_key.map(Credential::new);
            if let Some(url) = legacy.base_url.filter(|u| validate_endpoint(u).is_ok()) {
                source.endpoint = url;
            }
            if let Some(model) = legacy.model.filter(|m| !m.trim().is_empty()) {
                source.model = model;
            }
            source.thinking_budget = legacy.thinking_budget;
            source.trait_text = legacy.trait_text;
        }

        RegistryDocument {
            sources: vec![source],
            active_source_id: id,
        }
    }

    /// Replaces the randomness source used for selection.
    pub fn with_rng(mut self, rng: impl RngCore + Send + 'static) -> Self {
        self.rng = Box::new(rng);
        self
    }

    pub fn register_factory(&mut self, provider: ProviderKind, factory: Arc<dyn AdapterFactory>) {
        self.factories.insert(provider, factory);
    }

    pub fn document(&self) -> &RegistryDocument {
        &self.document
    }

    pub fn sources(&self) -> &[SourceConfig] {
        &self.document.sources
    }

    pub fn source(&self, id: &SourceId) -> Option<&SourceConfig> {
        self.document.sources.iter().find(|s| &s.id == id)
    }

    pub fn active_source_id(&self) -> &SourceId {
        &self.document.active_source_id
    }

    fn persist(&self) {
        if let Err(e) = self.slot.save(self.slots.as_ref(), &self.document) {
            warn!(error = %e, slot = %self.slot.key().raw(), "failed to save provider registry");
        }
    }

    fn active_resolves(&self) -> bool {
        self.source(&self.document.active_source_id).is_some()
    }

    #[instrument(skip_all, fields(provider = ?draft.provider))]
    pub fn add_source(&mut self, draft: SourceDraft) -> Result<SourceId, ValidationError> {
        let id = SourceId::generate();
        let source = draft.into_config(id.clone());
        source.validate()?;

        self.document.sources.push(source);
        if !self.active_resolves() {
            self.document.active_source_id = id.clone();
        }
        self.persist();
        debug!(source = %id, "source added");
        Ok(id)
    }

    /// Merges `patch` into the source. Unknown ids are ignored; an invalid
    /// result leaves the source untouched.
    pub fn update_source(&mut self, id: &SourceId, patch: SourcePatch) -> Result<(), ValidationError> {
        let Some(pos) = self.document.sources.iter().position(|s| &s.id == id) else {
            debug!(source = %id, "update of unknown source ignored");
            return Ok(());
        };

        let mut updated = self.document.sources[pos].clone();
        patch.apply(&mut updated);
        updated.validate()?;
        self.document.sources[pos] = updated;
        self.persist();
        Ok(())
    }

    /// Removes the source, moving the active pointer to the first enabled
    /// source, else the first source, else the fallback id.
    pub fn remove_source(&mut self, id: &SourceId) -> bool {
        let before = self.document.sources.len();
        self.document.sources.retain(|s| &s.id != id);
        if self.document.sources.len() == before {
            return false;
        }

        if &self.document.active_source_id == id {
            let next = self
                .document
                .sources
                .iter()
                .find(|s| s.enabled)
                .or_else(|| self.document.sources.first())
                .map_or_else(|| self.fallback_id.clone(), |s| s.id.clone());
            info!(removed = %id, active = %next, "active source reassigned");
            self.document.active_source_id = next;
        }
        self.persist();
        true
    }

    pub fn toggle_source(&mut self, id: &SourceId, enabled: bool) {
        if let Some(source) = self.document.sources.iter_mut().find(|s| &s.id == id) {
            source.enabled = enabled;
            self.persist();
        }
    }

    pub fn set_active_source(&mut self, id: &SourceId) -> bool {
        if self.source(id).is_none() {
            return false;
        }
        self.document.active_source_id = id.clone();
        self.persist();
        true
    }

    pub fn enabled_sources(&self) -> Vec<&SourceConfig> {
        self.document.sources.iter().filter(|s| s.is_usable()).collect()
    }

    /// Uniform random pick among usable sources, else among all sources.
    /// Re-samples on every call.
    pub fn active_source(&mut self) -> Option<&SourceConfig> {
        let sources = &self.document.sources;
        let usable: Vec<usize> = (0..sources.len()).filter(|&i| sources[i].is_usable()).collect();
        let pool = if usable.is_empty() {
            (0..sources.len()).collect()
        } else {
            usable
        };
        let picked = *pool.choose(&mut *self.rng)?;
        sources.get(picked)
    }

    /// Resolves `id` exactly, or picks via [`Self::active_source`] when absent.
    pub fn resolve(&mut self, id: Option<&SourceId>) -> Option<SourceConfig> {
        match id {
            Some(id) => self.source(id).cloned(),
            None => self.active_source().cloned(),
        }
    }

    /// Builds an adapter for the resolved source. Sources without a credential
    /// never get one.
    #[instrument(skip(self))]
    pub fn client_for_source(&mut self, id: Option<&SourceId>) -> Option<Box<dyn AdapterCapability>> {
        let source = self.resolve(id)?;
        let credential = match source.credential.as_ref() {
            Some(c) if !c.is_blank() => c.clone(),
            _ => {
                debug!(source = %source.id, "source has no credential");
                return None;
            }
        };

        let Some(factory) = self.factories.get(&source.provider) else {
            warn!(source = %source.id, provider = ?source.provider, "no adapter factory registered");
            return None;
        };

        let settings = AdapterSettings {
            tuning: source.tuning(&self.polling),
            source_id: source.id,
            endpoint: source.endpoint,
            model: source.model,
            credential,
            trait_text: source.trait_text,
        };
        Some(factory.build(settings))
    }
}
