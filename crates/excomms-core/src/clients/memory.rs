//! In-memory collaborators
//!
//! Used by the test suites and by the server when it runs against a
//! fixtures file instead of live directory and settings services.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;

use super::{
    AvailableNumber, BlobStore, ConfigKey, Directory, EmailSender, Entity, FetchedMedia, NumberRequest,
    OutboundEmail, OutboundSms, ResourceKind, SettingValue, Settings, TelephonyProvider, TrackEvent, Tracker,
    TranscriptionJobStatus, TranscriptionProvider, TranscriptionResult, keys,
};
use crate::error::{ExcommsError, Result};

use super::twilio::codes;

#[derive(Debug, Default)]
pub struct MemoryDirectory {
    entities: RwLock<HashMap<String, Entity>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entities(entities: impl IntoIterator<Item = Entity>) -> Self {
        let directory = Self::new();
        for entity in entities {
            directory.insert(entity);
        }
        directory
    }

    pub fn insert(&self, entity: Entity) {
        self.entities.write().insert(entity.id.clone(), entity);
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn entity(&self, id: &str) -> Result<Option<Entity>> {
        Ok(self.entities.read().get(id).cloned())
    }

    async fn entities_by_contact(&self, value: &str) -> Result<Vec<Entity>> {
        let mut found: Vec<Entity> = self
            .entities
            .read()
            .values()
            .filter(|e| e.contacts.iter().any(|c| c.value == value))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }
}

fn storage_key(key: &ConfigKey) -> String {
    match &key.subkey {
        Some(subkey) => format!("{}:{}", key.key, subkey),
        None => key.key.clone(),
    }
}

/// Settings with per-node overrides over a table of defaults.
///
/// A keyed value (`key:subkey`) falls back to the node's unkeyed value,
/// then to the default for the key.
#[derive(Debug, Default)]
pub struct MemorySettings {
    defaults: RwLock<HashMap<String, SettingValue>>,
    values: RwLock<HashMap<String, HashMap<String, SettingValue>>>,
}

impl MemorySettings {
    /// Settings preloaded with the defaults an unconfigured organization gets.
    pub fn with_defaults() -> Self {
        let settings = Self::default();
        {
            let mut defaults = settings.defaults.write();
            defaults.insert(keys::SEND_CALLS_TO_VOICEMAIL.into(), SettingValue::Boolean(false));
            defaults.insert(keys::AFTERHOURS_VOICEMAIL_ENABLED.into(), SettingValue::Boolean(false));
            defaults.insert(keys::FORWARDING_LIST_TIMEOUT.into(), SettingValue::Integer(30));
            defaults.insert(keys::FORWARDING_LIST.into(), SettingValue::StringList(Vec::new()));
            defaults.insert(keys::PAUSE_BEFORE_CALL_CONNECT.into(), SettingValue::Integer(0));
            defaults.insert(keys::EXPOSE_CALLER.into(), SettingValue::Boolean(false));
            defaults.insert(keys::CALL_SCREENING_ENABLED.into(), SettingValue::Boolean(true));
            defaults.insert(keys::TRANSCRIBE_VOICEMAIL.into(), SettingValue::Boolean(false));
            defaults.insert(
                keys::TRANSCRIPTION_PROVIDER.into(),
                SettingValue::SingleSelect {
                    id: keys::TRANSCRIPTION_PROVIDER_TELEPHONY.into(),
                    free_text: String::new(),
                },
            );
            for key in [keys::VOICEMAIL_OPTION, keys::AFTERHOURS_GREETING_OPTION] {
                defaults.insert(
                    key.into(),
                    SettingValue::SingleSelect {
                        id: keys::VOICEMAIL_OPTION_DEFAULT.into(),
                        free_text: String::new(),
                    },
                );
            }
        }
        settings
    }

    pub fn set(&self, node_id: &str, key: ConfigKey, value: SettingValue) {
        self.values
            .write()
            .entry(node_id.to_string())
            .or_default()
            .insert(storage_key(&key), value);
    }

    fn load(&self, nodes: HashMap<String, HashMap<String, SettingValue>>) {
        let mut values = self.values.write();
        for (node, entries) in nodes {
            values.entry(node).or_default().extend(entries);
        }
    }
}

#[async_trait]
impl Settings for MemorySettings {
    async fn get_values(&self, node_id: &str, keys: &[ConfigKey]) -> Result<Vec<SettingValue>> {
        let values = self.values.read();
        let defaults = self.defaults.read();
        let node = values.get(node_id);
        keys.iter()
            .map(|key| {
                node.and_then(|n| n.get(&storage_key(key)).or_else(|| n.get(&key.key)))
                    .or_else(|| defaults.get(&key.key))
                    .cloned()
                    .ok_or_else(|| {
                        ExcommsError::upstream(format!("no value for setting {} of {}", key.key, node_id))
                    })
            })
            .collect()
    }
}

/// A stored blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub data: Vec<u8>,
    pub content_type: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, StoredBlob>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<StoredBlob> {
        self.blobs.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(
        &self,
        id: &str,
        data: Vec<u8>,
        content_type: &str,
        metadata: HashMap<String, String>,
    ) -> Result<String> {
        self.blobs.write().insert(
            id.to_string(),
            StoredBlob {
                data,
                content_type: content_type.to_string(),
                metadata,
            },
        );
        Ok(format!("memory://media/{}", id))
    }

    async fn expiring_url(&self, id: &str, ttl: Duration) -> Result<String> {
        if !self.blobs.read().contains_key(id) {
            return Err(ExcommsError::not_found(format!("blob {}", id)));
        }
        Ok(format!("memory://media/{}?ttl={}", id, ttl.as_secs()))
    }
}

#[derive(Debug, Default)]
pub struct MemoryTranscriptionProvider {
    next: AtomicU64,
    submitted: Mutex<Vec<String>>,
    jobs: RwLock<HashMap<String, TranscriptionResult>>,
    polls: AtomicU64,
}

impl MemoryTranscriptionProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Media URLs submitted so far
    pub fn submitted(&self) -> Vec<String> {
        self.submitted.lock().clone()
    }

    pub fn set_result(&self, job_id: &str, status: TranscriptionJobStatus, text: &str) {
        self.jobs.write().insert(
            job_id.to_string(),
            TranscriptionResult {
                status,
                text: text.to_string(),
            },
        );
    }

    /// Number of status lookups served
    pub fn polls(&self) -> u64 {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TranscriptionProvider for MemoryTranscriptionProvider {
    async fn submit(&self, media_url: &str) -> Result<String> {
        let job_id = format!("job-{}", self.next.fetch_add(1, Ordering::SeqCst) + 1);
        self.submitted.lock().push(media_url.to_string());
        self.set_result(&job_id, TranscriptionJobStatus::Submitted, "");
        Ok(job_id)
    }

    async fn job(&self, job_id: &str) -> Result<TranscriptionResult> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        self.jobs
            .read()
            .get(job_id)
            .cloned()
            .ok_or_else(|| ExcommsError::not_found(format!("transcription job {}", job_id)))
    }
}

/// Telephony provider double: a stock of numbers per area code, hosted
/// media, and logs of everything sent, purchased and deleted.
#[derive(Debug, Default)]
pub struct MemoryTelephony {
    next: AtomicU64,
    stock: RwLock<HashMap<String, Vec<String>>>,
    purchased: Mutex<Vec<String>>,
    released: Mutex<Vec<String>>,
    sent: Mutex<Vec<OutboundSms>>,
    deleted: Mutex<Vec<(ResourceKind, String)>>,
    media: RwLock<HashMap<String, FetchedMedia>>,
    rejected_destinations: RwLock<HashMap<String, u32>>,
}

impl MemoryTelephony {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stock_area_code(&self, area_code: &str, numbers: &[&str]) {
        self.stock
            .write()
            .insert(area_code.to_string(), numbers.iter().map(|n| n.to_string()).collect());
    }

    pub fn host_media(&self, url: &str, data: Vec<u8>, content_type: &str) {
        self.media.write().insert(
            url.to_string(),
            FetchedMedia {
                data,
                content_type: content_type.to_string(),
            },
        );
    }

    /// Make SMS to `number` fail with the provider error `code`.
    pub fn reject_destination(&self, number: &str, code: u32) {
        self.rejected_destinations.write().insert(number.to_string(), code);
    }

    pub fn purchased(&self) -> Vec<String> {
        self.purchased.lock().clone()
    }

    pub fn released(&self) -> Vec<String> {
        self.released.lock().clone()
    }

    pub fn sent(&self) -> Vec<OutboundSms> {
        self.sent.lock().clone()
    }

    pub fn deleted(&self) -> Vec<(ResourceKind, String)> {
        self.deleted.lock().clone()
    }
}

#[async_trait]
impl TelephonyProvider for MemoryTelephony {
    async fn search_available_numbers(
        &self,
        area_code: &str,
        capabilities: &[String],
    ) -> Result<Vec<AvailableNumber>> {
        Ok(self
            .stock
            .read()
            .get(area_code)
            .map(|numbers| {
                numbers
                    .iter()
                    .map(|n| AvailableNumber {
                        phone_number: n.clone(),
                        friendly_name: n.clone(),
                        capabilities: capabilities.to_vec(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn purchase_number(&self, request: &NumberRequest) -> Result<String> {
        let number = match request {
            NumberRequest::Number(number) => number.clone(),
            NumberRequest::AreaCode(code) => {
                let mut stock = self.stock.write();
                let Some(numbers) = stock.get_mut(code) else {
                    return Err(ExcommsError::Provider {
                        code: codes::INVALID_AREA_CODE,
                        message: format!("area code {} is invalid", code),
                    });
                };
                if numbers.is_empty() {
                    return Err(ExcommsError::Provider {
                        code: codes::NO_PHONE_NUMBER_IN_AREA_CODE,
                        message: format!("no phone numbers found in area code {}", code),
                    });
                }
                numbers.remove(0)
            }
        };
        self.purchased.lock().push(number.clone());
        Ok(number)
    }

    async fn release_number(&self, number: &str) -> Result<()> {
        if !self.purchased.lock().iter().any(|n| n == number) {
            return Err(ExcommsError::not_found(format!("number {} was not purchased", number)));
        }
        self.released.lock().push(number.to_string());
        Ok(())
    }

    async fn send_sms(&self, sms: &OutboundSms) -> Result<String> {
        if let Some(code) = self.rejected_destinations.read().get(&sms.to) {
            return Err(ExcommsError::Provider {
                code: *code,
                message: format!("cannot deliver to {}", sms.to),
            });
        }
        self.sent.lock().push(sms.clone());
        Ok(format!("SM{}", self.next.fetch_add(1, Ordering::SeqCst) + 1))
    }

    async fn delete_resource(&self, kind: ResourceKind, resource_id: &str) -> Result<()> {
        self.deleted.lock().push((kind, resource_id.to_string()));
        Ok(())
    }

    async fn fetch_media(&self, url: &str) -> Result<FetchedMedia> {
        self.media
            .read()
            .get(url)
            .cloned()
            .ok_or_else(|| ExcommsError::MediaNotFound(url.to_string()))
    }
}

#[derive(Debug, Default)]
pub struct MemoryEmailSender {
    next: AtomicU64,
    sent: Mutex<Vec<OutboundEmail>>,
}

impl MemoryEmailSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<OutboundEmail> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl EmailSender for MemoryEmailSender {
    async fn send(&self, email: &OutboundEmail) -> Result<String> {
        self.sent.lock().push(email.clone());
        Ok(format!("email-{}", self.next.fetch_add(1, Ordering::SeqCst) + 1))
    }
}

#[derive(Debug, Default)]
pub struct MemoryTracker {
    events: Mutex<Vec<TrackEvent>>,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TrackEvent> {
        self.events.lock().clone()
    }
}

impl Tracker for MemoryTracker {
    fn track(&self, event: TrackEvent) {
        self.events.lock().push(event);
    }
}

/// Directory entities and settings loaded from a JSON file.
///
/// ```json
/// {
///   "entities": [{"id": "org-1", "entity_type": "ORGANIZATION", "contacts": []}],
///   "settings": {"org-1": {"send_calls_to_voicemail": {"type": "boolean", "value": true}}}
/// }
/// ```
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Fixtures {
    pub entities: Vec<Entity>,
    pub settings: HashMap<String, HashMap<String, SettingValue>>,
}

impl Fixtures {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ExcommsError::config(format!("reading {}: {}", path.display(), e)))?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn into_collaborators(self) -> (MemoryDirectory, MemorySettings) {
        let directory = MemoryDirectory::with_entities(self.entities);
        let settings = MemorySettings::with_defaults();
        settings.load(self.settings);
        (directory, settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{get_boolean, organization_by_contact, Contact, ContactType, EntityType};

    fn org(id: &str, phone: &str) -> Entity {
        Entity {
            id: id.into(),
            entity_type: EntityType::Organization,
            display_name: Some("Practice".into()),
            contacts: vec![Contact {
                contact_type: ContactType::Phone,
                value: phone.into(),
                provisioned: true,
            }],
            memberships: vec![],
            account_ids: vec![],
        }
    }

    #[tokio::test]
    async fn keyed_settings_fall_back_to_node_then_default() {
        let settings = MemorySettings::with_defaults();
        settings.set("org-1", ConfigKey::new(keys::CALL_SCREENING_ENABLED), SettingValue::Boolean(false));
        settings.set(
            "org-1",
            ConfigKey::with_subkey(keys::CALL_SCREENING_ENABLED, "+12065550100"),
            SettingValue::Boolean(true),
        );

        let keyed = ConfigKey::with_subkey(keys::CALL_SCREENING_ENABLED, "+12065550100");
        assert!(get_boolean(&settings, "org-1", keyed).await.unwrap());
        let other = ConfigKey::with_subkey(keys::CALL_SCREENING_ENABLED, "+12065550199");
        assert!(!get_boolean(&settings, "org-1", other).await.unwrap());
        assert!(get_boolean(&settings, "org-2", ConfigKey::new(keys::CALL_SCREENING_ENABLED)).await.unwrap());
        assert!(settings.get_values("org-1", &[ConfigKey::new("unknown")]).await.is_err());
    }

    #[tokio::test]
    async fn organization_lookup_requires_exactly_one_match() {
        let directory = MemoryDirectory::with_entities([org("org-1", "+12065550100")]);
        let found = organization_by_contact(&directory, "+12065550100").await.unwrap();
        assert_eq!(found.id, "org-1");
        assert!(matches!(
            organization_by_contact(&directory, "+12065550199").await,
            Err(ExcommsError::NotFound(_))
        ));

        directory.insert(org("org-2", "+12065550100"));
        assert!(organization_by_contact(&directory, "+12065550100").await.is_err());
    }

    #[tokio::test]
    async fn purchase_reports_provider_codes() {
        let telephony = MemoryTelephony::new();
        telephony.stock_area_code("206", &["+12065550100"]);
        assert_eq!(
            telephony.purchase_number(&NumberRequest::AreaCode("206".into())).await.unwrap(),
            "+12065550100"
        );
        let empty = telephony.purchase_number(&NumberRequest::AreaCode("206".into())).await;
        assert_eq!(empty.unwrap_err().provider_code(), Some(codes::NO_PHONE_NUMBER_IN_AREA_CODE));
        let unknown = telephony.purchase_number(&NumberRequest::AreaCode("999".into())).await;
        assert_eq!(unknown.unwrap_err().provider_code(), Some(codes::INVALID_AREA_CODE));
    }

    #[test]
    fn fixtures_parse_tagged_setting_values() {
        let fixtures: Fixtures = serde_json::from_str(
            r#"{
                "entities": [{"id": "org-1", "entity_type": "ORGANIZATION"}],
                "settings": {"org-1": {"forwarding_list": {"type": "string_list", "value": ["+14155550100"]}}}
            }"#,
        )
        .unwrap();
        assert_eq!(fixtures.entities.len(), 1);
        assert_eq!(
            fixtures.settings["org-1"]["forwarding_list"],
            SettingValue::StringList(vec!["+14155550100".into()])
        );
    }
}
