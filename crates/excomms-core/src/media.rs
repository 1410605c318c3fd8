//! Copies provider-hosted media into the blob store

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::clients::{BlobStore, TelephonyProvider};
use crate::error::Result;
use crate::ids::IdGenerator;
use crate::types::Media;

/// Blob metadata key carrying the audio duration in nanoseconds
pub const DURATION_METADATA_KEY: &str = "duration-ns";

#[derive(Clone)]
pub struct MediaUploader {
    telephony: Arc<dyn TelephonyProvider>,
    store: Arc<dyn BlobStore>,
    ids: Arc<dyn IdGenerator>,
}

impl MediaUploader {
    pub fn new(
        telephony: Arc<dyn TelephonyProvider>,
        store: Arc<dyn BlobStore>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        Self { telephony, store, ids }
    }

    /// Download `url` and store it under a fresh media id. `content_type`
    /// overrides what the provider reports when non-empty.
    pub async fn upload(&self, content_type: &str, url: &str) -> Result<Media> {
        let fetched = self.telephony.fetch_media(url).await?;
        let content_type = if content_type.is_empty() {
            fetched.content_type
        } else {
            content_type.to_string()
        };

        self.save(fetched.data, &content_type, None).await
    }

    /// Store bytes the gateway received directly, such as email
    /// attachments, under a fresh media id.
    pub async fn save(&self, data: Vec<u8>, content_type: &str, name: Option<String>) -> Result<Media> {
        let duration = audio_duration(&data, content_type);
        let duration_ns = duration.map(|d| d.as_nanos() as i64).unwrap_or(0);

        let id = self.ids.next_id().to_string();
        let metadata = HashMap::from([(DURATION_METADATA_KEY.to_string(), duration_ns.to_string())]);
        let stored_url = self.store.put(&id, data, content_type, metadata).await?;
        debug!(media_id = %id, content_type = %content_type, "Stored media");

        Ok(Media {
            id,
            mime_type: content_type.to_string(),
            name,
            url: Some(stored_url),
            resource_id: None,
            duration_ns: (duration_ns > 0).then_some(duration_ns),
        })
    }
}

/// Duration of audio content the gateway can demux. Only WAV is decoded;
/// other formats fall back to what the provider reports.
pub fn audio_duration(data: &[u8], content_type: &str) -> Option<Duration> {
    let mime = content_type.split(';').next().unwrap_or_default().trim();
    match mime {
        "audio/wav" | "audio/x-wav" | "audio/wave" | "audio/vnd.wave" => {
            match hound::WavReader::new(Cursor::new(data)) {
                Ok(reader) => {
                    let rate = reader.spec().sample_rate;
                    if rate == 0 {
                        return None;
                    }
                    let frames = u64::from(reader.duration());
                    Some(Duration::from_nanos(frames * 1_000_000_000 / u64::from(rate)))
                }
                Err(e) => {
                    warn!("Failed to read WAV header: {}", e);
                    None
                }
            }
        }
        _ => None,
    }
}

#[cfg(test)]
pub(crate) mod test_audio {
    use std::io::Cursor;

    /// Mono 16-bit WAV of `secs` seconds of silence at 8 kHz
    pub fn silent_wav(secs: u32) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 8000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for _ in 0..(8000 * secs) {
                writer.write_sample(0i16).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }
}
