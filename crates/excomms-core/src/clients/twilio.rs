//! REST client for the telephony provider

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{AvailableNumber, FetchedMedia, NumberRequest, OutboundSms, ResourceKind, TelephonyProvider};
use crate::config::TelephonyConfig;
use crate::error::{ExcommsError, Result};

/// Provider error codes the gateway reacts to
pub mod codes {
    pub const RESOURCE_NOT_FOUND: u32 = 20404;
    pub const INVALID_TO_PHONE_NUMBER: u32 = 21211;
    pub const INVALID_AREA_CODE: u32 = 21451;
    pub const NO_PHONE_NUMBER_IN_AREA_CODE: u32 = 21452;
    pub const NOT_MESSAGE_CAPABLE_FROM_NUMBER: u32 = 21606;
    pub const BLACKLIST_RULE_VIOLATION: u32 = 21610;
    pub const NO_SMS_SUPPORT_TO_NUMBER: u32 = 21614;
    pub const MESSAGE_LENGTH_EXCEEDED: u32 = 21617;
}

#[derive(Deserialize)]
struct ProviderException {
    code: u32,
    message: String,
}

#[derive(Deserialize)]
struct AvailableNumbersPage {
    #[serde(default)]
    available_phone_numbers: Vec<AvailableNumberResource>,
}

#[derive(Deserialize)]
struct AvailableNumberResource {
    friendly_name: String,
    phone_number: String,
    #[serde(default)]
    capabilities: HashMap<String, bool>,
}

#[derive(Deserialize)]
struct IncomingNumberResource {
    sid: String,
    phone_number: String,
}

#[derive(Deserialize)]
struct IncomingNumbersPage {
    #[serde(default)]
    incoming_phone_numbers: Vec<IncomingNumberResource>,
}

#[derive(Deserialize)]
struct MessageResource {
    sid: String,
}

/// Telephony provider reached over its REST API with basic auth
#[derive(Clone)]
pub struct TwilioClient {
    client: Client,
    api_base: String,
    account_sid: String,
    auth_token: String,
    application_sid: String,
}

impl TwilioClient {
    pub fn new(config: &TelephonyConfig) -> Self {
        Self {
            client: Client::new(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            account_sid: config.account_sid.clone(),
            auth_token: config.auth_token.clone(),
            application_sid: config.application_sid.clone(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/Accounts/{}/{}", self.api_base, self.account_sid, path)
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.client
            .request(method, url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
    }

    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        match serde_json::from_str::<ProviderException>(&body) {
            Ok(e) => {
                debug!(code = e.code, "Provider rejected request: {}", e.message);
                Err(ExcommsError::Provider {
                    code: e.code,
                    message: e.message,
                })
            }
            Err(_) => Err(ExcommsError::upstream(format!(
                "telephony provider returned {}: {}",
                status, body
            ))),
        }
    }
}

#[async_trait]
impl TelephonyProvider for TwilioClient {
    async fn search_available_numbers(
        &self,
        area_code: &str,
        capabilities: &[String],
    ) -> Result<Vec<AvailableNumber>> {
        let mut query = vec![
            ("AreaCode", area_code.to_string()),
            ("ExcludeAllAddressRequired", "true".to_string()),
            ("ExcludeLocalAddressRequired", "true".to_string()),
            ("ExcludeForeignAddressRequired", "true".to_string()),
        ];
        for capability in capabilities {
            match capability.to_ascii_lowercase().as_str() {
                "voice" => query.push(("VoiceEnabled", "true".to_string())),
                "sms" => query.push(("SmsEnabled", "true".to_string())),
                "mms" => query.push(("MmsEnabled", "true".to_string())),
                other => warn!("Ignoring unknown number capability {}", other),
            }
        }

        let url = self.url("AvailablePhoneNumbers/US/Local.json");
        let page: AvailableNumbersPage = self
            .send(self.request(Method::GET, &url).query(&query))
            .await?
            .json()
            .await?;

        Ok(page
            .available_phone_numbers
            .into_iter()
            .map(|n| {
                let mut capabilities: Vec<String> = n
                    .capabilities
                    .into_iter()
                    .filter(|(_, enabled)| *enabled)
                    .map(|(name, _)| name.to_ascii_lowercase())
                    .collect();
                capabilities.sort();
                AvailableNumber {
                    phone_number: n.phone_number,
                    friendly_name: n.friendly_name,
                    capabilities,
                }
            })
            .collect())
    }

    async fn purchase_number(&self, request: &NumberRequest) -> Result<String> {
        let selector = match request {
            NumberRequest::AreaCode(code) => ("AreaCode", code.as_str()),
            NumberRequest::Number(number) => ("PhoneNumber", number.as_str()),
        };
        let form = [
            selector,
            ("VoiceApplicationSid", self.application_sid.as_str()),
            ("SmsApplicationSid", self.application_sid.as_str()),
        ];
        let url = self.url("IncomingPhoneNumbers/Local.json");
        let number: IncomingNumberResource = self
            .send(self.request(Method::POST, &url).form(&form))
            .await?
            .json()
            .await?;
        Ok(number.phone_number)
    }

    async fn release_number(&self, number: &str) -> Result<()> {
        let url = self.url("IncomingPhoneNumbers.json");
        let page: IncomingNumbersPage = self
            .send(self.request(Method::GET, &url).query(&[("PhoneNumber", number)]))
            .await?
            .json()
            .await?;

        let [owned] = page.incoming_phone_numbers.as_slice() else {
            return Err(ExcommsError::not_found(format!(
                "expected one purchased number matching {} but found {}",
                number,
                page.incoming_phone_numbers.len()
            )));
        };
        let url = self.url(&format!("IncomingPhoneNumbers/{}.json", owned.sid));
        self.send(self.request(Method::DELETE, &url)).await?;
        Ok(())
    }

    async fn send_sms(&self, sms: &OutboundSms) -> Result<String> {
        let mut form = vec![
            ("From", sms.from.as_str()),
            ("To", sms.to.as_str()),
            ("Body", sms.body.as_str()),
            ("ApplicationSid", self.application_sid.as_str()),
        ];
        for media_url in &sms.media_urls {
            form.push(("MediaUrl", media_url.as_str()));
        }
        let url = self.url("Messages.json");
        let message: MessageResource = self
            .send(self.request(Method::POST, &url).form(&form))
            .await?
            .json()
            .await?;
        Ok(message.sid)
    }

    async fn delete_resource(&self, kind: ResourceKind, resource_id: &str) -> Result<()> {
        let url = match kind {
            ResourceKind::Call => self.url(&format!("Calls/{}.json", resource_id)),
            ResourceKind::Sms => self.url(&format!("Messages/{}.json", resource_id)),
            ResourceKind::Recording => self.url(&format!("Recordings/{}.json", resource_id)),
            ResourceKind::Transcription => self.url(&format!("Transcriptions/{}.json", resource_id)),
            // Media is addressed by its full URL
            ResourceKind::Media => resource_id.to_string(),
        };
        self.send(self.request(Method::DELETE, &url)).await?;
        Ok(())
    }

    async fn fetch_media(&self, url: &str) -> Result<FetchedMedia> {
        let response = self.request(Method::GET, url).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(ExcommsError::MediaNotFound(url.to_string())),
            status if !status.is_success() => Err(ExcommsError::upstream(format!(
                "media download from {} returned {}",
                url, status
            ))),
            _ => {
                let content_type = response
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let data = response.bytes().await?.to_vec();
                Ok(FetchedMedia { data, content_type })
            }
        }
    }
}
