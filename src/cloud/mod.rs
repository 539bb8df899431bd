//! Cloud Web API Client
//!
//! Login exchange and device listing against the vendor's app API. The
//! login yields the access token that the remote broker accepts as an MQTT
//! password.


use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, USER_AGENT};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::CloudConfig;
use crate::credential::{AuthError, LoginClient, LoginGrant};

const APP_VERSION: &str = "4.3.1";
const APP_USER_AGENT: &str = "Zendure/4.3.1 (iPhone; iOS 14.4.2; Scale/3.00)";

/// Body of the token request
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenRequest<'a> {
    password: &'a str,
    account: &'a str,
    app_id: &'a str,
    app_type: &'static str,
    grant_type: &'static str,
    tenant_id: &'static str,
}

/// Envelope shared by all API responses
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    msg: Option<String>,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenData {
    access_token: Option<String>,
    expires_in: Option<u64>,
}

/// A device registered to the account
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    #[serde(default)]
    pub product_key: String,
    #[serde(default)]
    pub device_key: String,
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default)]
    pub product_name: Option<String>,
}

/// HTTP client for the cloud app API
#[derive(Clone)]
pub struct CloudClient {
    http: reqwest::Client,
    username: String,
    password: String,
    app_id: String,
    token_url: String,
    device_list_url: Option<String>,
}

impl CloudClient {
    pub fn new(config: &CloudConfig) -> Result<Self, AuthError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .default_headers(app_headers())
            .build()
            .map_err(|e| AuthError::Transport(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            username: config.username.clone(),
            password: config.password.clone(),
            app_id: config.app_id.clone(),
            token_url: config.token_url.clone(),
            device_list_url: config.device_list_url.clone(),
        })
    }

    /// Exchange the account credentials for an access token
    pub async fn login(&self) -> Result<LoginGrant, AuthError> {
        debug!(url = %self.token_url, "Requesting access token");

        let body = TokenRequest {
            password: &self.password,
            account: &self.username,
            app_id: &self.app_id,
            app_type: "iOS",
            grant_type: "password",
            tenant_id: "",
        };

        let response = self
            .http
            .post(&self.token_url)
            .basic_auth(&self.username, Some(&self.password))
            .json(&body)
            .send()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        let status = response.status();
        let parsed: Result<ApiResponse<TokenData>, _> = response.json().await;

        let envelope = match parsed {
            Ok(envelope) if status == reqwest::StatusCode::OK && envelope.success => envelope,
            Ok(envelope) => {
                return Err(AuthError::Rejected(
                    envelope.msg.unwrap_or_else(|| format!("HTTP {}", status)),
                ))
            }
            Err(e) if status == reqwest::StatusCode::OK => {
                return Err(AuthError::InvalidResponse(e.to_string()))
            }
            Err(_) => return Err(AuthError::Rejected(format!("HTTP {}", status))),
        };

        let data = envelope
            .data
            .ok_or_else(|| AuthError::InvalidResponse("missing data".to_string()))?;
        let token = data
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AuthError::InvalidResponse("missing accessToken".to_string()))?;

        info!("Cloud login successful");
        Ok(LoginGrant {
            token,
            expires_in: data.expires_in.map(Duration::from_secs),
        })
    }

    /// Devices registered to the account. Empty when no device list URL is
    /// configured.
    pub async fn device_list(&self, token: &str) -> Result<Vec<DeviceInfo>, AuthError> {
        let Some(url) = &self.device_list_url else {
            return Ok(Vec::new());
        };

        let response = self
            .http
            .post(url)
            .header("Blade-Auth", format!("bearer {}", token))
            .send()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::Rejected(format!("HTTP {}", status)));
        }

        let envelope: ApiResponse<Vec<DeviceInfo>> = response
            .json()
            .await
            .map_err(|e| AuthError::InvalidResponse(e.to_string()))?;
        let devices = envelope.data.unwrap_or_default();
        debug!(count = devices.len(), "Fetched device list");
        Ok(devices)
    }
}

#[async_trait]
impl LoginClient for CloudClient {
    async fn login(&self) -> Result<LoginGrant, AuthError> {
        CloudClient::login(self).await
    }
}

fn app_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("de-DE"));
    headers.insert(USER_AGENT, HeaderValue::from_static(APP_USER_AGENT));
    headers.insert("appversion", HeaderValue::from_static(APP_VERSION));
    headers
}
