//! OIDC device-code flow helpers shared by the auth commands.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use stardag_types::AuthConfigResponse;

const DEVICE_SCOPE: &str = "openid email profile offline_access";

#[derive(Debug, Deserialize)]
pub struct ProviderMetadata {
    pub device_authorization_endpoint: String,
    pub token_endpoint: String,
}

#[derive(Debug, Deserialize)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    #[serde(default)]
    pub verification_uri_complete: Option<String>,
    #[serde(default = "default_poll_interval")]
    pub interval: u64,
    pub expires_in: u64,
}

fn default_poll_interval() -> u64 {
    5
}

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenError {
    error: String,
}

/// The registry's advertised issuer and client id.
pub async fn fetch_auth_config(
    client: &reqwest::Client,
    registry_url: &str,
) -> Result<AuthConfigResponse> {
    let url = format!("{}/api/v1/auth/config", registry_url.trim_end_matches('/'));
    let response = client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("fetching {url}"))?
        .error_for_status()?;
    Ok(response.json().await?)
}

pub async fn discover_provider(
    client: &reqwest::Client,
    issuer: &str,
) -> Result<ProviderMetadata> {
    let url = format!(
        "{}/.well-known/openid-configuration",
        issuer.trim_end_matches('/')
    );
    let response = client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("fetching {url}"))?
        .error_for_status()?;
    Ok(response.json().await?)
}

pub async fn request_device_authorization(
    client: &reqwest::Client,
    metadata: &ProviderMetadata,
    client_id: &str,
) -> Result<DeviceAuthorization> {
    let response = client
        .post(&metadata.device_authorization_endpoint)
        .form(&[("client_id", client_id), ("scope", DEVICE_SCOPE)])
        .send()
        .await?
        .error_for_status()?;
    Ok(response.json().await?)
}

/// Poll the token endpoint until the user approves, the code expires, or
/// the provider reports a terminal error.
pub async fn poll_for_token(
    client: &reqwest::Client,
    metadata: &ProviderMetadata,
    client_id: &str,
    device: &DeviceAuthorization,
) -> Result<TokenResponse> {
    let deadline = std::time::Instant::now() + Duration::from_secs(device.expires_in);
    let mut interval = Duration::from_secs(device.interval);

    loop {
        if std::time::Instant::now() >= deadline {
            bail!("device authorization expired before approval");
        }
        tokio::time::sleep(interval).await;

        let response = client
            .post(&metadata.token_endpoint)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:device_code"),
                ("device_code", device.device_code.as_str()),
                ("client_id", client_id),
            ])
            .send()
            .await?;

        if response.status().is_success() {
            return Ok(response.json().await?);
        }

        let error: TokenError = response
            .json()
            .await
            .unwrap_or(TokenError {
                error: "unknown".to_string(),
            });
        match error.error.as_str() {
            "authorization_pending" => continue,
            "slow_down" => {
                interval += Duration::from_secs(5);
            }
            other => bail!("device authorization failed: {other}"),
        }
    }
}

pub async fn refresh_access_token(
    client: &reqwest::Client,
    token_endpoint: &str,
    client_id: &str,
    refresh_token: &str,
) -> Result<TokenResponse> {
    let response = client
        .post(token_endpoint)
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", client_id),
        ])
        .send()
        .await?
        .error_for_status()
        .context("refresh token rejected")?;
    Ok(response.json().await?)
}

/// Pull the email claim out of an id token without verifying it; the
/// registry does its own verification on every request.
pub fn email_from_id_token(id_token: &str) -> Option<String> {
    let payload = id_token.split('.').nth(1)?;
    let bytes = base64::Engine::decode(
        &base64::engine::general_purpose::URL_SAFE_NO_PAD,
        payload,
    )
    .ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    claims.get("email")?.as_str().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;

    #[test]
    fn extracts_email_from_unverified_id_token() {
        let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(br#"{"sub":"u1","email":"alice@example.com"}"#);
        let token = format!("header.{payload}.signature");
        assert_eq!(
            email_from_id_token(&token).as_deref(),
            Some("alice@example.com")
        );
        assert_eq!(email_from_id_token("not-a-jwt"), None);
    }
}
