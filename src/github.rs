//! Registers and removes SSH public keys on the token owner's GitHub account.
//! Automated SSH tests use this to put a throwaway key in place and take it away again.

use crate::error::{LauncherError, Result};
use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tracing::{debug, info};

pub const TOKEN_ENV: &str = "GITHUB_TOKEN";
const API_VERSION: &str = "2022-11-28";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
struct NewKey<'a> {
    title: &'a str,
    key: &'a str,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RegisteredKey {
    pub id: u64,
    #[serde(default)]
    pub title: String,
}

pub struct GitHubKeyClient {
    client: Client,
    api_url: String,
}

/// `--token` wins over `GITHUB_TOKEN`; blank values count as absent.
pub fn resolve_token(flag: Option<&str>) -> Result<String> {
    flag.map(str::to_string)
        .or_else(|| env::var(TOKEN_ENV).ok())
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| {
            LauncherError::EnvironmentMissing(format!(
                "a GitHub token is required; pass --token or set {TOKEN_ENV}"
            ))
        })
}

impl GitHubKeyClient {
    pub fn new(api_url: &str, token: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| LauncherError::Config("GitHub token contains invalid characters".to_string()))?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        headers.insert("x-github-api-version", HeaderValue::from_static(API_VERSION));
        headers.insert(USER_AGENT, HeaderValue::from_static("impactncd-cli"));
        let client = Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
        })
    }

    /// `POST /user/keys`; returns the id GitHub assigned.
    pub fn add_key(&self, title: &str, public_key: &str) -> Result<u64> {
        let url = format!("{}/user/keys", self.api_url);
        debug!(url = %url, title = %title, "registering ssh key");
        let response = self
            .client
            .post(&url)
            .json(&NewKey {
                title,
                key: public_key.trim(),
            })
            .send()?;
        let response = expect_status(response, StatusCode::CREATED)?;
        let registered: RegisteredKey = response.json()?;
        info!(id = registered.id, title = %title, "ssh key registered on GitHub");
        Ok(registered.id)
    }

    /// `DELETE /user/keys/{id}`.
    pub fn remove_key(&self, id: u64) -> Result<()> {
        let url = format!("{}/user/keys/{id}", self.api_url);
        debug!(url = %url, "removing ssh key");
        let response = self.client.delete(&url).send()?;
        expect_status(response, StatusCode::NO_CONTENT)?;
        info!(id, "ssh key removed from GitHub");
        Ok(())
    }
}

fn expect_status(response: Response, expected: StatusCode) -> Result<Response> {
    let status = response.status();
    if status == expected {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    Err(LauncherError::GitHub {
        status: status.as_u16(),
        body: body.trim().to_string(),
    })
}
