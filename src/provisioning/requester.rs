//! HTTP client for the bridge provisioning API.
//!
//! All requests carry the bridge's shared secret as a bearer token. The
//! endpoint paths are fixed by the bridge and match its
//! `provisioning` configuration section.

use std::collections::HashMap;

use anyhow::bail;
use log::{debug, info, warn};
use mockall::automock;
use reqwest::Client;

use crate::provisioning::response_structs::{ListResponse, LoginResponse, PingResponse, Puppet};

const PING_PATH: &str = "/_matrix/provision/v1/ping";
const LOGIN_PATH: &str = "/_matrix/provision/v1/login";
const LOGOUT_PATH: &str = "/_matrix/provision/v1/logout";
const LIST_PATH: &str = "/_matrix/provision/v1/list";

/// Cookie names the bridge needs to take over an Instagram session.
const REQUIRED_COOKIES: [&str; 5] = ["sessionid", "csrftoken", "mid", "ig_did", "ds_user_id"];

/// Operations of the bridge provisioning API.
///
/// Abstracted behind a trait for easier testing with mocks.
#[automock]
pub trait Provisioner {
    /// Checks whether the provisioning API is reachable and accepts our
    /// secret.
    async fn ping(&self) -> anyhow::Result<bool>;

    /// Hands an external session's cookies to the bridge so it can link the
    /// account to the given Matrix user.
    async fn login(
        &self,
        matrix_user_id: &str,
        cookies: &HashMap<String, String>,
    ) -> anyhow::Result<LoginResponse>;

    /// Unlinks the external account of the given Matrix user.
    async fn logout(&self, matrix_user_id: &str) -> anyhow::Result<bool>;

    /// Lists the puppets belonging to the given Matrix user.
    async fn list_puppets(&self, matrix_user_id: &str) -> anyhow::Result<Vec<Puppet>>;
}

/// [`Provisioner`] backed by the bridge's HTTP API.
pub struct BridgeRequester {
    /// Base URL of the bridge
    url: String,
    /// Shared secret from the bridge configuration
    secret: String,
    /// HTTP client
    client: Client,
}

impl BridgeRequester {
    /// Create a new [`BridgeRequester`].
    ///
    /// # Arguments
    ///
    /// * `url` - Base URL of the bridge, without a trailing slash.
    /// * `secret` - The provisioning shared secret.
    pub fn new(url: &str, secret: &str) -> Self {
        BridgeRequester {
            url: url.to_string(),
            secret: secret.to_string(),
            client: Client::new(),
        }
    }
}

impl Provisioner for BridgeRequester {
    /// Request `GET /ping`, returning whether the bridge answered
    /// `{"success": true}`.
    async fn ping(&self) -> anyhow::Result<bool> {
        let url = format!("{}{}", &self.url, PING_PATH);
        info!("pinging bridge provisioning api");
        debug!("request {}", &url);

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.secret)
            .send()
            .await?;

        if !response.status().is_success() {
            warn!("bridge ping failed with status {}", response.status());
            return Ok(false);
        }

        let ping: PingResponse = response.json().await?;
        Ok(ping.success)
    }

    /// Request `POST /login` with the Matrix user and the filtered cookie
    /// set.
    ///
    /// Only the cookies the bridge needs are forwarded; anything else the
    /// caller scraped stays local. A missing `sessionid` is rejected before
    /// any request goes out.
    async fn login(
        &self,
        matrix_user_id: &str,
        cookies: &HashMap<String, String>,
    ) -> anyhow::Result<LoginResponse> {
        let mut forwarded: HashMap<&str, &str> = HashMap::new();
        for name in REQUIRED_COOKIES {
            if let Some(value) = cookies.get(name) {
                forwarded.insert(name, value);
            }
        }

        if !forwarded.contains_key("sessionid") {
            bail!("missing critical sessionid cookie");
        }

        let url = format!("{}{}", &self.url, LOGIN_PATH);
        info!("requesting bridge login for {}", matrix_user_id);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.secret)
            .json(&serde_json::json!({
                "userId": matrix_user_id,
                "cookies": forwarded,
            }))
            .send()
            .await?;

        let status = response.status();
        let login: LoginResponse = response.json().await?;
        if !status.is_success() {
            warn!(
                "bridge login failed with status {}: {:?}",
                status, login.error
            );
        }

        Ok(login)
    }

    /// Request `POST /logout` for the Matrix user.
    async fn logout(&self, matrix_user_id: &str) -> anyhow::Result<bool> {
        let url = format!("{}{}", &self.url, LOGOUT_PATH);
        info!("requesting bridge logout for {}", matrix_user_id);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.secret)
            .json(&serde_json::json!({ "userId": matrix_user_id }))
            .send()
            .await?;

        if !response.status().is_success() {
            warn!("bridge logout failed with status {}", response.status());
            return Ok(false);
        }
        Ok(true)
    }

    /// Request `GET /list` and keep only the puppets owned by the given
    /// Matrix user.
    async fn list_puppets(&self, matrix_user_id: &str) -> anyhow::Result<Vec<Puppet>> {
        let url = format!("{}{}", &self.url, LIST_PATH);
        info!("listing bridge puppets for {}", matrix_user_id);

        let list: ListResponse = self
            .client
            .get(&url)
            .bearer_auth(&self.secret)
            .send()
            .await?
            .json()
            .await?;

        Ok(list
            .puppets
            .into_iter()
            .filter(|puppet| puppet.user_id == matrix_user_id)
            .collect())
    }
}
