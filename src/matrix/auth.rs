//! Homeserver authentication and session construction.
//!
//! This module owns the login/registration handshake against the Matrix
//! homeserver and the construction of live, per-user sessions from stored
//! credentials.
//!
//! # Overview
//!
//! Registration follows the interactive-auth protocol: a first attempt is
//! made with dummy auth, and when the homeserver answers with a UIAA
//! "more stages required" response the handshake picks a flow supporting
//! password or dummy auth, resubmits with the session id from the response,
//! and returns the resulting credentials. Login is a plain password login.
//!
//! A [`HomeserverSession`] is the unit handed to the sync engine: one
//! authenticated client per local user, with its encryption-tier capability
//! decided here, once, at construction time.

use log::{debug, info, warn};
use matrix_sdk::{
    Client, SessionMeta, SessionTokens,
    authentication::matrix::MatrixSession,
    ruma::{
        OwnedUserId,
        api::client::{
            account::register::v3::Request as RegistrationRequest,
            error::ErrorKind,
            uiaa::{self, AuthData, AuthFlow, AuthType},
        },
    },
};

use crate::{
    error::AuthError,
    matrix::{MatrixCredentials, delivery::EncryptionTier},
};

/// Device display name advertised on login and registration.
const DEVICE_DISPLAY_NAME: &str = "passerelle broker";

/// A live, authenticated connection to the homeserver for one local user.
///
/// Owns no background work by itself; the sync engine drives the connection
/// once a session is handed to it.
pub struct HomeserverSession {
    client: Client,
    tier: EncryptionTier,
}

impl HomeserverSession {
    /// Builds a live session from stored credentials.
    ///
    /// The client uses a per-user sqlite store so encryption state survives
    /// between operations, and the session is restored from the access token
    /// rather than a fresh login. The encryption-tier capability is probed
    /// exactly once here.
    ///
    /// # Arguments
    ///
    /// * `base_url` - Homeserver base URL
    /// * `sqlite_path` - Per-user sqlite store path
    /// * `credentials` - Stored credentials for the user
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Unknown`] when the client cannot be built or the
    /// session cannot be restored.
    pub async fn restore(
        base_url: &str,
        sqlite_path: &str,
        credentials: &MatrixCredentials,
    ) -> Result<Self, AuthError> {
        debug!("restoring homeserver session for {}", credentials.user_id);

        let client = Client::builder()
            .homeserver_url(base_url)
            .sqlite_store(sqlite_path, None)
            .build()
            .await
            .map_err(|e| AuthError::Unknown(e.into()))?;

        let user_id: OwnedUserId = credentials
            .user_id
            .as_str()
            .try_into()
            .map_err(|e: matrix_sdk::ruma::IdParseError| AuthError::Unknown(e.into()))?;

        let session = MatrixSession {
            meta: SessionMeta {
                user_id,
                device_id: credentials.device_id.as_str().into(),
            },
            tokens: SessionTokens {
                access_token: credentials.access_token.clone(),
                refresh_token: None,
            },
        };

        client
            .restore_session(session)
            .await
            .map_err(|e| AuthError::Unknown(e.into()))?;

        let tier = negotiate_encryption_tier(&client).await;
        info!(
            "restored session for {} with encryption tier {:?}",
            credentials.user_id, tier
        );

        Ok(HomeserverSession { client, tier })
    }

    /// The underlying Matrix client.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// The encryption-tier capability decided at construction.
    pub fn encryption_tier(&self) -> EncryptionTier {
        self.tier
    }
}

/// Logs a user into the homeserver with a password.
///
/// # Arguments
///
/// * `base_url` - Homeserver base URL
/// * `username` - Local part or full Matrix ID
/// * `password` - Account password
///
/// # Errors
///
/// Returns [`AuthError::Unknown`] on any login failure, wrapping the
/// transport error.
pub async fn login(
    base_url: &str,
    username: &str,
    password: &str,
) -> Result<MatrixCredentials, AuthError> {
    let client = throwaway_client(base_url).await?;

    let response = client
        .matrix_auth()
        .login_username(username, password)
        .initial_device_display_name(DEVICE_DISPLAY_NAME)
        .send()
        .await
        .map_err(|e| AuthError::Unknown(e.into()))?;

    info!("logged in {} as {}", username, response.user_id);

    Ok(MatrixCredentials {
        local_user_id: username.to_owned(),
        user_id: response.user_id.to_string(),
        access_token: response.access_token,
        device_id: response.device_id.to_string(),
    })
}

/// Registers a new user on the homeserver, walking the interactive-auth
/// stages when required.
///
/// The first attempt carries dummy auth. When the homeserver responds with
/// the UIAA stage list, a flow whose first stage is password or dummy auth is
/// selected and the registration is resubmitted with the session id and the
/// stage's required fields.
///
/// # Errors
///
/// * [`AuthError::UsernameTaken`] when the server reports `M_USER_IN_USE`
/// * [`AuthError::NoSuitableFlow`] when no offered flow starts with a stage
///   we can complete
/// * [`AuthError::Unknown`] for anything else
pub async fn register(
    base_url: &str,
    username: &str,
    password: &str,
) -> Result<MatrixCredentials, AuthError> {
    let client = throwaway_client(base_url).await?;
    let auth = client.matrix_auth();

    let dummy = AuthData::Dummy(uiaa::Dummy::new());
    let first_attempt = auth
        .register(registration_request(username, password, Some(dummy)))
        .await;

    let error = match first_attempt {
        Ok(response) => return credentials_from_registration(username, response),
        Err(error) => error,
    };

    if matches!(error.client_api_error_kind(), Some(ErrorKind::UserInUse)) {
        return Err(AuthError::UsernameTaken);
    }

    // A structured "needs more stages" failure carries the session id and
    // the acceptable stage flows.
    let (flows, uiaa_session) = match error.as_uiaa_response() {
        Some(info) => (info.flows.clone(), info.session.clone()),
        None => return Err(AuthError::Unknown(error.into())),
    };

    let auth_data = match pick_stage_auth(&flows, uiaa_session, username, password) {
        Some(auth_data) => auth_data,
        None => {
            warn!("no registration flow supports password or dummy auth");
            return Err(AuthError::NoSuitableFlow);
        }
    };

    match auth
        .register(registration_request(username, password, Some(auth_data)))
        .await
    {
        Ok(response) => credentials_from_registration(username, response),
        Err(error) if matches!(error.client_api_error_kind(), Some(ErrorKind::UserInUse)) => {
            Err(AuthError::UsernameTaken)
        }
        Err(error) => Err(AuthError::Unknown(error.into())),
    }
}

/// Builds a client without a store, used only for the auth handshake.
async fn throwaway_client(base_url: &str) -> Result<Client, AuthError> {
    Client::builder()
        .homeserver_url(base_url)
        .build()
        .await
        .map_err(|e| AuthError::Unknown(e.into()))
}

fn registration_request(
    username: &str,
    password: &str,
    auth: Option<AuthData>,
) -> RegistrationRequest {
    let mut request = RegistrationRequest::new();
    request.username = Some(username.to_owned());
    request.password = Some(password.to_owned());
    request.initial_device_display_name = Some(DEVICE_DISPLAY_NAME.to_owned());
    request.auth = auth;
    request
}

/// Picks the first offered flow we can complete and builds the auth payload
/// for its opening stage.
fn pick_stage_auth(
    flows: &[AuthFlow],
    uiaa_session: Option<String>,
    username: &str,
    password: &str,
) -> Option<AuthData> {
    let flow = flows.iter().find(|flow| {
        matches!(
            flow.stages.first(),
            Some(AuthType::Password) | Some(AuthType::Dummy)
        )
    })?;

    match flow.stages.first() {
        Some(AuthType::Password) => {
            let mut stage = uiaa::Password::new(
                uiaa::UserIdentifier::UserIdOrLocalpart(username.to_owned()),
                password.to_owned(),
            );
            stage.session = uiaa_session;
            Some(AuthData::Password(stage))
        }
        Some(AuthType::Dummy) => {
            let mut stage = uiaa::Dummy::new();
            stage.session = uiaa_session;
            Some(AuthData::Dummy(stage))
        }
        _ => None,
    }
}

fn credentials_from_registration(
    username: &str,
    response: matrix_sdk::ruma::api::client::account::register::v3::Response,
) -> Result<MatrixCredentials, AuthError> {
    let access_token = response.access_token.ok_or_else(|| {
        AuthError::Unknown(anyhow::anyhow!(
            "registration succeeded but returned no access token"
        ))
    })?;
    let device_id = response.device_id.ok_or_else(|| {
        AuthError::Unknown(anyhow::anyhow!(
            "registration succeeded but returned no device id"
        ))
    })?;

    info!("registered {} as {}", username, response.user_id);

    Ok(MatrixCredentials {
        local_user_id: username.to_owned(),
        user_id: response.user_id.to_string(),
        access_token,
        device_id: device_id.to_string(),
    })
}

/// Decides the encryption-tier capability for a freshly restored session.
///
/// The tier is decided once here and carried on the session; the delivery
/// path never re-probes it per call.
async fn negotiate_encryption_tier(client: &Client) -> EncryptionTier {
    match client.encryption().get_own_device().await {
        Ok(Some(device)) if device.is_cross_signed_by_owner() => {
            EncryptionTier::ModernGroupSession
        }
        Ok(Some(_)) => EncryptionTier::LegacyOlm,
        Ok(None) => {
            debug!("no own device in the crypto store, sending unencrypted");
            EncryptionTier::None
        }
        Err(e) => {
            warn!("crypto store probe failed, sending unencrypted: {:?}", e);
            EncryptionTier::None
        }
    }
}
