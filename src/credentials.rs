use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use url::Url;
use uuid::Uuid;

/// Scope needed to enumerate the library and fetch original bytes.
pub const PHOTOS_READONLY_SCOPE: &str =
    "https://www.googleapis.com/auth/photoslibrary.readonly";

/// Tokens this close to expiry are treated as expired to absorb clock skew.
const EXPIRY_MARGIN_SECONDS: i64 = 60;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("cannot use client secrets at {path}: {reason}")]
    ClientSecrets { path: PathBuf, reason: String },

    #[error("authorization did not complete: {0}")]
    Authorization(String),

    #[error("token endpoint answered HTTP {0}")]
    TokenEndpoint(u16),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// OAuth client identity issued by the Google Cloud console.
#[derive(Clone, Deserialize)]
pub struct ClientSecrets {
    pub client_id: String,
    pub client_secret: String,
    pub auth_uri: String,
    pub token_uri: String,
}

/// The console wraps the identity in an `installed` key, or `web` for
/// clients downloaded under the older type.
#[derive(Deserialize)]
struct ClientSecretsFile {
    #[serde(alias = "web")]
    installed: ClientSecrets,
}

impl ClientSecrets {
    pub fn load(path: &Path) -> Result<ClientSecrets, CredentialError> {
        let raw = std::fs::read_to_string(path).map_err(|e| CredentialError::ClientSecrets {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let file: ClientSecretsFile =
            serde_json::from_str(&raw).map_err(|e| CredentialError::ClientSecrets {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        Ok(file.installed)
    }
}

/// Authorized user credential, persisted whole-file between runs.
#[derive(Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expiry: DateTime<Utc>,
    pub scopes: Vec<String>,
}

impl TokenRecord {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry <= now + Duration::seconds(EXPIRY_MARGIN_SECONDS)
    }

    fn covers_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|held| held == scope)
    }

    fn is_valid(&self, now: DateTime<Utc>) -> bool {
        !self.access_token.is_empty()
            && !self.is_expired(now)
            && self.covers_scope(PHOTOS_READONLY_SCOPE)
    }
}

/// Token endpoint response body, shared by the code exchange and refresh
/// grants.
#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: i64,
    #[serde(default)]
    scope: Option<String>,
}

impl TokenResponse {
    /// A refresh response may omit the refresh token, in which case the
    /// previously held one stays in force.
    fn into_record(self, previous_refresh_token: Option<String>) -> TokenRecord {
        let TokenResponse {
            access_token,
            refresh_token,
            expires_in,
            scope,
        } = self;
        let scopes = match scope {
            Some(scope) => scope.split_whitespace().map(str::to_string).collect(),
            None => vec![PHOTOS_READONLY_SCOPE.to_string()],
        };
        TokenRecord {
            access_token,
            refresh_token: refresh_token.or(previous_refresh_token),
            expiry: Utc::now() + Duration::seconds(expires_in),
            scopes,
        }
    }
}

/// Interactive consent step. Injected so tests and headless callers can
/// substitute their own.
#[async_trait]
pub trait AuthorizationFlow {
    async fn authorize(&self, secrets: &ClientSecrets) -> Result<TokenRecord, CredentialError>;
}

/// Keeps the stored token usable: refreshes it when it has lapsed and only
/// falls back to the interactive flow when nothing stored can be salvaged.
pub struct CredentialStore {
    credentials_file: PathBuf,
    token_file: PathBuf,
    client: reqwest::Client,
}

impl CredentialStore {
    pub fn new(credentials_file: &Path, token_file: &Path) -> CredentialStore {
        CredentialStore {
            credentials_file: credentials_file.to_path_buf(),
            token_file: token_file.to_path_buf(),
            client: reqwest::Client::new(),
        }
    }

    /// Produce a credential that is valid right now, persisting any change
    /// to the token file.
    pub async fn obtain(
        &self,
        flow: &dyn AuthorizationFlow,
    ) -> Result<TokenRecord, CredentialError> {
        let secrets = ClientSecrets::load(&self.credentials_file)?;

        if let Some(record) = self.load_record() {
            if record.is_valid(Utc::now()) {
                log::debug!("Stored token is still valid");
                return Ok(record);
            }
            if record.is_expired(Utc::now())
                && record.refresh_token.is_some()
                && record.covers_scope(PHOTOS_READONLY_SCOPE)
            {
                match self.refresh(&secrets, &record).await {
                    Ok(refreshed) => {
                        self.persist(&refreshed)?;
                        return Ok(refreshed);
                    }
                    Err(e) => {
                        log::warn!("Token refresh failed, starting authorization over: {e}")
                    }
                }
            }
        }

        let record = flow.authorize(&secrets).await?;
        self.persist(&record)?;
        Ok(record)
    }

    /// A token file that is missing or unreadable is treated as absent.
    fn load_record(&self) -> Option<TokenRecord> {
        if !self.token_file.exists() {
            return None;
        }
        let raw = match std::fs::read_to_string(&self.token_file) {
            Ok(raw) => raw,
            Err(e) => {
                log::warn!(
                    "Cannot read stored token at {}: {e}",
                    self.token_file.display()
                );
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(record) => Some(record),
            Err(e) => {
                log::warn!(
                    "Stored token at {} is unreadable, ignoring it: {e}",
                    self.token_file.display()
                );
                None
            }
        }
    }

    fn persist(&self, record: &TokenRecord) -> Result<(), CredentialError> {
        let raw = serde_json::to_string_pretty(record)?;
        std::fs::write(&self.token_file, raw)?;
        Ok(())
    }

    async fn refresh(
        &self,
        secrets: &ClientSecrets,
        record: &TokenRecord,
    ) -> Result<TokenRecord, CredentialError> {
        let refresh_token = record
            .refresh_token
            .as_deref()
            .ok_or_else(|| CredentialError::Authorization("no refresh token held".to_string()))?;

        log::debug!("Refreshing the stored access token");
        let mut params = HashMap::new();
        params.insert("grant_type", "refresh_token");
        params.insert("refresh_token", refresh_token);
        params.insert("client_id", secrets.client_id.as_str());
        params.insert("client_secret", secrets.client_secret.as_str());

        let response = self
            .client
            .post(&secrets.token_uri)
            .form(&params)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(CredentialError::TokenEndpoint(response.status().as_u16()));
        }
        let token: TokenResponse = response.json().await?;
        Ok(token.into_record(record.refresh_token.clone()))
    }
}

/// Browser consent flow for installed applications: a loopback listener on
/// an ephemeral port receives the authorization code once the user grants
/// access.
pub struct InstalledAppFlow {
    client: reqwest::Client,
}

impl InstalledAppFlow {
    pub fn new() -> InstalledAppFlow {
        InstalledAppFlow {
            client: reqwest::Client::new(),
        }
    }

    fn consent_url(
        secrets: &ClientSecrets,
        redirect_uri: &str,
        state: &str,
    ) -> Result<String, CredentialError> {
        let mut url = Url::parse(&secrets.auth_uri)
            .map_err(|e| CredentialError::Authorization(format!("auth_uri is not a URL: {e}")))?;
        url.query_pairs_mut()
            .append_pair("client_id", &secrets.client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", PHOTOS_READONLY_SCOPE)
            .append_pair("access_type", "offline")
            .append_pair("state", state);
        Ok(url.to_string())
    }

    /// Serve the single callback request the consent page redirects to,
    /// answering with a page the user can close.
    async fn wait_for_code(
        listener: &TcpListener,
        expected_state: &str,
    ) -> Result<String, CredentialError> {
        let (stream, _) = listener.accept().await?;
        Self::handle_callback(stream, expected_state).await
    }

    async fn handle_callback(
        mut stream: TcpStream,
        expected_state: &str,
    ) -> Result<String, CredentialError> {
        let (reader, mut writer) = stream.split();
        let mut lines = BufReader::new(reader).lines();
        let request_line = lines.next_line().await?.ok_or_else(|| {
            CredentialError::Authorization("callback connection closed early".to_string())
        })?;

        // Drain the headers before answering.
        while let Some(line) = lines.next_line().await? {
            if line.is_empty() {
                break;
            }
        }

        let result = Self::parse_callback(&request_line, expected_state);

        let body = match &result {
            Ok(_) => "Authorization complete. You may close this window.",
            Err(_) => "Authorization failed. You may close this window.",
        };
        let len = body.len();
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {len}\r\nConnection: close\r\n\r\n{body}"
        );
        writer.write_all(response.as_bytes()).await?;
        writer.flush().await?;

        result
    }

    /// Extract the authorization code from a callback request line such as
    /// `GET /?state=xyz&code=abc HTTP/1.1`.
    fn parse_callback(request_line: &str, expected_state: &str) -> Result<String, CredentialError> {
        let path = request_line.split_whitespace().nth(1).ok_or_else(|| {
            CredentialError::Authorization(format!("malformed callback request {request_line:?}"))
        })?;
        let url = Url::parse(&format!("http://127.0.0.1{path}")).map_err(|e| {
            CredentialError::Authorization(format!("malformed callback query: {e}"))
        })?;

        let mut code = None;
        let mut state = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "code" => code = Some(value.into_owned()),
                "state" => state = Some(value.into_owned()),
                "error" => {
                    return Err(CredentialError::Authorization(format!(
                        "consent was refused: {value}"
                    )));
                }
                _ => {}
            }
        }

        if state.as_deref() != Some(expected_state) {
            return Err(CredentialError::Authorization(
                "callback state mismatch".to_string(),
            ));
        }
        code.ok_or_else(|| {
            CredentialError::Authorization("callback carried no authorization code".to_string())
        })
    }

    async fn exchange_code(
        &self,
        secrets: &ClientSecrets,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenRecord, CredentialError> {
        let mut params = HashMap::new();
        params.insert("grant_type", "authorization_code");
        params.insert("code", code);
        params.insert("client_id", secrets.client_id.as_str());
        params.insert("client_secret", secrets.client_secret.as_str());
        params.insert("redirect_uri", redirect_uri);

        let response = self
            .client
            .post(&secrets.token_uri)
            .form(&params)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(CredentialError::TokenEndpoint(response.status().as_u16()));
        }
        let token: TokenResponse = response.json().await?;
        Ok(token.into_record(None))
    }
}

#[async_trait]
impl AuthorizationFlow for InstalledAppFlow {
    async fn authorize(&self, secrets: &ClientSecrets) -> Result<TokenRecord, CredentialError> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let port = listener.local_addr()?.port();
        let redirect_uri = format!("http://127.0.0.1:{port}");
        let state = Uuid::new_v4().to_string();

        let consent_url = Self::consent_url(secrets, &redirect_uri, &state)?;
        println!("Open this URL in your browser to grant access:");
        println!("{consent_url}");

        let code = Self::wait_for_code(&listener, &state).await?;
        self.exchange_code(secrets, &code, &redirect_uri).await
    }
}
