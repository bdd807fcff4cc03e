use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::client::{
    ApiError, BackloggrClient, DEFAULT_BASE_URL, UserProfile, handle_data, normalize_base_url,
};

#[derive(Clone)]
pub struct AuthClient {
    http: Client,
    base_url: Url,
    timeout: Option<Duration>,
}

impl AuthClient {
    pub fn new() -> Result<Self, ApiError> {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: &str) -> Result<Self, ApiError> {
        Ok(Self {
            http: Client::new(),
            base_url: normalize_base_url(base_url)?,
            timeout: None,
        })
    }

    /// Also applies to clients handed out by [`AuthClient::client_for`].
    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, ApiError> {
        self.http = Client::builder().timeout(timeout).build()?;
        self.timeout = Some(timeout);
        Ok(self)
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<AuthSession, ApiError> {
        let url = self.base_url.join("api/auth/login")?;
        let body = LoginRequest { email, password };
        let response = self.http.post(url).json(&body).send().await?;
        handle_data(response, "token").await
    }

    pub async fn register(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<AuthSession, ApiError> {
        let url = self.base_url.join("api/auth/register")?;
        let body = RegisterRequest {
            username,
            email,
            password,
        };
        let response = self.http.post(url).json(&body).send().await?;
        handle_data(response, "token").await
    }

    /// API client bound to the issued bearer token.
    pub fn client_for(&self, session: &AuthSession) -> Result<BackloggrClient, ApiError> {
        let client = BackloggrClient::with_base_url(self.base_url.as_str(), session.token.clone())?;
        match self.timeout {
            Some(timeout) => client.with_timeout(timeout),
            None => Ok(client),
        }
    }
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct RegisterRequest<'a> {
    username: &'a str,
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct AuthSession {
    pub token: String,
    #[serde(default)]
    pub user: Option<UserProfile>,
}
