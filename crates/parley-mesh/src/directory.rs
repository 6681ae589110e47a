//! Typed client for the external Meeting Directory. The directory
//! owns meeting metadata (titles, passwords, invitation tokens); the
//! signaling layer only ever sees the meeting id it hands out, used
//! verbatim as the room id.

use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("invalid directory url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("meeting not found")]
    NotFound,
    #[error("directory refused the request: {0}")]
    Unauthorized(String),
    #[error("unexpected directory response: {0}")]
    Unexpected(StatusCode),
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

/// Meeting metadata as issued by the directory. The id is opaque to
/// us (the directory uses an `xxx-xxx-xxx` format).
#[derive(Debug, Clone, Deserialize)]
pub struct MeetingDetails {
    pub meeting_id: String,
    pub title: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub invitation_token: Option<String>,
}

/// Confirmation returned by a successful join.
#[derive(Debug, Clone, Deserialize)]
pub struct JoinedMeeting {
    pub room_id: String,
    pub title: String,
}

/// How to satisfy the directory's join gate.
#[derive(Debug, Clone)]
pub enum JoinCredential {
    Open,
    Password(String),
    Invitation(String),
}

#[derive(Debug, Serialize)]
struct CreateMeetingRequest<'a> {
    title: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    password: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct JoinMeetingRequest<'a> {
    meeting_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    password: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    invitation_token: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct JoinMeetingResponse {
    data: JoinedMeeting,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    detail: String,
}

pub struct DirectoryClient {
    http: reqwest::Client,
    base: Url,
    bearer: Option<String>,
}

impl DirectoryClient {
    pub fn new(base: &str) -> Result<Self, DirectoryError> {
        let mut base = Url::parse(base)?;
        // keep Url::join from eating the last path segment
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        Ok(Self {
            http: reqwest::Client::new(),
            base,
            bearer: None,
        })
    }

    /// Attaches the identity provider's opaque bearer credential to
    /// every request.
    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }

    pub async fn create(
        &self,
        title: &str,
        password: Option<&str>,
    ) -> Result<MeetingDetails, DirectoryError> {
        let url = self.base.join("meetings/create")?;
        let request = self
            .authorize(self.http.post(url))
            .json(&CreateMeetingRequest { title, password });
        let response = Self::check(request.send().await?).await?;
        Ok(response.json().await?)
    }

    pub async fn join(
        &self,
        meeting_id: &str,
        credential: &JoinCredential,
    ) -> Result<JoinedMeeting, DirectoryError> {
        let url = self.base.join("meetings/join")?;
        let (password, invitation_token) = match credential {
            JoinCredential::Open => (None, None),
            JoinCredential::Password(password) => (Some(password.as_str()), None),
            JoinCredential::Invitation(token) => (None, Some(token.as_str())),
        };
        let request = self.authorize(self.http.post(url)).json(&JoinMeetingRequest {
            meeting_id,
            password,
            invitation_token,
        });
        let response = Self::check(request.send().await?).await?;
        let body: JoinMeetingResponse = response.json().await?;
        Ok(body.data)
    }

    pub async fn resolve_invitation(&self, token: &str) -> Result<MeetingDetails, DirectoryError> {
        let url = self.base.join(&format!("meetings/invitations/{token}"))?;
        let response = Self::check(self.authorize(self.http.get(url)).send().await?).await?;
        Ok(response.json().await?)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.bearer {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn check(response: Response) -> Result<Response, DirectoryError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        match status {
            StatusCode::NOT_FOUND => Err(DirectoryError::NotFound),
            StatusCode::UNAUTHORIZED => {
                let detail = response
                    .json::<ErrorBody>()
                    .await
                    .map(|body| body.detail)
                    .unwrap_or_default();
                Err(DirectoryError::Unauthorized(detail))
            }
            other => Err(DirectoryError::Unexpected(other)),
        }
    }
}
