//! Stateful HTTP session against the online judge.
//!
//! One [`OjClient`] wraps one account session: a cookie jar, the CSRF token
//! promoted out of it, and the captcha solver handle used during
//! registration. [`JudgeClient`] is the transport trait the rest of the
//! engine works against, so tests can substitute a simulated judge.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use reqwest::Url;
use reqwest::cookie::{CookieStore as _, Jar};
use serde::{Deserialize, Serialize};

use crate::captcha::CaptchaSolver;
use crate::error::ClientError;

/// Timeout for judge GET requests.
pub const GET_TIMEOUT: Duration = Duration::from_secs(10);
/// Timeout for judge POST requests.
pub const POST_TIMEOUT: Duration = Duration::from_secs(15);

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/138.0.0.0 Safari/537.36";

/// Judge result codes, normalized on ingress.
///
/// The wire enumeration is closed but carries two aliased integers
/// (`-3` for MLE, `2` for TLE); [`Verdict::from_wire`] folds the aliases in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    None,
    CompileError,
    WrongAnswer,
    Accepted,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    RuntimeError,
    SystemError,
    Pending,
    Judging,
    PartiallyAccepted,
}

impl Verdict {
    pub fn from_wire(code: i64) -> Result<Self, ClientError> {
        let verdict = match code {
            -10 => Self::None,
            -2 => Self::CompileError,
            -1 => Self::WrongAnswer,
            0 => Self::Accepted,
            1 | 2 => Self::TimeLimitExceeded,
            3 | -3 => Self::MemoryLimitExceeded,
            4 => Self::RuntimeError,
            5 => Self::SystemError,
            6 => Self::Pending,
            7 => Self::Judging,
            8 => Self::PartiallyAccepted,
            other => {
                return Err(ClientError::Protocol(format!(
                    "unknown judge result code {other}"
                )));
            }
        };
        Ok(verdict)
    }

    /// A submission is judged once it leaves the pending/judging set.
    pub fn is_judged(self) -> bool {
        !matches!(self, Self::Pending | Self::Judging)
    }
}

/// One polled submission, normalized.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionRecord {
    pub verdict: Verdict,
    /// Judge-reported memory footprint; present once judged.
    pub memory_cost: Option<f64>,
}

/// Transport contract of the judge, implemented by [`OjClient`] and by test
/// simulators.
#[async_trait]
pub trait JudgeClient: Send + Sync {
    async fn register(&self, username: &str, password: &str, email: &str)
    -> Result<(), ClientError>;
    async fn login(&self, username: &str, password: &str) -> Result<(), ClientError>;
    async fn submit_code(
        &self,
        code: &str,
        language: &str,
        problem_id: i64,
    ) -> Result<String, ClientError>;
    async fn get_submission(&self, submission_id: &str) -> Result<SubmissionRecord, ClientError>;
}

/// Yields a fresh judge session per account.
pub trait Connector: Send + Sync {
    fn client(&self) -> Result<Box<dyn JudgeClient>, ClientError>;
}

/// Real connector: every call builds an [`OjClient`] with its own cookie jar.
pub struct HttpConnector {
    base: Url,
    solver: Arc<dyn CaptchaSolver>,
}

impl HttpConnector {
    pub fn new(base: Url, solver: Arc<dyn CaptchaSolver>) -> Self {
        Self { base, solver }
    }
}

impl Connector for HttpConnector {
    fn client(&self) -> Result<Box<dyn JudgeClient>, ClientError> {
        Ok(Box::new(OjClient::new(self.base.clone(), self.solver.clone())?))
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    data: serde_json::Value,
}

impl Envelope {
    fn data_message(&self) -> String {
        match self.data.as_str() {
            Some(text) => text.to_string(),
            None => self.data.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct RegisterRequest<'a> {
    username: &'a str,
    password: &'a str,
    email: &'a str,
    captcha: &'a str,
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct SubmissionData {
    result: Option<i64>,
    #[serde(default)]
    statistic_info: StatisticInfo,
}

#[derive(Debug, Default, Deserialize)]
struct StatisticInfo {
    memory_cost: Option<f64>,
}

/// One account session against the judge.
pub struct OjClient {
    http: reqwest::Client,
    jar: Arc<Jar>,
    base: Url,
    solver: Arc<dyn CaptchaSolver>,
    csrf: Mutex<Option<String>>,
}

impl OjClient {
    pub fn new(base: Url, solver: Arc<dyn CaptchaSolver>) -> Result<Self, ClientError> {
        let jar = Arc::new(Jar::default());
        let http = reqwest::Client::builder()
            .cookie_provider(jar.clone())
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            http,
            jar,
            base,
            solver,
            csrf: Mutex::new(None),
        })
    }

    fn url(&self, endpoint: &str) -> Result<Url, ClientError> {
        self.base
            .join(endpoint)
            .map_err(|err| ClientError::Protocol(format!("invalid endpoint {endpoint}: {err}")))
    }

    fn cookie(&self, name: &str) -> Option<String> {
        let header = self.jar.cookies(&self.base)?;
        let raw = header.to_str().ok()?;
        raw.split(';')
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.to_string())
    }

    fn remember_csrf(&self) {
        if let Some(token) = self.cookie("csrftoken") {
            *self.csrf.lock().expect("csrf token lock") = Some(token);
        }
    }

    /// Visit a harmless endpoint to obtain the CSRF cookie and promote it
    /// into the `X-CSRFToken` header for subsequent writes.
    async fn refresh_csrf(&self) -> Result<(), ClientError> {
        self.http
            .get(self.url("/api/profile")?)
            .timeout(GET_TIMEOUT)
            .send()
            .await?;
        if self.cookie("csrftoken").is_none() {
            return Err(ClientError::Protocol(
                "judge did not set a csrftoken cookie".to_string(),
            ));
        }
        self.remember_csrf();
        Ok(())
    }

    fn with_csrf(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.csrf.lock().expect("csrf token lock").clone() {
            Some(token) => request.header("X-CSRFToken", token),
            None => request,
        }
    }

    async fn read_envelope(&self, response: reqwest::Response) -> Result<Envelope, ClientError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Transport(format!("http {status}: {body}")));
        }
        response
            .json()
            .await
            .map_err(|err| ClientError::Protocol(format!("malformed judge response: {err}")))
    }

    async fn fetch_captcha_image(&self) -> Result<Vec<u8>, ClientError> {
        let response = self
            .http
            .get(self.url("/api/captcha")?)
            .timeout(GET_TIMEOUT)
            .send()
            .await?;
        let envelope = self.read_envelope(response).await?;
        let data_url = envelope
            .data
            .as_str()
            .ok_or_else(|| ClientError::Protocol("captcha payload missing".to_string()))?;
        let payload = captcha_payload(data_url)?;
        B64.decode(payload.as_bytes())
            .map_err(|err| ClientError::Protocol(format!("captcha payload is not base64: {err}")))
    }
}

/// Extract the base64 payload of a `data:image/...;base64,<payload>` URL.
fn captcha_payload(data_url: &str) -> Result<&str, ClientError> {
    let payload = data_url.rsplit(',').next().unwrap_or_default();
    if payload.is_empty() {
        return Err(ClientError::Protocol(
            "captcha payload is empty".to_string(),
        ));
    }
    Ok(payload)
}

fn classify_registration_error(username: &str, message: &str) -> ClientError {
    if message.contains("Username already exists") {
        ClientError::AccountExists(username.to_string())
    } else if message.contains("Invalid captcha") {
        ClientError::Captcha("captcha solution was incorrect".to_string())
    } else {
        ClientError::Server(format!("registration failed: {message}"))
    }
}

#[async_trait]
impl JudgeClient for OjClient {
    async fn register(
        &self,
        username: &str,
        password: &str,
        email: &str,
    ) -> Result<(), ClientError> {
        self.refresh_csrf().await?;
        let image = self.fetch_captcha_image().await?;
        let captcha = self.solver.solve(&image).await?;

        let response = self
            .with_csrf(self.http.post(self.url("/api/register")?))
            .timeout(POST_TIMEOUT)
            .json(&RegisterRequest {
                username,
                password,
                email,
                captcha: &captcha,
            })
            .send()
            .await?;
        let envelope = self.read_envelope(response).await?;
        if envelope.error.is_some() {
            return Err(classify_registration_error(username, &envelope.data_message()));
        }
        Ok(())
    }

    async fn login(&self, username: &str, password: &str) -> Result<(), ClientError> {
        self.refresh_csrf().await?;

        let response = self
            .with_csrf(self.http.post(self.url("/api/login")?))
            .timeout(POST_TIMEOUT)
            .json(&LoginRequest { username, password })
            .send()
            .await?;
        let envelope = self.read_envelope(response).await?;
        if envelope.error.is_some() {
            let message = envelope.data_message();
            if message.contains("User does not exist or password is not correct") {
                return Err(ClientError::Credential(message));
            }
            return Err(ClientError::Server(format!("login failed: {message}")));
        }

        // A non-error response without a session cookie means the login did
        // not actually take; report it client-side rather than proceed.
        if self.cookie("sessionid").is_none() {
            return Err(ClientError::Protocol(
                "login response carried no session cookie".to_string(),
            ));
        }
        self.remember_csrf();
        Ok(())
    }

    async fn submit_code(
        &self,
        code: &str,
        language: &str,
        problem_id: i64,
    ) -> Result<String, ClientError> {
        let problem_id = problem_id.to_string();
        let form = [
            ("code", code),
            ("language", language),
            ("problem_id", problem_id.as_str()),
        ];
        let response = self
            .with_csrf(self.http.post(self.url("/api/submission")?))
            .timeout(POST_TIMEOUT)
            .form(&form)
            .send()
            .await?;
        let envelope = self.read_envelope(response).await?;
        if let Some(error) = &envelope.error {
            return Err(ClientError::Server(format!(
                "submission rejected: {error} {}",
                envelope.data_message()
            )));
        }

        let id = envelope.data.get("submission_id");
        match id.and_then(|v| {
            v.as_str()
                .map(str::to_string)
                .or_else(|| v.as_i64().map(|n| n.to_string()))
        }) {
            Some(id) => Ok(id),
            None => Err(ClientError::Protocol(
                "submission response carried no submission_id".to_string(),
            )),
        }
    }

    async fn get_submission(&self, submission_id: &str) -> Result<SubmissionRecord, ClientError> {
        let response = self
            .http
            .get(self.url("/api/submission")?)
            .query(&[("id", submission_id)])
            .timeout(GET_TIMEOUT)
            .send()
            .await?;
        let envelope = self.read_envelope(response).await?;
        if let Some(error) = &envelope.error {
            return Err(ClientError::Server(format!(
                "submission query failed: {error} {}",
                envelope.data_message()
            )));
        }

        let data: SubmissionData = serde_json::from_value(envelope.data)
            .map_err(|err| ClientError::Protocol(format!("malformed submission record: {err}")))?;
        let result = data
            .result
            .ok_or_else(|| ClientError::Protocol("submission record has no result".to_string()))?;
        Ok(SubmissionRecord {
            verdict: Verdict::from_wire(result)?,
            memory_cost: data.statistic_info.memory_cost,
        })
    }
}
