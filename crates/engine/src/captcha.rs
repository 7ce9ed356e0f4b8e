//! Captcha recognition handle.
//!
//! The recognizer itself (a neural net) is an external collaborator; this
//! module pins its contract: image bytes in, a 4-character string over the
//! judge's captcha alphabet out. A process-scoped solver is installed once
//! at startup; tests inject their own implementation.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;

use crate::error::ClientError;

/// Glyphs the judge uses in captcha images. Ambiguous glyphs (`0/O`, `1/l`,
/// `i/j`) are intentionally absent.
pub const CAPTCHA_ALPHABET: &str = "abcdefghkmnpqrstuvwxyzABCDEFGHGKMNOPQRSTUVWXYZ23456789";

/// Every captcha solution is exactly this long.
pub const CAPTCHA_LENGTH: usize = 4;

/// A recognizer turning captcha image bytes into the glyph string.
#[async_trait]
pub trait CaptchaSolver: Send + Sync {
    async fn solve(&self, image: &[u8]) -> Result<String, ClientError>;
}

static SOLVER: OnceLock<Arc<dyn CaptchaSolver>> = OnceLock::new();

/// Install the process-wide solver. The first call wins; later calls return
/// `false` and leave the installed solver untouched.
pub fn install(solver: Arc<dyn CaptchaSolver>) -> bool {
    SOLVER.set(solver).is_ok()
}

/// The process-wide solver, or a stand-in that fails every solve when none
/// was installed.
pub fn installed() -> Arc<dyn CaptchaSolver> {
    SOLVER.get().cloned().unwrap_or_else(|| Arc::new(DisabledSolver))
}

/// Placeholder used when no recognizer is configured; registration flows
/// fail with a clear message instead of hanging.
pub struct DisabledSolver;

#[async_trait]
impl CaptchaSolver for DisabledSolver {
    async fn solve(&self, _image: &[u8]) -> Result<String, ClientError> {
        Err(ClientError::Protocol(
            "no captcha recognizer configured (set captcha_service_url)".to_string(),
        ))
    }
}

/// Recognizer reached over HTTP: posts the raw image bytes and expects the
/// glyph string back as plain text.
pub struct HttpSolver {
    http: reqwest::Client,
    endpoint: Url,
}

impl HttpSolver {
    pub fn new(endpoint: Url) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { http, endpoint })
    }
}

#[async_trait]
impl CaptchaSolver for HttpSolver {
    async fn solve(&self, image: &[u8]) -> Result<String, ClientError> {
        let response = self
            .http
            .post(self.endpoint.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(image.to_vec())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ClientError::Transport(format!(
                "captcha recognizer returned http {}",
                response.status()
            )));
        }
        let text = response.text().await?;
        validate_solution(text.trim())
    }
}

/// Check a recognizer answer against the captcha contract.
pub fn validate_solution(text: &str) -> Result<String, ClientError> {
    if text.chars().count() != CAPTCHA_LENGTH {
        return Err(ClientError::Protocol(format!(
            "captcha solution {text:?} is not {CAPTCHA_LENGTH} characters"
        )));
    }
    if let Some(bad) = text.chars().find(|c| !CAPTCHA_ALPHABET.contains(*c)) {
        return Err(ClientError::Protocol(format!(
            "captcha solution contains {bad:?}, outside the recognizer alphabet"
        )));
    }
    Ok(text.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_solutions_over_the_alphabet() {
        assert_eq!(validate_solution("aB2k").expect("valid"), "aB2k");
    }

    #[test]
    fn rejects_wrong_length_and_foreign_glyphs() {
        assert!(validate_solution("abc").is_err());
        assert!(validate_solution("abcde").is_err());
        // '0', '1', 'i', 'l' are excluded from the alphabet.
        assert!(validate_solution("ab0c").is_err());
        assert!(validate_solution("ab1c").is_err());
        assert!(validate_solution("abic").is_err());
    }
}
