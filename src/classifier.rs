use async_trait::async_trait;
use url::Url;

use crate::models::ScrapeOutcome;
use crate::network::{FetchError, HttpClient};
use crate::parser::{parse_profile, ProfilePage};

/// Turns one ID into exactly one outcome. Never retries.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, id: u64) -> ScrapeOutcome;
}

/// Fetches `<base_url><id>/` and classifies the response.
pub struct ProfileClassifier {
    client: HttpClient,
    base_url: String,
    referer: String,
}

impl ProfileClassifier {
    /// `base_url` must be an absolute http(s) URL; a trailing slash is added if missing.
    pub fn new(client: HttpClient, base_url: &str) -> Result<Self, url::ParseError> {
        let mut base_url = base_url.to_string();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        let parsed = Url::parse(&base_url)?;
        let referer = format!("{}://{}/", parsed.scheme(), parsed.host_str().unwrap_or_default());

        Ok(Self {
            client,
            base_url,
            referer,
        })
    }

    pub fn profile_url(&self, id: u64) -> String {
        format!("{}{}/", self.base_url, id)
    }
}

#[async_trait]
impl Classifier for ProfileClassifier {
    async fn classify(&self, id: u64) -> ScrapeOutcome {
        let url = self.profile_url(id);
        match self.client.fetch(&url, &self.referer).await {
            Ok(result) => {
                let outcome = classify_response(id, result.status_code, &result.content);
                match &outcome {
                    ScrapeOutcome::RateLimited => tracing::warn!(id, "Rate limited (429)"),
                    ScrapeOutcome::ServerError { code } => {
                        tracing::warn!(id, code, "Server error")
                    }
                    _ => {}
                }
                outcome
            }
            Err(FetchError::Timeout) => {
                tracing::debug!(id, "Request timed out");
                ScrapeOutcome::Timeout
            }
            Err(e) => {
                tracing::warn!(id, "Fetch failed: {}", e);
                ScrapeOutcome::Fatal {
                    reason: e.to_string(),
                }
            }
        }
    }
}

/// Status-code classification, then page parsing for successful responses.
pub fn classify_response(id: u64, status_code: u16, body: &str) -> ScrapeOutcome {
    match status_code {
        404 => ScrapeOutcome::NotFound,
        429 => ScrapeOutcome::RateLimited,
        200..=299 => match parse_profile(id, body) {
            ProfilePage::Profile(profile) => ScrapeOutcome::Found(profile),
            ProfilePage::NotFound => ScrapeOutcome::NotFound,
        },
        code => ScrapeOutcome::ServerError { code },
    }
}
