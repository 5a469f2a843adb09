//! Resolves a completed job's [`ArtifactRef`] into bytes.
//!
//! Redirects are followed by hand (the client is built with
//! `redirect::Policy::none()`) so every hop is logged and the credential
//! placement per hop is explicit:
//!
//! * query: `key=` is appended to URLs on the provider's own origin only;
//! * header: `x-goog-api-key` goes on the first request and on later hops
//!   according to [`RedirectCredentials`].

use std::time::Duration;

use base64::Engine as _;
use genmedia_types::{Artifact, mime};
use reqwest::Url;
use reqwest::header::{CONTENT_TYPE, LOCATION};
use tracing::{debug, info, warn};

use crate::classify::truncate;
use crate::config::RedirectCredentials;
use crate::error::{ErrorContext, MediaError, from_transport};
use crate::provider::{API_KEY_HEADER, ArtifactRef};

#[derive(Debug, Clone)]
pub struct ResultFetcher {
    client: reqwest::Client,
    api_key: Option<String>,
    /// Provider API base; only its origin ever receives `key=`.
    provider_url: Option<Url>,
    max_redirects: usize,
    credentials: RedirectCredentials,
    timeout: Duration,
    verify_signature: bool,
}

impl ResultFetcher {
    /// `client` must not follow redirects on its own.
    pub fn new(client: reqwest::Client, provider_base_url: &str, api_key: Option<String>) -> Self {
        Self {
            client,
            api_key,
            provider_url: Url::parse(provider_base_url).ok(),
            max_redirects: 5,
            credentials: RedirectCredentials::SameHost,
            timeout: Duration::from_secs(300),
            verify_signature: true,
        }
    }

    pub fn with_max_redirects(mut self, max_redirects: usize) -> Self {
        self.max_redirects = max_redirects;
        self
    }

    pub fn with_credentials(mut self, credentials: RedirectCredentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_signature_check(mut self, verify: bool) -> Self {
        self.verify_signature = verify;
        self
    }

    pub async fn fetch(&self, artifact: &ArtifactRef) -> Result<Artifact, MediaError> {
        match artifact {
            ArtifactRef::Inline { encoded, mime_type } => {
                let bytes = decode_inline(encoded)?;
                debug!(bytes = bytes.len(), "decoded inline artifact");
                self.accept(bytes, mime_type.as_deref(), ErrorContext::default())
            }
            ArtifactRef::Remote { uri, mime_type } => self.download(uri, mime_type.as_deref()).await,
        }
    }

    fn is_provider(&self, url: &Url) -> bool {
        self.provider_url
            .as_ref()
            .is_some_and(|base| base.origin() == url.origin())
    }

    fn with_query_key(&self, mut url: Url) -> Url {
        if let Some(key) = &self.api_key {
            if self.is_provider(&url) && !url.query_pairs().any(|(k, _)| k == "key") {
                url.query_pairs_mut().append_pair("key", key);
            }
        }
        url
    }

    fn send_header(&self, hop: usize, url: &Url) -> bool {
        if self.api_key.is_none() {
            return false;
        }
        if hop == 0 {
            return true;
        }
        match self.credentials {
            RedirectCredentials::Always => true,
            RedirectCredentials::SameHost => self.is_provider(url),
            RedirectCredentials::Never => false,
        }
    }

    async fn download(&self, uri: &str, expected: Option<&str>) -> Result<Artifact, MediaError> {
        let mut current = Url::parse(uri).map_err(|e| {
            MediaError::download(format!("invalid artifact URI {uri}: {e}"), ErrorContext::default())
        })?;

        for hop in 0..=self.max_redirects {
            let url = self.with_query_key(current.clone());
            let mut request = self.client.get(url.clone()).timeout(self.timeout);
            let with_header = self.send_header(hop, &url);
            if let (true, Some(key)) = (with_header, &self.api_key) {
                request = request.header(API_KEY_HEADER, key);
            }

            let response = request
                .send()
                .await
                .map_err(|e| from_transport(&e, "artifact download"))?;
            let status = response.status();

            if status.is_redirection() {
                let Some(location) = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                else {
                    return Err(MediaError::download(
                        format!("HTTP {} redirect without a Location header", status.as_u16()),
                        ErrorContext::with_status(status.as_u16()),
                    ));
                };
                let next = current.join(location).map_err(|e| {
                    MediaError::download(
                        format!("unusable redirect target {location}: {e}"),
                        ErrorContext::with_status(status.as_u16()),
                    )
                })?;
                debug!(
                    hop,
                    status = status.as_u16(),
                    from = %redact(&url),
                    to = %redact(&next),
                    credential_header = with_header,
                    "following redirect"
                );
                current = next;
                continue;
            }

            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(mime::essence);
            let body = response
                .bytes()
                .await
                .map_err(|e| from_transport(&e, "artifact download"))?;

            if !status.is_success() {
                return Err(MediaError::download(
                    format!("artifact download returned HTTP {}", status.as_u16()),
                    ErrorContext {
                        http_status: Some(status.as_u16()),
                        raw: Some(truncate(&String::from_utf8_lossy(&body))),
                        ..ErrorContext::default()
                    },
                ));
            }

            info!(
                url = %redact(&url),
                hops = hop,
                bytes = body.len(),
                "artifact downloaded"
            );
            let expected = expected
                .map(str::to_owned)
                .or(content_type.filter(|c| mime::is_media(c)));
            return self.accept(
                body.to_vec(),
                expected.as_deref(),
                ErrorContext::with_status(status.as_u16()),
            );
        }

        Err(MediaError::download(
            format!("too many redirects (limit {})", self.max_redirects),
            ErrorContext::default(),
        ))
    }

    /// Non-empty check plus magic-byte validation against `expected`.
    fn accept(
        &self,
        bytes: Vec<u8>,
        expected: Option<&str>,
        context: ErrorContext,
    ) -> Result<Artifact, MediaError> {
        if bytes.is_empty() {
            return Err(MediaError::download("artifact payload is empty", context));
        }

        let sniffed = mime::sniff(&bytes);
        if let Some(kind @ (mime::APPLICATION_JSON | mime::TEXT_HTML)) = sniffed {
            return Err(MediaError::download(
                format!("expected media but received {kind}"),
                ErrorContext {
                    raw: Some(truncate(&String::from_utf8_lossy(&bytes))),
                    ..context
                },
            ));
        }

        let expected = expected.filter(|m| mime::is_media(m));
        if self.verify_signature {
            match (expected, sniffed) {
                (Some(want), Some(got)) if mime::extension_for(want) != mime::extension_for(got) => {
                    return Err(MediaError::download(
                        format!("payload signature is {got} but {want} was expected"),
                        context,
                    ));
                }
                (_, None) => {
                    warn!(bytes = bytes.len(), "artifact signature not recognised; accepting as-is");
                }
                _ => {}
            }
        }

        let mime_type = sniffed
            .map(str::to_owned)
            .or_else(|| expected.map(mime::essence))
            .unwrap_or_else(|| mime::OCTET_STREAM.to_owned());
        Ok(Artifact::new(bytes, mime_type))
    }
}

fn decode_inline(encoded: &str) -> Result<Vec<u8>, MediaError> {
    use base64::engine::general_purpose::{STANDARD, URL_SAFE};

    let trimmed: String = encoded.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    STANDARD
        .decode(&trimmed)
        .or_else(|_| URL_SAFE.decode(&trimmed))
        .map_err(|e| {
            MediaError::download(
                format!("inline artifact is not valid base64: {e}"),
                ErrorContext::default(),
            )
        })
}

/// URL with any `key=` value masked, for logs.
fn redact(url: &Url) -> String {
    if !url.query_pairs().any(|(k, _)| k == "key") {
        return url.to_string();
    }
    let mut masked = url.clone();
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            let v = if k == "key" { "***".to_owned() } else { v.into_owned() };
            (k.into_owned(), v)
        })
        .collect();
    masked.query_pairs_mut().clear().extend_pairs(pairs);
    masked.to_string()
}

/// HTTP client suitable for [`ResultFetcher`]: no automatic redirects.
pub fn no_redirect_client() -> Result<reqwest::Client, MediaError> {
    reqwest::Client::builder()
        .user_agent(concat!("genmedia/", env!("CARGO_PKG_VERSION")))
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| MediaError::Internal {
            message: format!("failed to build HTTP client: {e}"),
            context: ErrorContext::default(),
        })
}
