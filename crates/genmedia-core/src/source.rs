//! Loads source images referenced by a request.

use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use genmedia_types::{SourceRef, mime};
use tracing::debug;

use crate::error::{ErrorContext, MediaError, from_transport};

/// Prefix callers often copy from public media URLs.
const MEDIA_PREFIX: &str = "pub/media/";

/// Source bytes plus the MIME type sent to the provider.
#[derive(Debug, Clone)]
pub struct SourceImage {
    pub bytes: Bytes,
    pub mime_type: String,
    /// Where the bytes came from, for diagnostics.
    pub origin: String,
}

#[derive(Debug, Clone)]
pub struct SourceLoader {
    media_root: PathBuf,
    client: reqwest::Client,
    timeout: Duration,
}

impl SourceLoader {
    pub fn new(media_root: impl Into<PathBuf>, client: reqwest::Client, timeout: Duration) -> Self {
        Self {
            media_root: media_root.into(),
            client,
            timeout,
        }
    }

    /// Resolve a local reference against the media root. Absolute paths are
    /// kept; a leading `pub/media/` is stripped from relative ones.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            return path.to_path_buf();
        }
        let relative = path.strip_prefix(MEDIA_PREFIX).unwrap_or(path);
        self.media_root.join(relative)
    }

    pub async fn load(&self, source: &SourceRef) -> Result<SourceImage, MediaError> {
        match source {
            SourceRef::Local(path) => self.load_local(path).await,
            SourceRef::Remote(url) => self.load_remote(url).await,
        }
    }

    async fn load_local(&self, path: &Path) -> Result<SourceImage, MediaError> {
        let resolved = self.resolve(path);
        let bytes = match tokio::fs::read(&resolved).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == IoErrorKind::NotFound => {
                return Err(MediaError::validation(format!(
                    "source image not found: {}",
                    resolved.display()
                )));
            }
            Err(e) => {
                return Err(MediaError::validation(format!(
                    "source image {} is unreadable: {e}",
                    resolved.display()
                )));
            }
        };
        if bytes.is_empty() {
            return Err(MediaError::validation(format!(
                "source image is empty: {}",
                resolved.display()
            )));
        }

        let ext = resolved.extension().and_then(|e| e.to_str());
        let mime_type = detect_mime(ext, &bytes);
        debug!(path = %resolved.display(), bytes = bytes.len(), mime_type, "loaded local source");
        Ok(SourceImage {
            bytes: Bytes::from(bytes),
            mime_type: mime_type.to_owned(),
            origin: resolved.display().to_string(),
        })
    }

    async fn load_remote(&self, url: &str) -> Result<SourceImage, MediaError> {
        let response = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| from_transport(&e, "source download"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(MediaError::download(
                format!("source {url} returned HTTP {}", status.as_u16()),
                ErrorContext::with_status(status.as_u16()),
            ));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| from_transport(&e, "source download"))?;
        if bytes.is_empty() {
            return Err(MediaError::download(
                format!("source {url} returned an empty body"),
                ErrorContext::with_status(status.as_u16()),
            ));
        }

        let ext = reqwest::Url::parse(url).ok().and_then(|u| {
            Path::new(u.path())
                .extension()
                .and_then(|e| e.to_str())
                .map(str::to_owned)
        });
        let mime_type = detect_mime(ext.as_deref(), &bytes);
        debug!(url, bytes = bytes.len(), mime_type, "downloaded remote source");
        Ok(SourceImage {
            bytes,
            mime_type: mime_type.to_owned(),
            origin: url.to_owned(),
        })
    }
}

/// Extension first, then magic bytes, then JPEG.
fn detect_mime(ext: Option<&str>, bytes: &[u8]) -> &'static str {
    ext.and_then(mime::mime_for_extension)
        .filter(|m| mime::is_media(m))
        .or_else(|| mime::sniff(bytes).filter(|m| mime::is_media(m)))
        .unwrap_or(mime::IMAGE_JPEG)
}

#[cfg(test)]
mod tests {
    use super::*;
    use genmedia_types::ErrorKind;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\x00\x00\x00\x0dIHDR";

    fn loader(root: &Path) -> SourceLoader {
        SourceLoader::new(root, reqwest::Client::new(), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn local_paths_resolve_against_media_root() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("catalog")).unwrap();
        std::fs::write(dir.path().join("catalog/a.png"), PNG).unwrap();
        let loader = loader(dir.path());

        let plain = loader.load(&SourceRef::parse("catalog/a.png")).await.unwrap();
        let prefixed = loader
            .load(&SourceRef::parse("pub/media/catalog/a.png"))
            .await
            .unwrap();
        assert_eq!(plain.bytes, prefixed.bytes);
        assert_eq!(plain.mime_type, mime::IMAGE_PNG);
    }

    #[tokio::test]
    async fn missing_local_source_is_a_validation_error() {
        let dir = TempDir::new().unwrap();
        let err = loader(dir.path())
            .load(&SourceRef::parse("nope.jpg"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn unknown_extension_falls_back_to_magic_then_jpeg() {
        assert_eq!(detect_mime(Some("dat"), PNG), mime::IMAGE_PNG);
        assert_eq!(detect_mime(None, b"whatever"), mime::IMAGE_JPEG);
        assert_eq!(detect_mime(Some("WEBP"), b""), mime::IMAGE_WEBP);
    }

    #[tokio::test]
    async fn remote_sources_are_downloaded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/img/look.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(PNG))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/img/gone.png"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let loader = loader(dir.path());
        let ok = loader
            .load(&SourceRef::parse(&format!("{}/img/look.png", server.uri())))
            .await
            .unwrap();
        assert_eq!(ok.bytes.as_ref(), PNG);
        assert_eq!(ok.mime_type, mime::IMAGE_PNG);

        let err = loader
            .load(&SourceRef::parse(&format!("{}/img/gone.png", server.uri())))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DownloadFailure);
        assert_eq!(err.context().and_then(|c| c.http_status), Some(404));
    }
}
