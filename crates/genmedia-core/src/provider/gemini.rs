use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use genmedia_types::MediaKind;
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::response::ResponseShape;
use super::{ArtifactRef, GenerationProvider, JobHandle, JobRequest, JobState, Submission};
use crate::classify::{classify, safety_blocked, safety_reasons, truncate};
use crate::error::{ErrorContext, MediaError, from_transport};

pub(crate) const API_KEY_HEADER: &str = "x-goog-api-key";

/// Gemini / Veo REST client.
///
/// Video uses `:predictLongRunning` and is polled by operation name; image
/// uses `:generateContent`, which answers synchronously.
#[derive(Debug, Clone)]
pub struct GeminiProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    video_model: String,
    image_model: String,
    timeout: Duration,
}

impl GeminiProvider {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        video_model: impl Into<String>,
        image_model: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            api_key: api_key.into(),
            video_model: video_model.into(),
            image_model: image_model.into(),
            timeout,
        }
    }

    fn endpoint(&self, model: &str, method: &str) -> String {
        format!("{}/models/{model}:{method}", self.base_url)
    }

    /// POST `body` and return the parsed JSON, classifying any failure.
    async fn post(&self, url: &str, body: &Value) -> Result<Value, MediaError> {
        debug!(url, "provider request");
        let response = self
            .client
            .post(url)
            .header(API_KEY_HEADER, &self.api_key)
            .timeout(self.timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| from_transport(&e, "provider submission"))?;
        read_json(response).await
    }

    async fn submit_video(&self, job: &JobRequest) -> Result<Submission, MediaError> {
        let payload = video_payload(job);
        let data = self
            .post(&self.endpoint(&self.video_model, "predictLongRunning"), &payload)
            .await?;

        let Some(name) = data.get("name").and_then(Value::as_str) else {
            return Err(MediaError::unknown(
                "submission response carries no operation name",
                truncate(&data.to_string()),
            ));
        };
        let handle = JobHandle::new(name);

        // Some deployments finish tiny jobs inside the submit call.
        if data.get("done").and_then(Value::as_bool).unwrap_or(false) {
            return match interpret_done(&data).map_err(|e| e.with_job(name))? {
                JobState::Completed(artifact) => Ok(Submission::Completed(artifact)),
                JobState::Failed { raw } | JobState::Blocked { raw } => {
                    Err(classify(None, &raw).with_job(name))
                }
                JobState::Running => Ok(Submission::Pending(handle)),
            };
        }
        Ok(Submission::Pending(handle))
    }

    async fn submit_image(&self, job: &JobRequest) -> Result<Submission, MediaError> {
        let payload = image_payload(job);
        let data = self
            .post(&self.endpoint(&self.image_model, "generateContent"), &payload)
            .await?;

        if let Some(reasons) = safety_reasons(&data) {
            return Err(safety_blocked(
                reasons,
                ErrorContext::with_raw(truncate(&data.to_string())),
            ));
        }
        ResponseShape::parse(&data)
            .into_artifact_ref()
            .map(Submission::Completed)
    }
}

#[async_trait]
impl GenerationProvider for GeminiProvider {
    async fn submit(&self, job: &JobRequest) -> Result<Submission, MediaError> {
        match job.kind {
            MediaKind::Video => self.submit_video(job).await,
            MediaKind::Image => self.submit_image(job).await,
            MediaKind::Resize => Err(MediaError::validation(
                "resize requests are not provider jobs",
            )),
        }
    }

    async fn status(&self, handle: &JobHandle) -> Result<JobState, MediaError> {
        let url = format!("{}/{}", self.base_url, handle.as_str().trim_start_matches('/'));
        let response = self
            .client
            .get(&url)
            .header(API_KEY_HEADER, &self.api_key)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| from_transport(&e, "status check"))?;
        let data = read_json(response).await?;

        if !data.get("done").and_then(Value::as_bool).unwrap_or(false) {
            return Ok(JobState::Running);
        }
        interpret_done(&data)
    }
}

/// Turn a `done: true` operation into a terminal state.
fn interpret_done(data: &Value) -> Result<JobState, MediaError> {
    if safety_reasons(data).is_some() {
        return Ok(JobState::Blocked {
            raw: data.to_string(),
        });
    }
    if data.get("error").is_some() {
        return Ok(JobState::Failed {
            raw: data.to_string(),
        });
    }
    ResponseShape::parse(data)
        .into_artifact_ref()
        .map(JobState::Completed)
}

async fn read_json(response: reqwest::Response) -> Result<Value, MediaError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| from_transport(&e, "reading provider response"))?;

    if !status.is_success() {
        warn!(status = status.as_u16(), "provider returned an error status");
        return Err(classify(Some(status.as_u16()), &body));
    }
    serde_json::from_str(&body).map_err(|e| MediaError::Unknown {
        message: format!("provider response is not JSON: {e}"),
        context: ErrorContext {
            http_status: Some(status.as_u16()),
            raw: Some(truncate(&body)),
            ..ErrorContext::default()
        },
    })
}

fn encode(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// `{ instances: [{ prompt, image, image2? }], parameters }`
fn video_payload(job: &JobRequest) -> Value {
    let mut instance = serde_json::Map::new();
    instance.insert("prompt".into(), Value::from(job.prompt.as_str()));
    for (idx, source) in job.sources.iter().enumerate() {
        let field = if idx == 0 {
            "image".to_owned()
        } else {
            format!("image{}", idx + 1)
        };
        instance.insert(
            field,
            json!({
                "bytesBase64Encoded": encode(&source.bytes),
                "mimeType": source.mime_type,
            }),
        );
    }
    json!({
        "instances": [Value::Object(instance)],
        "parameters": Value::Object(job.parameters.clone()),
    })
}

/// `{ contents: [{ parts: [text, inlineData...] }], generationConfig }`
fn image_payload(job: &JobRequest) -> Value {
    let mut parts = vec![json!({ "text": job.prompt })];
    parts.extend(job.sources.iter().map(|source| {
        json!({
            "inlineData": {
                "mimeType": source.mime_type,
                "data": encode(&source.bytes),
            }
        })
    }));

    let mut generation_config = json!({ "responseModalities": ["TEXT", "IMAGE"] });
    if let Some(ratio) = job.aspect_ratio() {
        generation_config["imageConfig"] = json!({ "aspectRatio": ratio });
    }
    json!({
        "contents": [{ "parts": parts }],
        "generationConfig": generation_config,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceImage;
    use bytes::Bytes;
    use genmedia_types::ErrorKind;
    use serde_json::Map;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> GeminiProvider {
        GeminiProvider::new(
            reqwest::Client::new(),
            server.uri(),
            "test-key",
            "veo-test",
            "image-test",
            Duration::from_secs(5),
        )
    }

    fn job(kind: MediaKind, sources: usize) -> JobRequest {
        let mut parameters = Map::new();
        parameters.insert("aspectRatio".into(), Value::from("16:9"));
        JobRequest {
            kind,
            prompt: "make it summer".into(),
            sources: (0..sources)
                .map(|i| SourceImage {
                    bytes: Bytes::from(vec![0xff, 0xd8, 0xff, i as u8]),
                    mime_type: "image/jpeg".into(),
                    origin: format!("{i}.jpg"),
                })
                .collect(),
            parameters,
        }
    }

    #[test]
    fn video_payload_carries_second_image() {
        let payload = video_payload(&job(MediaKind::Video, 2));
        let instance = &payload["instances"][0];
        assert_eq!(instance["prompt"], "make it summer");
        assert_eq!(instance["image"]["mimeType"], "image/jpeg");
        assert!(instance["image2"]["bytesBase64Encoded"].is_string());
        assert_eq!(payload["parameters"]["aspectRatio"], "16:9");
    }

    #[test]
    fn image_payload_puts_text_first() {
        let payload = image_payload(&job(MediaKind::Image, 1));
        let parts = payload["contents"][0]["parts"].as_array().unwrap();
        assert_eq!(parts[0]["text"], "make it summer");
        assert_eq!(parts[1]["inlineData"]["mimeType"], "image/jpeg");
        assert_eq!(payload["generationConfig"]["imageConfig"]["aspectRatio"], "16:9");
    }

    #[tokio::test]
    async fn video_submission_returns_operation_handle() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/veo-test:predictLongRunning"))
            .and(header(API_KEY_HEADER, "test-key"))
            .and(body_partial_json(json!({"instances": [{"prompt": "make it summer"}]})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"name": "operations/abc"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let submission = provider(&server)
            .submit(&job(MediaKind::Video, 1))
            .await
            .unwrap();
        assert_eq!(submission, Submission::Pending(JobHandle::new("operations/abc")));
    }

    #[tokio::test]
    async fn submission_failures_are_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_json(json!({
                "error": {"code": 429, "status": "RESOURCE_EXHAUSTED", "message": "quota"}
            })))
            .mount(&server)
            .await;

        let err = provider(&server)
            .submit(&job(MediaKind::Video, 1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QuotaExceeded);
        assert_eq!(err.context().and_then(|c| c.http_status), Some(429));
    }

    #[tokio::test]
    async fn image_submission_completes_synchronously() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/image-test:generateContent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{"content": {"parts": [
                    {"inlineData": {"mimeType": "image/png", "data": "iVBORw0KGgo="}}
                ]}, "finishReason": "STOP"}]
            })))
            .mount(&server)
            .await;

        let submission = provider(&server)
            .submit(&job(MediaKind::Image, 2))
            .await
            .unwrap();
        assert_eq!(
            submission,
            Submission::Completed(ArtifactRef::Inline {
                encoded: "iVBORw0KGgo=".into(),
                mime_type: Some("image/png".into()),
            })
        );
    }

    #[tokio::test]
    async fn image_safety_block_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "promptFeedback": {"blockReason": "PROHIBITED_CONTENT"}
            })))
            .mount(&server)
            .await;

        let err = provider(&server)
            .submit(&job(MediaKind::Image, 1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SafetyBlocked);
    }

    #[tokio::test]
    async fn status_maps_operation_states() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/operations/running"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"name": "operations/running"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/operations/failed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "done": true, "error": {"code": 13, "message": "boom"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/operations/blocked"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "done": true,
                "response": {"generateVideoResponse": {"raiMediaFilteredReasons": ["SAFETY"]}}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/operations/weird"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"done": true, "response": {}})))
            .mount(&server)
            .await;

        let p = provider(&server);
        assert_eq!(p.status(&JobHandle::new("operations/running")).await.unwrap(), JobState::Running);
        assert!(matches!(
            p.status(&JobHandle::new("operations/failed")).await.unwrap(),
            JobState::Failed { .. }
        ));
        assert!(matches!(
            p.status(&JobHandle::new("operations/blocked")).await.unwrap(),
            JobState::Blocked { .. }
        ));
        let err = p.status(&JobHandle::new("operations/weird")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unknown);
    }
}
