//! Known shapes of a completed provider payload.
//!
//! Each shape has its own typed parser. A payload matching none of them is
//! [`ResponseShape::Unknown`] and surfaces as `MediaError::Unknown` with the
//! raw JSON attached.

use genmedia_types::mime;
use serde::Deserialize;
use serde_json::Value;

use super::ArtifactRef;
use crate::classify::truncate;
use crate::error::MediaError;

/// One generated sample as the provider reports it.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Sample {
    uri: Option<String>,
    bytes_base64_encoded: Option<String>,
    data: Option<String>,
    #[serde(alias = "mime_type")]
    mime_type: Option<String>,
}

impl Sample {
    fn into_ref(self, default_mime: Option<&str>) -> Option<ArtifactRef> {
        let mime_type = self
            .mime_type
            .filter(|m| !m.is_empty())
            .or_else(|| default_mime.map(str::to_owned));
        if let Some(encoded) = self
            .bytes_base64_encoded
            .or(self.data)
            .filter(|e| !e.is_empty())
        {
            return Some(ArtifactRef::Inline { encoded, mime_type });
        }
        self.uri
            .filter(|u| !u.is_empty())
            .map(|uri| ArtifactRef::Remote { uri, mime_type })
    }
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(rename = "inlineData", alias = "inline_data")]
    inline_data: Option<Sample>,
}

/// Closed set of completed-payload shapes.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseShape {
    /// `response.generateVideoResponse.generatedSamples[0].video`
    VideoSamples(ArtifactRef),
    /// `response.generateImageResponse.generatedSamples[0].image`
    ImageSamples(ArtifactRef),
    /// `candidates[0].content.parts[*].inlineData`, at the root or under `response`
    InlineParts(ArtifactRef),
    /// `response.predictions[0]`
    Predictions(ArtifactRef),
    Unknown(Value),
}

impl ResponseShape {
    /// Try each known shape in turn.
    pub fn parse(payload: &Value) -> Self {
        if let Some(r) = parse_video_samples(payload) {
            return ResponseShape::VideoSamples(r);
        }
        if let Some(r) = parse_image_samples(payload) {
            return ResponseShape::ImageSamples(r);
        }
        if let Some(r) = parse_inline_parts(payload) {
            return ResponseShape::InlineParts(r);
        }
        if let Some(r) = parse_predictions(payload) {
            return ResponseShape::Predictions(r);
        }
        ResponseShape::Unknown(payload.clone())
    }

    pub fn into_artifact_ref(self) -> Result<ArtifactRef, MediaError> {
        match self {
            ResponseShape::VideoSamples(r)
            | ResponseShape::ImageSamples(r)
            | ResponseShape::InlineParts(r)
            | ResponseShape::Predictions(r) => Ok(r),
            ResponseShape::Unknown(raw) => Err(MediaError::unknown(
                "completed payload matches no known response shape",
                truncate(&raw.to_string()),
            )),
        }
    }
}

fn sample_at(payload: &Value, pointer: &str) -> Option<Sample> {
    payload
        .pointer(pointer)
        .and_then(|v| Sample::deserialize(v).ok())
}

fn parse_video_samples(payload: &Value) -> Option<ArtifactRef> {
    sample_at(payload, "/response/generateVideoResponse/generatedSamples/0/video")?
        .into_ref(Some(mime::VIDEO_MP4))
}

fn parse_image_samples(payload: &Value) -> Option<ArtifactRef> {
    sample_at(payload, "/response/generateImageResponse/generatedSamples/0/image")?
        .into_ref(None)
}

fn parse_inline_parts(payload: &Value) -> Option<ArtifactRef> {
    let roots = [Some(payload), payload.get("response")];
    roots.into_iter().flatten().find_map(|root| {
        let parts = root.pointer("/candidates/0/content/parts")?;
        let parts: Vec<Part> = Vec::deserialize(parts).ok()?;
        parts
            .into_iter()
            .filter_map(|p| p.inline_data)
            .find_map(|sample| sample.into_ref(None))
    })
}

fn parse_predictions(payload: &Value) -> Option<ArtifactRef> {
    sample_at(payload, "/response/predictions/0")?.into_ref(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn video_sample_uri() {
        let payload = json!({"done": true, "response": {"generateVideoResponse": {
            "generatedSamples": [{"video": {"uri": "https://files.example/v.mp4"}}]
        }}});
        assert_eq!(
            ResponseShape::parse(&payload),
            ResponseShape::VideoSamples(ArtifactRef::Remote {
                uri: "https://files.example/v.mp4".into(),
                mime_type: Some(mime::VIDEO_MP4.into()),
            })
        );
    }

    #[test]
    fn image_sample_with_inline_data() {
        let payload = json!({"done": true, "response": {"generateImageResponse": {
            "generatedSamples": [{"image": {"data": "iVBORw0KGgo=", "mime_type": "image/png"}}]
        }}});
        assert_eq!(
            ResponseShape::parse(&payload),
            ResponseShape::ImageSamples(ArtifactRef::Inline {
                encoded: "iVBORw0KGgo=".into(),
                mime_type: Some("image/png".into()),
            })
        );
    }

    #[test]
    fn candidate_parts_skip_text_parts() {
        let payload = json!({"candidates": [{"content": {"parts": [
            {"text": "here you go"},
            {"inlineData": {"mimeType": "image/png", "data": "AAAA"}}
        ]}}]});
        assert!(matches!(
            ResponseShape::parse(&payload),
            ResponseShape::InlineParts(ArtifactRef::Inline { ref encoded, .. }) if encoded == "AAAA"
        ));

        let nested = json!({"response": payload});
        assert!(matches!(ResponseShape::parse(&nested), ResponseShape::InlineParts(_)));
    }

    #[test]
    fn predictions_with_base64() {
        let payload = json!({"response": {"predictions": [
            {"bytesBase64Encoded": "AAAA", "mimeType": "video/mp4"}
        ]}});
        assert!(matches!(ResponseShape::parse(&payload), ResponseShape::Predictions(_)));
    }

    #[test]
    fn unrecognised_payload_is_unknown_with_raw() {
        let payload = json!({"done": true, "response": {"somethingNew": {}}});
        let shape = ResponseShape::parse(&payload);
        assert!(matches!(shape, ResponseShape::Unknown(_)));

        let err = shape.into_artifact_ref().unwrap_err();
        assert_eq!(err.kind(), genmedia_types::ErrorKind::Unknown);
        assert!(err.context().unwrap().raw.as_deref().unwrap().contains("somethingNew"));
    }

    #[test]
    fn empty_sample_is_not_a_match() {
        let payload = json!({"response": {"generateVideoResponse": {
            "generatedSamples": [{"video": {}}]
        }}});
        assert!(matches!(ResponseShape::parse(&payload), ResponseShape::Unknown(_)));
    }
}
