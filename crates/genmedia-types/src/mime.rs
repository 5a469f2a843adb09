//! MIME type helpers: extension mapping and magic-byte sniffing.

pub const VIDEO_MP4: &str = "video/mp4";
pub const IMAGE_PNG: &str = "image/png";
pub const IMAGE_JPEG: &str = "image/jpeg";
pub const IMAGE_GIF: &str = "image/gif";
pub const IMAGE_WEBP: &str = "image/webp";
pub const APPLICATION_JSON: &str = "application/json";
pub const TEXT_HTML: &str = "text/html";
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Extensions an artifact may be stored under, in lookup order.
pub const ARTIFACT_EXTENSIONS: &[&str] = &["mp4", "png", "jpg", "webp", "gif", "bin"];

/// File extension (without dot) for a MIME type.
pub fn extension_for(mime: &str) -> &'static str {
    match essence(mime).as_str() {
        VIDEO_MP4 => "mp4",
        IMAGE_PNG => "png",
        IMAGE_JPEG | "image/jpg" => "jpg",
        IMAGE_WEBP => "webp",
        IMAGE_GIF => "gif",
        _ => "bin",
    }
}

/// MIME type for a file extension (case-insensitive, dot optional).
pub fn mime_for_extension(ext: &str) -> Option<&'static str> {
    match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
        "mp4" | "m4v" => Some(VIDEO_MP4),
        "png" => Some(IMAGE_PNG),
        "jpg" | "jpeg" => Some(IMAGE_JPEG),
        "webp" => Some(IMAGE_WEBP),
        "gif" => Some(IMAGE_GIF),
        "bin" => Some(OCTET_STREAM),
        _ => None,
    }
}

/// Identify a payload from its leading bytes.
///
/// JSON and HTML are recognised so that provider error pages served with a
/// 200 status are not mistaken for media.
pub fn sniff(bytes: &[u8]) -> Option<&'static str> {
    if bytes.len() >= 8 && &bytes[4..8] == b"ftyp" {
        return Some(VIDEO_MP4);
    }
    if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        return Some(IMAGE_PNG);
    }
    if bytes.starts_with(&[0xff, 0xd8, 0xff]) {
        return Some(IMAGE_JPEG);
    }
    if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        return Some(IMAGE_GIF);
    }
    if bytes.len() >= 12 && bytes.starts_with(b"RIFF") && &bytes[8..12] == b"WEBP" {
        return Some(IMAGE_WEBP);
    }

    let text = bytes
        .iter()
        .skip_while(|b| b.is_ascii_whitespace())
        .take(15)
        .map(|b| b.to_ascii_lowercase())
        .collect::<Vec<u8>>();
    if text.starts_with(b"{") || text.starts_with(b"[") {
        return Some(APPLICATION_JSON);
    }
    if text.starts_with(b"<!doctype html") || text.starts_with(b"<html") {
        return Some(TEXT_HTML);
    }
    None
}

/// Lowercased MIME type without parameters (`image/png; q=1` -> `image/png`).
pub fn essence(mime: &str) -> String {
    mime.split(';').next().unwrap_or("").trim().to_ascii_lowercase()
}

/// Whether the MIME type names image or video media.
pub fn is_media(mime: &str) -> bool {
    let essence = essence(mime);
    essence.starts_with("image/") || essence.starts_with("video/")
}
