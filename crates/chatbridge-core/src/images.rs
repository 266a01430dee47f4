//! Turning image references into bytes the page can ingest.

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::Client;
use std::time::Duration;

const FETCH_TIMEOUT: Duration = Duration::from_secs(15);
const USER_AGENT: &str = "Mozilla/5.0";

/// Binary image plus its mime type, ready for injection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePayload {
    pub data: Vec<u8>,
    pub mime_type: String,
}

impl ImagePayload {
    pub fn new(data: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            data,
            mime_type: mime_type.into(),
        }
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.data)
    }
}

/// Maps an image reference (inline data URI or remote URL) to a payload.
#[async_trait]
pub trait ImageResolver: Send + Sync {
    async fn resolve(&self, reference: &str) -> Result<ImagePayload>;
}

/// Decodes `data:image/...` URIs in-process and fetches `http(s)` URLs.
pub struct HttpImageResolver {
    client: Client,
}

impl HttpImageResolver {
    pub fn new() -> Result<Self> {
        let client = Client::builder().timeout(FETCH_TIMEOUT).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ImageResolver for HttpImageResolver {
    async fn resolve(&self, reference: &str) -> Result<ImagePayload> {
        if reference.starts_with("data:image") {
            return decode_data_uri(reference);
        }
        if !reference.starts_with("http") {
            bail!("Unsupported image reference scheme");
        }

        let response = self
            .client
            .get(reference)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .send()
            .await?;
        if !response.status().is_success() {
            bail!("Image fetch returned {}", response.status());
        }

        let header_mime = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.split(';').next().unwrap_or(value).trim().to_string());
        let data = response.bytes().await?.to_vec();

        Ok(ImagePayload {
            data,
            mime_type: guess_mime(reference, header_mime.as_deref()),
        })
    }
}

/// Decode `data:<mime>;base64,<payload>`.
pub fn decode_data_uri(uri: &str) -> Result<ImagePayload> {
    let (header, encoded) = uri
        .split_once(',')
        .ok_or_else(|| anyhow!("Data URI has no payload"))?;
    let mime_type = header
        .strip_prefix("data:")
        .and_then(|rest| rest.split(';').next())
        .filter(|mime| !mime.is_empty())
        .ok_or_else(|| anyhow!("Data URI has no mime type"))?;

    let cleaned: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    let data = STANDARD.decode(cleaned)?;
    Ok(ImagePayload::new(data, mime_type))
}

fn guess_mime(url: &str, header_mime: Option<&str>) -> String {
    if let Some(mime) = header_mime
        && mime.starts_with("image/")
    {
        return mime.to_string();
    }
    let path = url.split(['?', '#']).next().unwrap_or(url);
    if path.to_ascii_lowercase().ends_with(".png") {
        "image/png".to_string()
    } else {
        "image/jpeg".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_inline_png() {
        let payload = decode_data_uri("data:image/png;base64,aGVs\nbG8=").unwrap();
        assert_eq!(payload.mime_type, "image/png");
        assert_eq!(payload.data, b"hello");
        assert_eq!(payload.to_base64(), "aGVsbG8=");
    }

    #[test]
    fn rejects_data_uri_without_payload() {
        assert!(decode_data_uri("data:image/png;base64").is_err());
    }

    #[test]
    fn mime_prefers_image_content_type() {
        assert_eq!(guess_mime("https://x/a.png", Some("image/webp")), "image/webp");
        assert_eq!(guess_mime("https://x/a.png?s=1", Some("application/octet-stream")), "image/png");
        assert_eq!(guess_mime("https://x/a", None), "image/jpeg");
    }

    #[tokio::test]
    async fn unsupported_scheme_fails() {
        let resolver = HttpImageResolver::new().unwrap();
        assert!(resolver.resolve("ftp://host/a.png").await.is_err());
    }
}
