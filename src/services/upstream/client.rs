//! HTTP implementation of the upstream
//!
//! One `reqwest` client per egress path. The bypass client routes every
//! request through the configured proxy; the direct client optionally uses a
//! plain HTTP proxy of its own.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, COOKIE};
use reqwest::{Client, Proxy, StatusCode};
use std::time::Duration;

use super::wire::{
    build_prompt, ChatPayload, LineBuffer, TokenDecoder, UploadFileRequest, UploadFileResponse,
    DEFAULT_HEADERS, NEW_CHAT_PATH, UPLOAD_FILE_PATH,
};
use super::{TokenStream, Upstream, UpstreamError, UpstreamRequest};
use crate::config::{EgressSettings, UpstreamSettings};
use crate::services::egress::EgressPath;
use crate::utils::body_preview;

/// Body fragments of an anti-automation challenge page
const CHALLENGE_SIGNATURES: [&str; 3] = ["cf-chl", "challenge-platform", "Just a moment"];

pub struct HttpUpstream {
    direct: Client,
    bypass: Option<Client>,
    settings: UpstreamSettings,
}

impl HttpUpstream {
    pub fn new(
        settings: UpstreamSettings,
        egress: &EgressSettings,
        connect_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let mut direct = Client::builder().connect_timeout(connect_timeout);
        if let Some(proxy) = &egress.http_proxy {
            direct = direct.proxy(Proxy::all(proxy)?);
        }
        let direct = direct.build()?;

        let bypass = egress
            .bypass_proxy_url
            .as_deref()
            .map(|url| -> Result<Client, reqwest::Error> {
                Client::builder()
                    .connect_timeout(connect_timeout)
                    .proxy(Proxy::all(url)?)
                    .build()
            })
            .transpose()?;

        tracing::info!(
            base_url = %settings.base_url,
            direct_proxy = egress.http_proxy.is_some(),
            bypass_available = bypass.is_some(),
            "Initialized upstream client"
        );

        Ok(Self {
            direct,
            bypass,
            settings,
        })
    }

    fn client(&self, egress: EgressPath) -> Result<&Client, UpstreamError> {
        match egress {
            EgressPath::Direct => Ok(&self.direct),
            EgressPath::Bypass => self
                .bypass
                .as_ref()
                .ok_or_else(|| UpstreamError::Fatal("bypass egress is not configured".into())),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.settings.base_url.trim_end_matches('/'), path)
    }

    fn needs_upload(&self, prompt: &str) -> bool {
        self.settings.upload_message || prompt.chars().count() > self.settings.message_chars_limit
    }

    /// Upload the prompt as a text file and return its attachment id
    async fn upload_prompt(
        &self,
        client: &Client,
        headers: &HeaderMap,
        prompt: &str,
    ) -> Result<String, UpstreamError> {
        let request = UploadFileRequest {
            content: STANDARD.encode(prompt.as_bytes()),
            file_mime_type: "text/plain".to_string(),
            file_name: format!("{}.txt", uuid::Uuid::new_v4()),
        };

        let response = client
            .post(self.url(UPLOAD_FILE_PATH))
            .headers(headers.clone())
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_response(response).await?;

        let uploaded: UploadFileResponse = response.json().await.map_err(|e| {
            UpstreamError::Fatal(format!("upload response has no fileMetadataId: {e}"))
        })?;
        Ok(uploaded.file_metadata_id)
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn open(
        &self,
        request: &UpstreamRequest,
        secret: &str,
        egress: EgressPath,
    ) -> Result<TokenStream, UpstreamError> {
        let client = self.client(egress)?;
        let headers = request_headers(secret)?;

        let prompt = build_prompt(
            &self.settings.text_before_prompt,
            &self.settings.text_after_prompt,
            &request.messages,
        );
        let mut payload = ChatPayload::new(prompt, &request.model, self.settings.keep_chat);

        if self.needs_upload(&payload.message) {
            tracing::info!(
                egress = %egress,
                prompt_chars = payload.message.chars().count(),
                "Sending prompt as an attachment"
            );
            let file_id = self.upload_prompt(client, &headers, &payload.message).await?;
            payload.attach(file_id);
        }

        tracing::debug!(egress = %egress, model = %request.model, "Opening upstream conversation");

        let response = client
            .post(self.url(NEW_CHAT_PATH))
            .headers(headers)
            .json(&payload)
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_response(response).await?;

        Ok(token_stream(
            response,
            TokenDecoder::new(self.settings.ignore_thinking),
        ))
    }
}

fn request_headers(secret: &str) -> Result<HeaderMap, UpstreamError> {
    let mut headers = HeaderMap::new();
    for &(name, value) in DEFAULT_HEADERS {
        headers.insert(HeaderName::from_static(name), HeaderValue::from_static(value));
    }

    let mut cookie = HeaderValue::from_str(secret)
        .map_err(|_| UpstreamError::Fatal("credential secret is not a valid header value".into()))?;
    cookie.set_sensitive(true);
    headers.insert(COOKIE, cookie);
    Ok(headers)
}

/// Pass a successful JSON/NDJSON response through, classify anything else
async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, UpstreamError> {
    let status = response.status();
    let is_html = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("text/html"));

    if status.is_success() && !is_html {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let error = classify_status(status, &body);
    tracing::warn!(status = status.as_u16(), class = %error.class(), "Upstream refused request");
    Err(error)
}

/// Map an upstream status and body to a failure class
pub fn classify_status(status: StatusCode, body: &str) -> UpstreamError {
    let detail = format!("{} {}", status, body_preview(body));
    let detail = detail.trim_end().to_string();

    if status == StatusCode::FORBIDDEN || is_challenge_page(body) {
        UpstreamError::Blocked(detail)
    } else if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        UpstreamError::Transient(detail)
    } else {
        UpstreamError::Fatal(detail)
    }
}

fn is_challenge_page(body: &str) -> bool {
    CHALLENGE_SIGNATURES.iter().any(|sig| body.contains(sig))
}

fn transport_error(error: reqwest::Error) -> UpstreamError {
    if error.is_builder() {
        UpstreamError::Fatal(format!("invalid upstream request: {error}"))
    } else {
        UpstreamError::Transient(format!("transport error: {error}"))
    }
}

fn token_stream(response: reqwest::Response, mut decoder: TokenDecoder) -> TokenStream {
    Box::pin(async_stream::stream! {
        let mut body = response.bytes_stream();
        let mut lines = LineBuffer::default();

        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => {
                    for line in lines.push(&bytes) {
                        if let Some(token) = decoder.decode_line(&line) {
                            yield Ok(token);
                        }
                    }
                }
                Err(e) => {
                    yield Err(UpstreamError::Transient(format!("stream interrupted: {e}")));
                    return;
                }
            }
        }

        if let Some(line) = lines.finish() {
            if let Some(token) = decoder.decode_line(&line) {
                yield Ok(token);
            }
        }
        if let Some(tail) = decoder.finish() {
            yield Ok(tail);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::egress::FailureClass;

    #[test]
    fn test_classify_status() {
        let cases = [
            (StatusCode::FORBIDDEN, "", FailureClass::Blocked),
            (StatusCode::OK, "<title>Just a moment...</title>", FailureClass::Blocked),
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "<script src=\"/cdn-cgi/challenge-platform/x.js\">",
                FailureClass::Blocked,
            ),
            (StatusCode::TOO_MANY_REQUESTS, "slow down", FailureClass::Transient),
            (StatusCode::BAD_GATEWAY, "", FailureClass::Transient),
            (StatusCode::UNAUTHORIZED, "", FailureClass::Fatal),
            (StatusCode::BAD_REQUEST, "{}", FailureClass::Fatal),
            (StatusCode::PAYLOAD_TOO_LARGE, "", FailureClass::Fatal),
            (StatusCode::OK, "<html>maintenance</html>", FailureClass::Fatal),
        ];

        for (status, body, expected) in cases {
            assert_eq!(
                classify_status(status, body).class(),
                expected,
                "status {status} body {body:?}"
            );
        }
    }

    #[test]
    fn test_classify_detail_is_bounded() {
        let body = "x".repeat(5_000);
        match classify_status(StatusCode::INTERNAL_SERVER_ERROR, &body) {
            UpstreamError::Transient(detail) => {
                assert!(detail.starts_with("500 Internal Server Error"));
                assert!(detail.len() < 300);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_request_headers_carry_cookie() {
        let headers = request_headers("sso=abc; sso-rw=def").unwrap();
        assert_eq!(headers.get(COOKIE).unwrap(), "sso=abc; sso-rw=def");
        assert!(headers.get(COOKIE).unwrap().is_sensitive());
        assert_eq!(headers.get("origin").unwrap(), "https://grok.com");

        let err = request_headers("bad\nsecret").unwrap_err();
        assert_eq!(err.class(), FailureClass::Fatal);
    }

    #[test]
    fn test_bypass_client_requires_configuration() {
        let upstream = HttpUpstream::new(
            UpstreamSettings::default(),
            &EgressSettings::default(),
            Duration::from_secs(5),
        )
        .unwrap();
        assert!(upstream.client(EgressPath::Direct).is_ok());
        assert_eq!(
            upstream.client(EgressPath::Bypass).unwrap_err().class(),
            FailureClass::Fatal
        );

        let with_bypass = HttpUpstream::new(
            UpstreamSettings::default(),
            &EgressSettings {
                http_proxy: None,
                bypass_proxy_url: Some("http://127.0.0.1:8899".into()),
            },
            Duration::from_secs(5),
        )
        .unwrap();
        assert!(with_bypass.client(EgressPath::Bypass).is_ok());
    }

    #[test]
    fn test_upload_threshold() {
        let settings = UpstreamSettings {
            message_chars_limit: 10,
            ..UpstreamSettings::default()
        };
        let upstream =
            HttpUpstream::new(settings, &EgressSettings::default(), Duration::from_secs(5))
                .unwrap();
        assert!(!upstream.needs_upload("short"));
        assert!(upstream.needs_upload("definitely too long"));
        assert_eq!(
            upstream.url(NEW_CHAT_PATH),
            "https://grok.com/rest/app-chat/conversations/new"
        );
    }
}
