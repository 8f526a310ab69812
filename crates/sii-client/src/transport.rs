//! # SOAP Transport
//!
//! HTTP plumbing for the authority's web services. Every call runs under the
//! [`retry`](crate::retry) executor and the caller's [`CallContext`]:
//!
//! - SOAP calls POST an envelope with `Content-Type: text/xml; charset=utf-8`
//!   and an empty `SOAPAction`, plus `Cookie: TOKEN=<t>` when the context
//!   carries a session token.
//! - Uploads are `multipart/form-data` with the sender and company RUTs and
//!   the envelope as the `archivo` part.
//!
//! ## Error mapping
//!
//! | Condition                         | Kind            |
//! |-----------------------------------|-----------------|
//! | client timeout, HTTP 408          | `Timeout`       |
//! | connect / IO failure              | `Conexion`      |
//! | HTTP 401                          | `AuthInvalid`   |
//! | HTTP 403                          | `CertInvalid`   |
//! | HTTP 5xx, `Server` fault          | `Servidor`      |
//! | other non-2xx, non-XML reply      | `Procesamiento` |

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, COOKIE, USER_AGENT};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use sii_core::{Endpoint, ErrorKind, Rut, SiiError};
use sii_crypto::Certificate;
use url::Url;

use crate::config::SiiConfig;
use crate::context::CallContext;
use crate::retry::{self, RetryConfig};
use crate::soap::{build_envelope, parse_envelope, UploadAck};

const AGENT: &str = concat!("sii-client/", env!("CARGO_PKG_VERSION"));

/// One SOAP operation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoapRequest {
    /// Target service.
    pub endpoint: Endpoint,
    /// Operation parameters, in order.
    pub params: Vec<(String, String)>,
}

impl SoapRequest {
    /// Call with no parameters.
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            params: Vec::new(),
        }
    }

    /// Append a parameter.
    pub fn param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.params.push((name.into(), value.to_string()));
        self
    }

    /// The request envelope.
    pub fn envelope(&self) -> Result<String, SiiError> {
        let operation = self.endpoint.operation().ok_or_else(|| {
            SiiError::new(
                ErrorKind::Procesamiento,
                format!("{} is not a SOAP service", self.endpoint),
            )
        })?;
        Ok(build_envelope(operation, &self.params))
    }
}

/// One envelope upload.
#[derive(Clone, PartialEq, Eq)]
pub struct UploadRequest {
    /// Person submitting (certificate holder).
    pub rut_sender: Rut,
    /// Issuing company.
    pub rut_company: Rut,
    /// File name reported to the authority.
    pub file_name: String,
    /// Serialized signed envelope.
    pub content: Vec<u8>,
}

impl fmt::Debug for UploadRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadRequest")
            .field("rut_sender", &self.rut_sender)
            .field("rut_company", &self.rut_company)
            .field("file_name", &self.file_name)
            .field("content_len", &self.content.len())
            .finish()
    }
}

/// Wire access to the authority.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Run a SOAP operation and return the text of its return value.
    async fn call(&self, ctx: &CallContext, request: &SoapRequest) -> Result<String, SiiError>;

    /// Upload an envelope and return the parsed acknowledgment.
    async fn upload(&self, ctx: &CallContext, request: &UploadRequest) -> Result<UploadAck, SiiError>;
}

/// reqwest-backed [`Transport`].
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: Url,
    retry: RetryConfig,
    timeout: Duration,
}

impl HttpTransport {
    /// Transport for `config`. With a certificate the client presents it for
    /// TLS client authentication.
    pub fn new(config: &SiiConfig, certificate: Option<&Certificate>) -> Result<Self, SiiError> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(AGENT));
        let mut builder = Client::builder()
            .timeout(config.timeout())
            .connect_timeout(config.timeout())
            .default_headers(headers);
        if let Some(certificate) = certificate {
            let pem = certificate.identity_pem()?;
            let identity = reqwest::Identity::from_pem(&pem).map_err(|e| {
                SiiError::wrap(ErrorKind::CertInvalid, "certificate unusable for TLS", e)
            })?;
            builder = builder.identity(identity);
        }
        let client = builder.build().map_err(|e| {
            SiiError::wrap(ErrorKind::Procesamiento, "failed to build HTTP client", e)
        })?;
        Ok(Self {
            client,
            base_url: config.base_url()?,
            retry: config.retry(),
            timeout: config.timeout(),
        })
    }

    /// Transport over an existing client; used with mock servers.
    pub fn with_client(client: Client, base_url: Url, retry: RetryConfig, timeout: Duration) -> Self {
        Self {
            client,
            base_url,
            retry,
            timeout,
        }
    }

    /// Base URL requests are resolved against.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, endpoint: Endpoint) -> Result<Url, SiiError> {
        self.base_url.join(endpoint.path()).map_err(|e| {
            SiiError::wrap(ErrorKind::Procesamiento, format!("bad URL for {endpoint}"), e)
        })
    }

    fn request_timeout(&self, ctx: &CallContext) -> Duration {
        match ctx.remaining() {
            Some(remaining) => remaining.min(self.timeout),
            None => self.timeout,
        }
    }

    async fn post_envelope(
        &self,
        ctx: &CallContext,
        url: &Url,
        envelope: &str,
    ) -> Result<String, SiiError> {
        let mut request = self
            .client
            .post(url.clone())
            .timeout(self.request_timeout(ctx))
            .header(CONTENT_TYPE, "text/xml; charset=utf-8")
            .header("SOAPAction", "")
            .body(envelope.to_string());
        if let Some(token) = ctx.token() {
            request = request.header(COOKIE, format!("TOKEN={token}"));
        }
        let response = request.send().await.map_err(map_reqwest)?;
        let status = response.status();
        let content_type = header_str(response.headers(), CONTENT_TYPE);
        let body = response.bytes().await.map_err(map_reqwest)?;

        if status.is_server_error() {
            // faults arrive as 500 with a SOAP body
            if let Err(fault) = parse_envelope(&body) {
                if fault.is_rejection() {
                    return Err(fault);
                }
            }
        }
        check_status(status, &body)?;
        check_content_type(&content_type, SOAP_TYPES)?;
        parse_envelope(&body)
    }

    async fn post_upload(&self, ctx: &CallContext, request: &UploadRequest) -> Result<UploadAck, SiiError> {
        let url = self.url(Endpoint::Upload)?;
        let token = ctx.token().ok_or_else(|| {
            SiiError::new(ErrorKind::AuthInvalid, "upload requires a session token")
        })?;
        let archivo = Part::bytes(request.content.clone())
            .file_name(request.file_name.clone())
            .mime_str("text/xml")
            .map_err(|e| SiiError::wrap(ErrorKind::Procesamiento, "bad part type", e))?;
        let form = Form::new()
            .text("rutSender", request.rut_sender.body().to_string())
            .text("dvSender", request.rut_sender.dv().to_string())
            .text("rutCompany", request.rut_company.body().to_string())
            .text("dvCompany", request.rut_company.dv().to_string())
            .part("archivo", archivo);

        let response = self
            .client
            .post(url)
            .timeout(self.request_timeout(ctx))
            .header(COOKIE, format!("TOKEN={token}"))
            .multipart(form)
            .send()
            .await
            .map_err(map_reqwest)?;
        let status = response.status();
        let content_type = header_str(response.headers(), CONTENT_TYPE);
        let body = response.bytes().await.map_err(map_reqwest)?;
        check_status(status, &body)?;
        check_content_type(&content_type, UPLOAD_TYPES)?;
        UploadAck::parse(&body)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn call(&self, ctx: &CallContext, request: &SoapRequest) -> Result<String, SiiError> {
        if request.endpoint.requires_token() && ctx.token().is_none() {
            return Err(SiiError::new(
                ErrorKind::AuthInvalid,
                format!("{} requires a session token", request.endpoint),
            ));
        }
        let url = self.url(request.endpoint)?;
        let envelope = request.envelope()?;
        let endpoint = request.endpoint;
        retry::execute(ctx, &self.retry, |attempt| {
            let (url, envelope) = (&url, &envelope);
            async move {
                tracing::debug!(%endpoint, attempt, "SOAP call");
                self.post_envelope(ctx, url, envelope).await
            }
        })
        .await
    }

    async fn upload(&self, ctx: &CallContext, request: &UploadRequest) -> Result<UploadAck, SiiError> {
        let ack = retry::execute(ctx, &self.retry, |attempt| async move {
            tracing::debug!(file = %request.file_name, attempt, "uploading envelope");
            self.post_upload(ctx, request).await
        })
        .await?;
        tracing::info!(
            file = %request.file_name,
            status = ack.status,
            track_id = ack.track_id.as_deref().unwrap_or(""),
            "envelope uploaded"
        );
        Ok(ack)
    }
}

fn header_str(headers: &HeaderMap, name: reqwest::header::HeaderName) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase()
}

fn excerpt(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    match text.char_indices().nth(200) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text.to_string(),
    }
}

/// Map a non-2xx HTTP status.
pub fn check_status(status: StatusCode, body: &[u8]) -> Result<(), SiiError> {
    if status.is_success() {
        return Ok(());
    }
    let kind = match status {
        StatusCode::UNAUTHORIZED => ErrorKind::AuthInvalid,
        StatusCode::FORBIDDEN => ErrorKind::CertInvalid,
        StatusCode::REQUEST_TIMEOUT => ErrorKind::Timeout,
        s if s.is_server_error() => ErrorKind::Servidor,
        _ => ErrorKind::Procesamiento,
    };
    Err(SiiError::new(kind, format!("HTTP {status}: {}", excerpt(body))))
}

const SOAP_TYPES: &[&str] = &["xml"];
// the upload service labels its XML reply as HTML
const UPLOAD_TYPES: &[&str] = &["xml", "html"];

fn check_content_type(content_type: &str, accepted: &[&str]) -> Result<(), SiiError> {
    if content_type.is_empty() || accepted.iter().any(|t| content_type.contains(t)) {
        return Ok(());
    }
    Err(SiiError::new(
        ErrorKind::Procesamiento,
        format!("unexpected content type {content_type:?}"),
    ))
}

/// Map a reqwest failure.
pub fn map_reqwest(err: reqwest::Error) -> SiiError {
    let kind = if err.is_timeout() {
        ErrorKind::Timeout
    } else if err.is_decode() || err.is_builder() {
        ErrorKind::Procesamiento
    } else {
        ErrorKind::Conexion
    };
    SiiError::wrap(kind, "request to authority failed", err)
}
