use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_core::Stream;
use serde::Serialize;

use crate::error::SkailarError;

pub mod client;
pub mod reqwest;

pub use client::{ApiClient, Route};

/// HTTP methods used against the Skailar API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// Minimal HTTP request representation handed to a transport.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    /// Builds a GET request without a body.
    ///
    /// # Examples
    ///
    /// ```
    /// use skailar::http::{HttpMethod, HttpRequest};
    ///
    /// let request = HttpRequest::get("https://api.skailar.net/v1/models");
    /// assert_eq!(request.method, HttpMethod::Get);
    /// assert!(request.body.is_none());
    /// ```
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            headers: HashMap::new(),
            body: None,
        }
    }

    /// Builds a POST request with a JSON request body.
    ///
    /// The helper sets the `Content-Type` header to `application/json` and stores the
    /// provided buffer as the body.
    ///
    /// # Examples
    ///
    /// ```
    /// use skailar::http::{HttpMethod, HttpRequest};
    ///
    /// let request = HttpRequest::post_json("https://example.com", br"{}".to_vec());
    /// assert_eq!(request.method, HttpMethod::Post);
    /// assert_eq!(request.headers.get("Content-Type"), Some(&"application/json".to_string()));
    /// ```
    pub fn post_json(url: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            method: HttpMethod::Post,
            url: url.into(),
            headers: HashMap::from([("Content-Type".to_string(), "application/json".to_string())]),
            body: Some(body),
        }
    }

    /// Merges headers into the request, overriding entries with the same name.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::collections::HashMap;
    /// use skailar::http::HttpRequest;
    ///
    /// let request = HttpRequest::post_json("https://example.com", br"{}".to_vec())
    ///     .with_headers(HashMap::from([("Authorization".into(), "Bearer test".into())]));
    /// assert_eq!(request.headers.get("Authorization"), Some(&"Bearer test".to_string()));
    /// assert_eq!(request.headers.get("Content-Type"), Some(&"application/json".to_string()));
    /// ```
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }
}

/// Minimal HTTP response representation.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

fn is_success_status(status: u16) -> bool {
    (200..300).contains(&status)
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        is_success_status(self.status)
    }

    /// Converts the body into a UTF-8 string.
    ///
    /// # Examples
    ///
    /// ```
    /// use skailar::http::HttpResponse;
    ///
    /// let response = HttpResponse { status: 200, headers: Default::default(), body: b"ok".to_vec() };
    /// assert_eq!(response.into_string().unwrap(), "ok");
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`SkailarError::Transport`] when the body cannot be interpreted as UTF-8.
    pub fn into_string(self) -> Result<String, SkailarError> {
        String::from_utf8(self.body).map_err(|err| SkailarError::transport(err.to_string()))
    }
}

/// HTTP response that carries a streaming body.
pub struct HttpStreamResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: HttpBodyStream,
}

impl HttpStreamResponse {
    pub fn is_success(&self) -> bool {
        is_success_status(self.status)
    }
}

/// Alias for the body stream returned by [`HttpTransport::send_stream`].
pub type HttpBodyStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, SkailarError>> + Send>>;

/// Transport abstraction used to decouple the API client from the concrete HTTP stack.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Sends a request and resolves when the full response is available.
    ///
    /// # Examples
    ///
    /// ```
    /// # use async_trait::async_trait;
    /// # use skailar::http::{HttpTransport, HttpRequest, HttpResponse, HttpStreamResponse};
    /// # use skailar::error::SkailarError;
    /// # use futures_util::stream;
    /// struct MemoryTransport;
    ///
    /// #[async_trait]
    /// impl HttpTransport for MemoryTransport {
    ///     async fn send(&self, request: HttpRequest) -> Result<HttpResponse, SkailarError> {
    ///         Ok(HttpResponse { status: 200, headers: request.headers, body: b"ok".to_vec() })
    ///     }
    ///     async fn send_stream(&self, request: HttpRequest) -> Result<HttpStreamResponse, SkailarError> {
    ///         Ok(HttpStreamResponse { status: 200, headers: request.headers, body: Box::pin(stream::empty()) })
    ///     }
    /// }
    ///
    /// # tokio::runtime::Runtime::new().unwrap().block_on(async {
    /// let response = MemoryTransport
    ///     .send(HttpRequest::get("https://example.com"))
    ///     .await
    ///     .unwrap();
    /// assert_eq!(response.status, 200);
    /// # });
    /// ```
    ///
    /// # Errors
    ///
    /// Implementations map network failures to [`SkailarError::Transport`]. Non-success
    /// statuses are returned as regular responses.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, SkailarError>;

    /// Sends a request and returns a streaming body.
    ///
    /// # Errors
    ///
    /// Implementations return [`SkailarError::Transport`] when the request cannot be
    /// dispatched; chunk-level failures surface as items of the body stream.
    async fn send_stream(&self, request: HttpRequest) -> Result<HttpStreamResponse, SkailarError>;
}

/// Thread-safe handle to a transport implementation.
pub type DynHttpTransport = Arc<dyn HttpTransport>;

fn serialize_body<T: Serialize>(body: &T) -> Result<Vec<u8>, SkailarError> {
    serde_json::to_vec(body).map_err(|err| SkailarError::Validation {
        message: format!("failed to serialize request: {err}"),
    })
}

/// Serializes a body to JSON, attaches headers, and issues a POST request.
///
/// # Examples
///
/// ```
/// # use std::collections::HashMap;
/// # use async_trait::async_trait;
/// # use skailar::http::{post_json_with_headers, HttpTransport, HttpRequest, HttpResponse, HttpStreamResponse};
/// # use skailar::error::SkailarError;
/// # use serde_json::json;
/// struct MockTransport;
///
/// #[async_trait]
/// impl HttpTransport for MockTransport {
///     async fn send(&self, request: HttpRequest) -> Result<HttpResponse, SkailarError> {
///         assert_eq!(request.headers.get("X-Test"), Some(&"ok".to_string()));
///         Ok(HttpResponse { status: 200, headers: request.headers, body: request.body.unwrap_or_default() })
///     }
///     async fn send_stream(&self, _request: HttpRequest) -> Result<HttpStreamResponse, SkailarError> {
///         panic!("streaming not used in this example");
///     }
/// }
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let headers = HashMap::from([("X-Test".to_string(), "ok".to_string())]);
/// let response = post_json_with_headers(&MockTransport, "https://example.com", headers, &json!({"ping": "pong"}))
///     .await
///     .unwrap();
/// assert_eq!(response.status, 200);
/// # });
/// ```
///
/// # Errors
///
/// Returns [`SkailarError::Validation`] if serialization fails or forwards the error raised
/// by [`HttpTransport::send`].
pub async fn post_json_with_headers<T: Serialize>(
    transport: &dyn HttpTransport,
    url: impl Into<String>,
    headers: HashMap<String, String>,
    body: &T,
) -> Result<HttpResponse, SkailarError> {
    let payload = serialize_body(body)?;
    let request = HttpRequest::post_json(url, payload).with_headers(headers);
    transport.send(request).await
}

/// Issues a JSON POST request and returns the streaming response.
///
/// # Errors
///
/// Returns [`SkailarError::Validation`] when serialization fails or propagates any error
/// from [`HttpTransport::send_stream`].
pub async fn post_json_stream_with_headers<T: Serialize>(
    transport: &dyn HttpTransport,
    url: impl Into<String>,
    headers: HashMap<String, String>,
    body: &T,
) -> Result<HttpStreamResponse, SkailarError> {
    let payload = serialize_body(body)?;
    let request = HttpRequest::post_json(url, payload).with_headers(headers);
    transport.send_stream(request).await
}

/// Issues a GET request with the given headers.
///
/// # Errors
///
/// Forwards the error raised by [`HttpTransport::send`].
pub async fn get_with_headers(
    transport: &dyn HttpTransport,
    url: impl Into<String>,
    headers: HashMap<String, String>,
) -> Result<HttpResponse, SkailarError> {
    transport
        .send(HttpRequest::get(url).with_headers(headers))
        .await
}
