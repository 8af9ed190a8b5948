use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, Method, Proxy};

use crate::error::SkailarError;

use super::client::Route;
use super::{
    DynHttpTransport, HttpBodyStream, HttpMethod, HttpRequest, HttpResponse, HttpStreamResponse,
    HttpTransport,
};

/// Default [`HttpTransport`] backed by reqwest.
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// Wraps a preconfigured reqwest client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Builds a transport that connects the way `route` says.
    ///
    /// Direct routes disable reqwest's system proxy detection so that a direct client is
    /// really direct. Proxied routes send every request through the endpoint, with basic
    /// credentials when the endpoint carries them.
    ///
    /// # Errors
    ///
    /// Returns [`SkailarError::Configuration`] when the proxy URL is rejected and
    /// [`SkailarError::Transport`] when the client cannot be built.
    pub fn for_route(route: &Route) -> Result<Self, SkailarError> {
        let builder = match route {
            Route::Direct => Client::builder().no_proxy(),
            Route::Proxied(endpoint) => {
                let mut proxy = Proxy::all(endpoint.url()).map_err(|err| {
                    SkailarError::configuration("proxy", format!("invalid proxy url: {err}"))
                })?;
                if let Some(auth) = &endpoint.auth {
                    proxy = proxy.basic_auth(&auth.username, &auth.password);
                }
                Client::builder().proxy(proxy)
            }
        };

        builder
            .build()
            .map(Self::new)
            .map_err(|err| SkailarError::transport(format!("failed to create reqwest client: {err}")))
    }

    fn method(method: HttpMethod) -> Method {
        match method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
        }
    }

    fn build_request(
        &self,
        mut request: HttpRequest,
    ) -> Result<reqwest::RequestBuilder, SkailarError> {
        let method = Self::method(request.method);
        let mut builder = self.client.request(method, &request.url);

        for (name, value) in request.headers.drain() {
            let header_name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
                .map_err(|err| SkailarError::transport(format!("invalid header name: {err}")))?;
            let header_value = reqwest::header::HeaderValue::from_str(&value).map_err(|err| {
                SkailarError::transport(format!("invalid header value for {header_name}: {err}"))
            })?;
            builder = builder.header(header_name, header_value);
        }

        if let Some(body) = request.body.take() {
            builder = builder.body(body);
        }

        Ok(builder)
    }

    fn headers_to_map(headers: &reqwest::header::HeaderMap) -> HashMap<String, String> {
        headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect()
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, SkailarError> {
        let response = self
            .build_request(request)?
            .send()
            .await
            .map_err(|err| SkailarError::transport(err.to_string()))?;

        let status = response.status().as_u16();
        let headers = Self::headers_to_map(response.headers());
        let body = response
            .bytes()
            .await
            .map_err(|err| SkailarError::transport(err.to_string()))?
            .to_vec();

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }

    async fn send_stream(&self, request: HttpRequest) -> Result<HttpStreamResponse, SkailarError> {
        let response = self
            .build_request(request)?
            .send()
            .await
            .map_err(|err| SkailarError::transport(err.to_string()))?;

        let status = response.status().as_u16();
        let headers = Self::headers_to_map(response.headers());
        let stream = response.bytes_stream().map(|chunk| {
            chunk
                .map(|bytes| bytes.to_vec())
                .map_err(|err| SkailarError::transport(err.to_string()))
        });
        let body: HttpBodyStream = Box::pin(stream);

        Ok(HttpStreamResponse {
            status,
            headers,
            body,
        })
    }
}

/// Thread-safe transport for `route`.
pub fn dyn_transport_for_route(route: &Route) -> Result<DynHttpTransport, SkailarError> {
    Ok(Arc::new(ReqwestTransport::for_route(route)?))
}
