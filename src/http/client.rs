use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use url::Url;

use crate::error::SkailarError;
use crate::proxy::ProxyEndpoint;

use super::{
    DynHttpTransport, HttpResponse, HttpStreamResponse, get_with_headers,
    post_json_stream_with_headers, post_json_with_headers,
};

/// How an [`ApiClient`] reaches the API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Direct,
    Proxied(ProxyEndpoint),
}

impl Route {
    pub fn label(&self) -> &'static str {
        match self {
            Route::Direct => "direct",
            Route::Proxied(_) => "proxied",
        }
    }
}

/// HTTP client bound to one base URL and one header set.
///
/// Callers issue `GET`/`POST` with paths relative to the base URL and never need to
/// know whether traffic goes through a proxy; [`ApiClient::route`] is informational.
#[derive(Clone)]
pub struct ApiClient {
    transport: DynHttpTransport,
    base_url: Url,
    headers: HashMap<String, String>,
    route: Route,
}

impl ApiClient {
    pub fn new(
        transport: DynHttpTransport,
        base_url: Url,
        headers: HashMap<String, String>,
        route: Route,
    ) -> Self {
        Self {
            transport,
            base_url,
            headers,
            route,
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    /// Proxy the client routes through, `None` for a direct client.
    pub fn proxy(&self) -> Option<&ProxyEndpoint> {
        match &self.route {
            Route::Direct => None,
            Route::Proxied(endpoint) => Some(endpoint),
        }
    }

    /// Resolves `path` against the base URL.
    ///
    /// # Errors
    ///
    /// Returns [`SkailarError::Validation`] when the path cannot be joined.
    pub fn endpoint(&self, path: &str) -> Result<String, SkailarError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map(String::from)
            .map_err(|err| SkailarError::Validation {
                message: format!("invalid endpoint path `{path}`: {err}"),
            })
    }

    pub async fn get(&self, path: &str) -> Result<HttpResponse, SkailarError> {
        let url = self.endpoint(path)?;
        get_with_headers(self.transport.as_ref(), url, self.headers.clone()).await
    }

    pub async fn post_json<T: Serialize + Sync>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<HttpResponse, SkailarError> {
        let url = self.endpoint(path)?;
        post_json_with_headers(self.transport.as_ref(), url, self.headers.clone(), body).await
    }

    pub async fn post_json_stream<T: Serialize + Sync>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<HttpStreamResponse, SkailarError> {
        let url = self.endpoint(path)?;
        post_json_stream_with_headers(self.transport.as_ref(), url, self.headers.clone(), body)
            .await
    }
}

impl fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url.as_str())
            .field("route", &self.route)
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .finish()
    }
}
