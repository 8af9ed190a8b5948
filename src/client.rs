use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::SkailarError;
use crate::http::{ApiClient, HttpResponse};
use crate::proxy::{
    ClientProvider, DynInstanceProvider, InstanceRequest, ProbeRegistry, ProxyConfig,
};
use crate::stream::collect_stream_text;
use crate::types::{
    ChatCompletionRequest, ChatCompletionResponse, ClaudeChatCompletionRequest,
    ClaudeChatCompletionResponse, Completion, ModelList, UsageResponse,
};

/// Base URL of the public Skailar API.
pub const DEFAULT_BASE_URL: &str = "https://api.skailar.net/v1/";

const CHAT_COMPLETIONS: &str = "chat/completions";
const USAGE: &str = "usage";
const MODELS: &str = "models";

/// Entry point for the Skailar API.
///
/// Every call provisions its own HTTP client through the configured
/// [`crate::proxy::InstanceProvider`], so proxy reachability is re-evaluated per call
/// unless a [`ProbeRegistry`] is installed.
pub struct SkailarClient {
    api_key: String,
    base_url: String,
    proxy: Option<ProxyConfig>,
    debug_logging: bool,
    provider: DynInstanceProvider,
}

impl SkailarClient {
    /// Client for the public endpoint without a proxy.
    pub fn new(api_key: impl Into<String>) -> Result<Self, SkailarError> {
        Self::builder(api_key).build()
    }

    pub fn builder(api_key: impl Into<String>) -> SkailarClientBuilder {
        SkailarClientBuilder {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            proxy: None,
            debug_logging: false,
            probe_timeout: None,
            registry: None,
            provider: None,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn proxy(&self) -> Option<&ProxyConfig> {
        self.proxy.as_ref()
    }

    /// Creates a chat completion with a non-Claude model.
    ///
    /// Streams are collected into [`Completion::Streamed`] when `request.stream` is set.
    ///
    /// # Errors
    ///
    /// Returns [`SkailarError::ModelMismatch`] for Claude models before touching the
    /// network; otherwise transport, upstream and decode failures.
    pub async fn create_chat_completion(
        &self,
        request: ChatCompletionRequest,
    ) -> Result<Completion<ChatCompletionResponse>, SkailarError> {
        if is_claude_model(&request.model) {
            return Err(SkailarError::ModelMismatch {
                model: request.model,
                expected: "use create_claude_chat_completion for Claude models",
            });
        }
        let stream = request.is_stream();
        self.complete(&request, stream).await
    }

    /// Creates a chat completion with a Claude model.
    ///
    /// # Errors
    ///
    /// Returns [`SkailarError::ModelMismatch`] for non-Claude models before touching the
    /// network; otherwise transport, upstream and decode failures.
    pub async fn create_claude_chat_completion(
        &self,
        request: ClaudeChatCompletionRequest,
    ) -> Result<Completion<ClaudeChatCompletionResponse>, SkailarError> {
        if !is_claude_model(&request.model) {
            return Err(SkailarError::ModelMismatch {
                model: request.model,
                expected: "use create_chat_completion for non-Claude models",
            });
        }
        let stream = request.stream;
        self.complete(&request, stream).await
    }

    /// Fetches usage of the API key.
    pub async fn usage(&self) -> Result<UsageResponse, SkailarError> {
        let client = self.instance().await?;
        let response = client.get(USAGE).await?;
        decode(response)
    }

    /// Lists the models available to the API key.
    pub async fn models(&self) -> Result<ModelList, SkailarError> {
        let client = self.instance().await?;
        let response = client.get(MODELS).await?;
        decode(response)
    }

    async fn complete<B, T>(&self, body: &B, stream: bool) -> Result<Completion<T>, SkailarError>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let client = self.instance().await?;
        if stream {
            let response = client.post_json_stream(CHAT_COMPLETIONS, body).await?;
            if !response.is_success() {
                let body = collect_stream_text(response.body).await?;
                return Err(SkailarError::Upstream {
                    status: response.status,
                    body,
                });
            }
            Ok(Completion::Streamed(collect_stream_text(response.body).await?))
        } else {
            let response = client.post_json(CHAT_COMPLETIONS, body).await?;
            decode(response).map(Completion::Response)
        }
    }

    async fn instance(&self) -> Result<ApiClient, SkailarError> {
        let headers = HashMap::from([(
            "Authorization".to_string(),
            format!("Bearer {}", self.api_key),
        )]);
        let request = InstanceRequest::new(self.base_url.clone(), headers)
            .with_proxy(self.proxy.clone())
            .with_debug_logging(self.debug_logging);
        self.provider.get_instance(request).await
    }
}

fn is_claude_model(model: &str) -> bool {
    model.contains("claude")
}

fn decode<T: DeserializeOwned>(response: HttpResponse) -> Result<T, SkailarError> {
    let status = response.status;
    let success = response.is_success();
    let text = response.into_string()?;
    if !success {
        return Err(SkailarError::Upstream { status, body: text });
    }
    serde_json::from_str(&text).map_err(|err| SkailarError::Decode {
        message: err.to_string(),
    })
}

/// Builder for [`SkailarClient`].
pub struct SkailarClientBuilder {
    api_key: String,
    base_url: String,
    proxy: Option<ProxyConfig>,
    debug_logging: bool,
    probe_timeout: Option<Duration>,
    registry: Option<Arc<ProbeRegistry>>,
    provider: Option<DynInstanceProvider>,
}

impl SkailarClientBuilder {
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn debug_logging(mut self, enabled: bool) -> Self {
        self.debug_logging = enabled;
        self
    }

    /// Bound of each proxy probe made by the default provider.
    pub fn probe_timeout(mut self, bound: Duration) -> Self {
        self.probe_timeout = Some(bound);
        self
    }

    /// Shares probe results between calls of the default provider.
    pub fn probe_registry(mut self, registry: Arc<ProbeRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Replaces the default provider; `probe_timeout` and `probe_registry` then no
    /// longer apply.
    pub fn instance_provider(mut self, provider: DynInstanceProvider) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn build(self) -> Result<SkailarClient, SkailarError> {
        let provider = match self.provider {
            Some(provider) => provider,
            None => {
                let mut provider = ClientProvider::new();
                if let Some(bound) = self.probe_timeout {
                    provider = provider.with_probe_timeout(bound);
                }
                if let Some(registry) = self.registry {
                    provider = provider.with_registry(registry);
                }
                Arc::new(provider)
            }
        };

        Ok(SkailarClient {
            api_key: self.api_key,
            base_url: self.base_url,
            proxy: self.proxy,
            debug_logging: self.debug_logging,
            provider,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use futures_util::stream;
    use url::Url;

    use super::*;
    use crate::http::{
        DynHttpTransport, HttpRequest, HttpStreamResponse, HttpTransport, Route,
    };
    use crate::proxy::InstanceProvider;
    use crate::types::ChatMessage;

    /// Transport answering every request with a canned response and counting calls.
    struct CannedTransport {
        status: u16,
        body: Vec<u8>,
        chunks: Vec<Vec<u8>>,
        calls: AtomicUsize,
        requests: Mutex<Vec<HttpRequest>>,
    }

    impl CannedTransport {
        fn new(status: u16, body: &str) -> Arc<Self> {
            Arc::new(Self {
                status,
                body: body.as_bytes().to_vec(),
                chunks: Vec::new(),
                calls: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn streaming(chunks: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                status: 200,
                body: Vec::new(),
                chunks: chunks.iter().map(|c| c.as_bytes().to_vec()).collect(),
                calls: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl HttpTransport for CannedTransport {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse, SkailarError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(request);
            Ok(HttpResponse {
                status: self.status,
                headers: HashMap::new(),
                body: self.body.clone(),
            })
        }

        async fn send_stream(
            &self,
            request: HttpRequest,
        ) -> Result<HttpStreamResponse, SkailarError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(request);
            let chunks: Vec<Result<Vec<u8>, SkailarError>> =
                self.chunks.iter().cloned().map(Ok).collect();
            Ok(HttpStreamResponse {
                status: self.status,
                headers: HashMap::new(),
                body: Box::pin(stream::iter(chunks)),
            })
        }
    }

    /// Provider handing out direct clients over one shared transport.
    struct FixedProvider {
        transport: DynHttpTransport,
        instances: AtomicUsize,
    }

    #[async_trait]
    impl InstanceProvider for FixedProvider {
        async fn get_instance(
            &self,
            request: InstanceRequest,
        ) -> Result<ApiClient, SkailarError> {
            self.instances.fetch_add(1, Ordering::SeqCst);
            Ok(ApiClient::new(
                Arc::clone(&self.transport),
                Url::parse(&request.base_url).unwrap(),
                request.headers,
                Route::Direct,
            ))
        }
    }

    fn client_with(transport: Arc<CannedTransport>) -> (SkailarClient, Arc<FixedProvider>) {
        let provider = Arc::new(FixedProvider {
            transport,
            instances: AtomicUsize::new(0),
        });
        let client = SkailarClient::builder("k")
            .base_url("https://api.example/v1/")
            .instance_provider(provider.clone())
            .build()
            .expect("client");
        (client, provider)
    }

    fn claude_request(model: &str, stream: bool) -> ClaudeChatCompletionRequest {
        ClaudeChatCompletionRequest {
            messages: vec!["Human: who are you?".to_string(), "Assistant:".to_string()],
            model: model.to_string(),
            max_tokens_to_sample: 100,
            stream,
            temperature: 0.7,
            top_p: 0.7,
            top_k: 0.7,
        }
    }

    const CLAUDE_BODY: &str = r#"{"completion":"I am Claude.","stop_reason":"stop_sequence","model":"claude-2","stop":"\n\nHuman:","log_id":"log-1"}"#;

    #[tokio::test]
    async fn claude_operation_rejects_gpt_models_before_network() {
        let transport = CannedTransport::new(200, CLAUDE_BODY);
        let (client, provider) = client_with(transport.clone());

        let err = client
            .create_claude_chat_completion(claude_request("gpt-4", false))
            .await
            .expect_err("model mismatch");

        assert!(matches!(err, SkailarError::ModelMismatch { ref model, .. } if model == "gpt-4"));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
        assert_eq!(provider.instances.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn claude_operation_issues_one_request_for_claude_models() {
        let transport = CannedTransport::new(200, CLAUDE_BODY);
        let (client, provider) = client_with(transport.clone());

        let completion = client
            .create_claude_chat_completion(claude_request("claude-2", false))
            .await
            .expect("completion");

        let response = completion.into_response().expect("buffered response");
        assert_eq!(response.completion, "I am Claude.");
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert_eq!(provider.instances.load(Ordering::SeqCst), 1);

        let requests = transport.requests.lock().unwrap();
        assert_eq!(
            requests[0].url,
            "https://api.example/v1/chat/completions"
        );
        assert_eq!(
            requests[0].headers.get("Authorization"),
            Some(&"Bearer k".to_string())
        );
    }

    #[tokio::test]
    async fn chat_operation_rejects_claude_models_before_network() {
        let transport = CannedTransport::new(200, "{}");
        let (client, _provider) = client_with(transport.clone());

        let err = client
            .create_chat_completion(ChatCompletionRequest::new(
                "claude-instant-1",
                vec![ChatMessage::user("hi")],
            ))
            .await
            .expect_err("model mismatch");

        assert!(matches!(err, SkailarError::ModelMismatch { .. }));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn streamed_chat_is_aggregated() {
        let transport = CannedTransport::streaming(&["data: a\n\n", "data: b\n\n", "data: [DONE]\n\n"]);
        let (client, _provider) = client_with(transport.clone());

        let mut request = ChatCompletionRequest::new("gpt-4", vec![ChatMessage::user("hi")]);
        request.stream = Some(true);

        let completion = client.create_chat_completion(request).await.expect("stream");
        assert_eq!(
            completion,
            Completion::Streamed("data: a\n\ndata: b\n\ndata: [DONE]\n\n".to_string())
        );
    }

    #[tokio::test]
    async fn non_success_status_carries_upstream_body() {
        let transport = CannedTransport::new(401, r#"{"error":"invalid api key"}"#);
        let (client, _provider) = client_with(transport);

        match client.usage().await {
            Err(SkailarError::Upstream { status, body }) => {
                assert_eq!(status, 401);
                assert_eq!(body, r#"{"error":"invalid api key"}"#);
            }
            other => panic!("expected upstream error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn usage_and_models_each_provision_a_client() {
        let transport = CannedTransport::new(
            200,
            r#"{"max":"1000","used":12,"first_used_today":"2023-08-01T00:00:00Z"}"#,
        );
        let (client, provider) = client_with(transport.clone());

        let usage = client.usage().await.expect("usage");
        assert_eq!(usage.used, 12);
        client.usage().await.expect("usage");
        assert_eq!(provider.instances.load(Ordering::SeqCst), 2);

        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests[0].url, "https://api.example/v1/usage");
    }

    #[tokio::test]
    async fn malformed_success_body_is_a_decode_error() {
        let transport = CannedTransport::new(200, "not json");
        let (client, _provider) = client_with(transport);
        assert!(matches!(
            client.models().await,
            Err(SkailarError::Decode { .. })
        ));
    }

    #[test]
    fn default_client_targets_public_endpoint() {
        let client = SkailarClient::new("k").expect("client");
        assert_eq!(client.base_url(), DEFAULT_BASE_URL);
        assert!(client.proxy().is_none());
    }
}
