use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::error::SkailarError;
use crate::http::reqwest::dyn_transport_for_route;
use crate::http::{ApiClient, DynHttpTransport, Route};

use super::config::{ProxyConfig, ProxyEndpoint};
use super::probe::{
    DEFAULT_PROBE_TIMEOUT, HttpReachabilityCheck, Probe, ProbeReport, ReachabilityCheck,
};
use super::registry::{ProbeKey, ProbeRegistry};

/// Everything needed to provision one client.
#[derive(Debug, Clone, Default)]
pub struct InstanceRequest {
    pub base_url: String,
    pub headers: HashMap<String, String>,
    pub proxy: Option<ProxyConfig>,
    /// Emit a decision event; never changes the outcome.
    pub debug_logging: bool,
}

impl InstanceRequest {
    pub fn new(base_url: impl Into<String>, headers: HashMap<String, String>) -> Self {
        Self {
            base_url: base_url.into(),
            headers,
            proxy: None,
            debug_logging: false,
        }
    }

    pub fn with_proxy(mut self, proxy: Option<ProxyConfig>) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn with_debug_logging(mut self, enabled: bool) -> Self {
        self.debug_logging = enabled;
        self
    }
}

/// Hands out ready-to-use API clients.
#[async_trait]
pub trait InstanceProvider: Send + Sync {
    /// Produces a client bound to `request.base_url`, proxied or direct.
    ///
    /// # Errors
    ///
    /// Returns [`SkailarError::Configuration`] for an invalid base URL or proxy. An
    /// unreachable proxy is not an error.
    async fn get_instance(&self, request: InstanceRequest) -> Result<ApiClient, SkailarError>;
}

/// Thread-safe provider handle.
pub type DynInstanceProvider = Arc<dyn InstanceProvider>;

/// Builds the transport for a decided route.
pub type TransportFactory = Arc<dyn Fn(&Route) -> Result<DynHttpTransport, SkailarError> + Send + Sync>;

/// Per-call provisioning record, discarded once the client is returned.
#[derive(Debug, Default)]
struct ClientInstanceState {
    route: Option<Route>,
    probe: Option<ProbeReport>,
}

impl ClientInstanceState {
    fn log_decision(&self, base_url: &Url) {
        let route = self.route.as_ref().map_or("unresolved", Route::label);
        match &self.probe {
            Some(report) => {
                let elapsed_ms = u64::try_from(report.elapsed.as_millis()).unwrap_or(u64::MAX);
                tracing::info!(
                    target: "skailar::proxy",
                    base_url = %base_url,
                    route,
                    probe = report.result.as_str(),
                    elapsed_ms,
                    cached = report.cached,
                    failure = report.failure.as_deref().unwrap_or(""),
                    "client instance ready"
                );
            }
            None => tracing::info!(
                target: "skailar::proxy",
                base_url = %base_url,
                route,
                probe = "skipped",
                "client instance ready"
            ),
        }
    }
}

/// Default [`InstanceProvider`]: probes configured proxies and falls back to direct.
pub struct ClientProvider {
    probe: Probe,
    registry: Option<Arc<ProbeRegistry>>,
    transports: TransportFactory,
}

impl ClientProvider {
    /// Provider with the HTTP reachability check and the default bound.
    pub fn new() -> Self {
        Self::with_check(Arc::new(HttpReachabilityCheck::new()))
    }

    pub fn with_check(check: Arc<dyn ReachabilityCheck>) -> Self {
        Self {
            probe: Probe::new(check, DEFAULT_PROBE_TIMEOUT),
            registry: None,
            transports: Arc::new(dyn_transport_for_route),
        }
    }

    pub fn with_probe_timeout(mut self, bound: Duration) -> Self {
        self.probe.set_bound(bound);
        self
    }

    /// Shares probe results across calls through `registry`.
    pub fn with_registry(mut self, registry: Arc<ProbeRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Replaces the reqwest-backed transport construction.
    pub fn with_transport_factory(mut self, factory: TransportFactory) -> Self {
        self.transports = factory;
        self
    }

    pub fn probe_timeout(&self) -> Duration {
        self.probe.bound()
    }

    pub fn pending_probe_timers(&self) -> usize {
        self.probe.pending_timers()
    }

    async fn resolve(&self, base_url: &Url, endpoint: &ProxyEndpoint) -> ProbeReport {
        let key = self
            .registry
            .as_ref()
            .map(|_| ProbeKey::new(base_url, endpoint));

        if let (Some(registry), Some(key)) = (&self.registry, &key) {
            if let Some(result) = registry.lookup(key) {
                return ProbeReport::from_cache(result);
            }
        }

        let report = self.probe.run(base_url, endpoint).await;
        if let (Some(registry), Some(key)) = (&self.registry, key) {
            registry.record(key, report.result);
        }
        report
    }
}

impl Default for ClientProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InstanceProvider for ClientProvider {
    async fn get_instance(&self, request: InstanceRequest) -> Result<ApiClient, SkailarError> {
        let base_url = parse_base_url(&request.base_url)?;
        let mut state = ClientInstanceState::default();

        let route = match &request.proxy {
            None => Route::Direct,
            Some(config) => {
                let endpoint = config.validate()?;
                let report = self.resolve(&base_url, &endpoint).await;
                let route = if report.result.is_online() {
                    Route::Proxied(endpoint)
                } else {
                    Route::Direct
                };
                state.probe = Some(report);
                route
            }
        };
        state.route = Some(route.clone());

        if request.debug_logging {
            state.log_decision(&base_url);
        }

        let transport = (self.transports)(&route)?;
        Ok(ApiClient::new(transport, base_url, request.headers, route))
    }
}

/// Parses an absolute base URL, appending `/` so relative paths resolve beneath it.
pub(crate) fn parse_base_url(raw: &str) -> Result<Url, SkailarError> {
    let trimmed = raw.trim();
    let normalized = if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    };
    let url = Url::parse(&normalized)
        .map_err(|err| SkailarError::configuration("base_url", format!("`{raw}`: {err}")))?;
    if url.cannot_be_a_base() || !matches!(url.scheme(), "http" | "https") {
        return Err(SkailarError::configuration(
            "base_url",
            format!("`{raw}` is not an http(s) base url"),
        ));
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use std::fmt;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures_util::future;
    use tracing::field::{Field, Visit};
    use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

    use super::*;
    use crate::proxy::{ProbeError, ProbeResult};

    /// Check whose outcome is fixed by the test and which counts invocations.
    struct ForcedCheck {
        online: bool,
        calls: AtomicUsize,
    }

    impl ForcedCheck {
        fn new(online: bool) -> Arc<Self> {
            Arc::new(Self {
                online,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ReachabilityCheck for ForcedCheck {
        async fn check(&self, _target: &Url, _endpoint: &ProxyEndpoint) -> Result<(), ProbeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.online {
                Ok(())
            } else {
                Err(ProbeError::Unreachable("connection refused".to_string()))
            }
        }
    }

    struct NeverAnswers;

    #[async_trait]
    impl ReachabilityCheck for NeverAnswers {
        async fn check(&self, _target: &Url, _endpoint: &ProxyEndpoint) -> Result<(), ProbeError> {
            future::pending::<()>().await;
            Ok(())
        }
    }

    fn headers() -> HashMap<String, String> {
        HashMap::from([("Authorization".to_string(), "Bearer k".to_string())])
    }

    fn proxy() -> ProxyConfig {
        ProxyConfig::new("10.0.0.2", 3128, "http").with_auth("user", "pass")
    }

    #[tokio::test]
    async fn no_proxy_returns_direct_client_without_probing() {
        let check = ForcedCheck::new(true);
        let provider = ClientProvider::with_check(check.clone());

        let client = provider
            .get_instance(InstanceRequest::new("https://api.example/v1/", headers()))
            .await
            .expect("client");

        assert_eq!(client.base_url().as_str(), "https://api.example/v1/");
        assert!(client.proxy().is_none());
        assert_eq!(check.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            client.headers().get("Authorization"),
            Some(&"Bearer k".to_string())
        );
    }

    #[tokio::test]
    async fn online_proxy_routes_through_endpoint() {
        let check = ForcedCheck::new(true);
        let provider = ClientProvider::with_check(check.clone());

        let client = provider
            .get_instance(
                InstanceRequest::new("https://api.example/v1/", headers())
                    .with_proxy(Some(proxy())),
            )
            .await
            .expect("client");

        let endpoint = client.proxy().expect("proxied client");
        assert_eq!(endpoint.host, "10.0.0.2");
        assert_eq!(endpoint.port, 3128);
        assert_eq!(endpoint.auth.as_ref().unwrap().username, "user");
        assert_eq!(check.calls.load(Ordering::SeqCst), 1);
        assert_eq!(provider.pending_probe_timers(), 0);
    }

    #[tokio::test]
    async fn offline_proxy_falls_back_to_direct() {
        let check = ForcedCheck::new(false);
        let provider = ClientProvider::with_check(check.clone());

        let client = provider
            .get_instance(
                InstanceRequest::new("https://api.example/v1/", headers())
                    .with_proxy(Some(proxy()))
                    .with_debug_logging(true),
            )
            .await
            .expect("unreachable proxy must not fail the call");

        assert_eq!(client.route(), &Route::Direct);
        assert_eq!(check.calls.load(Ordering::SeqCst), 1);
        assert_eq!(provider.pending_probe_timers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_timeout_falls_back_and_releases_timer() {
        let provider = ClientProvider::with_check(Arc::new(NeverAnswers))
            .with_probe_timeout(Duration::from_millis(250));

        let client = provider
            .get_instance(
                InstanceRequest::new("https://api.example/v1/", headers())
                    .with_proxy(Some(proxy())),
            )
            .await
            .expect("client");

        assert!(client.proxy().is_none());
        assert_eq!(provider.pending_probe_timers(), 0);
    }

    #[tokio::test]
    async fn invalid_proxy_is_a_configuration_error_and_skips_probe() {
        let check = ForcedCheck::new(true);
        let provider = ClientProvider::with_check(check.clone());

        for bad in [
            ProxyConfig::new("10.0.0.2", 0, "http"),
            ProxyConfig::new("10.0.0.2", 70000, "http"),
            ProxyConfig::new("10.0.0.2", 3128, "ftp"),
        ] {
            let err = provider
                .get_instance(
                    InstanceRequest::new("https://api.example/v1/", headers())
                        .with_proxy(Some(bad)),
                )
                .await
                .expect_err("invalid proxy");
            assert!(matches!(err, SkailarError::Configuration { .. }));
        }
        assert_eq!(check.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn each_call_probes_again_without_registry() {
        let check = ForcedCheck::new(true);
        let provider = ClientProvider::with_check(check.clone());
        let request =
            InstanceRequest::new("https://api.example/v1/", headers()).with_proxy(Some(proxy()));

        provider.get_instance(request.clone()).await.unwrap();
        provider.get_instance(request).await.unwrap();
        assert_eq!(check.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn registry_reuses_probe_results() {
        let check = ForcedCheck::new(false);
        let registry = Arc::new(ProbeRegistry::new(Duration::from_secs(60)));
        let provider = ClientProvider::with_check(check.clone()).with_registry(registry.clone());
        let request =
            InstanceRequest::new("https://api.example/v1", headers()).with_proxy(Some(proxy()));

        for _ in 0..3 {
            let client = provider.get_instance(request.clone()).await.unwrap();
            assert!(client.proxy().is_none());
        }
        assert_eq!(check.calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);

        registry.clear();
        provider.get_instance(request).await.unwrap();
        assert_eq!(check.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn transport_factory_sees_decided_route() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        let provider = ClientProvider::with_check(ForcedCheck::new(true)).with_transport_factory(
            Arc::new(move |route: &Route| {
                recorder.lock().unwrap().push(route.label());
                dyn_transport_for_route(route)
            }),
        );

        provider
            .get_instance(
                InstanceRequest::new("https://api.example/v1/", headers())
                    .with_proxy(Some(proxy())),
            )
            .await
            .unwrap();
        provider
            .get_instance(InstanceRequest::new("https://api.example/v1/", headers()))
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["proxied", "direct"]);
    }

    type Fields = HashMap<String, String>;

    /// Layer keeping the fields of every decision event.
    #[derive(Clone, Default)]
    struct DecisionEvents(Arc<Mutex<Vec<Fields>>>);

    struct FieldMap<'a>(&'a mut Fields);

    impl Visit for FieldMap<'_> {
        fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
            self.0.insert(field.name().to_string(), format!("{value:?}"));
        }

        fn record_str(&mut self, field: &Field, value: &str) {
            self.0.insert(field.name().to_string(), value.to_string());
        }

        fn record_u64(&mut self, field: &Field, value: u64) {
            self.0.insert(field.name().to_string(), value.to_string());
        }

        fn record_bool(&mut self, field: &Field, value: bool) {
            self.0.insert(field.name().to_string(), value.to_string());
        }
    }

    impl<S: tracing::Subscriber> Layer<S> for DecisionEvents {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            if event.metadata().target() != "skailar::proxy" {
                return;
            }
            let mut fields = Fields::new();
            event.record(&mut FieldMap(&mut fields));
            self.0.lock().unwrap().push(fields);
        }
    }

    async fn decision_events(provider: &ClientProvider, request: InstanceRequest) -> Vec<Fields> {
        let events = DecisionEvents::default();
        let _guard =
            tracing::subscriber::set_default(tracing_subscriber::registry().with(events.clone()));
        provider.get_instance(request).await.expect("client");
        events.0.lock().unwrap().clone()
    }

    fn elapsed_ms(fields: &Fields) -> u64 {
        fields
            .get("elapsed_ms")
            .expect("elapsed_ms field")
            .parse()
            .expect("numeric elapsed_ms")
    }

    #[tokio::test]
    async fn decision_event_for_direct_client() {
        let provider = ClientProvider::with_check(ForcedCheck::new(true));
        let events = decision_events(
            &provider,
            InstanceRequest::new("https://api.example/v1/", headers()).with_debug_logging(true),
        )
        .await;

        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["route"], "direct");
        assert_eq!(events[0]["probe"], "skipped");
        assert_eq!(events[0]["base_url"], "https://api.example/v1/");
        assert!(!events[0].contains_key("elapsed_ms"));
    }

    #[tokio::test]
    async fn decision_event_for_online_proxy() {
        let provider = ClientProvider::with_check(ForcedCheck::new(true));
        let events = decision_events(
            &provider,
            InstanceRequest::new("https://api.example/v1/", headers())
                .with_proxy(Some(proxy()))
                .with_debug_logging(true),
        )
        .await;

        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["route"], "proxied");
        assert_eq!(events[0]["probe"], "online");
        assert_eq!(events[0]["cached"], "false");
        assert_eq!(events[0]["failure"], "");
        assert!(elapsed_ms(&events[0]) < DEFAULT_PROBE_TIMEOUT.as_millis() as u64);
    }

    #[tokio::test]
    async fn decision_event_for_offline_proxy() {
        let provider = ClientProvider::with_check(ForcedCheck::new(false));
        let events = decision_events(
            &provider,
            InstanceRequest::new("https://api.example/v1/", headers())
                .with_proxy(Some(proxy()))
                .with_debug_logging(true),
        )
        .await;

        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["route"], "direct");
        assert_eq!(events[0]["probe"], "offline");
        assert!(events[0]["failure"].contains("connection refused"));
        elapsed_ms(&events[0]);
    }

    #[tokio::test(start_paused = true)]
    async fn decision_event_reports_time_spent_waiting_for_bound() {
        let provider = ClientProvider::with_check(Arc::new(NeverAnswers))
            .with_probe_timeout(Duration::from_millis(250));
        let events = decision_events(
            &provider,
            InstanceRequest::new("https://api.example/v1/", headers())
                .with_proxy(Some(proxy()))
                .with_debug_logging(true),
        )
        .await;

        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["probe"], "offline");
        assert!(elapsed_ms(&events[0]) >= 250);
        assert!(events[0]["failure"].starts_with("timed out"));
    }

    #[tokio::test]
    async fn no_decision_event_without_debug_logging() {
        let provider = ClientProvider::with_check(ForcedCheck::new(true));
        for request in [
            InstanceRequest::new("https://api.example/v1/", headers()),
            InstanceRequest::new("https://api.example/v1/", headers()).with_proxy(Some(proxy())),
        ] {
            assert!(decision_events(&provider, request).await.is_empty());
        }
    }

    #[test]
    fn base_url_is_normalized_and_validated() {
        assert_eq!(
            parse_base_url("https://api.example/v1").unwrap().as_str(),
            "https://api.example/v1/"
        );
        assert!(matches!(
            parse_base_url("not a url"),
            Err(SkailarError::Configuration { .. })
        ));
        assert!(matches!(
            parse_base_url("ftp://files.example/"),
            Err(SkailarError::Configuration { .. })
        ));
    }

    #[test]
    fn probe_result_is_exposed_for_cached_reports() {
        let report = ProbeReport::from_cache(ProbeResult::Online);
        assert!(report.cached);
        assert_eq!(report.elapsed, Duration::ZERO);
    }
}
