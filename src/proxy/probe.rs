//! Bounded-time proxy reachability check.
//!
//! A probe races one [`ReachabilityCheck`] against a deadline. Whichever side loses is
//! dropped when the race ends, so a probe never leaves a timer or a request behind.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::redirect::Policy;
use reqwest::{Proxy, StatusCode};
use thiserror::Error;
use tokio::time::{Instant, Sleep};
use url::Url;

use super::config::ProxyEndpoint;

/// Bound applied when the caller does not choose one.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(5000);

/// Resolved reachability of a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeResult {
    Online,
    Offline,
}

impl ProbeResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeResult::Online => "online",
            ProbeResult::Offline => "offline",
        }
    }

    pub fn is_online(&self) -> bool {
        matches!(self, ProbeResult::Online)
    }
}

/// Why a check did not succeed. Only ever logged; callers see [`ProbeResult::Offline`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("unreachable: {0}")]
    Unreachable(String),
    #[error("proxy answered with status {0}")]
    Status(u16),
}

/// Outcome of one probe invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub result: ProbeResult,
    pub elapsed: Duration,
    /// Failure reason when the result is [`ProbeResult::Offline`].
    pub failure: Option<String>,
    /// `true` when the result was served from a [`super::ProbeRegistry`].
    pub cached: bool,
}

impl ProbeReport {
    pub(crate) fn from_cache(result: ProbeResult) -> Self {
        Self {
            result,
            elapsed: Duration::ZERO,
            failure: None,
            cached: true,
        }
    }
}

/// Single connectivity attempt against a proxy endpoint.
///
/// `target` is the API base URL the proxy would carry traffic to. Implementations
/// should not apply their own timeout; [`Probe`] bounds the call.
#[async_trait]
pub trait ReachabilityCheck: Send + Sync {
    async fn check(&self, target: &Url, endpoint: &ProxyEndpoint) -> Result<(), ProbeError>;
}

/// Checks a proxy by relaying `HEAD` of the target's origin through it.
///
/// The request goes out in absolute form (or through `CONNECT` for https targets),
/// exactly like the traffic the proxied client will send later. Any relayed answer
/// counts as reachable, whatever the origin says. Connection and TLS failures, `407`,
/// and the gateway statuses `502`/`503`/`504` count as unreachable.
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpReachabilityCheck;

impl HttpReachabilityCheck {
    pub fn new() -> Self {
        Self
    }

    fn relay_client(endpoint: &ProxyEndpoint) -> Result<reqwest::Client, ProbeError> {
        let mut proxy = Proxy::all(endpoint.url())
            .map_err(|err| ProbeError::Unreachable(format!("invalid proxy url: {err}")))?;
        if let Some(auth) = &endpoint.auth {
            proxy = proxy.basic_auth(&auth.username, &auth.password);
        }
        reqwest::Client::builder()
            .proxy(proxy)
            .redirect(Policy::none())
            .build()
            .map_err(|err| ProbeError::Unreachable(format!("failed to create probe client: {err}")))
    }
}

#[async_trait]
impl ReachabilityCheck for HttpReachabilityCheck {
    async fn check(&self, target: &Url, endpoint: &ProxyEndpoint) -> Result<(), ProbeError> {
        let origin = target
            .join("/")
            .map_err(|err| ProbeError::Unreachable(format!("invalid target `{target}`: {err}")))?;
        let client = Self::relay_client(endpoint)?;

        let response = client
            .head(origin)
            .send()
            .await
            .map_err(|err| ProbeError::Unreachable(err.to_string()))?;
        match response.status() {
            StatusCode::PROXY_AUTHENTICATION_REQUIRED
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT => Err(ProbeError::Status(response.status().as_u16())),
            _ => Ok(()),
        }
    }
}

/// Armed timer bounding one probe. Dropping it is the only way to disarm it.
struct ProbeDeadline {
    sleep: Pin<Box<Sleep>>,
    pending: Arc<AtomicUsize>,
}

impl ProbeDeadline {
    fn arm(bound: Duration, pending: Arc<AtomicUsize>) -> Self {
        pending.fetch_add(1, Ordering::SeqCst);
        Self {
            sleep: Box::pin(tokio::time::sleep(bound)),
            pending,
        }
    }
}

impl Future for ProbeDeadline {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        self.sleep.as_mut().poll(cx)
    }
}

impl Drop for ProbeDeadline {
    fn drop(&mut self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Reachability probe with a fixed bound.
pub struct Probe {
    check: Arc<dyn ReachabilityCheck>,
    bound: Duration,
    pending: Arc<AtomicUsize>,
}

impl Probe {
    pub fn new(check: Arc<dyn ReachabilityCheck>, bound: Duration) -> Self {
        Self {
            check,
            bound,
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn bound(&self) -> Duration {
        self.bound
    }

    pub(crate) fn set_bound(&mut self, bound: Duration) {
        self.bound = bound;
    }

    /// Number of deadlines currently armed across all in-flight runs.
    pub fn pending_timers(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Runs one check of `endpoint` towards `target`, resolving to `Offline` on failure
    /// or timeout.
    ///
    /// # Examples
    ///
    /// ```
    /// # use std::sync::Arc;
    /// # use std::time::Duration;
    /// # use async_trait::async_trait;
    /// # use url::Url;
    /// # use skailar::proxy::{Probe, ProbeError, ProbeResult, ProxyConfig, ProxyEndpoint, ReachabilityCheck};
    /// struct AlwaysUp;
    ///
    /// #[async_trait]
    /// impl ReachabilityCheck for AlwaysUp {
    ///     async fn check(&self, _target: &Url, _endpoint: &ProxyEndpoint) -> Result<(), ProbeError> {
    ///         Ok(())
    ///     }
    /// }
    ///
    /// # tokio::runtime::Runtime::new().unwrap().block_on(async {
    /// let probe = Probe::new(Arc::new(AlwaysUp), Duration::from_millis(200));
    /// let endpoint = ProxyConfig::new("127.0.0.1", 3128, "http").validate().unwrap();
    /// let target = Url::parse("https://api.skailar.net/v1/").unwrap();
    /// let report = probe.run(&target, &endpoint).await;
    /// assert_eq!(report.result, ProbeResult::Online);
    /// assert_eq!(probe.pending_timers(), 0);
    /// # });
    /// ```
    pub async fn run(&self, target: &Url, endpoint: &ProxyEndpoint) -> ProbeReport {
        let started = Instant::now();
        let mut deadline = ProbeDeadline::arm(self.bound, Arc::clone(&self.pending));

        let outcome = tokio::select! {
            outcome = self.check.check(target, endpoint) => outcome,
            _ = &mut deadline => Err(ProbeError::Timeout(self.bound)),
        };
        drop(deadline);

        let elapsed = started.elapsed();
        match outcome {
            Ok(()) => ProbeReport {
                result: ProbeResult::Online,
                elapsed,
                failure: None,
                cached: false,
            },
            Err(err) => {
                tracing::debug!(proxy = %endpoint, error = %err, "proxy probe failed");
                ProbeReport {
                    result: ProbeResult::Offline,
                    elapsed,
                    failure: Some(err.to_string()),
                    cached: false,
                }
            }
        }
    }
}
