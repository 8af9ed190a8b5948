//! Proxy-aware client provisioning.
//!
//! For every call the provider decides whether traffic goes through the configured
//! forward proxy. A proxy is used only after a bounded reachability probe reports it
//! online; otherwise the caller gets a direct client.

pub mod config;
pub mod probe;
pub mod provider;
pub mod registry;

pub use config::{ProxyAuth, ProxyConfig, ProxyEndpoint, ProxyProtocol};
pub use probe::{
    DEFAULT_PROBE_TIMEOUT, HttpReachabilityCheck, Probe, ProbeError, ProbeReport, ProbeResult,
    ReachabilityCheck,
};
pub use provider::{
    ClientProvider, DynInstanceProvider, InstanceProvider, InstanceRequest, TransportFactory,
};
pub use registry::{ProbeKey, ProbeRegistry};
