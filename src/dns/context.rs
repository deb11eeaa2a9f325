//! Shared runtime state handed to both front-ends: the cache, the override
//! table, and the two outbound clients.

use std::sync::Arc;
use std::time::Duration;

use derive_more::{Display, Error, From};

use crate::dns::cache::Cache;
use crate::dns::client::{ClientError, DnsClient, DnsNetworkClient};
use crate::dns::doh_client::{Dialect, DohClient, DohClientConfig};
use crate::dns::override_table::OverrideTable;
use crate::dns::shutdown::ShutdownHandle;

#[derive(Debug, Display, From, Error)]
pub enum ContextError {
    Client(ClientError),
    Io(std::io::Error),
}

type Result<T> = std::result::Result<T, ContextError>;

/// Front-end enable flags and listen addresses, set once at startup from
/// `crate::config::Config`.
#[derive(Clone, Debug)]
pub struct FrontendConfig {
    pub dns_enabled: bool,
    pub dns_listen: String,
    pub doh_enabled: bool,
    pub doh_listen: String,
    pub wire_path: String,
    pub json_path: String,
    pub monitor_listen: Option<String>,
}

/// Shared state reachable from both front-ends. The DNS front-end consults
/// `cache` → `overrides` → `doh_client`; the HTTPS front-end resolves every
/// request against `dns_client`, optionally through `overrides`.
pub struct ServerContext {
    pub cache: Option<Cache>,
    pub overrides: OverrideTable,
    pub dns_client: Arc<DnsNetworkClient>,
    pub doh_client: DohClient,
    pub classic_upstream: (String, u16),
    pub frontend: FrontendConfig,
    pub request_timeout: Duration,
    /// Handle to the process's tokio runtime, used by the OS-thread worker
    /// pools in `dns::server` to drive the async cache/DoH-client calls.
    pub rt_handle: tokio::runtime::Handle,
    /// Shared shutdown flag and in-flight counter, consulted by every
    /// front-end's worker loop before picking up new work.
    pub shutdown: ShutdownHandle,
}

impl ServerContext {
    pub fn new(
        cache: Option<Cache>,
        overrides: OverrideTable,
        doh_endpoint: String,
        dialect: Dialect,
        classic_upstream: (String, u16),
        frontend: FrontendConfig,
        request_timeout: Duration,
        rt_handle: tokio::runtime::Handle,
    ) -> Result<ServerContext> {
        let dns_client = Arc::new(DnsNetworkClient::new(0)?);

        let doh_client = DohClient::new(DohClientConfig {
            endpoint: doh_endpoint,
            dialect,
            timeout: request_timeout,
        });

        Ok(ServerContext {
            cache,
            overrides,
            dns_client,
            doh_client,
            classic_upstream,
            frontend,
            request_timeout,
            rt_handle,
            shutdown: ShutdownHandle::new(),
        })
    }

    /// Starts the classic DNS client's background reader/timeout threads.
    /// Must run once before the client can be used to resolve anything.
    pub fn run(&self) -> Result<()> {
        self.dns_client.run()?;
        Ok(())
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::dns::client::tests::{DnsStubClient, StubCallback};
    use crate::dns::protocol::QueryType;
    use std::sync::Arc as StdArc;

    /// A `ServerContext`-shaped test double: real cache/overrides/doh client,
    /// but a stubbed classic client plumbed in separately since the HTTPS
    /// front-end takes its `DnsClient` by trait object, not via `ServerContext`.
    pub fn test_doh_client(endpoint: String, dialect: Dialect) -> DohClient {
        DohClient::new(DohClientConfig {
            endpoint,
            dialect,
            timeout: Duration::from_secs(2),
        })
    }

    pub fn test_stub_client(callback: Box<StubCallback>) -> StdArc<dyn DnsClient + Send + Sync> {
        StdArc::new(DnsStubClient::new(callback))
    }

    #[test]
    fn frontend_config_round_trips() {
        let cfg = FrontendConfig {
            dns_enabled: true,
            dns_listen: "127.0.0.1:5300".into(),
            doh_enabled: true,
            doh_listen: "127.0.0.1:8443".into(),
            wire_path: "/dns-query".into(),
            json_path: "/resolve".into(),
            monitor_listen: Some("127.0.0.1:9100".into()),
        };
        assert!(cfg.dns_enabled && cfg.doh_enabled);
        let _ = QueryType::A;
    }
}
