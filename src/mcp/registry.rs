//! Service registry.
//!
//! Holds every registered protocol client, routes tool calls to the best
//! available service, retries retryable failures, caches read-only results
//! and runs the health monitor. The registry is a cheap handle: clones
//! share the same state, and nothing about it is global.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;

use super::cache::{CacheKey, CachePolicy, CacheStats, ResultCache};
use super::client::{ProtocolClient, ValidationReport};
use super::health::{HealthAlert, HealthMonitor, HealthPolicy, HealthStatus, ProbeOutcome};
use super::manifest::{ToolCatalog, ToolManifest};
use crate::core::{retry_async, McpError, RetryPolicy};

/// Error type for registry construction.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Service registered twice: {0}")]
    DuplicateService(String),

    #[error("Invalid tool catalog: {}", .0.join("; "))]
    InvalidCatalog(Vec<String>),

    #[error("Client error: {0}")]
    Client(#[from] McpError),
}

/// Static per-service settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    pub enabled: bool,
    /// Higher wins when services offer the same tool
    pub priority: i32,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self { enabled: true, priority: 0 }
    }
}

/// Public view of a registered service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDescriptor {
    pub name: String,
    pub base_url: String,
    /// Configured on, correctly configured and not DOWN
    pub enabled: bool,
    pub priority: i32,
    pub supported_tools: BTreeSet<String>,
}

/// Per-call overrides for [`ServiceRegistry::execute_tool_with`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// Call the owning service even if it is disabled or DOWN
    pub force: bool,
    /// Skip the cache lookup (the fresh result is still stored)
    pub bypass_cache: bool,
    /// Override the client's attempt budget
    pub max_attempts: Option<u32>,
}

/// A tool routed to the service that will run it.
#[derive(Debug, Clone)]
pub struct ResolvedTool {
    pub manifest: ToolManifest,
    pub client: Arc<dyn ProtocolClient>,
}

struct ServiceEntry {
    client: Arc<dyn ProtocolClient>,
    settings: ServiceSettings,
    /// Result of configuration validation at build time
    configured: bool,
    tools: BTreeSet<String>,
}

struct RegistryInner {
    services: RwLock<BTreeMap<String, ServiceEntry>>,
    catalog: ToolCatalog,
    health: HealthMonitor,
    cache: ResultCache,
    retry: RetryPolicy,
    monitor: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        if let Some(handle) = self.monitor.get_mut().take() {
            handle.abort();
        }
    }
}

/// Builder for [`ServiceRegistry`].
pub struct RegistryBuilder {
    services: Vec<(Arc<dyn ProtocolClient>, ServiceSettings)>,
    manifests: Vec<ToolManifest>,
    health: HealthPolicy,
    cache: CachePolicy,
    retry: RetryPolicy,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self {
            services: Vec::new(),
            manifests: Vec::new(),
            health: HealthPolicy::default(),
            cache: CachePolicy::default(),
            retry: RetryPolicy::default(),
        }
    }

    /// Register a client with default settings.
    pub fn register(self, client: impl ProtocolClient + 'static) -> Self {
        self.register_with(Arc::new(client), ServiceSettings::default())
    }

    /// Register a shared client with explicit settings.
    pub fn register_with(
        mut self,
        client: Arc<dyn ProtocolClient>,
        settings: ServiceSettings,
    ) -> Self {
        self.services.push((client, settings));
        self
    }

    pub fn manifest(mut self, manifest: ToolManifest) -> Self {
        self.manifests.push(manifest);
        self
    }

    pub fn manifests(mut self, manifests: impl IntoIterator<Item = ToolManifest>) -> Self {
        self.manifests.extend(manifests);
        self
    }

    pub fn health_policy(mut self, policy: HealthPolicy) -> Self {
        self.health = policy;
        self
    }

    pub fn cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache = policy;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Build using each client's declared tools.
    pub fn build(self) -> Result<ServiceRegistry, RegistryError> {
        self.build_with_tools(HashMap::new())
    }

    /// Build, asking services that declare no tools for their tool list.
    ///
    /// Discovery failures are logged and leave the service without tools.
    pub async fn build_with_discovery(self) -> Result<ServiceRegistry, RegistryError> {
        let timeout = self.health.probe_timeout();
        let pending: Vec<_> = self
            .services
            .iter()
            .filter(|(client, _)| client.supported_tools().is_empty())
            .map(|(client, _)| Arc::clone(client))
            .collect();

        let lookups = pending.into_iter().map(|client| async move {
            let name = client.service_name().to_string();
            match tokio::time::timeout(timeout, client.discover_tools()).await {
                Ok(Ok(tools)) => {
                    tracing::info!(service = %name, count = tools.len(), "Discovered tools");
                    Some((name, tools))
                }
                Ok(Err(e)) => {
                    tracing::warn!(service = %name, error = %e, "Tool discovery failed");
                    None
                }
                Err(_) => {
                    tracing::warn!(service = %name, "Tool discovery timed out");
                    None
                }
            }
        });

        let discovered = futures::future::join_all(lookups).await.into_iter().flatten().collect();
        self.build_with_tools(discovered)
    }

    fn build_with_tools(
        self,
        mut discovered: HashMap<String, Vec<String>>,
    ) -> Result<ServiceRegistry, RegistryError> {
        let mut services = BTreeMap::new();

        for (client, settings) in self.services {
            let name = client.service_name().to_string();
            if services.contains_key(&name) {
                return Err(RegistryError::DuplicateService(name));
            }

            let report = client.validate_configuration();
            for warning in &report.warnings {
                tracing::warn!(service = %name, "{}", warning);
            }
            if !report.is_valid() {
                tracing::warn!(service = %name, errors = ?report.errors, "Service is misconfigured and will stay disabled");
            }

            let tools: BTreeSet<String> = match discovered.remove(&name) {
                Some(tools) => tools.into_iter().collect(),
                None => client.supported_tools().iter().cloned().collect(),
            };

            services.insert(name, ServiceEntry { client, settings, configured: report.is_valid(), tools });
        }

        let mut catalog: ToolCatalog = self.manifests.into_iter().collect();
        let known: HashSet<String> = services.keys().cloned().collect();
        let report = catalog.validate(&known);
        for warning in &report.warnings {
            tracing::warn!("{}", warning);
        }
        if !report.is_valid() {
            return Err(RegistryError::InvalidCatalog(report.errors));
        }

        for (name, entry) in &services {
            for tool in &entry.tools {
                if catalog.get(tool, name).is_none() {
                    catalog.insert(ToolManifest::new(tool, name).with_priority(entry.settings.priority));
                }
            }
        }

        let names: Vec<String> = services.keys().cloned().collect();
        tracing::debug!(services = names.len(), tools = catalog.len(), "Service registry built");

        Ok(ServiceRegistry {
            inner: Arc::new(RegistryInner {
                health: HealthMonitor::new(self.health, names.iter().cloned()),
                cache: ResultCache::new(self.cache, names),
                services: RwLock::new(services),
                catalog,
                retry: self.retry,
                monitor: Mutex::new(None),
                destroyed: AtomicBool::new(false),
            }),
        })
    }
}

/// Routes tool calls across registered services.
#[derive(Clone)]
pub struct ServiceRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.inner.services.read().keys().collect::<Vec<_>>())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl ServiceRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    fn ensure_alive(&self) -> Result<(), McpError> {
        if self.is_destroyed() {
            Err(McpError::destroyed())
        } else {
            Ok(())
        }
    }

    /// Whether `service` may receive calls right now.
    fn is_enabled(&self, service: &str, entry: &ServiceEntry) -> bool {
        entry.settings.enabled && entry.configured && !self.inner.health.is_down(service)
    }

    /// One descriptor per registered service.
    pub fn get_services(&self) -> Vec<ServiceDescriptor> {
        self.inner
            .services
            .read()
            .iter()
            .map(|(name, entry)| ServiceDescriptor {
                name: name.clone(),
                base_url: entry.client.configuration().server_url.clone(),
                enabled: self.is_enabled(name, entry),
                priority: entry.settings.priority,
                supported_tools: entry.tools.clone(),
            })
            .collect()
    }

    /// Latest health snapshot, one entry per service.
    pub fn get_service_status(&self) -> BTreeMap<String, HealthStatus> {
        self.inner.health.snapshot().iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    /// Manifests of every tool that can be called right now, one per tool
    /// name, picked by priority.
    pub fn get_available_tools(&self) -> Vec<ToolManifest> {
        let services = self.inner.services.read();
        let mut ids: Vec<&str> = self.inner.catalog.iter().map(|m| m.id.as_str()).collect();
        ids.dedup();

        ids.into_iter()
            .filter_map(|id| {
                best_offer(self.inner.catalog.offers(id), |m| {
                    services.get(&m.service).is_some_and(|e| self.is_enabled(&m.service, e))
                })
                .cloned()
            })
            .collect()
    }

    /// Pick the service that should run `name`.
    pub fn resolve_tool(&self, name: &str, force: bool) -> Result<ResolvedTool, McpError> {
        self.ensure_alive()?;

        let services = self.inner.services.read();
        let offers = self.inner.catalog.offers(name);
        let registered = |m: &ToolManifest| services.contains_key(&m.service);

        let Some(best_any) = best_offer(offers, registered) else {
            return Err(McpError::tool_not_found(name));
        };

        let chosen = match best_offer(offers, |m| {
            services.get(&m.service).is_some_and(|e| self.is_enabled(&m.service, e))
        }) {
            Some(manifest) => manifest,
            None if force => best_any,
            None => return Err(McpError::service_not_available(best_any.service.clone(), name)),
        };

        let entry = services.get(&chosen.service).ok_or_else(McpError::destroyed)?;
        Ok(ResolvedTool { manifest: chosen.clone(), client: Arc::clone(&entry.client) })
    }

    pub async fn execute_tool(&self, name: &str, args: &Value) -> Result<Value, McpError> {
        self.execute_tool_with(name, args, ExecuteOptions::default()).await
    }

    /// Execute a tool on its best available service, with retries and
    /// caching.
    pub async fn execute_tool_with(
        &self,
        name: &str,
        args: &Value,
        options: ExecuteOptions,
    ) -> Result<Value, McpError> {
        let resolved = self.resolve_tool(name, options.force)?;
        self.execute_resolved(resolved, name, args, options).await
    }

    /// Execute a tool on the service it was already routed to, with retries
    /// and caching.
    pub async fn execute_resolved(
        &self,
        resolved: ResolvedTool,
        name: &str,
        args: &Value,
        options: ExecuteOptions,
    ) -> Result<Value, McpError> {
        let ResolvedTool { manifest, client } = resolved;
        let service = manifest.service.as_str();

        let cacheable = manifest.is_cacheable() && self.inner.cache.is_enabled();
        let key = cacheable.then(|| CacheKey::new(service, name, args));
        if let (Some(key), false) = (&key, options.bypass_cache) {
            if let Some(value) = self.inner.cache.get(key) {
                tracing::debug!(service = %service, tool = %name, "Cache hit");
                return Ok(value);
            }
        }

        let config = client.configuration();
        let timeout = config.timeout;
        let max_attempts = options.max_attempts.unwrap_or_else(|| config.max_attempts()).max(1);

        tracing::debug!(service = %service, tool = %name, max_attempts, "Executing tool");
        let started = Instant::now();

        let outcome = retry_async(&self.inner.retry, max_attempts, |_attempt| {
            let client = Arc::clone(&client);
            async move {
                if let Err(e) = self.ensure_alive() {
                    return Err(e);
                }
                match tokio::time::timeout(timeout, client.execute_tool(name, args)).await {
                    Ok(result) => result.map_err(|e| e.with_tool(name)),
                    Err(_) => Err(McpError::timeout(service, timeout).with_tool(name)),
                }
            }
        })
        .await;

        let attempts = outcome.attempts;
        match outcome.into_result(max_attempts) {
            Ok(value) => {
                tracing::debug!(
                    service = %service,
                    tool = %name,
                    attempts,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Tool call succeeded"
                );
                if let Some(key) = key {
                    if !self.is_destroyed() {
                        self.inner.cache.insert(key, value.clone());
                    }
                }
                Ok(value)
            }
            Err(e) => {
                tracing::warn!(service = %service, tool = %name, attempts, error = %e, "Tool call failed");
                Err(e)
            }
        }
    }

    /// The client registered under `service`.
    pub fn client(&self, service: &str) -> Option<Arc<dyn ProtocolClient>> {
        self.inner.services.read().get(service).map(|e| Arc::clone(&e.client))
    }

    /// Probe every service concurrently and publish one snapshot.
    pub async fn check_all_services_health(&self) -> BTreeMap<String, HealthStatus> {
        if self.is_destroyed() {
            return self.get_service_status();
        }

        let policy = self.inner.health.policy().clone();
        let probe_timeout = policy.probe_timeout();
        let clients: Vec<(String, Arc<dyn ProtocolClient>)> = self
            .inner
            .services
            .read()
            .iter()
            .map(|(name, entry)| (name.clone(), Arc::clone(&entry.client)))
            .collect();

        let results: Arc<Mutex<HashMap<String, ProbeOutcome>>> = Arc::default();
        let probes = clients.into_iter().map(|(name, client)| {
            let results = Arc::clone(&results);
            async move {
                let started = Instant::now();
                let outcome = match tokio::time::timeout(probe_timeout, client.health_check()).await {
                    Ok(probe) => ProbeOutcome::from_probe(probe, started.elapsed()),
                    Err(_) => ProbeOutcome::timed_out(probe_timeout),
                };
                results.lock().insert(name, outcome);
            }
        });

        if tokio::time::timeout(policy.aggregate_timeout(), futures::future::join_all(probes))
            .await
            .is_err()
        {
            tracing::warn!(
                timeout_ms = policy.aggregate_timeout().as_millis() as u64,
                "Health check cycle hit the aggregate timeout"
            );
        }

        if self.is_destroyed() {
            tracing::debug!("Registry destroyed during health check; discarding results");
            return self.get_service_status();
        }

        let outcomes = std::mem::take(&mut *results.lock());
        for alert in self.inner.health.apply_cycle(outcomes) {
            tracing::warn!(service = %alert.service, kind = ?alert.kind, "{}", alert.message);
        }

        let purged = self.inner.cache.purge_expired();
        if purged > 0 {
            tracing::debug!(purged, "Purged expired cache entries");
        }

        self.get_service_status()
    }

    pub fn get_health_alerts(&self) -> Vec<HealthAlert> {
        self.inner.health.alerts()
    }

    pub fn get_cache_stats(&self) -> BTreeMap<String, CacheStats> {
        self.inner.cache.stats()
    }

    /// Clear one service's cache, or all of them.
    pub fn clear_cache(&self, service: Option<&str>) {
        match service {
            Some(service) => self.inner.cache.clear_service(service),
            None => self.inner.cache.clear(),
        }
    }

    /// Configuration report per service.
    pub fn validation_reports(&self) -> BTreeMap<String, ValidationReport> {
        self.inner
            .services
            .read()
            .iter()
            .map(|(name, entry)| (name.clone(), entry.client.validate_configuration()))
            .collect()
    }

    /// Run health checks on the configured interval in a background task.
    ///
    /// The task holds only a weak reference, so dropping every registry
    /// handle ends it. Calling this twice is a no-op.
    pub fn start_health_monitoring(&self) -> Result<(), McpError> {
        self.ensure_alive()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            McpError::configuration("registry", "health monitoring needs a tokio runtime")
        })?;

        let mut monitor = self.inner.monitor.lock();
        if monitor.as_ref().is_some_and(|h| !h.is_finished()) {
            return Ok(());
        }

        let weak: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        let interval = self.inner.health.policy().interval();
        tracing::info!(interval_secs = interval.as_secs(), "Starting health monitoring");

        *monitor = Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let registry = ServiceRegistry { inner };
                if registry.is_destroyed() {
                    break;
                }
                registry.check_all_services_health().await;
            }
        }));
        Ok(())
    }

    pub fn stop_health_monitoring(&self) {
        if let Some(handle) = self.inner.monitor.lock().take() {
            handle.abort();
            tracing::info!("Stopped health monitoring");
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.inner.monitor.lock().as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop monitoring, clear caches and drop every client.
    ///
    /// Idempotent. Calls already in flight finish their current attempt;
    /// anything after fails with a "destroyed" error.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop_health_monitoring();
        self.inner.cache.clear();
        self.inner.services.write().clear();
        tracing::info!("Service registry destroyed");
    }
}

/// Highest priority manifest among `offers` accepted by `filter`; ties go to
/// the alphabetically first service.
fn best_offer<'a>(
    offers: &'a [ToolManifest],
    filter: impl Fn(&ToolManifest) -> bool,
) -> Option<&'a ToolManifest> {
    offers.iter().filter(|m| filter(m)).min_by(|a, b| {
        b.priority.cmp(&a.priority).then_with(|| a.service.cmp(&b.service))
    })
}
