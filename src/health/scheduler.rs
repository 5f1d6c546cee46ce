use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::alert::AlertEmitter;
use super::prober::Prober;
use super::tracker::{FailureTracker, TrackerOutcome};
use crate::config::{HealthConfig, HEALTH_SNAPSHOT_TTL};
use crate::error::Result;
use crate::models::{HealthMetrics, HealthSnapshot, HealthUpdate, NewProxy, ProbeResult, Proxy};
use crate::repository::ProxyRegistry;
use crate::store::SharedStore;

/// Totals of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub checked: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub quarantined: usize,
    pub recovered: usize,
    /// Persist, store or task failures; the sweep carries on past them
    pub errors: usize,
}

impl SweepReport {
    fn add(&mut self, outcome: &CheckOutcome) {
        self.checked += 1;
        if outcome.result.success {
            self.healthy += 1;
        } else {
            self.unhealthy += 1;
        }
        match outcome.tracked {
            Some(TrackerOutcome::Quarantined { .. }) => self.quarantined += 1,
            Some(TrackerOutcome::Recovered) => self.recovered += 1,
            _ => {}
        }
        self.errors += outcome.errors;
    }
}

#[derive(Debug)]
struct CheckOutcome {
    result: ProbeResult,
    tracked: Option<TrackerOutcome>,
    errors: usize,
}

/// Periodic bounded-concurrency health sweep
///
/// Cloning is cheap; every clone drives the same registry, store and prober.
#[derive(Clone)]
pub struct HealthScheduler {
    registry: Arc<dyn ProxyRegistry>,
    store: Arc<dyn SharedStore>,
    prober: Arc<dyn Prober>,
    tracker: FailureTracker,
    config: HealthConfig,
}

impl HealthScheduler {
    pub fn new(
        registry: Arc<dyn ProxyRegistry>,
        store: Arc<dyn SharedStore>,
        prober: Arc<dyn Prober>,
        alerts: AlertEmitter,
        config: HealthConfig,
    ) -> Self {
        let tracker = FailureTracker::new(
            registry.clone(),
            store.clone(),
            alerts,
            config.max_failures,
        );

        Self {
            registry,
            store,
            prober,
            tracker,
            config,
        }
    }

    /// Spawn the sweep driver. The first sweep starts immediately.
    pub fn start(&self, token: CancellationToken) -> SchedulerHandle {
        let this = self.clone();
        let driver_token = token.clone();
        let task = tokio::spawn(async move { this.run(driver_token).await });

        SchedulerHandle { token, task }
    }

    async fn run(self, token: CancellationToken) {
        info!(
            interval_secs = self.config.check_interval.as_secs(),
            max_concurrent = self.config.max_concurrent_checks,
            max_failures = self.config.max_failures,
            "Starting health scheduler"
        );

        let mut ticker = interval(self.config.check_interval);
        // A sweep that overruns the interval pushes the next one back instead of
        // firing a burst of catch-up sweeps.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    info!("Health scheduler shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    match self.sweep(&token).await {
                        Ok(report) => {
                            info!(
                                checked = report.checked,
                                healthy = report.healthy,
                                unhealthy = report.unhealthy,
                                quarantined = report.quarantined,
                                recovered = report.recovered,
                                errors = report.errors,
                                "Health sweep complete"
                            );
                            self.log_metrics().await;
                        }
                        Err(e) => error!("Health sweep failed: {}", e),
                    }
                }
            }
        }
    }

    /// Probe every probe-eligible proxy once, at most `max_concurrent_checks` at a time
    #[instrument(skip(self, token))]
    pub async fn sweep(&self, token: &CancellationToken) -> Result<SweepReport> {
        let proxies = self.registry.list_active().await?;
        let mut report = SweepReport::default();

        if proxies.is_empty() {
            debug!("No proxies to check");
            return Ok(report);
        }

        info!("Checking health of {} proxies", proxies.len());

        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_checks.max(1)));
        let mut tasks = JoinSet::new();

        for proxy in proxies.into_iter().filter(|p| p.status.is_probed()) {
            let this = self.clone();
            let permits = permits.clone();
            let token = token.clone();

            tasks.spawn(async move {
                let _permit = tokio::select! {
                    permit = permits.acquire_owned() => permit.ok()?,
                    _ = token.cancelled() => return None,
                };
                tokio::select! {
                    outcome = this.check(&proxy) => Some(outcome),
                    _ = token.cancelled() => None,
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(outcome)) => report.add(&outcome),
                Ok(None) => {}
                Err(e) => {
                    error!("Health check task failed: {}", e);
                    report.errors += 1;
                }
            }
        }

        Ok(report)
    }

    /// Probe, persist and track one proxy; failures are logged and counted
    async fn check(&self, proxy: &Proxy) -> CheckOutcome {
        let result = self.prober.probe(proxy, self.config.probe_timeout).await;
        let mut errors = 0;

        if let Err(e) = self.persist(proxy, &result).await {
            error!(proxy_id = proxy.id, "Failed to record health check: {}", e);
            errors += 1;
        }

        let tracked = match self.tracker.record(proxy, result.success).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                error!(proxy_id = proxy.id, "Failed to track probe outcome: {}", e);
                errors += 1;
                None
            }
        };

        CheckOutcome {
            result,
            tracked,
            errors,
        }
    }

    async fn persist(&self, proxy: &Proxy, result: &ProbeResult) -> Result<()> {
        let checked_at = Utc::now();
        self.registry
            .update_health(
                proxy.id,
                &HealthUpdate {
                    success: result.success,
                    latency_ms: result.latency_ms,
                    checked_at,
                },
            )
            .await?;

        // The snapshot is observability only.
        let snapshot = HealthSnapshot::new(proxy.id, result, checked_at);
        if let Err(e) = self.store.record_health(&snapshot, HEALTH_SNAPSHOT_TTL).await {
            warn!(proxy_id = proxy.id, "Failed to store health snapshot: {}", e);
        }

        Ok(())
    }

    /// On-demand probe of a single proxy
    ///
    /// Inactive proxies are probed and their health recorded, but their status
    /// is left alone.
    #[instrument(skip(self))]
    pub async fn check_proxy(&self, id: i32) -> Result<ProbeResult> {
        let proxy = self.registry.get(id).await?;
        let result = self.prober.probe(&proxy, self.config.probe_timeout).await;

        self.persist(&proxy, &result).await?;
        if proxy.status.is_probed() {
            self.tracker.record(&proxy, result.success).await?;
        }

        Ok(result)
    }

    /// Register a proxy and test it right away
    ///
    /// A proxy that fails its first check is stored as `error` (quarantined)
    /// rather than rejected, and the sweep recovers it on its first success.
    /// No failure count or alert is raised for it.
    #[instrument(skip(self, req), fields(host = %req.host, port = req.port))]
    pub async fn register(&self, req: &NewProxy) -> Result<(Proxy, ProbeResult)> {
        let proxy = self.registry.create(req).await?;
        let result = self.prober.probe(&proxy, self.config.probe_timeout).await;

        if let Err(e) = self.persist(&proxy, &result).await {
            error!(proxy_id = proxy.id, "Failed to record initial health check: {}", e);
        }

        if !result.success {
            let to = proxy.status.quarantine()?;
            if !self
                .registry
                .transition_status(proxy.id, proxy.status, to)
                .await?
            {
                debug!(proxy_id = proxy.id, "Status changed before initial check completed");
            }
            warn!(
                proxy_id = proxy.id,
                error = result.error.as_deref().unwrap_or_default(),
                "New proxy failed its connectivity test"
            );
        }

        let proxy = self.registry.get(proxy.id).await?;
        info!(
            proxy_id = proxy.id,
            status = %proxy.status,
            latency_ms = result.latency_ms,
            "Registered proxy"
        );
        Ok((proxy, result))
    }

    /// Pool-wide health figures
    pub async fn metrics(&self) -> Result<HealthMetrics> {
        let proxies = self.registry.list_all().await?;
        Ok(HealthMetrics::from_proxies(&proxies))
    }

    async fn log_metrics(&self) {
        match self.metrics().await {
            Ok(m) => info!(
                total = m.total_proxies,
                active = m.active_proxies,
                healthy = m.healthy_proxies,
                quarantined = m.error_proxies,
                inactive = m.inactive_proxies,
                health_rate = m.health_rate,
                avg_response_time_ms = m.avg_response_time_ms,
                "Proxy pool health"
            ),
            Err(e) => warn!("Failed to compute health metrics: {}", e),
        }
    }
}

/// Running scheduler; dropping it leaves the driver running until the token is cancelled
pub struct SchedulerHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Cancel the driver and any in-flight probes, then wait for it to exit
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            error!("Health scheduler task failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::alert::tests::RecordingNotifier;
    use crate::models::{test_proxy, NewProxy, ProxyStatus, ProxyType};
    use crate::repository::InMemoryBackend;
    use crate::store::MemoryStore;
    use crate::error::WardenError;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Prober with per-proxy scripted outcomes (healthy once the script runs out)
    #[derive(Default)]
    struct ScriptedProber {
        scripts: Mutex<HashMap<i32, VecDeque<bool>>>,
        calls: Mutex<Vec<i32>>,
        delay: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ScriptedProber {
        fn with_delay(delay: Duration) -> Self {
            Self {
                delay,
                ..Default::default()
            }
        }

        fn script(&self, id: i32, outcomes: &[bool]) {
            self.scripts
                .lock()
                .entry(id)
                .or_default()
                .extend(outcomes.iter().copied());
        }

        fn calls(&self) -> Vec<i32> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl Prober for ScriptedProber {
        async fn probe(&self, proxy: &Proxy, _timeout: Duration) -> ProbeResult {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.calls.lock().push(proxy.id);

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            let success = self
                .scripts
                .lock()
                .get_mut(&proxy.id)
                .and_then(|s| s.pop_front())
                .unwrap_or(true);

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if success {
                ProbeResult::healthy(40 + proxy.id)
            } else {
                ProbeResult::failed(30_000, "connection refused")
            }
        }
    }

    struct Fixture {
        backend: InMemoryBackend,
        store: Arc<MemoryStore>,
        prober: Arc<ScriptedProber>,
        notifier: Arc<RecordingNotifier>,
        scheduler: HealthScheduler,
    }

    fn fixture_with(prober: ScriptedProber, max_concurrent: usize) -> Fixture {
        let backend = InMemoryBackend::new();
        fixture_on(backend.clone(), Arc::new(backend), prober, max_concurrent)
    }

    fn fixture_on(
        backend: InMemoryBackend,
        registry: Arc<dyn ProxyRegistry>,
        prober: ScriptedProber,
        max_concurrent: usize,
    ) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let prober = Arc::new(prober);
        let notifier = Arc::new(RecordingNotifier::default());
        let alerts = AlertEmitter::new(store.clone()).with_notifier(notifier.clone());
        let config = HealthConfig {
            max_concurrent_checks: max_concurrent,
            ..HealthConfig::default()
        };
        let scheduler =
            HealthScheduler::new(registry, store.clone(), prober.clone(), alerts, config);

        Fixture {
            backend,
            store,
            prober,
            notifier,
            scheduler,
        }
    }

    #[tokio::test]
    async fn test_inactive_proxies_are_never_probed() {
        let f = fixture_with(ScriptedProber::default(), 10);
        f.backend.upsert(test_proxy(1, 100));
        let mut inactive = test_proxy(2, 100);
        inactive.status = ProxyStatus::Inactive;
        f.backend.upsert(inactive);
        let mut quarantined = test_proxy(3, 100);
        quarantined.status = ProxyStatus::Quarantined;
        f.backend.upsert(quarantined);

        let report = f.scheduler.sweep(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.checked, 2);

        let probed: HashSet<i32> = f.prober.calls().into_iter().collect();
        assert_eq!(probed, HashSet::from([1, 3]));

        let inactive = f.backend.get(2).await.unwrap();
        assert_eq!(inactive.last_health_check, None);
        assert_eq!(inactive.status, ProxyStatus::Inactive);
    }

    #[tokio::test]
    async fn test_quarantine_after_three_failed_sweeps_then_recovery() {
        let f = fixture_with(ScriptedProber::default(), 10);
        f.backend.upsert(test_proxy(1, 100));
        f.prober.script(1, &[false, false, false, false]);
        let token = CancellationToken::new();

        for _ in 0..2 {
            let report = f.scheduler.sweep(&token).await.unwrap();
            assert_eq!(report.unhealthy, 1);
            assert_eq!(report.quarantined, 0);
        }
        assert_eq!(f.store.failure_count(1).await.unwrap(), Some(2));

        let report = f.scheduler.sweep(&token).await.unwrap();
        assert_eq!(report.quarantined, 1);
        let proxy = f.backend.get(1).await.unwrap();
        assert_eq!(proxy.status, ProxyStatus::Quarantined);
        assert!(!proxy.health_check_success);
        assert_eq!(f.store.failure_count(1).await.unwrap(), None);
        assert_eq!(f.notifier.alerts.lock().len(), 1);

        // Still down: probed again, no second alert.
        let report = f.scheduler.sweep(&token).await.unwrap();
        assert_eq!(report.checked, 1);
        assert_eq!(report.quarantined, 0);
        assert_eq!(f.notifier.alerts.lock().len(), 1);

        // Script exhausted, next probe succeeds.
        let report = f.scheduler.sweep(&token).await.unwrap();
        assert_eq!(report.recovered, 1);
        let proxy = f.backend.get(1).await.unwrap();
        assert_eq!(proxy.status, ProxyStatus::Active);
        assert!(proxy.health_check_success);
        assert_eq!(proxy.response_time_ms, 41);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_cap_is_respected() {
        let f = fixture_with(ScriptedProber::with_delay(Duration::from_millis(50)), 5);
        for id in 1..=20 {
            f.backend.upsert(test_proxy(id, 0));
        }

        let report = f.scheduler.sweep(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.checked, 20);
        assert_eq!(report.healthy, 20);

        let max = f.prober.max_in_flight.load(Ordering::SeqCst);
        assert!(max <= 5, "max in flight was {}", max);
        assert!(max > 1);

        for proxy in f.backend.list_all().await.unwrap() {
            assert!(proxy.last_health_check.is_some(), "proxy {} not updated", proxy.id);
        }
    }

    #[tokio::test]
    async fn test_snapshot_written_per_probe() {
        let f = fixture_with(ScriptedProber::default(), 2);
        f.backend.upsert(test_proxy(7, 0));
        f.prober.script(7, &[false]);

        f.scheduler.sweep(&CancellationToken::new()).await.unwrap();

        let snapshot = f.store.health_snapshot(7).await.unwrap().unwrap();
        assert!(!snapshot.success);
        assert_eq!(snapshot.error, "connection refused");
    }

    #[tokio::test]
    async fn test_empty_registry_is_a_noop() {
        let f = fixture_with(ScriptedProber::default(), 2);
        let report = f.scheduler.sweep(&CancellationToken::new()).await.unwrap();
        assert_eq!(report, SweepReport::default());
        assert!(f.prober.calls().is_empty());
    }

    /// Registry whose health writes fail for one proxy
    struct FlakyRegistry {
        inner: InMemoryBackend,
        broken: i32,
    }

    #[async_trait]
    impl ProxyRegistry for FlakyRegistry {
        async fn get(&self, id: i32) -> Result<Proxy> {
            self.inner.get(id).await
        }
        async fn list_all(&self) -> Result<Vec<Proxy>> {
            self.inner.list_all().await
        }
        async fn list_active(&self) -> Result<Vec<Proxy>> {
            self.inner.list_active().await
        }
        async fn list_available(&self, proxy_type: Option<ProxyType>) -> Result<Vec<Proxy>> {
            self.inner.list_available(proxy_type).await
        }
        async fn update_health(&self, id: i32, update: &HealthUpdate) -> Result<()> {
            if id == self.broken {
                return Err(WardenError::DatabaseConnection("connection reset".into()));
            }
            self.inner.update_health(id, update).await
        }
        async fn update_status(&self, id: i32, status: ProxyStatus) -> Result<()> {
            self.inner.update_status(id, status).await
        }
        async fn transition_status(
            &self,
            id: i32,
            from: ProxyStatus,
            to: ProxyStatus,
        ) -> Result<bool> {
            self.inner.transition_status(id, from, to).await
        }
        async fn create(&self, req: &NewProxy) -> Result<Proxy> {
            self.inner.create(req).await
        }
        async fn delete(&self, id: i32) -> Result<()> {
            self.inner.delete(id).await
        }
    }

    #[tokio::test]
    async fn test_persist_failure_does_not_abort_sweep() {
        let backend = InMemoryBackend::new();
        let registry = Arc::new(FlakyRegistry {
            inner: backend.clone(),
            broken: 2,
        });
        let f = fixture_on(backend, registry, ScriptedProber::default(), 3);
        for id in 1..=3 {
            f.backend.upsert(test_proxy(id, 0));
        }

        let report = f.scheduler.sweep(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.checked, 3);
        assert_eq!(report.errors, 1);
        assert!(f.backend.get(1).await.unwrap().last_health_check.is_some());
        assert!(f.backend.get(2).await.unwrap().last_health_check.is_none());
        assert!(f.backend.get(3).await.unwrap().last_health_check.is_some());
    }

    #[tokio::test]
    async fn test_check_proxy_on_demand() {
        let f = fixture_with(ScriptedProber::default(), 1);
        let mut inactive = test_proxy(1, 0);
        inactive.status = ProxyStatus::Inactive;
        f.backend.upsert(inactive);
        f.prober.script(1, &[false]);

        let result = f.scheduler.check_proxy(1).await.unwrap();
        assert!(!result.success);
        let proxy = f.backend.get(1).await.unwrap();
        assert!(proxy.last_health_check.is_some());
        assert_eq!(proxy.status, ProxyStatus::Inactive);
        assert_eq!(f.store.failure_count(1).await.unwrap(), None);

        assert!(matches!(
            f.scheduler.check_proxy(404).await,
            Err(WardenError::ProxyNotFound { id: 404 })
        ));
    }

    fn new_proxy(host: &str) -> NewProxy {
        NewProxy {
            name: "edge".to_string(),
            proxy_type: ProxyType::Http,
            host: host.to_string(),
            port: 3128,
            username: None,
            password: None,
            health_check_url: None,
        }
    }

    #[tokio::test]
    async fn test_register_runs_connectivity_test() {
        let f = fixture_with(ScriptedProber::default(), 1);

        let (healthy, result) = f.scheduler.register(&new_proxy("198.51.100.1")).await.unwrap();
        assert!(result.success);
        assert_eq!(healthy.status, ProxyStatus::Active);
        assert!(healthy.last_health_check.is_some());

        // Ids are handed out sequentially, so the next proxy is id 2.
        f.prober.script(2, &[false]);
        let (broken, result) = f.scheduler.register(&new_proxy("198.51.100.2")).await.unwrap();
        assert_eq!(broken.id, 2);
        assert!(!result.success);
        assert_eq!(broken.status, ProxyStatus::Quarantined);
        assert!(!broken.health_check_success);
        assert_eq!(f.store.failure_count(2).await.unwrap(), None);
        assert!(f.notifier.alerts.lock().is_empty());

        // Kept in the registry, checked by the sweep and recovered on success.
        let report = f.scheduler.sweep(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.recovered, 1);
        assert_eq!(f.backend.get(2).await.unwrap().status, ProxyStatus::Active);

        assert!(matches!(
            f.scheduler.register(&new_proxy("198.51.100.2")).await,
            Err(WardenError::AlreadyExists { .. })
        ));
        // Two connectivity tests and one sweep; the duplicate was never checked.
        assert_eq!(f.prober.calls().len(), 4);
    }

    #[tokio::test]
    async fn test_metrics_over_registry() {
        let f = fixture_with(ScriptedProber::default(), 1);
        f.backend.upsert(test_proxy(1, 100));
        let mut quarantined = test_proxy(2, 100);
        quarantined.status = ProxyStatus::Quarantined;
        f.backend.upsert(quarantined);

        let metrics = f.scheduler.metrics().await.unwrap();
        assert_eq!(metrics.total_proxies, 2);
        assert_eq!(metrics.error_proxies, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_sweeps_immediately_then_on_interval() {
        let f = fixture_with(ScriptedProber::default(), 2);
        f.backend.upsert(test_proxy(1, 0));
        f.backend.upsert(test_proxy(2, 0));

        let handle = f.scheduler.start(CancellationToken::new());
        wait_for_calls(&f.prober, 2).await;
        assert!(handle.is_running());

        tokio::time::advance(HealthConfig::default().check_interval).await;
        wait_for_calls(&f.prober, 4).await;

        handle.stop().await;
        let calls = f.prober.calls().len();
        tokio::time::advance(HealthConfig::default().check_interval * 3).await;
        tokio::task::yield_now().await;
        assert_eq!(f.prober.calls().len(), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_in_flight_probes() {
        let f = fixture_with(ScriptedProber::with_delay(Duration::from_secs(60)), 1);
        for id in 1..=3 {
            f.backend.upsert(test_proxy(id, 0));
        }

        let token = CancellationToken::new();
        let sweep = {
            let scheduler = f.scheduler.clone();
            let token = token.clone();
            tokio::spawn(async move { scheduler.sweep(&token).await })
        };

        wait_for_calls(&f.prober, 1).await;
        token.cancel();

        let report = sweep.await.unwrap().unwrap();
        assert_eq!(report.checked, 0);
        assert_eq!(f.prober.calls().len(), 1);
    }

    async fn wait_for_calls(prober: &ScriptedProber, n: usize) {
        for _ in 0..1000 {
            if prober.calls().len() >= n {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("expected {} probes, saw {}", n, prober.calls().len());
    }
}
