//! The event loop.
//!
//! One task drives scheduler ticks on a fixed interval; one worker per local
//! interface accepts inbound sessions. Cancellation is checked only between
//! ticks, so a tick in progress always completes. On stop every open
//! discovery queue is released and workers get a bounded grace period.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::admin::Fleet;
use crate::backend::EndpointBackend;
use crate::config::FleetConfig;
use crate::error::Result;
use crate::interface::{parse_interfaces, InterfaceListener, LocalInterface};
use crate::queue::QueueManager;
use crate::registry::{BuildReport, Registry};
use crate::scheduler::Scheduler;
use crate::transport::Transports;

/// Summary returned when the daemon stops.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShutdownSummary {
    pub ticks: u64,
    pub queues_closed: usize,
    /// Workers aborted after the grace period ran out.
    pub workers_aborted: usize,
}

pub struct Daemon {
    fleet: Fleet,
    interfaces: Vec<LocalInterface>,
    listener: Option<Arc<dyn InterfaceListener>>,
    tick_period: Duration,
    grace: Duration,
}

impl Daemon {
    /// Validate interfaces and build the registry. Fails when no local
    /// interface is viable.
    pub fn new(
        config: &FleetConfig,
        transports: Transports,
        backend: Arc<dyn EndpointBackend>,
        shutdown: CancellationToken,
    ) -> Result<(Self, BuildReport)> {
        let interfaces = parse_interfaces(&config.interfaces)?;
        let (registry, report) = Registry::build(config);
        let tick_period = registry.timing().tick_period();
        let scheduler = Scheduler::new(QueueManager::new(transports), backend);

        let daemon = Self {
            fleet: Fleet::new(registry.into_shared(), scheduler, shutdown),
            interfaces,
            listener: None,
            tick_period,
            grace: config.timing.shutdown_grace(),
        };
        Ok((daemon, report))
    }

    pub fn with_listener(mut self, listener: Arc<dyn InterfaceListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn fleet(&self) -> &Fleet {
        &self.fleet
    }

    pub fn interfaces(&self) -> &[LocalInterface] {
        &self.interfaces
    }

    /// Prime the fleet, start interface workers, and tick until cancelled.
    pub async fn run(self) -> Result<ShutdownSummary> {
        let token = self.fleet.shutdown_token();
        let mut summary = ShutdownSummary::default();

        {
            let mut registry = self.fleet.registry().lock().await;
            self.fleet.scheduler().prime(&mut registry).await;
        }

        let mut workers = JoinSet::new();
        match &self.listener {
            Some(listener) => {
                for iface in &self.interfaces {
                    workers.spawn(run_worker(
                        iface.clone(),
                        listener.clone(),
                        self.fleet.clone(),
                        token.clone(),
                    ));
                }
            }
            None => tracing::info!("No inbound listener, interface workers not started"),
        }

        tracing::info!(
            tick_ms = self.tick_period.as_millis() as u64,
            workers = workers.len(),
            "Event loop started"
        );

        let mut ticker = tokio::time::interval(self.tick_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately; priming already did that work.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.fleet.tick().await;
                    summary.ticks += 1;
                    if !report.is_idle() {
                        tracing::debug!(
                            refreshed = ?report.refreshed,
                            keep_alive_failures = ?report.keep_alive_failures,
                            "Tick"
                        );
                    }
                }
            }
        }

        tracing::info!(ticks = summary.ticks, "Event loop stopping");

        {
            let mut registry = self.fleet.registry().lock().await;
            for alias in registry.aliases() {
                if let Ok(target) = registry.find_mut(&alias) {
                    summary.queues_closed += self.fleet.scheduler().queues().teardown_target(target).await;
                }
            }
        }

        let joined = tokio::time::timeout(self.grace, async {
            while let Some(res) = workers.join_next().await {
                if let Err(e) = res {
                    tracing::error!(error = %e, "Interface worker panicked");
                }
            }
        })
        .await;
        if joined.is_err() {
            summary.workers_aborted = workers.len();
            tracing::warn!(remaining = workers.len(), "Workers did not stop within grace period, aborting");
            workers.abort_all();
        }

        tracing::info!(
            ticks = summary.ticks,
            queues_closed = summary.queues_closed,
            workers_aborted = summary.workers_aborted,
            "Shutdown complete"
        );
        Ok(summary)
    }
}

/// Cancel `token` on SIGINT or SIGTERM.
///
/// Must be called inside a runtime. Fails when the handlers cannot be
/// registered.
pub fn watch_signals(token: CancellationToken) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::spawn(async move {
            tokio::select! {
                _ = interrupt.recv() => tracing::info!("SIGINT received"),
                _ = terminate.recv() => tracing::info!("SIGTERM received"),
            }
            token.cancel();
        });
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupt received");
                token.cancel();
            }
        });
    }

    Ok(())
}

async fn run_worker(
    iface: LocalInterface,
    listener: Arc<dyn InterfaceListener>,
    fleet: Fleet,
    token: CancellationToken,
) {
    tracing::debug!(interface = %iface.address(), "Interface worker started");

    loop {
        let accepted = tokio::select! {
            _ = token.cancelled() => break,
            res = listener.accept(&iface) => res,
        };

        match accepted {
            Ok(Some(session)) => {
                let peer = session.peer();
                tracing::debug!(interface = %iface.address(), peer = %peer, "Session accepted");
                if let Err(e) = session.serve(fleet.clone()).await {
                    tracing::warn!(interface = %iface.address(), peer = %peer, error = %e, "Session failed");
                }
            }
            Ok(None) => {
                tracing::info!(interface = %iface.address(), "Listener closed");
                break;
            }
            Err(e) => {
                tracing::warn!(interface = %iface.address(), error = %e, "Accept failed");
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                }
            }
        }
    }

    tracing::debug!(interface = %iface.address(), "Interface worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::{mpsc, Mutex};

    use dem_core::{TransportError, TransportType};

    use crate::backend::RecordingBackend;
    use crate::config::InterfaceEntry;
    use crate::error::DiscoverError;
    use crate::interface::InboundSession;
    use crate::testing::{fleet, portid_entry, record, subsystem_entry, target_entry, ScriptedTransport};

    struct ChannelListener {
        rx: Mutex<mpsc::Receiver<Box<dyn InboundSession>>>,
    }

    #[async_trait]
    impl InterfaceListener for ChannelListener {
        async fn accept(
            &self,
            _iface: &LocalInterface,
        ) -> std::result::Result<Option<Box<dyn InboundSession>>, TransportError> {
            Ok(self.rx.lock().await.recv().await)
        }
    }

    struct LogPageSession {
        served: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl InboundSession for LogPageSession {
        fn peer(&self) -> String {
            "10.0.0.99".to_string()
        }

        async fn serve(self: Box<Self>, fleet: Fleet) -> std::result::Result<(), TransportError> {
            fleet
                .target_logpage("t1")
                .await
                .map_err(|e| TransportError::Fetch(e.to_string()))?;
            self.served.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct StuckSession;

    #[async_trait]
    impl InboundSession for StuckSession {
        fn peer(&self) -> String {
            "stuck".to_string()
        }

        async fn serve(self: Box<Self>, _fleet: Fleet) -> std::result::Result<(), TransportError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    fn config() -> FleetConfig {
        let mut config = fleet(vec![target_entry(
            "t1",
            "in_band",
            1,
            vec![portid_entry(1, "10.0.0.1")],
            vec![subsystem_entry("nqn.a", true, &[])],
        )]);
        config.interfaces = vec![InterfaceEntry {
            trtype: Some("rdma".to_string()),
            adrfam: Some("ipv4".to_string()),
            traddr: Some("10.0.0.254/24".to_string()),
            trsvcid: None,
        }];
        config
    }

    fn daemon(token: CancellationToken) -> (Daemon, Arc<ScriptedTransport>) {
        let transport = ScriptedTransport::new();
        transport.set_log_page("10.0.0.1", vec![record("nqn.a", "10.0.0.1", 1)]);
        let (daemon, report) = Daemon::new(
            &config(),
            Transports::new().with(TransportType::Rdma, transport.clone()),
            Arc::new(RecordingBackend::new()),
            token,
        )
        .unwrap();
        assert_eq!(report.targets, 1);
        (daemon, transport)
    }

    #[test]
    fn test_no_viable_interfaces_fails_startup() {
        let mut config = config();
        config.interfaces[0].adrfam = Some("ib".to_string());
        let result = Daemon::new(
            &config,
            Transports::new(),
            Arc::new(RecordingBackend::new()),
            CancellationToken::new(),
        );
        assert!(matches!(result, Err(DiscoverError::NoViableInterfaces { skipped: 1 })));
    }

    #[tokio::test]
    async fn test_signal_handlers_register() {
        let token = CancellationToken::new();
        watch_signals(token.clone()).unwrap();
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn test_runs_until_cancelled_then_releases_queues() {
        let token = CancellationToken::new();
        let (daemon, transport) = daemon(token.clone());
        let handle = tokio::spawn(daemon.run());

        tokio::time::sleep(Duration::from_millis(350)).await;
        token.cancel();
        let summary = handle.await.unwrap().unwrap();

        assert!(summary.ticks >= 1);
        assert_eq!(summary.queues_closed, 1);
        assert_eq!(summary.workers_aborted, 0);
        assert_eq!(transport.fetches(), 1);
        assert_eq!(transport.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_worker_serves_sessions() {
        let token = CancellationToken::new();
        let (daemon, _) = daemon(token.clone());
        let (tx, rx) = mpsc::channel(4);
        let daemon = daemon.with_listener(Arc::new(ChannelListener { rx: Mutex::new(rx) }));
        let fleet = daemon.fleet().clone();
        let handle = tokio::spawn(daemon.run());

        let served = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            tx.send(Box::new(LogPageSession { served: served.clone() }) as Box<dyn InboundSession>)
                .await
                .unwrap_or_else(|_| panic!("listener dropped"));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(served.load(Ordering::SeqCst), 2);

        fleet.shutdown();
        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.workers_aborted, 0);
    }

    #[tokio::test]
    async fn test_stuck_worker_is_aborted_after_grace() {
        let token = CancellationToken::new();
        let (daemon, _) = daemon(token.clone());
        let (tx, rx) = mpsc::channel(1);
        let daemon = daemon.with_listener(Arc::new(ChannelListener { rx: Mutex::new(rx) }));
        let handle = tokio::spawn(daemon.run());

        tx.send(Box::new(StuckSession) as Box<dyn InboundSession>)
            .await
            .unwrap_or_else(|_| panic!("listener dropped"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();

        let summary = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(summary.workers_aborted, 1);
    }
}
