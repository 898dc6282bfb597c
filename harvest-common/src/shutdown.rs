use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

type ShutdownFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

struct ShutdownHandler {
    name: String,
    priority: i32,
    run: Box<dyn FnOnce() -> ShutdownFuture + Send>,
}

/// Coordinates the ordered teardown of a worker process.
///
/// Components observe shutdown through the shared [`CancellationToken`];
/// teardown steps (stop health loop, drain workers, close the queue, close
/// the pool, flush logs) register with an ascending priority and run
/// sequentially once a signal arrives. The whole sequence is bounded by
/// `shutdown_timeout`; past it the caller is expected to force-exit with
/// status 1.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    handlers: Vec<ShutdownHandler>,
    shutdown_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(shutdown_timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            handlers: Vec::new(),
            shutdown_timeout,
        }
    }

    /// The token cancelled when shutdown begins. Clone freely into loops.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Register a teardown step. Lower priorities run first.
    pub fn on_shutdown<F, Fut>(&mut self, name: &str, priority: i32, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers.push(ShutdownHandler {
            name: name.to_owned(),
            priority,
            run: Box::new(move || Box::pin(f())),
        });
    }

    /// Block until SIGTERM, SIGINT or SIGHUP.
    #[cfg(unix)]
    pub async fn wait_for_signal() {
        use tokio::signal::unix::{signal, SignalKind};

        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sighup = signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");

        tokio::select! {
            _ = ctrl_c => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sighup.recv() => info!("received SIGHUP"),
        }
    }

    #[cfg(not(unix))]
    pub async fn wait_for_signal() {
        let _ = tokio::signal::ctrl_c().await;
        info!("received ctrl-c");
    }

    /// Wait for a shutdown trigger (signal or programmatic cancellation),
    /// then run every registered handler in priority order. Returns `true`
    /// when all handlers finished within the budget; `false` means the
    /// caller should exit with status 1.
    pub async fn run(mut self) -> bool {
        tokio::select! {
            _ = Self::wait_for_signal() => {},
            _ = self.token.cancelled() => {},
        }
        self.token.cancel();
        info!("shutdown initiated");

        self.handlers.sort_by_key(|h| h.priority);

        let sequence = async {
            for handler in self.handlers {
                info!(step = %handler.name, "shutdown step starting");
                (handler.run)().await;
                info!(step = %handler.name, "shutdown step finished");
            }
        };

        match tokio::time::timeout(self.shutdown_timeout, sequence).await {
            Ok(()) => {
                info!("shutdown complete");
                true
            }
            Err(_) => {
                warn!(
                    timeout_secs = self.shutdown_timeout.as_secs(),
                    "shutdown timed out, forcing exit"
                );
                false
            }
        }
    }
}

/// Install a panic hook that turns an uncaught panic into an emergency
/// shutdown: one structured fatal record, then a forced exit within a
/// second (leaving the stalled-reservation sweep to recover any in-flight
/// jobs).
pub fn install_emergency_exit_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        error!(panic = %info, "fatal: uncaught panic, emergency shutdown");
        default_hook(info);
        std::thread::spawn(|| {
            std::thread::sleep(Duration::from_secs(1));
            std::process::exit(1);
        });
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn handlers_run_in_priority_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(5));

        for (name, priority) in [("pool", 40), ("health", 10), ("workers", 20)] {
            let order = order.clone();
            coordinator.on_shutdown(name, priority, move || async move {
                order.lock().unwrap().push(name);
            });
        }

        let token = coordinator.token();
        let run = tokio::spawn(coordinator.run());
        token.cancel();

        assert!(run.await.unwrap());
        assert_eq!(*order.lock().unwrap(), vec!["health", "workers", "pool"]);
    }

    #[tokio::test]
    async fn timeout_reports_dirty_shutdown() {
        let mut coordinator = ShutdownCoordinator::new(Duration::from_millis(50));
        coordinator.on_shutdown("stuck", 10, || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let token = coordinator.token();
        let run = tokio::spawn(coordinator.run());
        token.cancel();

        assert!(!run.await.unwrap());
    }

    #[tokio::test]
    async fn token_observers_see_cancellation() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let token = coordinator.token();
        let observer = coordinator.token();

        let run = tokio::spawn(coordinator.run());
        token.cancel();
        observer.cancelled().await;
        assert!(run.await.unwrap());
    }
}
