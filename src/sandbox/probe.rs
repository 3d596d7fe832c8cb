use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::types::EngineConfig;
use crate::engine::ContainerEngine;

/// How hard the probe tries to make the engine usable.
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub auto_install: bool,
    pub auto_start: bool,
    pub poll_interval: Duration,
    pub start_timeout: Duration,
}

impl From<&EngineConfig> for ProbeSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            auto_install: config.auto_install,
            auto_start: config.auto_start,
            poll_interval: config.start_poll_interval(),
            start_timeout: config.start_timeout(),
        }
    }
}

/// Gate deciding whether sandboxes can be used at all.
///
/// A successful probe is cached for the life of the process; a failed one is
/// retried on the next call. Concurrent callers share a single probe run.
pub struct EngineProbe {
    engine: Arc<dyn ContainerEngine>,
    settings: ProbeSettings,
    ready: AtomicBool,
    gate: Mutex<()>,
}

impl EngineProbe {
    pub fn new(engine: Arc<dyn ContainerEngine>, settings: ProbeSettings) -> Self {
        Self {
            engine,
            settings,
            ready: AtomicBool::new(false),
            gate: Mutex::new(()),
        }
    }

    /// Last known result without probing.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Make sure the engine CLI exists and its daemon responds.
    ///
    /// Never errors: `false` means "fall back to host execution".
    pub async fn ensure_ready(&self) -> bool {
        if self.is_ready() {
            return true;
        }

        let _guard = self.gate.lock().await;
        if self.is_ready() {
            return true;
        }

        let ready = self.probe().await;
        if ready {
            self.ready.store(true, Ordering::Release);
            info!(engine = %self.engine.name(), "Container engine ready");
        }
        ready
    }

    async fn probe(&self) -> bool {
        let engine = self.engine.name().to_string();

        if !self.engine.cli_installed().await {
            if !self.settings.auto_install {
                warn!(engine = %engine, "Container engine CLI not found on PATH");
                return false;
            }
            if let Err(e) = self.engine.install().await {
                warn!(engine = %engine, error = %e, "Container engine install failed");
            }
            if !self.engine.cli_installed().await {
                warn!(engine = %engine, "Container engine CLI still missing after install attempt");
                return false;
            }
        }

        if self.engine.daemon_ready().await {
            return true;
        }

        if !self.settings.auto_start {
            warn!(engine = %engine, "Container engine daemon is not responding");
            return false;
        }

        if let Err(e) = self.engine.start_daemon().await {
            warn!(engine = %engine, error = %e, "Could not start container engine daemon");
            return false;
        }

        let deadline = Instant::now() + self.settings.start_timeout;
        loop {
            tokio::time::sleep(self.settings.poll_interval).await;
            if self.engine.daemon_ready().await {
                return true;
            }
            if Instant::now() >= deadline {
                warn!(
                    engine = %engine,
                    waited_secs = self.settings.start_timeout.as_secs(),
                    "Container engine daemon did not come up"
                );
                return false;
            }
            debug!(engine = %engine, "Waiting for container engine daemon");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;

    use crate::engine::{ContainerInfo, ContainerSpec, Invocation};
    use crate::error::{Result, TaskboxError};

    /// Engine whose daemon becomes ready after `ready_after` info calls.
    struct ScriptedEngine {
        installed: AtomicBool,
        install_works: bool,
        ready_after: usize,
        info_calls: AtomicUsize,
        start_calls: AtomicUsize,
    }

    impl ScriptedEngine {
        fn new(installed: bool, install_works: bool, ready_after: usize) -> Self {
            Self {
                installed: AtomicBool::new(installed),
                install_works,
                ready_after,
                info_calls: AtomicUsize::new(0),
                start_calls: AtomicUsize::new(0),
            }
        }
    }

    fn unsupported<T>() -> Result<T> {
        Err(TaskboxError::engine("test", "unsupported"))
    }

    #[async_trait]
    impl ContainerEngine for ScriptedEngine {
        fn name(&self) -> &str {
            "scripted"
        }
        async fn cli_installed(&self) -> bool {
            self.installed.load(Ordering::SeqCst)
        }
        async fn install(&self) -> Result<()> {
            if self.install_works {
                self.installed.store(true, Ordering::SeqCst);
                Ok(())
            } else {
                unsupported()
            }
        }
        async fn daemon_ready(&self) -> bool {
            self.info_calls.fetch_add(1, Ordering::SeqCst) >= self.ready_after
        }
        async fn start_daemon(&self) -> Result<()> {
            self.start_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn run_detached(&self, _spec: &ContainerSpec) -> Result<String> {
            unsupported()
        }
        async fn inspect(&self, _name: &str) -> Result<Option<ContainerInfo>> {
            unsupported()
        }
        async fn start(&self, _name: &str) -> Result<()> {
            unsupported()
        }
        async fn stop(&self, _name: &str, _grace: Duration) -> Result<()> {
            unsupported()
        }
        async fn remove(&self, _name: &str) -> Result<()> {
            unsupported()
        }
        async fn port_table(&self, _container: &str) -> Result<String> {
            unsupported()
        }
        async fn list_names(&self, _prefix: &str) -> Result<Vec<String>> {
            unsupported()
        }
        fn exec_invocation(
            &self,
            _container: &str,
            _workdir: &str,
            _env: &[(String, String)],
            _command: &str,
        ) -> Invocation {
            Invocation::default()
        }
    }

    fn settings(auto_install: bool, auto_start: bool) -> ProbeSettings {
        ProbeSettings {
            auto_install,
            auto_start,
            poll_interval: Duration::from_millis(5),
            start_timeout: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn test_ready_engine_is_cached() {
        let engine = Arc::new(ScriptedEngine::new(true, false, 0));
        let probe = EngineProbe::new(engine.clone(), settings(false, false));

        assert!(probe.ensure_ready().await);
        assert!(probe.ensure_ready().await);
        assert_eq!(engine.info_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_cli_without_install_fails() {
        let engine = Arc::new(ScriptedEngine::new(false, true, 0));
        let probe = EngineProbe::new(engine.clone(), settings(false, true));

        assert!(!probe.ensure_ready().await);
        assert!(!probe.is_ready());
    }

    #[tokio::test]
    async fn test_install_then_ready() {
        let engine = Arc::new(ScriptedEngine::new(false, true, 0));
        let probe = EngineProbe::new(engine, settings(true, false));
        assert!(probe.ensure_ready().await);
    }

    #[tokio::test]
    async fn test_failed_install_is_not_fatal() {
        let engine = Arc::new(ScriptedEngine::new(false, false, 0));
        let probe = EngineProbe::new(engine, settings(true, true));
        assert!(!probe.ensure_ready().await);
    }

    #[tokio::test]
    async fn test_start_and_poll_until_ready() {
        let engine = Arc::new(ScriptedEngine::new(true, false, 3));
        let probe = EngineProbe::new(engine.clone(), settings(false, true));

        assert!(probe.ensure_ready().await);
        assert_eq!(engine.start_calls.load(Ordering::SeqCst), 1);
        assert!(engine.info_calls.load(Ordering::SeqCst) >= 4);
    }

    #[tokio::test]
    async fn test_gives_up_after_start_timeout() {
        let engine = Arc::new(ScriptedEngine::new(true, false, usize::MAX));
        let probe = EngineProbe::new(engine, settings(false, true));

        let started = std::time::Instant::now();
        assert!(!probe.ensure_ready().await);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_failure_is_not_cached() {
        let engine = Arc::new(ScriptedEngine::new(true, false, 1));
        let probe = EngineProbe::new(engine, settings(false, false));

        assert!(!probe.ensure_ready().await);
        assert!(probe.ensure_ready().await);
    }
}
