//! Priority-ordered backend selection with live failover.
//!
//! One router instance fronts the language-model backends and another the
//! transcription backends; both share this shape. Backends are registered
//! explicitly at startup (no discovery), each carrying a stable alias that
//! the configuration table maps to a priority and an enabled flag. Pipeline
//! code never hard-codes a vendor: it asks [`BackendRouter::select_one`]
//! per call and reports failures back, letting priority and live error
//! counts drive selection.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::errors::RouterError;

/// Reported errors at which a backend is permanently disabled for the rest
/// of the process lifetime. There is no cool-down re-enable; a restart
/// starts the count fresh.
pub const ERROR_THRESHOLD: u32 = 10;

/// Anything selectable by the router: a stable alias plus one-time,
/// potentially expensive initialization (loading a model, validating
/// credentials). `prepare` runs on first selection and is memoized on
/// success.
#[async_trait::async_trait]
pub trait RouterBackend: Send + Sync {
    fn alias(&self) -> &str;

    async fn prepare(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Per-alias configuration read at registration time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackendSettings {
    /// Higher is preferred.
    pub priority: i32,
    pub enabled: bool,
}

/// A selected backend handle plus the alias to report errors against.
pub struct Selected<B: ?Sized> {
    pub alias: String,
    pub backend: Arc<B>,
}

impl<B: ?Sized> Clone for Selected<B> {
    fn clone(&self) -> Self {
        Self {
            alias: self.alias.clone(),
            backend: self.backend.clone(),
        }
    }
}

/// Point-in-time view of one registration, for logs and tests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendStatus {
    pub alias: String,
    pub priority: i32,
    pub enabled: bool,
    pub prepared: bool,
    pub error_count: u32,
}

struct Registration<B: ?Sized> {
    alias: String,
    priority: i32,
    enabled: bool,
    prepared: bool,
    error_count: u32,
    backend: Arc<B>,
}

pub struct BackendRouter<B: ?Sized> {
    settings: HashMap<String, BackendSettings>,
    entries: Mutex<Vec<Registration<B>>>,
}

impl<B: RouterBackend + ?Sized> BackendRouter<B> {
    /// A router with its per-alias settings table. Registrations whose
    /// alias is absent from the table fail individually; the table itself
    /// can hold aliases that never register.
    pub fn new(settings: HashMap<String, BackendSettings>) -> Self {
        Self {
            settings,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Add one backend to the table. A missing settings entry is fatal for
    /// this registration only; the caller logs it and keeps going with the
    /// remaining backends.
    pub async fn register(&self, backend: Arc<B>) -> Result<(), RouterError> {
        let alias = backend.alias().to_string();
        let settings =
            self.settings
                .get(&alias)
                .copied()
                .ok_or_else(|| RouterError::MissingSettings {
                    alias: alias.clone(),
                })?;

        let mut entries = self.entries.lock().await;
        if entries.iter().any(|e| e.alias == alias) {
            return Err(RouterError::DuplicateAlias { alias });
        }

        info!(
            backend = %alias,
            priority = settings.priority,
            enabled = settings.enabled,
            "Backend registered"
        );
        entries.push(Registration {
            alias,
            priority: settings.priority,
            enabled: settings.enabled,
            prepared: false,
            error_count: 0,
            backend: backend.clone(),
        });
        Ok(())
    }

    /// The best live backend: highest-priority entry that is enabled and
    /// below the error threshold, initialized on first use. Returns `None`
    /// when every backend is disabled or exhausted.
    ///
    /// Selection is serialized so initialization runs exactly once per
    /// backend even with concurrent callers.
    pub async fn select_one(&self) -> Option<Selected<B>> {
        let mut entries = self.entries.lock().await;
        entries.sort_by(|a, b| {
            b.enabled
                .cmp(&a.enabled)
                .then(b.priority.cmp(&a.priority))
        });

        for index in 0..entries.len() {
            {
                let entry = &entries[index];
                if !entry.enabled || entry.error_count >= ERROR_THRESHOLD {
                    continue;
                }
            }

            if !entries[index].prepared {
                let backend = entries[index].backend.clone();
                let alias = entries[index].alias.clone();
                match backend.prepare().await {
                    Ok(()) => {
                        debug!(backend = %alias, "Backend prepared");
                        entries[index].prepared = true;
                    }
                    Err(e) => {
                        warn!(backend = %alias, error = ?e, "Backend preparation failed");
                        Self::count_error(&mut entries[index]);
                        continue;
                    }
                }
            }

            let entry = &entries[index];
            return Some(Selected {
                alias: entry.alias.clone(),
                backend: entry.backend.clone(),
            });
        }

        None
    }

    /// Count one soft failure against `alias`. Crossing the threshold
    /// disables the backend for the rest of the process lifetime.
    pub async fn report_error(&self, alias: &str) {
        let mut entries = self.entries.lock().await;
        match entries.iter_mut().find(|e| e.alias == alias) {
            Some(entry) => Self::count_error(entry),
            None => warn!(backend = %alias, "Error reported for unregistered backend"),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Snapshot of every registration, for startup logs and tests.
    pub async fn statuses(&self) -> Vec<BackendStatus> {
        let entries = self.entries.lock().await;
        entries
            .iter()
            .map(|e| BackendStatus {
                alias: e.alias.clone(),
                priority: e.priority,
                enabled: e.enabled,
                prepared: e.prepared,
                error_count: e.error_count,
            })
            .collect()
    }

    fn count_error(entry: &mut Registration<B>) {
        entry.error_count = entry.error_count.saturating_add(1);
        if entry.error_count >= ERROR_THRESHOLD && entry.enabled {
            entry.enabled = false;
            warn!(
                backend = %entry.alias,
                errors = entry.error_count,
                "Backend crossed the error threshold and is disabled until restart"
            );
        } else {
            debug!(
                backend = %entry.alias,
                errors = entry.error_count,
                "Backend error counted"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeBackend {
        alias: &'static str,
        prepare_calls: AtomicU32,
        fail_prepare: bool,
    }

    impl FakeBackend {
        fn new(alias: &'static str) -> Arc<Self> {
            Arc::new(Self {
                alias,
                prepare_calls: AtomicU32::new(0),
                fail_prepare: false,
            })
        }

        fn failing(alias: &'static str) -> Arc<Self> {
            Arc::new(Self {
                alias,
                prepare_calls: AtomicU32::new(0),
                fail_prepare: true,
            })
        }
    }

    #[async_trait::async_trait]
    impl RouterBackend for FakeBackend {
        fn alias(&self) -> &str {
            self.alias
        }

        async fn prepare(&self) -> anyhow::Result<()> {
            self.prepare_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_prepare {
                anyhow::bail!("no credentials");
            }
            Ok(())
        }
    }

    fn settings(entries: &[(&str, i32, bool)]) -> HashMap<String, BackendSettings> {
        entries
            .iter()
            .map(|(alias, priority, enabled)| {
                (
                    alias.to_string(),
                    BackendSettings {
                        priority: *priority,
                        enabled: *enabled,
                    },
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn selects_highest_priority_enabled_backend() {
        let router: BackendRouter<FakeBackend> =
            BackendRouter::new(settings(&[("low", 10, true), ("high", 90, true)]));
        router.register(FakeBackend::new("low")).await.unwrap();
        router.register(FakeBackend::new("high")).await.unwrap();

        let selected = router.select_one().await.unwrap();
        assert_eq!(selected.alias, "high");
    }

    #[tokio::test]
    async fn disabled_backends_are_skipped() {
        let router: BackendRouter<FakeBackend> =
            BackendRouter::new(settings(&[("off", 90, false), ("on", 10, true)]));
        router.register(FakeBackend::new("off")).await.unwrap();
        router.register(FakeBackend::new("on")).await.unwrap();

        assert_eq!(router.select_one().await.unwrap().alias, "on");
    }

    #[tokio::test]
    async fn missing_settings_fails_that_registration_only() {
        let router: BackendRouter<FakeBackend> =
            BackendRouter::new(settings(&[("known", 50, true)]));

        let err = router
            .register(FakeBackend::new("unknown"))
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::MissingSettings { .. }));

        router.register(FakeBackend::new("known")).await.unwrap();
        assert_eq!(router.len().await, 1);
        assert_eq!(router.select_one().await.unwrap().alias, "known");
    }

    #[tokio::test]
    async fn duplicate_alias_is_rejected() {
        let router: BackendRouter<FakeBackend> =
            BackendRouter::new(settings(&[("dup", 50, true)]));
        router.register(FakeBackend::new("dup")).await.unwrap();

        let err = router.register(FakeBackend::new("dup")).await.unwrap_err();
        assert!(matches!(err, RouterError::DuplicateAlias { .. }));
    }

    #[tokio::test]
    async fn prepare_runs_exactly_once() {
        let backend = FakeBackend::new("solo");
        let router: BackendRouter<FakeBackend> =
            BackendRouter::new(settings(&[("solo", 50, true)]));
        router.register(backend.clone()).await.unwrap();

        for _ in 0..3 {
            assert!(router.select_one().await.is_some());
        }
        assert_eq!(backend.prepare_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_prepare_falls_over_to_next_backend() {
        let broken = FakeBackend::failing("broken");
        let router: BackendRouter<FakeBackend> =
            BackendRouter::new(settings(&[("broken", 90, true), ("spare", 10, true)]));
        router.register(broken.clone()).await.unwrap();
        router.register(FakeBackend::new("spare")).await.unwrap();

        let selected = router.select_one().await.unwrap();
        assert_eq!(selected.alias, "spare");

        let statuses = router.statuses().await;
        let broken_status = statuses.iter().find(|s| s.alias == "broken").unwrap();
        assert_eq!(broken_status.error_count, 1);
        assert!(!broken_status.prepared);
    }

    #[tokio::test]
    async fn ten_errors_disable_a_backend_permanently() {
        let router: BackendRouter<FakeBackend> =
            BackendRouter::new(settings(&[("flaky", 90, true), ("steady", 10, true)]));
        router.register(FakeBackend::new("flaky")).await.unwrap();
        router.register(FakeBackend::new("steady")).await.unwrap();

        for _ in 0..ERROR_THRESHOLD {
            router.report_error("flaky").await;
        }

        assert_eq!(router.select_one().await.unwrap().alias, "steady");

        let statuses = router.statuses().await;
        let flaky = statuses.iter().find(|s| s.alias == "flaky").unwrap();
        assert!(!flaky.enabled);
        assert_eq!(flaky.error_count, ERROR_THRESHOLD);
    }

    #[tokio::test]
    async fn exhaustion_returns_none() {
        let router: BackendRouter<FakeBackend> =
            BackendRouter::new(settings(&[("only", 50, true)]));
        router.register(FakeBackend::new("only")).await.unwrap();

        for _ in 0..ERROR_THRESHOLD {
            router.report_error("only").await;
        }
        assert!(router.select_one().await.is_none());
    }

    #[tokio::test]
    async fn empty_router_selects_nothing() {
        let router: BackendRouter<FakeBackend> = BackendRouter::new(HashMap::new());
        assert!(router.select_one().await.is_none());
        assert!(router.is_empty().await);
    }
}
