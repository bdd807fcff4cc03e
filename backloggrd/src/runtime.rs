use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use backloggr_core::{AuthClient, BackloggrClient};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::AppConfig;
use crate::connectivity::{Connectivity, ManualConnectivity, NetworkMonitor, TcpCheck};
use crate::library::LibraryService;
use crate::session::Session;
use crate::store::LocalStore;
use crate::sync::{SyncEngine, SyncReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStatus {
    pub pending: i64,
    pub dead_lettered: i64,
}

/// Application root: the one store, session and network monitor every
/// component receives.
pub struct AppRuntime {
    config: AppConfig,
    store: Arc<LocalStore>,
    session: Arc<Session>,
    network: Arc<NetworkMonitor>,
}

impl AppRuntime {
    pub async fn bootstrap(config: AppConfig) -> anyhow::Result<Self> {
        let store = LocalStore::open(&config.db_path)
            .await
            .with_context(|| format!("failed to open local store at {:?}", config.db_path))?;
        let session = Session::open(&config.config_dir, config.token_backend)
            .with_context(|| format!("failed to load session from {:?}", config.config_dir))?
            .with_token_override(config.token_override.clone());
        let network = network_monitor(&config)?;

        tracing::info!(
            db = %config.db_path.display(),
            base_url = %config.base_url,
            offline = config.force_offline,
            "runtime ready"
        );
        Ok(Self {
            config,
            store: Arc::new(store),
            session: Arc::new(session),
            network: Arc::new(network),
        })
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn engine(&self) -> anyhow::Result<SyncEngine<NetworkMonitor>> {
        let token = self
            .session
            .token()?
            .context("not signed in; set BACKLOGGR_TOKEN or sign in first")?;
        let client = BackloggrClient::with_base_url(&self.config.base_url, token)?
            .with_timeout(self.config.http_timeout)?;
        Ok(
            SyncEngine::new(client, Arc::clone(&self.store), Arc::clone(&self.network))
                .with_backoff(self.config.backoff())
                .with_max_attempts(self.config.max_attempts),
        )
    }

    pub fn library(
        &self,
        engine: Arc<SyncEngine<NetworkMonitor>>,
    ) -> LibraryService<NetworkMonitor> {
        LibraryService::new(Arc::clone(&self.store), engine, Arc::clone(&self.session))
            .with_page_size(self.config.library_page_size)
    }

    pub async fn sync_once(&self) -> anyhow::Result<SyncReport> {
        let engine = self.engine()?;
        Ok(engine.sync_pending().await?)
    }

    pub async fn status(&self) -> anyhow::Result<QueueStatus> {
        Ok(QueueStatus {
            pending: self.store.pending_count().await?,
            dead_lettered: self.store.dead_letter_count().await?,
        })
    }

    pub async fn retry_dead_letters(&self) -> anyhow::Result<u64> {
        let requeued = self.store.retry_dead_letters().await?;
        tracing::info!(requeued, "dead letters requeued");
        Ok(requeued)
    }

    pub async fn login(&self, email: &str, password: &str) -> anyhow::Result<()> {
        let auth = AuthClient::with_base_url(&self.config.base_url)?
            .with_timeout(self.config.http_timeout)?;
        let issued = auth.login(email, password).await.context("login failed")?;
        self.session.save_token(&issued.token)?;
        if let Some(user) = issued.user {
            self.session.update_preferences(|prefs| {
                prefs.dark_mode = user.dark_mode.unwrap_or(prefs.dark_mode);
                prefs.analytics_enabled = user.analytics_enabled.unwrap_or(prefs.analytics_enabled);
                prefs.notifications_enabled = user
                    .notifications_enabled
                    .unwrap_or(prefs.notifications_enabled);
            })?;
        }
        tracing::info!(email, "signed in");
        Ok(())
    }

    /// Forgets the account and wipes every cached row.
    pub async fn logout(&self) -> anyhow::Result<()> {
        if self.session.preferences().push_token_sent
            && self.network.is_online().await
            && let Ok(engine) = self.engine()
            && let Err(err) = engine.client().remove_push_token().await
        {
            tracing::warn!("could not withdraw push token: {err}");
        }
        self.session.logout()?;
        self.store
            .clear_all()
            .await
            .context("failed to clear local store")?;
        Ok(())
    }

    /// Runs the sync worker until Ctrl-C.
    pub async fn run(self) -> anyhow::Result<()> {
        let (report_tx, mut report_rx) = mpsc::unbounded_channel();
        let engine = Arc::new(self.engine()?.with_reports(report_tx));
        let library = self.library(Arc::clone(&engine));

        if engine.is_online().await {
            match library.refresh_library().await {
                Ok(summary) => tracing::info!(stored = summary.stored, "initial library pull"),
                Err(err) => tracing::warn!("initial library pull failed: {err}"),
            }
        }

        let worker = SyncWorker::spawn(Arc::clone(&engine), self.config.sync_interval);
        worker.trigger();

        loop {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    signal.context("failed to listen for Ctrl-C")?;
                    tracing::info!("shutting down");
                    break;
                }
                Some(report) = report_rx.recv() => {
                    if report.auth_required {
                        tracing::error!("server rejected the saved token; sign in again");
                    }
                }
            }
        }

        worker.shutdown().await;
        Ok(())
    }
}

fn network_monitor(config: &AppConfig) -> anyhow::Result<NetworkMonitor> {
    if config.force_offline {
        return Ok(NetworkMonitor::Manual(ManualConnectivity::new(false)));
    }
    let url = Url::parse(&config.base_url)
        .with_context(|| format!("invalid BACKLOGGR_BASE_URL: {}", config.base_url))?;
    let check_timeout = config.http_timeout.min(Duration::from_secs(3));
    Ok(match TcpCheck::for_base_url(&url, check_timeout) {
        Some(check) => NetworkMonitor::Tcp(check),
        None => NetworkMonitor::Manual(ManualConnectivity::new(true)),
    })
}

/// Background task running a sync pass on every tick or manual trigger.
pub struct SyncWorker {
    trigger: Arc<Notify>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl SyncWorker {
    pub fn spawn<C>(engine: Arc<SyncEngine<C>>, interval: Duration) -> Self
    where
        C: Connectivity + 'static,
    {
        let trigger = Arc::new(Notify::new());
        let cancel = CancellationToken::new();
        let worker_trigger = Arc::clone(&trigger);
        let worker_cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = worker_cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                    _ = worker_trigger.notified() => {}
                }
                tokio::select! {
                    _ = worker_cancel.cancelled() => break,
                    result = engine.sync_pending() => match result {
                        Ok(report) if !report.is_clean() => {
                            tracing::warn!(
                                failed = report.failed,
                                dead_lettered = report.dead_lettered,
                                auth_required = report.auth_required,
                                "sync pass left work behind"
                            );
                        }
                        Ok(_) => {}
                        Err(err) => tracing::error!("sync pass failed: {err}"),
                    }
                }
            }
            tracing::debug!("sync worker stopped");
        });

        Self {
            trigger,
            cancel,
            handle,
        }
    }

    /// Requests a pass without waiting for the next tick.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(err) = self.handle.await {
            tracing::warn!("sync worker ended abnormally: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::TokenBackend;
    use crate::store::OperationKind;
    use crate::sync::Backoff;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;
    use tempfile::tempdir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(dir: &std::path::Path, base_url: &str) -> AppConfig {
        AppConfig {
            base_url: base_url.to_string(),
            db_path: dir.join("data").join("backloggr.db"),
            config_dir: dir.join("config"),
            sync_interval: Duration::from_secs(3600),
            http_timeout: Duration::from_secs(5),
            max_attempts: 8,
            backoff_base: Duration::from_millis(2_000),
            backoff_max: Duration::from_secs(300),
            library_page_size: 1_000,
            force_offline: true,
            token_override: None,
            token_backend: TokenBackend::File,
        }
    }

    async fn memory_store() -> Arc<LocalStore> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = LocalStore::from_pool(pool);
        store.init().await.unwrap();
        Arc::new(store)
    }

    #[tokio::test]
    async fn worker_runs_a_pass_when_triggered_and_stops_on_cancel() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/library/10"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let store = memory_store().await;
        store
            .enqueue_operation(10, OperationKind::Delete, &json!({}))
            .await
            .unwrap();
        let client = BackloggrClient::with_base_url(&server.uri(), "token-123").unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = Arc::new(
            SyncEngine::new(client, Arc::clone(&store), Arc::new(ManualConnectivity::new(true)))
                .with_backoff(Backoff::new(Duration::from_secs(1), Duration::from_secs(1), false))
                .with_reports(tx),
        );

        let worker = SyncWorker::spawn(engine, Duration::from_secs(3600));
        worker.trigger();
        let report = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.succeeded, 1);

        let token = worker.cancellation_token();
        tokio::time::timeout(Duration::from_secs(5), worker.shutdown())
            .await
            .unwrap();
        assert!(token.is_cancelled());
        assert_eq!(store.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn engine_requires_a_token() {
        let dir = tempdir().unwrap();
        let runtime = AppRuntime::bootstrap(test_config(dir.path(), "http://localhost:3000/"))
            .await
            .unwrap();
        assert!(runtime.engine().is_err());
        assert!(runtime.sync_once().await.is_err());
    }

    #[tokio::test]
    async fn forced_offline_sync_is_a_no_op() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path(), "http://localhost:3000/");
        config.token_override = Some("jwt".into());
        let runtime = AppRuntime::bootstrap(config).await.unwrap();
        runtime
            .store()
            .enqueue_operation(10, OperationKind::Delete, &json!({}))
            .await
            .unwrap();

        let report = runtime.sync_once().await.unwrap();
        assert!(report.skipped_offline);
        assert_eq!(
            runtime.status().await.unwrap(),
            QueueStatus {
                pending: 1,
                dead_lettered: 0
            }
        );
    }

    #[tokio::test]
    async fn retry_dead_letters_requeues_them() {
        let dir = tempdir().unwrap();
        let runtime = AppRuntime::bootstrap(test_config(dir.path(), "http://localhost:3000/"))
            .await
            .unwrap();
        let op = runtime
            .store()
            .enqueue_operation(10, OperationKind::Delete, &json!({}))
            .await
            .unwrap();
        runtime
            .store()
            .dead_letter_operation(op, "410 Gone")
            .await
            .unwrap();
        assert_eq!(runtime.status().await.unwrap().dead_lettered, 1);

        assert_eq!(runtime.retry_dead_letters().await.unwrap(), 1);
        assert_eq!(
            runtime.status().await.unwrap(),
            QueueStatus {
                pending: 1,
                dead_lettered: 0
            }
        );
    }

    #[tokio::test]
    async fn logout_wipes_store_and_token() {
        let dir = tempdir().unwrap();
        let runtime = AppRuntime::bootstrap(test_config(dir.path(), "http://localhost:3000/"))
            .await
            .unwrap();
        runtime.session().save_token("jwt").unwrap();
        runtime
            .store()
            .enqueue_operation(10, OperationKind::Delete, &json!({}))
            .await
            .unwrap();

        runtime.logout().await.unwrap();

        assert_eq!(runtime.session().token().unwrap(), None);
        assert_eq!(runtime.status().await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn login_stores_issued_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/auth/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "token": "issued-jwt",
                    "user": { "id": 7, "username": "mira", "dark_mode": 0 }
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let runtime = AppRuntime::bootstrap(test_config(dir.path(), &server.uri()))
            .await
            .unwrap();
        runtime.login("mira@example.com", "hunter2").await.unwrap();

        assert_eq!(runtime.session().token().unwrap().as_deref(), Some("issued-jwt"));
        assert!(!runtime.session().preferences().dark_mode);
    }

    #[tokio::test]
    async fn login_honours_the_configured_http_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/auth/login"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"data": {"token": "late-jwt"}}))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path(), &server.uri());
        config.http_timeout = Duration::from_millis(200);
        let runtime = AppRuntime::bootstrap(config).await.unwrap();

        let started = std::time::Instant::now();
        assert!(runtime.login("mira@example.com", "hunter2").await.is_err());
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(runtime.session().token().unwrap(), None);
    }
}
