use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::directory::MemberDirectory;
use crate::engine::{Collaborators, Engine};
use crate::limits::*;
use crate::model::OverlapPolicy;
use crate::notify::{Notice, NotifyHub};
use crate::sweeper::{self, SweepPolicy};

/// Per-tenant engine settings shared by every tenant of the process.
#[derive(Debug, Clone, Copy)]
pub struct TenantSettings {
    pub compact_threshold: u64,
    pub policy: OverlapPolicy,
    /// Default generation window for series, in days.
    pub window_days: u32,
    pub roll_interval: Duration,
    pub sweep: SweepPolicy,
}

impl Default for TenantSettings {
    fn default() -> Self {
        Self {
            compact_threshold: 1000,
            policy: OverlapPolicy::Inclusive,
            window_days: 56,
            roll_interval: Duration::from_secs(86_400),
            sweep: SweepPolicy::default(),
        }
    }
}

/// A loaded tenant: its engine and the hub its cancellation notices go to.
#[derive(Clone)]
pub struct Tenant {
    pub engine: Arc<Engine>,
    pub notices: Arc<NotifyHub>,
}

/// Manages per-tenant engines. Each tenant gets its own Engine + WAL +
/// sweeper, series roller and compactor.
/// Tenant = database name from the pgwire connection.
pub struct TenantManager {
    tenants: DashMap<String, Tenant>,
    data_dir: PathBuf,
    settings: TenantSettings,
    members: Arc<MemberDirectory>,
    shutdown: CancellationToken,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, settings: TenantSettings, members: Arc<MemberDirectory>) -> Self {
        Self {
            tenants: DashMap::new(),
            data_dir,
            settings,
            members,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn members(&self) -> &MemberDirectory {
        &self.members
    }

    pub fn settings(&self) -> &TenantSettings {
        &self.settings
    }

    /// Get or lazily create the engine for the given tenant.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        Ok(self.tenant(tenant)?.engine)
    }

    pub fn tenant(&self, name: &str) -> std::io::Result<Tenant> {
        if let Some(tenant) = self.tenants.get(name) {
            return Ok(tenant.value().clone());
        }
        if name.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        if self.tenants.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Sanitize tenant name to prevent path traversal
        let safe_name: String = name
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }

        // Two connections may race to open the same tenant; the entry lock
        // makes sure only one engine (and one WAL writer) exists.
        let entry = self.tenants.entry(name.to_string());
        if let dashmap::mapref::entry::Entry::Occupied(existing) = &entry {
            return Ok(existing.get().clone());
        }

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let notices = Arc::new(NotifyHub::new());
        let collaborators = Collaborators {
            subscriptions: self.members.clone(),
            notifier: notices.clone(),
        };
        let engine = Arc::new(Engine::new(name, wal_path, self.settings.policy, collaborators)?);
        self.spawn_background(&engine, &notices);

        let tenant = Tenant { engine, notices };
        entry.or_insert(tenant.clone());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.tenants.len() as f64);
        Ok(tenant)
    }

    fn spawn_background(&self, engine: &Arc<Engine>, notices: &NotifyHub) {
        let token = self.shutdown.child_token();
        tokio::spawn(sweeper::run_sweeper(
            engine.clone(),
            self.settings.sweep,
            token.clone(),
        ));
        tokio::spawn(sweeper::run_roller(
            engine.clone(),
            self.settings.roll_interval,
            self.settings.window_days,
            token.clone(),
        ));
        tokio::spawn(sweeper::run_compactor(
            engine.clone(),
            self.settings.compact_threshold,
            token.clone(),
        ));
        tokio::spawn(log_notices(engine.tenant.clone(), notices.subscribe_all(), token));
    }

    /// Stop every tenant's background tasks.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// Delivery stand-in: every cancellation notice is written to the log.
async fn log_notices(tenant: String, mut rx: broadcast::Receiver<Notice>, token: CancellationToken) {
    loop {
        let notice = tokio::select! {
            _ = token.cancelled() => break,
            notice = rx.recv() => notice,
        };
        match notice {
            Ok(Notice::BookingsCancelled {
                session_id,
                student_ids,
            }) => {
                for student in student_ids {
                    tracing::info!(
                        "tenant {tenant}: notify student {student}: booking on session {session_id} cancelled"
                    );
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!("tenant {tenant}: notice log lagged, {missed} notices dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
