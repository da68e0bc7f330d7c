use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::calendar::InMemoryCalendar;
use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::policy::PolicyHandle;
use crate::sweeper;

/// One tenant's engine and the calendar it mirrors holds into.
#[derive(Clone)]
pub struct Tenant {
    pub engine: Arc<Engine>,
    pub calendar: Arc<InMemoryCalendar>,
}

/// Manages per-tenant engines. Each tenant gets its own Engine + WAL + calendar + sweeper.
/// Tenant = database name from the pgwire connection. The booking policy is shared.
pub struct TenantManager {
    tenants: DashMap<String, Tenant>,
    data_dir: PathBuf,
    policy: Arc<PolicyHandle>,
    compact_threshold: u64,
    sweep_interval: Duration,
    shutdown: CancellationToken,
}

impl TenantManager {
    pub fn new(
        data_dir: PathBuf,
        policy: Arc<PolicyHandle>,
        compact_threshold: u64,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            tenants: DashMap::new(),
            data_dir,
            policy,
            compact_threshold,
            sweep_interval,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn policy(&self) -> &Arc<PolicyHandle> {
        &self.policy
    }

    /// Get or lazily create the engine for the given tenant.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        self.tenant(tenant).map(|t| t.engine)
    }

    /// Tenants are keyed by their sanitised name, the same name their WAL file gets,
    /// so two spellings that map to one file share one engine.
    pub fn tenant(&self, name: &str) -> std::io::Result<Tenant> {
        if name.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
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

        if let Some(t) = self.tenants.get(&safe_name) {
            return Ok(t.value().clone());
        }
        if self.tenants.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Two first connections may race here; the entry keeps exactly one engine.
        let entry = self.tenants.entry(safe_name.clone());
        if let dashmap::mapref::entry::Entry::Occupied(existing) = &entry {
            return Ok(existing.get().clone());
        }

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let calendar = Arc::new(InMemoryCalendar::new());
        let engine = Arc::new(Engine::new(
            wal_path,
            Arc::new(NotifyHub::new()),
            calendar.clone(),
            self.policy.clone(),
        )?);

        tokio::spawn(sweeper::run_sweeper(
            engine.clone(),
            self.sweep_interval,
            self.shutdown.child_token(),
        ));
        tokio::spawn(sweeper::run_compactor(
            engine.clone(),
            self.compact_threshold,
            self.shutdown.child_token(),
        ));

        let created = Tenant { engine, calendar };
        entry.or_insert(created.clone());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.tenants.len() as f64);
        tracing::info!("tenant {safe_name} loaded");
        Ok(created)
    }

    /// Stop every tenant's sweeper and compactor.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::HoldRequest;
    use crate::model::*;
    use crate::policy::{BookingPolicy, ServiceDef};
    use std::fs;
    use ulid::Ulid;

    const MONDAY: Ms = 1_772_409_600_000;
    const H: Ms = 3_600_000;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotlock_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn manager(dir: PathBuf) -> TenantManager {
        let mut policy = BookingPolicy::default();
        policy.services.insert(
            "cut".into(),
            ServiceDef {
                id: "cut".into(),
                category: "hair".into(),
                duration_minutes: 60,
                price: 3000,
                deposit: 0,
            },
        );
        TenantManager::new(
            dir,
            Arc::new(PolicyHandle::new(policy)),
            1000,
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let dir = test_data_dir("isolation");
        let tm = manager(dir);

        let eng_a = tm.get_or_create("tenant_a").unwrap();
        let eng_b = tm.get_or_create("tenant_b").unwrap();

        let pid = Ulid::new();
        // A Monday at least a week ahead.
        let week = 7 * 24 * H;
        let day = MONDAY + ((crate::clock::now_ms() - MONDAY).div_euclid(week) + 2) * week;
        let window = Span::new(day + 10 * H, day + 11 * H);

        let request = |reference: &str| HoldRequest {
            professional_id: pid,
            customer_id: "c1".into(),
            window,
            service_ids: vec!["cut".into()],
            payment_reference: reference.into(),
        };

        eng_a.create_hold(request("pay_a")).await.unwrap();
        // Same professional id and window in another tenant is a different ledger.
        eng_b.create_hold(request("pay_a")).await.unwrap();

        assert_eq!(eng_a.list_appointments(&pid).await.len(), 1);
        assert_eq!(eng_b.list_appointments(&pid).await.len(), 1);
        tm.shutdown();
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let dir = test_data_dir("lazy");
        let tm = manager(dir.clone());

        // No WAL files should exist yet
        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert!(entries.is_empty());

        let _eng = tm.get_or_create("my_db").unwrap();
        assert!(dir.join("my_db.wal").exists());
        tm.shutdown();
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let dir = test_data_dir("same_eng");
        let tm = manager(dir);

        let t1 = tm.tenant("foo").unwrap();
        let t2 = tm.tenant("foo").unwrap();
        assert!(Arc::ptr_eq(&t1.engine, &t2.engine));
        assert!(Arc::ptr_eq(&t1.calendar, &t2.calendar));
        tm.shutdown();
    }

    #[tokio::test]
    async fn tenant_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let tm = manager(dir.clone());

        let _eng = tm.get_or_create("../evil").unwrap();
        assert!(dir.join("evil.wal").exists());

        // Empty after sanitization
        assert!(tm.get_or_create("../..").is_err());
        tm.shutdown();
    }

    #[tokio::test]
    async fn names_sharing_a_wal_file_share_an_engine() {
        let dir = test_data_dir("shared_wal");
        let tm = manager(dir.clone());

        let dotted = tm.get_or_create("shop.a").unwrap();
        let plain = tm.get_or_create("shopa").unwrap();
        assert!(Arc::ptr_eq(&dotted, &plain));

        let wal_files: Vec<String> = fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(".wal"))
            .collect();
        assert_eq!(wal_files, vec!["shopa.wal".to_string()]);

        // One ledger: the second spelling sees the first one's hold.
        let pid = Ulid::new();
        let week = 7 * 24 * H;
        let day = MONDAY + ((crate::clock::now_ms() - MONDAY).div_euclid(week) + 2) * week;
        let hold = |reference: &str| HoldRequest {
            professional_id: pid,
            customer_id: "cust".into(),
            window: Span::new(day + 10 * H, day + 11 * H),
            service_ids: vec!["cut".into()],
            payment_reference: reference.into(),
        };
        dotted.create_hold(hold("pay_1")).await.unwrap();
        assert!(plain.create_hold(hold("pay_2")).await.is_err());
        tm.shutdown();
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let dir = test_data_dir("name_too_long");
        let tm = manager(dir);

        let long_name = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        let err = tm.get_or_create(&long_name).err().unwrap();
        assert!(err.to_string().contains("tenant name too long"));
    }

    #[tokio::test]
    async fn tenant_count_limit() {
        let dir = test_data_dir("count_limit");
        let tm = manager(dir);

        for i in 0..MAX_TENANTS {
            tm.get_or_create(&format!("t{i}")).unwrap();
        }
        let err = tm.get_or_create("one_more").err().unwrap();
        assert!(err.to_string().contains("too many tenants"));
        tm.shutdown();
    }
}
