//! Tenant registry: the name → running user-server map and its lifecycle
//! operations. Structural changes hold the write lock; counter access goes
//! through the tenants' atomics under the read lock.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use crate::common::{Error, Result};
use crate::proxy::{ServerContext, Tenant};

pub struct Registry {
    ctx: Arc<ServerContext>,
    users: RwLock<HashMap<String, Arc<Tenant>>>,
}

impl Registry {
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        Self {
            ctx,
            users: RwLock::new(HashMap::new()),
        }
    }

    pub async fn exists(&self, name: &str) -> bool {
        self.users.read().await.contains_key(name)
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Tenant>> {
        self.users.read().await.get(name).cloned()
    }

    /// Construct and start a tenant. On any failure no entry is left behind.
    pub async fn add(
        &self,
        name: &str,
        cipher: &str,
        password: &str,
        port: u16,
    ) -> Result<Arc<Tenant>> {
        let mut users = self.users.write().await;
        if users.contains_key(name) {
            return Err(Error::UserExists(name.to_string()));
        }
        if port != 0 && users.values().any(|t| t.port() == port) {
            return Err(Error::Params(format!(
                "port {port} already serves another user"
            )));
        }
        let tenant = Tenant::spawn(name, cipher, password, port, self.ctx.clone())?;
        users.insert(name.to_string(), tenant.clone());
        Ok(tenant)
    }

    /// Stop the tenant's listeners and remove the entry.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let mut users = self.users.write().await;
        let tenant = users
            .remove(name)
            .ok_or_else(|| Error::UserNotFound(name.to_string()))?;
        tenant.shutdown();
        info!(user = name, "user removed");
        Ok(())
    }

    /// Replace a tenant's cipher and/or password, keeping the port and
    /// counters. Empty or absent incoming fields mean "keep the current
    /// value"; if nothing would change, the call fails.
    pub async fn modify(
        &self,
        name: &str,
        cipher: Option<&str>,
        password: Option<&str>,
    ) -> Result<Arc<Tenant>> {
        let mut users = self.users.write().await;
        let old = users
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UserNotFound(name.to_string()))?;

        let desired_cipher = match cipher {
            Some(c) if !c.is_empty() => c,
            _ => old.cipher_name(),
        };
        let desired_password = match password {
            Some(p) if !p.is_empty() => p,
            _ => old.password(),
        };
        if desired_cipher == old.cipher_name() && desired_password == old.password() {
            return Err(Error::NothingModified);
        }

        // SO_REUSEPORT lets the replacement bind next to the old listeners,
        // so the port never goes dark during the handoff.
        let tenant = Tenant::spawn(
            name,
            desired_cipher,
            desired_password,
            old.port(),
            self.ctx.clone(),
        )?;
        let (traffic, time) = old.counters();
        tenant.set_counters(traffic, time);
        old.shutdown();
        users.insert(name.to_string(), tenant.clone());
        info!(user = name, "user modified");
        Ok(tenant)
    }

    /// Zero every tenant's counters without disturbing the listeners.
    pub async fn reset_all(&self) {
        for tenant in self.users.read().await.values() {
            tenant.reset_counters();
        }
    }

    /// Counter snapshot, per-tenant consistent.
    pub async fn snapshot(&self) -> HashMap<String, (u64, i64)> {
        self.users
            .read()
            .await
            .iter()
            .map(|(name, tenant)| (name.clone(), tenant.counters()))
            .collect()
    }

    /// Signal shutdown to every tenant (process exit path).
    pub async fn shutdown_all(&self) {
        for tenant in self.users.read().await.values() {
            tenant.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::test_support::test_context;

    fn registry() -> Registry {
        Registry::new(test_context(None))
    }

    #[tokio::test]
    async fn add_exists_delete_re_add() {
        let reg = registry();
        let tenant = reg.add("alice", "AES-128-GCM", "pw", 0).await.unwrap();
        let port = tenant.port();
        assert!(reg.exists("alice").await);

        assert!(matches!(
            reg.add("alice", "AES-128-GCM", "pw", 0).await,
            Err(Error::UserExists(_))
        ));

        reg.delete("alice").await.unwrap();
        assert!(!reg.exists("alice").await);
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        // Same name and same port bind again after deletion.
        let again = reg.add("alice", "AES-128-GCM", "pw", port).await.unwrap();
        assert_eq!(again.port(), port);
        reg.delete("alice").await.unwrap();
    }

    #[tokio::test]
    async fn delete_unknown_user_fails() {
        let reg = registry();
        assert!(matches!(
            reg.delete("ghost").await,
            Err(Error::UserNotFound(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_port_is_refused() {
        let reg = registry();
        let tenant = reg.add("alice", "AES-128-GCM", "pw", 0).await.unwrap();
        let err = reg.add("bob", "AES-128-GCM", "pw", tenant.port()).await;
        assert!(matches!(err, Err(Error::Params(_))));
        reg.shutdown_all().await;
    }

    #[tokio::test]
    async fn modify_requires_a_change() {
        let reg = registry();
        reg.add("alice", "AES-128-GCM", "pw", 0).await.unwrap();

        assert!(matches!(
            reg.modify("alice", None, None).await,
            Err(Error::NothingModified)
        ));
        assert!(matches!(
            reg.modify("alice", Some(""), Some("")).await,
            Err(Error::NothingModified)
        ));
        assert!(matches!(
            reg.modify("alice", Some("AES-128-GCM"), Some("pw")).await,
            Err(Error::NothingModified)
        ));
        reg.shutdown_all().await;
    }

    #[tokio::test]
    async fn modify_keeps_port_and_counters() {
        let reg = registry();
        let old = reg.add("alice", "AES-128-GCM", "pw", 0).await.unwrap();
        let port = old.port();
        old.add_traffic(12345);
        old.add_time_ms(67);

        let tenant = reg
            .modify("alice", Some("AES-256-GCM"), None)
            .await
            .unwrap();
        assert_eq!(tenant.port(), port);
        assert_eq!(tenant.counters(), (12345, 67));
        assert_eq!(tenant.cipher_name(), "AES-256-GCM");
        assert_eq!(tenant.password(), "pw");
        reg.shutdown_all().await;
    }

    #[tokio::test]
    async fn modify_unknown_user_fails() {
        let reg = registry();
        assert!(matches!(
            reg.modify("ghost", Some("AES-256-GCM"), None).await,
            Err(Error::UserNotFound(_))
        ));
    }

    #[tokio::test]
    async fn reset_all_then_snapshot_is_all_zeros() {
        let reg = registry();
        let a = reg.add("alice", "AES-128-GCM", "pw", 0).await.unwrap();
        let b = reg.add("bob", "AES-256-GCM", "pw2", 0).await.unwrap();
        a.add_traffic(10);
        b.add_traffic(20);
        b.add_time_ms(5);

        reg.reset_all().await;
        let snap = reg.snapshot().await;
        assert_eq!(snap["alice"], (0, 0));
        assert_eq!(snap["bob"], (0, 0));
        reg.shutdown_all().await;
    }
}
