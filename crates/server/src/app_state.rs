/// 应用全局状态

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use common::{ipam, Result};
use tokio::sync::OwnedMutexGuard;

use crate::config::Config;
use crate::db::Repository;
use crate::hypervisor::session::SessionSettings;
use crate::hypervisor::{HypervisorClient, SessionManager};
use crate::tasks::TaskDispatch;

/// 应用状态
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// 数据存储
    pub repo: Arc<dyn Repository>,
    /// Hypervisor 远程能力
    pub hypervisor: Arc<dyn HypervisorClient>,
    /// 任务投递
    pub dispatcher: Arc<dyn TaskDispatch>,
    pub subnet_locks: SubnetLocks,
}

impl AppState {
    pub fn new(
        config: Config,
        repo: Arc<dyn Repository>,
        hypervisor: Arc<dyn HypervisorClient>,
        dispatcher: Arc<dyn TaskDispatch>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            repo,
            hypervisor,
            dispatcher,
            subnet_locks: SubnetLocks::default(),
        }
    }

    /// 为一次操作创建新的会话管理器
    pub fn session_manager(&self) -> SessionManager {
        SessionManager::new(
            self.hypervisor.clone(),
            SessionSettings::from(&self.config.hypervisor),
        )
    }
}

/// 按子网划分的建议锁
///
/// 地址是由同子网所有宿主机上的记录推算而非租用的，同一子网上的开通流程
/// 从解析地址到落库记录、从创建远端对象到落库远端引用都必须串行。
/// 键为规范化的子网 CIDR，`10.0.0.5/24` 与 `10.0.0.0/24` 共用一把锁。
#[derive(Clone, Default)]
pub struct SubnetLocks {
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl SubnetLocks {
    pub async fn lock(&self, cidr: &str) -> Result<OwnedMutexGuard<()>> {
        let key = ipam::subnet_of(cidr)?;
        let lock = self
            .locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key)
            .or_default()
            .clone();

        Ok(lock.lock_owned().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_subnet_lock_serializes_same_subnet_only() {
        let locks = SubnetLocks::default();
        let guard = locks.lock("10.0.0.0/24").await.unwrap();

        // 其他子网不受影响
        let other = tokio::time::timeout(Duration::from_millis(50), locks.lock("10.0.1.0/24")).await;
        assert!(other.is_ok());

        // 同一网络的不同写法共用一把锁
        let same = tokio::time::timeout(Duration::from_millis(50), locks.lock("10.0.0.7/24")).await;
        assert!(same.is_err());

        drop(guard);
        let same = tokio::time::timeout(Duration::from_millis(50), locks.lock("10.0.0.0/24")).await;
        assert!(same.is_ok());
    }

    #[tokio::test]
    async fn test_subnet_lock_rejects_malformed_cidr() {
        let locks = SubnetLocks::default();
        assert!(matches!(
            locks.lock("10.0.0.0").await,
            Err(common::Error::InvalidCidr(_))
        ));
    }
}
