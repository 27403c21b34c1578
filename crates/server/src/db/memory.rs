/// 内存数据存储
///
/// 与 SeaORM 实现语义一致（含版本号条件更新），用于测试和 `memory://` 模式。

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use common::{Error, HostRecord, Result, TemplateRecord, VmMetricSeries, VmRecord};

use super::Repository;

#[derive(Default)]
struct Tables {
    hosts: HashMap<String, HostRecord>,
    templates: HashMap<String, TemplateRecord>,
    vms: HashMap<String, VmRecord>,
    metrics: HashMap<String, Vec<VmMetricSeries>>,
}

#[derive(Default)]
pub struct MemoryRepository {
    tables: Mutex<Tables>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> std::sync::MutexGuard<'_, Tables> {
        // 持锁期间不会 panic，中毒时直接取回数据
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 登记宿主机（运维录入，不属于核心接口）
    #[cfg(test)]
    pub async fn insert_host(&self, host: HostRecord) -> HostRecord {
        self.tables().hosts.insert(host.id.clone(), host.clone());
        host
    }

    /// 登记模板（运维录入，不属于核心接口）
    #[cfg(test)]
    pub async fn insert_template(&self, template: TemplateRecord) -> TemplateRecord {
        self.tables()
            .templates
            .insert(template.id.clone(), template.clone());
        template
    }

    /// 模拟一次并发写入：直接递增版本号
    #[cfg(test)]
    pub fn force_bump_vm(&self, id: &str) {
        if let Some(vm) = self.tables().vms.get_mut(id) {
            vm.version += 1;
        }
    }

    #[cfg(test)]
    pub fn vm_count(&self) -> usize {
        self.tables().vms.len()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn get_host(&self, id: &str) -> Result<HostRecord> {
        self.tables()
            .hosts
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("宿主机 {}", id)))
    }

    async fn list_hosts(&self, zone: Option<&str>) -> Result<Vec<HostRecord>> {
        let mut hosts: Vec<HostRecord> = self
            .tables()
            .hosts
            .values()
            .filter(|h| zone.map_or(true, |z| h.zone.as_deref() == Some(z)))
            .cloned()
            .collect();
        hosts.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        Ok(hosts)
    }

    async fn update_host(&self, host: &HostRecord) -> Result<HostRecord> {
        let mut tables = self.tables();
        let current = tables
            .hosts
            .get_mut(&host.id)
            .ok_or_else(|| Error::NotFound(format!("宿主机 {}", host.id)))?;

        if current.version != host.version {
            return Err(Error::StaleState(format!(
                "宿主机 {} 版本 {} != {}",
                host.id, host.version, current.version
            )));
        }

        let mut updated = host.clone();
        updated.version += 1;
        *current = updated.clone();
        Ok(updated)
    }

    async fn get_template(&self, id: &str) -> Result<TemplateRecord> {
        self.tables()
            .templates
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("模板 {}", id)))
    }

    async fn list_templates(&self) -> Result<Vec<TemplateRecord>> {
        let mut templates: Vec<TemplateRecord> =
            self.tables().templates.values().cloned().collect();
        templates.sort_by(|a, b| a.memory.cmp(&b.memory));
        Ok(templates)
    }

    async fn get_vm(&self, id: &str) -> Result<VmRecord> {
        self.tables()
            .vms
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("虚拟机 {}", id)))
    }

    async fn list_vms_on_host(&self, host_id: &str) -> Result<Vec<VmRecord>> {
        let mut vms: Vec<VmRecord> = self
            .tables()
            .vms
            .values()
            .filter(|vm| vm.host_id == host_id)
            .cloned()
            .collect();
        vms.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(vms)
    }

    async fn create_vm(&self, vm: VmRecord) -> Result<VmRecord> {
        let mut tables = self.tables();
        if tables.vms.contains_key(&vm.id) {
            return Err(Error::InvalidArgument(format!("虚拟机 {} 已存在", vm.id)));
        }
        tables.vms.insert(vm.id.clone(), vm.clone());
        Ok(vm)
    }

    async fn update_vm(&self, vm: &VmRecord) -> Result<VmRecord> {
        let mut tables = self.tables();
        let current = tables
            .vms
            .get_mut(&vm.id)
            .ok_or_else(|| Error::NotFound(format!("虚拟机 {}", vm.id)))?;

        if current.version != vm.version {
            return Err(Error::StaleState(format!(
                "虚拟机 {} 版本 {} != {}",
                vm.id, vm.version, current.version
            )));
        }

        let mut updated = vm.clone();
        updated.version += 1;
        *current = updated.clone();
        Ok(updated)
    }

    async fn delete_vm(&self, id: &str) -> Result<()> {
        let mut tables = self.tables();
        tables.metrics.remove(id);
        tables
            .vms
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("虚拟机 {}", id)))
    }

    async fn replace_vm_metrics(&self, vm_id: &str, mut series: Vec<VmMetricSeries>) -> Result<()> {
        let mut tables = self.tables();
        if !tables.vms.contains_key(vm_id) {
            return Err(Error::NotFound(format!("虚拟机 {}", vm_id)));
        }
        series.sort_by(|a, b| a.key.cmp(&b.key));
        tables.metrics.insert(vm_id.to_string(), series);
        Ok(())
    }

    async fn list_vm_metrics(&self, vm_id: &str) -> Result<Vec<VmMetricSeries>> {
        Ok(self
            .tables()
            .metrics
            .get(vm_id)
            .cloned()
            .unwrap_or_default())
    }
}
