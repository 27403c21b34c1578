/// SeaORM 数据存储实现

use async_trait::async_trait;
use common::{Error, HostRecord, Result, TemplateRecord, VmMetricSeries, VmRecord};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, QueryOrder,
    TransactionTrait,
};

use super::models::host::{self, Column as HostColumn, Entity as HostEntity};
use super::models::template::{Column as TemplateColumn, Entity as TemplateEntity};
use super::models::vm::{self, Column as VmColumn, Entity as VmEntity};
use super::models::vm_metric::{self, Column as MetricColumn, Entity as MetricEntity};
use super::Repository;

fn db_err(err: DbErr) -> Error {
    Error::Database(err.to_string())
}

#[derive(Clone)]
pub struct SeaOrmRepository {
    db: DatabaseConnection,
}

impl SeaOrmRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Repository for SeaOrmRepository {
    async fn get_host(&self, id: &str) -> Result<HostRecord> {
        HostEntity::find_by_id(id.to_string())
            .one(&self.db)
            .await
            .map_err(db_err)?
            .map(HostRecord::from)
            .ok_or_else(|| Error::NotFound(format!("宿主机 {}", id)))
    }

    async fn list_hosts(&self, zone: Option<&str>) -> Result<Vec<HostRecord>> {
        let mut query = HostEntity::find();

        if let Some(zone) = zone {
            query = query.filter(HostColumn::Zone.eq(zone));
        }

        let hosts = query
            .order_by_asc(HostColumn::Hostname)
            .all(&self.db)
            .await
            .map_err(db_err)?;

        Ok(hosts.into_iter().map(HostRecord::from).collect())
    }

    async fn update_host(&self, record: &HostRecord) -> Result<HostRecord> {
        let next_version = record.version + 1;
        let result = HostEntity::update_many()
            .set(host::update_model(record, next_version))
            .filter(HostColumn::Id.eq(record.id.as_str()))
            .filter(HostColumn::Version.eq(record.version))
            .exec(&self.db)
            .await
            .map_err(db_err)?;

        if result.rows_affected == 0 {
            // 区分记录不存在和版本冲突
            self.get_host(&record.id).await?;
            return Err(Error::StaleState(format!(
                "宿主机 {} 版本 {} 已过期",
                record.id, record.version
            )));
        }

        let mut updated = record.clone();
        updated.version = next_version;
        Ok(updated)
    }

    async fn get_template(&self, id: &str) -> Result<TemplateRecord> {
        TemplateEntity::find_by_id(id.to_string())
            .one(&self.db)
            .await
            .map_err(db_err)?
            .map(TemplateRecord::from)
            .ok_or_else(|| Error::NotFound(format!("模板 {}", id)))
    }

    async fn list_templates(&self) -> Result<Vec<TemplateRecord>> {
        let templates = TemplateEntity::find()
            .order_by_asc(TemplateColumn::Memory)
            .all(&self.db)
            .await
            .map_err(db_err)?;

        Ok(templates.into_iter().map(TemplateRecord::from).collect())
    }

    async fn get_vm(&self, id: &str) -> Result<VmRecord> {
        VmEntity::find_by_id(id.to_string())
            .one(&self.db)
            .await
            .map_err(db_err)?
            .map(VmRecord::from)
            .ok_or_else(|| Error::NotFound(format!("虚拟机 {}", id)))
    }

    async fn list_vms_on_host(&self, host_id: &str) -> Result<Vec<VmRecord>> {
        let vms = VmEntity::find()
            .filter(VmColumn::HostId.eq(host_id))
            .order_by_asc(VmColumn::Name)
            .all(&self.db)
            .await
            .map_err(db_err)?;

        Ok(vms.into_iter().map(VmRecord::from).collect())
    }

    async fn create_vm(&self, record: VmRecord) -> Result<VmRecord> {
        let model = vm::insert_model(&record)
            .insert(&self.db)
            .await
            .map_err(db_err)?;

        Ok(VmRecord::from(model))
    }

    async fn update_vm(&self, record: &VmRecord) -> Result<VmRecord> {
        let next_version = record.version + 1;
        let result = VmEntity::update_many()
            .set(vm::update_model(record, next_version))
            .filter(VmColumn::Id.eq(record.id.as_str()))
            .filter(VmColumn::Version.eq(record.version))
            .exec(&self.db)
            .await
            .map_err(db_err)?;

        if result.rows_affected == 0 {
            self.get_vm(&record.id).await?;
            return Err(Error::StaleState(format!(
                "虚拟机 {} 版本 {} 已过期",
                record.id, record.version
            )));
        }

        let mut updated = record.clone();
        updated.version = next_version;
        Ok(updated)
    }

    async fn delete_vm(&self, id: &str) -> Result<()> {
        let txn = self.db.begin().await.map_err(db_err)?;

        MetricEntity::delete_many()
            .filter(MetricColumn::VmId.eq(id))
            .exec(&txn)
            .await
            .map_err(db_err)?;
        let result = VmEntity::delete_by_id(id.to_string())
            .exec(&txn)
            .await
            .map_err(db_err)?;

        if result.rows_affected == 0 {
            return Err(Error::NotFound(format!("虚拟机 {}", id)));
        }
        txn.commit().await.map_err(db_err)
    }

    async fn replace_vm_metrics(&self, vm_id: &str, series: Vec<VmMetricSeries>) -> Result<()> {
        let txn = self.db.begin().await.map_err(db_err)?;

        MetricEntity::delete_many()
            .filter(MetricColumn::VmId.eq(vm_id))
            .exec(&txn)
            .await
            .map_err(db_err)?;
        for item in &series {
            vm_metric::insert_model(item)?
                .insert(&txn)
                .await
                .map_err(db_err)?;
        }

        txn.commit().await.map_err(db_err)
    }

    async fn list_vm_metrics(&self, vm_id: &str) -> Result<Vec<VmMetricSeries>> {
        MetricEntity::find()
            .filter(MetricColumn::VmId.eq(vm_id))
            .order_by_asc(MetricColumn::Key)
            .all(&self.db)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(VmMetricSeries::try_from)
            .collect()
    }
}
