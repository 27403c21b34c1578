/// 宿主机数据模型

use chrono::Utc;
use common::HostRecord;
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveValue::NotSet, Set};
use serde::{Deserialize, Serialize};

/// 宿主机模型
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "hosts")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub hostname: String,
    pub zone: Option<String>,

    // 资源信息（内存单位 MB）
    pub total_memory: i64,
    pub free_memory: i64,
    pub total_cores: i32,
    #[sea_orm(column_type = "Double")]
    pub cpu_utilization: f64,

    // 网络
    pub subnet: String,

    // 乐观锁版本
    pub version: i64,

    // 时间戳
    pub last_refreshed: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl From<Model> for HostRecord {
    fn from(host: Model) -> Self {
        Self {
            id: host.id,
            hostname: host.hostname,
            zone: host.zone,
            total_memory: host.total_memory,
            free_memory: host.free_memory,
            total_cores: host.total_cores,
            cpu_utilization: host.cpu_utilization,
            subnet: host.subnet,
            version: host.version,
            last_refreshed: host.last_refreshed.map(|t| t.with_timezone(&Utc)),
        }
    }
}

/// 构造用于条件更新的 ActiveModel，主键不参与 SET
pub fn update_model(host: &HostRecord, next_version: i64) -> ActiveModel {
    ActiveModel {
        id: NotSet,
        hostname: Set(host.hostname.clone()),
        zone: Set(host.zone.clone()),
        total_memory: Set(host.total_memory),
        free_memory: Set(host.free_memory),
        total_cores: Set(host.total_cores),
        cpu_utilization: Set(host.cpu_utilization),
        subnet: Set(host.subnet.clone()),
        version: Set(next_version),
        last_refreshed: Set(host.last_refreshed.map(Into::into)),
    }
}

/// 插入用的 ActiveModel
pub fn insert_model(host: &HostRecord) -> ActiveModel {
    let mut active = update_model(host, host.version);
    active.id = Set(host.id.clone());
    active
}
