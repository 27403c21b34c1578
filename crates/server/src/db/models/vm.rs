/// 虚拟机数据模型

use chrono::Utc;
use common::{VmRecord, VmStatus};
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveValue::NotSet, Set};
use serde::{Deserialize, Serialize};

/// 虚拟机模型
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "vms")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub name: String,
    pub status: String,
    pub external_reference: String,
    pub host_id: String,
    pub template_id: Option<String>,

    // 配置信息
    pub memory: i64,
    pub cores: i32,
    pub ip: Option<String>,

    // 最近一次失败原因，供运维查看
    pub last_error: Option<String>,

    // 乐观锁版本
    pub version: i64,

    // 时间戳
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::host::Entity",
        from = "Column::HostId",
        to = "super::host::Column::Id"
    )]
    Host,
}

impl Related<super::host::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Host.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl From<Model> for VmRecord {
    fn from(vm: Model) -> Self {
        Self {
            id: vm.id,
            name: vm.name,
            status: VmStatus::from(vm.status),
            external_reference: vm.external_reference,
            host_id: vm.host_id,
            template_id: vm.template_id,
            memory: vm.memory,
            cores: vm.cores,
            ip: vm.ip,
            last_error: vm.last_error,
            version: vm.version,
            created_at: vm.created_at.with_timezone(&Utc),
            updated_at: vm.updated_at.with_timezone(&Utc),
        }
    }
}

/// 构造用于条件更新的 ActiveModel，主键与创建时间不参与 SET
pub fn update_model(vm: &VmRecord, next_version: i64) -> ActiveModel {
    ActiveModel {
        id: NotSet,
        name: Set(vm.name.clone()),
        status: Set(vm.status.as_str().to_string()),
        external_reference: Set(vm.external_reference.clone()),
        host_id: Set(vm.host_id.clone()),
        template_id: Set(vm.template_id.clone()),
        memory: Set(vm.memory),
        cores: Set(vm.cores),
        ip: Set(vm.ip.clone()),
        last_error: Set(vm.last_error.clone()),
        version: Set(next_version),
        created_at: NotSet,
        updated_at: Set(vm.updated_at.into()),
    }
}

/// 插入用的 ActiveModel
pub fn insert_model(vm: &VmRecord) -> ActiveModel {
    let mut active = update_model(vm, vm.version);
    active.id = Set(vm.id.clone());
    active.created_at = Set(vm.created_at.into());
    active
}
