/// 虚拟机指标数据模型

use chrono::Utc;
use common::VmMetricSeries;
use sea_orm::entity::prelude::*;
use sea_orm::Set;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// 指标序列模型，每台虚拟机每个指标名一行
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "vm_metrics")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub vm_id: String,
    pub key: String,

    // JSON 数组：Unix 秒 / 取值
    pub timestamps: JsonValue,
    pub data: JsonValue,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::vm::Entity",
        from = "Column::VmId",
        to = "super::vm::Column::Id"
    )]
    Vm,
}

impl Related<super::vm::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Vm.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl TryFrom<Model> for VmMetricSeries {
    type Error = common::Error;

    fn try_from(model: Model) -> common::Result<Self> {
        Ok(Self {
            vm_id: model.vm_id,
            key: model.key,
            timestamps: serde_json::from_value(model.timestamps)?,
            values: serde_json::from_value(model.data)?,
            updated_at: model.updated_at.with_timezone(&Utc),
        })
    }
}

pub fn insert_model(series: &VmMetricSeries) -> common::Result<ActiveModel> {
    Ok(ActiveModel {
        id: Set(common::utils::generate_id()),
        vm_id: Set(series.vm_id.clone()),
        key: Set(series.key.clone()),
        timestamps: Set(serde_json::to_value(&series.timestamps)?),
        data: Set(serde_json::to_value(&series.values)?),
        updated_at: Set(series.updated_at.into()),
    })
}
