/// 虚拟机模板数据模型

use common::TemplateRecord;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// 模板模型，对核心只读
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "templates")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub name: String,
    pub memory: i64,
    pub cores: i32,
    #[sea_orm(column_type = "Text")]
    pub preseed: String,
    pub iso_sr: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl From<Model> for TemplateRecord {
    fn from(template: Model) -> Self {
        Self {
            id: template.id,
            name: template.name,
            memory: template.memory,
            cores: template.cores,
            preseed: template.preseed,
            iso_sr: template.iso_sr,
        }
    }
}
