/// VM Fleet - 公共库
///
/// 提供记录类型、错误处理、地址分配与放置调度等纯逻辑

pub mod errors;
pub mod ipam;
pub mod models;
pub mod placement;
pub mod utils;

// 重新导出常用类型
pub use errors::{Error, Result};
pub use models::{HostRecord, TemplateRecord, VmMetricSeries, VmRecord, VmStatus};
