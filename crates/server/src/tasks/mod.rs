/// 异步任务
///
/// 编排与对账都以工作项的形式投递到任务队列，核心只依赖 `TaskDispatch` 接口。

pub mod queue;

use async_trait::async_trait;
use common::ipam::Addressing;
use common::Result;
use serde::{Deserialize, Serialize};

pub use queue::{run_workers, schedule_periodic, RecordingDispatcher, TaskQueue};

/// 一次开通流程所需的参数，地址已在提交时解析完成
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionJob {
    pub vm_id: String,
    pub addressing: Option<Addressing>,
    /// 附加网段（网桥名），按调用方顺序依次作为 1、2… 号网卡
    pub extra_segments: Vec<String>,
}

/// 单步生命周期操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleOp {
    Start,
    Stop,
    Reboot,
    Terminate,
}

impl LifecycleOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleOp::Start => "start",
            LifecycleOp::Stop => "stop",
            LifecycleOp::Reboot => "reboot",
            LifecycleOp::Terminate => "terminate",
        }
    }
}

/// 工作项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkItem {
    Provision(ProvisionJob),
    Lifecycle { vm_id: String, op: LifecycleOp },
    RefreshHost { host_id: String },
    ReconcileTick,
}

impl WorkItem {
    /// 日志用的简短描述
    pub fn label(&self) -> String {
        match self {
            WorkItem::Provision(job) => format!("provision:{}", job.vm_id),
            WorkItem::Lifecycle { vm_id, op } => format!("{}:{}", op.as_str(), vm_id),
            WorkItem::RefreshHost { host_id } => format!("refresh:{}", host_id),
            WorkItem::ReconcileTick => "reconcile_tick".to_string(),
        }
    }
}

/// 投递工作项，立即返回
pub trait TaskDispatch: Send + Sync {
    fn submit(&self, item: WorkItem) -> Result<()>;
}

/// 执行工作项
#[async_trait]
pub trait WorkExecutor: Send + Sync {
    async fn execute(&self, item: WorkItem) -> Result<()>;
}
