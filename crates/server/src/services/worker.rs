/// 任务执行器：把工作项分派给对应服务

use async_trait::async_trait;
use common::Result;

use crate::app_state::AppState;
use crate::tasks::{WorkExecutor, WorkItem};

use super::provision_service::ProvisionService;
use super::reconcile_service::ReconcileService;
use super::vm_service::VmService;

pub struct TaskWorker {
    state: AppState,
}

impl TaskWorker {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }
}

#[async_trait]
impl WorkExecutor for TaskWorker {
    async fn execute(&self, item: WorkItem) -> Result<()> {
        match item {
            WorkItem::Provision(job) => ProvisionService::new(self.state.clone()).run(&job).await,
            WorkItem::Lifecycle { vm_id, op } => {
                VmService::new(self.state.clone())
                    .execute_lifecycle(&vm_id, op)
                    .await
            }
            WorkItem::RefreshHost { host_id } => ReconcileService::new(self.state.clone())
                .refresh_host(&host_id)
                .await
                .map(|_| ()),
            WorkItem::ReconcileTick => ReconcileService::new(self.state.clone())
                .tick()
                .await
                .map(|_| ()),
        }
    }
}
