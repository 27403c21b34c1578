/// 容量概览服务

use common::placement::{self, CapacityReport};
use common::Result;

use crate::app_state::AppState;

use super::load_inventory;

pub struct CapacityService {
    state: AppState,
}

impl CapacityService {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// 各模板还能放下的实例数以及全局内存/核数使用情况
    pub async fn report(&self, zone: Option<&str>) -> Result<CapacityReport> {
        let repo = self.state.repo.as_ref();
        let inventory = load_inventory(repo, zone).await?;
        let templates = repo.list_templates().await?;

        Ok(placement::capacity_report(&inventory, &templates))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::fixture;
    use crate::services::vm_service::{ProvisionRequest, VmService};

    #[tokio::test]
    async fn test_report_counts_in_flight_reservations() {
        let fx = fixture().await;
        let service = CapacityService::new(fx.state.clone());

        let before = service.report(None).await.unwrap();
        assert_eq!(before.templates.len(), 1);
        assert_eq!(before.templates[0].available_instances, 16);
        assert_eq!(before.host_cores, 8);

        VmService::new(fx.state.clone())
            .provision(ProvisionRequest {
                template_id: fx.template.id.clone(),
                host_id: None,
                zone: None,
                static_cidr: None,
                extra_segments: Vec::new(),
                hostname_prefix: "web01".to_string(),
                domain: None,
            })
            .await
            .unwrap();

        let after = service.report(None).await.unwrap();
        assert_eq!(after.templates[0].available_instances, 15);
        assert_eq!(after.vm_cores, 1);
        assert_eq!(after.core_contention, 0.125);
    }
}
