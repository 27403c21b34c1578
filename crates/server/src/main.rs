/// VM Fleet - Server
///
/// 集群放置调度、地址分配、开通编排与周期对账

mod api;
mod app_state;
mod config;
mod db;
mod hypervisor;
mod services;
mod tasks;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Router};
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::{
    app_state::AppState,
    db::{establish_connection, MemoryRepository, Repository, SeaOrmRepository},
    hypervisor::{HypervisorClient, SimulatedHypervisor},
    services::TaskWorker,
    tasks::{TaskQueue, WorkItem},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .init();

    info!("🚀 启动 VM Fleet Server...");

    // 加载环境变量
    dotenvy::dotenv().ok();

    // 加载配置
    let cfg = config::Config::from_env()?;
    info!("✅ 配置加载成功");

    // 数据存储
    let repo: Arc<dyn Repository> = if cfg.database_url.starts_with("memory://") {
        warn!("使用内存数据存储，重启后数据丢失");
        Arc::new(MemoryRepository::new())
    } else {
        Arc::new(SeaOrmRepository::new(establish_connection(&cfg.database_url).await?))
    };
    info!("✅ 数据存储初始化成功");

    // Hypervisor 远程能力由外部实现注入，此处只内置模拟实现
    if !cfg.hypervisor.pretend_mode {
        anyhow::bail!("未配置 Hypervisor 客户端实现，请设置 FLEET__HYPERVISOR__PRETEND_MODE=true 以模拟模式运行");
    }
    warn!("⚠️ 模拟模式：不会执行任何真实的远程操作");
    let hypervisor: Arc<dyn HypervisorClient> = Arc::new(SimulatedHypervisor::new());

    // 任务队列
    let (queue, rx) = TaskQueue::new();
    let dispatcher = Arc::new(queue);
    let cancel = CancellationToken::new();

    let reconcile_interval = cfg.reconcile_interval();
    let workers = cfg.workers;
    let server_port = cfg.server_port;

    // 创建应用状态
    let app_state = AppState::new(cfg, repo, hypervisor, dispatcher.clone());

    let worker_handle = tokio::spawn(tasks::run_workers(
        rx,
        Arc::new(TaskWorker::new(app_state.clone())),
        workers,
        cancel.clone(),
    ));
    info!("✅ 任务队列已启动（{} 个并发）", workers);

    let reconcile_handle = tasks::schedule_periodic(
        dispatcher,
        reconcile_interval,
        WorkItem::ReconcileTick,
        cancel.clone(),
    );
    info!("✅ 对账任务已启动（每 {} 秒）", reconcile_interval.as_secs());

    // 设置CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // 构建应用路由
    let app = Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/preseed/:template_id", get(api::preseed::get_preseed))
        .nest("/api", api::api_routes())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);

    // 启动服务器
    let addr = SocketAddr::from(([0, 0, 0, 0], server_port));
    info!("🎯 服务器监听在 http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("收到退出信号，正在关闭...");
            }
            shutdown.cancel();
        })
        .await?;

    cancel.cancel();
    let _ = reconcile_handle.await;
    let _ = worker_handle.await;
    info!("👋 服务器已关闭");

    Ok(())
}

async fn root_handler() -> &'static str {
    "VM Fleet Server API v1"
}

async fn health_handler() -> &'static str {
    "OK"
}
