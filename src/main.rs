//! LunaCore 主入口
//! 结算守护进程：入账监控 + 归集两条后台任务

use anyhow::Result;
use lunacore::{config::Config, AppState};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. 加载环境变量
    dotenvy::dotenv().ok();

    // 2. 初始化日志
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lunacore=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("🚀 Starting LunaCore settlement daemon");

    // 3. 配置 + 数据库 + 种子（任何一步失败都拒绝启动）
    let config = Config::from_env()?;
    let state = AppState::init(config).await?;
    tracing::info!("✅ Database connected, migrations applied");

    // 4. 停机信号：两条后台任务跑完当前周期后退出
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let monitor = state.deposit_monitor();
    let monitor_handle = tokio::spawn(monitor.run(shutdown_rx.clone()));
    tracing::info!("✅ Deposit monitor started");

    let sweeper = state.sweep_engine();
    let sweeper_handle = tokio::spawn(sweeper.run(shutdown_rx));
    tracing::info!("✅ Sweep engine started");

    // 5. 等待 Ctrl-C
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received, draining background tasks");

    let _ = shutdown_tx.send(true);
    let _ = monitor_handle.await;
    let _ = sweeper_handle.await;

    tracing::info!("👋 LunaCore stopped cleanly");
    Ok(())
}
