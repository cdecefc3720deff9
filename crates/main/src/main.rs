//! 主应用程序入口
//!
//! 连接托管后端，恢复或建立会话后上线，并持续同步附近在线用户。
//! 标准输入每行一个命令：`lat,lng` 上报位置，`/live`、`/offline` 切换在线状态，
//! `/search <关键词>` 设置过滤条件，`/quit` 退出。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context};
use application::{
    DiscoveryService, DiscoveryServiceDependencies, EventBridge, EventKind, LocationTracker,
    MarkerId, MarkerReconciler, MarkerSurface, MarkerView, PresenceSession,
    PresenceSessionDependencies, StateStore, StateStoreDependencies, SystemClock,
};
use config::AppConfig;
use domain::Coordinates;
use infrastructure::{ChannelPositionSource, Infrastructure};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Notify;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(3);

/// 把标记变化写入日志的显示层
struct LogSurface;

impl MarkerSurface for LogSurface {
    type Handle = MarkerId;

    fn create(&mut self, id: MarkerId, view: &MarkerView) -> MarkerId {
        info!(marker = ?id, label = %view.label, position = %view.position, "显示标记");
        id
    }

    fn update(&mut self, handle: &mut MarkerId, view: &MarkerView) {
        info!(marker = ?handle, label = %view.label, position = %view.position, "移动标记");
    }

    fn destroy(&mut self, handle: MarkerId) {
        info!(marker = ?handle, "移除标记");
    }
}

enum Command {
    Position(Coordinates),
    Live,
    Offline,
    Search(String),
    Quit,
}

fn parse_command(line: &str) -> anyhow::Result<Command> {
    let line = line.trim();
    match line {
        "/live" => Ok(Command::Live),
        "/offline" => Ok(Command::Offline),
        "/quit" => Ok(Command::Quit),
        _ => {
            if let Some(term) = line.strip_prefix("/search") {
                return Ok(Command::Search(term.trim().to_string()));
            }
            let position = line
                .parse::<Coordinates>()
                .with_context(|| format!("无法识别的输入: {line}"))?;
            Ok(Command::Position(position))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load().context("加载配置失败")?;

    // 初始化日志：RUST_LOG 优先，否则使用配置中的过滤规则
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    info!(config = %config.sanitize(), "配置已加载");

    let infra = Infrastructure::from_config(&config)?;

    let store = Arc::new(StateStore::new(StateStoreDependencies {
        auth: infra.auth.clone(),
        profiles: infra.profiles.clone(),
        presence: infra.presence.clone(),
        image_host: infra.image_host.clone(),
        clock: Arc::new(SystemClock),
    }));

    let me = match store.check_session().await? {
        Some(user) => user,
        None => match (&config.credentials.email, &config.credentials.password) {
            (Some(email), Some(password)) => store.login(email, password).await?,
            _ => bail!("没有可恢复的会话，请设置 APP_CREDENTIALS__EMAIL 与 APP_CREDENTIALS__PASSWORD"),
        },
    };
    info!(user_id = %me.id, name = %me.name, "已登录");

    let bridge = EventBridge::new(infra.feed.clone(), config.presence.refresh_throttle());
    let positions = Arc::new(ChannelPositionSource::new());
    let tracker = Arc::new(LocationTracker::new(
        Arc::clone(&store),
        bridge.clone(),
        positions.clone(),
        config.presence.heartbeat_interval(),
    ));
    let discovery = Arc::new(DiscoveryService::new(
        DiscoveryServiceDependencies {
            store: Arc::clone(&store),
            presence: infra.presence.clone(),
            discovery: infra.discovery.clone(),
        },
        config.presence.discovery_radius_km,
    ));
    let session = Arc::new(PresenceSession::new(PresenceSessionDependencies {
        store: Arc::clone(&store),
        bridge: bridge.clone(),
        tracker,
        discovery,
        positions: positions.clone(),
    }));

    // 网络更新与本地状态变化都触发一次标记刷新，多次触发合并为一次
    let refresh = Arc::new(Notify::new());
    let trigger = Arc::clone(&refresh);
    bridge.on(EventKind::NetworkUpdate, move |_| trigger.notify_one());
    let trigger = Arc::clone(&refresh);
    let _state_subscription = store.subscribe(move |_, _| trigger.notify_one());

    let search_term = Arc::new(Mutex::new(String::new()));
    let refresher = {
        let session = Arc::clone(&session);
        let refresh = Arc::clone(&refresh);
        let search_term = Arc::clone(&search_term);
        tokio::spawn(async move {
            let mut reconciler = MarkerReconciler::new(LogSurface);
            loop {
                refresh.notified().await;
                let term = search_term
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .clone();
                let report = session.refresh_markers(&mut reconciler, &term).await;
                if !report.is_empty() {
                    info!(
                        added = report.added.len(),
                        updated = report.updated.len(),
                        removed = report.removed.len(),
                        shown = reconciler.len(),
                        "地图已刷新"
                    );
                }
            }
        })
    };

    if !session.go_live().await? {
        warn!("上线失败，可输入 /live 重试");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("收到退出信号");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match parse_command(&line) {
                    Ok(Command::Position(position)) => {
                        if positions.publish(position) == 0 {
                            warn!(position = %position, "定位跟踪未运行，位置仅作为下次上线的初始值");
                        }
                    }
                    Ok(Command::Live) => {
                        session.go_live().await?;
                    }
                    Ok(Command::Offline) => {
                        session.go_offline().await;
                    }
                    Ok(Command::Search(term)) => {
                        *search_term.lock().unwrap_or_else(|p| p.into_inner()) = term;
                        refresh.notify_one();
                    }
                    Ok(Command::Quit) => break,
                    Err(err) => warn!(error = %err, "忽略输入"),
                }
            }
        }
    }

    refresher.abort();
    if let Some(handle) = session.teardown() {
        if tokio::time::timeout(TEARDOWN_TIMEOUT, handle).await.is_err() {
            warn!("标记离线超时，直接退出");
        }
    }
    info!("已退出");
    Ok(())
}
