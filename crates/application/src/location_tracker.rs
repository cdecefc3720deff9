//! 持续定位与在线心跳
//!
//! 启动后持有两个后台任务：
//! - 位置流：每个新位置先乐观写入状态中心，再发送心跳，最后中继不节流的位置事件
//! - 心跳定时器：固定间隔刷新最后活跃时间，静止的设备不会触发位置流；不在线时为空操作

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use domain::{PositionError, PositionSource, PositionStream};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::event_bridge::{BridgeEvent, EventBridge};
use crate::state_store::StateStore;

/// 默认心跳间隔
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// 启动结果
#[derive(Debug, Clone, PartialEq)]
pub enum TrackingStart {
    Started,
    AlreadyRunning,
    /// 设备不具备定位能力，跳过跟踪
    Unsupported,
    /// 定位被拒绝或不可用，跳过跟踪
    Skipped(PositionError),
}

struct TrackingTasks {
    watch: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
}

impl TrackingTasks {
    fn abort(self) {
        self.watch.abort();
        self.heartbeat.abort();
    }
}

pub struct LocationTracker {
    store: Arc<StateStore>,
    bridge: EventBridge,
    source: Arc<dyn PositionSource>,
    heartbeat_interval: Duration,
    tasks: Mutex<Option<TrackingTasks>>,
}

impl LocationTracker {
    pub fn new(
        store: Arc<StateStore>,
        bridge: EventBridge,
        source: Arc<dyn PositionSource>,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            store,
            bridge,
            source,
            heartbeat_interval,
            tasks: Mutex::new(None),
        }
    }

    fn tasks(&self) -> MutexGuard<'_, Option<TrackingTasks>> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.tasks().is_some()
    }

    /// 开始跟踪；必须在 tokio 运行时内调用
    pub fn start(&self) -> TrackingStart {
        let mut tasks = self.tasks();
        if tasks.is_some() {
            debug!("定位跟踪已在运行");
            return TrackingStart::AlreadyRunning;
        }
        if !self.source.is_supported() {
            info!("设备不支持定位，跳过跟踪");
            return TrackingStart::Unsupported;
        }

        let stream = match self.source.watch() {
            Ok(stream) => stream,
            Err(err) => {
                warn!(error = %err, "无法开始持续定位，跳过跟踪");
                return TrackingStart::Skipped(err);
            }
        };

        *tasks = Some(TrackingTasks {
            watch: tokio::spawn(watch_positions(
                Arc::clone(&self.store),
                self.bridge.clone(),
                stream,
            )),
            heartbeat: tokio::spawn(heartbeat_loop(
                Arc::clone(&self.store),
                self.heartbeat_interval,
            )),
        });
        info!(
            heartbeat_secs = self.heartbeat_interval.as_secs(),
            "开始持续定位跟踪"
        );
        TrackingStart::Started
    }

    /// 停止跟踪并取消心跳；未运行时返回 false
    pub fn stop(&self) -> bool {
        match self.tasks().take() {
            Some(tasks) => {
                tasks.abort();
                info!("定位跟踪已停止");
                true
            }
            None => false,
        }
    }
}

impl Drop for LocationTracker {
    fn drop(&mut self) {
        if let Some(tasks) = self.tasks().take() {
            tasks.abort();
        }
    }
}

async fn watch_positions(store: Arc<StateStore>, bridge: EventBridge, mut stream: PositionStream) {
    while let Some(update) = stream.recv().await {
        match update {
            Ok(position) => {
                if let Err(err) = store.set_user_location(position).await {
                    warn!(error = %err, "位置写入失败，保留本地值");
                }
                if let Err(err) = store.send_heartbeat().await {
                    warn!(error = %err, "心跳发送失败");
                }
                bridge.emit(BridgeEvent::LocationUpdated(position));
            }
            Err(err) => warn!(error = %err, "持续定位出错"),
        }
    }
    info!("位置流已结束");
}

async fn heartbeat_loop(store: Arc<StateStore>, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match store.send_heartbeat().await {
            Ok(true) => debug!("定时心跳已发送"),
            Ok(false) => debug!("当前不在线，跳过定时心跳"),
            Err(err) => warn!(error = %err, "定时心跳发送失败"),
        }
    }
}
