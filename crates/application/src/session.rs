//! 在线会话编排
//!
//! 串联状态中心、事件中继、定位跟踪与附近发现：上线、下线、登出、页面关闭，
//! 以及网络更新后的标记刷新。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use domain::PositionSource;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::discovery::DiscoveryService;
use crate::error::ApplicationError;
use crate::event_bridge::{BridgeEvent, EventBridge};
use crate::location_tracker::{LocationTracker, TrackingStart};
use crate::markers::{MarkerReconciler, MarkerSurface, ReconcileReport};
use crate::state_store::StateStore;

pub struct PresenceSessionDependencies {
    pub store: Arc<StateStore>,
    pub bridge: EventBridge,
    pub tracker: Arc<LocationTracker>,
    pub discovery: Arc<DiscoveryService>,
    pub positions: Arc<dyn PositionSource>,
}

pub struct PresenceSession {
    deps: PresenceSessionDependencies,
    /// 每次下线或登出递增；进行中的上线发现代数变化后放弃启动定位跟踪
    generation: AtomicU64,
}

impl PresenceSession {
    pub fn new(deps: PresenceSessionDependencies) -> Self {
        Self {
            deps,
            generation: AtomicU64::new(0),
        }
    }

    fn superseded(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) != generation
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.deps.store
    }

    pub fn bridge(&self) -> &EventBridge {
        &self.deps.bridge
    }

    /// 上线：先读取一次当前位置，再写入在线标志；成功后启动实时订阅与定位跟踪
    ///
    /// 定位被拒绝不影响上线。无论结果如何都会中继一次网络更新。返回最终的在线状态。
    /// 上线过程中被下线或登出打断时，不再启动定位跟踪，返回打断后的状态。
    pub async fn go_live(&self) -> Result<bool, ApplicationError> {
        let user_id = self
            .deps
            .store
            .user_id()
            .ok_or(ApplicationError::NotAuthenticated)?;
        let generation = self.generation.load(Ordering::SeqCst);

        if self.deps.positions.is_supported() {
            match self.deps.positions.current_position().await {
                Ok(position) => {
                    if let Err(err) = self.deps.store.set_user_location(position).await {
                        warn!(user_id = %user_id, error = %err, "初始位置写入失败");
                    }
                }
                Err(err) => warn!(user_id = %user_id, error = %err, "无法获取当前位置，继续上线"),
            }
        }

        if self.superseded(generation) {
            info!(user_id = %user_id, "上线过程中已下线，放弃上线");
            self.deps.bridge.emit(BridgeEvent::local_invalidation());
            return Ok(self.deps.store.is_live());
        }

        let is_live = self.deps.store.set_availability(true).await;
        if is_live {
            if let Err(err) = self.deps.bridge.start_live_feed().await {
                warn!(user_id = %user_id, error = %err, "实时订阅启动失败，仅依赖手动刷新");
            }
            if self.superseded(generation) || !self.deps.store.is_live() {
                info!(user_id = %user_id, "上线过程中已下线，跳过定位跟踪");
            } else {
                if let TrackingStart::Skipped(err) = self.deps.tracker.start() {
                    warn!(user_id = %user_id, error = %err, "定位跟踪未启动");
                }
                // 启动与下线之间没有挂起点，但下线可能在另一线程上同时执行
                if self.superseded(generation) {
                    self.deps.tracker.stop();
                } else {
                    info!(user_id = %user_id, "已上线");
                }
            }
        }

        self.deps.bridge.emit(BridgeEvent::local_invalidation());
        Ok(is_live && !self.superseded(generation) && self.deps.store.is_live())
    }

    /// 下线：写入离线标志，停止实时订阅与定位跟踪。返回最终的在线状态。
    pub async fn go_offline(&self) -> bool {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let is_live = self.deps.store.set_availability(false).await;
        self.deps.bridge.stop_live_feed();
        self.deps.tracker.stop();
        self.deps.bridge.emit(BridgeEvent::local_invalidation());
        info!(is_live, "已下线");
        is_live
    }

    /// 登出：先标记离线，再停止后台任务并清空状态中心
    pub async fn logout(&self) -> Result<(), ApplicationError> {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if self.deps.store.is_live() {
            self.deps.store.set_availability(false).await;
        }
        self.deps.bridge.stop_live_feed();
        self.deps.tracker.stop();
        self.deps.store.logout().await
    }

    /// 页面关闭时尽力标记离线，不等待结果
    pub fn teardown(&self) -> Option<JoinHandle<()>> {
        self.deps.store.user_id()?;
        let store = Arc::clone(&self.deps.store);
        Some(tokio::spawn(async move {
            if store.set_availability(false).await {
                warn!("关闭前标记离线失败");
            }
        }))
    }

    /// 重新发现附近用户并对齐显示的标记
    pub async fn refresh_markers<S: MarkerSurface>(
        &self,
        reconciler: &mut MarkerReconciler<S>,
        search_term: &str,
    ) -> ReconcileReport {
        let nearby = if self.deps.store.is_live() {
            self.deps.discovery.nearby_users(search_term).await
        } else {
            Vec::new()
        };

        // 查询期间可能已下线，按查询结束时的状态对齐
        let me = self.deps.store.current_user();
        let is_live = self.deps.store.is_live();
        reconciler.reconcile(me.as_ref(), is_live, &nearby)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::DiscoveryServiceDependencies;
    use crate::event_bridge::EventKind;
    use crate::location_tracker::DEFAULT_HEARTBEAT_INTERVAL;
    use crate::markers::MarkerId;
    use crate::test_support::{
        nearby_row, store_for, FakeBackend, FakeChangeFeed, RecordingSurface, ScriptedPositions,
        PASSWORD,
    };
    use domain::{Coordinates, MockDiscoveryGateway, PositionError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Harness {
        backend: Arc<FakeBackend>,
        feed: Arc<FakeChangeFeed>,
        session: PresenceSession,
        network_updates: Arc<AtomicUsize>,
    }

    async fn harness(
        positions: Arc<ScriptedPositions>,
        discovery: MockDiscoveryGateway,
    ) -> Harness {
        harness_with_feed(positions, discovery, FakeChangeFeed::new()).await
    }

    async fn harness_with_feed(
        positions: Arc<ScriptedPositions>,
        discovery: MockDiscoveryGateway,
        feed: Arc<FakeChangeFeed>,
    ) -> Harness {
        let backend = FakeBackend::new();
        backend.register("jane@example.com");
        let store = Arc::new(store_for(&backend));
        store.login("jane@example.com", PASSWORD).await.unwrap();

        let bridge = EventBridge::new(feed.clone(), Duration::from_millis(800));
        let network_updates = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&network_updates);
        bridge.on(EventKind::NetworkUpdate, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let tracker = Arc::new(LocationTracker::new(
            Arc::clone(&store),
            bridge.clone(),
            positions.clone(),
            DEFAULT_HEARTBEAT_INTERVAL,
        ));
        let discovery = Arc::new(DiscoveryService::new(
            DiscoveryServiceDependencies {
                store: Arc::clone(&store),
                presence: backend.clone(),
                discovery: Arc::new(discovery),
            },
            15.0,
        ));

        let session = PresenceSession::new(PresenceSessionDependencies {
            store,
            bridge,
            tracker,
            discovery,
            positions,
        });

        Harness {
            backend,
            feed,
            session,
            network_updates,
        }
    }

    #[tokio::test]
    async fn go_live_persists_position_and_starts_background_work() {
        let (positions, _sender) = ScriptedPositions::new();
        positions.set_current(Ok(Coordinates::new(52.37, 4.89).unwrap()));
        let h = harness(positions, MockDiscoveryGateway::new()).await;

        assert!(h.session.go_live().await.unwrap());

        let me = h.session.store().user_id().unwrap();
        assert!(h.session.store().is_live());
        assert_eq!(
            h.backend.stored_location(me),
            Some(Coordinates::new(52.37, 4.89).unwrap())
        );
        assert!(h.session.bridge().is_feed_active());
        assert_eq!(h.feed.open_tables().len(), 2);
        assert_eq!(h.network_updates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn go_live_tolerates_permission_denial() {
        let (positions, _sender) = ScriptedPositions::new();
        positions.set_current(Err(PositionError::PermissionDenied));
        let h = harness(positions, MockDiscoveryGateway::new()).await;

        assert!(h.session.go_live().await.unwrap());
        assert!(h.session.store().location().is_none());
    }

    #[tokio::test]
    async fn failed_go_live_still_emits_network_update() {
        let (positions, _sender) = ScriptedPositions::new();
        let h = harness(positions, MockDiscoveryGateway::new()).await;
        h.backend.fail_writes(true);

        assert!(!h.session.go_live().await.unwrap());
        assert!(!h.session.bridge().is_feed_active());
        assert_eq!(h.network_updates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn go_offline_stops_feed_and_tracking() {
        let (positions, _sender) = ScriptedPositions::new();
        let h = harness(positions, MockDiscoveryGateway::new()).await;
        h.session.go_live().await.unwrap();

        assert!(!h.session.go_offline().await);

        assert!(!h.session.store().is_live());
        assert!(!h.session.bridge().is_feed_active());
        assert!(h.feed.open_tables().is_empty());
    }

    #[tokio::test]
    async fn go_offline_during_go_live_keeps_tracking_stopped() {
        let (positions, _sender) = ScriptedPositions::new();
        let feed = FakeChangeFeed::gated();
        let h = harness_with_feed(positions, MockDiscoveryGateway::new(), feed.clone()).await;
        let session = Arc::new(h.session);

        let going_live = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.go_live().await })
        };
        while feed.waiting() == 0 {
            tokio::task::yield_now().await;
        }

        assert!(!session.go_offline().await);
        feed.open_gate();
        let is_live = going_live.await.unwrap().unwrap();

        assert!(!is_live);
        assert!(!session.store().is_live());
        assert!(!session.deps.tracker.is_running());
        assert!(!session.bridge().is_feed_active());
        assert!(feed.open_tables().is_empty());
    }

    #[tokio::test]
    async fn logout_marks_offline_and_clears_store() {
        let (positions, _sender) = ScriptedPositions::new();
        let h = harness(positions, MockDiscoveryGateway::new()).await;
        h.session.go_live().await.unwrap();
        let me = h.session.store().user_id().unwrap();

        h.session.logout().await.unwrap();

        assert!(!h.backend.is_live(me));
        assert!(h.session.store().current_user().is_none());
        assert!(!h.session.bridge().is_feed_active());
    }

    #[tokio::test]
    async fn teardown_sets_unavailable_in_background() {
        let (positions, _sender) = ScriptedPositions::new();
        let h = harness(positions, MockDiscoveryGateway::new()).await;
        h.session.go_live().await.unwrap();
        let me = h.session.store().user_id().unwrap();

        let handle = h.session.teardown().unwrap();
        handle.await.unwrap();

        assert!(!h.backend.is_live(me));
    }

    #[tokio::test]
    async fn refresh_markers_reconciles_discovery_results() {
        let (positions, _sender) = ScriptedPositions::new();
        positions.set_current(Ok(Coordinates::new(1.0, 1.0).unwrap()));
        let peer = nearby_row(0.8);
        let peer_id = peer.id;
        let mut discovery = MockDiscoveryGateway::new();
        discovery
            .expect_nearby()
            .returning(move |_| Ok(vec![peer.clone()]));
        let h = harness(positions, discovery).await;
        let mut reconciler = MarkerReconciler::new(RecordingSurface::default());

        let report = h.session.refresh_markers(&mut reconciler, "").await;
        assert!(report.is_empty());

        h.session.go_live().await.unwrap();
        let report = h.session.refresh_markers(&mut reconciler, "").await;
        assert_eq!(
            report.added,
            vec![MarkerId::SelfMarker, MarkerId::Peer(peer_id)]
        );

        h.session.go_offline().await;
        let report = h.session.refresh_markers(&mut reconciler, "").await;
        assert_eq!(report.removed.len(), 2);
        assert!(reconciler.is_empty());
    }
}
