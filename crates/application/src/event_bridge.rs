//! 事件中继
//!
//! 具名的发布/订阅中继，同时管理两条远端变更订阅（在线状态表、位置表）的生命周期。
//! 任何一条变更通知都只转成一次粗粒度的"网络状态可能变化"事件，由调用方重新拉取；
//! 该事件经过前沿节流，位置更新事件不节流。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use domain::{
    ChangeFeed, ChangeHandler, Coordinates, FeedNotification, FeedSpec, FeedSubscription,
    FeedTable,
};
use tracing::{debug, error, info};

use crate::callbacks::CallbackRegistry;
use crate::error::ApplicationError;
use crate::throttle::LeadingEdgeThrottle;

/// 实时订阅监听的表
pub const LIVE_FEED_TABLES: [FeedTable; 2] = [FeedTable::Availability, FeedTable::Locations];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NetworkUpdate,
    LocationUpdated,
}

/// 失效信号的来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationSource {
    Feed(FeedTable),
    Local,
}

/// 网络状态变化
///
/// 目前只有粗粒度失效：不携带变更内容，接收方需要整体重新拉取。
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkChange {
    Invalidate(InvalidationSource),
}

#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    NetworkUpdate(NetworkChange),
    LocationUpdated(Coordinates),
}

impl BridgeEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            BridgeEvent::NetworkUpdate(_) => EventKind::NetworkUpdate,
            BridgeEvent::LocationUpdated(_) => EventKind::LocationUpdated,
        }
    }

    pub fn local_invalidation() -> Self {
        BridgeEvent::NetworkUpdate(NetworkChange::Invalidate(InvalidationSource::Local))
    }
}

pub type EventListener = dyn Fn(&BridgeEvent) + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId {
    kind: EventKind,
    id: u64,
}

enum FeedState {
    Idle,
    Starting {
        generation: u64,
    },
    Active {
        generation: u64,
        subscriptions: Vec<Box<dyn FeedSubscription>>,
    },
}

impl FeedState {
    fn generation(&self) -> Option<u64> {
        match self {
            FeedState::Idle => None,
            FeedState::Starting { generation } | FeedState::Active { generation, .. } => {
                Some(*generation)
            }
        }
    }
}

struct BridgeInner {
    network_listeners: CallbackRegistry<EventListener>,
    location_listeners: CallbackRegistry<EventListener>,
    throttle: LeadingEdgeThrottle,
    feed: Arc<dyn ChangeFeed>,
    feed_state: Mutex<FeedState>,
    next_generation: AtomicU64,
}

impl BridgeInner {
    fn listeners(&self, kind: EventKind) -> &CallbackRegistry<EventListener> {
        match kind {
            EventKind::NetworkUpdate => &self.network_listeners,
            EventKind::LocationUpdated => &self.location_listeners,
        }
    }

    fn feed_state(&self) -> MutexGuard<'_, FeedState> {
        self.feed_state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: BridgeEvent) -> bool {
        let kind = event.kind();
        if kind == EventKind::NetworkUpdate && !self.throttle.try_acquire() {
            debug!(event = ?event, "节流窗口内，丢弃网络更新");
            return false;
        }

        let listeners = self.listeners(kind).snapshot();
        debug!(event = ?event, listeners = listeners.len(), "中继事件");
        for listener in listeners {
            listener(&event);
        }
        true
    }
}

/// 事件中继；克隆后共享同一份监听器与订阅状态
#[derive(Clone)]
pub struct EventBridge {
    inner: Arc<BridgeInner>,
}

impl EventBridge {
    pub fn new(feed: Arc<dyn ChangeFeed>, throttle_window: Duration) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                network_listeners: CallbackRegistry::new(),
                location_listeners: CallbackRegistry::new(),
                throttle: LeadingEdgeThrottle::new(throttle_window),
                feed,
                feed_state: Mutex::new(FeedState::Idle),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// 注册监听器，按注册顺序触发
    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&BridgeEvent) + Send + Sync + 'static,
    {
        let id = self.inner.listeners(kind).register(Arc::new(listener));
        ListenerId { kind, id }
    }

    pub fn off(&self, listener: ListenerId) -> bool {
        self.inner.listeners(listener.kind).remove(listener.id)
    }

    /// 同步中继事件；网络更新被节流丢弃时返回 false
    pub fn emit(&self, event: BridgeEvent) -> bool {
        self.inner.emit(event)
    }

    pub fn is_feed_active(&self) -> bool {
        matches!(*self.inner.feed_state(), FeedState::Active { .. })
    }

    fn change_handler(&self, table: FeedTable) -> ChangeHandler {
        let weak: Weak<BridgeInner> = Arc::downgrade(&self.inner);
        Arc::new(move |notification: FeedNotification| {
            if let Some(inner) = weak.upgrade() {
                debug!(table = %table, op = ?notification.op, "收到变更通知");
                inner.emit(BridgeEvent::NetworkUpdate(NetworkChange::Invalidate(
                    InvalidationSource::Feed(table),
                )));
            }
        })
    }

    /// 打开两条实时订阅；已启动或正在启动时直接返回 false
    ///
    /// 启动期间若被 stop，新打开的订阅会立即关闭，不会复活已停止的状态。
    pub async fn start_live_feed(&self) -> Result<bool, ApplicationError> {
        let generation = {
            let mut state = self.inner.feed_state();
            if !matches!(*state, FeedState::Idle) {
                debug!("实时订阅已启动，忽略重复调用");
                return Ok(false);
            }
            let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst);
            *state = FeedState::Starting { generation };
            generation
        };

        info!(generation, "正在连接实时订阅");
        let mut opened: Vec<Box<dyn FeedSubscription>> = Vec::with_capacity(LIVE_FEED_TABLES.len());
        for table in LIVE_FEED_TABLES {
            match self
                .inner
                .feed
                .subscribe(FeedSpec::table(table), self.change_handler(table))
                .await
            {
                Ok(subscription) => opened.push(subscription),
                Err(err) => {
                    error!(table = %table, error = %err, "实时订阅失败");
                    for subscription in opened {
                        subscription.close();
                    }
                    let mut state = self.inner.feed_state();
                    if state.generation() == Some(generation) {
                        *state = FeedState::Idle;
                    }
                    return Err(ApplicationError::Feed(err));
                }
            }
        }

        let mut state = self.inner.feed_state();
        if matches!(*state, FeedState::Starting { generation: current } if current == generation) {
            *state = FeedState::Active {
                generation,
                subscriptions: opened,
            };
            info!(generation, "实时订阅已连接");
            Ok(true)
        } else {
            drop(state);
            for subscription in opened {
                subscription.close();
            }
            info!(generation, "启动期间已被停止，关闭新建的订阅");
            Ok(false)
        }
    }

    /// 关闭实时订阅；未启动时为空操作并返回 false
    pub fn stop_live_feed(&self) -> bool {
        let previous = std::mem::replace(&mut *self.inner.feed_state(), FeedState::Idle);
        match previous {
            FeedState::Idle => false,
            FeedState::Starting { generation } => {
                info!(generation, "取消正在进行的实时订阅");
                true
            }
            FeedState::Active {
                generation,
                subscriptions,
            } => {
                for subscription in subscriptions {
                    subscription.close();
                }
                info!(generation, "实时订阅已停止");
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeChangeFeed;
    use domain::ChangeOp;
    use std::sync::atomic::AtomicUsize;

    const WINDOW: Duration = Duration::from_millis(800);

    fn counting_listener(bridge: &EventBridge, kind: EventKind) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&count);
        bridge.on(kind, move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        });
        count
    }

    #[tokio::test]
    async fn listeners_fire_in_registration_order() {
        let bridge = EventBridge::new(FakeChangeFeed::new(), WINDOW);
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b", "c"] {
            let sink = Arc::clone(&order);
            bridge.on(EventKind::LocationUpdated, move |_| sink.lock().unwrap().push(tag));
        }

        bridge.emit(BridgeEvent::LocationUpdated(Coordinates::default()));

        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn off_removes_listener() {
        let bridge = EventBridge::new(FakeChangeFeed::new(), WINDOW);
        let count = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&count);
        let id = bridge.on(EventKind::LocationUpdated, move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        });

        assert!(bridge.off(id));
        assert!(!bridge.off(id));
        bridge.emit(BridgeEvent::LocationUpdated(Coordinates::default()));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn network_updates_are_leading_edge_throttled() {
        let bridge = EventBridge::new(FakeChangeFeed::new(), WINDOW);
        let relayed = counting_listener(&bridge, EventKind::NetworkUpdate);

        let mut outcomes = Vec::new();
        let mut elapsed = 0;
        for at in [0u64, 100, 500, 900] {
            tokio::time::advance(Duration::from_millis(at - elapsed)).await;
            elapsed = at;
            outcomes.push(bridge.emit(BridgeEvent::local_invalidation()));
        }

        assert_eq!(outcomes, vec![true, false, false, true]);
        assert_eq!(relayed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn location_updates_are_not_throttled() {
        let bridge = EventBridge::new(FakeChangeFeed::new(), WINDOW);
        let relayed = counting_listener(&bridge, EventKind::LocationUpdated);

        for _ in 0..5 {
            assert!(bridge.emit(BridgeEvent::LocationUpdated(Coordinates::default())));
        }

        assert_eq!(relayed.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_closes_both_subscriptions() {
        let feed = FakeChangeFeed::new();
        let bridge = EventBridge::new(feed.clone(), WINDOW);

        assert!(bridge.start_live_feed().await.unwrap());
        assert!(!bridge.start_live_feed().await.unwrap());
        assert!(bridge.is_feed_active());
        assert_eq!(feed.open_tables(), vec![FeedTable::Availability, FeedTable::Locations]);

        assert!(bridge.stop_live_feed());
        assert!(!bridge.stop_live_feed());
        assert!(feed.open_tables().is_empty());
        assert_eq!(feed.subscribe_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn feed_notifications_relay_network_updates() {
        let feed = FakeChangeFeed::new();
        let bridge = EventBridge::new(feed.clone(), WINDOW);
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        bridge.on(EventKind::NetworkUpdate, move |event| {
            sink.lock().unwrap().push(event.clone());
        });
        bridge.start_live_feed().await.unwrap();

        feed.push(FeedTable::Locations, ChangeOp::Update);
        feed.push(FeedTable::Availability, ChangeOp::Insert);
        tokio::time::advance(WINDOW).await;
        feed.push(FeedTable::Availability, ChangeOp::Delete);

        assert_eq!(
            *events.lock().unwrap(),
            vec![
                BridgeEvent::NetworkUpdate(NetworkChange::Invalidate(InvalidationSource::Feed(
                    FeedTable::Locations
                ))),
                BridgeEvent::NetworkUpdate(NetworkChange::Invalidate(InvalidationSource::Feed(
                    FeedTable::Availability
                ))),
            ]
        );
    }

    #[tokio::test]
    async fn stop_during_start_does_not_resurrect_feed() {
        let feed = FakeChangeFeed::gated();
        let bridge = EventBridge::new(feed.clone(), WINDOW);

        let starter = bridge.clone();
        let pending = tokio::spawn(async move { starter.start_live_feed().await });
        while feed.waiting() == 0 {
            tokio::task::yield_now().await;
        }

        assert!(bridge.stop_live_feed());
        feed.open_gate();

        assert!(!pending.await.unwrap().unwrap());
        assert!(!bridge.is_feed_active());
        assert!(feed.open_tables().is_empty());
        assert!(!bridge.stop_live_feed());
    }

    #[tokio::test]
    async fn failed_subscription_resets_feed_state() {
        let feed = FakeChangeFeed::failing_on(FeedTable::Locations);
        let bridge = EventBridge::new(feed.clone(), WINDOW);

        let err = bridge.start_live_feed().await.unwrap_err();

        assert!(matches!(err, ApplicationError::Feed(_)));
        assert!(!bridge.is_feed_active());
        assert!(feed.open_tables().is_empty());
    }
}
