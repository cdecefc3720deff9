//! 定位来源
//!
//! `ChannelPositionSource` 由外部（命令行输入、设备驱动）推送位置，
//! 同时记住最后一次位置供单次读取；`UnsupportedPositionSource` 表示设备没有定位能力。

use std::sync::Mutex;

use async_trait::async_trait;
use domain::{Coordinates, PositionError, PositionSource, PositionStream};
use tokio::sync::mpsc;
use tracing::debug;

const DEFAULT_CAPACITY: usize = 16;

type PositionSender = mpsc::Sender<Result<Coordinates, PositionError>>;

#[derive(Default)]
struct PositionState {
    last: Option<Coordinates>,
    watchers: Vec<PositionSender>,
}

pub struct ChannelPositionSource {
    state: Mutex<PositionState>,
    capacity: usize,
}

impl Default for ChannelPositionSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelPositionSource {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(PositionState::default()),
            capacity: capacity.max(1),
        }
    }

    pub fn last_position(&self) -> Option<Coordinates> {
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .last
    }

    /// 推送新位置，返回收到该位置的观察者数量
    pub fn publish(&self, position: Coordinates) -> usize {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.last = Some(position);
        Self::broadcast(&mut state.watchers, Ok(position))
    }

    /// 推送定位失败
    pub fn publish_error(&self, error: PositionError) -> usize {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        Self::broadcast(&mut state.watchers, Err(error))
    }

    pub fn watcher_count(&self) -> usize {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.watchers.retain(|watcher| !watcher.is_closed());
        state.watchers.len()
    }

    // 观察者处理不过来时丢弃本次位置，下一次推送会带来更新的值
    fn broadcast(
        watchers: &mut Vec<PositionSender>,
        item: Result<Coordinates, PositionError>,
    ) -> usize {
        watchers.retain(|watcher| !watcher.is_closed());
        let mut delivered = 0;
        for watcher in watchers.iter() {
            match watcher.try_send(item.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => debug!("定位观察者积压，丢弃本次位置"),
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }
}

#[async_trait]
impl PositionSource for ChannelPositionSource {
    fn is_supported(&self) -> bool {
        true
    }

    async fn current_position(&self) -> Result<Coordinates, PositionError> {
        self.last_position().ok_or(PositionError::Timeout)
    }

    fn watch(&self) -> Result<PositionStream, PositionError> {
        let (sender, receiver) = mpsc::channel(self.capacity);
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .watchers
            .push(sender);
        Ok(receiver)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedPositionSource;

#[async_trait]
impl PositionSource for UnsupportedPositionSource {
    fn is_supported(&self) -> bool {
        false
    }

    async fn current_position(&self) -> Result<Coordinates, PositionError> {
        Err(PositionError::Unavailable)
    }

    fn watch(&self) -> Result<PositionStream, PositionError> {
        Err(PositionError::Unavailable)
    }
}
