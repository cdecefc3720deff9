//! 实时变更订阅
//!
//! 基于 Phoenix 通道协议（JSON 帧，vsn 1.0.0）。每个订阅独占一条 WebSocket 连接：
//! 加入频道并等待服务端确认后，后台任务负责读取变更帧、定时心跳，
//! 关闭订阅时发送 `phx_leave` 并断开连接。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use domain::{
    ChangeFeed, ChangeHandler, ChangeOp, FeedNotification, FeedSpec, FeedSubscription, FeedTable,
    GatewayError, GatewayResult,
};
use futures_util::{SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use crate::tokens::SessionTokens;

const PROTOCOL_VERSION: &str = "1.0.0";
const JOIN_REF: &str = "1";
const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Phoenix 通道帧
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoenixFrame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
}

impl PhoenixFrame {
    fn to_message(&self) -> GatewayResult<Message> {
        serde_json::to_string(self)
            .map(Message::text)
            .map_err(|e| GatewayError::decode(e.to_string()))
    }
}

pub fn topic_for(spec: &FeedSpec) -> String {
    match &spec.filter {
        Some(filter) => format!("realtime:public:{}:{}", spec.table, filter),
        None => format!("realtime:public:{}", spec.table),
    }
}

/// 加入频道的请求帧
pub fn join_frame(spec: &FeedSpec, access_token: &str) -> PhoenixFrame {
    let mut change = json!({
        "event": "*",
        "schema": "public",
        "table": spec.table.as_str(),
    });
    if let Some(filter) = &spec.filter {
        change["filter"] = json!(filter.to_string());
    }

    PhoenixFrame {
        topic: topic_for(spec),
        event: "phx_join".to_string(),
        payload: json!({
            "config": {
                "broadcast": { "self": false },
                "presence": { "key": "" },
                "postgres_changes": [change],
            },
            "access_token": access_token,
        }),
        reference: Some(JOIN_REF.to_string()),
        join_ref: Some(JOIN_REF.to_string()),
    }
}

/// 从变更帧中解析通知；非变更帧返回 `None`
///
/// 新版服务端把变更放在 `payload.data` 中，旧版直接放在 `payload` 中。
pub fn parse_notification(frame: &PhoenixFrame, fallback: FeedTable) -> Option<FeedNotification> {
    if frame.event != "postgres_changes" {
        return None;
    }
    let data = frame.payload.get("data").unwrap_or(&frame.payload);

    let table = data
        .get("table")
        .and_then(Value::as_str)
        .and_then(FeedTable::parse)
        .unwrap_or(fallback);
    let op = data
        .get("type")
        .or_else(|| data.get("eventType"))
        .and_then(Value::as_str)
        .map(ChangeOp::parse)
        .unwrap_or(ChangeOp::Unknown);
    let record = data
        .get("record")
        .or_else(|| data.get("new"))
        .filter(|record| record.as_object().is_some_and(|map| !map.is_empty()))
        .cloned();

    Some(FeedNotification { table, op, record })
}

pub struct RealtimeChangeFeed {
    url: String,
    tokens: Arc<SessionTokens>,
    heartbeat_interval: Duration,
    join_timeout: Duration,
    next_ref: Arc<AtomicU64>,
}

impl RealtimeChangeFeed {
    /// `url` 为 WebSocket 端点（不含查询参数）
    pub fn new(url: &str, tokens: Arc<SessionTokens>, heartbeat_interval: Duration) -> Self {
        Self {
            url: url.to_string(),
            tokens,
            heartbeat_interval,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            next_ref: Arc::new(AtomicU64::new(2)),
        }
    }

    pub fn with_join_timeout(mut self, join_timeout: Duration) -> Self {
        self.join_timeout = join_timeout;
        self
    }

    fn endpoint(&self) -> String {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!(
            "{}{}apikey={}&vsn={}",
            self.url,
            separator,
            self.tokens.api_key(),
            PROTOCOL_VERSION
        )
    }
}

async fn await_join_reply<S>(stream: &mut S, topic: &str) -> GatewayResult<()>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    while let Some(message) = stream.next().await {
        let message = message.map_err(|e| GatewayError::transport(e.to_string()))?;
        let Message::Text(text) = message else {
            continue;
        };
        let Ok(frame) = serde_json::from_str::<PhoenixFrame>(text.as_str()) else {
            continue;
        };
        if frame.topic != topic
            || frame.event != "phx_reply"
            || frame.reference.as_deref() != Some(JOIN_REF)
        {
            continue;
        }

        let status = frame
            .payload
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if status == "ok" {
            return Ok(());
        }
        let reason = frame
            .payload
            .pointer("/response/reason")
            .and_then(Value::as_str)
            .unwrap_or(status)
            .to_string();
        return Err(GatewayError::rejected(403, reason));
    }
    Err(GatewayError::transport("加入频道前连接已关闭"))
}

#[async_trait]
impl ChangeFeed for RealtimeChangeFeed {
    async fn subscribe(
        &self,
        spec: FeedSpec,
        on_change: ChangeHandler,
    ) -> GatewayResult<Box<dyn FeedSubscription>> {
        let (socket, _response) = connect_async(self.endpoint())
            .await
            .map_err(|e| GatewayError::transport(format!("实时服务连接失败: {e}")))?;
        let (mut sink, mut stream) = socket.split();

        let topic = topic_for(&spec);
        let join = join_frame(&spec, &self.tokens.bearer());
        sink.send(join.to_message()?)
            .await
            .map_err(|e| GatewayError::transport(e.to_string()))?;

        timeout(self.join_timeout, await_join_reply(&mut stream, &topic))
            .await
            .map_err(|_| GatewayError::transport("等待加入频道确认超时"))??;
        info!(topic = %topic, "实时频道已加入");

        let closed = Arc::new(AtomicBool::new(false));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let table = spec.table;
        let heartbeat_every = self.heartbeat_interval;
        let next_ref = Arc::clone(&self.next_ref);
        let task_closed = Arc::clone(&closed);

        let task = tokio::spawn(async move {
            let mut heartbeat = interval_at(Instant::now() + heartbeat_every, heartbeat_every);
            heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        let leave = PhoenixFrame {
                            topic: topic.clone(),
                            event: "phx_leave".to_string(),
                            payload: json!({}),
                            reference: Some(next_ref.fetch_add(1, Ordering::Relaxed).to_string()),
                            join_ref: Some(JOIN_REF.to_string()),
                        };
                        if let Ok(message) = leave.to_message() {
                            let _ = sink.send(message).await;
                        }
                        let _ = sink.close().await;
                        debug!(topic = %topic, "实时频道已离开");
                        break;
                    }
                    _ = heartbeat.tick() => {
                        let frame = PhoenixFrame {
                            topic: "phoenix".to_string(),
                            event: "heartbeat".to_string(),
                            payload: json!({}),
                            reference: Some(next_ref.fetch_add(1, Ordering::Relaxed).to_string()),
                            join_ref: None,
                        };
                        let sent = match frame.to_message() {
                            Ok(message) => sink.send(message).await,
                            Err(_) => continue,
                        };
                        if let Err(err) = sent {
                            warn!(topic = %topic, error = %err, "心跳发送失败，实时连接中断");
                            break;
                        }
                    }
                    message = stream.next() => {
                        match message {
                            Some(Ok(Message::Text(text))) => {
                                let frame = match serde_json::from_str::<PhoenixFrame>(text.as_str()) {
                                    Ok(frame) => frame,
                                    Err(err) => {
                                        debug!(error = %err, "忽略无法解析的实时帧");
                                        continue;
                                    }
                                };
                                if frame.event == "phx_error" || frame.event == "phx_close" {
                                    warn!(topic = %topic, event = %frame.event, "实时频道被服务端关闭");
                                    break;
                                }
                                if let Some(notification) = parse_notification(&frame, table) {
                                    if !task_closed.load(Ordering::SeqCst) {
                                        on_change(notification);
                                    }
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                warn!(topic = %topic, "实时连接已关闭");
                                break;
                            }
                            Some(Err(err)) => {
                                warn!(topic = %topic, error = %err, "实时连接读取失败");
                                break;
                            }
                            Some(Ok(_)) => {}
                        }
                    }
                }
            }
        });

        Ok(Box::new(RealtimeSubscription {
            table,
            closed,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }))
    }
}

pub struct RealtimeSubscription {
    table: FeedTable,
    closed: Arc<AtomicBool>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl RealtimeSubscription {
    fn shut_down(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(shutdown) = self.shutdown.take() {
            // 后台任务已退出时发送失败，无需处理
            let _ = shutdown.send(());
        }
        // 任务自行发送 phx_leave 后退出
        self.task.take();
    }
}

impl FeedSubscription for RealtimeSubscription {
    fn table(&self) -> FeedTable {
        self.table
    }

    fn close(mut self: Box<Self>) {
        self.shut_down();
    }
}

impl Drop for RealtimeSubscription {
    fn drop(&mut self) {
        self.shut_down();
    }
}
