//! 内存后端
//!
//! 在进程内模拟托管后端：账号、资料、在线状态、位置、私信五张表以及变更推送。
//! 多个 `MemoryClient` 共享同一个 `MemoryBackend`，各自持有独立会话，
//! 用于本地演示与端到端测试。写操作只允许修改自己的行。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use chrono::Utc;
use domain::{
    AuthGateway, AuthUser, Availability, ChangeFeed, ChangeHandler, ChangeOp, ChatMessage,
    Coordinates, DiscoveryGateway, FeedNotification, FeedSpec, FeedSubscription, FeedTable,
    GatewayError, GatewayResult, LocationRecord, MessageGateway, NearbyQuery, NearbyRow,
    NewMessage, PresenceGateway, Profile, ProfileGateway, ProfileUpdate, Timestamp, UserId,
};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

struct Account {
    user: AuthUser,
    password: String,
    confirmed: bool,
}

#[derive(Default)]
struct Tables {
    accounts: HashMap<String, Account>,
    profiles: HashMap<UserId, Profile>,
    availability: HashMap<UserId, Availability>,
    locations: HashMap<UserId, LocationRecord>,
    messages: Vec<ChatMessage>,
}

struct Subscriber {
    id: u64,
    spec: FeedSpec,
    handler: ChangeHandler,
}

type Subscribers = Mutex<Vec<Subscriber>>;

#[derive(Default)]
pub struct MemoryBackend {
    tables: Mutex<Tables>,
    subscribers: Arc<Subscribers>,
    next_subscriber: AtomicU64,
    unreachable: AtomicBool,
}

fn account_key(email: &str) -> String {
    email.trim().to_lowercase()
}

fn contains_term(profile: &Profile, term: &str) -> bool {
    let fields = [
        profile.full_name.as_deref(),
        profile.role.as_deref(),
        profile.bio.as_deref(),
    ];
    fields
        .iter()
        .flatten()
        .any(|value| value.to_lowercase().contains(term))
        || profile
            .interests
            .iter()
            .flatten()
            .any(|interest| interest.to_lowercase().contains(term))
}

impl MemoryBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn subscribers(&self) -> MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// 新建一个持有独立会话的客户端
    pub fn client(self: &Arc<Self>) -> MemoryClient {
        MemoryClient {
            backend: Arc::clone(self),
            session: Mutex::new(None),
        }
    }

    /// 模拟网络中断：之后的所有请求返回传输错误
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    fn ensure_reachable(&self) -> GatewayResult<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(GatewayError::transport("memory backend unreachable"));
        }
        Ok(())
    }

    /// 创建已验证邮箱的账号
    pub fn register(&self, email: &str, password: &str, full_name: &str) -> AuthUser {
        let user = self.create_account(email, password, full_name);
        self.confirm_email(email);
        user
    }

    pub fn confirm_email(&self, email: &str) -> bool {
        match self.tables().accounts.get_mut(&account_key(email)) {
            Some(account) => {
                account.confirmed = true;
                true
            }
            None => false,
        }
    }

    fn create_account(&self, email: &str, password: &str, full_name: &str) -> AuthUser {
        let mut tables = self.tables();
        let key = account_key(email);
        if let Some(existing) = tables.accounts.get(&key) {
            return existing.user.clone();
        }

        let user = AuthUser {
            id: UserId::from(Uuid::new_v4()),
            email: email.trim().to_string(),
        };
        let full_name = Some(full_name.trim().to_string()).filter(|name| !name.is_empty());
        tables.profiles.insert(
            user.id,
            Profile {
                id: user.id,
                full_name,
                ..Profile::default()
            },
        );
        tables.availability.insert(user.id, Availability::default());
        tables.accounts.insert(
            key,
            Account {
                user: user.clone(),
                password: password.to_string(),
                confirmed: false,
            },
        );
        user
    }

    pub fn availability_of(&self, id: UserId) -> Option<Availability> {
        self.tables().availability.get(&id).copied()
    }

    pub fn location_of(&self, id: UserId) -> Option<Coordinates> {
        self.tables().locations.get(&id).map(LocationRecord::coordinates)
    }

    pub fn profile_of(&self, id: UserId) -> Option<Profile> {
        self.tables().profiles.get(&id).cloned()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers().len()
    }

    /// 按订阅条件分发变更；回调在释放所有锁之后执行
    fn publish<T: Serialize>(&self, table: FeedTable, op: ChangeOp, row: &T) {
        let record = serde_json::to_value(row).ok();
        let targets: Vec<ChangeHandler> = self
            .subscribers()
            .iter()
            .filter(|subscriber| subscriber.spec.table == table)
            .filter(|subscriber| match (&subscriber.spec.filter, &record) {
                (None, _) => true,
                (Some(filter), Some(record)) => filter.matches(record),
                (Some(_), None) => false,
            })
            .map(|subscriber| Arc::clone(&subscriber.handler))
            .collect();

        debug!(table = %table, receivers = targets.len(), "分发变更通知");
        for handler in targets {
            handler(FeedNotification {
                table,
                op,
                record: record.clone(),
            });
        }
    }

    fn subscribe_handler(&self, spec: FeedSpec, handler: ChangeHandler) -> MemorySubscription {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let table = spec.table;
        self.subscribers().push(Subscriber { id, spec, handler });
        MemorySubscription {
            id,
            table,
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }

    fn nearby_rows(&self, caller: Option<UserId>, query: &NearbyQuery) -> Vec<NearbyRow> {
        let term = query.search_term.trim().to_lowercase();
        let tables = self.tables();

        let mut rows: Vec<NearbyRow> = tables
            .availability
            .iter()
            .filter(|(id, availability)| availability.is_available && Some(**id) != caller)
            .filter_map(|(id, _)| {
                let location = tables.locations.get(id)?;
                let distance_km = query.center.distance_km(&location.coordinates());
                if distance_km > query.radius_km {
                    return None;
                }
                let profile = tables.profiles.get(id).cloned().unwrap_or(Profile {
                    id: *id,
                    ..Profile::default()
                });
                if !term.is_empty() && !contains_term(&profile, &term) {
                    return None;
                }
                Some(NearbyRow {
                    id: *id,
                    full_name: profile.full_name,
                    role: profile.role,
                    avatar_url: profile.avatar_url,
                    latitude: location.latitude,
                    longitude: location.longitude,
                    distance_km,
                    bio: profile.bio,
                    interests: profile.interests,
                    phone: profile.phone,
                })
            })
            .collect();

        rows.sort_by(|a, b| a.distance_km.total_cmp(&b.distance_km));
        rows
    }
}

pub struct MemorySubscription {
    id: u64,
    table: FeedTable,
    subscribers: Weak<Subscribers>,
}

impl MemorySubscription {
    fn remove(&self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            subscribers
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .retain(|subscriber| subscriber.id != self.id);
        }
    }
}

impl FeedSubscription for MemorySubscription {
    fn table(&self) -> FeedTable {
        self.table
    }

    fn close(self: Box<Self>) {
        // Drop 负责移除
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        self.remove();
    }
}

/// 内存后端的一个客户端会话
pub struct MemoryClient {
    backend: Arc<MemoryBackend>,
    session: Mutex<Option<AuthUser>>,
}

impl MemoryClient {
    pub fn backend(&self) -> &Arc<MemoryBackend> {
        &self.backend
    }

    fn current(&self) -> Option<AuthUser> {
        self.session
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn set_session(&self, user: Option<AuthUser>) {
        *self.session.lock().unwrap_or_else(|p| p.into_inner()) = user;
    }

    /// 只允许会话用户修改自己的行
    fn authorize(&self, owner: UserId) -> GatewayResult<()> {
        self.backend.ensure_reachable()?;
        match self.current() {
            Some(user) if user.id == owner => Ok(()),
            Some(_) => Err(GatewayError::rejected(403, "row belongs to another user")),
            None => Err(GatewayError::NoSession),
        }
    }
}

#[async_trait]
impl AuthGateway for MemoryClient {
    async fn sign_up(&self, email: &str, password: &str, full_name: &str) -> GatewayResult<()> {
        self.backend.ensure_reachable()?;
        let user = self.backend.create_account(email, password, full_name);
        info!(user_id = %user.id, "内存后端已创建账号，等待邮箱验证");
        Ok(())
    }

    async fn login(&self, email: &str, password: &str) -> GatewayResult<AuthUser> {
        self.backend.ensure_reachable()?;
        let user = {
            let tables = self.backend.tables();
            let account = tables
                .accounts
                .get(&account_key(email))
                .filter(|account| account.password == password)
                .ok_or(GatewayError::InvalidCredentials)?;
            if !account.confirmed {
                return Err(GatewayError::rejected(400, "Email not confirmed"));
            }
            account.user.clone()
        };
        self.set_session(Some(user.clone()));
        Ok(user)
    }

    async fn logout(&self) -> GatewayResult<()> {
        self.set_session(None);
        Ok(())
    }

    async fn get_session(&self) -> GatewayResult<Option<AuthUser>> {
        self.backend.ensure_reachable()?;
        Ok(self.current())
    }
}

#[async_trait]
impl ProfileGateway for MemoryClient {
    async fn get_profile(&self, id: UserId) -> GatewayResult<Option<Profile>> {
        self.backend.ensure_reachable()?;
        Ok(self.backend.profile_of(id))
    }

    async fn update_profile(
        &self,
        id: UserId,
        fields: ProfileUpdate,
        updated_at: Timestamp,
    ) -> GatewayResult<()> {
        self.authorize(id)?;
        let mut tables = self.backend.tables();
        let profile = tables.profiles.entry(id).or_insert_with(|| Profile {
            id,
            ..Profile::default()
        });
        if let Some(full_name) = fields.full_name {
            profile.full_name = Some(full_name);
        }
        if let Some(role) = fields.role {
            profile.role = Some(role);
        }
        if let Some(bio) = fields.bio {
            profile.bio = Some(bio);
        }
        if let Some(interests) = fields.interests {
            profile.interests = Some(interests);
        }
        if let Some(phone) = fields.phone {
            profile.phone = Some(phone);
        }
        if let Some(avatar_url) = fields.avatar_url {
            profile.avatar_url = Some(avatar_url);
        }
        profile.updated_at = Some(updated_at);
        Ok(())
    }
}

#[derive(Serialize)]
struct AvailabilityRow {
    user_id: UserId,
    #[serde(flatten)]
    availability: Availability,
}

#[derive(Serialize)]
struct LocationRow {
    user_id: UserId,
    #[serde(flatten)]
    location: LocationRecord,
}

#[async_trait]
impl PresenceGateway for MemoryClient {
    async fn get_availability(&self, id: UserId) -> GatewayResult<Option<Availability>> {
        self.backend.ensure_reachable()?;
        Ok(self.backend.availability_of(id))
    }

    async fn set_availability(
        &self,
        id: UserId,
        is_available: bool,
        at: Timestamp,
    ) -> GatewayResult<()> {
        self.authorize(id)?;
        let availability = Availability {
            is_available,
            last_active_at: Some(at),
        };
        self.backend.tables().availability.insert(id, availability);
        self.backend.publish(
            FeedTable::Availability,
            ChangeOp::Update,
            &AvailabilityRow {
                user_id: id,
                availability,
            },
        );
        Ok(())
    }

    async fn heartbeat(&self, id: UserId, at: Timestamp) -> GatewayResult<()> {
        self.authorize(id)?;
        let availability = {
            let mut tables = self.backend.tables();
            let row = tables.availability.entry(id).or_default();
            row.last_active_at = Some(at);
            *row
        };
        self.backend.publish(
            FeedTable::Availability,
            ChangeOp::Update,
            &AvailabilityRow {
                user_id: id,
                availability,
            },
        );
        Ok(())
    }

    async fn get_location(&self, id: UserId) -> GatewayResult<Option<LocationRecord>> {
        self.backend.ensure_reachable()?;
        Ok(self.backend.tables().locations.get(&id).copied())
    }

    async fn set_location(
        &self,
        id: UserId,
        position: Coordinates,
        at: Timestamp,
    ) -> GatewayResult<()> {
        self.authorize(id)?;
        let location = LocationRecord::new(position, at);
        let op = match self.backend.tables().locations.insert(id, location) {
            Some(_) => ChangeOp::Update,
            None => ChangeOp::Insert,
        };
        self.backend.publish(
            FeedTable::Locations,
            op,
            &LocationRow {
                user_id: id,
                location,
            },
        );
        Ok(())
    }
}

#[async_trait]
impl DiscoveryGateway for MemoryClient {
    async fn nearby(&self, query: NearbyQuery) -> GatewayResult<Vec<NearbyRow>> {
        self.backend.ensure_reachable()?;
        let caller = self.current().map(|user| user.id);
        Ok(self.backend.nearby_rows(caller, &query))
    }
}

#[async_trait]
impl MessageGateway for MemoryClient {
    async fn send_message(&self, message: NewMessage) -> GatewayResult<ChatMessage> {
        self.authorize(message.sender_id)?;
        let stored = ChatMessage {
            id: Uuid::new_v4(),
            sender_id: message.sender_id,
            receiver_id: message.receiver_id,
            content: message.content,
            created_at: Utc::now(),
        };
        self.backend.tables().messages.push(stored.clone());
        self.backend
            .publish(FeedTable::Messages, ChangeOp::Insert, &stored);
        Ok(stored)
    }

    async fn get_messages(&self, a: UserId, b: UserId) -> GatewayResult<Vec<ChatMessage>> {
        self.backend.ensure_reachable()?;
        let mut messages: Vec<ChatMessage> = self
            .backend
            .tables()
            .messages
            .iter()
            .filter(|message| message.is_between(a, b))
            .cloned()
            .collect();
        messages.sort_by_key(|message| message.created_at);
        Ok(messages)
    }
}

#[async_trait]
impl ChangeFeed for MemoryClient {
    async fn subscribe(
        &self,
        spec: FeedSpec,
        on_change: ChangeHandler,
    ) -> GatewayResult<Box<dyn FeedSubscription>> {
        self.backend.ensure_reachable()?;
        Ok(Box::new(self.backend.subscribe_handler(spec, on_change)))
    }
}
