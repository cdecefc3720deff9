//! 单元测试用的内存替身

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use domain::{
    AuthGateway, AuthUser, Availability, ChangeFeed, ChangeHandler, ChangeOp, Coordinates,
    CurrentUser, FeedNotification, FeedSpec, FeedSubscription, FeedTable, GatewayError,
    GatewayResult, ImageHost, ImageHostError, LocationRecord, MockImageHost, NearbyEntity,
    NearbyRow, PositionError, PositionSource, PositionStream, Profile, ProfileGateway,
    ProfileUpdate, PresenceGateway, Timestamp, UserId,
};
use tokio::sync::{mpsc, Semaphore};
use uuid::Uuid;

use crate::clock::SystemClock;
use crate::markers::{MarkerId, MarkerSurface, MarkerView};
use crate::state_store::{StateStore, StateStoreDependencies};

pub const PASSWORD: &str = "correct horse battery staple";

/// 认证、资料、在线状态的内存替身
#[derive(Default)]
pub struct FakeBackend {
    accounts: Mutex<HashMap<String, AuthUser>>,
    session: Mutex<Option<AuthUser>>,
    profiles: Mutex<HashMap<UserId, Profile>>,
    availability: Mutex<HashMap<UserId, Availability>>,
    locations: Mutex<HashMap<UserId, LocationRecord>>,
    heartbeats: AtomicUsize,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, email: &str) -> AuthUser {
        let user = AuthUser {
            id: UserId::from(Uuid::new_v4()),
            email: email.to_string(),
        };
        self.accounts
            .lock()
            .unwrap()
            .insert(email.to_string(), user.clone());
        self.profiles.lock().unwrap().insert(
            user.id,
            Profile {
                id: user.id,
                ..Profile::default()
            },
        );
        self.availability
            .lock()
            .unwrap()
            .insert(user.id, Availability::default());
        user
    }

    pub fn restore_session(&self, user: &AuthUser) {
        *self.session.lock().unwrap() = Some(user.clone());
    }

    pub fn set_profile(&self, profile: Profile) {
        self.profiles.lock().unwrap().insert(profile.id, profile);
    }

    pub fn set_live(&self, id: UserId, is_available: bool) {
        self.availability.lock().unwrap().insert(
            id,
            Availability {
                is_available,
                last_active_at: None,
            },
        );
    }

    pub fn set_location(&self, id: UserId, position: Coordinates) {
        self.locations
            .lock()
            .unwrap()
            .insert(id, LocationRecord::new(position, chrono::Utc::now()));
    }

    pub fn is_live(&self, id: UserId) -> bool {
        self.availability
            .lock()
            .unwrap()
            .get(&id)
            .map(|a| a.is_available)
            .unwrap_or(false)
    }

    pub fn stored_location(&self, id: UserId) -> Option<Coordinates> {
        self.locations
            .lock()
            .unwrap()
            .get(&id)
            .map(LocationRecord::coordinates)
    }

    pub fn heartbeat_count(&self) -> usize {
        self.heartbeats.load(Ordering::SeqCst)
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    fn check_write(&self) -> GatewayResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(GatewayError::transport("write refused"));
        }
        Ok(())
    }

    fn check_read(&self) -> GatewayResult<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(GatewayError::transport("read refused"));
        }
        Ok(())
    }

    pub fn dependencies(self: &Arc<Self>, image_host: Arc<dyn ImageHost>) -> StateStoreDependencies {
        StateStoreDependencies {
            auth: self.clone(),
            profiles: self.clone(),
            presence: self.clone(),
            image_host,
            clock: Arc::new(SystemClock),
        }
    }
}

#[async_trait]
impl AuthGateway for FakeBackend {
    async fn sign_up(&self, _email: &str, _password: &str, _full_name: &str) -> GatewayResult<()> {
        Ok(())
    }

    async fn login(&self, email: &str, password: &str) -> GatewayResult<AuthUser> {
        let user = self
            .accounts
            .lock()
            .unwrap()
            .get(email)
            .cloned()
            .filter(|_| password == PASSWORD)
            .ok_or(GatewayError::InvalidCredentials)?;
        *self.session.lock().unwrap() = Some(user.clone());
        Ok(user)
    }

    async fn logout(&self) -> GatewayResult<()> {
        *self.session.lock().unwrap() = None;
        Ok(())
    }

    async fn get_session(&self) -> GatewayResult<Option<AuthUser>> {
        Ok(self.session.lock().unwrap().clone())
    }
}

#[async_trait]
impl ProfileGateway for FakeBackend {
    async fn get_profile(&self, id: UserId) -> GatewayResult<Option<Profile>> {
        self.check_read()?;
        Ok(self.profiles.lock().unwrap().get(&id).cloned())
    }

    async fn update_profile(
        &self,
        id: UserId,
        fields: ProfileUpdate,
        updated_at: Timestamp,
    ) -> GatewayResult<()> {
        self.check_write()?;
        let mut profiles = self.profiles.lock().unwrap();
        let profile = profiles
            .get_mut(&id)
            .ok_or_else(|| GatewayError::not_found("profile"))?;
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

#[async_trait]
impl PresenceGateway for FakeBackend {
    async fn get_availability(&self, id: UserId) -> GatewayResult<Option<Availability>> {
        self.check_read()?;
        Ok(self.availability.lock().unwrap().get(&id).copied())
    }

    async fn set_availability(
        &self,
        id: UserId,
        is_available: bool,
        at: Timestamp,
    ) -> GatewayResult<()> {
        self.check_write()?;
        self.availability.lock().unwrap().insert(
            id,
            Availability {
                is_available,
                last_active_at: Some(at),
            },
        );
        Ok(())
    }

    async fn heartbeat(&self, id: UserId, at: Timestamp) -> GatewayResult<()> {
        self.check_write()?;
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
        if let Some(availability) = self.availability.lock().unwrap().get_mut(&id) {
            availability.last_active_at = Some(at);
        }
        Ok(())
    }

    async fn get_location(&self, id: UserId) -> GatewayResult<Option<LocationRecord>> {
        self.check_read()?;
        Ok(self.locations.lock().unwrap().get(&id).copied())
    }

    async fn set_location(
        &self,
        id: UserId,
        position: Coordinates,
        at: Timestamp,
    ) -> GatewayResult<()> {
        self.check_write()?;
        self.locations
            .lock()
            .unwrap()
            .insert(id, LocationRecord::new(position, at));
        Ok(())
    }
}

pub fn image_host_returning(result: Result<String, ImageHostError>) -> Arc<dyn ImageHost> {
    let mut host = MockImageHost::new();
    host.expect_upload_image()
        .returning(move |_| result.clone());
    Arc::new(host)
}

fn unused_image_host() -> Arc<dyn ImageHost> {
    let mut host = MockImageHost::new();
    host.expect_upload_image().never();
    Arc::new(host)
}

pub fn store_for(backend: &Arc<FakeBackend>) -> StateStore {
    StateStore::new(backend.dependencies(unused_image_host()))
}

/// 已登录且在线的状态中心
pub async fn live_store(backend: &Arc<FakeBackend>) -> Arc<StateStore> {
    backend.register("live@example.com");
    let store = Arc::new(store_for(backend));
    store.login("live@example.com", PASSWORD).await.unwrap();
    assert!(store.set_availability(true).await);
    store
}

struct FeedEntry {
    spec: FeedSpec,
    handler: ChangeHandler,
    closed: Arc<AtomicBool>,
}

struct FakeSubscription {
    table: FeedTable,
    closed: Arc<AtomicBool>,
}

impl FeedSubscription for FakeSubscription {
    fn table(&self) -> FeedTable {
        self.table
    }

    fn close(self: Box<Self>) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// 可手动推送通知的变更订阅替身
#[derive(Default)]
pub struct FakeChangeFeed {
    entries: Mutex<Vec<FeedEntry>>,
    gate: Option<Semaphore>,
    waiting: AtomicUsize,
    failing_table: Option<FeedTable>,
}

impl FakeChangeFeed {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// subscribe 会阻塞直到 open_gate
    pub fn gated() -> Arc<Self> {
        Arc::new(Self {
            gate: Some(Semaphore::new(0)),
            ..Self::default()
        })
    }

    pub fn failing_on(table: FeedTable) -> Arc<Self> {
        Arc::new(Self {
            failing_table: Some(table),
            ..Self::default()
        })
    }

    pub fn open_gate(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(16);
        }
    }

    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn subscribe_calls(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn last_spec(&self) -> Option<FeedSpec> {
        self.entries
            .lock()
            .unwrap()
            .last()
            .map(|entry| entry.spec.clone())
    }

    pub fn open_tables(&self) -> Vec<FeedTable> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|entry| !entry.closed.load(Ordering::SeqCst))
            .map(|entry| entry.spec.table)
            .collect()
    }

    pub fn push(&self, table: FeedTable, op: ChangeOp) {
        self.deliver(FeedNotification {
            table,
            op,
            record: None,
        });
    }

    pub fn push_record(&self, table: FeedTable, op: ChangeOp, record: serde_json::Value) {
        self.deliver(FeedNotification {
            table,
            op,
            record: Some(record),
        });
    }

    fn deliver(&self, notification: FeedNotification) {
        let handlers: Vec<ChangeHandler> = self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|entry| !entry.closed.load(Ordering::SeqCst))
            .filter(|entry| entry.spec.table == notification.table)
            .filter(|entry| match (&entry.spec.filter, &notification.record) {
                (Some(filter), Some(record)) => filter.matches(record),
                _ => true,
            })
            .map(|entry| Arc::clone(&entry.handler))
            .collect();
        for handler in handlers {
            handler(notification.clone());
        }
    }
}

#[async_trait]
impl ChangeFeed for FakeChangeFeed {
    async fn subscribe(
        &self,
        spec: FeedSpec,
        on_change: ChangeHandler,
    ) -> GatewayResult<Box<dyn FeedSubscription>> {
        if let Some(gate) = &self.gate {
            self.waiting.fetch_add(1, Ordering::SeqCst);
            gate.acquire().await.unwrap().forget();
            self.waiting.fetch_sub(1, Ordering::SeqCst);
        }
        if self.failing_table == Some(spec.table) {
            return Err(GatewayError::transport("channel join refused"));
        }

        let closed = Arc::new(AtomicBool::new(false));
        let table = spec.table;
        self.entries.lock().unwrap().push(FeedEntry {
            spec,
            handler: on_change,
            closed: Arc::clone(&closed),
        });
        Ok(Box::new(FakeSubscription { table, closed }))
    }
}

/// 脚本化的定位源
pub struct ScriptedPositions {
    supported: bool,
    current: Mutex<Result<Coordinates, PositionError>>,
    stream: Mutex<Option<PositionStream>>,
    watch_calls: AtomicUsize,
}

impl ScriptedPositions {
    pub fn new() -> (Arc<Self>, mpsc::Sender<Result<Coordinates, PositionError>>) {
        let (sender, receiver) = mpsc::channel(16);
        let source = Arc::new(Self {
            supported: true,
            current: Mutex::new(Err(PositionError::Unavailable)),
            stream: Mutex::new(Some(receiver)),
            watch_calls: AtomicUsize::new(0),
        });
        (source, sender)
    }

    pub fn unsupported() -> Arc<Self> {
        Arc::new(Self {
            supported: false,
            current: Mutex::new(Err(PositionError::Unavailable)),
            stream: Mutex::new(None),
            watch_calls: AtomicUsize::new(0),
        })
    }

    pub fn set_current(&self, current: Result<Coordinates, PositionError>) {
        *self.current.lock().unwrap() = current;
    }

    pub fn watch_calls(&self) -> usize {
        self.watch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PositionSource for ScriptedPositions {
    fn is_supported(&self) -> bool {
        self.supported
    }

    async fn current_position(&self) -> Result<Coordinates, PositionError> {
        self.current.lock().unwrap().clone()
    }

    fn watch(&self) -> Result<PositionStream, PositionError> {
        self.watch_calls.fetch_add(1, Ordering::SeqCst);
        self.stream
            .lock()
            .unwrap()
            .take()
            .ok_or(PositionError::Unavailable)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SurfaceOp {
    Create(MarkerId),
    Update(MarkerId),
    Destroy(MarkerId),
}

/// 记录每次操作的标记显示层
#[derive(Default)]
pub struct RecordingSurface {
    pub ops: Vec<SurfaceOp>,
    next_handle: u64,
    markers: HashMap<u64, (MarkerId, MarkerView)>,
}

impl RecordingSurface {
    pub fn live_handles(&self) -> usize {
        self.markers.len()
    }

    pub fn position_of(&self, id: &MarkerId) -> Option<Coordinates> {
        self.markers
            .values()
            .find(|(marker_id, _)| marker_id == id)
            .map(|(_, view)| view.position)
    }
}

impl MarkerSurface for RecordingSurface {
    type Handle = u64;

    fn create(&mut self, id: MarkerId, view: &MarkerView) -> u64 {
        self.next_handle += 1;
        self.markers.insert(self.next_handle, (id, view.clone()));
        self.ops.push(SurfaceOp::Create(id));
        self.next_handle
    }

    fn update(&mut self, handle: &mut u64, view: &MarkerView) {
        if let Some((id, current)) = self.markers.get_mut(handle) {
            *current = view.clone();
            self.ops.push(SurfaceOp::Update(*id));
        }
    }

    fn destroy(&mut self, handle: u64) {
        if let Some((id, _)) = self.markers.remove(&handle) {
            self.ops.push(SurfaceOp::Destroy(id));
        }
    }
}

pub fn current_user(latitude: f64, longitude: f64) -> CurrentUser {
    let auth = AuthUser {
        id: UserId::from(Uuid::new_v4()),
        email: "me@example.com".into(),
    };
    CurrentUser::compose(&auth, None, Some(Coordinates { latitude, longitude }))
}

pub fn nearby_row(distance_km: f64) -> NearbyRow {
    NearbyRow {
        id: UserId::from(Uuid::new_v4()),
        full_name: Some("Nearby Person".into()),
        role: None,
        avatar_url: None,
        latitude: 1.0,
        longitude: 1.0,
        distance_km,
        bio: None,
        interests: None,
        phone: None,
    }
}

pub fn nearby_entity(id: UserId, latitude: f64, longitude: f64) -> NearbyEntity {
    NearbyEntity::from(NearbyRow {
        id,
        latitude,
        longitude,
        ..nearby_row(0.5)
    })
}
