//! In-memory stand-ins for the stores and remote collaborators.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use onevpn_db::models::provisioning::{BackendKind, Binding, NewBinding, ProvisioningPool};
use onevpn_db::models::user::User;
use onevpn_db::store::{AccountStore, BindingStore, SettingsStore};
use serde_json::{Value, json};

use crate::clock::Clock;
use crate::services::notification_service::{Notice, Notifier};
use crate::services::provisioning::{
    PanelApi, ProvisionTarget, ProvisionedAccount, ProvisioningBackend, ProvisioningError,
    RemoteAccount,
};

pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

pub fn user(id: i64, balance: i64) -> User {
    User {
        id,
        telegram_id: format!("{}", 1000 + id),
        username: Some(format!("user{}", id)),
        balance,
        subscription_end: None,
        allowed_devices: 1,
        link_slug: format!("slug{}", id),
        banned: false,
        link_suspended: false,
        created_at: epoch(),
        updated_at: epoch(),
    }
}

pub fn pool(id: i64, backend: BackendKind, capacity: i32) -> ProvisioningPool {
    ProvisioningPool {
        id,
        backend: backend.as_str().to_string(),
        name: format!("pool-{}", id),
        api_url: format!("https://pool{}.example.com", id),
        api_token: "token".to_string(),
        squad_uuid: Some(format!("squad-{}", id)),
        capacity,
        position: id as i32,
        created_at: epoch(),
    }
}

/// Provisioning client with a one second timeout.
pub fn http_client() -> reqwest::Client {
    let _ = rustls::crypto::ring::default_provider().install_default();
    crate::services::provisioning::http_client(std::time::Duration::from_secs(1)).unwrap()
}

/// Accepts connections and never answers them.
pub async fn silent_listener() -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    (addr, handle)
}

pub struct FixedClock(Mutex<DateTime<Utc>>);

impl Default for FixedClock {
    fn default() -> Self {
        Self(Mutex::new(epoch()))
    }
}

impl FixedClock {
    pub fn advance(&self, by: Duration) {
        *self.0.lock().unwrap() += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }
}

#[derive(Default)]
pub struct MemorySettings(Mutex<HashMap<String, String>>);

#[async_trait]
impl SettingsStore for MemorySettings {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.0.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.0.lock().unwrap().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryAccounts {
    users: Mutex<BTreeMap<i64, User>>,
    devices: Mutex<HashMap<i64, i64>>,
    broken: Mutex<HashSet<i64>>,
}

impl MemoryAccounts {
    pub fn insert(&self, user: User) {
        self.users.lock().unwrap().insert(user.id, user);
    }

    pub fn set_devices(&self, user_id: i64, count: i64) {
        self.devices.lock().unwrap().insert(user_id, count);
    }

    /// Loading this user fails from now on.
    pub fn break_user(&self, user_id: i64) {
        self.broken.lock().unwrap().insert(user_id);
    }

    pub fn user(&self, id: i64) -> User {
        self.users.lock().unwrap()[&id].clone()
    }

    pub fn update(&self, id: i64, f: impl FnOnce(&mut User)) {
        if let Some(user) = self.users.lock().unwrap().get_mut(&id) {
            f(user);
        }
    }
}

#[async_trait]
impl AccountStore for MemoryAccounts {
    async fn user_ids(&self) -> Result<Vec<i64>> {
        Ok(self.users.lock().unwrap().keys().copied().collect())
    }

    async fn get_user(&self, id: i64) -> Result<Option<User>> {
        if self.broken.lock().unwrap().contains(&id) {
            return Err(anyhow!("row {} is unreadable", id));
        }
        Ok(self.users.lock().unwrap().get(&id).cloned())
    }

    async fn count_devices(&self, user_id: i64) -> Result<i64> {
        Ok(self.devices.lock().unwrap().get(&user_id).copied().unwrap_or(0))
    }

    async fn save_billing_state(&self, user: &User, debit: i64) -> Result<i64> {
        let mut users = self.users.lock().unwrap();
        let stored = users
            .get_mut(&user.id)
            .ok_or_else(|| anyhow!("user {} not found", user.id))?;
        stored.balance = (stored.balance - debit).max(0);
        stored.subscription_end = user.subscription_end;
        stored.allowed_devices = user.allowed_devices;
        stored.link_suspended = user.link_suspended;
        Ok(stored.balance)
    }
}

#[derive(Default)]
pub struct MemoryBindings {
    pools: Mutex<Vec<ProvisioningPool>>,
    bindings: Mutex<HashMap<(i64, BackendKind), Binding>>,
    active: Mutex<HashMap<i64, i64>>,
}

impl MemoryBindings {
    pub fn with_pools(pools: Vec<ProvisioningPool>) -> Self {
        Self {
            pools: Mutex::new(pools),
            ..Default::default()
        }
    }

    /// Active subscribers the pool reports, other users excluded or not.
    pub fn set_active(&self, pool_id: i64, count: i64) {
        self.active.lock().unwrap().insert(pool_id, count);
    }

    pub fn insert_binding(&self, user_id: i64, pool_id: i64, backend: BackendKind, remote_id: &str, link: &str) {
        self.bindings.lock().unwrap().insert(
            (user_id, backend),
            Binding {
                id: user_id,
                user_id,
                pool_id,
                backend: backend.as_str().to_string(),
                remote_id: remote_id.to_string(),
                link: link.to_string(),
                expires_at: None,
                created_at: epoch(),
                updated_at: epoch(),
            },
        );
    }

    pub fn binding(&self, user_id: i64, backend: BackendKind) -> Option<Binding> {
        self.bindings.lock().unwrap().get(&(user_id, backend)).cloned()
    }
}

#[async_trait]
impl BindingStore for MemoryBindings {
    async fn find_binding(&self, user_id: i64, backend: BackendKind) -> Result<Option<Binding>> {
        Ok(self.binding(user_id, backend))
    }

    async fn save_binding(&self, new: &NewBinding) -> Result<()> {
        let mut bindings = self.bindings.lock().unwrap();
        let next_id = bindings.len() as i64 + 1;
        let entry = bindings.entry((new.user_id, new.backend)).or_insert_with(|| Binding {
            id: next_id,
            user_id: new.user_id,
            pool_id: new.pool_id,
            backend: new.backend.as_str().to_string(),
            remote_id: String::new(),
            link: String::new(),
            expires_at: None,
            created_at: epoch(),
            updated_at: epoch(),
        });
        entry.pool_id = new.pool_id;
        entry.remote_id = new.remote_id.clone();
        entry.link = new.link.clone();
        entry.expires_at = new.expires_at;
        Ok(())
    }

    async fn pools(&self, backend: BackendKind) -> Result<Vec<ProvisioningPool>> {
        let mut pools: Vec<_> = self
            .pools
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.backend == backend.as_str())
            .cloned()
            .collect();
        pools.sort_by_key(|p| (p.position, p.id));
        Ok(pools)
    }

    async fn get_pool(&self, id: i64) -> Result<Option<ProvisioningPool>> {
        Ok(self.pools.lock().unwrap().iter().find(|p| p.id == id).cloned())
    }

    async fn active_in_pool(&self, pool_id: i64, _now: DateTime<Utc>, _exclude_user: i64) -> Result<i64> {
        Ok(self.active.lock().unwrap().get(&pool_id).copied().unwrap_or(0))
    }
}

/// Remote panel that answers like Marzban and counts calls.
pub struct ScriptedPanel {
    kind: BackendKind,
    creates: AtomicUsize,
    updates: AtomicUsize,
    toggles: AtomicUsize,
    failure: Mutex<Option<ProvisioningError>>,
    update_response: Mutex<Option<Value>>,
    last_remote_id: Mutex<Option<String>>,
}

impl ScriptedPanel {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            creates: AtomicUsize::new(0),
            updates: AtomicUsize::new(0),
            toggles: AtomicUsize::new(0),
            failure: Mutex::new(None),
            update_response: Mutex::new(None),
            last_remote_id: Mutex::new(None),
        }
    }

    pub fn fail_with(&self, err: ProvisioningError) {
        *self.failure.lock().unwrap() = Some(err);
    }

    pub fn respond_update_with(&self, value: Value) {
        *self.update_response.lock().unwrap() = Some(value);
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn updates(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn toggles(&self) -> usize {
        self.toggles.load(Ordering::SeqCst)
    }

    pub fn last_remote_id(&self) -> Option<String> {
        self.last_remote_id.lock().unwrap().clone()
    }

    fn check(&self) -> Result<(), ProvisioningError> {
        match self.failure.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl PanelApi for ScriptedPanel {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn create(&self, _pool: &ProvisioningPool, account: &RemoteAccount) -> Result<Value, ProvisioningError> {
        self.check()?;
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(json!({
            "username": account.username,
            "subscription_url": format!("/sub/{}", account.username),
        }))
    }

    async fn update(
        &self,
        _pool: &ProvisioningPool,
        remote_id: &str,
        _account: &RemoteAccount,
    ) -> Result<Value, ProvisioningError> {
        self.check()?;
        self.updates.fetch_add(1, Ordering::SeqCst);
        *self.last_remote_id.lock().unwrap() = Some(remote_id.to_string());
        let canned = self.update_response.lock().unwrap().clone();
        Ok(canned.unwrap_or_else(|| {
            json!({
                "username": remote_id,
                "subscription_url": format!("/sub/{}", remote_id),
            })
        }))
    }

    async fn set_enabled(&self, _pool: &ProvisioningPool, remote_id: &str, _enabled: bool) -> Result<(), ProvisioningError> {
        self.check()?;
        self.toggles.fetch_add(1, Ordering::SeqCst);
        *self.last_remote_id.lock().unwrap() = Some(remote_id.to_string());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    Upsert { user_id: i64, device_limit: i32, expires_at: DateTime<Utc> },
    UpdateExisting { user_id: i64, expires_at: DateTime<Utc> },
    Enable(i64),
    Disable(i64),
}

/// Backend double for the reconciler: records every call, optionally fails.
#[derive(Default)]
pub struct ScriptedBackend {
    calls: Mutex<Vec<BackendCall>>,
    failure: Mutex<Option<ProvisioningError>>,
    provisioned: Mutex<HashSet<i64>>,
}

impl ScriptedBackend {
    pub fn fail_with(&self, err: ProvisioningError) {
        *self.failure.lock().unwrap() = Some(err);
    }

    pub fn recover(&self) {
        *self.failure.lock().unwrap() = None;
    }

    /// Pretend the user already has a remote account.
    pub fn mark_provisioned(&self, user_id: i64) {
        self.provisioned.lock().unwrap().insert(user_id);
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: BackendCall) -> Result<(), ProvisioningError> {
        self.calls.lock().unwrap().push(call);
        match self.failure.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn account(target: &ProvisionTarget) -> ProvisionedAccount {
        ProvisionedAccount {
            link: format!("https://vpn.example.com/{}#1VPN", target.link_slug),
            remote_id: target.link_slug.clone(),
        }
    }
}

#[async_trait]
impl ProvisioningBackend for ScriptedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Wireguard
    }

    async fn upsert(
        &self,
        target: &ProvisionTarget,
        device_limit: i32,
        expires_at: DateTime<Utc>,
    ) -> Result<ProvisionedAccount, ProvisioningError> {
        self.record(BackendCall::Upsert {
            user_id: target.user_id,
            device_limit,
            expires_at,
        })?;
        self.provisioned.lock().unwrap().insert(target.user_id);
        Ok(Self::account(target))
    }

    async fn update_existing(
        &self,
        target: &ProvisionTarget,
        _device_limit: i32,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<ProvisionedAccount>, ProvisioningError> {
        if !self.provisioned.lock().unwrap().contains(&target.user_id) {
            return Ok(None);
        }
        self.record(BackendCall::UpdateExisting {
            user_id: target.user_id,
            expires_at,
        })?;
        Ok(Some(Self::account(target)))
    }

    async fn enable(&self, target: &ProvisionTarget) -> Result<(), ProvisioningError> {
        self.record(BackendCall::Enable(target.user_id))
    }

    async fn disable(&self, target: &ProvisionTarget) -> Result<(), ProvisioningError> {
        self.record(BackendCall::Disable(target.user_id))
    }
}

#[derive(Default)]
pub struct RecordingNotifier(Mutex<Vec<(String, Notice)>>);

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<(String, Notice)> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Notice) -> bool) -> usize {
        self.0.lock().unwrap().iter().filter(|(_, n)| pred(n)).count()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, telegram_id: &str, notice: Notice) {
        self.0.lock().unwrap().push((telegram_id.to_string(), notice));
    }
}
