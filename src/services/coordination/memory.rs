use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};

use super::client::{
    AuthInfo, ChildData, ChildEvent, ChildEventKind, ClientSettings, ConnectionState,
    Connector, CoordinationClient, CoordinationError, CreateMode,
};

#[derive(Debug)]
struct Node {
    data: Vec<u8>,
    mode: CreateMode,
    owner: u64,
}

#[derive(Debug, Default)]
struct EnsembleState {
    nodes: BTreeMap<String, Node>,
    // 父路径 -> 子节点事件订阅
    watchers: HashMap<String, Vec<mpsc::UnboundedSender<ChildEvent>>>,
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

fn name_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or_default()
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

impl EnsembleState {
    fn exists(&self, path: &str) -> bool {
        path == "/" || self.nodes.contains_key(path)
    }

    fn has_children(&self, path: &str) -> bool {
        self.nodes.keys().any(|p| p != path && parent_of(p) == path)
    }

    fn emit(&mut self, kind: ChildEventKind, path: &str, data: Vec<u8>) {
        let parent = parent_of(path);
        if let Some(senders) = self.watchers.get_mut(parent) {
            let event = ChildEvent {
                kind,
                data: ChildData {
                    path: path.to_string(),
                    name: name_of(path).to_string(),
                    data,
                },
            };
            senders.retain(|tx| tx.send(event.clone()).is_ok());
            if senders.is_empty() {
                self.watchers.remove(parent);
            }
        }
    }

    fn insert(&mut self, path: &str, data: Vec<u8>, mode: CreateMode, owner: u64) {
        self.nodes.insert(
            path.to_string(),
            Node {
                data: data.clone(),
                mode,
                owner,
            },
        );
        self.emit(ChildEventKind::Added, path, data);
    }

    fn remove(&mut self, path: &str) {
        if let Some(node) = self.nodes.remove(path) {
            self.emit(ChildEventKind::Removed, path, node.data);
        }
    }
}

/// 进程内的协调服务集群，多个客户端连同一个地址时共享数据
#[derive(Debug, Default)]
pub struct MemoryEnsemble {
    state: Mutex<EnsembleState>,
    required_auth: Mutex<Option<AuthInfo>>,
    next_session: AtomicU64,
}

impl MemoryEnsemble {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, EnsembleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn new_session(&self) -> u64 {
        self.next_session.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// 之后建立的会话必须携带该鉴权信息
    pub fn require_auth(&self, auth: AuthInfo) {
        *self.required_auth.lock().unwrap_or_else(PoisonError::into_inner) = Some(auth);
    }

    fn authenticate(&self, offered: &[AuthInfo]) -> Result<(), CoordinationError> {
        match &*self.required_auth.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(required) if !offered.contains(required) => {
                Err(CoordinationError::Auth(required.scheme.clone()))
            }
            _ => Ok(()),
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.lock().exists(&normalize(path))
    }

    pub fn data(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().nodes.get(&normalize(path)).map(|n| n.data.clone())
    }

    /// 直接子节点名字，按字典序
    pub fn child_names(&self, path: &str) -> Vec<String> {
        let path = normalize(path);
        self.lock()
            .nodes
            .keys()
            .filter(|p| **p != path && parent_of(p) == path)
            .map(|p| name_of(p).to_string())
            .collect()
    }

    pub fn is_ephemeral(&self, path: &str) -> bool {
        self.lock()
            .nodes
            .get(&normalize(path))
            .is_some_and(|n| n.mode == CreateMode::Ephemeral)
    }

    fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
        session: u64,
    ) -> Result<(), CoordinationError> {
        let path = normalize(path);
        let mut state = self.lock();
        if state.exists(&path) {
            return Err(CoordinationError::NodeExists(path));
        }

        // 补齐父节点
        let mut missing = Vec::new();
        let mut parent = parent_of(&path);
        while !state.exists(parent) {
            missing.push(parent.to_string());
            parent = parent_of(parent);
        }
        for ancestor in missing.iter().rev() {
            state.insert(ancestor, Vec::new(), CreateMode::Persistent, 0);
        }
        state.insert(&path, data, mode, session);
        Ok(())
    }

    fn delete(&self, path: &str) -> Result<(), CoordinationError> {
        let path = normalize(path);
        let mut state = self.lock();
        if !state.nodes.contains_key(&path) {
            return Err(CoordinationError::NoNode(path));
        }
        if state.has_children(&path) {
            return Err(CoordinationError::NotEmpty(path));
        }
        state.remove(&path);
        Ok(())
    }

    fn set_data(&self, path: &str, data: Vec<u8>) -> Result<(), CoordinationError> {
        let path = normalize(path);
        let mut state = self.lock();
        match state.nodes.get_mut(&path) {
            Some(node) => node.data = data.clone(),
            None => return Err(CoordinationError::NoNode(path)),
        }
        state.emit(ChildEventKind::Updated, &path, data);
        Ok(())
    }

    fn children(&self, path: &str) -> Result<Vec<ChildData>, CoordinationError> {
        let path = normalize(path);
        let state = self.lock();
        if !state.exists(&path) {
            return Err(CoordinationError::NoNode(path));
        }
        Ok(state
            .nodes
            .iter()
            .filter(|(p, _)| **p != path && parent_of(p) == path)
            .map(|(p, node)| ChildData {
                path: p.clone(),
                name: name_of(p).to_string(),
                data: node.data.clone(),
            })
            .collect())
    }

    fn watch(&self, path: &str) -> mpsc::UnboundedReceiver<ChildEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().watchers.entry(normalize(path)).or_default().push(tx);
        rx
    }

    /// 会话结束，删除它创建的临时节点
    fn expire(&self, session: u64) -> usize {
        let mut state = self.lock();
        let owned: Vec<String> = state
            .nodes
            .iter()
            .filter(|(_, n)| n.mode == CreateMode::Ephemeral && n.owner == session)
            .map(|(p, _)| p.clone())
            .collect();
        for path in &owned {
            state.remove(path);
        }
        owned.len()
    }
}

/// 连接到 [`MemoryEnsemble`] 的客户端，可以模拟断线、重连和会话过期
#[derive(Debug)]
pub struct MemoryClient {
    ensemble: Arc<MemoryEnsemble>,
    settings: ClientSettings,
    session: AtomicU64,
    started: AtomicBool,
    closed: AtomicBool,
    connected: AtomicBool,
    states: broadcast::Sender<ConnectionState>,
    create_calls: AtomicUsize,
    delete_calls: AtomicUsize,
}

impl MemoryClient {
    pub fn new(ensemble: Arc<MemoryEnsemble>, settings: ClientSettings) -> Self {
        let (states, _) = broadcast::channel(64);
        let session = ensemble.new_session();
        Self {
            ensemble,
            settings,
            session: AtomicU64::new(session),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            connected: AtomicBool::new(true),
            states,
            create_calls: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
        }
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn ensemble(&self) -> &Arc<MemoryEnsemble> {
        &self.ensemble
    }

    pub fn session_id(&self) -> u64 {
        self.session.load(Ordering::SeqCst)
    }

    /// create 调用次数（含失败）
    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub fn reset_counters(&self) {
        self.create_calls.store(0, Ordering::SeqCst);
        self.delete_calls.store(0, Ordering::SeqCst);
    }

    fn emit_state(&self, state: ConnectionState) {
        tracing::debug!(session = self.session_id(), state = ?state, "Coordination connection state changed");
        let _ = self.states.send(state);
    }

    /// 连接中断，会话仍然保留
    pub fn simulate_disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.emit_state(ConnectionState::Suspended);
    }

    /// 在原会话上恢复连接
    pub fn simulate_reconnect(&self) {
        self.connected.store(true, Ordering::SeqCst);
        self.emit_state(ConnectionState::Reconnected);
    }

    /// 会话过期：临时节点被删除，随后以新会话重连
    pub fn simulate_session_expiry(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let removed = self.ensemble.expire(self.session_id());
        self.emit_state(ConnectionState::Lost);
        tracing::debug!(removed = removed, "Session expired");

        self.session.store(self.ensemble.new_session(), Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        self.emit_state(ConnectionState::Reconnected);
    }

    fn check(&self) -> Result<(), CoordinationError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoordinationError::Closed);
        }
        if !self.started.load(Ordering::SeqCst) {
            return Err(CoordinationError::NotStarted);
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(CoordinationError::ConnectionLoss);
        }
        Ok(())
    }
}

#[async_trait]
impl CoordinationClient for MemoryClient {
    async fn start(&self) -> Result<(), CoordinationError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoordinationError::Closed);
        }
        self.ensemble.authenticate(&self.settings.auth)?;
        if !self.started.swap(true, Ordering::SeqCst) {
            self.emit_state(ConnectionState::Connected);
        }
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.started.store(false, Ordering::SeqCst);
        self.ensemble.expire(self.session_id());
    }

    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> Result<(), CoordinationError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.ensemble.create(path, data, mode, self.session_id())
    }

    async fn delete(&self, path: &str) -> Result<(), CoordinationError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.ensemble.delete(path)
    }

    async fn set_data(&self, path: &str, data: Vec<u8>) -> Result<(), CoordinationError> {
        self.check()?;
        self.ensemble.set_data(path, data)
    }

    async fn children(&self, path: &str) -> Result<Vec<ChildData>, CoordinationError> {
        self.check()?;
        self.ensemble.children(path)
    }

    async fn watch_children(
        &self,
        path: &str,
    ) -> Result<mpsc::UnboundedReceiver<ChildEvent>, CoordinationError> {
        self.check()?;
        Ok(self.ensemble.watch(path))
    }

    fn connection_states(&self) -> broadcast::Receiver<ConnectionState> {
        self.states.subscribe()
    }
}

/// 进程内连接器，同一个 connect string 共享一个集群
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    ensembles: Arc<DashMap<String, Arc<MemoryEnsemble>>>,
    clients: Arc<Mutex<Vec<Arc<MemoryClient>>>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ensemble(&self, connect_string: &str) -> Arc<MemoryEnsemble> {
        self.ensembles
            .entry(connect_string.to_string())
            .or_default()
            .clone()
    }

    /// 最近一次创建的客户端
    pub fn last_client(&self) -> Option<Arc<MemoryClient>> {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }

    pub fn clients(&self) -> Vec<Arc<MemoryClient>> {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Connector for MemoryConnector {
    fn connect(
        &self,
        settings: &ClientSettings,
    ) -> Result<Arc<dyn CoordinationClient>, CoordinationError> {
        let ensemble = self.ensemble(&settings.connect_string);
        let client = Arc::new(MemoryClient::new(ensemble, settings.clone()));
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(client.clone());
        Ok(client as Arc<dyn CoordinationClient>)
    }
}
