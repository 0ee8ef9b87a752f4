use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use zookeeper_client as zk;

use super::client::{
    ChildData, ChildEvent, ChildEventKind, ClientSettings, ConnectionState, Connector,
    CoordinationClient, CoordinationError, CreateMode,
};

/// 连接真实的 ZooKeeper 集群
#[derive(Debug, Clone, Copy, Default)]
pub struct ZookeeperConnector;

impl Connector for ZookeeperConnector {
    fn connect(
        &self,
        settings: &ClientSettings,
    ) -> Result<Arc<dyn CoordinationClient>, CoordinationError> {
        Ok(Arc::new(ZookeeperClient::new(settings.clone())))
    }
}

fn map_error(error: zk::Error, path: &str) -> CoordinationError {
    match error {
        zk::Error::NodeExists => CoordinationError::NodeExists(path.to_string()),
        zk::Error::NoNode => CoordinationError::NoNode(path.to_string()),
        zk::Error::NotEmpty => CoordinationError::NotEmpty(path.to_string()),
        zk::Error::ConnectionLoss => CoordinationError::ConnectionLoss,
        zk::Error::SessionExpired => CoordinationError::SessionExpired,
        e @ (zk::Error::AuthFailed | zk::Error::NoAuth) => CoordinationError::Auth(e.to_string()),
        zk::Error::ClientClosed => CoordinationError::Closed,
        other => CoordinationError::Remote(other.to_string()),
    }
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

fn child_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// 列表之后被删除的子节点直接跳过
async fn read_children(
    client: &zk::Client,
    path: &str,
) -> Result<BTreeMap<String, ChildData>, CoordinationError> {
    let (names, _) = client
        .get_children(path)
        .await
        .map_err(|e| map_error(e, path))?;

    let mut children = BTreeMap::new();
    for name in names {
        let path = child_path(path, &name);
        let read = client.get_data(&path).await;
        match read {
            Ok((data, _)) => {
                children.insert(name.clone(), ChildData { path, name, data });
            }
            Err(zk::Error::NoNode) => {}
            Err(e) => return Err(map_error(e, &path)),
        }
    }
    Ok(children)
}

// 当前会话，过期后整体替换
struct Session {
    settings: ClientSettings,
    current: RwLock<Option<zk::Client>>,
    // 每建立一个新会话加一
    generation: watch::Sender<u64>,
    states: broadcast::Sender<ConnectionState>,
}

impl Session {
    fn client(&self) -> Result<zk::Client, CoordinationError> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(CoordinationError::NotStarted)
    }

    async fn open(&self) -> Result<zk::Client, CoordinationError> {
        let mut connector = zk::Client::connector();
        connector
            .session_timeout(self.settings.session_timeout)
            .connection_timeout(self.settings.connect_timeout);
        for auth in &self.settings.auth {
            connector.auth(auth.scheme.clone(), auth.auth.clone());
        }
        connector
            .connect(&self.settings.connect_string)
            .await
            .map_err(|e| map_error(e, &self.settings.connect_string))
    }

    fn install(&self, client: zk::Client) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(client);
        self.generation.send_modify(|generation| *generation += 1);
    }

    fn take(&self) -> Option<zk::Client> {
        self.current.write().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// 带鉴权信息时节点只允许创建者访问
    fn acls(&self) -> zk::Acls<'static> {
        if self.settings.auth.is_empty() {
            zk::Acls::anyone_all()
        } else {
            zk::Acls::creator_all()
        }
    }

    fn emit(&self, state: ConnectionState) {
        tracing::debug!(state = ?state, "ZooKeeper connection state changed");
        let _ = self.states.send(state);
    }
}

/// 基于 `zookeeper-client` 的客户端
///
/// 断线由底层客户端自动重连，恢复后发出 `Reconnected`；会话过期时以同样的参数建立新会话，
/// 子节点订阅在新会话上重新挂载并补发期间的差异。
pub struct ZookeeperClient {
    session: Arc<Session>,
    start_lock: tokio::sync::Mutex<()>,
    started: AtomicBool,
    closed: AtomicBool,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl fmt::Debug for ZookeeperClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZookeeperClient")
            .field("connect_string", &self.session.settings.connect_string)
            .field("started", &self.started.load(Ordering::SeqCst))
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl ZookeeperClient {
    pub fn new(settings: ClientSettings) -> Self {
        let (states, _) = broadcast::channel(16);
        let (generation, _) = watch::channel(0);
        Self {
            session: Arc::new(Session {
                settings,
                current: RwLock::new(None),
                generation,
                states,
            }),
            start_lock: tokio::sync::Mutex::new(()),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    fn check(&self) -> Result<zk::Client, CoordinationError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoordinationError::Closed);
        }
        self.session.client()
    }

    async fn ensure_parents(&self, client: &zk::Client, path: &str) -> Result<(), CoordinationError> {
        let options = zk::CreateMode::Persistent.with_acls(self.session.acls());
        let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
        let mut parent = String::new();
        for segment in &segments[..segments.len().saturating_sub(1)] {
            parent.push('/');
            parent.push_str(segment);
            match client.create(&parent, &[], &options).await {
                Ok(_) | Err(zk::Error::NodeExists) => {}
                Err(e) => return Err(map_error(e, &parent)),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CoordinationClient for ZookeeperClient {
    async fn start(&self) -> Result<(), CoordinationError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoordinationError::Closed);
        }
        let _guard = self.start_lock.lock().await;
        if self.started.load(Ordering::SeqCst) {
            return Ok(());
        }

        let client = self.session.open().await?;
        let states = client.state_watcher();
        self.session.install(client);
        self.started.store(true, Ordering::SeqCst);
        self.session.emit(ConnectionState::Connected);
        self.tracker
            .spawn(watch_session(self.session.clone(), states, self.cancel.clone()));

        tracing::info!(
            connect_string = %self.session.settings.connect_string,
            "Connected to ZooKeeper"
        );
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
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        // 丢弃最后一个句柄即结束会话
        drop(self.session.take());
        tracing::info!(
            connect_string = %self.session.settings.connect_string,
            "ZooKeeper client closed"
        );
    }

    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> Result<(), CoordinationError> {
        let client = self.check()?;
        let mode = match mode {
            CreateMode::Persistent => zk::CreateMode::Persistent,
            CreateMode::Ephemeral => zk::CreateMode::Ephemeral,
        };
        let options = mode.with_acls(self.session.acls());
        match client.create(path, &data, &options).await {
            Ok(_) => Ok(()),
            Err(zk::Error::NoNode) => {
                self.ensure_parents(&client, path).await?;
                client
                    .create(path, &data, &options)
                    .await
                    .map(|_| ())
                    .map_err(|e| map_error(e, path))
            }
            Err(e) => Err(map_error(e, path)),
        }
    }

    async fn delete(&self, path: &str) -> Result<(), CoordinationError> {
        let client = self.check()?;
        client.delete(path, None).await.map_err(|e| map_error(e, path))
    }

    async fn set_data(&self, path: &str, data: Vec<u8>) -> Result<(), CoordinationError> {
        let client = self.check()?;
        client
            .set_data(path, &data, None)
            .await
            .map(|_| ())
            .map_err(|e| map_error(e, path))
    }

    async fn children(&self, path: &str) -> Result<Vec<ChildData>, CoordinationError> {
        let client = self.check()?;
        Ok(read_children(&client, path).await?.into_values().collect())
    }

    async fn watch_children(
        &self,
        path: &str,
    ) -> Result<mpsc::UnboundedReceiver<ChildEvent>, CoordinationError> {
        let client = self.check()?;
        let generation = self.session.generation.subscribe();

        let watcher = client
            .watch(path, zk::AddWatchMode::PersistentRecursive)
            .await
            .map_err(|e| map_error(e, path))?;
        let known = match read_children(&client, path).await {
            Ok(children) => children,
            Err(CoordinationError::NoNode(_)) => BTreeMap::new(),
            Err(e) => return Err(e),
        };

        let (events, rx) = mpsc::unbounded_channel();
        let child_watch = ChildWatch {
            session: self.session.clone(),
            path: path.to_string(),
            known,
            events,
        };
        self.tracker
            .spawn(child_watch.run(client, watcher, generation, self.cancel.clone()));
        Ok(rx)
    }

    fn connection_states(&self) -> broadcast::Receiver<ConnectionState> {
        self.session.states.subscribe()
    }
}

async fn watch_session(
    session: Arc<Session>,
    mut states: zk::StateWatcher,
    cancel: CancellationToken,
) {
    let mut suspended = false;
    loop {
        let state = tokio::select! {
            _ = cancel.cancelled() => break,
            state = states.changed() => state,
        };
        match state {
            zk::SessionState::Disconnected => {
                suspended = true;
                session.emit(ConnectionState::Suspended);
            }
            zk::SessionState::SyncConnected => {
                if std::mem::take(&mut suspended) {
                    session.emit(ConnectionState::Reconnected);
                }
            }
            zk::SessionState::Expired => {
                tracing::warn!("ZooKeeper session expired, opening a new session");
                session.emit(ConnectionState::Lost);
                match reopen(&session, &cancel).await {
                    Some(next) => {
                        states = next;
                        suspended = false;
                        session.emit(ConnectionState::Reconnected);
                    }
                    None => break,
                }
            }
            zk::SessionState::AuthFailed => {
                tracing::error!("ZooKeeper authentication failed");
                session.emit(ConnectionState::Lost);
                break;
            }
            zk::SessionState::Closed => break,
            other => {
                tracing::debug!(state = ?other, "Ignore ZooKeeper session state");
            }
        }
    }
    tracing::debug!("ZooKeeper session watcher stopped");
}

/// 重试直到建立新会话或被取消
async fn reopen(session: &Session, cancel: &CancellationToken) -> Option<zk::StateWatcher> {
    loop {
        let attempt = tokio::select! {
            _ = cancel.cancelled() => return None,
            attempt = session.open() => attempt,
        };
        match attempt {
            Ok(client) => {
                let states = client.state_watcher();
                session.install(client);
                return Some(states);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to open ZooKeeper session, retrying");
                tokio::select! {
                    _ = cancel.cancelled() => return None,
                    _ = tokio::time::sleep(session.settings.connect_timeout) => {}
                }
            }
        }
    }
}

fn is_terminal(state: &zk::SessionState) -> bool {
    matches!(
        state,
        zk::SessionState::Expired | zk::SessionState::Closed | zk::SessionState::AuthFailed
    )
}

// 单个路径的子节点订阅，把递归持久 watch 的事件折算成直接子节点的增删改
struct ChildWatch {
    session: Arc<Session>,
    path: String,
    known: BTreeMap<String, ChildData>,
    events: mpsc::UnboundedSender<ChildEvent>,
}

impl ChildWatch {
    async fn run(
        mut self,
        mut client: zk::Client,
        mut watcher: zk::PersistentWatcher,
        mut generation: watch::Receiver<u64>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.events.closed() => break,
                event = watcher.changed() => event,
            };
            if matches!(event.event_type, zk::EventType::Session) {
                if !is_terminal(&event.session_state) {
                    continue;
                }
                // 旧会话上的 watch 已失效
                match self.rewatch(&mut generation, &cancel).await {
                    Some((next_client, next_watcher)) => {
                        client = next_client;
                        watcher = next_watcher;
                    }
                    None => break,
                }
                continue;
            }
            self.apply(&client, event).await;
        }
        tracing::debug!(path = %self.path, "ZooKeeper child watch stopped");
    }

    async fn apply(&mut self, client: &zk::Client, event: zk::WatchedEvent) {
        if parent_of(&event.path) != self.path {
            return;
        }
        let name = name_of(&event.path).to_string();
        match event.event_type {
            zk::EventType::NodeCreated | zk::EventType::NodeDataChanged => {
                let read = client.get_data(&event.path).await;
                match read {
                    Ok((data, _)) => self.upsert(ChildData {
                        path: event.path,
                        name,
                        data,
                    }),
                    Err(zk::Error::NoNode) => self.remove(&name),
                    Err(e) => {
                        tracing::warn!(path = %event.path, error = %e, "Failed to read changed node");
                    }
                }
            }
            zk::EventType::NodeDeleted => self.remove(&name),
            _ => {}
        }
    }

    fn upsert(&mut self, child: ChildData) {
        let kind = match self.known.get(&child.name) {
            None => ChildEventKind::Added,
            Some(existing) if existing.data == child.data => return,
            Some(_) => ChildEventKind::Updated,
        };
        self.known.insert(child.name.clone(), child.clone());
        let _ = self.events.send(ChildEvent { kind, data: child });
    }

    fn remove(&mut self, name: &str) {
        if let Some(child) = self.known.remove(name) {
            let _ = self.events.send(ChildEvent {
                kind: ChildEventKind::Removed,
                data: child,
            });
        }
    }

    async fn rewatch(
        &mut self,
        generation: &mut watch::Receiver<u64>,
        cancel: &CancellationToken,
    ) -> Option<(zk::Client, zk::PersistentWatcher)> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return None,
                changed = generation.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
            let Ok(client) = self.session.client() else {
                continue;
            };
            match client
                .watch(&self.path, zk::AddWatchMode::PersistentRecursive)
                .await
            {
                Ok(watcher) => {
                    self.resync(&client).await;
                    return Some((client, watcher));
                }
                Err(e) => {
                    tracing::warn!(path = %self.path, error = %e, "Failed to re-watch path on new session");
                }
            }
        }
    }

    /// 新会话上的子节点与已知状态比较，补发差异
    async fn resync(&mut self, client: &zk::Client) {
        let current = match read_children(client, &self.path).await {
            Ok(children) => children,
            Err(CoordinationError::NoNode(_)) => BTreeMap::new(),
            Err(e) => {
                tracing::warn!(path = %self.path, error = %e, "Failed to resync children");
                return;
            }
        };
        let gone: Vec<String> = self
            .known
            .keys()
            .filter(|name| !current.contains_key(*name))
            .cloned()
            .collect();
        for name in gone {
            self.remove(&name);
        }
        for child in current.into_values() {
            self.upsert(child);
        }
        tracing::debug!(path = %self.path, children = self.known.len(), "Resynced children on new session");
    }
}
