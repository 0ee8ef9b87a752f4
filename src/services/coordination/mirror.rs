use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::client::{ChildData, ChildEvent, ChildEventKind, CoordinationClient, CoordinationError};

/// 子节点镜像变化的回调，`snapshot` 是应用事件之后的全部子节点
pub trait MirrorListener: Send + Sync {
    fn child_changed(&self, path: &str, event: &ChildEvent, snapshot: &[ChildData]);
}

/// 某个路径下直接子节点的本地镜像
///
/// 先挂 watch 再读初始子节点，初始数据与随后到达的重复事件按内容去重，
/// 只有真正改变镜像的事件才会回调监听器。
#[derive(Debug)]
pub struct PathMirror {
    path: String,
    current: Arc<Mutex<BTreeMap<String, ChildData>>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl PathMirror {
    pub async fn start(
        client: &Arc<dyn CoordinationClient>,
        path: String,
        listener: Arc<dyn MirrorListener>,
    ) -> Result<Self, CoordinationError> {
        let mut events = client.watch_children(&path).await?;
        let initial = match client.children(&path).await {
            Ok(children) => children,
            Err(CoordinationError::NoNode(_)) => Vec::new(),
            Err(e) => return Err(e),
        };

        let current = Arc::new(Mutex::new(
            initial
                .into_iter()
                .map(|child| (child.name.clone(), child))
                .collect::<BTreeMap<_, _>>(),
        ));
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let task_current = current.clone();
        let task_cancel = cancel.clone();
        let task_path = path.clone();
        tracker.spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                if let Some(snapshot) = apply(&task_current, &event) {
                    listener.child_changed(&task_path, &event, &snapshot);
                }
            }
            tracing::debug!(path = %task_path, "Path mirror stopped");
        });
        tracker.close();

        tracing::debug!(path = %path, "Path mirror started");
        Ok(Self {
            path,
            current,
            cancel,
            tracker,
        })
    }

    /// 当前子节点，按名字排序
    pub fn current_data(&self) -> Vec<ChildData> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub async fn close(&self) {
        self.cancel.cancel();
        self.tracker.wait().await;
        tracing::debug!(path = %self.path, "Path mirror closed");
    }
}

// 返回 None 表示事件没有改变镜像
fn apply(current: &Mutex<BTreeMap<String, ChildData>>, event: &ChildEvent) -> Option<Vec<ChildData>> {
    let mut current = current.lock().unwrap_or_else(PoisonError::into_inner);
    let data = &event.data;
    let changed = match event.kind {
        ChildEventKind::Added | ChildEventKind::Updated => {
            if current.get(&data.name) == Some(data) {
                false
            } else {
                current.insert(data.name.clone(), data.clone());
                true
            }
        }
        ChildEventKind::Removed => current.remove(&data.name).is_some(),
    };
    changed.then(|| current.values().cloned().collect())
}

struct ArenaEntry {
    mirror: Arc<PathMirror>,
    refs: usize,
}

/// 按路径共享镜像，最后一个使用者释放时关闭
#[derive(Default)]
pub struct MirrorArena {
    mirrors: tokio::sync::Mutex<HashMap<String, ArenaEntry>>,
}

impl std::fmt::Debug for MirrorArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorArena").finish_non_exhaustive()
    }
}

impl MirrorArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(
        &self,
        client: &Arc<dyn CoordinationClient>,
        path: &str,
        listener: Arc<dyn MirrorListener>,
    ) -> Result<Arc<PathMirror>, CoordinationError> {
        let mut mirrors = self.mirrors.lock().await;
        if let Some(entry) = mirrors.get_mut(path) {
            entry.refs += 1;
            return Ok(entry.mirror.clone());
        }

        let mirror = Arc::new(PathMirror::start(client, path.to_string(), listener).await?);
        mirrors.insert(
            path.to_string(),
            ArenaEntry {
                mirror: mirror.clone(),
                refs: 1,
            },
        );
        Ok(mirror)
    }

    /// 返回镜像是否因此被关闭
    pub async fn release(&self, path: &str) -> bool {
        let mut mirrors = self.mirrors.lock().await;
        let Some(entry) = mirrors.get_mut(path) else {
            return false;
        };
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs > 0 {
            return false;
        }
        if let Some(entry) = mirrors.remove(path) {
            entry.mirror.close().await;
        }
        true
    }

    pub async fn len(&self) -> usize {
        self.mirrors.lock().await.len()
    }

    pub async fn close_all(&self) {
        let drained: Vec<ArenaEntry> = self.mirrors.lock().await.drain().map(|(_, e)| e).collect();
        join_all(drained.iter().map(|entry| entry.mirror.close())).await;
    }
}
