//! 下载队列
//!
//! 持久化的待下载目录/文件树，加上一个不会饿死任何分支的公平遍历器。
//!
//! ## 并发模型
//!
//! - 结构修改（插入、移除、提升、挂载下载信息）全部通过命令通道交给队列的命令任务串行执行
//! - 读取（遍历、子节点数量、状态文本）直接拿树的读锁，临界区很短
//! - 变更通知先进入合并器，按 UI 事件间隔批量广播
//!
//! 锁顺序：遍历器 -> 树 -> 无源分组 -> 退役集合

pub mod iterator;
pub mod saver;
pub mod submit;
pub mod tree;

pub use iterator::FairIterator;
pub use saver::QueueSaver;
pub use submit::SubmitListener;
pub use tree::{DirectoryNode, DownloadItem, FileNode, ItemId, QueueTree, ROOT_ID};

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collaborators::ChildrenLookup;
use crate::common::ProgressTracker;
use crate::config::QueueConfig;
use crate::downloader::DownloadInfo;
use crate::error::{QueueError, QueueResult};
use crate::events::{QueueEvent, UpdateCoalescer};
use crate::persistence::{load_queue, PersistedQueue};

/// 调度器从队列取出的待下载文件快照
#[derive(Debug, Clone)]
pub struct QueuedFile {
    pub id: ItemId,
    pub name: String,
    pub hash: String,
    pub size: u64,
    pub dispatch_id: u64,
    pub save_path: PathBuf,
    pub download: Option<Arc<DownloadInfo>>,
}

/// 队列命令，由命令任务串行执行
enum Command {
    Insert {
        target: PathBuf,
        subdirs: Vec<String>,
        name: String,
        hash: String,
        size: u64,
        dispatch_id: u64,
        listener: Option<Arc<dyn SubmitListener>>,
    },
    SubmitDone(Option<Arc<dyn SubmitListener>>),
    Promote(ItemId),
    Complete(ItemId),
    Cancel {
        id: ItemId,
        reply: oneshot::Sender<Vec<Arc<DownloadInfo>>>,
    },
    SetDownload {
        id: ItemId,
        info: Option<Arc<DownloadInfo>>,
        reply: oneshot::Sender<bool>,
    },
    SetError {
        id: ItemId,
        error: Option<String>,
    },
    SetDefaultDir(PathBuf),
    Barrier(oneshot::Sender<()>),
}

/// 下载队列
pub struct DownloadQueue {
    config: QueueConfig,
    tree: RwLock<QueueTree>,
    iter: Mutex<FairIterator>,
    /// 被标记为无下载源的分组
    no_sources: Mutex<HashSet<u64>>,
    /// 已提交完成、等待命令任务移除的节点
    retired: Mutex<HashSet<ItemId>>,
    commands: mpsc::UnboundedSender<Command>,
    events: Arc<UpdateCoalescer<QueueEvent>>,
    saver: Arc<QueueSaver>,
    lookup: Arc<dyn ChildrenLookup>,
    aggregate: Arc<ProgressTracker>,
    next_dispatch_id: AtomicU64,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DownloadQueue {
    /// 打开队列
    ///
    /// 状态目录无法创建时返回 `QueueError::StateDirUnavailable`；
    /// 队列文件损坏或版本不符时记录警告并从空队列开始。
    pub async fn open(
        config: QueueConfig,
        default_dir: &Path,
        lookup: Arc<dyn ChildrenLookup>,
        aggregate: Arc<ProgressTracker>,
    ) -> QueueResult<Arc<Self>> {
        tokio::fs::create_dir_all(&config.state_dir)
            .await
            .map_err(|source| QueueError::StateDirUnavailable {
                path: config.state_dir.clone(),
                source,
            })?;

        let state_file = config.state_file();
        let loaded = {
            let path = state_file.clone();
            tokio::task::spawn_blocking(move || load_queue(&path))
                .await
                .unwrap_or_else(|e| Err(QueueError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))))
        };

        let (tree, max_dispatch) = match loaded {
            Ok(Some(persisted)) => {
                let (tree, max_dispatch) = QueueTree::from_persisted(&persisted, default_dir, &aggregate);
                info!(
                    "已加载下载队列: {:?}, {} 个节点",
                    state_file,
                    tree.len()
                );
                (tree, max_dispatch)
            }
            Ok(None) => (QueueTree::new(default_dir), 0),
            Err(e) => {
                warn!("下载队列文件无法读取，使用空队列: {:?}: {}", state_file, e);
                (QueueTree::new(default_dir), 0)
            }
        };

        let (commands, rx) = mpsc::unbounded_channel();
        let saver = Arc::new(QueueSaver::new(state_file, config.min_save_interval()));
        let shutdown = CancellationToken::new();
        let events = Arc::new(UpdateCoalescer::new());

        let queue = Arc::new(Self {
            tree: RwLock::new(tree),
            iter: Mutex::new(FairIterator::new()),
            no_sources: Mutex::new(HashSet::new()),
            retired: Mutex::new(HashSet::new()),
            commands,
            events: events.clone(),
            saver: saver.clone(),
            lookup,
            aggregate,
            next_dispatch_id: AtomicU64::new(max_dispatch),
            shutdown: shutdown.clone(),
            tasks: Mutex::new(Vec::new()),
            config,
        });

        let weak = Arc::downgrade(&queue);
        let handles = vec![
            tokio::spawn(run_commands(weak.clone(), rx, shutdown.clone())),
            tokio::spawn(saver.run(weak, shutdown.clone())),
            events.spawn_flusher(queue.config.ui_event_interval(), shutdown),
        ];
        queue.tasks.lock().extend(handles);

        Ok(queue)
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!("队列命令任务已退出，命令被丢弃");
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn aggregate(&self) -> &Arc<ProgressTracker> {
        &self.aggregate
    }

    pub fn saver(&self) -> &Arc<QueueSaver> {
        &self.saver
    }

    pub(crate) fn lookup(&self) -> &Arc<dyn ChildrenLookup> {
        &self.lookup
    }

    pub(crate) fn next_dispatch_id(&self) -> u64 {
        self.next_dispatch_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// 订阅队列变更通知
    pub fn subscribe(&self) -> broadcast::Receiver<Vec<QueueEvent>> {
        self.events.subscribe()
    }

    /// 通知界面某个节点的显示状态变了
    pub fn notify_changed(&self, id: ItemId) {
        self.events.push(QueueEvent::Changed(id));
    }

    // ========================================================================
    // 调度器使用的接口
    // ========================================================================

    /// 取下一个可调度的文件
    ///
    /// 返回 None 既可能是队列里没有可调度文件，也可能只是本轮遍历结束，调用方下次再来即可
    pub fn get_inactive_download_file(&self) -> Option<QueuedFile> {
        let mut iter = self.iter.lock();
        let tree = self.tree.read();
        let no_sources = self.no_sources.lock();
        let retired = self.retired.lock();

        let id = iter.next(&tree, |id, file| {
            file.error.is_none()
                && !no_sources.contains(&file.dispatch_id)
                && !retired.contains(&id)
                && file.download.as_ref().map_or(true, |info| !info.has_worker())
        })?;

        let file = tree.file(id)?;
        Some(QueuedFile {
            id,
            name: file.name.clone(),
            hash: file.hash.clone(),
            size: file.size,
            dispatch_id: file.dispatch_id,
            save_path: file.save_path.clone(),
            download: file.download.clone(),
        })
    }

    /// 挂载或卸下下载信息，命令执行完成后返回
    pub async fn set_download_info(&self, id: ItemId, info: Option<Arc<DownloadInfo>>) -> bool {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SetDownload { id, info, reply });
        rx.await.unwrap_or(false)
    }

    pub fn download_info(&self, id: ItemId) -> Option<Arc<DownloadInfo>> {
        self.tree.read().file(id).and_then(|f| f.download.clone())
    }

    /// 标记文件下载完成：立即不再参与调度，随后从树中移除
    pub fn complete(&self, id: ItemId) {
        self.retired.lock().insert(id);
        self.send(Command::Complete(id));
    }

    /// 取消节点（文件或目录），返回其中所有的下载信息
    pub async fn cancel(&self, id: ItemId) -> Vec<Arc<DownloadInfo>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Cancel { id, reply });
        rx.await.unwrap_or_default()
    }

    /// 提升到队列最前面
    pub fn promote(&self, id: ItemId) {
        self.send(Command::Promote(id));
    }

    pub fn set_error(&self, id: ItemId, description: impl Into<String>) {
        self.send(Command::SetError {
            id,
            error: Some(description.into()),
        });
    }

    /// 清除错误，文件重新参与调度
    pub fn clear_error(&self, id: ItemId) {
        self.send(Command::SetError { id, error: None });
    }

    pub fn set_default_dir(&self, path: PathBuf) {
        self.send(Command::SetDefaultDir(path));
    }

    /// 把文件所在分组标记为无下载源
    ///
    /// 同组文件在找到新对端之前都不再参与调度；重复标记没有额外效果
    pub fn mark_no_sources(&self, id: ItemId) {
        let tree = self.tree.read();
        let Some(file) = tree.file(id) else {
            return;
        };
        let group = file.dispatch_id;
        if !self.no_sources.lock().insert(group) {
            return;
        }
        debug!("分组 {} 没有下载源: 文件={}", group, file.name);

        // 只刷新同一顶层目录下的同组文件
        let scope = tree.top_level_ancestor(id).unwrap_or(id);
        for file_id in tree.files_under(scope) {
            if tree.file(file_id).map(|f| f.dispatch_id) == Some(group) {
                self.events.push(QueueEvent::Changed(file_id));
            }
        }
    }

    /// 发现新对端：清除所有无源标记并刷新曾被标记的文件
    pub fn clear_no_sources(&self) {
        let tree = self.tree.read();
        let groups = std::mem::take(&mut *self.no_sources.lock());
        if groups.is_empty() {
            return;
        }
        debug!("清除 {} 个无源分组", groups.len());
        for file_id in tree.files_under(ROOT_ID) {
            if tree
                .file(file_id)
                .map_or(false, |f| groups.contains(&f.dispatch_id))
            {
                self.events.push(QueueEvent::Changed(file_id));
            }
        }
    }

    pub fn has_no_sources(&self, id: ItemId) -> bool {
        let tree = self.tree.read();
        tree.file(id)
            .map_or(false, |f| self.no_sources.lock().contains(&f.dispatch_id))
    }

    // ========================================================================
    // 读取
    // ========================================================================

    /// 剩余待下载字节数
    pub fn calculate_size(&self) -> u64 {
        self.tree.read().calculate_size()
    }

    pub fn child_count(&self, id: ItemId) -> usize {
        self.tree.read().children(id).len()
    }

    pub fn child_at(&self, id: ItemId, index: usize) -> Option<ItemId> {
        self.tree.read().children(id).get(index).copied()
    }

    pub fn parent_of(&self, id: ItemId) -> Option<ItemId> {
        self.tree.read().parent(id)
    }

    pub fn item(&self, id: ItemId) -> Option<DownloadItem> {
        self.tree.read().get(id).cloned()
    }

    pub fn contains(&self, id: ItemId) -> bool {
        self.tree.read().contains(id)
    }

    pub fn item_path(&self, id: ItemId) -> Option<PathBuf> {
        self.tree.read().path_of(id)
    }

    pub fn default_dir(&self) -> ItemId {
        self.tree.read().default_dir()
    }

    /// 按路径查找顶层目录
    pub fn top_dir_for(&self, path: &Path) -> Option<ItemId> {
        self.tree.read().top_dir_for(path)
    }

    /// 子树中的所有文件
    pub fn files_under(&self, id: ItemId) -> Vec<ItemId> {
        self.tree.read().files_under(id)
    }

    /// 文件的显示状态
    pub fn status_text(&self, id: ItemId) -> Option<String> {
        let tree = self.tree.read();
        let file = tree.file(id)?;

        if let Some(error) = &file.error {
            return Some(error.clone());
        }
        if let Some(info) = &file.download {
            if let Some(error) = info.error() {
                return Some(error);
            }
            let active = info.active_chunks().len();
            if active > 0 {
                let percent = info.bytes_downloaded() as f64 / file.size.max(1) as f64 * 100.0;
                return Some(format!("{} active chunks, {:.0}%", active, percent));
            }
        }
        if self.no_sources.lock().contains(&file.dispatch_id) {
            return Some("waiting for sources".to_string());
        }
        Some("queued".to_string())
    }

    /// 持久化快照
    pub fn snapshot(&self) -> PersistedQueue {
        self.tree.read().to_persisted()
    }

    // ========================================================================
    // 生命周期
    // ========================================================================

    /// 等待此前提交的命令全部执行完
    pub async fn flush(&self) {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Barrier(reply));
        let _ = rx.await;
    }

    /// 立即保存并等待完成
    pub async fn save_and_wait(&self) -> QueueResult<()> {
        self.flush().await;
        let snapshot = self.snapshot();
        self.saver.save_now(snapshot).await
    }

    /// 执行完已提交的命令，保存后停止后台任务
    pub async fn shutdown(&self) {
        self.flush().await;
        self.shutdown.cancel();
        if let Err(e) = self.saver.save_now(self.snapshot()).await {
            tracing::error!("关闭时保存下载队列失败: {}", e);
        }
        let handles: Vec<_> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!("下载队列已关闭");
    }

    // ========================================================================
    // 命令执行（仅在命令任务中调用）
    // ========================================================================

    fn apply(&self, command: Command) {
        match command {
            Command::Insert {
                target,
                subdirs,
                name,
                hash,
                size,
                dispatch_id,
                listener,
            } => self.apply_insert(&target, &subdirs, &name, &hash, size, dispatch_id, listener),
            Command::SubmitDone(listener) => {
                if let Some(listener) = listener {
                    listener.complete();
                }
            }
            Command::Promote(id) => {
                if self.tree.write().promote(id) {
                    self.events.push(QueueEvent::Changed(id));
                    self.saver.mark_dirty();
                }
            }
            Command::Complete(id) => {
                let (name, removed) = {
                    let mut tree = self.tree.write();
                    let name = tree.get(id).map(|item| item.name().to_string());
                    (name, self.remove_and_prune(&mut tree, id).0)
                };
                self.retired.lock().remove(&id);
                if let Some(name) = name {
                    info!("✓ 下载完成: {}", name);
                }
                self.publish_removed(&removed);
            }
            Command::Cancel { id, reply } => {
                let (removed, infos) = {
                    let mut tree = self.tree.write();
                    self.remove_and_prune(&mut tree, id)
                };
                {
                    let mut retired = self.retired.lock();
                    for item in &removed {
                        retired.remove(item);
                    }
                }
                if !removed.is_empty() {
                    info!("已取消 {} 个队列节点", removed.len());
                }
                self.publish_removed(&removed);
                let _ = reply.send(infos);
            }
            Command::SetDownload { id, info, reply } => {
                let updated = self.tree.write().set_download(id, info);
                if updated {
                    self.events.push(QueueEvent::Changed(id));
                    self.saver.mark_dirty();
                }
                let _ = reply.send(updated);
            }
            Command::SetError { id, error } => {
                let updated = match self.tree.write().file_mut(id) {
                    Some(file) => {
                        file.error = error;
                        true
                    }
                    None => false,
                };
                if updated {
                    self.events.push(QueueEvent::Changed(id));
                }
            }
            Command::SetDefaultDir(path) => {
                let (before, after) = {
                    let mut tree = self.tree.write();
                    let before = tree.default_dir();
                    (before, tree.set_default_dir(&path))
                };
                if before != after {
                    info!("默认下载目录已切换: {:?}", path);
                    self.events.push(QueueEvent::Inserted(after));
                    if !self.contains(before) {
                        self.events.push(QueueEvent::Removed(before));
                    }
                    self.saver.mark_dirty();
                }
            }
            Command::Barrier(reply) => {
                let _ = reply.send(());
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_insert(
        &self,
        target: &Path,
        subdirs: &[String],
        name: &str,
        hash: &str,
        size: u64,
        dispatch_id: u64,
        listener: Option<Arc<dyn SubmitListener>>,
    ) {
        let mut inserted = Vec::new();
        let file_id = {
            let mut tree = self.tree.write();
            let existed = tree.top_dir_for(target).is_some();
            let mut parent = tree.ensure_top_dir(target);
            if !existed {
                inserted.push(parent);
            }

            let mut collided = false;
            for dir in subdirs {
                match tree.ensure_subdir(parent, dir) {
                    Some((id, created)) => {
                        if created {
                            inserted.push(id);
                        }
                        parent = id;
                    }
                    None => {
                        collided = true;
                        break;
                    }
                }
            }

            let file_id = if collided {
                None
            } else {
                tree.insert_file(parent, name, hash, size, dispatch_id)
            };
            if file_id.is_none() {
                // 同名冲突，清理这次新建出来的空目录
                let pruned = tree.prune_empty(parent);
                inserted.retain(|id| !pruned.contains(id));
            }
            file_id
        };

        for id in &inserted {
            self.events.push(QueueEvent::Inserted(*id));
        }

        match file_id {
            Some(id) => {
                self.events.push(QueueEvent::Inserted(id));
                self.aggregate.expand_task(size);
                self.saver.mark_dirty();
                if let Some(listener) = listener {
                    listener.file_submitted(id, name);
                }
            }
            None => debug!("跳过同名文件: {:?}/{}/{}", target, subdirs.join("/"), name),
        }
    }

    fn remove_and_prune(
        &self,
        tree: &mut QueueTree,
        id: ItemId,
    ) -> (Vec<ItemId>, Vec<Arc<DownloadInfo>>) {
        let parent = tree.parent(id);
        let (mut removed, infos) = tree.remove(id);
        if let Some(parent) = parent {
            removed.extend(tree.prune_empty(parent));
        }
        if !removed.is_empty() {
            self.saver.mark_dirty();
        }
        (removed, infos)
    }

    fn publish_removed(&self, removed: &[ItemId]) {
        for id in removed {
            self.events.push(QueueEvent::Removed(*id));
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn enqueue_insert(
        &self,
        target: PathBuf,
        subdirs: Vec<String>,
        name: String,
        hash: String,
        size: u64,
        dispatch_id: u64,
        listener: Option<Arc<dyn SubmitListener>>,
    ) {
        self.send(Command::Insert {
            target,
            subdirs,
            name,
            hash,
            size,
            dispatch_id,
            listener,
        });
    }

    pub(crate) fn enqueue_submit_done(&self, listener: Option<Arc<dyn SubmitListener>>) {
        self.send(Command::SubmitDone(listener));
    }
}

/// 命令任务：队列树唯一的修改入口
async fn run_commands(
    queue: Weak<DownloadQueue>,
    mut rx: mpsc::UnboundedReceiver<Command>,
    token: CancellationToken,
) {
    loop {
        let command = tokio::select! {
            command = rx.recv() => command,
            _ = token.cancelled() => None,
        };
        let Some(command) = command else {
            break;
        };
        let Some(queue) = queue.upgrade() else {
            break;
        };
        queue.apply(command);
    }
    debug!("队列命令任务退出");
}
