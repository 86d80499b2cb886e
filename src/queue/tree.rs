//! 下载队列树
//!
//! 节点存放在以 `ItemId` 为键的表里，父子关系都用 `ItemId` 表示。
//! 树本身不做同步：修改只发生在队列的命令任务里（写锁），其余地方只读。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::common::ProgressTracker;
use crate::downloader::DownloadInfo;
use crate::persistence::{PersistedItem, PersistedQueue};

/// 队列节点 ID（仅在本次运行内有效）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub u64);

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 根节点
pub const ROOT_ID: ItemId = ItemId(0);

/// 目录节点：按名称索引、保持顺序的子节点集合
#[derive(Debug, Clone)]
pub struct DirectoryNode {
    pub name: String,
    pub path: PathBuf,
    children: Vec<ItemId>,
    by_name: HashMap<String, ItemId>,
}

impl DirectoryNode {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            children: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    pub fn children(&self) -> &[ItemId] {
        &self.children
    }

    pub fn child_named(&self, name: &str) -> Option<ItemId> {
        self.by_name.get(name).copied()
    }

    fn add_child(&mut self, name: &str, id: ItemId, at_head: bool) {
        self.by_name.insert(name.to_string(), id);
        if at_head {
            self.children.insert(0, id);
        } else {
            self.children.push(id);
        }
    }

    fn remove_child(&mut self, name: &str, id: ItemId) {
        if self.by_name.get(name) == Some(&id) {
            self.by_name.remove(name);
        }
        self.children.retain(|c| *c != id);
    }

    fn move_to_head(&mut self, id: ItemId) {
        if let Some(index) = self.children.iter().position(|c| *c == id) {
            let id = self.children.remove(index);
            self.children.insert(0, id);
        }
    }
}

/// 文件节点
#[derive(Debug, Clone)]
pub struct FileNode {
    /// 保存文件名
    pub name: String,
    pub hash: String,
    pub size: u64,
    /// 同一次提交的文件共享一个分组号
    pub dispatch_id: u64,
    pub save_path: PathBuf,
    /// 已开始下载时的下载信息
    pub download: Option<Arc<DownloadInfo>>,
    /// 需要人工重试的错误
    pub error: Option<String>,
}

/// 队列节点
#[derive(Debug, Clone)]
pub enum DownloadItem {
    Root(DirectoryNode),
    Directory(DirectoryNode),
    File(FileNode),
}

impl DownloadItem {
    pub fn name(&self) -> &str {
        match self {
            DownloadItem::Root(dir) | DownloadItem::Directory(dir) => &dir.name,
            DownloadItem::File(file) => &file.name,
        }
    }

    pub fn as_directory(&self) -> Option<&DirectoryNode> {
        match self {
            DownloadItem::Root(dir) | DownloadItem::Directory(dir) => Some(dir),
            DownloadItem::File(_) => None,
        }
    }

    fn as_directory_mut(&mut self) -> Option<&mut DirectoryNode> {
        match self {
            DownloadItem::Root(dir) | DownloadItem::Directory(dir) => Some(dir),
            DownloadItem::File(_) => None,
        }
    }

    pub fn as_file(&self) -> Option<&FileNode> {
        match self {
            DownloadItem::File(file) => Some(file),
            _ => None,
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self, DownloadItem::File(_))
    }
}

#[derive(Debug)]
struct Node {
    parent: Option<ItemId>,
    item: DownloadItem,
}

/// 队列树
#[derive(Debug)]
pub struct QueueTree {
    nodes: HashMap<ItemId, Node>,
    next_id: u64,
    /// 每次结构变化递增
    version: u64,
    /// 每次提升优先级递增，遍历器据此从头开始
    epoch: u64,
    default_dir: ItemId,
}

impl QueueTree {
    /// 创建只含根节点和默认下载目录的树
    pub fn new(default_dir: &Path) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            ROOT_ID,
            Node {
                parent: None,
                item: DownloadItem::Root(DirectoryNode::new("", PathBuf::new())),
            },
        );
        let mut tree = Self {
            nodes,
            next_id: 1,
            version: 0,
            epoch: 0,
            default_dir: ROOT_ID,
        };
        tree.default_dir = tree.ensure_top_dir(default_dir);
        tree
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn default_dir(&self) -> ItemId {
        self.default_dir
    }

    /// 节点总数（含根节点）
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn contains(&self, id: ItemId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn get(&self, id: ItemId) -> Option<&DownloadItem> {
        self.nodes.get(&id).map(|n| &n.item)
    }

    pub fn file(&self, id: ItemId) -> Option<&FileNode> {
        self.get(id).and_then(DownloadItem::as_file)
    }

    pub(crate) fn file_mut(&mut self, id: ItemId) -> Option<&mut FileNode> {
        match self.nodes.get_mut(&id).map(|n| &mut n.item) {
            Some(DownloadItem::File(file)) => Some(file),
            _ => None,
        }
    }

    pub fn parent(&self, id: ItemId) -> Option<ItemId> {
        self.nodes.get(&id).and_then(|n| n.parent)
    }

    /// 子节点（文件节点返回空）
    pub fn children(&self, id: ItemId) -> &[ItemId] {
        self.get(id)
            .and_then(DownloadItem::as_directory)
            .map(DirectoryNode::children)
            .unwrap_or(&[])
    }

    /// 节点在父目录中的位置
    pub fn index_in_parent(&self, id: ItemId) -> Option<usize> {
        let parent = self.parent(id)?;
        self.children(parent).iter().position(|c| *c == id)
    }

    /// 从根节点到 `id` 的父目录的路径（含根节点，不含 `id`）
    pub fn ancestors(&self, id: ItemId) -> Vec<ItemId> {
        let mut chain = Vec::new();
        let mut current = self.parent(id);
        while let Some(parent) = current {
            chain.push(parent);
            current = self.parent(parent);
        }
        chain.reverse();
        chain
    }

    /// 根节点下的顶层祖先目录
    pub fn top_level_ancestor(&self, id: ItemId) -> Option<ItemId> {
        let mut current = id;
        loop {
            match self.parent(current)? {
                ROOT_ID => return Some(current),
                parent => current = parent,
            }
        }
    }

    /// 目录的磁盘路径，或文件的保存路径
    pub fn path_of(&self, id: ItemId) -> Option<PathBuf> {
        match self.get(id)? {
            DownloadItem::Root(_) => None,
            DownloadItem::Directory(dir) => Some(dir.path.clone()),
            DownloadItem::File(file) => Some(file.save_path.clone()),
        }
    }

    /// 子树中的所有文件（深度优先，按队列顺序）
    pub fn files_under(&self, id: ItemId) -> Vec<ItemId> {
        let mut files = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            match self.get(current) {
                Some(DownloadItem::File(_)) => files.push(current),
                Some(_) => stack.extend(self.children(current).iter().rev()),
                None => {}
            }
        }
        files
    }

    /// 剩余待下载字节数
    pub fn calculate_size(&self) -> u64 {
        self.nodes
            .values()
            .filter_map(|n| n.item.as_file())
            .map(|file| match &file.download {
                Some(info) => file.size.saturating_sub(info.bytes_downloaded()),
                None => file.size,
            })
            .sum()
    }

    fn alloc_id(&mut self) -> ItemId {
        let id = ItemId(self.next_id);
        self.next_id += 1;
        id
    }

    fn attach(&mut self, parent: ItemId, item: DownloadItem, at_head: bool) -> Option<ItemId> {
        let name = item.name().to_string();
        let id = self.alloc_id();
        let dir = self.nodes.get_mut(&parent)?.item.as_directory_mut()?;
        if dir.child_named(&name).is_some() {
            return None;
        }
        dir.add_child(&name, id, at_head);
        self.nodes.insert(id, Node { parent: Some(parent), item });
        self.version += 1;
        Some(id)
    }

    /// 查找顶层目录
    pub fn top_dir_for(&self, path: &Path) -> Option<ItemId> {
        self.children(ROOT_ID).iter().copied().find(|id| {
            matches!(self.get(*id), Some(DownloadItem::Directory(dir)) if dir.path.as_path() == path)
        })
    }

    /// 查找或创建顶层目录
    pub fn ensure_top_dir(&mut self, path: &Path) -> ItemId {
        if let Some(id) = self.top_dir_for(path) {
            return id;
        }
        let name = path.to_string_lossy().into_owned();
        let id = self.alloc_id();
        if let Some(root) = self.nodes.get_mut(&ROOT_ID).and_then(|n| n.item.as_directory_mut()) {
            // 顶层目录以完整路径命名，不会重名
            root.children.push(id);
            root.by_name.insert(name.clone(), id);
        }
        self.nodes.insert(
            id,
            Node {
                parent: Some(ROOT_ID),
                item: DownloadItem::Directory(DirectoryNode::new(name, path)),
            },
        );
        self.version += 1;
        id
    }

    /// 查找或创建子目录，同名文件已存在时返回 None
    pub fn ensure_subdir(&mut self, parent: ItemId, name: &str) -> Option<(ItemId, bool)> {
        let dir = self.get(parent)?.as_directory()?;
        if let Some(existing) = dir.child_named(name) {
            return match self.get(existing)? {
                DownloadItem::Directory(_) => Some((existing, false)),
                _ => None,
            };
        }
        let path = dir.path.join(name);
        let id = self.attach(parent, DownloadItem::Directory(DirectoryNode::new(name, path)), false)?;
        Some((id, true))
    }

    /// 插入文件，同名节点已存在时返回 None
    pub fn insert_file(
        &mut self,
        parent: ItemId,
        name: &str,
        hash: &str,
        size: u64,
        dispatch_id: u64,
    ) -> Option<ItemId> {
        let save_path = self.get(parent)?.as_directory()?.path.join(name);
        let file = FileNode {
            name: name.to_string(),
            hash: hash.to_string(),
            size,
            dispatch_id,
            save_path,
            download: None,
            error: None,
        };
        self.attach(parent, DownloadItem::File(file), false)
    }

    /// 移除子树，返回被移除的节点和其中的下载信息
    ///
    /// 根节点不可移除；默认下载目录只清空子节点
    pub fn remove(&mut self, id: ItemId) -> (Vec<ItemId>, Vec<Arc<DownloadInfo>>) {
        let mut removed = Vec::new();
        let mut infos = Vec::new();
        if id == ROOT_ID || !self.contains(id) {
            return (removed, infos);
        }

        let targets: Vec<ItemId> = if id == self.default_dir {
            self.children(id).to_vec()
        } else {
            vec![id]
        };

        for target in targets {
            self.detach_from_parent(target);
            let mut stack = vec![target];
            while let Some(current) = stack.pop() {
                let Some(node) = self.nodes.remove(&current) else {
                    continue;
                };
                match node.item {
                    DownloadItem::File(file) => infos.extend(file.download),
                    DownloadItem::Directory(dir) | DownloadItem::Root(dir) => {
                        stack.extend(dir.children)
                    }
                }
                removed.push(current);
            }
        }
        self.version += 1;
        (removed, infos)
    }

    fn detach_from_parent(&mut self, id: ItemId) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        let name = node.item.name().to_string();
        if let Some(parent) = node.parent {
            if let Some(dir) = self.nodes.get_mut(&parent).and_then(|n| n.item.as_directory_mut()) {
                dir.remove_child(&name, id);
            }
        }
    }

    /// 从 `from` 开始向上清理空目录（根节点和默认下载目录除外）
    pub fn prune_empty(&mut self, from: ItemId) -> Vec<ItemId> {
        let mut removed = Vec::new();
        let mut current = Some(from);
        while let Some(id) = current {
            if id == ROOT_ID || id == self.default_dir {
                break;
            }
            let is_empty_dir = matches!(self.get(id), Some(DownloadItem::Directory(dir)) if dir.children.is_empty());
            if !is_empty_dir {
                break;
            }
            current = self.parent(id);
            self.detach_from_parent(id);
            self.nodes.remove(&id);
            removed.push(id);
        }
        if !removed.is_empty() {
            self.version += 1;
        }
        removed
    }

    /// 切换默认下载目录，旧目录为空时被清理
    pub fn set_default_dir(&mut self, path: &Path) -> ItemId {
        let old = self.default_dir;
        let new = self.ensure_top_dir(path);
        self.default_dir = new;
        if old != new {
            self.prune_empty(old);
        }
        new
    }

    /// 把节点及其祖先都移到各自父目录的最前面
    pub fn promote(&mut self, id: ItemId) -> bool {
        if id == ROOT_ID || !self.contains(id) {
            return false;
        }
        let mut current = id;
        while let Some(parent) = self.parent(current) {
            if let Some(dir) = self.nodes.get_mut(&parent).and_then(|n| n.item.as_directory_mut()) {
                dir.move_to_head(current);
            }
            current = parent;
        }
        self.version += 1;
        self.epoch += 1;
        true
    }

    pub(crate) fn set_download(&mut self, id: ItemId, info: Option<Arc<DownloadInfo>>) -> bool {
        match self.file_mut(id) {
            Some(file) => {
                file.download = info;
                true
            }
            None => false,
        }
    }

    // ========================================================================
    // 持久化
    // ========================================================================

    /// 生成持久化快照（不含运行时字段）
    pub fn to_persisted(&self) -> PersistedQueue {
        let items = self
            .children(ROOT_ID)
            .iter()
            .filter_map(|id| self.persist_node(*id))
            .collect();
        PersistedQueue::new(items)
    }

    fn persist_node(&self, id: ItemId) -> Option<PersistedItem> {
        Some(match self.get(id)? {
            DownloadItem::Root(_) => return None,
            DownloadItem::Directory(dir) => PersistedItem::Directory {
                name: dir.name.clone(),
                path: dir.path.clone(),
                children: dir
                    .children
                    .iter()
                    .filter_map(|child| self.persist_node(*child))
                    .collect(),
            },
            DownloadItem::File(file) => PersistedItem::File {
                name: file.name.clone(),
                hash: file.hash.clone(),
                size: file.size,
                dispatch_id: file.dispatch_id,
                chunks: file.download.as_ref().map(|info| info.persisted_chunks()),
            },
        })
    }

    /// 从持久化快照重建，返回树和出现过的最大分组号
    pub fn from_persisted(
        persisted: &PersistedQueue,
        default_dir: &Path,
        aggregate: &Arc<ProgressTracker>,
    ) -> (Self, u64) {
        let mut tree = Self::new(default_dir);
        let mut max_dispatch = 0;

        for item in &persisted.items {
            if let PersistedItem::Directory { path, children, .. } = item {
                let top = tree.ensure_top_dir(path);
                for child in children {
                    tree.restore_node(top, child, aggregate, &mut max_dispatch);
                }
            }
        }
        // 加载不算结构变化
        tree.version = 0;
        (tree, max_dispatch)
    }

    fn restore_node(
        &mut self,
        parent: ItemId,
        item: &PersistedItem,
        aggregate: &Arc<ProgressTracker>,
        max_dispatch: &mut u64,
    ) {
        match item {
            PersistedItem::Directory { name, children, .. } => {
                if let Some((dir, _)) = self.ensure_subdir(parent, name) {
                    for child in children {
                        self.restore_node(dir, child, aggregate, max_dispatch);
                    }
                    self.prune_empty(dir);
                }
            }
            PersistedItem::File {
                name,
                hash,
                size,
                dispatch_id,
                chunks,
            } => {
                *max_dispatch = (*max_dispatch).max(*dispatch_id);
                let Some(id) = self.insert_file(parent, name, hash, *size, *dispatch_id) else {
                    return;
                };
                if let (Some(chunks), true) = (chunks, *size > 0) {
                    let save_path = self.path_of(id).unwrap_or_default();
                    let info = DownloadInfo::from_persisted(id, name, save_path, *size, hash, chunks, aggregate);
                    self.set_download(id, Some(Arc::new(info)));
                }
            }
        }
    }
}
