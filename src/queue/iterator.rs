//! 公平遍历器
//!
//! 深度优先遍历整棵队列树寻找可调度的文件。每一轮遍历中同一个文件最多返回一次，
//! 一轮走完返回一次 None 后自动开始下一轮。
//!
//! - 提升优先级（epoch 变化）：丢弃本轮进度，从头开始新一轮
//! - 其它结构变化（version 变化）：沿上次返回节点的祖先链重建遍历栈；
//!   该节点已被移除时从头走，但保留本轮已返回的集合，不会重复返回

use std::collections::HashSet;

use crate::queue::tree::{DownloadItem, FileNode, ItemId, QueueTree, ROOT_ID};

#[derive(Debug, Default)]
pub struct FairIterator {
    /// (目录, 下一个要访问的子节点下标)
    stack: Vec<(ItemId, usize)>,
    yielded: HashSet<ItemId>,
    last: Option<ItemId>,
    version: u64,
    epoch: u64,
    started: bool,
}

impl FairIterator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 返回下一个满足 `eligible` 的文件；本轮结束时返回 None
    pub fn next<F>(&mut self, tree: &QueueTree, mut eligible: F) -> Option<ItemId>
    where
        F: FnMut(ItemId, &FileNode) -> bool,
    {
        if !self.started || tree.epoch() != self.epoch {
            self.start_pass(tree);
        } else if tree.version() != self.version {
            self.rebuild(tree);
        }

        loop {
            let Some((dir, index)) = self.stack.last_mut() else {
                // 本轮结束
                self.start_pass(tree);
                return None;
            };

            let children = tree.children(*dir);
            if *index >= children.len() {
                self.stack.pop();
                continue;
            }
            let child = children[*index];
            *index += 1;

            match tree.get(child) {
                Some(DownloadItem::Directory(_)) => self.stack.push((child, 0)),
                Some(DownloadItem::File(file)) => {
                    if !self.yielded.contains(&child) && eligible(child, file) {
                        self.yielded.insert(child);
                        self.last = Some(child);
                        return Some(child);
                    }
                }
                Some(DownloadItem::Root(_)) | None => {}
            }
        }
    }

    fn start_pass(&mut self, tree: &QueueTree) {
        self.stack = vec![(ROOT_ID, 0)];
        self.yielded.clear();
        self.last = None;
        self.version = tree.version();
        self.epoch = tree.epoch();
        self.started = true;
    }

    fn rebuild(&mut self, tree: &QueueTree) {
        self.version = tree.version();

        let Some(last) = self.last.filter(|id| tree.contains(*id)) else {
            self.stack = vec![(ROOT_ID, 0)];
            return;
        };

        let mut path = tree.ancestors(last);
        path.push(last);
        // path[i] 是 path[i + 1] 的父目录
        self.stack = path
            .windows(2)
            .filter_map(|pair| {
                let next = tree.index_in_parent(pair[1])? + 1;
                Some((pair[0], next))
            })
            .collect();
    }
}
