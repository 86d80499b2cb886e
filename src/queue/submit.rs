//! 批量提交
//!
//! 提交在后台任务中展开远程目录，每个文件作为一条插入命令交给队列命令任务，
//! 因此监听器回调与树修改在同一个串行上下文中执行。

use std::path::PathBuf;
use std::sync::Arc;

use async_recursion::async_recursion;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::collaborators::RemoteEntry;
use crate::queue::{DownloadQueue, ItemId};

/// 提交进度监听器
pub trait SubmitListener: Send + Sync {
    /// 插入了一个文件（同名跳过的文件不通知）
    fn file_submitted(&self, _id: ItemId, _name: &str) {}

    /// 本次提交全部处理完
    fn complete(&self) {}

    /// 返回 true 时尽快停止展开
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// 一次提交的上下文
struct Submission {
    queue: Arc<DownloadQueue>,
    target: PathBuf,
    dispatch_id: u64,
    listener: Option<Arc<dyn SubmitListener>>,
}

impl Submission {
    fn cancelled(&self) -> bool {
        self.listener.as_ref().map_or(false, |l| l.is_cancelled())
    }

    #[async_recursion]
    async fn expand(&self, entries: Vec<RemoteEntry>, subdirs: Vec<String>) -> usize {
        let mut count = 0;
        for entry in entries {
            if self.cancelled() {
                debug!("提交已被取消: {:?}", self.target);
                break;
            }

            if entry.is_directory {
                let children = match self.queue.lookup().children(&entry).await {
                    Ok(children) => children,
                    Err(e) => {
                        warn!("展开远程目录失败，跳过: {} ({}): {:#}", entry.name, entry.peer, e);
                        continue;
                    }
                };
                let mut nested = subdirs.clone();
                nested.push(sanitize(&entry.name));
                count += self.expand(children, nested).await;
            } else {
                self.queue.enqueue_insert(
                    self.target.clone(),
                    subdirs.clone(),
                    sanitize(&entry.name),
                    entry.hash,
                    entry.size,
                    self.dispatch_id,
                    self.listener.clone(),
                );
                count += 1;
            }
        }
        count
    }
}

impl DownloadQueue {
    /// 提交一批远程条目到 `target_dir`
    ///
    /// `into_subdir` 为 false 时，顶层目录条目的内容直接放进目标目录，不再建同名子目录；
    /// 更深层的目录总是保留层级。本次提交的所有文件共享一个新的分组号。
    pub fn submit(
        self: &Arc<Self>,
        target_dir: PathBuf,
        entries: Vec<RemoteEntry>,
        into_subdir: bool,
        listener: Option<Arc<dyn SubmitListener>>,
    ) -> JoinHandle<()> {
        let submission = Submission {
            queue: self.clone(),
            target: target_dir,
            dispatch_id: self.next_dispatch_id(),
            listener,
        };

        tokio::spawn(async move {
            let mut count = 0;
            for entry in entries {
                if submission.cancelled() {
                    break;
                }
                if entry.is_directory && !into_subdir {
                    match submission.queue.lookup().children(&entry).await {
                        Ok(children) => count += submission.expand(children, Vec::new()).await,
                        Err(e) => warn!("展开远程目录失败，跳过: {} ({}): {:#}", entry.name, entry.peer, e),
                    }
                } else {
                    count += submission.expand(vec![entry], Vec::new()).await;
                }
            }

            info!(
                "提交完成: 目标={:?}, 分组={}, {} 个文件",
                submission.target, submission.dispatch_id, count
            );
            submission.queue.enqueue_submit_done(submission.listener.clone());
        })
    }
}

/// 远程名字里的路径分隔符替换掉，避免写出目标目录
fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => format!("_{}", cleaned),
        _ => cleaned,
    }
}
