//! 下载源

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// 下载源：(对端, 传输地址)
///
/// 相等和哈希只看对端：同一个对端的不同地址视为同一个逻辑通道
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadSource {
    pub peer: String,
    pub location: String,
}

impl DownloadSource {
    pub fn new(peer: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            location: location.into(),
        }
    }

    /// https 地址视为加密通道
    pub fn is_secure(&self) -> bool {
        self.location
            .get(..8)
            .map(|scheme| scheme.eq_ignore_ascii_case("https://"))
            .unwrap_or(false)
    }
}

impl PartialEq for DownloadSource {
    fn eq(&self, other: &Self) -> bool {
        self.peer == other.peer
    }
}

impl Eq for DownloadSource {}

impl Hash for DownloadSource {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.peer.hash(state);
    }
}
