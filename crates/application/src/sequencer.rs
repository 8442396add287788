use dashmap::DashMap;
use domain::Channel;

use crate::registry::ConnectionRegistry;

/// 频道内事件序列号分配器
///
/// 序列号只作为排序提示，客户端不应依赖它做缺口补齐。
/// 频道上没有任何连接时计数器被回收，下次从 1 重新开始。
///
/// 回收时在计数器分片锁内复查注册表，加锁顺序为 `counters` -> 注册表 `by_channel`。
#[derive(Debug, Default)]
pub struct ChannelSequencer {
    counters: DashMap<Channel, u64>,
}

impl ChannelSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为频道分配下一个序列号
    pub fn next(&self, channel: Channel) -> u64 {
        let mut counter = self.counters.entry(channel).or_insert(0);
        *counter += 1;
        *counter
    }

    /// 频道仍然没有连接时回收计数器，返回是否回收
    pub fn release_if_idle(&self, channel: Channel, registry: &ConnectionRegistry) -> bool {
        self.counters
            .remove_if(&channel, |_, _| !registry.has_sockets(channel))
            .is_some()
    }

    /// 回收所有已无连接的频道计数器，返回回收数量
    pub fn purge_idle(&self, registry: &ConnectionRegistry) -> usize {
        let mut purged = 0;
        self.counters.retain(|channel, _| {
            let keep = registry.has_sockets(*channel);
            if !keep {
                purged += 1;
            }
            keep
        });
        purged
    }
}
