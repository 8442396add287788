//! 每个连接的有界出站队列
//!
//! 广播器只负责入队，写任务独立地把队列里的帧写到网络上，慢连接不会拖住广播。
//! 队列满时：非关键帧挤掉最早的非关键帧；关键帧（消息）等待空位，由调用方的超时兜底。
//! 控制项（ping、close）不占容量。

use std::collections::VecDeque;
use std::sync::Mutex;

use domain::ServerFrame;
use thiserror::Error;
use tokio::sync::Notify;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("outbound queue closed")]
    Closed,
    #[error("outbound queue full")]
    Full,
}

/// 写任务从队列里取出的内容
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Frame(ServerFrame),
    Ping,
    Close { code: u16, reason: String },
}

#[derive(Debug)]
struct Item {
    outbound: Outbound,
    critical: bool,
}

impl Item {
    fn is_droppable(&self) -> bool {
        matches!(self.outbound, Outbound::Frame(_)) && !self.critical
    }
}

#[derive(Debug, Default)]
struct State {
    items: VecDeque<Item>,
    /// 队列中数据帧的数量（不含控制项）
    frames: usize,
    closed: bool,
    dropped: u64,
}

#[derive(Debug)]
pub struct OutboundQueue {
    state: Mutex<State>,
    capacity: usize,
    readable: Notify,
    writable: Notify,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State::default()),
            capacity: capacity.max(1),
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 入队一个数据帧；关键帧在队列满时会一直等待，调用方需要自行加超时
    pub async fn send(&self, frame: ServerFrame, critical: bool) -> Result<(), QueueError> {
        let mut frame = Some(frame);
        loop {
            let writable = self.writable.notified();
            tokio::pin!(writable);
            writable.as_mut().enable();

            let must_wait = {
                let mut state = self.state();
                if state.closed {
                    return Err(QueueError::Closed);
                }

                if state.frames >= self.capacity && critical {
                    true
                } else {
                    if state.frames >= self.capacity {
                        let Some(pos) = state.items.iter().position(Item::is_droppable) else {
                            // 队列里全是关键帧，丢弃新来的非关键帧
                            state.dropped += 1;
                            return Err(QueueError::Full);
                        };
                        state.items.remove(pos);
                        state.frames -= 1;
                        state.dropped += 1;
                    }
                    if let Some(frame) = frame.take() {
                        state.items.push_back(Item {
                            outbound: Outbound::Frame(frame),
                            critical,
                        });
                        state.frames += 1;
                    }
                    false
                }
            };

            if must_wait {
                writable.await;
                continue;
            }

            self.readable.notify_one();
            return Ok(());
        }
    }

    /// 入队控制项（ping），不受容量限制
    pub fn push_control(&self, outbound: Outbound) -> Result<(), QueueError> {
        {
            let mut state = self.state();
            if state.closed {
                return Err(QueueError::Closed);
            }
            state.items.push_back(Item {
                outbound,
                critical: true,
            });
        }
        self.readable.notify_one();
        Ok(())
    }

    /// 取出下一项；队列关闭且取空后返回 None
    pub async fn recv(&self) -> Option<Outbound> {
        loop {
            let readable = self.readable.notified();
            tokio::pin!(readable);
            readable.as_mut().enable();

            {
                let mut state = self.state();
                if let Some(item) = state.items.pop_front() {
                    if matches!(item.outbound, Outbound::Frame(_)) {
                        state.frames -= 1;
                    }
                    drop(state);
                    self.writable.notify_one();
                    return Some(item.outbound);
                }
                if state.closed {
                    return None;
                }
            }

            readable.await;
        }
    }

    /// 关闭队列：追加一个 close 控制项，此后的入队全部失败；重复关闭无效果
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        {
            let mut state = self.state();
            if state.closed {
                return;
            }
            state.items.push_back(Item {
                outbound: Outbound::Close {
                    code,
                    reason: reason.into(),
                },
                critical: true,
            });
            state.closed = true;
        }
        self.readable.notify_one();
        self.writable.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// 当前排队的数据帧数
    pub fn len(&self) -> usize {
        self.state().frames
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 因队列满而被丢弃的非关键帧总数
    pub fn dropped(&self) -> u64 {
        self.state().dropped
    }
}
