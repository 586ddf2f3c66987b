use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info};

/// 默认最小分片大小: 1MB
pub const DEFAULT_MIN_CHUNK_SIZE: u64 = 1024 * 1024;

/// 租约ID（单个任务内唯一）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LeaseId(pub u64);

/// 分片信息（尚未落盘的字节范围）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chunk {
    /// 起始偏移
    pub offset: u64,
    /// 长度
    pub length: u64,
    /// 最近一次使用的链接索引
    pub url_index: usize,
    /// 重试次数
    #[serde(default)]
    pub retries: u32,
}

impl Chunk {
    pub fn new(offset: u64, length: u64, url_index: usize) -> Self {
        Self {
            offset,
            length,
            url_index,
            retries: 0,
        }
    }

    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    pub fn range(&self) -> Range<u64> {
        self.offset..self.end()
    }
}

/// 租约：worker 持有的分片副本
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub id: LeaseId,
    pub offset: u64,
    pub length: u64,
    pub url_index: usize,
}

impl Lease {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// Range 请求头的值（闭区间）
    pub fn range_header(&self) -> String {
        format!("bytes={}-{}", self.offset, self.end() - 1)
    }
}

/// 分片存储错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("分片 {offset}+{length} 与正在下载的分片重叠")]
    AlreadyClaimed { offset: u64, length: u64 },
    #[error("分片 {offset}+{length} 不在待下载范围内")]
    NotOutstanding { offset: u64, length: u64 },
    #[error("租约不存在: {0:?}")]
    UnknownLease(LeaseId),
    #[error("租约 {lease:?} 进度超出范围: {bytes} bytes")]
    Overrun { lease: LeaseId, bytes: u64 },
    #[error("分片数据无效: {0}")]
    InvalidRanges(String),
}

#[derive(Debug, Clone)]
struct Slot {
    chunk: Chunk,
    lease: Option<LeaseId>,
    /// 退避期内不参与调度
    not_before: Option<Instant>,
}

/// 分片存储
///
/// 保存一个任务所有尚未落盘的字节范围，是分片列表的唯一权威来源。
/// 任意时刻 `received + Σ(outstanding) == size`，租约之间互不重叠。
#[derive(Debug, Clone)]
pub struct ChunkStore {
    size: u64,
    received: u64,
    /// 按 offset 排序
    slots: Vec<Slot>,
    next_lease: u64,
}

/// 计算分片大小：尽量均分为 max_chunks 份，但不小于 min_chunk_size
pub fn plan_chunk_len(size: u64, min_chunk_size: u64, max_chunks: usize) -> u64 {
    let max_chunks = max_chunks.max(1) as u64;
    size.div_ceil(max_chunks).max(min_chunk_size).max(1)
}

impl ChunkStore {
    /// 按固定分片大小切分整个文件
    pub fn new(size: u64, chunk_len: u64, url_index: usize) -> Self {
        let chunk_len = chunk_len.max(1);
        let mut slots = Vec::new();
        let mut offset = 0u64;

        while offset < size {
            let end = std::cmp::min(offset + chunk_len, size);
            slots.push(Slot {
                chunk: Chunk::new(offset, end - offset, url_index),
                lease: None,
                not_before: None,
            });
            offset = end;
        }

        info!(
            "创建分片存储: 文件大小={} bytes, 分片数量={}",
            size,
            slots.len()
        );

        Self {
            size,
            received: 0,
            slots,
            next_lease: 1,
        }
    }

    /// 从持久化的未完成分片恢复
    pub fn from_outstanding(size: u64, mut chunks: Vec<Chunk>) -> Result<Self, ChunkError> {
        chunks.sort_by_key(|c| c.offset);

        let mut cursor = 0u64;
        let mut outstanding = 0u64;
        for chunk in &chunks {
            if chunk.length == 0 {
                return Err(ChunkError::InvalidRanges(format!(
                    "空分片 offset={}",
                    chunk.offset
                )));
            }
            if chunk.offset < cursor {
                return Err(ChunkError::InvalidRanges(format!(
                    "分片重叠 offset={}",
                    chunk.offset
                )));
            }
            if chunk.end() > size {
                return Err(ChunkError::InvalidRanges(format!(
                    "分片超出文件大小 end={} size={}",
                    chunk.end(),
                    size
                )));
            }
            cursor = chunk.end();
            outstanding += chunk.length;
        }

        let slots = chunks
            .into_iter()
            .map(|chunk| Slot {
                chunk,
                lease: None,
                not_before: None,
            })
            .collect();

        Ok(Self {
            size,
            received: size - outstanding,
            slots,
            next_lease: 1,
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// 已落盘字节数
    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn remaining(&self) -> u64 {
        self.size - self.received
    }

    /// 没有任何待下载分片
    pub fn is_complete(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn leased_count(&self) -> usize {
        self.slots.iter().filter(|s| s.lease.is_some()).count()
    }

    /// 所有未完成的分片（含正在下载的），按 offset 排序
    pub fn outstanding(&self) -> Vec<Chunk> {
        self.slots.iter().map(|s| s.chunk.clone()).collect()
    }

    /// 租约当前剩余的范围
    pub fn lease_remaining(&self, lease: LeaseId) -> Option<&Chunk> {
        self.slots
            .iter()
            .find(|s| s.lease == Some(lease))
            .map(|s| &s.chunk)
    }

    /// 下一个可调度的分片（未被租用且不在退避期内）
    pub fn next_claimable(&self, now: Instant) -> Option<&Chunk> {
        self.slots
            .iter()
            .find(|s| s.lease.is_none() && s.not_before.map_or(true, |t| t <= now))
            .map(|s| &s.chunk)
    }

    /// 最早的退避到期时间
    pub fn next_retry_at(&self) -> Option<Instant> {
        self.slots
            .iter()
            .filter(|s| s.lease.is_none())
            .filter_map(|s| s.not_before)
            .min()
    }

    /// 租用指定范围
    ///
    /// 范围必须完整落在某个未被租用的分片内，必要时会拆分该分片
    pub fn claim(&mut self, offset: u64, length: u64, url_index: usize) -> Result<Lease, ChunkError> {
        let end = offset + length;
        if length == 0 {
            return Err(ChunkError::NotOutstanding { offset, length });
        }

        let overlaps_lease = self
            .slots
            .iter()
            .any(|s| s.lease.is_some() && s.chunk.offset < end && offset < s.chunk.end());
        if overlaps_lease {
            return Err(ChunkError::AlreadyClaimed { offset, length });
        }

        let index = self
            .slots
            .iter()
            .position(|s| s.chunk.offset <= offset && end <= s.chunk.end())
            .ok_or(ChunkError::NotOutstanding { offset, length })?;

        let id = LeaseId(self.next_lease);
        self.next_lease += 1;

        let original = self.slots.remove(index);
        let mut pieces = Vec::with_capacity(3);
        if original.chunk.offset < offset {
            pieces.push(Slot {
                chunk: Chunk {
                    offset: original.chunk.offset,
                    length: offset - original.chunk.offset,
                    ..original.chunk.clone()
                },
                lease: None,
                not_before: original.not_before,
            });
        }
        pieces.push(Slot {
            chunk: Chunk {
                offset,
                length,
                url_index,
                retries: original.chunk.retries,
            },
            lease: Some(id),
            not_before: None,
        });
        if end < original.chunk.end() {
            pieces.push(Slot {
                chunk: Chunk {
                    offset: end,
                    length: original.chunk.end() - end,
                    ..original.chunk.clone()
                },
                lease: None,
                not_before: original.not_before,
            });
        }
        for (i, piece) in pieces.into_iter().enumerate() {
            self.slots.insert(index + i, piece);
        }

        debug!("租用分片: {:?} bytes={}-{} url#{}", id, offset, end - 1, url_index);
        debug_assert!(self.check_invariant());

        Ok(Lease {
            id,
            offset,
            length,
            url_index,
        })
    }

    /// 租用下一个可调度的分片，链接由 `select_url` 决定
    ///
    /// `select_url` 返回 None 表示该分片当前没有可用链接
    pub fn claim_next<F>(&mut self, now: Instant, mut select_url: F) -> Option<Lease>
    where
        F: FnMut(&Chunk) -> Option<usize>,
    {
        let chunk = self.next_claimable(now)?.clone();
        let url_index = select_url(&chunk)?;
        self.claim(chunk.offset, chunk.length, url_index).ok()
    }

    /// 持久化用的快照（即全部未完成分片）
    pub fn snapshot(&self) -> Vec<Chunk> {
        self.outstanding()
    }

    /// 记录租约已落盘的字节（租约起点前移）
    pub fn advance(&mut self, lease: LeaseId, bytes: u64) -> Result<(), ChunkError> {
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.lease == Some(lease))
            .ok_or(ChunkError::UnknownLease(lease))?;

        if bytes > slot.chunk.length {
            return Err(ChunkError::Overrun { lease, bytes });
        }

        slot.chunk.offset += bytes;
        slot.chunk.length -= bytes;
        self.received += bytes;

        debug_assert!(self.check_invariant());
        Ok(())
    }

    /// 租约完成：移除剩余范围并计入已接收，返回新计入的字节数
    pub fn commit(&mut self, lease: LeaseId) -> Result<u64, ChunkError> {
        let index = self
            .slots
            .iter()
            .position(|s| s.lease == Some(lease))
            .ok_or(ChunkError::UnknownLease(lease))?;

        let slot = self.slots.remove(index);
        self.received += slot.chunk.length;

        debug_assert!(self.check_invariant());
        Ok(slot.chunk.length)
    }

    /// 归还租约，剩余范围重新进入待下载池
    ///
    /// 如果租约的字节已经全部落盘，直接移除并返回 None
    pub fn release(
        &mut self,
        lease: LeaseId,
        not_before: Option<Instant>,
    ) -> Result<Option<&mut Chunk>, ChunkError> {
        let index = self
            .slots
            .iter()
            .position(|s| s.lease == Some(lease))
            .ok_or(ChunkError::UnknownLease(lease))?;

        if self.slots[index].chunk.length == 0 {
            self.slots.remove(index);
            return Ok(None);
        }

        let slot = &mut self.slots[index];
        slot.lease = None;
        slot.not_before = not_before;
        Ok(Some(&mut slot.chunk))
    }

    /// 归还所有租约（暂停时使用），返回归还数量
    pub fn release_all(&mut self) -> usize {
        self.slots.retain(|s| s.lease.is_none() || s.chunk.length > 0);
        let mut released = 0;
        for slot in &mut self.slots {
            if slot.lease.take().is_some() {
                released += 1;
            }
            slot.not_before = None;
        }
        released
    }

    /// 清零所有重试计数（任务重新开始时）
    pub fn reset_retries(&mut self) {
        for slot in &mut self.slots {
            slot.chunk.retries = 0;
            slot.not_before = None;
        }
    }

    /// 检查不变量：分片有序不重叠，已接收 + 未完成 == 文件大小
    pub fn check_invariant(&self) -> bool {
        let mut cursor = 0u64;
        let mut outstanding = 0u64;
        for slot in &self.slots {
            if slot.chunk.offset < cursor || slot.chunk.end() > self.size {
                return false;
            }
            cursor = slot.chunk.end();
            outstanding += slot.chunk.length;
        }
        self.received + outstanding == self.size
    }
}
