//! 混音任务统计
//!
//! 在混音任务内收集计数，全部使用 Relaxed 原子操作，
//! 不在发布路径上引入同步开销。

use std::sync::atomic::{AtomicU64, Ordering};

/// 混音统计收集器
///
/// 所有操作都是 lock-free 的，适合在混音任务内调用
#[derive(Default)]
pub struct MixStats {
    chunks_published: AtomicU64,
    frames_done: AtomicU64,
    /// IPC 锁竞争导致的跳过次数
    lock_misses: AtomicU64,
    /// 因消费者 resize 而让出的等待次数
    resize_waits: AtomicU64,
    /// 时钟回跳钳制次数
    clock_clamps: AtomicU64,
}

impl MixStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一次成功发布
    #[inline]
    pub fn record_chunk(&self, frames: u64) {
        self.chunks_published.fetch_add(1, Ordering::Relaxed);
        self.frames_done.fetch_add(frames, Ordering::Relaxed);
    }

    /// 记录一次因锁竞争被跳过的发布尝试
    #[inline]
    pub fn record_lock_miss(&self) {
        self.lock_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// 记录一次 resize 让出等待
    #[inline]
    pub fn record_resize_wait(&self) {
        self.resize_waits.fetch_add(1, Ordering::Relaxed);
    }

    /// 记录时钟回跳钳制
    #[inline]
    pub fn record_clock_clamps(&self, count: u64) {
        self.clock_clamps.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn chunks_published(&self) -> u64 {
        self.chunks_published.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn frames_done(&self) -> u64 {
        self.frames_done.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn lock_misses(&self) -> u64 {
        self.lock_misses.load(Ordering::Relaxed)
    }

    /// 生成报告
    pub fn report(&self) -> StatsReport {
        StatsReport {
            chunks_published: self.chunks_published.load(Ordering::Relaxed),
            frames_done: self.frames_done.load(Ordering::Relaxed),
            lock_misses: self.lock_misses.load(Ordering::Relaxed),
            resize_waits: self.resize_waits.load(Ordering::Relaxed),
            clock_clamps: self.clock_clamps.load(Ordering::Relaxed),
        }
    }

    /// 重置统计
    pub fn reset(&self) {
        self.chunks_published.store(0, Ordering::Relaxed);
        self.frames_done.store(0, Ordering::Relaxed);
        self.lock_misses.store(0, Ordering::Relaxed);
        self.resize_waits.store(0, Ordering::Relaxed);
        self.clock_clamps.store(0, Ordering::Relaxed);
    }
}

/// 统计报告
#[derive(Debug, Clone)]
pub struct StatsReport {
    pub chunks_published: u64,
    pub frames_done: u64,
    pub lock_misses: u64,
    pub resize_waits: u64,
    pub clock_clamps: u64,
}

impl std::fmt::Display for StatsReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Mixer Statistics")?;
        writeln!(f, "================")?;
        writeln!(f, "Chunks published: {}", self.chunks_published)?;
        writeln!(f, "Frames done: {}", self.frames_done)?;
        writeln!(f, "Skipped (lock contention): {}", self.lock_misses)?;
        writeln!(f, "Resize waits: {}", self.resize_waits)?;
        writeln!(f, "Clock clamps: {}", self.clock_clamps)?;
        Ok(())
    }
}
