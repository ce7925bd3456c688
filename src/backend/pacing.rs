//! chunk 节奏推导
//!
//! 应产出的 chunk 数从"经过的真实时间折算成帧数"推导，
//! 不依赖固定周期 sleep，长时间运行不累积漂移。
//! 纯算术状态机，时间戳由调用方注入。

use std::time::Duration;

use crate::audio::clock;

/// 一次节奏判定的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaceStep {
    /// 不足一个 chunk 到期：睡半个 chunk 的标称时长后重试
    Wait,
    /// 当前到期的完整 chunk 数
    Due(u64),
}

/// chunk 节奏状态
///
/// `done` 是累计已发布帧数；`avail` 每次从起始时间戳重新推导。
pub struct ChunkPacer {
    start_ns: u64,
    done: u64,
    sample_rate: u32,
    chunk_frames: u64,
    clamps: u64,
}

impl ChunkPacer {
    pub fn new(start_ns: u64, sample_rate: u32, chunk_frames: usize) -> Self {
        Self {
            start_ns,
            done: 0,
            sample_rate,
            chunk_frames: chunk_frames as u64,
            clamps: 0,
        }
    }

    /// 到期不足一个 chunk 时的休息时长：半个 chunk 的标称时间
    pub fn rest_duration(&self) -> Duration {
        clock::chunk_duration(self.chunk_frames as usize, self.sample_rate) / 2
    }

    /// 根据当前时间戳判定应产出多少 chunk
    ///
    /// 时钟回跳（如睡眠唤醒后）时把 `done` 钳到 `avail - chunk_frames`，
    /// 把追赶量收敛到最多一个 chunk，避免爆发式补发。
    pub fn step(&mut self, now_ns: u64) -> PaceStep {
        let elapsed = now_ns.saturating_sub(self.start_ns);
        let avail = clock::ns_to_frames(elapsed, self.sample_rate);

        if avail < self.done {
            self.done = avail.saturating_sub(self.chunk_frames);
            self.clamps += 1;
        }

        let due = avail - self.done;
        if due < self.chunk_frames {
            PaceStep::Wait
        } else {
            PaceStep::Due(due / self.chunk_frames)
        }
    }

    /// 记录一个 chunk 已发布
    pub fn chunk_published(&mut self) {
        self.done += self.chunk_frames;
    }

    /// 累计已发布帧数
    pub fn frames_done(&self) -> u64 {
        self.done
    }

    /// 时钟回跳钳制次数
    pub fn clamp_count(&self) -> u64 {
        self.clamps
    }
}
