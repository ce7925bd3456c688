//! 共享表面回放后端
//!
//! 生命周期状态机：STOPPED → RUNNING → STOPPING → STOPPED。
//! `start` 清除取消标志并以提升的调度优先级启动命名后台任务；
//! `stop` 置位标志并等待任务退出（无超时的 join——任务若卡在
//! 表面锁上，这里会一直等，已知的活性风险）。
//!
//! 任务内的失败（表面缺失、协商失败、时钟读取失败）只通过日志
//! 和任务退出报告，不会同步回传给 `start` 的调用方。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam_utils::CachePadded;
use thiserror::Error;

use crate::audio::clock;
use crate::audio::format::{AudioFormat, ChannelLayout, SampleFormat};
use crate::audio::mixer::ChunkMixer;
use crate::audio::stats::MixStats;
use crate::surface::{self, SurfaceError, SurfaceEvent};

use super::pacing::{ChunkPacer, PaceStep};
use super::{BackendError, DeviceDescriptor, PlaybackBackend, SURFACE_DEVICE_NAME, SURFACE_SAMPLE_RATE};

/// 后台任务名（日志和调试器里可见）
const MIXER_TASK_NAME: &str = "surface-mixer";

/// 混音任务内部错误
///
/// 这些错误发生在后台任务里，只记日志，不回传 `start` 的调用方
#[derive(Debug, Error)]
enum MixerTaskError {
    #[error("no shared surface is connected")]
    NoSurface,
    #[error("monotonic clock read failed")]
    ClockRead,
    #[error("buffer negotiation failed: {0}")]
    Negotiate(#[from] SurfaceError),
}

/// 共享表面回放后端
pub struct SurfaceBackend {
    pub(crate) device: DeviceDescriptor,
    mixer: Arc<Mutex<Box<dyn ChunkMixer>>>,
    /// 取消标志：独占缓存行，混音任务每轮循环读取
    kill_now: Arc<CachePadded<AtomicBool>>,
    task: Option<JoinHandle<()>>,
    stats: Arc<MixStats>,
}

impl SurfaceBackend {
    pub fn new(mixer: Box<dyn ChunkMixer>) -> Self {
        Self {
            device: DeviceDescriptor::default(),
            mixer: Arc::new(Mutex::new(mixer)),
            kill_now: Arc::new(CachePadded::new(AtomicBool::new(false))),
            task: None,
            stats: Arc::new(MixStats::new()),
        }
    }

    /// 覆盖混音周期大小（帧）；须在 `start` 之前调用
    pub fn set_chunk_frames(&mut self, frames: usize) {
        self.device.chunk_frames = frames;
    }

    /// 设备描述符
    pub fn device(&self) -> &DeviceDescriptor {
        &self.device
    }

    /// 混音统计
    pub fn stats(&self) -> Arc<MixStats> {
        Arc::clone(&self.stats)
    }
}

impl PlaybackBackend for SurfaceBackend {
    fn open(&mut self, name: Option<&str>) -> Result<(), BackendError> {
        match name {
            None => Ok(()),
            Some(n) if n == SURFACE_DEVICE_NAME => Ok(()),
            Some(other) => Err(BackendError::InvalidDeviceName(other.to_string())),
        }
    }

    fn reset(&mut self) -> Result<(), BackendError> {
        let conn = surface::primary().ok_or(BackendError::SurfaceUnavailable)?;

        // 表面只接受这一种格式
        self.device.format = AudioFormat::new(
            SURFACE_SAMPLE_RATE,
            ChannelLayout::Stereo,
            SampleFormat::S16,
        );

        conn.reset_cursor();
        conn.enqueue_event(SurfaceEvent::FlushAudio);
        Ok(())
    }

    fn start(&mut self) -> Result<(), BackendError> {
        if self.task.is_some() {
            log::debug!("Mixer task already running");
            return Ok(());
        }

        self.kill_now.store(false, Ordering::Release);
        self.stats.reset();

        let device = self.device.clone();
        let mixer = Arc::clone(&self.mixer);
        let kill_now = Arc::clone(&self.kill_now);
        let stats = Arc::clone(&self.stats);

        let task = thread::Builder::new()
            .name(MIXER_TASK_NAME.to_string())
            .spawn(move || {
                if let Err(e) = mixer_task(device, mixer, kill_now, stats) {
                    log::error!("Mixer task aborted: {}", e);
                }
            })?;

        self.task = Some(task);
        Ok(())
    }

    fn stop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };

        self.kill_now.store(true, Ordering::Release);
        if task.join().is_err() {
            log::error!("Mixer task panicked");
        }
        self.kill_now.store(false, Ordering::Release);

        log::debug!("{}", self.stats.report());
    }
}

impl Drop for SurfaceBackend {
    fn drop(&mut self) {
        self.stop();
    }
}

/// 混音任务主函数
///
/// 失败路径统一：提前返回错误，由外层记录日志后任务退出。
/// 不做任何自动重试。
fn mixer_task(
    device: DeviceDescriptor,
    mixer: Arc<Mutex<Box<dyn ChunkMixer>>>,
    kill_now: Arc<CachePadded<AtomicBool>>,
    stats: Arc<MixStats>,
) -> Result<(), MixerTaskError> {
    let conn = surface::primary().ok_or(MixerTaskError::NoSurface)?;

    rt::promote_mixer_thread();

    let frame_size = device.frame_size();
    let chunk_frames = device.chunk_frames;
    let chunk_bytes = frame_size * chunk_frames;

    // 稳态发布前必须保证缓冲区够大；协商不下来就放弃启动
    conn.negotiate_buffer(frame_size, chunk_frames)?;

    log::info!(
        "Mixer task started: {} Hz, {} frames/chunk, {} bytes/frame",
        device.format.sample_rate,
        chunk_frames,
        frame_size
    );

    let mut mixer = mixer.lock().unwrap_or_else(PoisonError::into_inner);

    let start_ns = clock::now_ns().ok_or(MixerTaskError::ClockRead)?;
    let mut pacer = ChunkPacer::new(start_ns, device.format.sample_rate, chunk_frames);
    let rest = pacer.rest_duration();

    while !kill_now.load(Ordering::Acquire) && device.is_connected() {
        let now = clock::now_ns().ok_or(MixerTaskError::ClockRead)?;

        match pacer.step(now) {
            PaceStep::Wait => thread::sleep(rest),
            PaceStep::Due(due) => {
                let mut published = 0;
                while published < due && !kill_now.load(Ordering::Acquire) {
                    // 消费者正在 resize 时让出而不是抢锁：这个任务通常跑在
                    // 提升过的优先级上，无条件等锁可能把对方的 resize 饿死。
                    // 让出循环本身有优先级反转的风险——有意保留的取舍。
                    if conn.resize_pending() {
                        stats.record_resize_wait();
                        while conn.resize_pending() && !kill_now.load(Ordering::Acquire) {
                            thread::yield_now();
                        }
                    }

                    // 锁内直接往共享缓冲区渲染；拿不到锁就跳过这个
                    // chunk 重试，绝不阻塞等待
                    let ok = conn.publish_chunk(chunk_bytes, |dst| {
                        mixer.mix_chunk(dst, chunk_frames)
                    });
                    if ok {
                        pacer.chunk_published();
                        stats.record_chunk(chunk_frames as u64);
                        published += 1;
                    } else {
                        stats.record_lock_miss();
                    }
                }
            }
        }
    }

    stats.record_clock_clamps(pacer.clamp_count());
    log::debug!(
        "Mixer task exiting after {} chunks",
        stats.chunks_published()
    );
    Ok(())
}

/// 混音任务调度优先级提升
mod rt {
    /// Linux：尝试 SCHED_RR 实时调度，无权限时回退到降 nice
    #[cfg(target_os = "linux")]
    pub fn promote_mixer_thread() {
        const MIXER_RT_PRIORITY: libc::c_int = 60;

        unsafe {
            let param = libc::sched_param {
                sched_priority: MIXER_RT_PRIORITY,
            };
            if libc::sched_setscheduler(0, libc::SCHED_RR, &param) == 0 {
                log::debug!("Mixer task scheduled SCHED_RR, priority {}", MIXER_RT_PRIORITY);
                return;
            }

            if libc::setpriority(libc::PRIO_PROCESS as _, 0, -10) == 0 {
                log::debug!("Mixer task nice value set to -10");
            } else {
                log::warn!(
                    "Mixer task running at default priority: {}",
                    std::io::Error::last_os_error()
                );
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub fn promote_mixer_thread() {
        log::debug!("Thread priority elevation not implemented on this platform");
    }
}
