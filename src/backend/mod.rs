//! 回放后端接口
//!
//! 宿主框架通过 trait 对象持有后端（每种后端一个实现，本 crate
//! 只提供共享表面这一种）。capture 一律走默认失败实现。

pub mod pacing;
pub mod surface;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::audio::format::{AudioFormat, ChannelLayout, SampleFormat};
use crate::audio::mixer::ChunkMixer;

pub use surface::SurfaceBackend;

/// 唯一支持的逻辑设备名
pub const SURFACE_DEVICE_NAME: &str = "surface";

/// 表面强制的采样率
pub const SURFACE_SAMPLE_RATE: u32 = 48_000;

/// 默认 chunk 大小（帧）；宿主混音库可覆盖
pub const DEFAULT_CHUNK_FRAMES: usize = 1024;

/// 后端类型
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    Playback,
    Capture,
}

/// 设备枚举目标
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeTarget {
    Playback,
    Capture,
}

/// 后端错误
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("unsupported device name: {0}")]
    InvalidDeviceName(String),
    #[error("shared surface is not reachable")]
    SurfaceUnavailable,
    #[error("capture is not supported by this backend")]
    CaptureUnsupported,
    #[error("failed to spawn mixer task: {0}")]
    TaskSpawn(#[from] std::io::Error),
}

/// 设备描述符
///
/// `reset` 之后视为只读；连接存活标志由宿主侧翻转，
/// 混音任务每轮循环检查一次。
#[derive(Clone)]
pub struct DeviceDescriptor {
    pub name: String,
    pub format: AudioFormat,
    /// 每个混音周期渲染的帧数
    pub chunk_frames: usize,
    connected: Arc<AtomicBool>,
}

impl DeviceDescriptor {
    pub fn new(name: &str, format: AudioFormat, chunk_frames: usize) -> Self {
        Self {
            name: name.to_string(),
            format,
            chunk_frames,
            connected: Arc::new(AtomicBool::new(true)),
        }
    }

    /// 每帧字节数（由声道布局和采样格式推导）
    #[inline]
    pub fn frame_size(&self) -> usize {
        self.format.bytes_per_frame()
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// 宿主侧通知设备断开
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }
}

impl Default for DeviceDescriptor {
    fn default() -> Self {
        Self::new(
            SURFACE_DEVICE_NAME,
            AudioFormat::new(
                SURFACE_SAMPLE_RATE,
                ChannelLayout::Stereo,
                SampleFormat::S16,
            ),
            DEFAULT_CHUNK_FRAMES,
        )
    }
}

/// 回放后端
///
/// capture 操作由默认实现统一拒绝；本 crate 不提供录音。
pub trait PlaybackBackend: Send {
    /// 打开设备；`None` 使用唯一支持的逻辑设备名
    fn open(&mut self, name: Option<&str>) -> Result<(), BackendError>;

    /// 固定设备格式并通知消费者清空已排队音频
    fn reset(&mut self) -> Result<(), BackendError>;

    /// 启动混音任务
    fn start(&mut self) -> Result<(), BackendError>;

    /// 停止混音任务；已停止时为 no-op
    fn stop(&mut self);

    /// 关闭设备（无资源需要释放）
    fn close(&mut self) {}

    fn capture_samples(&mut self, _out: &mut [u8]) -> Result<usize, BackendError> {
        Err(BackendError::CaptureUnsupported)
    }

    fn available_capture_samples(&self) -> usize {
        0
    }
}

/// 后端工厂
pub trait BackendFactory {
    fn init(&self) -> bool {
        true
    }

    /// 本工厂是否支持该类后端
    fn query_support(&self, kind: BackendKind) -> bool;

    /// 枚举逻辑设备名
    fn probe(&self, target: ProbeTarget) -> Vec<String>;

    /// 创建后端实例；不支持的类型返回 None
    fn create(
        &self,
        mixer: Box<dyn ChunkMixer>,
        kind: BackendKind,
    ) -> Option<Box<dyn PlaybackBackend>>;
}

/// 共享表面后端工厂
pub struct SurfaceFactory;

impl BackendFactory for SurfaceFactory {
    fn query_support(&self, kind: BackendKind) -> bool {
        kind == BackendKind::Playback
    }

    fn probe(&self, target: ProbeTarget) -> Vec<String> {
        match target {
            ProbeTarget::Playback => vec![SURFACE_DEVICE_NAME.to_string()],
            ProbeTarget::Capture => Vec::new(),
        }
    }

    fn create(
        &self,
        mixer: Box<dyn ChunkMixer>,
        kind: BackendKind,
    ) -> Option<Box<dyn PlaybackBackend>> {
        match kind {
            BackendKind::Playback => Some(Box::new(SurfaceBackend::new(mixer))),
            BackendKind::Capture => None,
        }
    }
}
