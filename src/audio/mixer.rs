//! 宿主混音原语接口
//!
//! 后端不关心样本从哪里来：宿主混音库通过 [`ChunkMixer`] 注入
//! "向这个缓冲区渲染一个 chunk" 的能力。格式转换由混音库负责，
//! 后端只按协商好的帧大小提供目标缓冲区。

use std::f32::consts::TAU;

use super::format::{write_s16_frames, AudioFormat, SampleFormat};

/// 混音原语
///
/// `mix_chunk` 直接在共享缓冲区的切片上渲染，调用时 IPC 锁已持有，
/// 实现中不应阻塞或分配。
pub trait ChunkMixer: Send {
    /// 渲染 `frames` 帧到 `out`
    ///
    /// `out.len()` 等于 `frames * bytes_per_frame`
    fn mix_chunk(&mut self, out: &mut [u8], frames: usize);
}

/// 静音混音器
pub struct SilenceMixer;

impl ChunkMixer for SilenceMixer {
    fn mix_chunk(&mut self, out: &mut [u8], _frames: usize) {
        out.fill(0);
    }
}

/// 正弦测试音混音器
///
/// 诊断工具和测试用；只支持 S16 输出（表面的固定格式）。
pub struct ToneMixer {
    format: AudioFormat,
    freq: f32,
    amplitude: f32,
    phase: f32,
    /// 预分配的 i16 暂存区，避免渲染路径上的重复分配
    scratch: Vec<i16>,
}

impl ToneMixer {
    pub fn new(format: AudioFormat, freq: f32, amplitude: f32) -> Self {
        debug_assert_eq!(format.sample_format, SampleFormat::S16);
        Self {
            format,
            freq,
            amplitude: amplitude.clamp(0.0, 1.0),
            phase: 0.0,
            scratch: Vec::new(),
        }
    }
}

impl ChunkMixer for ToneMixer {
    fn mix_chunk(&mut self, out: &mut [u8], frames: usize) {
        let channels = self.format.samples_per_frame();
        let step = self.freq * TAU / self.format.sample_rate as f32;

        self.scratch.clear();
        self.scratch.resize(frames * channels, 0);

        for frame in 0..frames {
            let value = self.phase.sin() * self.amplitude;
            let sample = (value * i16::MAX as f32) as i16;
            for ch in 0..channels {
                self.scratch[frame * channels + ch] = sample;
            }
            self.phase += step;
            if self.phase > TAU {
                self.phase -= TAU;
            }
        }

        write_s16_frames(&self.scratch, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::format::ChannelLayout;

    fn stereo_s16() -> AudioFormat {
        AudioFormat::new(48000, ChannelLayout::Stereo, SampleFormat::S16)
    }

    #[test]
    fn test_silence_is_zero() {
        let mut mixer = SilenceMixer;
        let mut out = [0xFFu8; 64];
        mixer.mix_chunk(&mut out, 16);
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_tone_produces_signal() {
        let mut mixer = ToneMixer::new(stereo_s16(), 440.0, 0.5);
        let mut out = vec![0u8; 256 * 4];
        mixer.mix_chunk(&mut out, 256);

        // 256 帧 440Hz 正弦不可能全零
        assert!(out.iter().any(|&b| b != 0), "tone output should be non-zero");
    }

    #[test]
    fn test_tone_duplicates_channels() {
        let mut mixer = ToneMixer::new(stereo_s16(), 1000.0, 0.8);
        let mut out = vec![0u8; 64 * 4];
        mixer.mix_chunk(&mut out, 64);

        // 同一帧内左右声道相同
        for frame in out.chunks_exact(4) {
            assert_eq!(frame[0..2], frame[2..4]);
        }
    }
}
