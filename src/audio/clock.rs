//! 单调时钟读取和时间/帧数换算
//!
//! 混音任务的节奏完全由"经过的真实时间折算成帧数"驱动，
//! 因此时钟读取失败必须显式暴露给调用方，而不是悄悄返回 0。

use std::time::Duration;

/// 读取单调时钟，返回纳秒
///
/// `clock_gettime` 理论上可能失败（返回 -1）；
/// 失败返回 None，由调用方决定终止策略。
pub fn now_ns() -> Option<u64> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if rc != 0 {
        return None;
    }
    Some(ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64)
}

/// 纳秒 → 帧数（向下取整）
///
/// 中间用 u128 计算，避免长时间运行时 ns * rate 溢出 u64
#[inline]
pub fn ns_to_frames(ns: u64, sample_rate: u32) -> u64 {
    (ns as u128 * sample_rate as u128 / 1_000_000_000) as u64
}

/// 帧数 → 纳秒（向下取整）
#[inline]
pub fn frames_to_ns(frames: u64, sample_rate: u32) -> u64 {
    (frames as u128 * 1_000_000_000 / sample_rate as u128) as u64
}

/// 一个 chunk 的标称时长
#[inline]
pub fn chunk_duration(chunk_frames: usize, sample_rate: u32) -> Duration {
    Duration::from_nanos(frames_to_ns(chunk_frames as u64, sample_rate))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_advances() {
        let t1 = now_ns().expect("monotonic clock should be readable");
        std::thread::sleep(Duration::from_millis(10));
        let t2 = now_ns().expect("monotonic clock should be readable");

        let diff = t2 - t1;
        // 至少 8ms（给调度留余量）
        assert!(diff >= 8_000_000, "expected at least 8ms, got {}ns", diff);
    }

    #[test]
    fn test_frame_conversions() {
        // 480 帧 @ 48kHz = 10ms，整除无误差
        assert_eq!(frames_to_ns(480, 48000), 10_000_000);
        assert_eq!(ns_to_frames(10_000_000, 48000), 480);

        // 向下取整
        assert_eq!(ns_to_frames(9_999_999, 48000), 479);

        assert_eq!(
            chunk_duration(480, 48000),
            Duration::from_millis(10),
        );
    }

    #[test]
    fn test_conversion_no_overflow() {
        // 一周的纳秒数也不应溢出
        let week_ns: u64 = 7 * 24 * 3600 * 1_000_000_000;
        let frames = ns_to_frames(week_ns, 192_000);
        assert_eq!(frames, 7 * 24 * 3600 * 192_000);
    }
}
