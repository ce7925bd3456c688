//! Surfmix - 共享内存表面音频回放后端
//!
//! 将宿主混音原语的输出周期性地渲染并发布到一个由外部消费者进程
//! 持有的共享内存音频缓冲区。
//!
//! 设计目标：
//! - 时序稳定：基于单调时钟推导应产出的 chunk 数，不做固定周期 sleep
//! - 跨进程同步最小化：IPC 锁只覆盖缓冲协商和单个 chunk 的发布
//! - 协作式取消：后台混音任务在固定检查点轮询取消标志

pub mod audio;
pub mod backend;
pub mod surface;
