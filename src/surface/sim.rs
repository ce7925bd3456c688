//! 进程内消费者模拟器
//!
//! 真实的消费者是另一个进程；开发和测试时用这个模拟器顶替：
//! 创建共享区域、批准 resize 请求（以区域容量为上限）、
//! 在 IPC 锁内排空已发布的音频、统计信号和 flush 事件。
//! 它不属于稳态数据路径，只是一个可观测的对端。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::{unlink, SurfaceConnection, SurfaceError, SurfaceEvent};

/// 消费者轮询间隔
const POLL_INTERVAL: Duration = Duration::from_micros(200);

/// 模拟消费者统计
#[derive(Default)]
struct SimCounters {
    drained_bytes: AtomicU64,
    flush_events: AtomicU64,
    resize_grants: AtomicU64,
}

/// 共享表面消费者模拟器
pub struct SurfaceSim {
    name: String,
    conn: Arc<SurfaceConnection>,
    stop: Arc<AtomicBool>,
    counters: Arc<SimCounters>,
    thread: Option<JoinHandle<()>>,
}

impl SurfaceSim {
    /// 创建共享区域并启动消费者线程
    pub fn create(audio_capacity: usize) -> Result<Self, SurfaceError> {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let name = format!(
            "/surfmix-sim-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        );

        let conn = Arc::new(SurfaceConnection::create(&name, audio_capacity)?);
        let stop = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(SimCounters::default());

        let thread = {
            let conn = Arc::clone(&conn);
            let stop = Arc::clone(&stop);
            let counters = Arc::clone(&counters);
            thread::Builder::new()
                .name("surface-sim".to_string())
                .spawn(move || Self::consumer_main(conn, stop, counters))
                .expect("Failed to spawn simulator thread")
        };

        log::debug!("Surface simulator started at {}", name);
        Ok(Self {
            name,
            conn,
            stop,
            counters,
            thread: Some(thread),
        })
    }

    /// 消费者主循环
    fn consumer_main(conn: Arc<SurfaceConnection>, stop: Arc<AtomicBool>, counters: Arc<SimCounters>) {
        let header = conn.header();
        let capacity = header.abuf_capacity.load(Ordering::Acquire);

        while !stop.load(Ordering::Acquire) {
            // resize 请求：置起旁路标志，按容量上限批准，再确认
            let req = header.resize_req_seq.load(Ordering::Acquire);
            if req != header.resize_ack_seq.load(Ordering::Acquire) {
                let requested = header.resize_req_size.load(Ordering::Relaxed);
                let granted = requested.min(capacity);

                header.resize_pending.store(1, Ordering::Relaxed);
                header.abuf_size.store(granted, Ordering::Release);
                header
                    .abuf_count
                    .store(header.resize_req_count.load(Ordering::Relaxed), Ordering::Release);
                header.abuf_used.store(0, Ordering::Relaxed);
                header.resize_ack_seq.store(req, Ordering::Release);
                header.resize_pending.store(0, Ordering::Relaxed);

                counters.resize_grants.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "Simulator granted audio buffer: requested {}, granted {}",
                    requested,
                    granted
                );
            }

            // 排空已发布的音频
            if let Some(_guard) = conn.try_lock() {
                let used = header.abuf_used.load(Ordering::Relaxed);
                if used > 0 {
                    counters
                        .drained_bytes
                        .fetch_add(used as u64, Ordering::Relaxed);
                    header.abuf_used.store(0, Ordering::Relaxed);
                }
            }

            // 控制事件
            while let Some(event) = conn.take_event() {
                match event {
                    SurfaceEvent::FlushAudio => {
                        counters.flush_events.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }

            thread::sleep(POLL_INTERVAL);
        }
    }

    /// 共享区域名字
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 建立一个客户端连接（后端侧映射）
    pub fn client_connection(&self) -> Result<SurfaceConnection, SurfaceError> {
        SurfaceConnection::connect(&self.name)
    }

    /// 直接控制旁路 resize 标志（测试用）
    pub fn set_resize_pending(&self, on: bool) {
        self.conn
            .header()
            .resize_pending
            .store(on as u8, Ordering::Relaxed);
    }

    /// 已排空的音频字节数
    pub fn drained_bytes(&self) -> u64 {
        self.counters.drained_bytes.load(Ordering::Relaxed)
    }

    /// 收到的 flush 事件数
    pub fn flush_events(&self) -> u64 {
        self.counters.flush_events.load(Ordering::Relaxed)
    }

    /// 批准过的 resize 请求数
    pub fn resize_grants(&self) -> u64 {
        self.counters.resize_grants.load(Ordering::Relaxed)
    }
}

impl Drop for SurfaceSim {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        unlink(&self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 轮询等待条件成立，超时报错
    fn wait_for(mut cond: impl FnMut() -> bool, what: &str) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
        panic!("timed out waiting for {what}");
    }

    #[test]
    fn test_sim_grants_resize() {
        let sim = SurfaceSim::create(64 * 1024).expect("sim");
        let client = sim.client_connection().expect("connect");

        client.negotiate_buffer(4, 480).expect("negotiation");
        let geo = client.geometry();
        assert!(geo.abuf_size >= 4 * 480);
        assert_eq!(geo.abuf_count, 4);
        assert_eq!(sim.resize_grants(), 1);
    }

    #[test]
    fn test_sim_rejects_oversized_request() {
        // 容量不足以容纳请求：授予被钳到容量，协商复核失败
        let sim = SurfaceSim::create(1024).expect("sim");
        let client = sim.client_connection().expect("connect");

        let err = client.negotiate_buffer(4, 480).unwrap_err();
        assert!(matches!(err, SurfaceError::BufferTooSmall { need: 1920, .. }));
    }

    #[test]
    fn test_sim_drains_published_audio() {
        let sim = SurfaceSim::create(64 * 1024).expect("sim");
        let client = sim.client_connection().expect("connect");
        client.negotiate_buffer(4, 256).expect("negotiation");

        let chunk = 4 * 256;
        let mut published = 0u64;
        for _ in 0..4 {
            if client.publish_chunk(chunk, |dst| dst.fill(0x7F)) {
                published += chunk as u64;
            }
            thread::sleep(Duration::from_millis(2));
        }
        assert!(published > 0);

        wait_for(
            || sim.drained_bytes() >= chunk as u64,
            "consumer to drain published audio",
        );
        // 消费者只能看到整 chunk
        assert_eq!(sim.drained_bytes() % chunk as u64, 0);
    }

    #[test]
    fn test_sim_counts_flush_events() {
        let sim = SurfaceSim::create(4096).expect("sim");
        let client = sim.client_connection().expect("connect");

        assert!(client.enqueue_event(SurfaceEvent::FlushAudio));
        wait_for(|| sim.flush_events() == 1, "flush event to be consumed");
    }
}
