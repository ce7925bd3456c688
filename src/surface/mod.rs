//! 共享表面客户端
//!
//! 外部消费者进程持有一块共享内存区域：一页控制头 + 固定容量的
//! 音频字节区。本模块负责映射该区域并提供后端需要的全部原语：
//! - 作用域 IPC 锁（头部的 CAS 锁字，与消费者进程共享）
//! - 缓冲区协商（请求/确认序号 + 事后复核）
//! - chunk 发布（锁内写入 + 游标推进 + 数据就绪信号）
//! - 旁路 "resize pending" 标志（仅用于协作式让出，不做正确性判断）
//!
//! 实际的内存分配归消费者所有：客户端只能请求并复核，不能假设。

pub mod sim;

use std::ffi::CString;
use std::io;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use thiserror::Error;

/// 能力协商记录的 magic 常量
///
/// 与消费者端的约定是未写入正式文档的脆弱契约：
/// 连接时校验而不是假设正确。
const SURFACE_MAGIC: u64 = 0xFEED_FACE;
/// 能力协商记录的版本号
const SURFACE_VERSION: u32 = 1;

/// 音频字节区在映射中的偏移（控制头独占一页）
const AUDIO_AREA_OFFSET: usize = 4096;

/// 协商时请求的缓冲余量（chunk 数）
const ABUF_HEADROOM_CHUNKS: u32 = 4;

/// 事件环容量（2 的幂）
const EVENT_RING_LEN: usize = 16;

/// 等待 resize 确认的上限：100 次 x 1ms
const RESIZE_ACK_POLLS: u32 = 100;

/// 锁自旋参数：短自旋 → yield → 睡眠，总计约 1 秒后放弃
const LOCK_SPIN_FAST: u32 = 64;
const LOCK_SPIN_YIELD: u32 = 1024;
const LOCK_SPIN_LIMIT: u32 = LOCK_SPIN_YIELD + 10_000;

/// 共享表面错误
#[derive(Debug, Error)]
pub enum SurfaceError {
    #[error("failed to open shared surface {name}: {source}")]
    Open { name: String, source: io::Error },
    #[error("failed to map shared surface: {0}")]
    Map(io::Error),
    #[error("shared surface region too small: {len} bytes")]
    RegionTooSmall { len: usize },
    #[error("capability record mismatch: magic {magic:#x}, version {version}")]
    BadCapability { magic: u64, version: u32 },
    #[error("timed out waiting for the surface lock")]
    LockTimeout,
    #[error("negotiated audio buffer too small: need {need} bytes, have {have}")]
    BufferTooSmall { need: usize, have: usize },
}

/// 发给消费者的控制事件
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SurfaceEvent {
    /// 请求消费者丢弃已排队的音频
    FlushAudio,
}

impl SurfaceEvent {
    fn code(self) -> u32 {
        match self {
            Self::FlushAudio => 1,
        }
    }

    fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::FlushAudio),
            _ => None,
        }
    }
}

/// 控制头：与消费者进程共享的固定布局
///
/// 除能力记录外全部字段用原子类型表达，因为两个进程会并发访问。
/// `resize_pending` 是旁路信号：消费者在 resize 过程中置位，
/// 客户端只做 Relaxed 读取并据此让出，不依赖它做任何正确性决定。
#[repr(C)]
pub(crate) struct SurfaceHeader {
    pub(crate) magic: AtomicU64,
    pub(crate) version: AtomicU32,
    /// IPC 锁字：0 = 空闲，1 = 持有
    pub(crate) lock_word: AtomicU32,
    /// 音频区固定容量（字节，创建时写入后只读）
    pub(crate) abuf_capacity: AtomicU32,
    /// 当前协商出的缓冲区大小（字节）
    pub(crate) abuf_size: AtomicU32,
    /// 缓冲余量倍数
    pub(crate) abuf_count: AtomicU32,
    /// 填充游标（字节）
    pub(crate) abuf_used: AtomicU32,
    pub(crate) resize_req_size: AtomicU32,
    pub(crate) resize_req_count: AtomicU32,
    pub(crate) resize_req_seq: AtomicU32,
    pub(crate) resize_ack_seq: AtomicU32,
    /// 数据就绪信号计数
    pub(crate) signal_seq: AtomicU32,
    pub(crate) ev_head: AtomicU32,
    pub(crate) ev_tail: AtomicU32,
    /// 旁路标志：消费者正在 resize
    pub(crate) resize_pending: AtomicU8,
    _pad: [u8; 3],
    pub(crate) ev_ring: [AtomicU32; EVENT_RING_LEN],
}

// 控制头必须放得进第一页
const _: () = assert!(std::mem::size_of::<SurfaceHeader>() <= AUDIO_AREA_OFFSET);

/// 表面几何信息快照（诊断用）
#[derive(Debug, Clone, Copy)]
pub struct SurfaceGeometry {
    pub capacity: usize,
    pub abuf_size: usize,
    pub abuf_count: u32,
    pub abuf_used: usize,
}

/// 共享表面连接
///
/// 持有映射指针；跨线程共享安全性由头部原子字段和 IPC 锁保证。
#[derive(Debug)]
pub struct SurfaceConnection {
    base: *mut u8,
    map_len: usize,
}

// 裸指针本身不自动 Send/Sync；映射区的并发访问规则是：
// 头部字段全为原子，音频区只在 IPC 锁内触碰。
unsafe impl Send for SurfaceConnection {}
unsafe impl Sync for SurfaceConnection {}

impl SurfaceConnection {
    /// 打开并映射一个已存在的共享表面
    ///
    /// 校验能力记录（magic/version）和区域几何，失败即拒绝连接。
    pub fn connect(name: &str) -> Result<Self, SurfaceError> {
        let conn = Self::map_shm(name, false, 0)?;
        let header = conn.header();

        let magic = header.magic.load(Ordering::Acquire);
        let version = header.version.load(Ordering::Acquire);
        if magic != SURFACE_MAGIC || version != SURFACE_VERSION {
            return Err(SurfaceError::BadCapability { magic, version });
        }

        let capacity = header.abuf_capacity.load(Ordering::Acquire) as usize;
        if AUDIO_AREA_OFFSET + capacity > conn.map_len {
            return Err(SurfaceError::RegionTooSmall { len: conn.map_len });
        }

        log::debug!(
            "Connected to shared surface {} ({} bytes audio capacity)",
            name,
            capacity
        );
        Ok(conn)
    }

    /// 创建一个新的共享表面（消费者侧 / 测试工具使用）
    ///
    /// 初始 `abuf_size` 为 0：第一次协商必然触发 resize 请求。
    pub fn create(name: &str, audio_capacity: usize) -> Result<Self, SurfaceError> {
        let conn = Self::map_shm(name, true, AUDIO_AREA_OFFSET + audio_capacity)?;
        let header = conn.header();

        header
            .abuf_capacity
            .store(audio_capacity as u32, Ordering::Release);
        header.version.store(SURFACE_VERSION, Ordering::Release);
        header.magic.store(SURFACE_MAGIC, Ordering::Release);

        Ok(conn)
    }

    fn map_shm(name: &str, create: bool, size: usize) -> Result<Self, SurfaceError> {
        let c_name = CString::new(name).map_err(|_| SurfaceError::Open {
            name: name.to_string(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "name contains NUL"),
        })?;

        let oflag = if create {
            libc::O_CREAT | libc::O_EXCL | libc::O_RDWR
        } else {
            libc::O_RDWR
        };

        let fd = unsafe { libc::shm_open(c_name.as_ptr(), oflag, 0o600 as libc::mode_t) };
        if fd < 0 {
            return Err(SurfaceError::Open {
                name: name.to_string(),
                source: io::Error::last_os_error(),
            });
        }

        let map_len = if create {
            if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
                let err = io::Error::last_os_error();
                unsafe { libc::close(fd) };
                return Err(SurfaceError::Map(err));
            }
            size
        } else {
            let mut st: libc::stat = unsafe { std::mem::zeroed() };
            if unsafe { libc::fstat(fd, &mut st) } != 0 {
                let err = io::Error::last_os_error();
                unsafe { libc::close(fd) };
                return Err(SurfaceError::Map(err));
            }
            st.st_size as usize
        };

        if map_len < AUDIO_AREA_OFFSET {
            unsafe { libc::close(fd) };
            return Err(SurfaceError::RegionTooSmall { len: map_len });
        }

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        // 映射建立后文件描述符即可关闭
        unsafe { libc::close(fd) };

        if base == libc::MAP_FAILED {
            return Err(SurfaceError::Map(io::Error::last_os_error()));
        }

        Ok(Self {
            base: base as *mut u8,
            map_len,
        })
    }

    #[inline]
    pub(crate) fn header(&self) -> &SurfaceHeader {
        unsafe { &*(self.base as *const SurfaceHeader) }
    }

    /// 音频字节区
    ///
    /// 只允许在持有 IPC 锁时写入
    #[inline]
    fn audio_area(&self) -> &mut [u8] {
        let capacity = self.header().abuf_capacity.load(Ordering::Relaxed) as usize;
        unsafe {
            std::slice::from_raw_parts_mut(self.base.add(AUDIO_AREA_OFFSET), capacity)
        }
    }

    /// 几何信息快照
    pub fn geometry(&self) -> SurfaceGeometry {
        let h = self.header();
        SurfaceGeometry {
            capacity: h.abuf_capacity.load(Ordering::Relaxed) as usize,
            abuf_size: h.abuf_size.load(Ordering::Relaxed) as usize,
            abuf_count: h.abuf_count.load(Ordering::Relaxed),
            abuf_used: h.abuf_used.load(Ordering::Relaxed) as usize,
        }
    }

    /// 尝试获取 IPC 锁，不等待
    pub fn try_lock(&self) -> Option<SurfaceGuard<'_>> {
        self.header()
            .lock_word
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
            .then(|| SurfaceGuard { conn: self })
    }

    /// 获取 IPC 锁，有界等待
    ///
    /// 等待策略：短自旋 → yield → 睡眠，约 1 秒后放弃并报错。
    pub fn lock(&self) -> Result<SurfaceGuard<'_>, SurfaceError> {
        for spin in 0..LOCK_SPIN_LIMIT {
            if let Some(guard) = self.try_lock() {
                return Ok(guard);
            }
            if spin < LOCK_SPIN_FAST {
                std::hint::spin_loop();
            } else if spin < LOCK_SPIN_YIELD {
                thread::yield_now();
            } else {
                thread::sleep(Duration::from_micros(100));
            }
        }
        Err(SurfaceError::LockTimeout)
    }

    /// 旁路标志：消费者是否正在 resize
    ///
    /// 无同步读取，结果只用于协作式让出；
    /// 观察到的值与消费者实际动作之间的竞态是可容忍的。
    #[inline]
    pub fn resize_pending(&self) -> bool {
        self.header().resize_pending.load(Ordering::Relaxed) != 0
    }

    /// 协商音频缓冲区大小
    ///
    /// 锁内比较当前 `abuf_size` 与需求值；不一致则发出带
    /// [`ABUF_HEADROOM_CHUNKS`] 余量的 resize 请求并有界等待确认。
    /// 释放锁后复核结果大小——分配归消费者所有，必须复核而不是假设。
    pub fn negotiate_buffer(
        &self,
        frame_size: usize,
        chunk_frames: usize,
    ) -> Result<(), SurfaceError> {
        let need = frame_size * chunk_frames;
        let header = self.header();

        {
            let _guard = self.lock()?;
            if header.abuf_size.load(Ordering::Acquire) as usize != need {
                header
                    .resize_req_size
                    .store(need as u32, Ordering::Relaxed);
                header
                    .resize_req_count
                    .store(ABUF_HEADROOM_CHUNKS, Ordering::Relaxed);
                let seq = header.resize_req_seq.fetch_add(1, Ordering::AcqRel) + 1;

                // 有界等待消费者确认；超时也继续走复核路径
                for _ in 0..RESIZE_ACK_POLLS {
                    if header.resize_ack_seq.load(Ordering::Acquire) == seq {
                        break;
                    }
                    thread::sleep(Duration::from_millis(1));
                }
            }
        }

        let have = header.abuf_size.load(Ordering::Acquire) as usize;
        if have < need {
            return Err(SurfaceError::BufferTooSmall { need, have });
        }
        Ok(())
    }

    /// 发布一个 chunk
    ///
    /// try_lock 成功后把音频区的可写尾部交给 `fill` 闭包
    /// （混音原语直接渲染进共享内存），推进游标并发出数据就绪信号。
    /// 锁竞争时返回 false，游标保持不变。
    pub fn publish_chunk(&self, bytes: usize, fill: impl FnOnce(&mut [u8])) -> bool {
        let Some(_guard) = self.try_lock() else {
            return false;
        };

        let header = self.header();
        let size = header.abuf_size.load(Ordering::Relaxed) as usize;
        let used = header.abuf_used.load(Ordering::Relaxed) as usize;
        if bytes == 0 || bytes > size {
            return false;
        }

        // 消费者落后到缓冲区装不下时，从头覆盖而不是越界
        let offset = if used + bytes <= size { used } else { 0 };

        let area = self.audio_area();
        fill(&mut area[offset..offset + bytes]);

        header
            .abuf_used
            .store((offset + bytes) as u32, Ordering::Relaxed);
        header.signal_seq.fetch_add(1, Ordering::Release);
        true
    }

    /// 重置填充游标
    pub fn reset_cursor(&self) {
        self.header().abuf_used.store(0, Ordering::Relaxed);
    }

    /// 数据就绪信号计数
    pub fn signal_count(&self) -> u32 {
        self.header().signal_seq.load(Ordering::Acquire)
    }

    /// 向消费者投递控制事件
    ///
    /// 事件环满时丢弃并返回 false
    pub fn enqueue_event(&self, event: SurfaceEvent) -> bool {
        let header = self.header();
        let head = header.ev_head.load(Ordering::Acquire);
        let tail = header.ev_tail.load(Ordering::Relaxed);
        if tail.wrapping_sub(head) >= EVENT_RING_LEN as u32 {
            log::warn!("Surface event ring full, dropping {:?}", event);
            return false;
        }
        header.ev_ring[tail as usize % EVENT_RING_LEN].store(event.code(), Ordering::Relaxed);
        header.ev_tail.store(tail.wrapping_add(1), Ordering::Release);
        true
    }

    /// 取出一个待处理事件（消费者侧）
    pub fn take_event(&self) -> Option<SurfaceEvent> {
        let header = self.header();
        let head = header.ev_head.load(Ordering::Relaxed);
        let tail = header.ev_tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let code = header.ev_ring[head as usize % EVENT_RING_LEN].load(Ordering::Relaxed);
        header.ev_head.store(head.wrapping_add(1), Ordering::Release);
        SurfaceEvent::from_code(code)
    }
}

impl Drop for SurfaceConnection {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.map_len);
        }
    }
}

/// IPC 锁守卫
///
/// RAII 风格：离开作用域自动释放锁字
pub struct SurfaceGuard<'a> {
    conn: &'a SurfaceConnection,
}

impl Drop for SurfaceGuard<'_> {
    fn drop(&mut self) {
        self.conn.header().lock_word.store(0, Ordering::Release);
    }
}

/// 删除一个共享表面名字
///
/// 已建立的映射不受影响
pub fn unlink(name: &str) {
    if let Ok(c_name) = CString::new(name) {
        unsafe {
            libc::shm_unlink(c_name.as_ptr());
        }
    }
}

// =============================================================================
// 进程级 primary 连接
// =============================================================================

/// 宿主建立的进程级连接；混音任务只获取，不建立
static PRIMARY: Mutex<Option<Arc<SurfaceConnection>>> = Mutex::new(None);

/// 注册进程级 primary 连接，返回被替换的旧连接
pub fn set_primary(conn: Arc<SurfaceConnection>) -> Option<Arc<SurfaceConnection>> {
    PRIMARY
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .replace(conn)
}

/// 获取进程级 primary 连接
pub fn primary() -> Option<Arc<SurfaceConnection>> {
    PRIMARY
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// 移除并返回进程级 primary 连接
pub fn take_primary() -> Option<Arc<SurfaceConnection>> {
    PRIMARY
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32 as TestCounter;

    fn unique_name() -> String {
        static COUNTER: TestCounter = TestCounter::new(0);
        format!(
            "/surfmix-t{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        )
    }

    #[test]
    fn test_create_connect_roundtrip() {
        let name = unique_name();
        let server = SurfaceConnection::create(&name, 8192).expect("create");
        let client = SurfaceConnection::connect(&name).expect("connect");
        unlink(&name);

        let geo = client.geometry();
        assert_eq!(geo.capacity, 8192);
        assert_eq!(geo.abuf_size, 0);
        drop(server);
    }

    #[test]
    fn test_connect_rejects_bad_capability() {
        let name = unique_name();
        let server = SurfaceConnection::create(&name, 4096).expect("create");
        server.header().magic.store(0x1234, Ordering::Release);

        let err = SurfaceConnection::connect(&name).unwrap_err();
        unlink(&name);
        assert!(matches!(err, SurfaceError::BadCapability { .. }));
    }

    #[test]
    fn test_negotiate_without_consumer_fails() {
        let name = unique_name();
        let _server = SurfaceConnection::create(&name, 8192).expect("create");
        let client = SurfaceConnection::connect(&name).expect("connect");
        unlink(&name);

        // 没有消费者确认请求，复核必然失败
        let err = client.negotiate_buffer(4, 480).unwrap_err();
        match err {
            SurfaceError::BufferTooSmall { need, have } => {
                assert_eq!(need, 1920);
                assert_eq!(have, 0);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_negotiate_with_consumer() {
        let name = unique_name();
        let server = SurfaceConnection::create(&name, 64 * 1024).expect("create");
        let client = SurfaceConnection::connect(&name).expect("connect");
        unlink(&name);

        let done = std::sync::atomic::AtomicBool::new(false);
        crossbeam_utils::thread::scope(|scope| {
            let done_ref = &done;
            let server_ref = &server;

            scope.spawn(move |_| {
                // 模拟消费者：发现请求就按原样批准
                let h = server_ref.header();
                while !done_ref.load(Ordering::Acquire) {
                    let req = h.resize_req_seq.load(Ordering::Acquire);
                    if req != h.resize_ack_seq.load(Ordering::Acquire) {
                        h.abuf_size
                            .store(h.resize_req_size.load(Ordering::Relaxed), Ordering::Release);
                        h.abuf_count
                            .store(h.resize_req_count.load(Ordering::Relaxed), Ordering::Release);
                        h.resize_ack_seq.store(req, Ordering::Release);
                    }
                    thread::sleep(Duration::from_micros(200));
                }
            });

            client.negotiate_buffer(4, 480).expect("negotiation should succeed");
            done.store(true, Ordering::Release);
        })
        .expect("scope");

        let geo = client.geometry();
        assert!(geo.abuf_size >= 4 * 480, "never under-allocates");
        assert_eq!(geo.abuf_count, 4);

        // 大小已匹配时重复协商不发新请求
        let before = client.header().resize_req_seq.load(Ordering::Acquire);
        client.negotiate_buffer(4, 480).expect("renegotiation");
        let after = client.header().resize_req_seq.load(Ordering::Acquire);
        assert_eq!(before, after);
    }

    #[test]
    fn test_publish_advances_cursor_and_signals() {
        let name = unique_name();
        let server = SurfaceConnection::create(&name, 8192).expect("create");
        let client = SurfaceConnection::connect(&name).expect("connect");
        unlink(&name);

        // 手动授予缓冲区，绕过协商
        server.header().abuf_size.store(4096, Ordering::Release);

        let published = client.publish_chunk(1024, |dst| dst.fill(0xAB));
        assert!(published);
        assert_eq!(client.geometry().abuf_used, 1024);
        assert_eq!(client.signal_count(), 1);

        // 锁被他人持有时发布失败且游标不动
        let guard = server.try_lock().expect("lock should be free");
        assert!(!client.publish_chunk(1024, |dst| dst.fill(0xCD)));
        assert_eq!(client.geometry().abuf_used, 1024);
        assert_eq!(client.signal_count(), 1);
        drop(guard);

        // 锁释放后继续发布
        assert!(client.publish_chunk(1024, |dst| dst.fill(0xEF)));
        assert_eq!(client.geometry().abuf_used, 2048);
    }

    #[test]
    fn test_publish_wraps_when_consumer_behind() {
        let name = unique_name();
        let server = SurfaceConnection::create(&name, 8192).expect("create");
        let client = SurfaceConnection::connect(&name).expect("connect");
        unlink(&name);

        server.header().abuf_size.store(2048, Ordering::Release);

        assert!(client.publish_chunk(1024, |dst| dst.fill(1)));
        assert!(client.publish_chunk(1024, |dst| dst.fill(2)));
        // 缓冲区已满且无人消费：回到起点覆盖
        assert!(client.publish_chunk(1024, |dst| dst.fill(3)));
        assert_eq!(client.geometry().abuf_used, 1024);
    }

    #[test]
    fn test_event_ring() {
        let name = unique_name();
        let server = SurfaceConnection::create(&name, 4096).expect("create");
        let client = SurfaceConnection::connect(&name).expect("connect");
        unlink(&name);

        assert_eq!(server.take_event(), None);

        assert!(client.enqueue_event(SurfaceEvent::FlushAudio));
        assert_eq!(server.take_event(), Some(SurfaceEvent::FlushAudio));
        assert_eq!(server.take_event(), None);

        // 填满事件环后继续投递被拒绝
        for _ in 0..EVENT_RING_LEN {
            assert!(client.enqueue_event(SurfaceEvent::FlushAudio));
        }
        assert!(!client.enqueue_event(SurfaceEvent::FlushAudio));
    }

    #[test]
    fn test_resize_pending_flag() {
        let name = unique_name();
        let server = SurfaceConnection::create(&name, 4096).expect("create");
        let client = SurfaceConnection::connect(&name).expect("connect");
        unlink(&name);

        assert!(!client.resize_pending());
        server.header().resize_pending.store(1, Ordering::Relaxed);
        assert!(client.resize_pending());
        server.header().resize_pending.store(0, Ordering::Relaxed);
        assert!(!client.resize_pending());
    }
}
