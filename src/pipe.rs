//! 自管道（self-pipe）通知机制
//!
//! 信号处理函数向管道写端写入一个字节，事件循环在读端等待并读空管道。
//! 消费者只保证“上次读空之后至少发生过一次通知”：多次通知会被合并，
//! 读到的状态数可能少于`notify`的调用次数。需要精确计数或顺序时，
//! 应通过信号上下文之外的状态另行传递。

use alloc::{format, sync::Arc};
use core::{
    ops::ControlFlow,
    sync::atomic::{AtomicI32, AtomicUsize, Ordering},
    time::Duration,
};

use libc::c_int;
use nix::errno::Errno;

use crate::{
    error::NotifyError,
    interface::{NotifyIf, Say, Status},
};

/// 已关闭的描述符
const CLOSED: c_int = -1;

/// 每次`read`的缓冲区大小
const DRAIN_CHUNK: usize = 64;

struct Channel {
    read: AtomicI32,
    write: AtomicI32,
    /// 因管道已满而丢弃的通知数
    dropped: AtomicUsize,
}

impl Drop for Channel {
    fn drop(&mut self) {
        close_fd(&self.read);
        close_fd(&self.write);
    }
}

fn close_fd(fd: &AtomicI32) -> bool {
    let fd = fd.swap(CLOSED, Ordering::AcqRel);
    if fd == CLOSED {
        return false;
    }
    unsafe { libc::close(fd) };
    true
}

/// 设置`O_NONBLOCK`和`FD_CLOEXEC`
fn configure(fd: c_int) -> Result<(), Errno> {
    let flags = Errno::result(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    Errno::result(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) })?;
    let flags = Errno::result(unsafe { libc::fcntl(fd, libc::F_GETFD) })?;
    Errno::result(unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) })?;
    Ok(())
}

/// 单调时钟的当前时间
fn monotonic_now() -> Duration {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // CLOCK_MONOTONIC总是可用，参数也合法
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
}

/// 换算为`poll`的毫秒数，向上取整，避免不足1ms的超时变成0
fn poll_timeout(remaining: Duration) -> c_int {
    remaining
        .as_nanos()
        .div_ceil(1_000_000)
        .min(c_int::MAX as u128) as c_int
}

/// 通知管道的所有者，也是唯一的消费者
///
/// 必须在注册任何信号处理函数之前创建；生产者句柄只能通过
/// [`NotifyPipe::notifier`]获得，从而保证这一顺序。
pub struct NotifyPipe {
    chan: Arc<Channel>,
}

/// 生产者句柄，可以克隆后交给信号处理函数或其他线程
///
/// `notify`只做一次原子读、一次`write(2)`，失败时再做一次原子加，
/// 是异步信号安全的。
#[derive(Clone)]
pub struct Notifier {
    chan: Arc<Channel>,
}

/// 一次读空管道的结果
///
/// 状态以集合形式保存（256位的位图），不保留顺序和重复次数。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Drained {
    seen: [u64; 4],
    bytes: usize,
    last: Option<Status>,
    dropped: usize,
}

impl Drained {
    fn record(&mut self, code: u8) {
        self.seen[(code >> 6) as usize] |= 1u64 << (code & 63);
        self.bytes += 1;
        self.last = Some(Status::from_code(code));
    }

    /// 没有读到任何字节
    pub fn is_empty(&self) -> bool {
        self.bytes == 0
    }

    /// 本次读到的字节数，即合并前的通知数
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// 最后读到的状态
    pub fn last(&self) -> Option<Status> {
        self.last
    }

    /// 上次读空之后因管道已满而丢弃的通知数
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// 是否读到过该状态
    pub fn contains(&self, status: Status) -> bool {
        let code = status.code();
        self.seen[(code >> 6) as usize] & (1u64 << (code & 63)) != 0
    }

    /// 按编码升序遍历读到的不同状态
    pub fn iter(&self) -> impl Iterator<Item = Status> + '_ {
        (0..=u8::MAX)
            .filter(|&code| self.seen[(code >> 6) as usize] & (1u64 << (code & 63)) != 0)
            .map(Status::from_code)
    }
}

impl NotifyPipe {
    /// 创建管道，两端均为非阻塞、close-on-exec
    pub fn initialize() -> Result<Self, NotifyError> {
        let mut fds: [c_int; 2] = [CLOSED; 2];
        Errno::result(unsafe { libc::pipe(fds.as_mut_ptr()) })
            .map_err(NotifyError::ChannelCreation)?;
        let [read, write] = fds;
        // 先交给`Channel`，出错时由`Drop`关闭
        let chan = Arc::new(Channel {
            read: AtomicI32::new(read),
            write: AtomicI32::new(write),
            dropped: AtomicUsize::new(0),
        });
        configure(read).map_err(NotifyError::ChannelCreation)?;
        configure(write).map_err(NotifyError::ChannelCreation)?;
        #[cfg(feature = "log")]
        log::debug!("notify pipe created: read={read} write={write}");
        Ok(Self { chan })
    }

    /// 获取一个生产者句柄
    pub fn notifier(&self) -> Notifier {
        Notifier {
            chan: self.chan.clone(),
        }
    }

    /// 读端描述符，已关闭时为`None`
    pub fn read_fd(&self) -> Option<c_int> {
        match self.chan.read.load(Ordering::Acquire) {
            CLOSED => None,
            fd => Some(fd),
        }
    }

    /// 阻塞直到至少有一个字节可读，然后读空管道
    pub fn wait_and_drain(&self) -> Result<Drained, NotifyError> {
        loop {
            if let Some(drained) = self.wait_and_drain_timeout(None)? {
                return Ok(drained);
            }
        }
    }

    /// 带超时的[`NotifyPipe::wait_and_drain`]，超时（或伪唤醒）返回`Ok(None)`
    ///
    /// `timeout`为`None`时一直等待。
    pub fn wait_and_drain_timeout(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Option<Drained>, NotifyError> {
        let fd = self.read_fd().ok_or(NotifyError::ChannelClosed)?;
        let deadline = timeout.map(|timeout| monotonic_now() + timeout);
        let mut pollfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let ready = loop {
            let timeout_ms = match deadline {
                None => -1,
                Some(deadline) => poll_timeout(deadline.saturating_sub(monotonic_now())),
            };
            let ret = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
            match Errno::result(ret) {
                Ok(ready) => break ready,
                // 被信号打断，很可能正是我们自己的信号；按剩余时间重新等待
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(NotifyError::Io(errno)),
            }
        };
        if ready == 0 {
            return Ok(None);
        }
        if pollfd.revents & libc::POLLNVAL != 0 {
            return Err(NotifyError::ChannelClosed);
        }
        // POLLHUP时管道中可能仍有数据，交给`try_drain`判断
        let drained = self.try_drain()?;
        if drained.is_empty() {
            // 伪唤醒
            return Ok(None);
        }
        Ok(Some(drained))
    }

    /// 不阻塞地读空管道，没有数据时返回空的[`Drained`]
    ///
    /// 读到文件末尾且没有数据时返回[`NotifyError::ChannelClosed`]。
    pub fn try_drain(&self) -> Result<Drained, NotifyError> {
        let fd = self.read_fd().ok_or(NotifyError::ChannelClosed)?;
        let mut drained = Drained {
            dropped: self.chan.dropped.swap(0, Ordering::AcqRel),
            ..Drained::default()
        };
        let mut buf = [0u8; DRAIN_CHUNK];
        loop {
            let ret = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
            match ret {
                0 if drained.is_empty() => return Err(NotifyError::ChannelClosed),
                0 => return Ok(drained),
                n if n > 0 => buf[..n as usize].iter().for_each(|&b| drained.record(b)),
                _ => match NotifyError::last_io() {
                    NotifyError::WouldBlock => return Ok(drained),
                    NotifyError::Io(Errno::EINTR) => continue,
                    err => return Err(err),
                },
            }
        }
    }

    /// 消费者循环：等待、读空、通过`say`报告，并把每个状态交给`handler`
    ///
    /// 读到[`Status::Shutdown`]或`handler`返回`Break`时返回`Ok(())`，
    /// 管道关闭时返回[`NotifyError::ChannelClosed`]。
    pub fn run<S, F>(&self, say: &S, mut handler: F) -> Result<(), NotifyError>
    where
        S: Say + ?Sized,
        F: FnMut(Status) -> ControlFlow<()>,
    {
        loop {
            let drained = match self.wait_and_drain() {
                Ok(drained) => drained,
                Err(err) => {
                    say.say("notify pipe: consumer loop stopped: {}", &format!("{err}"));
                    return Err(err);
                }
            };
            if drained.dropped() > 0 {
                // 每次读空最多报告一次
                say.say("notify pipe saturated: {}", "notifications were coalesced");
            }
            for status in drained.iter() {
                if status == Status::Shutdown {
                    say.say("notify pipe: {} requested", "shutdown");
                    return Ok(());
                }
                say.say("notify pipe: received {} notification", status.name());
                if handler(status).is_break() {
                    return Ok(());
                }
            }
        }
    }

    /// 关闭管道两端，可重复调用
    ///
    /// 只能在不会再有`notify`调用之后执行（信号处理函数已注销或进程即将退出），
    /// 否则关闭后被复用的描述符可能收到多余的字节。
    pub fn teardown(&self) {
        // 先关写端：阻塞在`poll`上的消费者会收到POLLHUP而醒来
        let closed = close_fd(&self.chan.write) | close_fd(&self.chan.read);
        if closed {
            #[cfg(feature = "log")]
            log::debug!("notify pipe closed");
        }
    }
}

impl Drop for NotifyPipe {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl Notifier {
    /// 写入一个字节
    pub fn try_notify(&self, status: Status) -> Result<(), NotifyError> {
        let fd = self.chan.write.load(Ordering::Relaxed);
        if fd == CLOSED {
            return Err(NotifyError::ChannelClosed);
        }
        let byte = status.code();
        let ret = unsafe { libc::write(fd, (&byte as *const u8).cast(), 1) };
        if ret == 1 {
            Ok(())
        } else {
            Err(NotifyError::last_io())
        }
    }

    /// 上次读空之后因管道已满而丢弃的通知数
    pub fn dropped(&self) -> usize {
        self.chan.dropped.load(Ordering::Relaxed)
    }
}

impl NotifyIf for Notifier {
    fn notify(&self, status: Status) {
        if let Err(NotifyError::WouldBlock) = self.try_notify(status) {
            self.chan.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}
