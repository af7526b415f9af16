//! 将操作系统信号转换为管道通知
//!
//! 处理函数通过`signal-hook`的底层接口注册，只调用[`NotifyIf::notify`]，
//! 因此满足异步信号安全的要求。

use alloc::vec::Vec;

use libc::c_int;
use signal_hook::{
    SigId,
    consts::{FORBIDDEN, SIGCHLD, SIGHUP, SIGINT, SIGTERM},
    low_level,
};

use crate::{
    error::NotifyError,
    interface::{NotifyIf, Status},
};

/// 常见守护进程信号到状态的默认映射
pub const DEFAULT_BINDINGS: [(c_int, Status); 4] = [
    (SIGHUP, Status::Reload),
    (SIGTERM, Status::Terminate),
    (SIGINT, Status::Terminate),
    (SIGCHLD, Status::Child),
];

/// 注册一个处理函数：收到`signal`时向`producer`发送`status`
///
/// SIGKILL、SIGSTOP以及SIGSEGV等同步信号不能注册，返回[`NotifyError::Registration`]。
pub fn register<N>(producer: N, signal: c_int, status: Status) -> Result<SigId, NotifyError>
where
    N: NotifyIf + 'static,
{
    // `low_level::register`遇到这些信号会直接panic
    if FORBIDDEN.contains(&signal) {
        return Err(NotifyError::Registration { signal });
    }
    // SAFETY: 闭包只调用`notify`，其实现约定为异步信号安全
    let id = unsafe { low_level::register(signal, move || producer.notify(status)) }
        .map_err(|_| NotifyError::Registration { signal })?;
    #[cfg(feature = "log")]
    log::info!("signal {} bound to {} notification", signal, status);
    Ok(id)
}

/// 一组已注册的信号，`unregister_all`或drop时注销
#[derive(Default)]
pub struct SignalNotification {
    ids: Vec<(c_int, SigId)>,
}

impl SignalNotification {
    /// 空的注册表
    pub fn new() -> Self {
        Self::default()
    }

    /// 按[`DEFAULT_BINDINGS`]注册，任何一个失败都会撤销已完成的注册
    pub fn with_defaults<N>(producer: &N) -> Result<Self, NotifyError>
    where
        N: NotifyIf + Clone + 'static,
    {
        let mut signals = Self::new();
        for (signal, status) in DEFAULT_BINDINGS {
            signals.bind(producer, signal, status)?;
        }
        Ok(signals)
    }

    /// 注册一个信号，处理函数持有`producer`的克隆
    pub fn bind<N>(&mut self, producer: &N, signal: c_int, status: Status) -> Result<(), NotifyError>
    where
        N: NotifyIf + Clone + 'static,
    {
        let id = register(producer.clone(), signal, status)?;
        self.ids.push((signal, id));
        Ok(())
    }

    /// 已注册的信号编号
    pub fn signals(&self) -> impl Iterator<Item = c_int> + '_ {
        self.ids.iter().map(|&(signal, _)| signal)
    }

    /// 注销全部处理函数
    ///
    /// 注销后`signal-hook`不会恢复信号的默认行为，只是不再发送通知。
    pub fn unregister_all(&mut self) {
        for (signal, id) in self.ids.drain(..) {
            let res = low_level::unregister(id);
            #[cfg(feature = "log")]
            log::debug!("signal {} unregistered: {}", signal, res);
            #[cfg(not(feature = "log"))]
            let _ = (signal, res);
        }
    }
}

impl Drop for SignalNotification {
    fn drop(&mut self) {
        self.unregister_all();
    }
}

#[cfg(test)]
mod tests {
    use core::time::Duration;

    use super::*;
    use crate::pipe::NotifyPipe;

    #[test]
    fn test_signal_reaches_consumer() {
        let pipe = NotifyPipe::initialize().unwrap();
        let mut signals = SignalNotification::new();
        signals
            .bind(&pipe.notifier(), libc::SIGUSR1, Status::Reload)
            .unwrap();

        for _ in 0..3 {
            assert_eq!(unsafe { libc::raise(libc::SIGUSR1) }, 0);
        }
        let drained = pipe
            .wait_and_drain_timeout(Some(Duration::from_secs(5)))
            .unwrap()
            .expect("signal was not delivered");
        assert!(drained.contains(Status::Reload));
        assert!(drained.bytes() >= 1);

        signals.unregister_all();
        assert_eq!(signals.signals().count(), 0);
        // 注销后信号不再产生通知
        assert_eq!(unsafe { libc::raise(libc::SIGUSR1) }, 0);
        assert!(pipe.try_drain().unwrap().is_empty());
    }

    #[test]
    fn test_forbidden_signal() {
        let pipe = NotifyPipe::initialize().unwrap();
        for signal in [libc::SIGKILL, libc::SIGSTOP, libc::SIGSEGV, libc::SIGILL, libc::SIGFPE] {
            let res = register(pipe.notifier(), signal, Status::Terminate);
            assert_eq!(res.err(), Some(NotifyError::Registration { signal }));
        }
        // 注册表里不会留下半成品
        let mut signals = SignalNotification::new();
        assert!(signals.bind(&pipe.notifier(), libc::SIGKILL, Status::Terminate).is_err());
        assert_eq!(signals.signals().count(), 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_interrupted_wait_keeps_deadline() {
        use std::{sync::mpsc, thread, time::Instant};

        // 处理函数写入另一个管道，等待中的管道只会看到EINTR
        let sink = NotifyPipe::initialize().unwrap();
        let _id = register(sink.notifier(), libc::SIGUSR2, Status::Wake).unwrap();

        let pipe = NotifyPipe::initialize().unwrap();
        let (tx, rx) = mpsc::channel();
        let waiter = thread::spawn(move || {
            tx.send(unsafe { libc::pthread_self() }).unwrap();
            let start = Instant::now();
            let res = pipe.wait_and_drain_timeout(Some(Duration::from_millis(100)));
            (res, start.elapsed())
        });
        let target = rx.recv().unwrap();
        let start = Instant::now();
        while !waiter.is_finished() && start.elapsed() < Duration::from_secs(2) {
            unsafe { libc::pthread_kill(target, libc::SIGUSR2) };
            thread::sleep(Duration::from_millis(10));
        }
        let (res, elapsed) = waiter.join().unwrap();
        assert_eq!(res, Ok(None));
        assert!(elapsed < Duration::from_millis(500), "wait took {elapsed:?}");
        assert!(!sink.try_drain().unwrap().is_empty());
    }

    #[test]
    fn test_default_bindings() {
        let pipe = NotifyPipe::initialize().unwrap();
        let signals = SignalNotification::with_defaults(&pipe.notifier()).unwrap();
        let mut bound: std::vec::Vec<c_int> = signals.signals().collect();
        bound.sort_unstable();
        let mut expected = [SIGHUP, SIGTERM, SIGINT, SIGCHLD];
        expected.sort_unstable();
        assert_eq!(bound, expected);

        assert_eq!(unsafe { libc::raise(SIGHUP) }, 0);
        let drained = pipe
            .wait_and_drain_timeout(Some(Duration::from_secs(5)))
            .unwrap()
            .expect("SIGHUP was not delivered");
        assert!(drained.contains(Status::Reload));
        drop(signals);
    }
}
