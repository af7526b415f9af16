//! 错误类型

use nix::errno::Errno;
use thiserror::Error;

/// 通知管道的错误类型
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum NotifyError {
    /// 创建管道或设置其标志失败，启动时致命
    #[error("failed to create notification channel: {0}")]
    ChannelCreation(#[source] Errno),

    /// 管道缓冲区已满。`notify`会吞掉该错误，只记入丢弃计数
    #[error("notification channel is full")]
    WouldBlock,

    /// 管道已关闭（`teardown`之后，或写端已不存在）
    #[error("notification channel closed")]
    ChannelClosed,

    /// 等待或读取时的其他描述符错误
    #[error("notification channel I/O error: {0}")]
    Io(#[source] Errno),

    /// 信号无法注册（例如SIGKILL、SIGSEGV）
    #[error("cannot register handler for signal {signal}")]
    Registration {
        /// 信号编号
        signal: i32,
    },

    /// 进程级通知句柄被重复安装
    #[error("process-wide notifier already installed")]
    AlreadyInitialized,
}

impl NotifyError {
    /// 读取当前errno并转换为I/O错误
    pub(crate) fn last_io() -> Self {
        match Errno::last() {
            Errno::EAGAIN => NotifyError::WouldBlock,
            Errno::EBADF => NotifyError::ChannelClosed,
            errno => NotifyError::Io(errno),
        }
    }
}
