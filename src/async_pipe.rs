//! 基于tokio的异步消费者
//!
//! 必须在tokio运行时（启用IO驱动）内使用。

use core::{future::Future, pin::pin};
use std::os::fd::{AsRawFd, RawFd};

use futures::future::{Either, select};
use nix::errno::Errno;
use tokio::io::unix::AsyncFd;

use crate::{
    error::NotifyError,
    pipe::{Drained, NotifyPipe},
};

struct ReadSide(NotifyPipe);

impl AsRawFd for ReadSide {
    fn as_raw_fd(&self) -> RawFd {
        // 已关闭时返回-1，注册会失败
        self.0.read_fd().unwrap_or(-1)
    }
}

fn io_error(err: std::io::Error) -> NotifyError {
    match err.raw_os_error() {
        Some(code) => match Errno::from_raw(code) {
            Errno::EBADF => NotifyError::ChannelClosed,
            errno => NotifyError::Io(errno),
        },
        None => NotifyError::Io(Errno::UnknownErrno),
    }
}

/// 将读端注册到tokio反应器的[`NotifyPipe`]
pub struct AsyncNotifyPipe {
    inner: AsyncFd<ReadSide>,
}

impl AsyncNotifyPipe {
    /// 注册读端，管道已关闭时返回[`NotifyError::ChannelClosed`]
    pub fn new(pipe: NotifyPipe) -> Result<Self, NotifyError> {
        if pipe.read_fd().is_none() {
            return Err(NotifyError::ChannelClosed);
        }
        let inner = AsyncFd::new(ReadSide(pipe)).map_err(io_error)?;
        Ok(Self { inner })
    }

    /// 底层管道，用于获取生产者句柄
    pub fn get_ref(&self) -> &NotifyPipe {
        &self.inner.get_ref().0
    }

    /// 从反应器注销并取回管道，之后可以调用`teardown`
    pub fn into_inner(self) -> NotifyPipe {
        self.inner.into_inner().0
    }

    /// 异步版本的[`NotifyPipe::wait_and_drain`]
    pub async fn wait_and_drain(&self) -> Result<Drained, NotifyError> {
        loop {
            let mut guard = self.inner.readable().await.map_err(io_error)?;
            let drained = self.get_ref().try_drain()?;
            // `try_drain`总是读到EAGAIN为止
            guard.clear_ready();
            if !drained.is_empty() {
                return Ok(drained);
            }
        }
    }

    /// 可被打断的等待：`shutdown`先完成时返回`Ok(None)`
    pub async fn wait_and_drain_until<F>(&self, shutdown: F) -> Result<Option<Drained>, NotifyError>
    where
        F: Future,
    {
        let wait = pin!(self.wait_and_drain());
        let shutdown = pin!(shutdown);
        match select(wait, shutdown).await {
            Either::Left((res, _)) => res.map(Some),
            Either::Right(_) => {
                #[cfg(feature = "log")]
                log::debug!("notify pipe wait cancelled");
                Ok(None)
            }
        }
    }
}
