//! 进程级的通知入口
//!
//! 供无法传递句柄的代码（例如裸`sigaction`处理函数）使用。
//! 句柄只能安装一次，且必须在注册处理函数之前安装。

use lazyinit::LazyInit;

use crate::{
    error::NotifyError,
    interface::{NotifyIf, Status},
    pipe::Notifier,
};

static NOTIFY_PIPE: LazyInit<Notifier> = LazyInit::new();

/// 安装进程级句柄，重复安装返回[`NotifyError::AlreadyInitialized`]
pub fn install(notifier: &Notifier) -> Result<(), NotifyError> {
    NOTIFY_PIPE
        .call_once(|| notifier.clone())
        .ok_or(NotifyError::AlreadyInitialized)?;
    #[cfg(feature = "log")]
    log::info!("process-wide notifier installed");
    Ok(())
}

/// 是否已安装
pub fn is_installed() -> bool {
    NOTIFY_PIPE.is_inited()
}

/// 异步信号安全；未安装时什么也不做
pub fn notify(status: Status) {
    if let Some(notifier) = NOTIFY_PIPE.get() {
        notifier.notify(status);
    }
}

/// 转发到进程级句柄的生产者，可交给[`crate::signal::register`]
#[derive(Debug, Default, Clone, Copy)]
pub struct GlobalNotifier;

impl NotifyIf for GlobalNotifier {
    fn notify(&self, status: Status) {
        notify(status);
    }
}
