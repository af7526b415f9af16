//! 守护进程的自管道通知机制：信号处理函数写入一个状态字节，事件循环在普通上下文中读出。
//!
//! ```no_run
//! use core::ops::ControlFlow;
//! use notify_pipe::{NotifyPipe, Silent, Status};
//!
//! let pipe = NotifyPipe::initialize()?;
//! # #[cfg(feature = "signal")]
//! let _signals = notify_pipe::signal::SignalNotification::with_defaults(&pipe.notifier())?;
//! pipe.run(&Silent, |status| match status {
//!     Status::Terminate => ControlFlow::Break(()),
//!     _ => ControlFlow::Continue(()),
//! })?;
//! pipe.teardown();
//! # Ok::<(), notify_pipe::NotifyError>(())
//! ```

#![no_std]
#![deny(missing_docs)]
extern crate alloc;
#[cfg(any(test, feature = "async"))]
extern crate std;

#[cfg(feature = "async")]
pub mod async_pipe;
pub mod error;
#[cfg(feature = "global")]
pub mod global;
pub mod interface;
pub mod pipe;
#[cfg(feature = "signal")]
pub mod signal;

pub use error::NotifyError;
#[cfg(feature = "log")]
pub use interface::LogSay;
pub use interface::{NotifyIf, Rendered, Say, Silent, Status};
pub use pipe::{Drained, NotifyPipe, Notifier};
