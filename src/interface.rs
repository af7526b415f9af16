//! 通知状态、生产者接口与日志接口

use core::fmt;

/// 通知的原因，编码为一个字节写入管道
///
/// 已知编码会被解码为具名变体，因此`Other(1)`读回来是`Reload`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// 单纯的唤醒，没有其他含义
    Wake,
    /// 请求重新加载配置（通常对应SIGHUP）
    Reload,
    /// 请求终止（通常对应SIGTERM、SIGINT）
    Terminate,
    /// 子进程状态变化（通常对应SIGCHLD）
    Child,
    /// 要求消费者循环退出，不由信号产生
    Shutdown,
    /// 应用自定义的编码
    Other(u8),
}

impl Status {
    /// 写入管道的字节
    pub const fn code(self) -> u8 {
        match self {
            Status::Wake => 0,
            Status::Reload => 1,
            Status::Terminate => 2,
            Status::Child => 3,
            Status::Shutdown => 0xff,
            Status::Other(code) => code,
        }
    }

    /// 从管道中读出的字节解码
    pub const fn from_code(code: u8) -> Self {
        match code {
            0 => Status::Wake,
            1 => Status::Reload,
            2 => Status::Terminate,
            3 => Status::Child,
            0xff => Status::Shutdown,
            other => Status::Other(other),
        }
    }

    /// 状态名，`Other`统一为`"other"`
    pub const fn name(self) -> &'static str {
        match self {
            Status::Wake => "wake",
            Status::Reload => "reload",
            Status::Terminate => "terminate",
            Status::Child => "child",
            Status::Shutdown => "shutdown",
            Status::Other(_) => "other",
        }
    }
}

impl From<u8> for Status {
    fn from(code: u8) -> Self {
        Status::from_code(code)
    }
}

impl From<Status> for u8 {
    fn from(status: Status) -> Self {
        status.code()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Other(code) => write!(f, "other({code})"),
            status => f.write_str(status.name()),
        }
    }
}

/// 通知的生产者一侧
///
/// SAFETY（约定）：实现必须是异步信号安全的，
/// 不能分配内存、不能加锁、不能调用不可重入的函数，也不能阻塞。
pub trait NotifyIf: Send + Sync {
    /// 尽力发送一次通知，失败时静默丢弃
    fn notify(&self, status: Status);
}

/// 守护进程的日志接口，只能在普通上下文（非信号处理函数）中调用
///
/// `template`中第一个`{}`被替换为`message`，其余内容原样输出；
/// 没有`{}`时，`message`以`": "`分隔追加在末尾。不解释其他格式说明符。
pub trait Say {
    /// 输出一条日志
    fn say(&self, template: &str, message: &str);
}

impl<F: Fn(&str, &str)> Say for F {
    fn say(&self, template: &str, message: &str) {
        self(template, message)
    }
}

/// 丢弃所有日志
#[derive(Debug, Default, Clone, Copy)]
pub struct Silent;

impl Say for Silent {
    fn say(&self, _template: &str, _message: &str) {}
}

/// 将日志转发到`log`门面，级别为info
#[cfg(feature = "log")]
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSay;

#[cfg(feature = "log")]
impl Say for LogSay {
    fn say(&self, template: &str, message: &str) {
        log::info!("{}", Rendered::new(template, message));
    }
}

/// 按`Say`的格式约定拼接模板和消息，不分配内存
#[derive(Debug, Clone, Copy)]
pub struct Rendered<'a> {
    template: &'a str,
    message: &'a str,
}

impl<'a> Rendered<'a> {
    /// 包装一对模板和消息
    pub const fn new(template: &'a str, message: &'a str) -> Self {
        Self { template, message }
    }
}

impl fmt::Display for Rendered<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.template.split_once("{}") {
            Some((head, tail)) => {
                f.write_str(head)?;
                f.write_str(self.message)?;
                f.write_str(tail)
            }
            None => write!(f, "{}: {}", self.template, self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{cell::RefCell, string::String, string::ToString, vec::Vec};

    #[test]
    fn test_status_codes() {
        for code in 0..=u8::MAX {
            assert_eq!(Status::from_code(code).code(), code);
        }
        assert_eq!(Status::from_code(2), Status::Terminate);
        assert_eq!(Status::from(0xff), Status::Shutdown);
        assert_eq!(Status::Other(1).code(), Status::Reload.code());
        assert_eq!(Status::Other(42).to_string(), "other(42)");
    }

    #[test]
    fn test_rendered() {
        assert_eq!(
            Rendered::new("received {} notification", "reload").to_string(),
            "received reload notification"
        );
        // 只替换第一个占位符，其余原样保留
        assert_eq!(Rendered::new("{} and {}", "a").to_string(), "a and {}");
        assert_eq!(
            Rendered::new("channel saturated", "3 dropped").to_string(),
            "channel saturated: 3 dropped"
        );
        // printf风格的说明符不被解释
        assert_eq!(Rendered::new("%s {}", "x").to_string(), "%s x");
    }

    #[test]
    fn test_closure_say() {
        let lines: RefCell<Vec<String>> = RefCell::new(Vec::new());
        let say = |template: &str, message: &str| {
            lines
                .borrow_mut()
                .push(Rendered::new(template, message).to_string());
        };
        say.say("hello {}", "world");
        Silent.say("ignored {}", "x");
        assert_eq!(lines.into_inner(), ["hello world"]);
    }
}
