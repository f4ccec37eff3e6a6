//! 测试桩集合：记录型中继总线与日志。
//!
//! # 设计定位（Why）
//! - 合约测试需要断言“发布了几次”“记录了哪些日志”，同时需要从测试侧模拟总线入站投递；
//! - 集中维护桩对象，接口演进时只需更新此处。
//!
//! # 使用方式（How）
//! - `RecordingRelayBus::deliver` 依次调用所有已注册的入站回调并等待完成，等价于总线投递；
//! - 所有类型都可跨线程共享，适合 `#[tokio::test]` 的多线程调度器。

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    activity::Activity,
    error::RelayError,
    observability::Logger,
    relay::{RelayBus, RelayHandler},
};

/// 丢弃一切输出的 Logger。
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopLogger;

impl Logger for NoopLogger {
    fn info(&self, _message: &str) {}

    fn warn(&self, _message: &str) {}

    fn error(&self, _message: &str) {}
}

/// 日志级别。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// 记录所有日志行的 Logger。
#[derive(Debug, Default)]
pub struct RecordingLogger {
    lines: Mutex<Vec<(LogLevel, String)>>,
}

impl RecordingLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, level: LogLevel, needle: &str) -> bool {
        self.lines
            .lock()
            .iter()
            .any(|(recorded, line)| *recorded == level && line.contains(needle))
    }
}

impl Logger for RecordingLogger {
    fn info(&self, message: &str) {
        self.lines.lock().push((LogLevel::Info, message.to_owned()));
    }

    fn warn(&self, message: &str) {
        self.lines.lock().push((LogLevel::Warn, message.to_owned()));
    }

    fn error(&self, message: &str) {
        self.lines.lock().push((LogLevel::Error, message.to_owned()));
    }
}

/// 记录发布、捕获订阅回调的中继总线。
#[derive(Default)]
pub struct RecordingRelayBus {
    published: Mutex<Vec<(String, Activity)>>,
    handlers: Mutex<Vec<(String, RelayHandler)>>,
    fail_publish: bool,
}

impl RecordingRelayBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// 每次 `publish` 都返回错误（仍然计数）。
    pub fn failing() -> Self {
        Self {
            fail_publish: true,
            ..Self::default()
        }
    }

    pub fn publish_count(&self) -> usize {
        self.published.lock().len()
    }

    pub fn published(&self) -> Vec<(String, Activity)> {
        self.published.lock().clone()
    }

    pub fn subscribed_namespaces(&self) -> Vec<String> {
        self.handlers
            .lock()
            .iter()
            .map(|(namespace, _)| namespace.clone())
            .collect()
    }

    /// 模拟总线把 `activity` 投递给所有订阅者，返回仍然存活的订阅者数量。
    pub async fn deliver(&self, activity: Activity) -> usize {
        let handlers: Vec<RelayHandler> = self
            .handlers
            .lock()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        let mut live = 0;
        for handler in handlers {
            if handler(activity.clone()).await {
                live += 1;
            }
        }
        live
    }
}

#[async_trait]
impl RelayBus for RecordingRelayBus {
    async fn publish(&self, namespace: &str, activity: &Activity) -> Result<(), RelayError> {
        self.published
            .lock()
            .push((namespace.to_owned(), activity.clone()));
        if self.fail_publish {
            return Err(RelayError::Publish {
                namespace: namespace.to_owned(),
                detail: "publish rejected by test stub".to_owned(),
            });
        }
        Ok(())
    }

    fn subscribe(&self, namespace: &str, handler: RelayHandler) -> Result<(), RelayError> {
        self.handlers.lock().push((namespace.to_owned(), handler));
        Ok(())
    }
}
