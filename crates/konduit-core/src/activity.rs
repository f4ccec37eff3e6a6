//! Activity 负载与中继信封。
//!
//! # 教案式说明
//! - **意图（Why）**：Activity 是在管线内流动的开放式结构化负载；抑制重发的标记不再写入负载本身，
//!   而是由 [`Delivery`] 信封携带，调用方交出的对象不会被就地修改；
//! - **契约（What）**：[`Activity`] 序列化形态与 JSON 对象完全一致（`serde(transparent)`），序列化细节交由
//!   中继传输层决定；
//! - **兼容（Trade-offs）**：仍在负载中写入 [`SUPPRESSION_MARKER`] 的旧版对端依旧被识别，该键在进入链路前
//!   一律剥离，业务 Transform 永远看不到它。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::PipelineError;

/// 旧版对端写入负载的抑制标记键名。
pub const SUPPRESSION_MARKER: &str = "NO_RELAY";

/// 在管线中流动的结构化负载。
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Activity(Map<String, Value>);

impl Activity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(field.into(), value.into())
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    /// 以 `i64` 读取字段，字段缺失或类型不符时返回 `None`。
    pub fn get_i64(&self, field: &str) -> Option<i64> {
        self.0.get(field).and_then(Value::as_i64)
    }

    /// 从负载中摘除旧版抑制标记，返回标记此前是否存在。
    pub(crate) fn take_legacy_marker(&mut self) -> bool {
        self.0.remove(SUPPRESSION_MARKER).is_some()
    }
}

impl From<Map<String, Value>> for Activity {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

impl From<Activity> for Value {
    fn from(activity: Activity) -> Self {
        Value::Object(activity.0)
    }
}

impl TryFrom<Value> for Activity {
    type Error = PipelineError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(fields) => Ok(Self(fields)),
            other => Err(PipelineError::InvalidActivity {
                found: json_kind(&other),
            }),
        }
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Activity {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Activity 的来源。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    /// 本进程调用方直接写入。
    Local,
    /// 经中继总线投递而来，禁止再次发布。
    Relay,
}

/// 写路径上的信封：负载加来源。
///
/// # 教案式说明
/// - **意图 (Why)**：以显式字段取代在负载上打标记再删除的做法，防回声判断只依赖信封；
/// - **契约 (What)**：[`Delivery::local`] 对应一次本地写入，必然触发一次发布；[`Delivery::relayed`]
///   对应一次中继投递，永不发布。
#[derive(Clone, Debug, PartialEq)]
pub struct Delivery {
    activity: Activity,
    origin: Origin,
}

impl Delivery {
    pub fn local(activity: Activity) -> Self {
        Self {
            activity,
            origin: Origin::Local,
        }
    }

    pub fn relayed(activity: Activity) -> Self {
        Self {
            activity,
            origin: Origin::Relay,
        }
    }

    pub fn is_locally_originated(&self) -> bool {
        self.origin == Origin::Local
    }

    pub fn into_parts(self) -> (Activity, Origin) {
        (self.activity, self.origin)
    }
}
