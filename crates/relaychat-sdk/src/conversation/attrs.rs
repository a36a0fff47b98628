//! 会话属性树与待提交字段操作
//!
//! 属性是一棵显式标签树，用点路径寻址（"attr.theme.color"）。
//! 对属性的修改不直接落树：先以 [`FieldOperation`] 的形式按字段挂起，
//! 服务端确认后才提交进树。同一字段后写覆盖先写，合并策略只存在于
//! [`FieldOperation::merge`] 一处。

use std::collections::HashMap;

use serde_json::{json, Map, Number, Value};

/// 属性值
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<AttrValue>),
    Map(HashMap<String, AttrValue>),
    /// 指向其它服务端对象的引用
    Pointer { class_name: String, object_id: String },
}

impl AttrValue {
    /// 空的嵌套表
    pub fn empty_map() -> AttrValue {
        AttrValue::Map(HashMap::new())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttrValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&HashMap<String, AttrValue>> {
        match self {
            AttrValue::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[AttrValue]> {
        match self {
            AttrValue::List(l) => Some(l),
            _ => None,
        }
    }

    /// 转成 JSON；Pointer 采用 `__type` 标记的对象形式
    pub fn to_json(&self) -> Value {
        match self {
            AttrValue::Null => Value::Null,
            AttrValue::Bool(b) => Value::Bool(*b),
            AttrValue::Int(i) => Value::Number((*i).into()),
            AttrValue::Float(f) => Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            AttrValue::String(s) => Value::String(s.clone()),
            AttrValue::List(items) => Value::Array(items.iter().map(AttrValue::to_json).collect()),
            AttrValue::Map(entries) => {
                let mut obj = Map::new();
                for (key, value) in entries {
                    obj.insert(key.clone(), value.to_json());
                }
                Value::Object(obj)
            }
            AttrValue::Pointer {
                class_name,
                object_id,
            } => json!({
                "__type": "Pointer",
                "className": class_name,
                "objectId": object_id,
            }),
        }
    }

    /// 从 JSON 解析；带 `__type: Pointer` 标记的对象还原成引用
    pub fn from_json(value: &Value) -> AttrValue {
        match value {
            Value::Null => AttrValue::Null,
            Value::Bool(b) => AttrValue::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    AttrValue::Int(i)
                } else {
                    AttrValue::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            Value::String(s) => AttrValue::String(s.clone()),
            Value::Array(items) => AttrValue::List(items.iter().map(AttrValue::from_json).collect()),
            Value::Object(obj) => {
                if obj.get("__type").and_then(Value::as_str) == Some("Pointer") {
                    return AttrValue::Pointer {
                        class_name: obj
                            .get("className")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        object_id: obj
                            .get("objectId")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                    };
                }
                let mut entries = HashMap::new();
                for (key, value) in obj {
                    entries.insert(key.clone(), AttrValue::from_json(value));
                }
                AttrValue::Map(entries)
            }
        }
    }

    /// 点路径读取；路径上任何一层不是嵌套表都视为不存在
    pub fn get_path(&self, path: &str) -> Option<&AttrValue> {
        if path.is_empty() {
            return None;
        }
        let mut current = self;
        for segment in path.split('.') {
            current = current.as_map()?.get(segment)?;
        }
        Some(current)
    }

    /// 点路径写入；中间层缺失或不是嵌套表时不写，返回 false
    pub fn set_path(&mut self, path: &str, value: AttrValue) -> bool {
        if path.is_empty() {
            return false;
        }
        match path.split_once('.') {
            None => match self {
                AttrValue::Map(entries) => {
                    entries.insert(path.to_string(), value);
                    true
                }
                _ => false,
            },
            Some((first, rest)) => match self {
                AttrValue::Map(entries) => match entries.get_mut(first) {
                    Some(next) => next.set_path(rest, value),
                    None => false,
                },
                _ => false,
            },
        }
    }

    /// 点路径删除；键不存在时静默返回 false
    pub fn delete_path(&mut self, path: &str) -> bool {
        if path.is_empty() {
            return false;
        }
        match path.split_once('.') {
            None => match self {
                AttrValue::Map(entries) => entries.remove(path).is_some(),
                _ => false,
            },
            Some((first, rest)) => match self {
                AttrValue::Map(entries) => match entries.get_mut(first) {
                    Some(next) => next.delete_path(rest),
                    None => false,
                },
                _ => false,
            },
        }
    }
}

/// 待提交的字段操作
///
/// 服务端确认之前只存在于挂起队列；读取时作为覆盖层叠加在已提交值上。
#[derive(Debug, Clone, PartialEq)]
pub enum FieldOperation {
    Set(AttrValue),
    Delete,
}

impl FieldOperation {
    /// 与同字段的旧操作合并：后写覆盖先写
    pub fn merge(self, _previous: Option<FieldOperation>) -> FieldOperation {
        self
    }

    /// 叠加到已提交值上，得到读取方应看到的值
    pub fn apply(&self, _committed: Option<&AttrValue>) -> Option<AttrValue> {
        match self {
            FieldOperation::Set(value) => Some(value.clone()),
            FieldOperation::Delete => None,
        }
    }

    /// 编码为指令通道负载里的一项
    pub fn encode(&self) -> Value {
        match self {
            FieldOperation::Set(value) => value.to_json(),
            FieldOperation::Delete => json!({ "__op": "Delete" }),
        }
    }
}
