//! YAML 文档深度合并
//!
//! 覆盖文档中的每个键：两侧都是映射时递归合并，否则整体替换。
//! 列表整体替换，不做拼接。

use serde_yaml::{Mapping, Value};

/// 把 `overlay` 深度合并进 `base`
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                let nested = matches!(
                    (base_map.get(&key), &value),
                    (Some(Value::Mapping(_)), Value::Mapping(_))
                );
                if nested {
                    if let Some(existing) = base_map.get_mut(&key) {
                        deep_merge(existing, value);
                    }
                } else {
                    base_map.insert(key, value);
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// 空文档视为空映射
pub fn empty_document() -> Value {
    Value::Mapping(Mapping::new())
}
