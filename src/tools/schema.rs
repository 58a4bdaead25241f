//! JSON Schema 生成（schemars）
//!
//! 用于把「合法输出」的 JSON 结构注入 prompt，减少 LLM 输出格式错误。

use schemars::{schema_for, JsonSchema};

/// 返回任意类型的 JSON Schema 字符串，可拼入 system prompt
pub fn schema_json<T: JsonSchema>() -> String {
    let schema = schema_for!(T);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[allow(dead_code)]
    #[derive(JsonSchema)]
    struct Sample {
        name: String,
    }

    #[test]
    fn test_schema_json_lists_fields() {
        let s = schema_json::<Sample>();
        assert!(s.contains("\"name\""));
    }
}
