//! Usage Parser - 从上游消息中提取 token 使用量
//!
//! 上游 usage 形如 `{input, output, cacheRead, cacheWrite, totalTokens}`，
//! 字段名按 [`fields`] 中的别名表兼容 snake_case 和 OpenAI 风格命名。

use crate::proxy::models::openai::{CompletionTokensDetails, PromptTokensDetails, Usage};
use crate::proxy::upstream::fields;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Token 使用量统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    pub reasoning_tokens: u64,
    /// 上游显式给出的总量
    pub total_tokens: Option<u64>,
}

impl TokenUsage {
    /// 解析 usage 对象；不是对象时返回 None
    pub fn from_value(usage: &Value) -> Option<Self> {
        if !usage.is_object() {
            return None;
        }
        let get = |aliases: &[&str]| fields::first_u64(usage, aliases).unwrap_or(0);

        Some(Self {
            input_tokens: get(fields::USAGE_INPUT),
            output_tokens: get(fields::USAGE_OUTPUT),
            cache_read_tokens: get(fields::USAGE_CACHE_READ),
            cache_write_tokens: get(fields::USAGE_CACHE_WRITE),
            reasoning_tokens: get(fields::USAGE_REASONING),
            total_tokens: fields::first_u64(usage, fields::USAGE_TOTAL),
        })
    }

    /// 从上游 assistant 消息的 `usage` 字段解析
    pub fn from_upstream_message(message: &Value) -> Option<Self> {
        fields::first_object(message, fields::USAGE).and_then(Self::from_value)
    }

    /// 转为 OpenAI usage：prompt = input + cacheRead，total 缺省为两者之和
    pub fn to_openai(&self) -> Usage {
        let prompt_tokens = self.input_tokens + self.cache_read_tokens;
        let completion_tokens = self.output_tokens;
        Usage {
            prompt_tokens,
            completion_tokens,
            total_tokens: self
                .total_tokens
                .unwrap_or(prompt_tokens + completion_tokens),
            completion_tokens_details: CompletionTokensDetails {
                reasoning_tokens: self.reasoning_tokens,
            },
            prompt_tokens_details: PromptTokensDetails {
                cached_tokens: self.cache_read_tokens,
            },
        }
    }
}
