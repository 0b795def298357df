//! Proxy Usage Tracking Module
//!
//! 提供上游 usage 的解析以及每次补全结果的记录

pub mod logger;
pub mod parser;

pub use logger::{CompletionRecord, LogObserver, RequestObserver};
pub use parser::TokenUsage;
