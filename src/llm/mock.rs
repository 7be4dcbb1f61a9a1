//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按顺序返回预设回复；预设用完后返回默认回复（默认为空响应错误，Planner 会走兜底规划）。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{Completion, CompletionRequest, LlmClient, LlmError, TokenUsage};

/// Mock 客户端：脚本化回复
#[derive(Debug)]
pub struct MockLlmClient {
    replies: Mutex<VecDeque<Result<String, LlmError>>>,
    default_reply: Result<String, LlmError>,
    prompts: Mutex<Vec<String>>,
    calls: AtomicUsize,
    usage: TokenUsage,
}

impl Default for MockLlmClient {
    fn default() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            default_reply: Err(LlmError::EmptyResponse),
            prompts: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            usage: TokenUsage::new(),
        }
    }
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 总是失败的客户端
    pub fn failing(error: LlmError) -> Self {
        Self {
            default_reply: Err(error),
            ..Self::default()
        }
    }

    /// 追加一条预设回复
    pub fn with_reply(self, text: impl Into<String>) -> Self {
        self.push(Ok(text.into()));
        self
    }

    /// 追加一条预设错误
    pub fn with_error(self, error: LlmError) -> Self {
        self.push(Err(error));
        self
    }

    /// 预设用完后的默认回复
    pub fn with_default_reply(mut self, text: impl Into<String>) -> Self {
        self.default_reply = Ok(text.into());
        self
    }

    fn push(&self, reply: Result<String, LlmError>) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(reply);
        }
    }

    /// 已调用次数
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    /// 收到的全部 prompt（按调用顺序）
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    fn model_name(&self) -> &str {
        "mock"
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }

    async fn generate(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(request.prompt.clone());
        }

        let reply = self
            .replies
            .lock()
            .ok()
            .and_then(|mut r| r.pop_front())
            .unwrap_or_else(|| self.default_reply.clone());

        let text = reply?;
        // 粗略估算：4 字符约 1 token
        let prompt_tokens = (request.prompt.chars().count() / 4) as u64;
        let completion_tokens = (text.chars().count() / 4) as u64;
        self.usage.add(prompt_tokens, completion_tokens);
        Ok(Completion {
            text,
            prompt_tokens,
            completion_tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_replies_then_default() {
        let mock = MockLlmClient::new()
            .with_reply("first")
            .with_error(LlmError::Timeout)
            .with_default_reply("later");
        let req = CompletionRequest::new("hello world!");

        assert_eq!(mock.generate(&req).await.unwrap().text, "first");
        assert_eq!(mock.generate(&req).await.unwrap_err(), LlmError::Timeout);
        assert_eq!(mock.generate(&req).await.unwrap().text, "later");
        assert_eq!(mock.calls(), 3);
        assert_eq!(mock.prompts().len(), 3);
    }

    #[tokio::test]
    async fn test_failing_client() {
        let mock = MockLlmClient::failing(LlmError::Auth("bad key".into()));
        let err = mock.generate(&CompletionRequest::new("x")).await.unwrap_err();
        assert_eq!(err.kind(), crate::core::ErrorKind::Auth);
    }
}
