use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use crate::config::AgentConfig;
use crate::llm_client::{image_content, CompletionRequest, LlmClient};
use crate::memory::{Content, MemoryStore, Role};

/// Foreground request path: persist the user's turn, call the model with
/// persona plus memory summary, persist the reply.
pub struct ChatHandler {
    memory: Arc<MemoryStore>,
    config: AgentConfig,
}

impl ChatHandler {
    pub fn new(memory: Arc<MemoryStore>, config: AgentConfig) -> Self {
        Self { memory, config }
    }

    /// System text for every request: the configured persona followed by
    /// the bounded memory summary.
    pub fn system_text(&self) -> Result<String> {
        Ok(format!(
            "{}\n\n{}",
            self.config.system_prompt,
            self.memory.summary()?
        ))
    }

    fn client(&self) -> Result<LlmClient> {
        let key = self
            .memory
            .api_key()?
            .context("no API key configured; add {\"api_key\": ...} to config.json in the data directory")?;
        Ok(LlmClient::new(
            &self.config.api_url,
            key,
            Duration::from_secs(self.config.request_timeout_secs),
        ))
    }

    fn request(&self) -> Result<CompletionRequest> {
        Ok(CompletionRequest {
            model: self.config.model.clone(),
            system: self.system_text()?,
            messages: self.memory.context_for_request(self.config.context_messages)?,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        })
    }

    /// Buffered round trip. The user turn is written to memory before the
    /// network call, so a failed request never loses it.
    pub async fn send(
        &self,
        text: &str,
        attachment: Option<(Vec<u8>, String)>,
    ) -> Result<String> {
        let content = match attachment {
            Some((bytes, media_type)) => image_content(&bytes, &media_type, text),
            None => Content::text(text),
        };
        self.memory.append(Role::User, content)?;

        let result = self.client()?.complete(&self.request()?).await?;
        self.memory
            .append(Role::Assistant, Content::text(&result.text))?;
        Ok(result.text)
    }

    /// Streamed variant. The caller renders deltas as they arrive, then
    /// hands the assembled text to `finish_streaming` to persist it.
    pub async fn send_streaming(&self, text: &str) -> Result<mpsc::Receiver<String>> {
        self.memory.append(Role::User, Content::text(text))?;
        let receiver = self.client()?.stream(&self.request()?).await?;
        Ok(receiver)
    }

    pub fn finish_streaming(&self, full_text: &str) -> Result<()> {
        if !full_text.is_empty() {
            self.memory
                .append(Role::Assistant, Content::text(full_text))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler(dir: &std::path::Path) -> ChatHandler {
        let memory = Arc::new(MemoryStore::open(dir).unwrap());
        let config = AgentConfig {
            data_dir: dir.to_path_buf(),
            ..AgentConfig::default()
        };
        ChatHandler::new(memory, config)
    }

    #[test]
    fn system_text_carries_persona_and_memory() {
        let dir = tempfile::tempdir().unwrap();
        let h = handler(dir.path());
        h.memory.append(Role::User, Content::text("hello")).unwrap();

        let system = h.system_text().unwrap();
        assert!(system.starts_with(&h.config.system_prompt));
        assert!(system.contains("=== MY MEMORY ==="));
        assert!(system.contains("hello"));
    }

    #[tokio::test]
    async fn user_turn_survives_a_failed_send() {
        let dir = tempfile::tempdir().unwrap();
        let h = handler(dir.path());

        // No API key in the store, so the request can never leave.
        let err = h.send("are you there?", None).await;
        assert!(err.is_err());

        let recent = h.memory.recent_messages(5).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].content.as_text(), "are you there?");
        assert_eq!(recent[0].role, Role::User);
    }

    #[test]
    fn finish_streaming_skips_empty_replies() {
        let dir = tempfile::tempdir().unwrap();
        let h = handler(dir.path());
        h.finish_streaming("").unwrap();
        assert!(h.memory.recent_messages(5).unwrap().is_empty());
        h.finish_streaming("partial reply").unwrap();
        assert_eq!(h.memory.recent_messages(5).unwrap().len(), 1);
    }
}
