//! Agent seam for turns that name an agent.
//!
//! An agent may call tools before answering, so it returns its whole
//! response at once together with the tools it used.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parley_core::{ChatChunk, GenerationRequest, Message, TokenUsage};
use parley_llm::Generator;

use crate::error::{RunnerError, RunnerResult};

/// Words per relayed chunk when an agent response is re-streamed
pub const AGENT_CHUNK_WORDS: usize = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct AgentRequest {
    pub agent_id: String,
    pub session_id: String,
    pub user_id: String,
    pub message: String,
    /// Recent conversation, oldest first, ending with the user message
    pub context: Vec<Message>,
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentOutcome {
    pub response: String,
    pub tools_used: Vec<String>,
    pub usage: Option<TokenUsage>,
}

#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(&self, request: AgentRequest) -> RunnerResult<AgentOutcome>;
}

/// Tool-less agent that answers with the generator directly.
pub struct GeneratorAgent {
    generator: Arc<dyn Generator>,
}

impl GeneratorAgent {
    pub fn new(generator: Arc<dyn Generator>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl AgentExecutor for GeneratorAgent {
    async fn execute(&self, request: AgentRequest) -> RunnerResult<AgentOutcome> {
        let mut generation = GenerationRequest::new().with_messages(request.context);
        if let Some(prompt) = request.system_prompt {
            generation = generation.with_system_prompt(prompt);
        }

        let mut stream = self.generator.generate(generation).await?;
        let mut outcome = AgentOutcome::default();
        while let Some(chunk) = stream.next().await {
            match chunk? {
                ChatChunk::Content { text } => outcome.response.push_str(&text),
                ChatChunk::Usage {
                    input_tokens,
                    output_tokens,
                } => outcome.usage = Some(TokenUsage::new(input_tokens, output_tokens)),
                ChatChunk::Error { message } => return Err(RunnerError::agent(message)),
                ChatChunk::Start { .. } | ChatChunk::Finish { .. } => {}
            }
        }
        Ok(outcome)
    }
}

/// Split text into groups of `words` words, each followed by a space.
pub fn chunk_words(text: &str, words: usize) -> Vec<String> {
    let parts: Vec<&str> = text.split(' ').collect();
    parts
        .chunks(words.max(1))
        .map(|group| format!("{} ", group.join(" ")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_llm::ScriptedGenerator;

    #[test]
    fn test_chunk_words() {
        let chunks = chunk_words("one two three four five six seven", 5);
        assert_eq!(chunks, vec!["one two three four five ", "six seven "]);
        assert_eq!(chunk_words("solo", 5), vec!["solo "]);
    }

    #[tokio::test]
    async fn test_generator_agent_collects_response() {
        let generator = Arc::new(ScriptedGenerator::new(vec![
            ChatChunk::content("The answer"),
            ChatChunk::content(" is 42."),
            ChatChunk::usage(12, 4),
        ]));
        let agent = GeneratorAgent::new(generator.clone());

        let outcome = agent
            .execute(AgentRequest {
                agent_id: "a1".to_string(),
                session_id: "s1".to_string(),
                user_id: "alice".to_string(),
                message: "question".to_string(),
                context: vec![Message::user("question")],
                system_prompt: Some("You are an agent.".to_string()),
            })
            .await
            .unwrap();

        assert_eq!(outcome.response, "The answer is 42.");
        assert!(outcome.tools_used.is_empty());
        assert_eq!(outcome.usage, Some(TokenUsage::new(12, 4)));
        assert_eq!(
            generator.requests()[0].system_prompt.as_deref(),
            Some("You are an agent.")
        );
    }
}
