//! Conversational agent seam

use crate::session::Message;
use crate::Result;
use async_trait::async_trait;

/// Receives streamed response text as it arrives
pub type ChunkSink<'a> = &'a mut (dyn FnMut(&str) + Send);

/// A language-model agent that answers a message history under a directive
#[async_trait]
pub trait ConversationalAgent: Send + Sync {
    /// Return the complete response to `history`
    async fn complete(&self, history: &[Message], directive: &str) -> Result<String>;

    /// Deliver the response in chunks, then return it whole
    ///
    /// Agents without native streaming deliver a single chunk.
    async fn complete_streaming(
        &self,
        history: &[Message],
        directive: &str,
        on_chunk: ChunkSink<'_>,
    ) -> Result<String> {
        let response = self.complete(history, directive).await?;
        on_chunk(&response);
        Ok(response)
    }
}
