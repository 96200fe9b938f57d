//! Token stream intake types.
//!
//! The token-generation backend is an opaque producer: an ordered sequence of
//! text fragments for one stream session, terminated by a completion carrying
//! the durable message id or by an error.

use futures::stream::BoxStream;

use crate::error::CanvasError;

/// One item delivered by the token producer.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamSignal {
    /// Next text fragment of the reply.
    Chunk(String),
    /// Generation finished and the reply was written under `message_id`.
    Complete { message_id: String },
    /// Generation failed. A durable id may still exist if the backend wrote a
    /// partial reply before failing.
    Failed {
        error: CanvasError,
        message_id: Option<String>,
    },
}

impl StreamSignal {
    pub fn chunk(text: impl Into<String>) -> Self {
        Self::Chunk(text.into())
    }

    pub fn complete(message_id: impl Into<String>) -> Self {
        Self::Complete {
            message_id: message_id.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Chunk(_))
    }
}

/// A boxed token stream as handed over by the producer.
pub type TokenStream = BoxStream<'static, StreamSignal>;
