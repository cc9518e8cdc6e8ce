pub mod error;
pub mod generator;
pub mod mock;
pub mod openai;

pub use error::{LLMError, Result};
pub use generator::{ChatStream, Embedder, Generator};
pub use mock::{EchoGenerator, HashEmbedder, ScriptedGenerator};
pub use openai::{OpenAiClient, OpenAiConfig, OpenAiEmbedder, OpenAiGenerator};
