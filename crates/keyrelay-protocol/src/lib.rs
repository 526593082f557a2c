//! Wire types for the OpenAI-compatible surface and the OpenRouter upstream.

pub mod openai;
pub mod openrouter;
