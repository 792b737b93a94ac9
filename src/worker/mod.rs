//! Message-passing bridges to isolated model worker threads.
//!
//! Each model runs on its own dedicated OS thread; the only way across the
//! boundary is a command channel in and a reply channel out. Two transport
//! shapes cover the three models: [`InferenceTransport`] for request/response
//! engines (STT, TTS) and [`LlmTransport`] for the streaming generator.

pub mod transport;

pub use transport::{
    GenerateHooks, InferenceRunner, InferenceTransport, LlmRunner, LlmTransport, ProgressHook,
};
