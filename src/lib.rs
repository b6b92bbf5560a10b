pub mod config;
pub mod image;
pub mod llm;
pub mod logging;
pub mod pipeline;
pub mod session;

pub use config::Config;
pub use llm::{AnalysisResult, Dispatcher, LLMClient};
pub use pipeline::Pipeline;
pub use session::Session;

pub type Result<T> = anyhow::Result<T>;
