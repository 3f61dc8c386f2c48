//! External-service adapters: the parliamentary open-data API and the
//! completion backend used to phrase polls as citizen questions.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

mod synthesis;
mod text;
mod upstream;

pub use synthesis::{
    extract_json_object, mentions_outcome, ChatMessage, CompletionBackend, CompletionRequest, OpenRouterBackend,
    OpenRouterConfig, QuestionSynthesizer, SynthesisConfig, SynthesisError, DEFAULT_LLM_MODEL, DEFAULT_LLM_URL,
};
pub use text::{clean_description, truncate_on_boundary, DESCRIPTION_BUDGET};
pub use upstream::{
    parse_polls_response, parse_votes_response, AbgeordnetenwatchClient, PollSource, UpstreamConfig, UpstreamError,
    DEFAULT_UPSTREAM_URL,
};

pub const CRATE_NAME: &str = "votematch-adapters";

/// Read a recorded upstream payload from disk.
pub fn read_fixture(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    fs::read_to_string(path).with_context(|| format!("reading fixture {}", path.display()))
}
