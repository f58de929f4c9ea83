//! AI provider adapters and factory.

pub mod anthropic;
pub mod mock;

pub use anthropic::AnthropicProvider;
pub use mock::{MockProvider, ScriptedProvider};

use std::sync::Arc;

use crate::domain::errors::DomainResult;
use crate::domain::models::{ProviderConfig, ProviderKind};
use crate::domain::ports::AiProvider;

/// Create a provider from its configuration.
pub fn build_provider(name: &str, config: &ProviderConfig) -> DomainResult<Arc<dyn AiProvider>> {
    match config.kind {
        ProviderKind::Anthropic => Ok(Arc::new(AnthropicProvider::new(name, config.clone())?)),
        ProviderKind::Mock => Ok(Arc::new(MockProvider::new(name, config.model.clone()))),
    }
}
