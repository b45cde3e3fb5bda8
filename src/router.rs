//! Model routing
//!
//! Pure resolver from a requested model name to an ordered fallback chain
//! of (provider, upstream model) pairs. The retry policy itself lives in
//! the pipeline, which can distinguish transport errors from status codes.

use thiserror::Error;

use crate::config::{ProviderConfig, RouteConfig};

#[derive(Error, Debug)]
pub enum RouteError {
    #[error("no providers configured")]
    NoProviders,
    #[error("route {0:?}: all providers unknown")]
    AllProvidersUnknown(String),
}

/// A resolved provider and model to attempt.
#[derive(Debug, Clone)]
pub struct Route {
    pub provider: ProviderConfig,
    pub model: String,
}

/// Resolves requested model names against configured aliases.
pub struct Router {
    providers: Vec<ProviderConfig>,
    routes: Vec<RouteConfig>,
}

impl Router {
    pub fn new(providers: Vec<ProviderConfig>, routes: Vec<RouteConfig>) -> Self {
        Self { providers, routes }
    }

    /// Resolve an ordered list of routes for the requested model.
    ///
    /// The first alias whose `model` matches wins; its targets are emitted
    /// in order, skipping targets that name unknown providers. A target
    /// with an empty model keeps the requested name. With no matching
    /// alias the first provider is used as-is.
    pub fn resolve(&self, requested_model: &str) -> Result<Vec<Route>, RouteError> {
        if self.providers.is_empty() {
            return Err(RouteError::NoProviders);
        }

        // First occurrence wins on duplicate provider names.
        let mut index = std::collections::HashMap::new();
        for provider in &self.providers {
            index.entry(provider.name.as_str()).or_insert(provider);
        }

        for route in &self.routes {
            if route.model != requested_model {
                continue;
            }
            let routes: Vec<Route> = route
                .targets
                .iter()
                .filter_map(|target| {
                    index.get(target.provider.as_str()).map(|provider| Route {
                        provider: (*provider).clone(),
                        model: if target.model.is_empty() {
                            requested_model.to_string()
                        } else {
                            target.model.clone()
                        },
                    })
                })
                .collect();
            if routes.is_empty() {
                return Err(RouteError::AllProvidersUnknown(requested_model.to_string()));
            }
            return Ok(routes);
        }

        Ok(vec![Route {
            provider: self.providers[0].clone(),
            model: requested_model.to_string(),
        }])
    }
}
