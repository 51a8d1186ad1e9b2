use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::debug;

use crate::connection::{BrokerError, ConnectionBroker};
use crate::error::{Error, Result};
use crate::tool::{Identity, ToolCatalog, ToolDescriptor};

/// Turns capability names into bound, invocable tool handles.
///
/// Resolution is all-or-nothing: one unknown or unauthorized name fails the
/// whole set.
pub struct CatalogResolver {
    broker: Arc<dyn ConnectionBroker>,
}

impl CatalogResolver {
    pub fn new(broker: Arc<dyn ConnectionBroker>) -> Self {
        Self { broker }
    }

    pub async fn resolve(
        &self,
        identity: &Identity,
        tool_names: &BTreeSet<String>,
    ) -> Result<ToolCatalog> {
        if tool_names.is_empty() {
            return Err(Error::UnknownCapability("<empty capability set>".to_string()));
        }

        let mut by_toolkit: BTreeMap<String, Vec<ToolDescriptor>> = BTreeMap::new();
        for name in tool_names {
            let descriptor = self
                .broker
                .describe(identity, name)
                .await
                .map_err(|e| describe_failure(name, e))?
                .ok_or_else(|| Error::UnknownCapability(name.clone()))?;

            by_toolkit
                .entry(descriptor.toolkit.clone())
                .or_default()
                .push(descriptor);
        }

        let mut catalog = ToolCatalog::new();
        for (toolkit, descriptors) in &by_toolkit {
            let handles = self
                .broker
                .authorize_and_bind(identity, toolkit, descriptors)
                .await
                .map_err(|e| bind_failure(&descriptors[0].name, toolkit, e))?;

            for handle in handles {
                let name = handle.descriptor().name.clone();
                if tool_names.contains(&name) {
                    catalog.insert(name, handle);
                }
            }

            if let Some(missing) = descriptors.iter().find(|d| !catalog.contains_key(&d.name)) {
                return Err(Error::UnauthorizedCapability {
                    capability: missing.name.clone(),
                    toolkit: toolkit.clone(),
                    reason: "no handle bound for capability".to_string(),
                });
            }

            debug!(
                user = %identity.user_id,
                toolkit = %toolkit,
                tools = descriptors.len(),
                "Bound toolkit"
            );
        }

        Ok(catalog)
    }
}

/// A failed lookup is not evidence that the capability is missing; only
/// `Ok(None)` is.
fn describe_failure(name: &str, err: BrokerError) -> Error {
    if err.is_access_denied() {
        return Error::UnauthorizedCapability {
            capability: name.to_string(),
            toolkit: toolkit_of(name),
            reason: err.to_string(),
        };
    }
    Error::Unknown(format!("Failed to look up capability {name}: {err}"))
}

fn bind_failure(name: &str, toolkit: &str, err: BrokerError) -> Error {
    match err {
        BrokerError::Unavailable(_) | BrokerError::Transport(_) => {
            Error::Unknown(format!("Failed to bind toolkit {toolkit}: {err}"))
        }
        _ => Error::UnauthorizedCapability {
            capability: name.to_string(),
            toolkit: toolkit.to_string(),
            reason: err.to_string(),
        },
    }
}

/// Toolkit slug implied by a capability name (`GMAIL_SEND_EMAIL` -> `gmail`)
fn toolkit_of(name: &str) -> String {
    name.split('_').next().unwrap_or(name).to_ascii_lowercase()
}
