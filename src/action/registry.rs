//! Action registry: turns declared actions into an immutable route table.

use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{ActionDefinition, ActionVersion};
use crate::lock::LockProvider;
use crate::session::SessionType;
use crate::types::{Error, Result};
use crate::validation::{object_id_schema, Schema, ValidationRules};

/// A registered action with its compiled rules.
#[derive(Debug, Clone)]
pub struct Route {
    pub action: Arc<ActionDefinition>,
    pub rules: Arc<ValidationRules>,
}

/// Route key → action. Immutable once built.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: BTreeMap<String, Route>,
}

impl RouteTable {
    pub fn get(&self, key: &str) -> Option<&Route> {
        self.routes.get(key)
    }

    pub fn get_versioned(&self, name: &str, version: &ActionVersion) -> Option<&Route> {
        self.routes.get(&super::route_key(name, Some(version)))
    }

    /// Every registered version of the action called `name`.
    pub fn versions_of(&self, name: &str) -> BTreeMap<ActionVersion, Route> {
        self.routes
            .values()
            .filter(|route| route.action.name() == name)
            .map(|route| (route.action.version(), route.clone()))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Route)> {
        self.routes.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Build the route table.
///
/// Fails (and logs the offending action) when an action derives a lock
/// resource but no lock provider is available, or when its rules do not
/// compile. Duplicate keys overwrite silently.
pub fn register(
    actions: impl IntoIterator<Item = ActionDefinition>,
    lock_provider: Option<&dyn LockProvider>,
) -> Result<RouteTable> {
    tracing::info!("Start actions initialization");

    let mut routes = BTreeMap::new();
    for action in actions {
        let key = action.route_key();
        let route = build_route(action, lock_provider.is_some()).map_err(|err| {
            tracing::error!(action = %key, error = %err, "Failed to init actions");
            err
        })?;
        routes.insert(key.clone(), route);
        tracing::info!("Action [{}] initialized", key);
    }

    Ok(RouteTable { routes })
}

fn build_route(action: ActionDefinition, has_lock_provider: bool) -> Result<Route> {
    if action.needs_lock() && !has_lock_provider {
        return Err(Error::registration(format!(
            "action {} derives a lock resource but no lock provider is configured",
            action.route_key()
        )));
    }

    let rules = validation_rules(&action)?;
    Ok(Route {
        action: Arc::new(action),
        rules: Arc::new(rules),
    })
}

/// Derive the parameter and session schemas of one action.
pub fn validation_rules(action: &ActionDefinition) -> Result<ValidationRules> {
    let params = action
        .params_rules()
        .cloned()
        .map(ValidationRules::wrap_params)
        .map(Schema::compile)
        .transpose()?;
    let session = session_rule(action.session_type())
        .map(Schema::compile)
        .transpose()?;

    Ok(ValidationRules { params, session })
}

/// Structural session rule: partner and acquirer sessions must expose a
/// resolvable account identifier.
pub fn session_rule(session_type: SessionType) -> Option<Value> {
    let field = match session_type {
        SessionType::Acquirer => "acquirer",
        SessionType::Partner => "partner",
        _ => return None,
    };
    Some(json!({
        "type": "object",
        "properties": {
            field: {
                "type": "object",
                "properties": { "_id": object_id_schema() },
                "required": ["_id"],
            }
        },
        "required": [field],
    }))
}
