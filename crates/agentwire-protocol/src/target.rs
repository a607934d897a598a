//! Request targets and their validation.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{AgentError, AgentResult};

/// Whether a request fans out to every matching agent or to any one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Selector {
    /// Deliver to any one matching agent.
    #[default]
    Any,
    /// Deliver to all matching agents.
    All,
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "any"),
            Self::All => write!(f, "all"),
        }
    }
}

/// Routing scope restricting a target selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    /// Account the target agents belong to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<u64>,
    /// Shard the target agents belong to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard: Option<u64>,
}

impl Scope {
    /// Whether neither account nor shard is set.
    pub fn is_empty(&self) -> bool {
        self.account.is_none() && self.shard.is_none()
    }
}

/// Target of a push or request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Target {
    /// A literal agent identity.
    Identity(String),
    /// A specific agent addressed by id.
    Agent {
        /// Identity of the agent
        agent_id: String,
    },
    /// Agents selected by tags and/or scope.
    Selection {
        /// Tags the agents must carry
        #[serde(skip_serializing_if = "Option::is_none")]
        tags: Option<Vec<String>>,
        /// Routing scope
        #[serde(skip_serializing_if = "Option::is_none")]
        scope: Option<Scope>,
        /// Fan-out selector
        #[serde(skip_serializing_if = "Option::is_none")]
        selector: Option<Selector>,
    },
}

impl Target {
    /// Target a single agent by identity.
    pub fn identity(id: impl Into<String>) -> Self {
        Self::Identity(id.into())
    }

    /// Target a single agent by `agent_id`.
    pub fn agent(agent_id: impl Into<String>) -> Self {
        Self::Agent {
            agent_id: agent_id.into(),
        }
    }

    /// Target agents carrying all of the given tags.
    pub fn tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Selection {
            tags: Some(tags.into_iter().map(Into::into).collect()),
            scope: None,
            selector: None,
        }
    }

    /// Replace the selector of a selection target.
    ///
    /// Has no effect on identity or agent targets.
    #[must_use]
    pub fn with_selector(self, selector: Selector) -> Self {
        match self {
            Self::Selection { tags, scope, .. } => Self::Selection {
                tags,
                scope,
                selector: Some(selector),
            },
            other => other,
        }
    }

    /// Replace the scope of a selection target.
    #[must_use]
    pub fn with_scope(self, scope: Scope) -> Self {
        match self {
            Self::Selection { tags, selector, .. } => Self::Selection {
                tags,
                scope: Some(scope),
                selector,
            },
            other => other,
        }
    }

    /// The single agent this target names, if any.
    pub fn agent_identity(&self) -> Option<&str> {
        match self {
            Self::Identity(id) => Some(id),
            Self::Agent { agent_id } => Some(agent_id),
            Self::Selection { .. } => None,
        }
    }

    /// The selector of this target, `Any` unless a selection says otherwise.
    pub fn selector(&self) -> Selector {
        match self {
            Self::Selection {
                selector: Some(s), ..
            } => *s,
            _ => Selector::Any,
        }
    }

    /// Check the shape of a typed target.
    ///
    /// `allow_selector` is false for requests, which may not fan out.
    pub fn validate(&self, allow_selector: bool) -> AgentResult<()> {
        if let Self::Selection {
            tags,
            scope,
            selector,
        } = self
        {
            if tags.is_none() && scope.is_none() && selector.is_none() {
                return Err(invalid("Invalid target hash", self));
            }
            if selector.is_some() && !allow_selector {
                return Err(invalid("Invalid target hash", self));
            }
            if let Some(scope) = scope
                && scope.is_empty()
            {
                return Err(invalid("Invalid target scope", self));
            }
        }
        Ok(())
    }

    /// Parse and validate a loosely-typed target.
    ///
    /// Accepts `null`, a string identity, or an object restricted to either
    /// `agent_id` alone or any combination of `tags`, `scope` and `selector`.
    pub fn from_value(value: &Value, allow_selector: bool) -> AgentResult<Option<Self>> {
        let target = match value {
            Value::Null => return Ok(None),
            Value::String(s) => Self::Identity(s.clone()),
            Value::Object(map) => parse_hash(map, value)?,
            other => return Err(invalid_value("Invalid target", other)),
        };
        target.validate(allow_selector)?;
        Ok(Some(target))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(s) => f.write_str(&s),
            Err(_) => write!(f, "{self:?}"),
        }
    }
}

impl From<&str> for Target {
    fn from(id: &str) -> Self {
        Self::Identity(id.to_string())
    }
}

fn parse_hash(map: &Map<String, Value>, raw: &Value) -> AgentResult<Target> {
    if map.is_empty() {
        return Err(invalid_value("Invalid target hash", raw));
    }

    if let Some(agent_id) = map.get("agent_id") {
        if map.len() > 1 {
            return Err(invalid_value("Invalid target", raw));
        }
        let agent_id = agent_id
            .as_str()
            .ok_or_else(|| invalid_value("Invalid target", raw))?;
        return Ok(Target::agent(agent_id));
    }

    if map
        .keys()
        .any(|k| !matches!(k.as_str(), "tags" | "scope" | "selector"))
    {
        return Err(invalid_value("Invalid target hash", raw));
    }

    let tags = match map.get("tags") {
        None => None,
        Some(Value::Array(items)) => Some(
            items
                .iter()
                .map(|t| {
                    t.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| invalid_value("Invalid target tags", raw))
                })
                .collect::<AgentResult<Vec<_>>>()?,
        ),
        Some(_) => return Err(invalid_value("Invalid target tags", raw)),
    };

    let scope = match map.get("scope") {
        None => None,
        Some(Value::Object(s))
            if !s.is_empty() && s.keys().all(|k| matches!(k.as_str(), "account" | "shard")) =>
        {
            Some(Scope {
                account: s.get("account").and_then(Value::as_u64),
                shard: s.get("shard").and_then(Value::as_u64),
            })
        }
        Some(_) => return Err(invalid_value("Invalid target scope", raw)),
    };

    let selector = match map.get("selector") {
        None => None,
        Some(Value::String(s)) if s == "any" => Some(Selector::Any),
        Some(Value::String(s)) if s == "all" => Some(Selector::All),
        Some(_) => return Err(invalid_value("Invalid target selector", raw)),
    };

    Ok(Target::Selection {
        tags,
        scope,
        selector,
    })
}

fn invalid(prefix: &str, target: &Target) -> AgentError {
    AgentError::InvalidArgument(format!("{prefix} {target}"))
}

fn invalid_value(prefix: &str, value: &Value) -> AgentError {
    AgentError::InvalidArgument(format!("{prefix} {value}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rejects(value: Value, allow_selector: bool, prefix: &str) {
        match Target::from_value(&value, allow_selector) {
            Err(AgentError::InvalidArgument(msg)) => {
                assert!(msg.starts_with(prefix), "{msg} should start with {prefix}")
            }
            other => panic!("expected rejection of {value}, got {other:?}"),
        }
    }

    #[test]
    fn test_accepts_nil_and_named_targets() {
        assert_eq!(Target::from_value(&Value::Null, true).unwrap(), None);
        assert_eq!(
            Target::from_value(&json!("name"), true).unwrap(),
            Some(Target::identity("name"))
        );
    }

    #[test]
    fn test_agent_id_must_be_alone() {
        assert_eq!(
            Target::from_value(&json!({"agent_id": "rs-agent-1-1"}), true).unwrap(),
            Some(Target::agent("rs-agent-1-1"))
        );
        rejects(
            json!({"agent_id": "rs-agent-1-1", "tags": ["a:b=c"]}),
            true,
            "Invalid target",
        );
    }

    #[test]
    fn test_selector_rules() {
        assert!(Target::from_value(&json!({"selector": "all"}), true).is_ok());
        assert!(Target::from_value(&json!({"selector": "any"}), true).is_ok());
        rejects(json!({"selector": "other"}), true, "Invalid target selector");
        rejects(json!({"selector": "all"}), false, "Invalid target hash");
    }

    #[test]
    fn test_tags_rules() {
        assert!(Target::from_value(&json!({"tags": []}), true).is_ok());
        assert!(Target::from_value(&json!({"tags": ["tag"]}), true).is_ok());
        rejects(json!({"tags": {}}), true, "Invalid target tags");
    }

    #[test]
    fn test_scope_rules() {
        assert!(Target::from_value(&json!({"scope": {"account": 1}}), true).is_ok());
        assert!(Target::from_value(&json!({"scope": {"shard": 1}}), true).is_ok());
        assert!(Target::from_value(&json!({"scope": {"shard": 1, "account": 1}}), true).is_ok());
        rejects(
            json!({"scope": {"shard": 1, "account": 1, "other": 2}}),
            true,
            "Invalid target scope",
        );
        rejects(json!({"scope": {}}), true, "Invalid target scope");
    }

    #[test]
    fn test_combinations() {
        assert!(Target::from_value(&json!({"scope": {"shard": 1}, "tags": []}), true).is_ok());
        let full = json!({"scope": {"shard": 1}, "tags": ["tag"], "selector": "all"});
        assert!(Target::from_value(&full, true).is_ok());
        rejects(full, false, "Invalid target hash");
        rejects(
            json!({"scope": {"shard": 1}, "tags": [], "selector": "all", "other": 2}),
            true,
            "Invalid target hash",
        );
        rejects(json!({}), true, "Invalid target hash");
        rejects(json!([]), true, "Invalid target");
    }

    #[test]
    fn test_typed_validation() {
        let empty = Target::Selection {
            tags: None,
            scope: None,
            selector: None,
        };
        assert!(empty.validate(true).is_err());
        assert!(Target::tags(["a:b=c"]).with_selector(Selector::All).validate(false).is_err());
        assert!(Target::tags(["a:b=c"]).with_scope(Scope::default()).validate(true).is_err());
        assert_eq!(Target::tags(["a"]).with_selector(Selector::All).selector(), Selector::All);
    }

    #[test]
    fn test_serializes_like_a_hash() {
        let target = Target::tags(["a:b=c"]).with_scope(Scope {
            account: Some(123),
            shard: None,
        });
        assert_eq!(
            serde_json::to_value(&target).unwrap(),
            json!({"tags": ["a:b=c"], "scope": {"account": 123}})
        );
        assert_eq!(serde_json::to_value(Target::agent("a")).unwrap(), json!({"agent_id": "a"}));
    }
}
