//! Channel qualification.
//!
//! Application code speaks in short channel names (`"pos.longpolling"`). The
//! bus speaks in qualified identifiers that also carry the tenant and scope,
//! serialized as a JSON array: `["shop","pos.longpolling","1"]`.

use std::fmt;

use serde_json::Value;

/// Bus-level channel key: (tenant, channel name, scope).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QualifiedChannel {
    /// Tenant (database) identifier.
    pub tenant: String,
    /// Application channel name.
    pub channel: String,
    /// Scope identifier.
    pub scope: String,
}

impl QualifiedChannel {
    /// Stable serialized form used as the bus subscription key.
    #[must_use]
    pub fn to_key(&self) -> String {
        Value::from(vec![
            self.tenant.as_str(),
            self.channel.as_str(),
            self.scope.as_str(),
        ])
        .to_string()
    }

    /// Parse a qualified identifier as delivered by the bus.
    ///
    /// Accepts a pre-parsed three element array or a string holding the JSON
    /// encoding of one. The scope may arrive as a number. Anything else is
    /// not a qualified channel.
    #[must_use]
    pub fn parse(raw: &Value) -> Option<Self> {
        match raw {
            Value::String(text) => serde_json::from_str::<Value>(text)
                .ok()
                .filter(Value::is_array)
                .and_then(|parsed| Self::parse(&parsed)),
            Value::Array(parts) => match parts.as_slice() {
                [tenant, channel, scope] => Some(Self {
                    tenant: tenant.as_str()?.to_string(),
                    channel: channel.as_str()?.to_string(),
                    scope: component_text(scope)?,
                }),
                _ => None,
            },
            _ => None,
        }
    }
}

impl fmt::Display for QualifiedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_key())
    }
}

fn component_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) if n.is_i64() || n.is_u64() => Some(n.to_string()),
        _ => None,
    }
}

/// Maps channel names to qualified identifiers for one tenant and scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelNamer {
    tenant: String,
    scope: String,
}

impl ChannelNamer {
    /// Create a namer for a tenant and scope.
    #[must_use]
    pub fn new(tenant: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            scope: scope.into(),
        }
    }

    /// Tenant component.
    #[must_use]
    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    /// Scope component.
    #[must_use]
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Qualified identifier for a channel name.
    #[must_use]
    pub fn qualify(&self, name: &str) -> QualifiedChannel {
        QualifiedChannel {
            tenant: self.tenant.clone(),
            channel: name.to_string(),
            scope: self.scope.clone(),
        }
    }

    /// Channel name carried by a bus identifier.
    ///
    /// Returns `None` when the identifier does not parse or belongs to a
    /// different tenant or scope.
    #[must_use]
    pub fn unqualify(&self, raw: &Value) -> Option<String> {
        let parsed = QualifiedChannel::parse(raw)?;
        (parsed.tenant == self.tenant && parsed.scope == self.scope).then_some(parsed.channel)
    }
}
