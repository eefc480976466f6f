//! Typed input schema of an app template

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed set of field kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Kind {
    /// `true` / `false`
    Boolean,
    /// Signed integer
    Integer,
    /// Free-form string
    String,
    /// List of strings
    StringArray,
    /// Integer in 1..=65535
    Port,
    /// Network name, resolved against the catalog
    Network,
    /// List of network names
    MultiNetwork,
    /// `{enabled, groups}`
    Auth,
    /// `{public, private}`, generated when absent
    SshKey,
    /// VPN pre-authentication key, issued when absent
    VpnAuthKey,
    /// Nested fields
    Struct,
}

/// Property naming a boolean input field that switches a VPN key on
pub const ENABLED_FIELD: &str = "enabledField";
/// Property giving the VPN user name verbatim
pub const USERNAME: &str = "username";
/// Property naming the input field holding the VPN user name
pub const USERNAME_FIELD: &str = "usernameField";

/// One schema field
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Field {
    /// Key in the input object
    pub name: String,
    /// Field kind
    pub kind: Kind,
    /// Absent values are fine
    #[serde(default)]
    pub optional: bool,
    /// Used when the input has no value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Kind specific settings such as [`USERNAME_FIELD`]
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
    /// Children of a `struct` field
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<Field>,
}

impl Field {
    /// Required field without default
    pub fn new(name: impl Into<String>, kind: Kind) -> Self {
        Self {
            name: name.into(),
            kind,
            optional: false,
            default: None,
            properties: BTreeMap::new(),
            fields: Vec::new(),
        }
    }

    /// Set the default value
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    /// Mark optional
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Add a property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Set struct children
    pub fn with_fields(mut self, fields: Vec<Field>) -> Self {
        self.fields = fields;
        self
    }

    /// Schema that the value of this field follows, for the composite kinds
    pub fn nested(&self) -> Option<Schema> {
        match self.kind {
            Kind::Auth => Some(Schema::auth()),
            Kind::SshKey => Some(Schema::ssh_key()),
            Kind::Struct => Some(Schema {
                fields: self.fields.clone(),
            }),
            _ => None,
        }
    }
}

/// Ordered list of fields
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    /// Top-level fields
    #[serde(default)]
    pub fields: Vec<Field>,
}

impl Schema {
    /// Look a field up by name
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Shape of `auth` values
    pub fn auth() -> Self {
        Self {
            fields: vec![
                Field::new("enabled", Kind::Boolean).with_default(Value::Bool(false)),
                Field::new("groups", Kind::String).with_default(Value::String(String::new())),
            ],
        }
    }

    /// Shape of `ssh-key` values
    pub fn ssh_key() -> Self {
        Self {
            fields: vec![
                Field::new("public", Kind::String),
                Field::new("private", Kind::String),
            ],
        }
    }
}

/// Join a parent path and a field name with a dot
pub(crate) fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", parent, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_schema_from_yaml() {
        let schema: Schema = serde_yaml::from_str(
            r#"
fields:
  - name: network
    kind: network
    default: Public
  - name: vpn
    kind: struct
    fields:
      - name: enabled
        kind: boolean
        default: false
  - name: authKey
    kind: vpn-auth-key
    optional: true
    properties:
      enabledField: vpn.enabled
      usernameField: username
"#,
        )
        .expect("parse");
        assert_eq!(schema.fields.len(), 3);
        assert_eq!(schema.fields[0].default, Some(Value::String("Public".into())));
        assert_eq!(schema.fields[1].nested().expect("struct").fields.len(), 1);
        let key = schema.field("authKey").expect("field");
        assert_eq!(key.kind, Kind::VpnAuthKey);
        assert_eq!(key.properties.get(ENABLED_FIELD).map(String::as_str), Some("vpn.enabled"));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let parsed: Result<Schema, _> =
            serde_yaml::from_str("fields:\n  - name: x\n    kind: cluster\n");
        assert!(parsed.is_err());
    }

    #[test]
    fn paths_join_with_dots() {
        assert_eq!(join_path("", "a"), "a");
        assert_eq!(join_path("a.b", "c"), "a.b.c");
    }
}
