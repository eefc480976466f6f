//! Input values to derived values
//!
//! Derivation type-checks what the user supplied, resolves network names
//! against the catalog and fills in what the user left out: defaults,
//! freshly generated SSH keys and VPN keys issued on the user's behalf.

use futures::future::BoxFuture;
use serde_json::{Map, Value};

use dodo_common::keys::SshKeyPair;

use crate::env::{find_network, Network};
use crate::error::{Error, Result};
use crate::template::schema::{join_path, Field, Kind, ENABLED_FIELD, USERNAME, USERNAME_FIELD};
use crate::template::Schema;
use crate::vpn::VpnKeyIssuer;

/// What derivation needs besides the input
#[derive(Clone, Copy)]
pub struct DeriveContext<'a> {
    /// Network catalog of the environment
    pub networks: &'a [Network],
    /// Issuer for absent `vpn-auth-key` fields
    pub vpn: Option<&'a dyn VpnKeyIssuer>,
}

/// Derive `input` against `schema`
pub async fn derive(
    schema: &Schema,
    input: &Value,
    ctx: DeriveContext<'_>,
) -> Result<Map<String, Value>> {
    derive_fields(&schema.fields, input, input, String::new(), ctx).await
}

fn derive_fields<'a>(
    fields: &'a [Field],
    values: &'a Value,
    root: &'a Value,
    path: String,
    ctx: DeriveContext<'a>,
) -> BoxFuture<'a, Result<Map<String, Value>>> {
    Box::pin(async move {
        let empty = Map::new();
        let obj = match values {
            Value::Object(obj) => obj,
            Value::Null => &empty,
            _ => return Err(Error::schema(display_path(&path), "expected an object")),
        };
        if let Some(unknown) = obj.keys().find(|k| !fields.iter().any(|f| &f.name == *k)) {
            return Err(Error::schema(join_path(&path, unknown), "unknown field"));
        }

        let mut out = Map::new();
        for field in fields {
            let field_path = join_path(&path, &field.name);
            let value = match obj.get(&field.name).filter(|v| !v.is_null()) {
                Some(v) => Some(derive_present(field, v, root, field_path, ctx).await?),
                None => derive_absent(field, root, field_path, ctx).await?,
            };
            if let Some(value) = value {
                out.insert(field.name.clone(), value);
            }
        }
        Ok(out)
    })
}

async fn derive_present(
    field: &Field,
    value: &Value,
    root: &Value,
    path: String,
    ctx: DeriveContext<'_>,
) -> Result<Value> {
    let mismatch = |expected: &str| Error::schema(path.clone(), format!("expected {}", expected));
    match field.kind {
        Kind::Boolean if value.is_boolean() => Ok(value.clone()),
        Kind::Boolean => Err(mismatch("a boolean")),
        Kind::Integer | Kind::Port if value.is_i64() || value.is_u64() => Ok(value.clone()),
        Kind::Integer | Kind::Port => Err(mismatch("an integer")),
        Kind::String | Kind::VpnAuthKey if value.is_string() => Ok(value.clone()),
        Kind::String | Kind::VpnAuthKey => Err(mismatch("a string")),
        Kind::StringArray => match value.as_array() {
            Some(items) if items.iter().all(Value::is_string) => Ok(value.clone()),
            _ => Err(mismatch("a list of strings")),
        },
        Kind::Network => {
            let name = value.as_str().ok_or_else(|| mismatch("a network name"))?;
            resolve_network(ctx.networks, name, &path)
        }
        Kind::MultiNetwork => {
            let names = value.as_array().ok_or_else(|| mismatch("a list of network names"))?;
            let mut picked = Vec::with_capacity(names.len());
            for (i, name) in names.iter().enumerate() {
                let item_path = format!("{}[{}]", path, i);
                let name = name
                    .as_str()
                    .ok_or_else(|| Error::schema(item_path.clone(), "expected a network name"))?;
                picked.push(resolve_network(ctx.networks, name, &item_path)?);
            }
            Ok(Value::Array(picked))
        }
        Kind::Auth | Kind::SshKey | Kind::Struct => {
            let nested = field.nested().unwrap_or_default();
            let derived = derive_fields(&nested.fields, value, root, path.clone(), ctx).await?;
            Ok(Value::Object(derived))
        }
    }
}

async fn derive_absent(
    field: &Field,
    root: &Value,
    path: String,
    ctx: DeriveContext<'_>,
) -> Result<Option<Value>> {
    match field.kind {
        Kind::SshKey => {
            let key = SshKeyPair::generate()?;
            return Ok(Some(serde_json::to_value(key)?));
        }
        Kind::VpnAuthKey => return issue_vpn_key(field, root, path, ctx).await,
        _ => {}
    }
    if let Some(default) = &field.default {
        return derive_present(field, default, root, path, ctx).await.map(Some);
    }
    match field.kind {
        Kind::Auth | Kind::Struct => {
            let empty = Value::Object(Map::new());
            derive_present(field, &empty, root, path, ctx).await.map(Some)
        }
        _ if field.optional => Ok(None),
        _ => Err(Error::schema(path, "required field is missing")),
    }
}

async fn issue_vpn_key(
    field: &Field,
    root: &Value,
    path: String,
    ctx: DeriveContext<'_>,
) -> Result<Option<Value>> {
    if let Some(enabled_field) = field.properties.get(ENABLED_FIELD) {
        let enabled = lookup(root, enabled_field)
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !enabled {
            return Ok(None);
        }
    }
    let username = match (
        field.properties.get(USERNAME),
        field.properties.get(USERNAME_FIELD),
    ) {
        (Some(username), _) => username.clone(),
        (None, Some(username_field)) => lookup(root, username_field)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                Error::unresolved(
                    path.clone(),
                    format!("could not resolve username from {}", username_field),
                )
            })?,
        (None, None) => {
            return Err(Error::unresolved(path, "no username configured"));
        }
    };
    let issuer = ctx
        .vpn
        .ok_or_else(|| Error::unresolved(path.clone(), "no VPN key issuer configured"))?;
    let key = issuer.generate_auth_key(&username).await?;
    Ok(Some(Value::String(key)))
}

fn resolve_network(networks: &[Network], name: &str, path: &str) -> Result<Value> {
    let network = find_network(networks, name).ok_or_else(|| Error::UnknownNetwork {
        path: path.to_string(),
        name: name.to_string(),
    })?;
    Ok(serde_json::to_value(network)?)
}

/// Follow a dotted path from the input root
pub(crate) fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|s| !s.is_empty())
        .try_fold(root, |cur, key| cur.as_object()?.get(key))
}

fn display_path(path: &str) -> String {
    if path.is_empty() {
        "<root>".to_string()
    } else {
        path.to_string()
    }
}
