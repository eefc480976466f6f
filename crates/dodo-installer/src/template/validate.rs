//! Check derived values against the schema and the template constraints

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use dodo_common::template::TemplateEngine;

use crate::error::{Error, Result};
use crate::template::schema::{join_path, Field, Kind, Schema};

/// Boolean expression that must hold for the input to be accepted
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    /// Field reported when the expression is false
    pub field: String,
    /// Expression over `release`, `global` and `input`
    pub expr: String,
    /// Message reported when the expression is false
    pub message: String,
}

/// Validate derived values, then evaluate `constraints` over `ctx`
pub fn unify(
    schema: &Schema,
    derived: &Map<String, Value>,
    constraints: &[Constraint],
    engine: &TemplateEngine,
    ctx: &Value,
) -> Result<()> {
    check_fields(&schema.fields, derived, "")?;
    for c in constraints {
        let holds = engine
            .eval_bool(&c.expr, ctx)
            .map_err(|e| Error::schema(c.field.clone(), format!("invalid constraint: {}", e)))?;
        if !holds {
            return Err(Error::schema(c.field.clone(), c.message.clone()));
        }
    }
    Ok(())
}

fn check_fields(fields: &[Field], values: &Map<String, Value>, path: &str) -> Result<()> {
    for field in fields {
        let field_path = join_path(path, &field.name);
        match values.get(&field.name) {
            Some(v) => check_value(field, v, &field_path)?,
            None if field.optional || field.kind == Kind::VpnAuthKey => {}
            None => return Err(Error::schema(field_path, "required field is missing")),
        }
    }
    Ok(())
}

fn check_value(field: &Field, value: &Value, path: &str) -> Result<()> {
    let fail = |msg: &str| Err(Error::schema(path, msg));
    match field.kind {
        Kind::Boolean if !value.is_boolean() => fail("expected a boolean"),
        Kind::Integer if value.as_i64().is_none() => fail("expected an integer"),
        Kind::Port => match value.as_u64() {
            Some(p) if (1..=65535).contains(&p) => Ok(()),
            _ => fail("port must be in 1..65535"),
        },
        Kind::String | Kind::VpnAuthKey if !value.is_string() => fail("expected a string"),
        Kind::StringArray if !value.as_array().is_some_and(|a| a.iter().all(Value::is_string)) => {
            fail("expected a list of strings")
        }
        Kind::Network if !is_network(value) => fail("expected a resolved network"),
        Kind::MultiNetwork if !value.as_array().is_some_and(|a| a.iter().all(is_network)) => {
            fail("expected resolved networks")
        }
        Kind::Auth | Kind::SshKey | Kind::Struct => {
            let obj = value
                .as_object()
                .ok_or_else(|| Error::schema(path, "expected an object"))?;
            let nested = field.nested().unwrap_or_default();
            check_fields(&nested.fields, obj, path)
        }
        _ => Ok(()),
    }
}

fn is_network(value: &Value) -> bool {
    value.get("name").is_some_and(Value::is_string)
}
