//! Derived values back to the shape of user input
//!
//! The projection is what gets stored as the instance `config` and what an
//! update starts from: networks collapse to their names and values the
//! platform generated on the user's behalf are dropped, so that an update
//! regenerates them only when the user never supplied any.

use serde_json::{Map, Value};

use crate::template::schema::{Kind, Schema};

/// Project `derived` onto `schema`, consulting the original `input` for
/// which generated values the user actually supplied
pub fn project(schema: &Schema, derived: &Map<String, Value>, input: &Value) -> Map<String, Value> {
    let mut out = Map::new();
    for field in &schema.fields {
        let Some(value) = derived.get(&field.name) else {
            continue;
        };
        let supplied = input.get(&field.name).filter(|v| !v.is_null());
        let projected = match field.kind {
            Kind::Network => value.get("name").cloned(),
            Kind::MultiNetwork => value.as_array().map(|networks| {
                Value::Array(
                    networks
                        .iter()
                        .filter_map(|n| n.get("name").cloned())
                        .collect(),
                )
            }),
            Kind::SshKey | Kind::VpnAuthKey => supplied.map(|_| value.clone()),
            Kind::Auth | Kind::Struct => {
                let nested = field.nested().unwrap_or_default();
                let empty = Value::Null;
                let sub_input = supplied.unwrap_or(&empty);
                value
                    .as_object()
                    .map(|obj| Value::Object(project(&nested, obj, sub_input)))
            }
            _ => Some(value.clone()),
        };
        if let Some(projected) = projected {
            out.insert(field.name.clone(), projected);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Schema {
        serde_yaml::from_str(
            r#"
fields:
  - name: network
    kind: network
  - name: extra
    kind: multi-network
    optional: true
  - name: sshKey
    kind: ssh-key
  - name: settings
    kind: struct
    fields:
      - name: deployKey
        kind: ssh-key
      - name: replicas
        kind: integer
"#,
        )
        .expect("schema")
    }

    #[test]
    fn networks_collapse_and_generated_keys_are_dropped() {
        let derived = json!({
            "network": {"name": "Public", "domain": "lekva.me"},
            "extra": [{"name": "Public"}, {"name": "Private"}],
            "sshKey": {"public": "generated", "private": "generated"},
            "settings": {
                "deployKey": {"public": "mine", "private": "mine"},
                "replicas": 2,
            },
        });
        let input = json!({
            "network": "Public",
            "extra": ["Public", "Private"],
            "settings": {"deployKey": {"public": "mine", "private": "mine"}, "replicas": 2},
        });
        let projected = project(&schema(), derived.as_object().expect("object"), &input);
        assert_eq!(
            Value::Object(projected),
            json!({
                "network": "Public",
                "extra": ["Public", "Private"],
                "settings": {
                    "deployKey": {"public": "mine", "private": "mine"},
                    "replicas": 2,
                },
            })
        );
    }
}
