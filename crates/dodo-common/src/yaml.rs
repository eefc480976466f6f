//! Dotted-path access into `serde_yaml` documents
//!
//! Manifests are mutated by parse-modify-serialize; `serde_yaml::Mapping`
//! preserves key order so untouched fields come back out in the same order.

use serde_yaml::{Mapping, Value};

use crate::{Error, Result};

/// Look up `a.b.c` in a YAML document
pub fn get<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|s| !s.is_empty())
        .try_fold(doc, |cur, key| cur.as_mapping()?.get(key))
}

/// Look up `a.b.c` as a string
pub fn get_str<'a>(doc: &'a Value, path: &str) -> Option<&'a str> {
    get(doc, path).and_then(Value::as_str)
}

/// Return the mapping at `a.b.c`, creating empty intermediate mappings.
///
/// Null values along the way (`tcp:` with nothing after it) are replaced by
/// empty mappings; any other non-mapping value is an error.
pub fn mapping_mut<'a>(doc: &'a mut Value, path: &str) -> Result<&'a mut Mapping> {
    let mut cur = doc;
    let mut walked = String::new();
    for key in path.split('.').filter(|s| !s.is_empty()) {
        if !walked.is_empty() {
            walked.push('.');
        }
        walked.push_str(key);

        if cur.is_null() {
            *cur = Value::Mapping(Mapping::new());
        }
        let map = cur
            .as_mapping_mut()
            .ok_or_else(|| Error::invalid_document(walked.clone(), "expected a mapping"))?;
        cur = map
            .entry(Value::String(key.to_string()))
            .or_insert(Value::Null);
    }
    if cur.is_null() {
        *cur = Value::Mapping(Mapping::new());
    }
    cur.as_mapping_mut()
        .ok_or_else(|| Error::invalid_document(path, "expected a mapping"))
}

/// Render a scalar key the way it appears in the document
pub fn key_string(key: &Value) -> Option<String> {
    match key {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RELEASE: &str = r#"
apiVersion: helm.toolkit.fluxcd.io/v2beta1
kind: HelmRelease
spec:
  values:
    controller:
      service:
        type: LoadBalancer
    tcp:
      "2222": gerrit:29418
    udp:
"#;

    #[test]
    fn reads_nested_values() {
        let doc: Value = serde_yaml::from_str(RELEASE).expect("valid yaml");
        assert_eq!(
            get_str(&doc, "spec.values.controller.service.type"),
            Some("LoadBalancer")
        );
        assert!(get(&doc, "spec.values.missing").is_none());
    }

    #[test]
    fn null_mapping_becomes_empty_map() {
        let mut doc: Value = serde_yaml::from_str(RELEASE).expect("valid yaml");
        let udp = mapping_mut(&mut doc, "spec.values.udp").expect("udp");
        assert!(udp.is_empty());
        udp.insert("53".into(), "dns:53".into());
        assert_eq!(get_str(&doc, "spec.values.udp.53"), Some("dns:53"));
    }

    #[test]
    fn missing_intermediate_maps_are_created() {
        let mut doc: Value = serde_yaml::from_str("kind: HelmRelease").expect("valid yaml");
        mapping_mut(&mut doc, "spec.values.controller.service.nodePorts.tcp")
            .expect("created")
            .insert("30000".into(), 30000.into());
        assert!(get(&doc, "spec.values.controller.service.nodePorts.tcp.30000").is_some());
    }

    #[test]
    fn scalar_in_the_way_is_rejected() {
        let mut doc: Value = serde_yaml::from_str("spec: 3").expect("valid yaml");
        let err = mapping_mut(&mut doc, "spec.values").expect_err("spec is a scalar");
        assert!(err.to_string().contains("spec"));
    }

    #[test]
    fn untouched_keys_keep_their_order() {
        let mut doc: Value =
            serde_yaml::from_str("b: 1\na: 2\nspec:\n  z: 1\n  y: 2\n").expect("valid yaml");
        mapping_mut(&mut doc, "spec").expect("spec").insert("x".into(), 3.into());
        let out = serde_yaml::to_string(&doc).expect("serializes");
        assert_eq!(out, "b: 1\na: 2\nspec:\n  z: 1\n  y: 2\n  x: 3\n");
    }
}
