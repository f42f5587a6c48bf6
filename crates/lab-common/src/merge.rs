//! Recursive configuration merge.

use serde_json::Value;

use crate::envelope::ParamMap;

/// Merge `patch` into `base` key by key.
///
/// Nested objects present on both sides are merged recursively; any other
/// value in the patch (scalars, lists, null) replaces the base value. Keys
/// the patch does not mention are left untouched.
pub fn deep_merge(base: &mut ParamMap, patch: &ParamMap) {
    for (key, patch_value) in patch {
        match (base.get_mut(key), patch_value) {
            (Some(Value::Object(base_obj)), Value::Object(patch_obj)) => {
                deep_merge(base_obj, patch_obj);
            }
            _ => {
                base.insert(key.clone(), patch_value.clone());
            }
        }
    }
}

/// Non-mutating variant of [`deep_merge`].
pub fn deep_merged(base: &ParamMap, patch: &ParamMap) -> ParamMap {
    let mut merged = base.clone();
    deep_merge(&mut merged, patch);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> ParamMap {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_nested_merge_keeps_siblings() {
        let mut base = obj(json!({"a": {"b": 1, "c": 2}}));
        deep_merge(&mut base, &obj(json!({"a": {"b": 5}})));
        assert_eq!(Value::Object(base), json!({"a": {"b": 5, "c": 2}}));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let base = obj(json!({"a": {"b": 1, "c": {"d": [1, 2]}}, "x": "y"}));
        let patch = obj(json!({"a": {"c": {"d": [3], "e": true}}, "z": 1}));
        let once = deep_merged(&base, &patch);
        let twice = deep_merged(&once, &patch);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_lists_and_scalars_are_replaced() {
        let mut base = obj(json!({"list": [1, 2, 3], "n": 1, "o": {"k": 1}}));
        deep_merge(&mut base, &obj(json!({"list": [9], "n": "one", "o": 5})));
        assert_eq!(
            Value::Object(base),
            json!({"list": [9], "n": "one", "o": 5})
        );
    }

    #[test]
    fn test_object_replaces_scalar() {
        let mut base = obj(json!({"a": 1}));
        deep_merge(&mut base, &obj(json!({"a": {"b": 2}})));
        assert_eq!(Value::Object(base), json!({"a": {"b": 2}}));
    }
}
