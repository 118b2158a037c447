//! Per-model schema planning.
//!
//! `plan_schema` walks a JSON schema and applies the provider-specific
//! transforms a [`ModelProfile`] demands (keyword stripping, `$ref`
//! inlining, `const`→`enum`, `oneOf`→`anyOf`, strict
//! `additionalProperties: false`). Degradation never fails: a lossy strict
//! transform clears `strict_applied`, an oversized or unresolvable schema
//! clears `compatible_with_native`, and the caller selects the best
//! remaining output mode deterministically.
//!
//! The module also carries the small structural validator used for invoker
//! retry feedback and auto-seq uniqueness checks.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::profile::ModelProfile;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Output mode
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// Provider-native structured output (json-schema constrained).
    Native,
    /// A forced tool call whose arguments carry the payload.
    Tools,
    /// Plain text with a schema instruction; parsed client-side.
    Prompted,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Schema plan
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaPlan {
    pub transformed_schema: Value,
    pub strict_applied: bool,
    pub compatible_with_native: bool,
    pub compatible_with_tools: bool,
    pub reasons: Vec<String>,
    pub estimated_key_count: usize,
}

/// Pick the output mode for a plan. Preference order is native > tools >
/// prompted; an explicit request degrades along the same order when the
/// plan rules it out. Deterministic for equal inputs.
pub fn select_mode(plan: &SchemaPlan, requested: Option<OutputMode>) -> OutputMode {
    let best = if plan.compatible_with_native {
        OutputMode::Native
    } else if plan.compatible_with_tools {
        OutputMode::Tools
    } else {
        OutputMode::Prompted
    };
    match requested {
        None => best,
        Some(OutputMode::Native) if plan.compatible_with_native => OutputMode::Native,
        Some(OutputMode::Native) => {
            if plan.compatible_with_tools {
                OutputMode::Tools
            } else {
                OutputMode::Prompted
            }
        }
        Some(OutputMode::Tools) if plan.compatible_with_tools => OutputMode::Tools,
        Some(OutputMode::Tools) => OutputMode::Prompted,
        Some(OutputMode::Prompted) => OutputMode::Prompted,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Planning
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Keywords that are annotation-only; stripping them is not lossy.
const ANNOTATION_KEYWORDS: &[&str] = &["$schema", "$id", "title", "description", "examples", "default"];

struct Transformer<'a> {
    profile: &'a ModelProfile,
    root: &'a Value,
    reasons: Vec<String>,
    lossy: bool,
    unresolvable_ref: bool,
}

/// Compute the transformed schema and compatibility flags for one model.
pub fn plan_schema(schema: &Value, profile: &ModelProfile) -> SchemaPlan {
    let mut tx = Transformer {
        profile,
        root: schema,
        reasons: Vec::new(),
        lossy: false,
        unresolvable_ref: false,
    };
    let strict = profile.supports_strict;
    let transformed = tx.walk(schema, strict, 0);
    let estimated_key_count = count_keys(&transformed);

    let mut reasons = tx.reasons;
    let mut compatible_with_native = profile.supports_native_structured;
    if !profile.supports_native_structured {
        reasons.push("provider has no native structured output".into());
    }
    if tx.unresolvable_ref {
        compatible_with_native = false;
        reasons.push("schema contains unresolvable $ref".into());
    }
    if profile.max_schema_keys > 0 && estimated_key_count > profile.max_schema_keys {
        compatible_with_native = false;
        reasons.push(format!(
            "schema key count {estimated_key_count} exceeds provider limit {}",
            profile.max_schema_keys
        ));
    }
    let strict_applied = strict && !tx.lossy;
    if strict && tx.lossy {
        reasons.push("strict transform was lossy; strict disabled".into());
    }

    SchemaPlan {
        transformed_schema: transformed,
        strict_applied,
        compatible_with_native,
        compatible_with_tools: profile.supports_tools,
        reasons,
        estimated_key_count,
    }
}

impl Transformer<'_> {
    fn walk(&mut self, node: &Value, strict: bool, depth: usize) -> Value {
        // Refuse pathological nesting rather than recursing forever.
        if depth > 64 {
            self.unresolvable_ref = true;
            self.reasons.push("schema nesting exceeds depth 64".into());
            return node.clone();
        }
        let obj = match node.as_object() {
            Some(o) => o,
            None => return node.clone(),
        };

        // Inline $ref first; the resolved target is walked in place.
        if self.profile.inline_refs {
            if let Some(Value::String(r)) = obj.get("$ref") {
                return match resolve_ref(self.root, r) {
                    Some(target) => {
                        self.reasons.push(format!("inlined $ref {r}"));
                        self.walk(&target, strict, depth + 1)
                    }
                    None => {
                        self.unresolvable_ref = true;
                        self.reasons.push(format!("unresolvable $ref {r}"));
                        node.clone()
                    }
                };
            }
        }

        let mut out = Map::new();
        for (key, value) in obj {
            if self
                .profile
                .unsupported_keywords
                .iter()
                .any(|k| k == key)
            {
                if !ANNOTATION_KEYWORDS.contains(&key.as_str()) {
                    self.lossy = true;
                }
                self.reasons.push(format!("stripped unsupported keyword {key}"));
                continue;
            }

            match key.as_str() {
                "const" if self.profile.const_to_enum => {
                    out.insert("enum".into(), Value::Array(vec![value.clone()]));
                }
                "oneOf" if self.profile.one_of_to_any_of => {
                    out.insert("anyOf".into(), self.walk_schema_array(value, strict, depth));
                }
                "properties" | "$defs" | "definitions" => {
                    let walked = value
                        .as_object()
                        .map(|props| {
                            props
                                .iter()
                                .map(|(name, sub)| {
                                    (name.clone(), self.walk(sub, strict, depth + 1))
                                })
                                .collect::<Map<_, _>>()
                        })
                        .map(Value::Object)
                        .unwrap_or_else(|| value.clone());
                    out.insert(key.clone(), walked);
                }
                "items" | "additionalProperties" if value.is_object() => {
                    out.insert(key.clone(), self.walk(value, strict, depth + 1));
                }
                "anyOf" | "oneOf" | "allOf" => {
                    out.insert(key.clone(), self.walk_schema_array(value, strict, depth));
                }
                _ => {
                    out.insert(key.clone(), value.clone());
                }
            }
        }

        // Strict mode: objects must close their property set.
        let is_object_schema = out.get("type").and_then(Value::as_str) == Some("object")
            || out.contains_key("properties");
        if strict && is_object_schema {
            match out.get("additionalProperties") {
                None => {
                    out.insert("additionalProperties".into(), Value::Bool(false));
                }
                Some(Value::Bool(true)) => {
                    out.insert("additionalProperties".into(), Value::Bool(false));
                    self.lossy = true;
                    self.reasons
                        .push("additionalProperties:true forced to false in strict mode".into());
                }
                _ => {}
            }
        }

        Value::Object(out)
    }

    fn walk_schema_array(&mut self, value: &Value, strict: bool, depth: usize) -> Value {
        match value.as_array() {
            Some(items) => Value::Array(
                items
                    .iter()
                    .map(|sub| self.walk(sub, strict, depth + 1))
                    .collect(),
            ),
            None => value.clone(),
        }
    }
}

fn resolve_ref(root: &Value, reference: &str) -> Option<Value> {
    let path = reference.strip_prefix("#/")?;
    let mut node = root;
    for segment in path.split('/') {
        node = node.get(segment)?;
    }
    Some(node.clone())
}

/// Count property keys across the whole schema (the metric providers cap).
pub fn count_keys(schema: &Value) -> usize {
    match schema {
        Value::Object(obj) => {
            let own = obj
                .get("properties")
                .and_then(Value::as_object)
                .map(|p| p.len())
                .unwrap_or(0);
            own + obj.values().map(count_keys).sum::<usize>()
        }
        Value::Array(items) => items.iter().map(count_keys).sum(),
        _ => 0,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Structural validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Validate a value against the structural subset of JSON schema this
/// runtime relies on: `type`, `enum`, `const`, `required`, `properties`,
/// `additionalProperties: false`, `items`, `anyOf`.
///
/// Returns the list of violations (empty slice = valid is expressed as
/// `Ok(())`).
pub fn validate_value(value: &Value, schema: &Value) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();
    validate_at(value, schema, "$", &mut errors);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_at(value: &Value, schema: &Value, path: &str, errors: &mut Vec<String>) {
    let obj = match schema.as_object() {
        Some(o) => o,
        None => return,
    };

    if let Some(any_of) = obj.get("anyOf").and_then(Value::as_array) {
        let passes = any_of
            .iter()
            .any(|sub| validate_value(value, sub).is_ok());
        if !passes {
            errors.push(format!("{path}: no anyOf branch matched"));
        }
        return;
    }

    if let Some(expected) = obj.get("type") {
        if !type_matches(value, expected) {
            errors.push(format!(
                "{path}: expected type {expected}, got {}",
                type_name(value)
            ));
            return;
        }
    }

    if let Some(allowed) = obj.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            errors.push(format!("{path}: value not in enum"));
        }
    }
    if let Some(expected) = obj.get("const") {
        if value != expected {
            errors.push(format!("{path}: value differs from const"));
        }
    }

    if let Some(map) = value.as_object() {
        if let Some(required) = obj.get("required").and_then(Value::as_array) {
            for name in required.iter().filter_map(Value::as_str) {
                if !map.contains_key(name) {
                    errors.push(format!("{path}: missing required property {name}"));
                }
            }
        }
        let props = obj.get("properties").and_then(Value::as_object);
        if let Some(props) = props {
            for (name, sub_schema) in props {
                if let Some(sub_value) = map.get(name) {
                    validate_at(sub_value, sub_schema, &format!("{path}.{name}"), errors);
                }
            }
        }
        if obj.get("additionalProperties") == Some(&Value::Bool(false)) {
            for name in map.keys() {
                let known = props.map(|p| p.contains_key(name)).unwrap_or(false);
                if !known {
                    errors.push(format!("{path}: unexpected property {name}"));
                }
            }
        }
    }

    if let (Some(items), Some(arr)) = (obj.get("items"), value.as_array()) {
        for (i, item) in arr.iter().enumerate() {
            validate_at(item, items, &format!("{path}[{i}]"), errors);
        }
    }
}

fn type_matches(value: &Value, expected: &Value) -> bool {
    match expected {
        Value::String(t) => single_type_matches(value, t),
        Value::Array(ts) => ts
            .iter()
            .filter_map(Value::as_str)
            .any(|t| single_type_matches(value, t)),
        _ => true,
    }
}

fn single_type_matches(value: &Value, t: &str) -> bool {
    match t {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        "number" => value.is_number(),
        "integer" => value.as_i64().is_some() || value.as_u64().is_some(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn action_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "next_node": {"type": "string"},
                "args": {"type": "object"}
            },
            "required": ["next_node", "args"]
        })
    }

    // ── plan_schema ────────────────────────────────────────────────

    #[test]
    fn strict_native_closes_objects() {
        let plan = plan_schema(&action_schema(), &ModelProfile::strict_native("x"));
        assert!(plan.strict_applied);
        assert!(plan.compatible_with_native);
        assert_eq!(plan.transformed_schema["additionalProperties"], json!(false));
    }

    #[test]
    fn additional_properties_true_is_lossy() {
        let schema = json!({
            "type": "object",
            "properties": {"a": {"type": "string"}},
            "additionalProperties": true
        });
        let plan = plan_schema(&schema, &ModelProfile::strict_native("x"));
        assert!(!plan.strict_applied);
        assert_eq!(plan.transformed_schema["additionalProperties"], json!(false));
        assert!(plan.reasons.iter().any(|r| r.contains("strict")));
    }

    #[test]
    fn key_count_limit_disables_native() {
        let mut profile = ModelProfile::strict_native("x");
        profile.max_schema_keys = 1;
        let plan = plan_schema(&action_schema(), &profile);
        assert!(!plan.compatible_with_native);
        assert!(plan.compatible_with_tools);
        assert_eq!(plan.estimated_key_count, 2);
        assert_eq!(select_mode(&plan, None), OutputMode::Tools);
    }

    #[test]
    fn const_becomes_enum() {
        let schema = json!({"type": "object", "properties": {"kind": {"const": "a"}}});
        let plan = plan_schema(&schema, &ModelProfile::tools_only("x"));
        assert_eq!(
            plan.transformed_schema["properties"]["kind"]["enum"],
            json!(["a"])
        );
    }

    #[test]
    fn one_of_becomes_any_of() {
        let schema = json!({"oneOf": [{"type": "string"}, {"type": "number"}]});
        let plan = plan_schema(&schema, &ModelProfile::tools_only("x"));
        assert!(plan.transformed_schema.get("oneOf").is_none());
        assert_eq!(
            plan.transformed_schema["anyOf"],
            json!([{"type": "string"}, {"type": "number"}])
        );
    }

    #[test]
    fn refs_are_inlined() {
        let schema = json!({
            "type": "object",
            "properties": {"route": {"$ref": "#/$defs/Route"}},
            "$defs": {"Route": {"type": "string", "enum": ["docs", "web"]}}
        });
        let plan = plan_schema(&schema, &ModelProfile::tools_only("x"));
        assert_eq!(
            plan.transformed_schema["properties"]["route"]["enum"],
            json!(["docs", "web"])
        );
    }

    #[test]
    fn unresolvable_ref_disables_native() {
        let mut profile = ModelProfile::strict_native("x");
        profile.inline_refs = true;
        let schema = json!({"properties": {"x": {"$ref": "#/$defs/Missing"}}});
        let plan = plan_schema(&schema, &profile);
        assert!(!plan.compatible_with_native);
    }

    #[test]
    fn stripping_constraint_keyword_is_lossy() {
        let mut profile = ModelProfile::strict_native("x");
        profile.unsupported_keywords = vec!["pattern".into()];
        let schema = json!({
            "type": "object",
            "properties": {"id": {"type": "string", "pattern": "^[a-z]+$"}}
        });
        let plan = plan_schema(&schema, &profile);
        assert!(!plan.strict_applied);
        assert!(plan.transformed_schema["properties"]["id"].get("pattern").is_none());
    }

    #[test]
    fn stripping_annotation_keyword_is_not_lossy() {
        let mut profile = ModelProfile::strict_native("x");
        profile.unsupported_keywords = vec!["title".into()];
        let schema = json!({"type": "object", "title": "Action", "properties": {}});
        let plan = plan_schema(&schema, &profile);
        assert!(plan.strict_applied);
    }

    #[test]
    fn planning_is_deterministic() {
        let profile = ModelProfile::tools_only("x");
        let a = serde_json::to_string(&plan_schema(&action_schema(), &profile)).unwrap();
        let b = serde_json::to_string(&plan_schema(&action_schema(), &profile)).unwrap();
        assert_eq!(a, b);
    }

    // ── select_mode ────────────────────────────────────────────────

    #[test]
    fn mode_preference_order() {
        let plan = plan_schema(&action_schema(), &ModelProfile::strict_native("x"));
        assert_eq!(select_mode(&plan, None), OutputMode::Native);

        let plan = plan_schema(&action_schema(), &ModelProfile::tools_only("x"));
        assert_eq!(select_mode(&plan, None), OutputMode::Tools);

        let plan = plan_schema(&action_schema(), &ModelProfile::prompted_only("x"));
        assert_eq!(select_mode(&plan, None), OutputMode::Prompted);
    }

    #[test]
    fn requested_mode_degrades() {
        let plan = plan_schema(&action_schema(), &ModelProfile::tools_only("x"));
        assert_eq!(select_mode(&plan, Some(OutputMode::Native)), OutputMode::Tools);
        let plan = plan_schema(&action_schema(), &ModelProfile::prompted_only("x"));
        assert_eq!(select_mode(&plan, Some(OutputMode::Tools)), OutputMode::Prompted);
    }

    // ── validate_value ─────────────────────────────────────────────

    #[test]
    fn validate_ok() {
        let v = json!({"next_node": "search", "args": {}});
        assert!(validate_value(&v, &action_schema()).is_ok());
    }

    #[test]
    fn validate_missing_required() {
        let v = json!({"next_node": "search"});
        let errs = validate_value(&v, &action_schema()).unwrap_err();
        assert!(errs[0].contains("args"));
    }

    #[test]
    fn validate_wrong_type() {
        let v = json!({"next_node": 42, "args": {}});
        let errs = validate_value(&v, &action_schema()).unwrap_err();
        assert!(errs[0].contains("next_node"));
    }

    #[test]
    fn validate_closed_object_rejects_unknown() {
        let schema = json!({
            "type": "object",
            "properties": {"a": {"type": "string"}},
            "additionalProperties": false
        });
        let errs = validate_value(&json!({"a": "x", "b": 1}), &schema).unwrap_err();
        assert!(errs[0].contains("unexpected property b"));
    }

    #[test]
    fn validate_enum_and_items() {
        let schema = json!({
            "type": "object",
            "properties": {
                "route": {"type": "string", "enum": ["docs", "web"]},
                "tags": {"type": "array", "items": {"type": "string"}}
            }
        });
        assert!(validate_value(&json!({"route": "docs", "tags": ["a"]}), &schema).is_ok());
        assert!(validate_value(&json!({"route": "email"}), &schema).is_err());
        assert!(validate_value(&json!({"tags": ["a", 1]}), &schema).is_err());
    }

    #[test]
    fn validate_any_of() {
        let schema = json!({"anyOf": [{"type": "string"}, {"type": "integer"}]});
        assert!(validate_value(&json!("x"), &schema).is_ok());
        assert!(validate_value(&json!(3), &schema).is_ok());
        assert!(validate_value(&json!(3.5), &schema).is_err());
    }

    #[test]
    fn validate_integer_accepts_whole_numbers_only() {
        let schema = json!({"type": "integer"});
        assert!(validate_value(&json!(5), &schema).is_ok());
        assert!(validate_value(&json!(5.5), &schema).is_err());
    }
}
