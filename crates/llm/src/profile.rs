//! Model profiles — what a {provider, model} combination can do with
//! structured output. The schema planner consumes these; selection between
//! native/tools/prompted modes degrades deterministically from them.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelProfile {
    /// Provider family label (e.g. "openai_compat", "anthropic"); purely
    /// informational, decisions key off the capability fields below.
    pub family: String,
    /// The provider accepts a native structured-output / json-schema spec.
    pub supports_native_structured: bool,
    /// Native structured output can be strict (schema-enforced).
    pub supports_strict: bool,
    /// The provider supports tool calling (usable as a structured channel).
    pub supports_tools: bool,
    /// Hard cap on total schema keys for native mode; 0 = no limit.
    #[serde(default)]
    pub max_schema_keys: usize,
    /// `$ref` must be inlined before sending.
    #[serde(default)]
    pub inline_refs: bool,
    /// `const` must be rewritten as a single-value `enum`.
    #[serde(default)]
    pub const_to_enum: bool,
    /// `oneOf` must be rewritten as `anyOf`.
    #[serde(default)]
    pub one_of_to_any_of: bool,
    /// Schema keywords the provider rejects; stripped during transform.
    #[serde(default)]
    pub unsupported_keywords: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_window_tokens: Option<u32>,
}

impl ModelProfile {
    /// A provider with full strict native structured output.
    pub fn strict_native(family: impl Into<String>) -> Self {
        Self {
            family: family.into(),
            supports_native_structured: true,
            supports_strict: true,
            supports_tools: true,
            max_schema_keys: 0,
            inline_refs: false,
            const_to_enum: false,
            one_of_to_any_of: false,
            unsupported_keywords: Vec::new(),
            context_window_tokens: None,
        }
    }

    /// A provider that only exposes tool calling.
    pub fn tools_only(family: impl Into<String>) -> Self {
        Self {
            family: family.into(),
            supports_native_structured: false,
            supports_strict: false,
            supports_tools: true,
            max_schema_keys: 0,
            inline_refs: true,
            const_to_enum: true,
            one_of_to_any_of: true,
            unsupported_keywords: vec!["$schema".into(), "format".into()],
            context_window_tokens: None,
        }
    }

    /// A bare text model: structured output only via prompting.
    pub fn prompted_only(family: impl Into<String>) -> Self {
        Self {
            family: family.into(),
            supports_native_structured: false,
            supports_strict: false,
            supports_tools: false,
            max_schema_keys: 0,
            inline_refs: true,
            const_to_enum: true,
            one_of_to_any_of: true,
            unsupported_keywords: Vec::new(),
            context_window_tokens: None,
        }
    }
}

impl Default for ModelProfile {
    fn default() -> Self {
        Self::strict_native("generic")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets() {
        let p = ModelProfile::strict_native("openai_compat");
        assert!(p.supports_native_structured && p.supports_strict && p.supports_tools);

        let p = ModelProfile::tools_only("anthropic");
        assert!(!p.supports_native_structured && p.supports_tools);

        let p = ModelProfile::prompted_only("base");
        assert!(!p.supports_native_structured && !p.supports_tools);
    }
}
