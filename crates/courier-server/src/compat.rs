//! Parameter spelling compatibility for controllers that send camelCase keys.

/// camelCase keys accepted on the RPC surface and their canonical names.
/// `clientId` is the older name for an agent id.
const CAMEL_TO_SNAKE: &[(&str, &str)] = &[
    ("agentId", "agent_id"),
    ("clientId", "agent_id"),
    ("client_id", "agent_id"),
    ("timeoutMs", "timeout_ms"),
];

/// Rewrite known camelCase keys to snake_case. An existing canonical key
/// wins over its alias.
pub fn normalize_params(params: &serde_json::Value) -> serde_json::Value {
    let Some(obj) = params.as_object() else {
        return params.clone();
    };
    let mut result = obj.clone();
    for &(alias, canonical) in CAMEL_TO_SNAKE {
        if !result.contains_key(canonical) {
            if let Some(val) = result.remove(alias) {
                result.insert(canonical.to_string(), val);
            }
        } else {
            result.remove(alias);
        }
    }
    serde_json::Value::Object(result)
}
