//! Tool-name namespacing
//!
//! `gh.create_issue` is tool `create_issue` in namespace `gh`. Only the last
//! dot separates the base name, so `org.gh.create_issue` has namespace
//! `org.gh`.

/// Split a tool name into `(namespace, base_name)`.
pub fn parse_tool_name(tool_name: &str) -> (Option<&str>, &str) {
    match tool_name.rsplit_once('.') {
        Some((namespace, base)) if !namespace.is_empty() => (Some(namespace), base),
        Some((_, base)) => (None, base),
        None => (None, tool_name),
    }
}

/// Prefix a tool name with a namespace.
///
/// Names that already contain a dot are returned unchanged, as are names
/// when the namespace is absent or empty.
pub fn apply_namespace(namespace: Option<&str>, tool_name: &str) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() && !tool_name.contains('.') => format!("{}.{}", ns, tool_name),
        _ => tool_name.to_string(),
    }
}
