//! Topic name resolution: workspace and node-relative prefixes.

/// Reserved prefix for service reply channels. Channels under this prefix
/// are never rewritten by [`resolve`] and are excluded from user-facing
/// topic listings.
pub const SERVICE_PREFIX: &str = "srv://";

/// Resolves a logical topic name to its absolute form.
///
/// - A leading "." is replaced with `node_name` (no separator).
/// - Otherwise, if a workspace is set and the name doesn't already begin
///   with it, the workspace is prepended as "{workspace}.{name}".
/// - Names already under [`SERVICE_PREFIX`] pass through unchanged.
pub fn resolve(name: &str, node_name: &str, workspace: Option<&str>) -> String {
    if name.starts_with(SERVICE_PREFIX) {
        return name.to_string();
    }

    if let Some(rest) = name.strip_prefix('.') {
        return format!("{node_name}{rest}");
    }

    match workspace {
        Some(ws) if !ws.is_empty() && !name.starts_with(ws) => format!("{ws}.{name}"),
        _ => name.to_string(),
    }
}

pub fn is_service_channel(name: &str) -> bool {
    name.starts_with(SERVICE_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leading_dot_resolves_node_relative() {
        assert_eq!(resolve(".status", "rover1", None), "rover1status");
    }

    #[test]
    fn workspace_is_prepended_once() {
        assert_eq!(resolve("telemetry", "rover1", Some("lab")), "lab.telemetry");
        assert_eq!(
            resolve("lab.telemetry", "rover1", Some("lab")),
            "lab.telemetry"
        );
    }

    #[test]
    fn no_workspace_leaves_name_untouched() {
        assert_eq!(resolve("telemetry", "rover1", None), "telemetry");
    }

    #[test]
    fn service_channels_are_never_rewritten() {
        let channel = "srv://abc-123";
        assert_eq!(resolve(channel, "rover1", Some("lab")), channel);
        assert!(is_service_channel(channel));
    }
}
