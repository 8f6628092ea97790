//! Deterministic container and volume naming.

use chrono::Utc;

/// Prefix shared by every container this engine creates.
pub const NAME_PREFIX: &str = "sandbay";

const MAX_SEGMENT: usize = 32;
const SUFFIX_ATTEMPTS: usize = 5;

/// Reduce a value to the `[a-z0-9_.-]` charset accepted by container names.
pub fn sanitize(value: &str) -> String {
    let mapped: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();

    let mut segment = mapped
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    segment.truncate(MAX_SEGMENT);
    let segment = segment.trim_matches(|c| c == '-' || c == '.').to_string();

    if segment.is_empty() {
        "x".to_string()
    } else {
        segment
    }
}

/// Base container name for a session.
pub fn session_container_name(owner_id: &str, project: &str, session_id: &str) -> String {
    format!(
        "{}-{}-{}-{}",
        NAME_PREFIX,
        sanitize(owner_id),
        sanitize(project),
        sanitize(session_id)
    )
}

/// Named volume backing a session container.
pub fn volume_name(container: &str) -> String {
    format!("{}-vol", container)
}

/// Prefix shared by every web container derived from `container`.
pub fn web_container_prefix(container: &str) -> String {
    format!("{}-web-", container)
}

/// Fresh web container name, unique per call.
pub fn web_container_name(container: &str) -> String {
    let short = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}{}-{}",
        web_container_prefix(container),
        Utc::now().timestamp_millis(),
        &short[..6]
    )
}

/// Pick `base`, or the first non-colliding `base-N`, or a timestamped name.
pub fn disambiguate<F>(base: &str, is_taken: F) -> String
where
    F: Fn(&str) -> bool,
{
    if !is_taken(base) {
        return base.to_string();
    }
    for attempt in 1..=SUFFIX_ATTEMPTS {
        let candidate = format!("{}-{}", base, attempt);
        if !is_taken(&candidate) {
            return candidate;
        }
    }
    format!("{}-{}", base, Utc::now().timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("My Project!"), "my-project");
        assert_eq!(sanitize("user@example.com"), "user-example.com");
        assert_eq!(sanitize("---"), "x");
        assert_eq!(sanitize(""), "x");
        assert!(sanitize(&"a".repeat(100)).len() <= MAX_SEGMENT);
    }

    #[test]
    fn test_session_container_name() {
        assert_eq!(
            session_container_name("u1", "Demo App", "t1"),
            "sandbay-u1-demo-app-t1"
        );
    }

    #[test]
    fn test_web_names_share_prefix() {
        let name = web_container_name("sandbay-u1-demo-t1");
        assert!(name.starts_with(&web_container_prefix("sandbay-u1-demo-t1")));
        assert_ne!(name, web_container_name("sandbay-u1-demo-t1"));
        assert_eq!(volume_name("sandbay-u1-demo-t1"), "sandbay-u1-demo-t1-vol");
    }

    #[test]
    fn test_disambiguate_numeric_suffix() {
        let taken = ["c", "c-1"];
        assert_eq!(disambiguate("c", |n| taken.contains(&n)), "c-2");
        assert_eq!(disambiguate("free", |n| taken.contains(&n)), "free");
    }

    #[test]
    fn test_disambiguate_falls_back_to_timestamp() {
        let name = disambiguate("c", |n| n == "c" || n.len() == 3);
        assert!(name.starts_with("c-"));
        assert!(name.len() > 3);
        let suffix = &name[2..];
        assert!(suffix.parse::<i64>().unwrap() > 5);
    }
}
