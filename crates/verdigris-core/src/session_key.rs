//! Session-key grammar.
//!
//! Depth-1 children live under `agent:{agentId}:subagent:{uuid}`; deeper
//! children append `:sub:{uuid}` segments to their parent's key. The main
//! session of an agent is `agent:{agentId}:main`.

const SUBAGENT_MARKER: &str = ":subagent:";
const SUB_MARKER: &str = ":sub:";

/// Normalize an agent id for comparisons and key construction.
pub fn normalize_agent_id(id: &str) -> String {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        "main".to_string()
    } else {
        trimmed.to_lowercase()
    }
}

/// Main session key for an agent.
pub fn main_key_for(agent_id: &str) -> String {
    format!("agent:{}:main", normalize_agent_id(agent_id))
}

/// Extract the agent id from an `agent:{id}:...` key.
pub fn agent_id_of(key: &str) -> Option<&str> {
    let rest = key.strip_prefix("agent:")?;
    let (id, _) = rest.split_once(':')?;
    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}

/// Whether a key names a subagent session (any depth).
pub fn is_subagent_key(key: &str) -> bool {
    subagent_depth(key) > 0
}

/// Nesting depth of a subagent key. 0 for non-subagent or malformed keys,
/// 1 for direct children, +1 per `:sub:` segment.
pub fn subagent_depth(key: &str) -> u32 {
    let Some(idx) = key.find(SUBAGENT_MARKER) else {
        return 0;
    };
    let tail = &key[idx + SUBAGENT_MARKER.len()..];
    let first = tail.split(':').next().unwrap_or("");
    if first.is_empty() {
        return 0;
    }

    let mut depth = 1;
    let mut rest = &tail[first.len()..];
    while let Some(after) = rest.strip_prefix(SUB_MARKER) {
        let seg = after.split(':').next().unwrap_or("");
        if seg.is_empty() {
            return 0;
        }
        depth += 1;
        rest = &after[seg.len()..];
    }
    // Trailing non-sub segments (e.g. ":thread:xyz") do not add depth, but a
    // dangling ":sub" with no id is malformed.
    if rest == ":sub" {
        return 0;
    }
    depth
}

/// Parent session key of a subagent key: the main session for depth-1
/// children, the enclosing subagent key otherwise. None for non-subagent or
/// malformed keys.
pub fn parent_key_of(key: &str) -> Option<String> {
    let depth = subagent_depth(key);
    match depth {
        0 => None,
        1 => agent_id_of(key).map(main_key_for),
        _ => key.rfind(SUB_MARKER).map(|idx| key[..idx].to_string()),
    }
}

/// Derive a fresh child session key scoped under the requester.
///
/// A subagent requester nests (`{requester}:sub:{uuid}`); any other requester
/// produces a depth-1 key under the target agent.
pub fn child_key_for(requester_key: &str, target_agent_id: &str) -> String {
    let id = uuid::Uuid::new_v4();
    if is_subagent_key(requester_key) {
        format!("{requester_key}:sub:{id}")
    } else {
        format!(
            "agent:{}:subagent:{id}",
            normalize_agent_id(target_agent_id)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_of_non_subagent_keys() {
        assert_eq!(subagent_depth("agent:main:main"), 0);
        assert_eq!(subagent_depth("cli:interactive"), 0);
        assert_eq!(subagent_depth(""), 0);
    }

    #[test]
    fn depth_counts_sub_segments() {
        assert_eq!(subagent_depth("agent:main:subagent:abc-123"), 1);
        assert_eq!(subagent_depth("agent:main:subagent:abc:sub:def"), 2);
        assert_eq!(subagent_depth("agent:main:subagent:abc:sub:def:sub:ghi"), 3);
    }

    #[test]
    fn depth_ignores_trailing_thread_segments() {
        assert_eq!(subagent_depth("agent:main:subagent:abc:thread:xyz"), 1);
    }

    #[test]
    fn malformed_sequences_have_depth_zero() {
        assert_eq!(subagent_depth("agent:main:subagent"), 0);
        assert_eq!(subagent_depth("agent:main:subagent:"), 0);
        assert_eq!(subagent_depth("agent:main:subagent:abc:sub"), 0);
        assert_eq!(subagent_depth("agent:main:subagent::sub:def"), 0);
        assert_eq!(subagent_depth("agent:main:subagent:abc:sub:"), 0);
    }

    #[test]
    fn parent_of_depth_one_is_main() {
        assert_eq!(
            parent_key_of("agent:main:subagent:abc-123").as_deref(),
            Some("agent:main:main")
        );
        assert_eq!(
            parent_key_of("agent:research:subagent:def").as_deref(),
            Some("agent:research:main")
        );
    }

    #[test]
    fn parent_of_nested_is_enclosing_key() {
        assert_eq!(
            parent_key_of("agent:main:subagent:abc:sub:def").as_deref(),
            Some("agent:main:subagent:abc")
        );
        assert_eq!(
            parent_key_of("agent:main:subagent:abc:sub:def:sub:ghi").as_deref(),
            Some("agent:main:subagent:abc:sub:def")
        );
    }

    #[test]
    fn parent_of_malformed_is_none() {
        assert_eq!(parent_key_of("agent:main:subagent:abc:sub"), None);
        assert_eq!(parent_key_of("agent:main:main"), None);
    }

    #[test]
    fn child_keys_nest_under_subagent_requesters() {
        let child = child_key_for("agent:main:main", "research");
        assert!(child.starts_with("agent:research:subagent:"));
        assert_eq!(subagent_depth(&child), 1);

        let nested = child_key_for(&child, "research");
        assert!(nested.starts_with(&child));
        assert_eq!(subagent_depth(&nested), 2);
    }

    #[test]
    fn agent_id_extraction() {
        assert_eq!(agent_id_of("agent:research:subagent:x"), Some("research"));
        assert_eq!(agent_id_of("agent:main:main"), Some("main"));
        assert_eq!(agent_id_of("cli:interactive"), None);
    }
}
