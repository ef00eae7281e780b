use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Result, TetherError};

/// Names that would let an agent pass itself off as an authority.
pub const RESERVED_IDS: &[&str] = &[
    "system",
    "admin",
    "root",
    "operator",
    "broadcast",
    "all",
    "everyone",
    "supervisor",
];

static AGENT_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_-]{1,63}$").expect("static pattern"));

/// Check that `id` is a well-formed agent token.
///
/// Accepts lowercase ASCII starting with a letter, then letters, digits,
/// `-` or `_`, 2 to 64 characters in total. Reserved authority names are
/// rejected so no agent can impersonate the operator.
pub fn validate_agent_id(id: &str) -> Result<()> {
    if !AGENT_ID.is_match(id) {
        return Err(TetherError::InvalidAgentId {
            id: id.into(),
            reason: "must match [a-z][a-z0-9_-]{1,63}".into(),
        });
    }
    if RESERVED_IDS.contains(&id) {
        return Err(TetherError::InvalidAgentId {
            id: id.into(),
            reason: "reserved name".into(),
        });
    }
    Ok(())
}

pub fn is_valid_agent_id(id: &str) -> bool {
    validate_agent_id(id).is_ok()
}

/// Resolve the calling agent's identity from the environment.
///
/// Checks `TETHER_AGENT` first, then `AGENT_ID`. Returns `None` if neither
/// is set, letting callers decide whether to require an explicit id.
pub fn resolve_agent() -> Option<String> {
    ["TETHER_AGENT", "AGENT_ID"].iter().find_map(|key| {
        std::env::var(key)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    })
}

/// Derive a stable id for a pane that did not announce one.
///
/// `%12` becomes `agent-12`; anything else is squashed into the token
/// alphabet.
pub fn id_for_pane(pane_id: &str) -> String {
    let token: String = pane_id
        .chars()
        .filter_map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() {
                Some(c)
            } else if c == '-' || c == '_' || c == '.' || c == ':' {
                Some('-')
            } else {
                None
            }
        })
        .collect();
    let token = token.trim_matches('-');
    if token.is_empty() {
        let fresh = uuid::Uuid::new_v4().simple().to_string();
        format!("agent-{}", &fresh[..8])
    } else {
        format!("agent-{token}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Env-var tests must not run concurrently.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn accepts_well_formed_ids() {
        for id in ["agent-1", "claude_backend", "ab", "w0rker-7"] {
            assert!(validate_agent_id(id).is_ok(), "{id} should be valid");
        }
    }

    #[test]
    fn rejects_malformed_ids() {
        let long = "a".repeat(65);
        for id in ["", "a", "1agent", "Agent", "has space", "../etc", "a/b", long.as_str()] {
            let err = validate_agent_id(id).unwrap_err();
            assert_eq!(err.code(), "invalid_agent_id", "{id} should be rejected");
        }
    }

    #[test]
    fn rejects_reserved_authority_names() {
        for id in RESERVED_IDS {
            let err = validate_agent_id(id).unwrap_err();
            assert!(err.to_string().contains("reserved"));
        }
    }

    #[test]
    fn id_for_pane_is_valid_token() {
        assert_eq!(id_for_pane("%12"), "agent-12");
        assert_eq!(id_for_pane("work:1.2"), "agent-work-1-2");
        assert!(is_valid_agent_id(&id_for_pane("%3")));
        assert!(id_for_pane("%%%").starts_with("agent-"));
    }

    #[test]
    fn resolve_agent_env_behavior() {
        let _guard = ENV_LOCK.lock().unwrap();

        unsafe {
            std::env::remove_var("AGENT_ID");
            std::env::set_var("TETHER_AGENT", "backend");
        }
        assert_eq!(resolve_agent(), Some("backend".to_string()));

        unsafe {
            std::env::set_var("TETHER_AGENT", "  ");
            std::env::set_var("AGENT_ID", "frontend");
        }
        assert_eq!(resolve_agent(), Some("frontend".to_string()));

        unsafe {
            std::env::remove_var("TETHER_AGENT");
            std::env::remove_var("AGENT_ID");
        }
        assert_eq!(resolve_agent(), None);
    }
}
