//! Caller identity and live-event recipient scoping.

use serde::{Deserialize, Serialize};

/// The authenticated identity behind one stream.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Caller {
    /// User id, `None` for anonymous callers.
    pub user_id: Option<String>,
    /// Teams the user belongs to.
    #[serde(default)]
    pub team_ids: Vec<String>,
}

impl Caller {
    /// An unauthenticated caller. Receives broadcast events only.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// A caller identified by user id.
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            team_ids: Vec::new(),
        }
    }

    /// Adds a team membership.
    pub fn with_team(mut self, team_id: impl Into<String>) -> Self {
        self.team_ids.push(team_id.into());
        self
    }

    /// Returns true if the caller belongs to `team_id`.
    pub fn in_team(&self, team_id: &str) -> bool {
        self.team_ids.iter().any(|t| t == team_id)
    }
}

/// Which callers a live event is delivered to.
///
/// An empty filter is a broadcast. Otherwise a caller matches when any
/// present field matches.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipientFilter {
    /// Deliver to this user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_to_user_id: Option<String>,
    /// Deliver to every member of this team.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_to_team_id: Option<String>,
}

impl RecipientFilter {
    /// A filter that reaches every subscriber.
    pub fn broadcast() -> Self {
        Self::default()
    }

    /// A filter scoped to one user.
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            sync_to_user_id: Some(user_id.into()),
            sync_to_team_id: None,
        }
    }

    /// A filter scoped to one team.
    pub fn team(team_id: impl Into<String>) -> Self {
        Self {
            sync_to_user_id: None,
            sync_to_team_id: Some(team_id.into()),
        }
    }

    /// Returns true if no field restricts delivery.
    pub fn is_broadcast(&self) -> bool {
        self.sync_to_user_id.is_none() && self.sync_to_team_id.is_none()
    }

    /// Returns true if `caller` should receive events with this filter.
    pub fn matches(&self, caller: &Caller) -> bool {
        if self.is_broadcast() {
            return true;
        }
        let user_match = match (&self.sync_to_user_id, &caller.user_id) {
            (Some(target), Some(user)) => target == user,
            _ => false,
        };
        let team_match = self
            .sync_to_team_id
            .as_deref()
            .is_some_and(|team| caller.in_team(team));
        user_match || team_match
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_reaches_everyone() {
        let filter = RecipientFilter::broadcast();
        assert!(filter.matches(&Caller::anonymous()));
        assert!(filter.matches(&Caller::user("u1")));
    }

    #[test]
    fn user_scope() {
        let filter = RecipientFilter::user("u1");
        assert!(filter.matches(&Caller::user("u1")));
        assert!(!filter.matches(&Caller::user("u2")));
        assert!(!filter.matches(&Caller::anonymous()));
    }

    #[test]
    fn team_scope() {
        let filter = RecipientFilter::team("t1");
        assert!(filter.matches(&Caller::user("u2").with_team("t1")));
        assert!(!filter.matches(&Caller::user("u1").with_team("t2")));
    }

    #[test]
    fn user_or_team() {
        let filter = RecipientFilter {
            sync_to_user_id: Some("u1".into()),
            sync_to_team_id: Some("t1".into()),
        };
        assert!(filter.matches(&Caller::user("u1")));
        assert!(filter.matches(&Caller::user("u9").with_team("t1")));
        assert!(!filter.matches(&Caller::user("u9")));
    }

    #[test]
    fn empty_filter_serializes_empty() {
        let value = serde_json::to_value(RecipientFilter::broadcast()).unwrap();
        assert_eq!(value, serde_json::json!({}));
    }
}
