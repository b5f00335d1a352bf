use serde::{Deserialize, Serialize};

/// Label returned by a node's post phase, used to select the next edge.
///
/// `"default"` is the implicit label used when a node declines to pick one.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct Action(String);

impl Action {
    pub const DEFAULT: &'static str = "default";

    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is the implicit `"default"` action.
    pub fn is_default(&self) -> bool {
        self.0 == Self::DEFAULT
    }
}

impl Default for Action {
    fn default() -> Self {
        Self(Self::DEFAULT.to_string())
    }
}

impl From<&str> for Action {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Action {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a node's post phase decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Route via the edge registered for this action.
    Next(Action),
    /// Route via the `"default"` edge.
    Default,
    /// Halt traversal and externalize a checkpoint for later resumption.
    Pause,
}

impl Outcome {
    pub fn next(action: impl Into<Action>) -> Self {
        Self::Next(action.into())
    }

    /// The action this outcome routes on, if it routes at all.
    pub fn action(self) -> Option<Action> {
        match self {
            Self::Next(action) => Some(action),
            Self::Default => Some(Action::default()),
            Self::Pause => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_action() {
        let action = Action::default();
        assert_eq!(action.as_str(), "default");
        assert!(action.is_default());
        assert!(!Action::new("approve").is_default());
    }

    #[test]
    fn test_action_equality_and_hash() {
        let a: Action = "approve".into();
        let b = Action::new(String::from("approve"));
        assert_eq!(a, b);

        let mut set = std::collections::HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_outcome_action() {
        assert_eq!(Outcome::next("retry").action(), Some(Action::new("retry")));
        assert_eq!(Outcome::Default.action(), Some(Action::default()));
        assert_eq!(Outcome::Pause.action(), None);
    }

    #[test]
    fn test_action_serde_is_transparent() {
        let json = serde_json::to_string(&Action::new("approve")).unwrap();
        assert_eq!(json, r#""approve""#);
        let back: Action = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Action::new("approve"));
    }
}
