use std::collections::HashSet;

/// The minimal membership correction between two ranking snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MembershipDelta {
    pub to_leave: HashSet<String>,
    pub to_join: HashSet<String>,
}

impl MembershipDelta {
    pub fn is_empty(&self) -> bool {
        self.to_leave.is_empty() && self.to_join.is_empty()
    }
}

/// Pure set difference both ways: channels only in `old` are left, channels
/// only in `new` are joined. Channels in both are untouched.
pub fn diff(old: &HashSet<String>, new: &HashSet<String>) -> MembershipDelta {
    MembershipDelta {
        to_leave: old.difference(new).cloned().collect(),
        to_join: new.difference(old).cloned().collect(),
    }
}
