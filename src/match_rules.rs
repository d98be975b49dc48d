//! D-Bus match-rule value types.
//!
//! Subscriptions are keyed by these rules, and their `rule_string`
//! renderings are what gets sent to the bus daemon via `AddMatch` /
//! `RemoveMatch`.

use std::fmt;

use crate::message::Message;

/// Exact-match rule for signal subscriptions: `(interface, member, path)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SignalMatchRule {
    pub interface: String,
    pub member: String,
    pub path: String,
}

impl SignalMatchRule {
    pub fn new(path: &str, interface: &str, member: &str) -> Self {
        Self {
            interface: interface.to_string(),
            member: member.to_string(),
            path: path.to_string(),
        }
    }

    /// Build the lookup key for an inbound signal frame.
    ///
    /// Returns `None` if the frame is missing any of the three fields.
    pub fn from_message(msg: &Message) -> Option<Self> {
        Some(Self {
            interface: msg.interface()?.to_string(),
            member: msg.member()?.to_string(),
            path: msg.path()?.to_string(),
        })
    }

    /// The rule in the bus daemon's match-rule syntax.
    pub fn rule_string(&self) -> String {
        format!(
            "type='signal',interface='{}',member='{}',path='{}'",
            self.interface, self.member, self.path
        )
    }
}

impl fmt::Display for SignalMatchRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rule_string())
    }
}

/// Match rule for `NameOwnerChanged` signals about one well-known name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OwnerChangedMatchRule {
    pub service_name: String,
}

impl OwnerChangedMatchRule {
    pub fn new(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
        }
    }

    pub fn rule_string(&self) -> String {
        format!(
            "type='signal',interface='org.freedesktop.DBus',member='NameOwnerChanged',arg0='{}'",
            self.service_name
        )
    }
}

impl fmt::Display for OwnerChangedMatchRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rule_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_rule_string() {
        let rule = SignalMatchRule::new("/org/example/Widget", "org.example.Widget", "Changed");
        assert_eq!(
            rule.rule_string(),
            "type='signal',interface='org.example.Widget',member='Changed',path='/org/example/Widget'"
        );
    }

    #[test]
    fn test_signal_rule_equality_over_all_fields() {
        let a = SignalMatchRule::new("/a", "i.I", "S");
        let b = SignalMatchRule::new("/a", "i.I", "S");
        let c = SignalMatchRule::new("/b", "i.I", "S");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_rule_from_signal_frame() {
        let msg = Message::signal("/a", "i.I", "S").build();
        let rule = SignalMatchRule::from_message(&msg).unwrap();
        assert_eq!(rule, SignalMatchRule::new("/a", "i.I", "S"));
    }

    #[test]
    fn test_rule_from_frame_missing_interface() {
        // Method returns carry no interface/member/path headers.
        let request = Message::method_call("/a", "i.I", "M").serial(1).build();
        let reply = Message::method_return(&request).build();
        assert!(SignalMatchRule::from_message(&reply).is_none());
    }

    #[test]
    fn test_owner_changed_rule_string() {
        let rule = OwnerChangedMatchRule::new("com.example.Service");
        assert_eq!(
            rule.rule_string(),
            "type='signal',interface='org.freedesktop.DBus',member='NameOwnerChanged',arg0='com.example.Service'"
        );
    }
}
