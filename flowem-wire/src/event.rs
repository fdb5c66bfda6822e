use std::{fmt, str::FromStr, time::SystemTime};

use crate::DecodeError;

/// The kind of mutation a change notification describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// The key was written. Notifications carry no value, it must be fetched.
    Set,
    /// The key was deleted.
    Delete,
    /// The key's time-to-live ran out.
    Expired,
}

impl EventKind {
    /// The name used on notification channels.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Set => "set",
            Self::Delete => "del",
            Self::Expired => "expired",
        }
    }

    /// Returns `true` for kinds that remove the key.
    pub const fn is_removal(&self) -> bool {
        matches!(self, Self::Delete | Self::Expired)
    }
}

impl FromStr for EventKind {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "set" => Ok(Self::Set),
            "del" => Ok(Self::Delete),
            "expired" => Ok(Self::Expired),
            other => Err(DecodeError::UnknownEventKind(other.to_string())),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single change notification.
///
/// Notifications are hints: they are unordered across keys, may be duplicated and may be
/// lost altogether.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: EventKind,
    /// The affected directory key.
    pub key: String,
    /// Local receive time.
    pub timestamp: SystemTime,
}

impl ChangeEvent {
    pub fn new(kind: EventKind, key: impl Into<String>) -> Self {
        Self { kind, key: key.into(), timestamp: SystemTime::now() }
    }

    /// Builds the notification channel name for `kind` under `namespace`:
    /// `<namespace>:<kind>`.
    pub fn channel(namespace: &str, kind: EventKind) -> String {
        format!("{namespace}:{kind}")
    }

    /// Decodes a notification delivered on `channel` with the affected key as `payload`.
    pub fn from_notification(channel: &str, payload: &str) -> Result<Self, DecodeError> {
        let (_, kind) = channel
            .rsplit_once(':')
            .ok_or_else(|| DecodeError::MalformedChannel(channel.to_string()))?;

        Ok(Self::new(kind.parse()?, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_keyevent_channels() {
        let ev = ChangeEvent::from_notification("__keyevent@0__:set", "network_link:1").unwrap();
        assert_eq!(ev.kind, EventKind::Set);
        assert_eq!(ev.key, "network_link:1");

        let ev = ChangeEvent::from_notification("__keyevent@0__:del", "network_link:1").unwrap();
        assert!(ev.kind.is_removal());

        let ev = ChangeEvent::from_notification("ns:expired", "k").unwrap();
        assert_eq!(ev.kind, EventKind::Expired);
    }

    #[test]
    fn rejects_unknown_kinds() {
        assert!(matches!(
            ChangeEvent::from_notification("__keyevent@0__:expire", "k"),
            Err(DecodeError::UnknownEventKind(kind)) if kind == "expire"
        ));
        assert!(matches!(
            ChangeEvent::from_notification("nochannel", "k"),
            Err(DecodeError::MalformedChannel(_))
        ));
    }

    #[test]
    fn channel_round_trips_kind() {
        for kind in [EventKind::Set, EventKind::Delete, EventKind::Expired] {
            let channel = ChangeEvent::channel("__keyevent@0__", kind);
            assert_eq!(ChangeEvent::from_notification(&channel, "k").unwrap().kind, kind);
        }
    }
}
