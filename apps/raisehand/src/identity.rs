use std::fmt;
use std::str::FromStr;

use remote_state::QueueEntry;

use crate::error::ValidationError;

/// Normalized `(name, business)` pair. Comparison is case-insensitive and
/// ignores surrounding whitespace; a missing business name equals an empty one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParticipantKey {
    name: String,
    business: String,
}

impl ParticipantKey {
    pub fn new(name: &str, business: Option<&str>) -> Self {
        Self {
            name: normalize(name),
            business: business.map(normalize).unwrap_or_default(),
        }
    }

    pub fn of(entry: &QueueEntry) -> Self {
        Self::new(&entry.display_name, entry.business_name.as_deref())
    }

    pub fn matches(&self, entry: &QueueEntry) -> bool {
        *self == Self::of(entry)
    }
}

fn normalize(value: &str) -> String {
    value.trim().to_lowercase()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Role {
    #[default]
    Participant,
    Moderator,
}

impl FromStr for Role {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "participant" | "user" => Ok(Role::Participant),
            "moderator" | "admin" => Ok(Role::Moderator),
            other => Err(format!("unknown role {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub name: String,
    pub business_name: Option<String>,
    pub role: Role,
}

impl Participant {
    pub fn new(
        name: &str,
        business_name: Option<&str>,
        role: Role,
    ) -> Result<Self, ValidationError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ValidationError::EmptyName);
        }
        let business_name = business_name
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .map(str::to_string);
        Ok(Self {
            name: name.to_string(),
            business_name,
            role,
        })
    }

    pub fn key(&self) -> ParticipantKey {
        ParticipantKey::new(&self.name, self.business_name.as_deref())
    }

    pub fn is_moderator(&self) -> bool {
        self.role == Role::Moderator
    }
}

/// Event codes are typed by hand: trimmed, uppercased, no inner whitespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventCode(String);

impl EventCode {
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let code = raw.trim().to_uppercase();
        if code.is_empty() || code.chars().any(char::is_whitespace) {
            return Err(ValidationError::InvalidEventCode(raw.to_string()));
        }
        Ok(Self(code))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_ignore_case_and_missing_business() {
        assert_eq!(
            ParticipantKey::new(" Alice ", Some("ACME")),
            ParticipantKey::new("alice", Some("acme "))
        );
        assert_eq!(
            ParticipantKey::new("Bob", None),
            ParticipantKey::new("BOB", Some(""))
        );
        assert_ne!(
            ParticipantKey::new("Alice", Some("ACME")),
            ParticipantKey::new("Alice", None)
        );
    }

    #[test]
    fn participant_requires_a_name() {
        assert_eq!(
            Participant::new("  ", None, Role::Participant),
            Err(ValidationError::EmptyName)
        );
        let p = Participant::new("Alice", Some("  "), Role::Moderator).unwrap();
        assert_eq!(p.business_name, None);
        assert!(p.is_moderator());
    }

    #[test]
    fn event_codes_are_normalized() {
        assert_eq!(EventCode::parse(" seminar24 ").unwrap().as_str(), "SEMINAR24");
        assert!(matches!(
            EventCode::parse("SEM 24"),
            Err(ValidationError::InvalidEventCode(_))
        ));
        assert!(EventCode::parse("").is_err());
    }

    #[test]
    fn roles_parse_from_config_strings() {
        assert_eq!("admin".parse::<Role>(), Ok(Role::Moderator));
        assert_eq!("Participant".parse::<Role>(), Ok(Role::Participant));
        assert!("guest".parse::<Role>().is_err());
    }
}
