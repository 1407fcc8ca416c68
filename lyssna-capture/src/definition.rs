//! Source definition syntax.
//!
//! `interface[:key=value[,key=value...]]` — keys are lower-ASCII, values may
//! be double-quoted to contain commas. Reserved keys: `type`, `uuid`,
//! `name`, `channels`, `channel`, `retry`. A missing or `auto` type sends
//! the definition through the probe race.

use std::fmt;

use uuid::Uuid;

use crate::error::CaptureError;

pub const TYPE_AUTO: &str = "auto";

/// A parsed source definition. Options keep their original order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceDefinition {
    raw: String,
    interface: String,
    options: Vec<(String, String)>,
}

impl SourceDefinition {
    pub fn parse(raw: &str) -> Result<Self, CaptureError> {
        let bad = |why: &str| CaptureError::BadDefinition(format!("'{raw}': {why}"));

        let (interface, rest) = match raw.split_once(':') {
            Some((iface, rest)) => (iface, Some(rest)),
            None => (raw, None),
        };
        if interface.is_empty() {
            return Err(bad("empty interface"));
        }
        if !interface.is_ascii() {
            return Err(bad("interface is not ASCII"));
        }

        let mut options = Vec::new();
        if let Some(rest) = rest {
            let mut chars = rest.chars().peekable();
            while chars.peek().is_some() {
                let mut key = String::new();
                let mut saw_eq = false;
                for c in chars.by_ref() {
                    if c == '=' {
                        saw_eq = true;
                        break;
                    }
                    key.push(c);
                }
                if key.is_empty() {
                    return Err(bad("empty option key"));
                }
                if !saw_eq {
                    return Err(bad("option without '=value'"));
                }
                if !key
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
                {
                    return Err(bad("option keys must be ASCII alphanumeric"));
                }

                let mut value = String::new();
                match chars.peek() {
                    Some('"') => {
                        chars.next();
                        let mut terminated = false;
                        for c in chars.by_ref() {
                            if c == '"' {
                                terminated = true;
                                break;
                            }
                            value.push(c);
                        }
                        if !terminated {
                            return Err(bad("unterminated quoted value"));
                        }
                        // Quoted value must end the option.
                        match chars.next() {
                            None | Some(',') => {}
                            Some(_) => return Err(bad("garbage after quoted value")),
                        }
                    }
                    _ => {
                        for c in chars.by_ref() {
                            if c == ',' {
                                break;
                            }
                            value.push(c);
                        }
                    }
                }
                options.push((key.to_ascii_lowercase(), value));
            }
        }

        Ok(Self {
            raw: raw.to_string(),
            interface: interface.to_string(),
            options,
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// First value for `key`, if any.
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn type_tag(&self) -> Option<&str> {
        self.option("type")
    }

    /// True when the definition must go through the probe race.
    pub fn is_auto(&self) -> bool {
        match self.type_tag() {
            None => true,
            Some(t) => t.eq_ignore_ascii_case(TYPE_AUTO),
        }
    }

    /// Operator-pinned source identity, if present.
    pub fn uuid(&self) -> Result<Option<Uuid>, CaptureError> {
        match self.option("uuid") {
            None => Ok(None),
            Some(v) => Uuid::parse_str(v).map(Some).map_err(|_| {
                CaptureError::BadDefinition(format!("'{}': invalid uuid '{v}'", self.raw))
            }),
        }
    }

    /// Human label; falls back to the interface.
    pub fn name(&self) -> &str {
        self.option("name").unwrap_or(&self.interface)
    }

    /// Channel list from `channels=`, comma-separated inside the
    /// (usually quoted) value.
    pub fn channels(&self) -> Vec<String> {
        self.option("channels")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Single channel lock from `channel=`.
    pub fn channel(&self) -> Option<&str> {
        self.option("channel").filter(|v| !v.is_empty())
    }

    /// Per-source retry override; `None` defers to configuration.
    pub fn retry(&self) -> Option<bool> {
        self.option("retry").map(|v| {
            matches!(
                v.to_ascii_lowercase().as_str(),
                "true" | "yes" | "1" | "on"
            )
        })
    }
}

impl fmt::Display for SourceDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_interface() {
        let def = SourceDefinition::parse("wlan0").unwrap();
        assert_eq!(def.interface(), "wlan0");
        assert!(def.is_auto());
        assert_eq!(def.name(), "wlan0");
        assert!(def.channels().is_empty());
    }

    #[test]
    fn typed_with_options() {
        let def = SourceDefinition::parse("wlan0:type=wifi,name=upstairs").unwrap();
        assert_eq!(def.type_tag(), Some("wifi"));
        assert!(!def.is_auto());
        assert_eq!(def.name(), "upstairs");
    }

    #[test]
    fn quoted_value_holds_commas() {
        let def = SourceDefinition::parse("wlan0:type=wifi,channels=\"1,6,11\"").unwrap();
        assert_eq!(def.channels(), ["1", "6", "11"]);
        assert_eq!(def.type_tag(), Some("wifi"));
    }

    #[test]
    fn explicit_auto_probes() {
        let def = SourceDefinition::parse("hci0:type=auto").unwrap();
        assert!(def.is_auto());
    }

    #[test]
    fn keys_normalize_to_lowercase() {
        let def = SourceDefinition::parse("wlan0:TYPE=wifi").unwrap();
        assert_eq!(def.type_tag(), Some("wifi"));
    }

    #[test]
    fn pinned_uuid_parses() {
        let def =
            SourceDefinition::parse("wlan0:uuid=6c1ab781-8fc9-4b08-b8bc-cfd7aaa9b059").unwrap();
        assert!(def.uuid().unwrap().is_some());

        let def = SourceDefinition::parse("wlan0:uuid=not-a-uuid").unwrap();
        assert!(matches!(
            def.uuid(),
            Err(CaptureError::BadDefinition(_))
        ));
    }

    #[test]
    fn retry_override() {
        assert_eq!(
            SourceDefinition::parse("wlan0:retry=false").unwrap().retry(),
            Some(false)
        );
        assert_eq!(
            SourceDefinition::parse("wlan0:retry=true").unwrap().retry(),
            Some(true)
        );
        assert_eq!(SourceDefinition::parse("wlan0").unwrap().retry(), None);
    }

    #[test]
    fn malformed_rejected() {
        assert!(SourceDefinition::parse("").is_err());
        assert!(SourceDefinition::parse(":type=wifi").is_err());
        assert!(SourceDefinition::parse("wlan0:=wifi").is_err());
        assert!(SourceDefinition::parse("wlan0:channels=\"1,6").is_err());
        assert!(SourceDefinition::parse("wlan0:ch@n=1").is_err());
    }
}
