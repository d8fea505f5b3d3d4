//! Process type registry - Canonical names for the supervised tool families

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::error::{SupervisorError, SupervisorResult};

/// A supervised tool family
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProcessType {
    Oobabooga,
    ZWaifu,
    Ollama,
    Rvc,
    /// Unrecognized input, title-cased
    AdHoc(String),
}

/// Lowercased aliases accepted for each known type
const ALIASES: &[(&str, ProcessType)] = &[
    ("oobabooga", ProcessType::Oobabooga),
    ("oobobooga", ProcessType::Oobabooga), // common misspelling
    ("text-generation-webui", ProcessType::Oobabooga),
    ("z-waifu", ProcessType::ZWaifu),
    ("zwaifu", ProcessType::ZWaifu),
    ("z_waifu", ProcessType::ZWaifu),
    ("z waifu", ProcessType::ZWaifu),
    ("ollama", ProcessType::Ollama),
    ("rvc", ProcessType::Rvc),
];

const KNOWN: &[ProcessType] = &[
    ProcessType::Oobabooga,
    ProcessType::ZWaifu,
    ProcessType::Ollama,
    ProcessType::Rvc,
];

impl ProcessType {
    /// The fixed set of known types
    pub fn known() -> &'static [ProcessType] {
        KNOWN
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Oobabooga => "Oobabooga",
            Self::ZWaifu => "Z-Waifu",
            Self::Ollama => "Ollama",
            Self::Rvc => "RVC",
            Self::AdHoc(name) => name,
        }
    }

    pub fn is_ad_hoc(&self) -> bool {
        matches!(self, Self::AdHoc(_))
    }
}

impl std::fmt::Display for ProcessType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a free-form type string to its canonical type.
///
/// Matching is case-insensitive against the alias table. Anything else is
/// title-cased and returned as [`ProcessType::AdHoc`]; callers decide whether
/// ad-hoc types are acceptable (see [`resolve`]).
pub fn canonicalize(raw: &str) -> ProcessType {
    let trimmed = raw.trim();
    let lowered = trimmed.to_lowercase();

    ALIASES
        .iter()
        .find(|(alias, _)| *alias == lowered)
        .map(|(_, ty)| ty.clone())
        .unwrap_or_else(|| ProcessType::AdHoc(title_case(trimmed)))
}

/// Canonicalize under the ad-hoc policy
pub fn resolve(raw: &str, allow_ad_hoc: bool) -> SupervisorResult<ProcessType> {
    if raw.trim().is_empty() {
        return Err(SupervisorError::UnknownType(raw.to_string()));
    }

    match canonicalize(raw) {
        ProcessType::AdHoc(_) if !allow_ad_hoc => {
            Err(SupervisorError::UnknownType(raw.trim().to_string()))
        }
        ty => Ok(ty),
    }
}

/// Upper-case the first letter of every alphabetic run, lower-case the rest
fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_alpha = false;
    for c in s.chars() {
        if c.is_alphabetic() {
            if prev_alpha {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            prev_alpha = true;
        } else {
            out.push(c);
            prev_alpha = false;
        }
    }
    out
}

impl Serialize for ProcessType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ProcessType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(canonicalize(&raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_casing_of_a_known_name_canonicalizes_identically() {
        for raw in ["oobabooga", "Oobabooga", "OOBABOOGA", "OOBOBOOGA", "  oObAbOoGa "] {
            assert_eq!(canonicalize(raw), ProcessType::Oobabooga, "{raw}");
        }
        for raw in ["zwaifu", "Zwaifu", "ZWAIFU", "Z-Waifu", "z_waifu"] {
            assert_eq!(canonicalize(raw), ProcessType::ZWaifu, "{raw}");
        }
        for raw in ["rvc", "Rvc", "RVC"] {
            assert_eq!(canonicalize(raw), ProcessType::Rvc, "{raw}");
        }
        assert_eq!(canonicalize("OLLAMA"), ProcessType::Ollama);
    }

    #[test]
    fn unknown_names_are_title_cased() {
        assert_eq!(
            canonicalize("kobold cpp"),
            ProcessType::AdHoc("Kobold Cpp".into())
        );
        assert_eq!(
            canonicalize("SILLY-tavern"),
            ProcessType::AdHoc("Silly-Tavern".into())
        );
        // Same raw string, same result
        assert_eq!(canonicalize("sillytavern"), canonicalize("SillyTavern"));
    }

    #[test]
    fn display_uses_canonical_spelling() {
        assert_eq!(ProcessType::ZWaifu.to_string(), "Z-Waifu");
        assert_eq!(ProcessType::Rvc.to_string(), "RVC");
        assert_eq!(ProcessType::known().len(), 4);
    }

    #[test]
    fn resolve_applies_ad_hoc_policy() {
        assert_eq!(resolve("ollama", false).unwrap(), ProcessType::Ollama);
        assert!(matches!(
            resolve("ollamma", false),
            Err(SupervisorError::UnknownType(_))
        ));
        assert_eq!(
            resolve("ollamma", true).unwrap(),
            ProcessType::AdHoc("Ollamma".into())
        );
        assert!(resolve("   ", true).is_err());
    }

    #[test]
    fn serde_goes_through_canonicalize() {
        let json = serde_json::to_string(&ProcessType::ZWaifu).unwrap();
        assert_eq!(json, "\"Z-Waifu\"");
        let parsed: ProcessType = serde_json::from_str("\"zwaifu\"").unwrap();
        assert_eq!(parsed, ProcessType::ZWaifu);
    }
}
