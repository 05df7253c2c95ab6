//! TPM 2 profile documents: a JSON object enumerating the algorithms and
//! attributes the engine should enable.

use serde_json::Value;

use crate::DrvError;

const BUILTIN_PROFILES: &[&str] = &["default-v1", "null"];

/// A validated profile document.
#[derive(Debug, Clone)]
pub struct Profile {
    name: Option<String>,
    json: String,
}

impl Profile {
    /// Parse and validate an inline JSON profile. The document must be an
    /// object; `Name`, `Algorithms`, and `Attributes`, when present, must be
    /// strings.
    pub fn from_json(json: &str) -> Result<Self, DrvError> {
        let value: Value = serde_json::from_str(json)
            .map_err(|e| DrvError::Profile(format!("invalid json: {e}")))?;
        let obj = value
            .as_object()
            .ok_or_else(|| DrvError::Profile("profile must be a json object".into()))?;
        for key in ["Name", "Algorithms", "Attributes"] {
            if let Some(v) = obj.get(key) {
                if !v.is_string() {
                    return Err(DrvError::Profile(format!("'{key}' must be a string")));
                }
            }
        }
        let name = obj.get("Name").and_then(Value::as_str).map(str::to_string);
        Ok(Profile { name, json: json.to_string() })
    }

    /// Select a built-in profile by name.
    pub fn builtin(name: &str) -> Result<Self, DrvError> {
        if !BUILTIN_PROFILES.contains(&name) {
            return Err(DrvError::Profile(format!("unknown profile '{name}'")));
        }
        Ok(Profile { name: Some(name.to_string()), json: format!("{{\"Name\":\"{name}\"}}") })
    }

    /// The profile name, when the document carries one.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The document as it will be handed to the engine.
    pub fn as_json(&self) -> &str {
        &self.json
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_profile_is_validated() {
        let p = Profile::from_json(r#"{"Name":"custom","Algorithms":"rsa,sha256"}"#).unwrap();
        assert_eq!(p.name(), Some("custom"));

        assert!(Profile::from_json("[1,2]").is_err());
        assert!(Profile::from_json(r#"{"Name":7}"#).is_err());
        assert!(Profile::from_json("not json").is_err());
    }

    #[test]
    fn builtin_profiles_resolve() {
        let p = Profile::builtin("null").unwrap();
        assert_eq!(p.name(), Some("null"));
        assert!(Profile::builtin("does-not-exist").is_err());
    }
}
