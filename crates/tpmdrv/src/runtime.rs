//! Host crypto-runtime fixup.
//!
//! A FIPS-enabled host disables algorithms a TPM 2 profile may require; in
//! that case the crypto library is asked to drop FIPS mode. SHA-1 signature
//! support may likewise need an explicit opt-in through the environment.

use serde_json::Value;
use tracing::{info, warn};

use crate::engine::TpmEngine;
use crate::wire::TpmVersion;
use crate::DrvError;

const FIPS_SYSCTL: &str = "/proc/sys/crypto/fips_enabled";
const SHA1_SIGNATURES_ENV: &str = "OPENSSL_ENABLE_SHA1_SIGNATURES";

// Algorithms a FIPS-enabled crypto library refuses.
const FIPS_DISABLED: &[&str] = &["rsaes", "tdes", "camellia", "sha1"];

/// Whether the host crypto policy is in FIPS mode.
pub fn fips_mode_enabled() -> bool {
    std::fs::read_to_string(FIPS_SYSCTL).map(|s| s.trim() == "1").unwrap_or(false)
}

fn enabled_list(json: Option<String>, map_key: &str) -> Vec<String> {
    let Some(json) = json else { return Vec::new() };
    let Ok(value) = serde_json::from_str::<Value>(&json) else { return Vec::new() };
    value
        .get(map_key)
        .and_then(|m| m.get("Enabled"))
        .and_then(Value::as_str)
        .map(|s| s.split(',').map(|a| a.trim().to_string()).collect())
        .unwrap_or_default()
}

fn contains(list: &[String], name: &str) -> bool {
    list.iter().any(|a| a == name)
}

/// Align the host crypto configuration with what the active profile needs.
/// Fails startup when the profile cannot be made viable.
pub fn configure_crypto<E: TpmEngine>(
    engine: &mut E,
    version: TpmVersion,
) -> Result<(), DrvError> {
    let fips = fips_mode_enabled();

    if version == TpmVersion::V12 {
        // The TPM 1.2 command set inherently needs FIPS-disabled algorithms.
        if fips {
            engine.disable_fips()?;
            info!("dropped FIPS mode for the TPM 1.2 command set");
        }
        return Ok(());
    }

    let algorithms = enabled_list(engine.runtime_algorithms(), "RuntimeAlgorithms");
    let attributes = enabled_list(engine.runtime_attributes(), "RuntimeAttributes");

    if fips && FIPS_DISABLED.iter().any(|a| contains(&algorithms, a)) {
        engine.disable_fips()?;
        info!("profile needs FIPS-disabled algorithms; dropped FIPS mode");
    }

    // SHA-1 signatures stay off when the profile itself rules them out.
    let sha1_ruled_out = contains(&attributes, "fips-host")
        || (contains(&attributes, "no-sha1-signing")
            && contains(&attributes, "no-sha1-verification"));
    if !sha1_ruled_out && contains(&algorithms, "sha1") {
        std::env::set_var(SHA1_SIGNATURES_ENV, "1");
        warn!("setting {SHA1_SIGNATURES_ENV}=1 for the active profile");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enabled_list_parses_runtime_info() {
        let json = r#"{"RuntimeAlgorithms":{"Enabled":"rsa,sha1, sha256"}}"#;
        let list = enabled_list(Some(json.to_string()), "RuntimeAlgorithms");
        assert_eq!(list, vec!["rsa", "sha1", "sha256"]);
        assert!(enabled_list(None, "RuntimeAlgorithms").is_empty());
        assert!(enabled_list(Some("not json".into()), "RuntimeAlgorithms").is_empty());
    }
}
