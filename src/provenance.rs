//! Execution-environment fingerprint recorded with every build phase

use crate::parallel::get_parallel_info;
use crate::utils::hostname;
use serde_json::{json, Value as JsonValue};

/// Host, process, crate version and thread information as a JSON object
pub fn gather_provenance_info() -> JsonValue {
    json!({
        "host": hostname(),
        "pid": std::process::id(),
        "time": chrono::Utc::now().to_rfc3339(),
        "os": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "version": env!("CARGO_PKG_VERSION"),
        "package": env!("CARGO_PKG_NAME"),
        "parallel": get_parallel_info(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_has_host_and_version() {
        let info = gather_provenance_info();
        assert!(info["host"].is_string());
        assert_eq!(info["version"], env!("CARGO_PKG_VERSION"));
        assert!(info["parallel"]["available_cores"].as_u64().unwrap() >= 1);
    }
}
