//! Remote update descriptor.
//!
//! Fetched fresh on every check and never persisted. Version comparison is
//! exact string inequality: any mismatch counts as an available update,
//! downgrades included.

use serde::Deserialize;

use crate::error::{Result, SupervisorError};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateManifest {
    pub version: String,
    #[serde(default)]
    pub update_date: String,
    pub download_url: String,
    /// Hex-encoded SHA-256 of the artifact, 64 characters.
    pub sha256: String,
    #[serde(default)]
    pub force_update: bool,
    #[serde(default)]
    pub update_content: Vec<String>,
}

impl UpdateManifest {
    pub fn differs_from(&self, running_version: &str) -> bool {
        self.version != running_version
    }

    pub fn digest_is_well_formed(&self) -> bool {
        self.sha256.len() == 64 && self.sha256.bytes().all(|b| b.is_ascii_hexdigit())
    }
}

/// Only plain and secure HTTP are acceptable transfer schemes. Checked
/// before any network request is issued.
pub(crate) fn validate_http_url(raw: &str) -> Result<reqwest::Url> {
    let url = reqwest::Url::parse(raw)
        .map_err(|e| SupervisorError::PathSecurity(format!("invalid url {raw}: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(SupervisorError::PathSecurity(format!(
            "url scheme {other} is not allowed"
        ))),
    }
}

/// File name the artifact installs under, taken from the download URL's
/// last path segment. Anything that could resolve outside the target
/// directory is rejected here, before the canonical-path check.
pub(crate) fn artifact_file_name(url: &reqwest::Url) -> Result<String> {
    let segment = url
        .path_segments()
        .and_then(|mut s| s.next_back())
        .unwrap_or("");
    if segment.is_empty()
        || segment == "."
        || segment == ".."
        || segment.contains('/')
        || segment.contains('\\')
        || segment.contains('%')
    {
        return Err(SupervisorError::PathSecurity(format!(
            "download url has no safe file name: {url}"
        )));
    }
    Ok(segment.to_string())
}

pub async fn fetch_manifest(client: &reqwest::Client, url: &str) -> Result<UpdateManifest> {
    let url = validate_http_url(url)?;
    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| SupervisorError::Network(e.to_string()))?
        .error_for_status()
        .map_err(|e| SupervisorError::Network(e.to_string()))?;
    resp.json::<UpdateManifest>()
        .await
        .map_err(|e| SupervisorError::Network(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_remote_field_names() {
        let json = r#"{
            "version": "2.1.0",
            "updateDate": "2026-08-01",
            "downloadUrl": "https://releases.example.com/quarry-2.1.0.bin",
            "sha256": "aAbBcCdDeEfF00112233445566778899aabbccddeeff00112233445566778899",
            "forceUpdate": true,
            "updateContent": ["restart guard fixes", "faster downloads"]
        }"#;
        let m: UpdateManifest = serde_json::from_str(json).unwrap();
        assert_eq!(m.version, "2.1.0");
        assert!(m.force_update);
        assert_eq!(m.update_content.len(), 2);
        assert!(m.digest_is_well_formed());
    }

    #[test]
    fn optional_fields_default() {
        let json = r#"{
            "version": "2.1.0",
            "downloadUrl": "https://releases.example.com/quarry-2.1.0.bin",
            "sha256": "0000000000000000000000000000000000000000000000000000000000000000"
        }"#;
        let m: UpdateManifest = serde_json::from_str(json).unwrap();
        assert!(!m.force_update);
        assert!(m.update_content.is_empty());
        assert!(m.update_date.is_empty());
    }

    #[test]
    fn any_version_difference_is_an_update() {
        let m: UpdateManifest = serde_json::from_str(
            r#"{"version":"1.0.0","downloadUrl":"https://x.example/a.bin","sha256":""}"#,
        )
        .unwrap();
        assert!(!m.differs_from("1.0.0"));
        assert!(m.differs_from("1.0.1"));
        // Downgrades count too.
        assert!(m.differs_from("2.0.0"));
    }

    #[test]
    fn rejects_non_http_schemes() {
        assert!(matches!(
            validate_http_url("ftp://releases.example.com/quarry.bin"),
            Err(SupervisorError::PathSecurity(_))
        ));
        assert!(matches!(
            validate_http_url("file:///etc/passwd"),
            Err(SupervisorError::PathSecurity(_))
        ));
        assert!(validate_http_url("http://releases.example.com/quarry.bin").is_ok());
        assert!(validate_http_url("https://releases.example.com/quarry.bin").is_ok());
    }

    #[test]
    fn rejects_traversal_file_names() {
        let ok = validate_http_url("https://x.example/dl/quarry-2.bin").unwrap();
        assert_eq!(artifact_file_name(&ok).unwrap(), "quarry-2.bin");

        for bad in [
            "https://x.example/",
            "https://x.example/..",
            "https://x.example/dl/..%2fquarry.bin",
        ] {
            let url = validate_http_url(bad).unwrap();
            assert!(
                matches!(
                    artifact_file_name(&url),
                    Err(SupervisorError::PathSecurity(_))
                ),
                "expected rejection for {bad}"
            );
        }
    }

    #[test]
    fn malformed_digests_are_detected() {
        let mut m: UpdateManifest = serde_json::from_str(
            r#"{"version":"1","downloadUrl":"https://x.example/a.bin","sha256":"short"}"#,
        )
        .unwrap();
        assert!(!m.digest_is_well_formed());
        m.sha256 = "zz".repeat(32);
        assert!(!m.digest_is_well_formed());
        m.sha256 = "ab".repeat(32);
        assert!(m.digest_is_well_formed());
    }
}
