//! Call metadata: headers and session carried next to the RPC body.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::action::{ActionVersion, Headers};
use crate::types::{Error, Result, TraceId};

/// Call metadata. Keys are compared case-insensitively.
pub type Metadata = BTreeMap<String, String>;

pub const ACTION_VERSION: &str = "actionversion";
pub const TRACE_ID: &str = "traceid";
pub const ACCEPT_LANGUAGE: &str = "acceptlanguage";
pub const PLATFORM_TYPE: &str = "platformtype";
pub const MOBILE_UID: &str = "mobileuid";
pub const APP_VERSION: &str = "appversion";
pub const PLATFORM_VERSION: &str = "platformversion";
pub const SERVICE_CODE: &str = "servicecode";
pub const TRACING: &str = "tracing";
pub const SESSION: &str = "session";

/// Lowercase every key. Later duplicates win.
pub fn normalize(metadata: Metadata) -> Metadata {
    metadata
        .into_iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v))
        .collect()
}

/// Build request headers from normalized metadata.
///
/// `default_version` applies when the caller names none; a fresh trace id is
/// generated when absent.
pub fn extract_headers(metadata: &Metadata, default_version: ActionVersion) -> Headers {
    let get = |key: &str| metadata.get(key).cloned();
    Headers {
        action_version: Some(
            get(ACTION_VERSION)
                .map(ActionVersion::new)
                .unwrap_or(default_version),
        ),
        trace_id: Some(get(TRACE_ID).unwrap_or_else(|| TraceId::new().as_str().to_string())),
        accept_language: get(ACCEPT_LANGUAGE),
        platform_type: get(PLATFORM_TYPE),
        mobile_uid: get(MOBILE_UID),
        app_version: get(APP_VERSION),
        platform_version: get(PLATFORM_VERSION),
        service_code: get(SERVICE_CODE),
        tracing: get(TRACING),
        ..Headers::default()
    }
}

/// Decode the base64 JSON `session` entry, if present.
pub fn extract_session(metadata: &Metadata) -> Result<Option<Value>> {
    let Some(encoded) = metadata.get(SESSION) else {
        return Ok(None);
    };
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| Error::validation(format!("session metadata is not base64: {e}")))?;
    let session = serde_json::from_slice(&bytes)
        .map_err(|e| Error::validation(format!("session metadata is not JSON: {e}")))?;
    Ok(Some(session))
}

pub fn encode_session(session: &Value) -> String {
    STANDARD.encode(session.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn metadata(pairs: &[(&str, &str)]) -> Metadata {
        normalize(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn keys_are_case_insensitive() {
        let md = metadata(&[("ActionVersion", "v2"), ("TraceId", "t-1"), ("MobileUid", "m")]);
        let headers = extract_headers(&md, ActionVersion::v1());

        assert_eq!(headers.action_version, Some(ActionVersion::new("v2")));
        assert_eq!(headers.trace_id.as_deref(), Some("t-1"));
        assert_eq!(headers.mobile_uid.as_deref(), Some("m"));
    }

    #[test]
    fn defaults_version_and_generates_trace_id() {
        let headers = extract_headers(&Metadata::new(), ActionVersion::new("v3"));

        assert_eq!(headers.action_version, Some(ActionVersion::new("v3")));
        let trace_id = headers.trace_id.unwrap();
        assert_eq!(trace_id.len(), 36);
        assert!(headers.service_code.is_none());
    }

    #[test]
    fn session_round_trips_through_base64() {
        let session = json!({ "sessionType": "User", "user": { "identifier": "u-1" } });
        let md = metadata(&[("Session", &encode_session(&session))]);

        assert_eq!(extract_session(&md).unwrap(), Some(session));
        assert_eq!(extract_session(&Metadata::new()).unwrap(), None);
    }

    #[test]
    fn malformed_session_is_a_validation_error() {
        let md = metadata(&[("session", "%%%")]);
        assert_eq!(extract_session(&md).unwrap_err().status_code(), 422);

        let md = metadata(&[("session", &STANDARD.encode("not json"))]);
        assert!(extract_session(&md).unwrap_err().to_string().contains("not JSON"));
    }
}
