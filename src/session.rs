//! Caller sessions and log-correlation projection.
//!
//! A session is a closed set of variants keyed by the `sessionType` tag. Each
//! variant carries the identity needed for exactly one correlation field;
//! [`LogFields::project`] flattens it together with the request headers into
//! the fields attached to every log line of an invocation.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::action::Headers;
use crate::types::{Error, ObjectId, Result};

/// Session type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SessionType {
    User,
    PortalUser,
    CabinetUser,
    EResident,
    EResidentApplicant,
    ServiceUser,
    Partner,
    Acquirer,
    Temporary,
    ServiceEntrance,
    #[default]
    None,
}

impl SessionType {
    pub const ALL: [SessionType; 11] = [
        SessionType::User,
        SessionType::PortalUser,
        SessionType::CabinetUser,
        SessionType::EResident,
        SessionType::EResidentApplicant,
        SessionType::ServiceUser,
        SessionType::Partner,
        SessionType::Acquirer,
        SessionType::Temporary,
        SessionType::ServiceEntrance,
        SessionType::None,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SessionType::User => "User",
            SessionType::PortalUser => "PortalUser",
            SessionType::CabinetUser => "CabinetUser",
            SessionType::EResident => "EResident",
            SessionType::EResidentApplicant => "EResidentApplicant",
            SessionType::ServiceUser => "ServiceUser",
            SessionType::Partner => "Partner",
            SessionType::Acquirer => "Acquirer",
            SessionType::Temporary => "Temporary",
            SessionType::ServiceEntrance => "ServiceEntrance",
            SessionType::None => "None",
        }
    }

    /// Correlation field this session type populates.
    pub fn correlation_field(self) -> Option<CorrelationField> {
        match self {
            SessionType::User
            | SessionType::PortalUser
            | SessionType::CabinetUser
            | SessionType::EResident
            | SessionType::EResidentApplicant => Some(CorrelationField::UserIdentifier),
            SessionType::ServiceUser
            | SessionType::Partner
            | SessionType::Acquirer
            | SessionType::Temporary
            | SessionType::ServiceEntrance => Some(CorrelationField::SessionOwnerId),
            SessionType::None => None,
        }
    }
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        SessionType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::UnknownSessionType(s.to_string()))
    }
}

/// Log field populated from a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelationField {
    UserIdentifier,
    SessionOwnerId,
}

impl CorrelationField {
    pub fn as_str(self) -> &'static str {
        match self {
            CorrelationField::UserIdentifier => "userIdentifier",
            CorrelationField::SessionOwnerId => "sessionOwnerId",
        }
    }
}

/// End-user identity (citizen, portal, cabinet and e-resident sessions).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub identifier: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Internal operator identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceUserIdentity {
    pub login: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Partner or acquirer account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountIdentity {
    #[serde(rename = "_id", with = "flexible_object_id")]
    pub id: ObjectId,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Temporary (pre-authentication) device session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemporaryIdentity {
    pub mobile_uid: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Service entrance on behalf of an acquirer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntranceIdentity {
    #[serde(with = "flexible_object_id")]
    pub acquirer_id: ObjectId,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Typed caller session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "sessionType")]
pub enum Session {
    User {
        user: UserIdentity,
    },
    PortalUser {
        user: UserIdentity,
    },
    CabinetUser {
        user: UserIdentity,
    },
    EResident {
        user: UserIdentity,
    },
    EResidentApplicant {
        user: UserIdentity,
    },
    ServiceUser {
        #[serde(rename = "serviceUser")]
        service_user: ServiceUserIdentity,
    },
    Partner {
        partner: AccountIdentity,
    },
    Acquirer {
        acquirer: AccountIdentity,
    },
    Temporary {
        temporary: TemporaryIdentity,
    },
    ServiceEntrance {
        entrance: EntranceIdentity,
    },
    None,
}

impl Session {
    /// Parse a session from its JSON form.
    ///
    /// A missing tag means [`Session::None`]. A tag outside the closed set is
    /// [`Error::UnknownSessionType`]; a known tag with malformed identity
    /// fields is a validation error.
    pub fn from_value(value: &Value) -> Result<Self> {
        let tag = match value.get("sessionType") {
            None | Some(Value::Null) => return Ok(Session::None),
            Some(Value::String(tag)) => tag.parse::<SessionType>()?,
            Some(other) => return Err(Error::UnknownSessionType(other.to_string())),
        };

        serde_json::from_value(value.clone())
            .map_err(|e| Error::validation(format!("session {tag}: {e}")))
    }

    pub fn session_type(&self) -> SessionType {
        match self {
            Session::User { .. } => SessionType::User,
            Session::PortalUser { .. } => SessionType::PortalUser,
            Session::CabinetUser { .. } => SessionType::CabinetUser,
            Session::EResident { .. } => SessionType::EResident,
            Session::EResidentApplicant { .. } => SessionType::EResidentApplicant,
            Session::ServiceUser { .. } => SessionType::ServiceUser,
            Session::Partner { .. } => SessionType::Partner,
            Session::Acquirer { .. } => SessionType::Acquirer,
            Session::Temporary { .. } => SessionType::Temporary,
            Session::ServiceEntrance { .. } => SessionType::ServiceEntrance,
            Session::None => SessionType::None,
        }
    }

    /// The correlation field and its value, `None` for anonymous sessions.
    pub fn correlation(&self) -> Option<(CorrelationField, String)> {
        let value = match self {
            Session::User { user }
            | Session::PortalUser { user }
            | Session::CabinetUser { user }
            | Session::EResident { user }
            | Session::EResidentApplicant { user } => user.identifier.clone(),
            Session::ServiceUser { service_user } => service_user.login.clone(),
            Session::Partner { partner: account } | Session::Acquirer { acquirer: account } => {
                account.id.to_hex()
            }
            Session::Temporary { temporary } => temporary.mobile_uid.clone(),
            Session::ServiceEntrance { entrance } => entrance.acquirer_id.to_hex(),
            Session::None => return None,
        };
        self.session_type()
            .correlation_field()
            .map(|field| (field, value))
    }
}

/// Flat log-correlation fields bound to one invocation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogFields {
    pub session_type: SessionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_identifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_owner_id: Option<String>,
    /// Request headers, copied verbatim.
    #[serde(flatten)]
    pub headers: Map<String, Value>,
}

impl LogFields {
    /// Project a session and headers into correlation fields.
    pub fn project(session: Option<&Session>, headers: Option<&Headers>) -> Self {
        let mut fields = LogFields {
            headers: headers.map(Headers::to_map).unwrap_or_default(),
            ..LogFields::default()
        };

        let Some(session) = session else {
            return fields;
        };
        fields.session_type = session.session_type();
        match session.correlation() {
            Some((CorrelationField::UserIdentifier, v)) => fields.user_identifier = Some(v),
            Some((CorrelationField::SessionOwnerId, v)) => fields.session_owner_id = Some(v),
            None => {}
        }
        fields
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.headers.get("traceId").and_then(Value::as_str)
    }

    /// Fields as string pairs, for outbound call metadata.
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        let value = serde_json::to_value(self).unwrap_or(Value::Null);
        let Value::Object(map) = value else {
            return Vec::new();
        };
        map.into_iter()
            .filter_map(|(k, v)| match v {
                Value::String(s) => Some((k, s)),
                Value::Null | Value::Object(_) => None,
                other => Some((k, other.to_string())),
            })
            .collect()
    }
}

/// Accepts an identifier as a bare hex string or as `{ "$objectId": hex }`.
mod flexible_object_id {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_json::Value;

    use crate::codec::object_id_from_json;
    use crate::types::ObjectId;

    pub fn serialize<S: Serializer>(id: &ObjectId, serializer: S) -> Result<S::Ok, S::Error> {
        id.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<ObjectId, D::Error> {
        let value = Value::deserialize(deserializer)?;
        object_id_from_json(&value)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid object id: {value}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const HEX: &str = "63fda9ec38f6a88647048a2c";

    fn session_json(tag: SessionType) -> Value {
        match tag {
            SessionType::User
            | SessionType::PortalUser
            | SessionType::CabinetUser
            | SessionType::EResident
            | SessionType::EResidentApplicant => {
                json!({"sessionType": tag.as_str(), "user": {"identifier": "user-identifier"}})
            }
            SessionType::ServiceUser => {
                json!({"sessionType": "ServiceUser", "serviceUser": {"login": "operator"}})
            }
            SessionType::Partner => json!({"sessionType": "Partner", "partner": {"_id": HEX}}),
            SessionType::Acquirer => {
                json!({"sessionType": "Acquirer", "acquirer": {"_id": {"$objectId": HEX}}})
            }
            SessionType::Temporary => {
                json!({"sessionType": "Temporary", "temporary": {"mobileUid": "mobile-uid"}})
            }
            SessionType::ServiceEntrance => {
                json!({"sessionType": "ServiceEntrance", "entrance": {"acquirerId": HEX}})
            }
            SessionType::None => json!({"sessionType": "None"}),
        }
    }

    #[test]
    fn every_tag_projects_exactly_its_field() {
        let cases = [
            (SessionType::User, Some("userIdentifier"), "user-identifier"),
            (SessionType::PortalUser, Some("userIdentifier"), "user-identifier"),
            (SessionType::CabinetUser, Some("userIdentifier"), "user-identifier"),
            (SessionType::EResident, Some("userIdentifier"), "user-identifier"),
            (SessionType::EResidentApplicant, Some("userIdentifier"), "user-identifier"),
            (SessionType::ServiceUser, Some("sessionOwnerId"), "operator"),
            (SessionType::Partner, Some("sessionOwnerId"), HEX),
            (SessionType::Acquirer, Some("sessionOwnerId"), HEX),
            (SessionType::Temporary, Some("sessionOwnerId"), "mobile-uid"),
            (SessionType::ServiceEntrance, Some("sessionOwnerId"), HEX),
            (SessionType::None, None, ""),
        ];

        for (tag, field, expected) in cases {
            let session = Session::from_value(&session_json(tag)).unwrap();
            let fields = LogFields::project(Some(&session), None);
            let value = serde_json::to_value(&fields).unwrap();

            assert_eq!(value["sessionType"], tag.as_str());
            let populated: Vec<&str> = ["userIdentifier", "sessionOwnerId"]
                .into_iter()
                .filter(|k| value.get(*k).is_some())
                .collect();
            match field {
                Some(field) => {
                    assert_eq!(populated, vec![field], "{tag}");
                    assert_eq!(value[field], expected);
                }
                None => assert!(populated.is_empty(), "{tag}"),
            }
        }
    }

    #[test]
    fn unknown_tag_raises() {
        let err = Session::from_value(&json!({"sessionType": "Robot"})).unwrap_err();
        assert!(matches!(err, Error::UnknownSessionType(ref t) if t == "Robot"));
        assert_eq!(err.to_string(), "Unexpected sessionType: Robot");
    }

    #[test]
    fn missing_tag_is_anonymous() {
        assert_eq!(Session::from_value(&json!({})).unwrap(), Session::None);
    }

    #[test]
    fn malformed_identity_is_validation_error() {
        let err = Session::from_value(&json!({"sessionType": "Partner", "partner": {"_id": 5}}))
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn headers_are_copied_into_fields() {
        let headers: Headers =
            serde_json::from_value(json!({"traceId": "trace-1", "mobileUid": "m-1"})).unwrap();
        let fields = LogFields::project(None, Some(&headers));

        assert_eq!(fields.session_type, SessionType::None);
        assert_eq!(fields.trace_id(), Some("trace-1"));
        let pairs = fields.to_pairs();
        assert!(pairs.contains(&("mobileUid".to_string(), "m-1".to_string())));
        assert!(pairs.contains(&("sessionType".to_string(), "None".to_string())));
    }
}
