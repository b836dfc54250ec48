//! Identity-provider admin events as they arrive on the broker.
//!
//! The services under test consume the admin notifications an identity
//! provider emits through its AMQP event listener. Tests publish the same
//! shape to drive them.

use std::collections::BTreeMap;
use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Java class name the event listener stamps on admin notifications.
pub const ADMIN_EVENT_CLASS: &str =
    "com.github.aznamier.keycloak.event.provider.EventAdminNotificationMqMsg";

/// Exchange the event listener publishes to.
pub const TOPIC_EXCHANGE: &str = "amq.topic";

/// Realm the organization suite's events originate from.
pub const ORGANIZATIONS_REALM: &str = "organizations";

/// Topic routing key of an admin event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoutingKey(String);

impl RoutingKey {
    /// `KK.EVENT.ADMIN.<realm>.SUCCESS.<resource_type>.<operation>`
    pub fn admin_success(realm: &str, resource_type: &str, operation: &str) -> Self {
        Self(format!(
            "KK.EVENT.ADMIN.{realm}.SUCCESS.{resource_type}.{operation}"
        ))
    }

    /// Key for a successful organization creation in the organizations realm.
    pub fn organization_created() -> Self {
        Self::admin_success(ORGANIZATIONS_REALM, "ORGANIZATION", "CREATE")
    }

    /// Arbitrary key, e.g. one nothing is bound to.
    pub fn raw(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The key as sent on the wire.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who performed the admin operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthDetails {
    /// Realm the acting user authenticated in.
    pub realm_id: String,
    /// Name of that realm.
    pub realm_name: String,
    /// Client the operation went through.
    pub client_id: String,
    /// Acting user.
    pub user_id: String,
    /// Caller address.
    pub ip_address: String,
}

/// A domain claimed by an organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizationDomain {
    /// Domain name.
    pub name: String,
    /// Whether ownership was verified.
    pub verified: bool,
}

/// The organization as the identity provider represents it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrganizationRepresentation {
    /// Organization id.
    pub id: Uuid,
    /// Display name; tenant schemas derive from it.
    pub name: String,
    /// Short unique alias.
    pub alias: String,
    /// Whether the organization is active.
    pub enabled: bool,
    /// Free text.
    pub description: String,
    /// Post-login redirect.
    pub redirect_url: String,
    /// Custom attributes.
    pub attributes: BTreeMap<String, Vec<String>>,
    /// Claimed domains.
    pub domains: Vec<OrganizationDomain>,
}

/// An admin notification.
///
/// `representation` holds the affected resource as a JSON-encoded string,
/// not a nested object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminEvent {
    /// Listener class name.
    #[serde(rename = "@class")]
    pub class: String,
    /// Epoch milliseconds.
    pub time: i64,
    /// Realm the resource lives in.
    pub realm_id: String,
    /// Who acted.
    pub auth_details: AuthDetails,
    /// e.g. `ORGANIZATION`.
    pub resource_type: String,
    /// e.g. `CREATE`.
    pub operation_type: String,
    /// Admin API path of the resource.
    pub resource_path: String,
    /// JSON-encoded resource.
    pub representation: String,
    /// Same as `resource_type`.
    pub resource_type_as_string: String,
}

impl AdminEvent {
    /// Organization-created event for `name` with `alias`, stamped now.
    pub fn organization_created(name: &str, alias: &str) -> Result<Self, serde_json::Error> {
        let representation = OrganizationRepresentation {
            id: Uuid::now_v7(),
            name: name.to_string(),
            alias: alias.to_string(),
            enabled: true,
            description: String::new(),
            redirect_url: String::new(),
            attributes: BTreeMap::new(),
            domains: vec![OrganizationDomain {
                name: format!("{alias}.example.com"),
                verified: false,
            }],
        };

        Ok(Self {
            class: ADMIN_EVENT_CLASS.to_string(),
            time: Utc::now().timestamp_millis(),
            realm_id: Uuid::now_v7().to_string(),
            auth_details: AuthDetails {
                realm_id: Uuid::now_v7().to_string(),
                realm_name: "master".to_string(),
                client_id: Uuid::now_v7().to_string(),
                user_id: Uuid::now_v7().to_string(),
                ip_address: "10.42.0.1".to_string(),
            },
            resource_type: "ORGANIZATION".to_string(),
            operation_type: "CREATE".to_string(),
            resource_path: format!("organizations/{}", Uuid::now_v7()),
            representation: serde_json::to_string(&representation)?,
            resource_type_as_string: "ORGANIZATION".to_string(),
        })
    }

    /// Decode the embedded organization.
    pub fn organization(&self) -> Result<OrganizationRepresentation, serde_json::Error> {
        serde_json::from_str(&self.representation)
    }

    /// Wire payload.
    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;

    #[test]
    fn organization_created_routing_key_matches_the_listener_format() {
        assert_eq!(
            RoutingKey::organization_created().as_str(),
            "KK.EVENT.ADMIN.organizations.SUCCESS.ORGANIZATION.CREATE"
        );
    }

    #[test]
    fn payload_uses_the_listener_field_names() {
        // Given an organization-created event
        let event =
            AdminEvent::organization_created("TestOrganization", "test1234").expect("serializes");

        // When encoded for the wire
        let payload: Value =
            serde_json::from_slice(&event.to_payload().expect("serializes")).expect("valid json");

        // Then the listener's field names are used
        assert_eq!(payload["@class"], ADMIN_EVENT_CLASS);
        assert_eq!(payload["resourceType"], "ORGANIZATION");
        assert_eq!(payload["operationType"], "CREATE");
        assert_eq!(payload["resourceTypeAsString"], "ORGANIZATION");
        assert_eq!(payload["authDetails"]["realmName"], "master");
        assert!(payload["authDetails"]["ipAddress"].is_string());
        assert!(payload["time"].is_i64());
        assert!(payload["resourcePath"]
            .as_str()
            .is_some_and(|path| path.starts_with("organizations/")));
    }

    #[test]
    fn representation_is_an_embedded_json_string() {
        let event =
            AdminEvent::organization_created("TestOrganization", "test1234").expect("serializes");

        let payload: Value =
            serde_json::from_slice(&event.to_payload().expect("serializes")).expect("valid json");
        let embedded: Value = serde_json::from_str(
            payload["representation"]
                .as_str()
                .expect("representation is a string"),
        )
        .expect("embedded json");

        assert_eq!(embedded["name"], "TestOrganization");
        assert_eq!(embedded["alias"], "test1234");
        assert_eq!(embedded["enabled"], true);
        assert_eq!(embedded["redirectUrl"], "");
        assert!(embedded["attributes"].is_object());
        assert_eq!(embedded["domains"][0]["verified"], false);
    }

    #[test]
    fn organization_decodes_back_from_the_event() {
        let event =
            AdminEvent::organization_created("TestOrganization", "test1234").expect("serializes");

        let organization = event.organization().expect("decodes");

        assert_eq!(organization.name, "TestOrganization");
        assert_eq!(organization.alias, "test1234");
    }
}
