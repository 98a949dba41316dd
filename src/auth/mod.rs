//! Actor identity for workflow operations.
//!
//! Authentication happens upstream (gateway or session service); this module
//! only carries the already-authenticated caller and its role into the core,
//! where every transition function checks the role it needs.

use crate::errors::ServiceError;
use async_trait::async_trait;
use axum::{extract::FromRequestParts, http::request::Parts};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use strum::{Display, EnumString};
use uuid::Uuid;

/// Header carrying the authenticated caller's id
pub const ACTOR_ID_HEADER: &str = "x-actor-id";
/// Header carrying the authenticated caller's role
pub const ACTOR_ROLE_HEADER: &str = "x-actor-role";

/// The four independent roles that mutate order state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum ActorRole {
    Customer,
    Warehouse,
    DeliveryAgent,
    Admin,
}

/// Authenticated caller of a workflow operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: Uuid,
    pub role: ActorRole,
}

impl Actor {
    pub fn new(id: Uuid, role: ActorRole) -> Self {
        Self { id, role }
    }

    pub fn customer(id: Uuid) -> Self {
        Self::new(id, ActorRole::Customer)
    }

    pub fn warehouse(id: Uuid) -> Self {
        Self::new(id, ActorRole::Warehouse)
    }

    pub fn delivery_agent(id: Uuid) -> Self {
        Self::new(id, ActorRole::DeliveryAgent)
    }

    pub fn admin(id: Uuid) -> Self {
        Self::new(id, ActorRole::Admin)
    }

    /// Rejects with `Forbidden` unless the actor holds one of `roles`.
    pub fn require_role(&self, roles: &[ActorRole], action: &str) -> Result<(), ServiceError> {
        if roles.contains(&self.role) {
            Ok(())
        } else {
            Err(ServiceError::Forbidden(format!(
                "role {} may not {}",
                self.role, action
            )))
        }
    }

    /// Customers may only act on their own records; staff roles are checked
    /// separately through `require_role`.
    pub fn require_owner(&self, owner_id: Uuid, what: &str) -> Result<(), ServiceError> {
        if self.role == ActorRole::Customer && self.id != owner_id {
            return Err(ServiceError::Forbidden(format!(
                "{} belongs to another customer",
                what
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = Uuid::parse_str(header_value(parts, ACTOR_ID_HEADER)?)
            .map_err(|_| ServiceError::Unauthorized("malformed actor id".to_string()))?;
        let role = ActorRole::from_str(header_value(parts, ACTOR_ROLE_HEADER)?)
            .map_err(|_| ServiceError::Unauthorized("unknown actor role".to_string()))?;

        Ok(Actor { id, role })
    }
}

fn header_value<'a>(parts: &'a Parts, name: &str) -> Result<&'a str, ServiceError> {
    parts
        .headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ServiceError::Unauthorized(format!("missing {} header", name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use axum::http::Request;

    #[test]
    fn role_parses_case_insensitively() {
        assert_eq!(
            ActorRole::from_str("Delivery_Agent").unwrap(),
            ActorRole::DeliveryAgent
        );
        assert!(ActorRole::from_str("courier").is_err());
    }

    #[test]
    fn require_role_rejects_other_roles() {
        let actor = Actor::customer(Uuid::new_v4());
        assert!(actor.require_role(&[ActorRole::Customer], "cancel").is_ok());
        assert_matches!(
            actor.require_role(&[ActorRole::Warehouse], "pick items"),
            Err(ServiceError::Forbidden(_))
        );
    }

    #[test]
    fn require_owner_only_binds_customers() {
        let owner = Uuid::new_v4();
        assert!(Actor::customer(owner).require_owner(owner, "order").is_ok());
        assert_matches!(
            Actor::customer(Uuid::new_v4()).require_owner(owner, "order"),
            Err(ServiceError::Forbidden(_))
        );
        assert!(Actor::admin(Uuid::new_v4()).require_owner(owner, "order").is_ok());
    }

    #[tokio::test]
    async fn extractor_reads_actor_headers() {
        let id = Uuid::new_v4();
        let (mut parts, _) = Request::builder()
            .header(ACTOR_ID_HEADER, id.to_string())
            .header(ACTOR_ROLE_HEADER, "warehouse")
            .body(())
            .unwrap()
            .into_parts();

        let actor = Actor::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(actor, Actor::warehouse(id));
    }

    #[tokio::test]
    async fn extractor_rejects_missing_headers() {
        let (mut parts, _) = Request::builder().body(()).unwrap().into_parts();
        assert_matches!(
            Actor::from_request_parts(&mut parts, &()).await,
            Err(ServiceError::Unauthorized(_))
        );
    }
}
