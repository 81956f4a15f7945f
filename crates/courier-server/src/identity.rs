//! Resolving who a socket connection belongs to.

use axum::http::HeaderMap;
use courier_core::validate_identifier;
use std::collections::HashMap;
use thiserror::Error;

/// The room and member name of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Target room.
    pub room: String,
    /// Member name within the room.
    pub username: String,
}

/// Why a connection could not be identified.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// A required parameter is absent.
    #[error("missing {0}")]
    Missing(&'static str),

    /// A parameter is not a valid identifier.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Offending parameter.
        field: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },
}

/// Resolves the identity of an upgrade request.
pub trait IdentityResolver: Send + Sync + 'static {
    /// Identify the request from its query parameters and headers.
    ///
    /// # Errors
    ///
    /// Returns an error if the request carries no usable identity.
    fn resolve(
        &self,
        query: &HashMap<String, String>,
        headers: &HeaderMap,
    ) -> Result<Identity, IdentityError>;
}

/// Reads `room` (or `roomID`) and `username` from the query string.
#[derive(Debug, Default, Clone, Copy)]
pub struct QueryResolver;

impl QueryResolver {
    fn field<'a>(
        query: &'a HashMap<String, String>,
        names: &[&str],
        field: &'static str,
    ) -> Result<&'a str, IdentityError> {
        let value = names
            .iter()
            .find_map(|name| query.get(*name))
            .map(String::as_str)
            .ok_or(IdentityError::Missing(field))?;
        validate_identifier(value).map_err(|reason| IdentityError::Invalid { field, reason })?;
        Ok(value)
    }
}

impl IdentityResolver for QueryResolver {
    fn resolve(
        &self,
        query: &HashMap<String, String>,
        _headers: &HeaderMap,
    ) -> Result<Identity, IdentityError> {
        let room = Self::field(query, &["room", "roomID"], "room")?;
        let username = Self::field(query, &["username"], "username")?;
        Ok(Identity {
            room: room.to_string(),
            username: username.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_resolves_room_and_username() {
        let identity = QueryResolver
            .resolve(&query(&[("room", "r1"), ("username", "alice")]), &HeaderMap::new())
            .unwrap();
        assert_eq!(
            identity,
            Identity {
                room: "r1".into(),
                username: "alice".into()
            }
        );
    }

    #[test]
    fn test_accepts_room_id_alias() {
        let identity = QueryResolver
            .resolve(&query(&[("roomID", "r2"), ("username", "bob")]), &HeaderMap::new())
            .unwrap();
        assert_eq!(identity.room, "r2");
    }

    #[test]
    fn test_rejects_missing_or_empty() {
        assert!(matches!(
            QueryResolver.resolve(&query(&[("username", "bob")]), &HeaderMap::new()),
            Err(IdentityError::Missing("room"))
        ));
        assert!(matches!(
            QueryResolver.resolve(&query(&[("room", "r1"), ("username", "")]), &HeaderMap::new()),
            Err(IdentityError::Invalid { field: "username", .. })
        ));
    }
}
