use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use thiserror::Error;
use ulid::Ulid;

use crate::engine::EngineError;
use crate::model::ArchiveSide;
use crate::observability::AUTH_FAILURES_TOTAL;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Customer,
    Supervisor,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Customer => "customer",
            Role::Supervisor => "supervisor",
        }
    }
}

/// The connected user, taken from the startup `user` parameter
/// (`customer:<ULID>` or `supervisor:<ULID>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    pub role: Role,
    pub user_id: Ulid,
}

#[derive(Debug, Error, PartialEq)]
pub enum AuthError {
    #[error("user must look like <role>:<ULID>, got {0:?}")]
    MalformedUser(String),
    #[error("unknown role {0:?}; expected customer or supervisor")]
    UnknownRole(String),
    #[error("bad user id {0:?}")]
    BadUserId(String),
}

impl FromStr for Principal {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (role, id) = s
            .split_once(':')
            .ok_or_else(|| AuthError::MalformedUser(s.to_string()))?;
        let role = match role.to_lowercase().as_str() {
            "customer" => Role::Customer,
            "supervisor" => Role::Supervisor,
            other => return Err(AuthError::UnknownRole(other.to_string())),
        };
        let user_id = Ulid::from_string(id).map_err(|_| AuthError::BadUserId(id.to_string()))?;
        Ok(Self { role, user_id })
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.role.as_str(), self.user_id)
    }
}

impl Principal {
    pub fn require_supervisor(&self) -> Result<(), EngineError> {
        match self.role {
            Role::Supervisor => Ok(()),
            Role::Customer => Err(EngineError::Forbidden("supervisor role required")),
        }
    }

    /// Returns the customer id for customer-only operations.
    pub fn require_customer(&self) -> Result<Ulid, EngineError> {
        match self.role {
            Role::Customer => Ok(self.user_id),
            Role::Supervisor => Err(EngineError::Forbidden("customer role required")),
        }
    }

    pub fn archive_side(&self) -> ArchiveSide {
        match self.role {
            Role::Customer => ArchiveSide::Customer,
            Role::Supervisor => ArchiveSide::Supervisor,
        }
    }
}

/// One shared password per role.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub customer_password: String,
    pub supervisor_password: String,
}

impl Credentials {
    pub fn password_for(&self, role: Role) -> &str {
        match role {
            Role::Customer => &self.customer_password,
            Role::Supervisor => &self.supervisor_password,
        }
    }
}

#[derive(Debug)]
pub struct BayslotAuthSource {
    credentials: Credentials,
}

impl BayslotAuthSource {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl AuthSource for BayslotAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user = login.user().unwrap_or_default();
        let principal: Principal = user.parse().map_err(|e: AuthError| {
            metrics::counter!(AUTH_FAILURES_TOTAL).increment(1);
            tracing::warn!("rejected login for {user:?}: {e}");
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "28000".into(),
                e.to_string(),
            )))
        })?;
        let password = self.credentials.password_for(principal.role);
        Ok(Password::new(None, password.as_bytes().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";

    #[test]
    fn parse_principal() {
        let p: Principal = format!("customer:{ID}").parse().unwrap();
        assert_eq!(p.role, Role::Customer);
        assert_eq!(p.user_id.to_string(), ID);
        assert_eq!(p.to_string(), format!("customer:{ID}"));

        let p: Principal = format!("Supervisor:{ID}").parse().unwrap();
        assert_eq!(p.role, Role::Supervisor);
    }

    #[test]
    fn parse_principal_errors() {
        assert!(matches!("postgres".parse::<Principal>(), Err(AuthError::MalformedUser(_))));
        assert!(matches!(format!("admin:{ID}").parse::<Principal>(), Err(AuthError::UnknownRole(_))));
        assert!(matches!("customer:nope".parse::<Principal>(), Err(AuthError::BadUserId(_))));
    }

    #[test]
    fn role_gates() {
        let customer: Principal = format!("customer:{ID}").parse().unwrap();
        let supervisor: Principal = format!("supervisor:{ID}").parse().unwrap();

        assert_eq!(customer.require_customer().unwrap().to_string(), ID);
        assert_eq!(customer.require_supervisor().unwrap_err().reason(), "forbidden");
        assert!(supervisor.require_supervisor().is_ok());
        assert!(supervisor.require_customer().is_err());

        assert_eq!(customer.archive_side(), ArchiveSide::Customer);
        assert_eq!(supervisor.archive_side(), ArchiveSide::Supervisor);
    }

    #[test]
    fn password_per_role() {
        let creds = Credentials {
            customer_password: "c".into(),
            supervisor_password: "s".into(),
        };
        assert_eq!(creds.password_for(Role::Customer), "c");
        assert_eq!(creds.password_for(Role::Supervisor), "s");
    }
}
