use thiserror::Error;

/// Engine error taxonomy. Every variant is recovered at the command boundary
/// and rendered as a message for the requester.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("email domain not allowed: {0}")]
    EmailDomain(String),
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },
    #[error("{kind} already exists: {name}")]
    DuplicateName { kind: &'static str, name: String },
    #[error("identity already verified")]
    AlreadyVerified { email: String, username: String },
    #[error("identity not verified")]
    NotVerified,
    #[error("repository not in entitlement: {0}")]
    NotEntitled(String),
    #[error("identity is block-listed")]
    Blocked,
    #[error("administrative command from non-admin {0}")]
    NotAdmin(i64),
    #[error("upstream {service} error: {detail}")]
    Upstream {
        service: &'static str,
        detail: String,
    },
    #[error("storage error: {0:#}")]
    Storage(#[source] anyhow::Error),
}

/// Coarse error class, used for logging and reply selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    InvalidInput,
    NotFound,
    Conflict,
    Unauthorized,
    Upstream,
    Internal,
}

impl Error {
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidInput(_) | Self::EmailDomain(_) | Self::NotVerified => {
                ErrorClass::InvalidInput
            }
            Self::NotFound { .. } => ErrorClass::NotFound,
            Self::DuplicateName { .. } | Self::AlreadyVerified { .. } => ErrorClass::Conflict,
            Self::NotEntitled(_) | Self::Blocked | Self::NotAdmin(_) => ErrorClass::Unauthorized,
            Self::Upstream { .. } => ErrorClass::Upstream,
            Self::Storage(_) => ErrorClass::Internal,
        }
    }

    pub(crate) fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub(crate) fn duplicate(kind: &'static str, name: impl Into<String>) -> Self {
        Self::DuplicateName {
            kind,
            name: name.into(),
        }
    }

    pub(crate) fn upstream(service: &'static str, detail: impl Into<String>) -> Self {
        Self::Upstream {
            service,
            detail: detail.into(),
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Storage(err)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_follow_taxonomy() {
        assert_eq!(Error::NotVerified.class(), ErrorClass::InvalidInput);
        assert_eq!(
            Error::not_found("level", "intro").class(),
            ErrorClass::NotFound
        );
        assert_eq!(
            Error::duplicate("repository", "lab1").class(),
            ErrorClass::Conflict
        );
        assert_eq!(Error::NotAdmin(7).class(), ErrorClass::Unauthorized);
        assert_eq!(
            Error::upstream("github", "502 Bad Gateway").class(),
            ErrorClass::Upstream
        );
        assert_eq!(
            Error::from(anyhow::anyhow!("connection reset")).class(),
            ErrorClass::Internal
        );
    }

    #[test]
    fn display_carries_detail() {
        let err = Error::upstream("github", "403 Forbidden");
        assert_eq!(err.to_string(), "upstream github error: 403 Forbidden");
        let err = Error::not_found("level", "Basic");
        assert_eq!(err.to_string(), "level not found: Basic");
    }
}
