use thiserror::Error;

/// Unified error type for the Drum router.
///
/// The router speaks an extended status range to its own clients:
/// scheduling and validation failures map into 900–999 so they can
/// never be confused with a status relayed from the upstream API.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RouterError {
    #[error("invalid x-token")]
    Auth,

    #[error("not found")]
    NotFound,

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Manager(String),

    #[error("forbidden route: {0}")]
    Routing(String),

    #[error("exceeded limits: {0}")]
    Limits(String),

    #[error("daily limits exceeded")]
    UserLimits,

    #[error("timeout")]
    Timeout,

    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("worker stopped")]
    Cancelled,

    #[error("store error: {0}")]
    Store(String),
}

impl RouterError {
    /// Map to the router's HTTP status code.
    pub fn status_code(&self) -> u16 {
        match self {
            RouterError::Auth => 901,
            RouterError::NotFound => 904,
            RouterError::Validation(_) => 900,
            RouterError::Manager(_) => 900,
            RouterError::Timeout => 905,
            RouterError::UserLimits => 929,
            RouterError::Routing(_) | RouterError::Limits(_) => 910,
            RouterError::Upstream(_) | RouterError::Cancelled => 910,
            RouterError::Store(_) => 900,
        }
    }

    /// JSON failure payload.
    pub fn to_detail_body(&self) -> Vec<u8> {
        serde_json::json!({ "detail": self.to_string() })
            .to_string()
            .into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(RouterError::Auth.status_code(), 901);
        assert_eq!(RouterError::NotFound.status_code(), 904);
        assert_eq!(RouterError::Validation("x".into()).status_code(), 900);
        assert_eq!(RouterError::Manager("x".into()).status_code(), 900);
        assert_eq!(RouterError::Timeout.status_code(), 905);
        assert_eq!(RouterError::UserLimits.status_code(), 929);
        assert_eq!(RouterError::Upstream("x".into()).status_code(), 910);
        assert_eq!(RouterError::Routing("/p".into()).status_code(), 910);
    }

    #[test]
    fn detail_body_is_valid_json() {
        let body = RouterError::Timeout.to_detail_body();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["detail"], "timeout");
    }

    #[test]
    fn display_messages() {
        assert_eq!(RouterError::Auth.to_string(), "invalid x-token");
        assert_eq!(
            RouterError::Manager("no workers available".into()).to_string(),
            "no workers available"
        );
        assert_eq!(
            RouterError::Routing("/api/x".into()).to_string(),
            "forbidden route: /api/x"
        );
        assert_eq!(RouterError::UserLimits.to_string(), "daily limits exceeded");
    }
}
