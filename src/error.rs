use snafu::{
    AsBacktrace, AsErrorSource, Backtrace, Error, ErrorCompat, GenerateImplicitData, IntoError,
    NoneError, Snafu,
};

/// A validation failure caused by user-authored input rather than by the
/// cluster or the operator itself. Carries two messages: a developer message
/// for logs and a user message safe to surface in events and status
/// conditions.
#[derive(Debug, thiserror::Error)]
#[error("{user_message}")]
pub struct UserError {
    user_message: String,
    dev_message: String,
}

impl UserError {
    pub fn new(user_message: impl Into<String>, dev_message: impl Into<String>) -> Self {
        Self {
            user_message: user_message.into(),
            dev_message: dev_message.into(),
        }
    }

    /// A failure where the same wording serves both audiences.
    pub fn from_msg(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            dev_message: message.clone(),
            user_message: message,
        }
    }

    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    pub fn dev_message(&self) -> &str {
        &self.dev_message
    }
}

#[derive(Snafu, Debug)]
#[snafu(crate_root(crate::error))]
#[allow(clippy::enum_variant_names)]
pub enum ControllerError {
    #[snafu(display("SerializationError: {source}"))]
    SerializationError {
        #[snafu(source)]
        source: serde_json::Error,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },

    #[snafu(display("SerializationError: {source}"))]
    SerializationYamlError {
        #[snafu(source)]
        source: serde_yaml::Error,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },

    #[snafu(display("Kube Error: {source}"))]
    KubeError {
        #[snafu(source)]
        source: kube::Error,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },

    #[snafu(display("Lease Error: {source}"))]
    LeaseError {
        #[snafu(source)]
        source: kube_lease_manager::LeaseManagerError,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },

    #[snafu(display("I/O Error: {source}"))]
    IoError {
        #[snafu(source)]
        source: std::io::Error,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },

    #[snafu(display("Http Error: {source}"))]
    HttpError {
        #[snafu(source)]
        source: reqwest::Error,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },

    #[snafu(display("Http request error: {source}"))]
    HttpRequestError {
        #[snafu(source)]
        source: http::Error,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },

    #[snafu(display("Base64 decode error: {source}"))]
    Base64DecodeError {
        #[snafu(source)]
        source: base64::DecodeError,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },

    #[snafu(display("InvalidUserInput: {source}"))]
    UserInputError {
        #[snafu(source)]
        source: UserError,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },

    /// The upstream certificate endpoint answered 404. Distinct from a
    /// missing primary input and from a missing dependency object.
    #[snafu(display("certificate not found"))]
    CertificateNotFound {
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },

    #[snafu(display("active connections metric not found"))]
    MetricNotFound {
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },

    #[snafu(display("invalid certificate material: {reason}"))]
    InvalidCertificate {
        reason: String,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },

    #[snafu(display("object is missing required metadata: {what}"))]
    MissingObjectKey {
        what: &'static str,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },
}

impl From<serde_json::Error> for ControllerError {
    fn from(value: serde_json::Error) -> Self {
        SerializationSnafu.into_error(value)
    }
}

impl From<serde_yaml::Error> for ControllerError {
    fn from(value: serde_yaml::Error) -> Self {
        SerializationYamlSnafu.into_error(value)
    }
}

impl From<kube::Error> for ControllerError {
    fn from(value: kube::Error) -> Self {
        KubeSnafu.into_error(value)
    }
}

impl From<kube_lease_manager::LeaseManagerError> for ControllerError {
    fn from(value: kube_lease_manager::LeaseManagerError) -> Self {
        LeaseSnafu.into_error(value)
    }
}

impl From<std::io::Error> for ControllerError {
    fn from(value: std::io::Error) -> Self {
        IoSnafu.into_error(value)
    }
}

impl From<reqwest::Error> for ControllerError {
    fn from(value: reqwest::Error) -> Self {
        HttpSnafu.into_error(value)
    }
}

impl From<http::Error> for ControllerError {
    fn from(value: http::Error) -> Self {
        HttpRequestSnafu.into_error(value)
    }
}

impl From<base64::DecodeError> for ControllerError {
    fn from(value: base64::DecodeError) -> Self {
        Base64DecodeSnafu.into_error(value)
    }
}

impl From<UserError> for ControllerError {
    fn from(value: UserError) -> Self {
        UserInputSnafu.into_error(value)
    }
}

impl ControllerError {
    pub fn user(user_message: impl Into<String>, dev_message: impl Into<String>) -> Self {
        UserError::new(user_message, dev_message).into()
    }

    pub fn user_msg(message: impl Into<String>) -> Self {
        UserError::from_msg(message).into()
    }

    pub fn certificate_not_found() -> Self {
        CertificateNotFoundSnafu.build()
    }

    pub fn metric_not_found() -> Self {
        MetricNotFoundSnafu.build()
    }

    pub fn invalid_certificate(reason: impl Into<String>) -> Self {
        InvalidCertificateSnafu {
            reason: reason.into(),
        }
        .build()
    }

    pub fn missing_object_key(what: &'static str) -> Self {
        MissingObjectKeySnafu { what }.build()
    }

    /// The user-error payload, when this error originates from user input.
    pub fn as_user_error(&self) -> Option<&UserError> {
        match self {
            ControllerError::UserInputError { source, .. } => Some(source),
            _ => None,
        }
    }

    /// True for an orchestrator 404 on a read.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ControllerError::KubeError {
                source: kube::Error::Api(ae),
                ..
            } if ae.code == 404
        )
    }

    /// True for an optimistic-concurrency rejection on a write. Callers
    /// translate this into an immediate requeue instead of an error.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            ControllerError::KubeError {
                source: kube::Error::Api(ae),
                ..
            } if ae.code == 409
        )
    }
}

pub type Result<T, E = ControllerError> = std::result::Result<T, E>;

#[cfg(test)]
mod test {
    use super::*;

    fn api_error(code: u16) -> ControllerError {
        ControllerError::from(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".into(),
            message: String::new(),
            reason: String::new(),
            code,
        }))
    }

    #[test]
    fn user_error_keeps_both_messages() {
        let err = ControllerError::user("fix the keyvault URI", "parse failed at segment 2");
        let user = err.as_user_error().unwrap();
        assert_eq!(user.user_message(), "fix the keyvault URI");
        assert_eq!(user.dev_message(), "parse failed at segment 2");
    }

    #[test]
    fn kube_api_errors_are_classified() {
        assert!(api_error(404).is_not_found());
        assert!(!api_error(404).is_conflict());
        assert!(api_error(409).is_conflict());
        assert!(api_error(500).as_user_error().is_none());
        assert!(!api_error(500).is_not_found());
    }
}
