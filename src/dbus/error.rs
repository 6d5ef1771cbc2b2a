// src/dbus/error.rs

//! Errors returned to bus clients

use crate::error::Error;
use zbus::fdo;

/// Named errors of the `org.debian.apt` interfaces
#[derive(Debug, zbus::DBusError)]
#[zbus(prefix = "org.debian.apt")]
pub enum AptdError {
    #[zbus(error)]
    ZBus(zbus::Error),
    TransactionRoleAlreadySet(String),
    TransactionAlreadyRunning(String),
    TransactionAlreadySimulating(String),
    TransactionFailed(String),
    TransactionCancelled(String),
    ForeignTransaction(String),
    InvalidMetaData(String),
    InvalidProxy(String),
    InvalidArguments(String),
    NotAuthorized(String),
    AuthorizationFailed(String),
}

impl From<Error> for AptdError {
    fn from(err: Error) -> Self {
        let message = err.to_string();
        match err {
            Error::RoleAlreadySet => AptdError::TransactionRoleAlreadySet(message),
            Error::AlreadyRunning => AptdError::TransactionAlreadyRunning(message),
            Error::AlreadySimulating => AptdError::TransactionAlreadySimulating(message),
            Error::ForeignTransaction => AptdError::ForeignTransaction(message),
            Error::InvalidMetaData(_) => AptdError::InvalidMetaData(message),
            Error::InvalidProxy(_) => AptdError::InvalidProxy(message),
            Error::InvalidProperty(_) | Error::InvalidArgument(_) => {
                AptdError::InvalidArguments(message)
            }
            Error::NotAuthorized(_) => AptdError::NotAuthorized(message),
            Error::AuthFailed(_) => AptdError::AuthorizationFailed(message),
            Error::Cancelled => AptdError::TransactionCancelled(message),
            Error::Failed { kind, details } => {
                AptdError::TransactionFailed(format!("{}: {}", kind, details))
            }
            Error::IoError(_) | Error::ConfigError(_) | Error::ParseError(_) | Error::DbusError(_) => {
                AptdError::TransactionFailed(message)
            }
        }
    }
}

impl From<fdo::Error> for AptdError {
    fn from(err: fdo::Error) -> Self {
        AptdError::ZBus(zbus::Error::FDO(Box::new(err)))
    }
}

/// Map an error for a property setter, which only speaks `fdo` errors
pub fn property_error(err: Error) -> fdo::Error {
    let message = err.to_string();
    match err {
        Error::ForeignTransaction | Error::NotAuthorized(_) | Error::AuthFailed(_) => {
            fdo::Error::AccessDenied(message)
        }
        Error::InvalidMetaData(_)
        | Error::InvalidProxy(_)
        | Error::InvalidProperty(_)
        | Error::InvalidArgument(_) => fdo::Error::InvalidArgs(message),
        _ => fdo::Error::Failed(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::ErrorKind;

    #[test]
    fn test_error_mapping() {
        assert!(matches!(
            AptdError::from(Error::ForeignTransaction),
            AptdError::ForeignTransaction(_)
        ));
        assert!(matches!(
            AptdError::from(Error::NotAuthorized("org.debian.apt.clean".into())),
            AptdError::NotAuthorized(ref m) if m.contains("org.debian.apt.clean")
        ));
        assert!(matches!(
            AptdError::from(Error::failed(ErrorKind::NoPackage, "no foo")),
            AptdError::TransactionFailed(ref m) if m.ends_with("no foo")
        ));
        assert!(matches!(
            property_error(Error::InvalidProxy("ftp://x".into())),
            fdo::Error::InvalidArgs(_)
        ));
        assert!(matches!(
            property_error(Error::ForeignTransaction),
            fdo::Error::AccessDenied(_)
        ));
    }
}
