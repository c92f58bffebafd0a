//! Validated string types that enforce invariants at construction time

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Validation errors for string and numeric configuration types
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ValidationError {
    #[error("hostname cannot be empty or whitespace")]
    EmptyHostName,

    #[error("datasource name cannot be empty or whitespace")]
    EmptyDatasourceName,

    #[error("datasource name cannot contain '{0}'")]
    InvalidDatasourceName(char),

    #[error("port must be between 1 and 65535, got {0}")]
    InvalidPort(String),
}

/// Macro to generate validated string newtypes.
///
/// Each type gets a validating `new()`, `as_str()`, `AsRef<str>`, `Deref`,
/// `Display`, `TryFrom<String>` and serde impls that re-run validation.
macro_rules! validated_string {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident(String) {
            validation: |$s_param:ident| $validation:expr,
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        #[serde(transparent)]
        $vis struct $name(String);

        impl $name {
            #[doc = concat!("Create a new ", stringify!($name), " after validation")]
            pub fn new($s_param: String) -> Result<Self, ValidationError> {
                let validate = || $validation;
                validate()?;
                Ok(Self($s_param))
            }

            #[doc = concat!("Get the ", stringify!($name), " as a string slice")]
            #[must_use]
            #[inline]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            #[inline]
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;

            #[inline]
            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl TryFrom<String> for $name {
            type Error = ValidationError;

            fn try_from($s_param: String) -> Result<Self, Self::Error> {
                Self::new($s_param)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::new(s).map_err(serde::de::Error::custom)
            }
        }
    };
}

validated_string! {
    /// A hostname that cannot be empty or whitespace-only
    ///
    /// # Examples
    /// ```
    /// use ojp_proxy::types::HostName;
    ///
    /// let host = HostName::new("db-proxy-1.internal".to_string()).unwrap();
    /// assert_eq!(host.as_str(), "db-proxy-1.internal");
    /// assert!(HostName::new("   ".to_string()).is_err());
    /// ```
    #[doc(alias = "host")]
    pub struct HostName(String) {
        validation: |s| {
            if s.trim().is_empty() {
                Err(ValidationError::EmptyHostName)
            } else {
                Ok(())
            }
        },
    }
}

validated_string! {
    /// Logical datasource name selecting a target configuration on a node
    ///
    /// Names appear inside endpoint URLs, so the URL delimiters are rejected.
    pub struct DatasourceName(String) {
        validation: |s| {
            if s.trim().is_empty() {
                return Err(ValidationError::EmptyDatasourceName);
            }
            match s.chars().find(|c| matches!(c, '(' | ')' | '[' | ']' | ',' | ':')) {
                Some(c) => Err(ValidationError::InvalidDatasourceName(c)),
                None => Ok(()),
            }
        },
    }
}

impl DatasourceName {
    /// Name used when an endpoint does not specify one
    pub const DEFAULT: &'static str = "default";
}

impl Default for DatasourceName {
    fn default() -> Self {
        Self(Self::DEFAULT.to_string())
    }
}
