//! Error types for rowgraph operations.

use std::fmt;

/// The primary error type for all rowgraph operations.
#[derive(Debug)]
pub enum Error {
    /// Dataset / query execution errors
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// Schema and association configuration errors
    Config(ConfigError),
    /// Association resolution and mutation errors
    Association(AssociationError),
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Table or column not found
    NotFound,
    /// The dataset cannot evaluate this query shape
    Unsupported,
    /// Other backend error
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct ConfigError {
    pub kind: ConfigErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigErrorKind {
    /// Record type is not registered
    UnknownType,
    /// Association name is not declared on the owning type
    UnknownAssociation,
    /// Owner and target key lists differ in length
    KeyArity,
    /// A required key column was not declared
    MissingKey,
    /// A through-join association without join-table keys
    MissingJoinTable,
    /// An association with the same name is already declared on the type
    DuplicateAssociation,
    /// The association cannot be used this way (e.g. graphed)
    Unsupported,
}

#[derive(Debug)]
pub struct AssociationError {
    pub kind: AssociationErrorKind,
    pub owner: String,
    pub association: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationErrorKind {
    /// A before-hook vetoed the mutation
    HookFailed,
    /// Mutation attempted on a read-only association
    ReadOnly,
    /// Polymorphic discriminator names no registered type
    UnknownPolymorphicType,
    /// Target record does not fit the association
    InvalidTarget,
}

impl Error {
    /// Build a configuration error.
    pub fn config(kind: ConfigErrorKind, message: impl Into<String>) -> Self {
        Error::Config(ConfigError {
            kind,
            message: message.into(),
            source: None,
        })
    }

    /// Build an association error.
    pub fn association(
        kind: AssociationErrorKind,
        owner: impl Into<String>,
        association: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::Association(AssociationError {
            kind,
            owner: owner.into(),
            association: association.into(),
            message: message.into(),
        })
    }

    /// Is this a configuration error (undeclared association, key arity, ...)?
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::Config(_))
    }

    /// Did a before-hook veto the operation?
    pub fn is_hook_failure(&self) -> bool {
        matches!(
            self,
            Error::Association(AssociationError {
                kind: AssociationErrorKind::HookFailed,
                ..
            })
        )
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Query(e) => write!(f, "Query error: {}", e.message),
            Error::Type(e) => {
                if let Some(col) = &e.column {
                    write!(
                        f,
                        "Type error in column '{}': expected {}, found {}",
                        col, e.expected, e.actual
                    )
                } else {
                    write!(f, "Type error: expected {}, found {}", e.expected, e.actual)
                }
            }
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Association(e) => write!(
                f,
                "Association error on {}.{}: {}",
                e.owner, e.association, e.message
            ),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for AssociationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}: {}", self.owner, self.association, self.message)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<AssociationError> for Error {
    fn from(err: AssociationError) -> Self {
        Error::Association(err)
    }
}

/// Result type alias for rowgraph operations.
pub type Result<T> = std::result::Result<T, Error>;
