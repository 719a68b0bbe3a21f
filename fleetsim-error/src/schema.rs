use thiserror::Error;

/// Validation errors produced while parsing a capability model document.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("capability model is empty")]
    Empty,

    #[error("missing field `{field}` in {context}")]
    MissingField { field: String, context: String },

    #[error("interface `{id}` is referenced but not defined")]
    UnknownInterface { id: String },

    #[error("interface `{id}` extends itself")]
    ExtendsCycle { id: String },

    #[error("invalid `{field}`: {reason}")]
    InvalidType { field: String, reason: String },
}
