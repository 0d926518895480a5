use thiserror::Error;

#[derive(Debug, Error)]
#[error(transparent)]
pub struct Error(Box<ErrorKind>);

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        self.0.as_ref()
    }

    pub fn into_kind(self) -> ErrorKind {
        *self.0
    }

    pub fn configuration(message: impl Into<String>) -> Error {
        Error(
            ErrorKind::Configuration {
                message: message.into(),
            }
            .into(),
        )
    }

    pub fn duplicate_registration(addr: usize) -> Error {
        Error(ErrorKind::DuplicateRegistration { addr }.into())
    }

    pub fn unknown_pointer(addr: usize) -> Error {
        Error(ErrorKind::UnknownPointer { addr }.into())
    }

    pub fn alias_conflict(addr: usize, existing_offset: usize, requested_offset: usize) -> Error {
        Error(
            ErrorKind::AliasConflict {
                addr,
                existing_offset,
                requested_offset,
            }
            .into(),
        )
    }

    pub fn overlap(dst: usize, src: usize, bytes: usize) -> Error {
        Error(ErrorKind::Overlap { dst, src, bytes }.into())
    }

    pub fn allocation(space: impl Into<String>, bytes: usize) -> Error {
        Error(
            ErrorKind::AllocationFailure {
                space: space.into(),
                bytes,
                source: None,
            }
            .into(),
        )
    }

    pub fn allocation_io(space: impl Into<String>, bytes: usize, source: std::io::Error) -> Error {
        Error(
            ErrorKind::AllocationFailure {
                space: space.into(),
                bytes,
                source: Some(source),
            }
            .into(),
        )
    }

    pub fn illegal_access(addr: usize) -> Error {
        Error(ErrorKind::IllegalAccess { addr }.into())
    }

    pub fn invalid_arg(name: impl Into<String>, message: impl Into<String>) -> Error {
        Error(
            ErrorKind::InvalidArgument {
                name: name.into(),
                message: message.into(),
            }
            .into(),
        )
    }

    pub fn invalid_operation(name: impl Into<String>) -> Error {
        Error(ErrorKind::InvalidOperation { name: name.into() }.into())
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Error {
        Error(
            ErrorKind::Io {
                context: context.into(),
                source,
            }
            .into(),
        )
    }

    /// The offending address carried by pointer-related errors, if any.
    pub fn address(&self) -> Option<usize> {
        match self.kind() {
            ErrorKind::DuplicateRegistration { addr }
            | ErrorKind::UnknownPointer { addr }
            | ErrorKind::AliasConflict { addr, .. }
            | ErrorKind::IllegalAccess { addr } => Some(*addr),
            ErrorKind::Overlap { dst, .. } => Some(*dst),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ErrorKind {
    #[error("invalid memory configuration: {message}")]
    Configuration { message: String },

    #[error("address {addr:#x} is already registered")]
    DuplicateRegistration { addr: usize },

    #[error("address {addr:#x} is not registered")]
    UnknownPointer { addr: usize },

    #[error(
        "alias {addr:#x} already exists at offset {existing_offset} \
         (requested offset {requested_offset})"
    )]
    AliasConflict {
        addr: usize,
        existing_offset: usize,
        requested_offset: usize,
    },

    #[error("host copy of {bytes} bytes from {src:#x} to {dst:#x} overlaps")]
    Overlap { dst: usize, src: usize, bytes: usize },

    #[error("{space} failed to allocate {bytes} bytes")]
    AllocationFailure {
        space: String,
        bytes: usize,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("illegal access to protected memory at {addr:#x}")]
    IllegalAccess { addr: usize },

    #[error("invalid argument {name}: {message}")]
    InvalidArgument { name: String, message: String },

    #[error("invalid operation {name}")]
    InvalidOperation { name: String },

    #[error("IO error for '{context}': {source}")]
    Io {
        context: String,
        source: std::io::Error,
    },
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error(kind.into())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::io("", e)
    }
}
