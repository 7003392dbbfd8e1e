use std::fmt::Display;

/// Errors surfaced by the runtime. One error aborts the remaining kernels of
/// the batch; allocations and writes committed before the failure are kept.
#[derive(Debug)]
pub enum SmeltError {
    /// Missing or unreadable config, unknown component, bad key value
    Config(Box<str>),
    /// A component (or extension object) could not be constructed
    ComponentLoad(Box<str>),
    /// Base allocation failed or the victim cache was exhausted
    OutOfMemory(Box<str>),
    /// Opcode applied to an operand type it does not implement
    TypeNotSupported(Box<str>),
    /// Unknown opcode, wrong arity, or opcode in an illegal position
    InstrNotSupported(Box<str>),
    /// Extension opcode with no registered implementation
    ExtmethodNotSupported(Box<str>),
    /// The native compiler rejected generated code
    Compile(Box<str>),
    /// A simplification or transformation asked for an inconsistent shape
    InvalidShape(Box<str>),
    /// Block-tree validation failure; indicates a planner bug
    InternalInvariant(Box<str>),
    /// Error from file operations
    Io(std::io::Error),
}

impl SmeltError {
    #[track_caller]
    pub(crate) fn invalid_shape(e: impl Into<String>) -> Self {
        let location = std::panic::Location::caller();
        use std::fmt::Write;
        let mut e: String = e.into();
        write!(e, ", {}:{}:{}", location.file(), location.line(), location.column()).unwrap();
        Self::InvalidShape(e.into())
    }

    #[track_caller]
    pub(crate) fn internal(e: impl Into<String>) -> Self {
        let location = std::panic::Location::caller();
        use std::fmt::Write;
        let mut e: String = e.into();
        write!(e, ", {}:{}:{}", location.file(), location.line(), location.column()).unwrap();
        Self::InternalInvariant(e.into())
    }

    /// Numeric code reported across the component boundary.
    /// 0 is reserved for success.
    #[must_use]
    pub const fn exit_code(&self) -> i64 {
        match self {
            SmeltError::TypeNotSupported(_) => 2,
            SmeltError::OutOfMemory(_) => 3,
            SmeltError::InstrNotSupported(_) => 4,
            SmeltError::ExtmethodNotSupported(_) => 5,
            _ => 1,
        }
    }
}

impl Display for SmeltError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SmeltError::Config(e) => f.write_fmt(format_args!("config: {e}")),
            SmeltError::ComponentLoad(e) => f.write_fmt(format_args!("component load: {e}")),
            SmeltError::OutOfMemory(e) => f.write_fmt(format_args!("out of memory: {e}")),
            SmeltError::TypeNotSupported(e) => f.write_fmt(format_args!("type not supported: {e}")),
            SmeltError::InstrNotSupported(e) => {
                f.write_fmt(format_args!("instruction not supported: {e}"))
            }
            SmeltError::ExtmethodNotSupported(e) => {
                f.write_fmt(format_args!("extension method not supported: {e}"))
            }
            SmeltError::Compile(e) => f.write_fmt(format_args!("compile: {e}")),
            SmeltError::InvalidShape(e) => f.write_fmt(format_args!("invalid shape: {e}")),
            SmeltError::InternalInvariant(e) => {
                f.write_fmt(format_args!("internal invariant: {e}"))
            }
            SmeltError::Io(e) => f.write_fmt(format_args!("io: {e}")),
        }
    }
}

impl std::error::Error for SmeltError {}

impl From<std::io::Error> for SmeltError {
    #[track_caller]
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}
