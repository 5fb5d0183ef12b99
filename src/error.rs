use std::fmt;

/**
 * The ways code generation can fail. None of these is recoverable within a
 * compilation unit: callers propagate the error and abandon the function
 * being compiled. Every variant indicates a contract violation by the layer
 * above or a feature this backend deliberately does not implement, never a
 * runtime condition.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodegenError {
    /// The operand types do not satisfy the operation's contract.
    TypeMismatch(&'static str),
    /// The operand kind combination has no legal lowering.
    IllegalOperand(&'static str),
    /// No physical register is free and the operation needs one.
    RegistersExhausted,
    /// The builder API was driven in an illegal order.
    Misuse(&'static str),
    /// A feature this backend deliberately omits (floats, 64-bit refs, ...).
    Unsupported(&'static str),
}

impl fmt::Display for CodegenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodegenError::TypeMismatch(msg) =>
                write!(f, "type mismatch: {}", msg),
            CodegenError::IllegalOperand(msg) =>
                write!(f, "illegal operand combination: {}", msg),
            CodegenError::RegistersExhausted =>
                write!(f, "no register available; need to spill"),
            CodegenError::Misuse(msg) =>
                write!(f, "compiler misuse: {}", msg),
            CodegenError::Unsupported(msg) =>
                write!(f, "not supported: {}", msg),
        }
    }
}

impl std::error::Error for CodegenError {}

pub type Result<T> = std::result::Result<T, CodegenError>;

//-----------------------------------------------------------------------------
