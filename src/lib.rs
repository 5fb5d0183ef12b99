//! A code-generation backend that translates a typed stack machine into
//! 32-bit x86 machine code, one function at a time. The entry point is
//! [`compiler::Compiler`].

pub mod buffer;

pub mod error;

pub mod types;

pub mod x86;

pub mod alloc;

pub mod value;

pub mod emitter;

pub mod select;

pub mod compiler;
