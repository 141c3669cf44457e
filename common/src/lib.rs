mod error;
pub use error::*;

/// A source line number.
///
/// Line numbers are positive in line data. Arc endpoints may be negative:
/// `-N` in the *from* position is an entry into the code object starting at
/// line `N`, and `-N` in the *to* position is an exit from it.
pub type LineNo = i64;

/// An observed transition between two source lines during execution.
pub type Arc = (LineNo, LineNo);
