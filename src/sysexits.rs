//! legacy exit status codes for system programs.
//! reference: [SYSEXITS](https://man.freebsd.org/cgi/man.cgi?query=sysexits&apropos=0&sektion=0&manpath=FreeBSD+11.2-stable&arch=default&format=html)

use crate::Error;

/// value: 64 <br>
/// The command was used incorrectly, e.g., with the wrong number of arguments, a bad flag, a bad syntax in a parameter, etc.
pub const EX_USAGE: i32 = 64;

/// value: 66 <br>
/// An input file (not a system file) did not exist or was not readable.
pub const EX_NOINPUT: i32 = 66;

/// value: 70 <br>
/// An internal software error has been detected. Used for failed backup and restore runs.
pub const EX_SOFTWARE: i32 = 70;

/// value: 78 <br>
/// Something was found in an unconfigured or misconfigured state.
pub const EX_CONFIG: i32 = 78;

/// Exit status for a failure reported once the configuration file was read.
pub fn exit_code(err: &Error) -> i32 {
    match err {
        Error::Config(_) | Error::Schedule(_) => EX_CONFIG,
        _ => EX_SOFTWARE,
    }
}
