use clap::Parser;
use std::ffi::OsString;

/// Generic function to get an environment variable, parsing it to the desired type.
///
/// Unset, non-unicode and unparsable values all yield `None`.
pub fn get_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

/// Parses the process command line arguments.
pub fn parse_args<T: Parser>() -> Result<T, clap::Error> {
    T::try_parse()
}

/// Parses an explicit argument list (first item is the binary name).
pub fn parse_args_from<T, I, A>(args: I) -> Result<T, clap::Error>
where
    T: Parser,
    I: IntoIterator<Item = A>,
    A: Into<OsString> + Clone,
{
    T::try_parse_from(args)
}
