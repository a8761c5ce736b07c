//! Error handling for the crate.

use std::borrow::Cow;
use std::error::Error as StdError;
use std::fmt::Debug;
use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::io;


mod private {
    use super::Error;

    pub trait Sealed {}

    impl<T> Sealed for Option<T> {}
    impl<T, E> Sealed for Result<T, E> {}
    impl Sealed for Error {}
    impl Sealed for &'static str {}
    impl Sealed for String {}
}


/// A trait for types that can be converted into a `Cow<'static, str>`.
///
/// The trait is sealed and implemented for `&'static str` and
/// `String`.
pub trait IntoCowStr: private::Sealed {
    /// Perform the conversion.
    fn into_cow_str(self) -> Cow<'static, str>;
}

impl IntoCowStr for &'static str {
    #[inline]
    fn into_cow_str(self) -> Cow<'static, str> {
        Cow::Borrowed(self)
    }
}

impl IntoCowStr for String {
    #[inline]
    fn into_cow_str(self) -> Cow<'static, str> {
        Cow::Owned(self)
    }
}


/// An enumeration of error kinds.
///
/// Most variants mirror [`io::ErrorKind`]; `BuildIdMismatch` is
/// specific to the handling of separate debug information files.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An entity was not found, often a file.
    NotFound,
    /// The operation lacked the necessary privileges to complete.
    PermissionDenied,
    /// An entity already exists, often a file.
    AlreadyExists,
    /// The operation needs to block to complete, but the blocking
    /// operation was requested to not occur.
    WouldBlock,
    /// A parameter was incorrect.
    InvalidInput,
    /// Data not valid for the operation were encountered.
    InvalidData,
    /// The I/O operation's timeout expired, causing it to be canceled.
    TimedOut,
    /// An error returned when an operation could not be completed
    /// because a call to `write` returned `Ok(0)`.
    WriteZero,
    /// This operation is unsupported on this platform.
    Unsupported,
    /// An error returned when an operation could not be completed
    /// because an "end of file" was reached prematurely.
    UnexpectedEof,
    /// An operation could not be completed, because it failed
    /// to allocate enough memory.
    OutOfMemory,
    /// A separate debug information file was found, but its build ID
    /// does not match the one of the binary it was looked up for.
    BuildIdMismatch,
    /// A custom error that does not fall under any other error kind.
    Other,
}

impl ErrorKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "entity not found",
            Self::PermissionDenied => "permission denied",
            Self::AlreadyExists => "entity already exists",
            Self::WouldBlock => "operation would block",
            Self::InvalidInput => "invalid input parameter",
            Self::InvalidData => "invalid data",
            Self::TimedOut => "timed out",
            Self::WriteZero => "write zero",
            Self::Unsupported => "unsupported",
            Self::UnexpectedEof => "unexpected end of file",
            Self::OutOfMemory => "out of memory",
            Self::BuildIdMismatch => "build ID mismatch",
            Self::Other => "other error",
        }
    }
}

impl From<io::ErrorKind> for ErrorKind {
    fn from(other: io::ErrorKind) -> Self {
        match other {
            io::ErrorKind::NotFound => Self::NotFound,
            io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            io::ErrorKind::AlreadyExists => Self::AlreadyExists,
            io::ErrorKind::WouldBlock => Self::WouldBlock,
            io::ErrorKind::InvalidInput => Self::InvalidInput,
            io::ErrorKind::InvalidData => Self::InvalidData,
            io::ErrorKind::TimedOut => Self::TimedOut,
            io::ErrorKind::WriteZero => Self::WriteZero,
            io::ErrorKind::Unsupported => Self::Unsupported,
            io::ErrorKind::UnexpectedEof => Self::UnexpectedEof,
            io::ErrorKind::OutOfMemory => Self::OutOfMemory,
            _ => Self::Other,
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}


#[derive(Debug)]
enum ErrorImpl {
    Io(io::Error),
    Custom {
        kind: ErrorKind,
        message: Cow<'static, str>,
    },
    Context {
        context: Cow<'static, str>,
        source: Box<ErrorImpl>,
    },
}

impl ErrorImpl {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(error) => ErrorKind::from(error.kind()),
            Self::Custom { kind, .. } => *kind,
            Self::Context { source, .. } => source.kind(),
        }
    }
}

impl Display for ErrorImpl {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Io(error) => Display::fmt(error, f),
            Self::Custom { message, .. } => f.write_str(message),
            Self::Context { context, source } => {
                if f.alternate() {
                    write!(f, "{context}: {source:#}")
                } else {
                    f.write_str(context)
                }
            }
        }
    }
}

impl StdError for ErrorImpl {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Io(error) => error.source(),
            Self::Custom { .. } => None,
            Self::Context { source, .. } => Some(source.as_ref()),
        }
    }
}


/// The error type used by the library.
///
/// Errors form a chain of context layers on top of a root cause. The
/// regular `Display` representation only shows the outermost layer,
/// while the alternate one (`{:#}`) prints the entire chain.
pub struct Error {
    error: Box<ErrorImpl>,
}

impl Error {
    fn with_kind<M>(kind: ErrorKind, message: M) -> Self
    where
        M: IntoCowStr,
    {
        Self {
            error: Box::new(ErrorImpl::Custom {
                kind,
                message: message.into_cow_str(),
            }),
        }
    }

    /// Create an [`Error`] of kind [`ErrorKind::NotFound`].
    pub fn with_not_found<M>(message: M) -> Self
    where
        M: IntoCowStr,
    {
        Self::with_kind(ErrorKind::NotFound, message)
    }

    /// Create an [`Error`] of kind [`ErrorKind::InvalidInput`].
    pub fn with_invalid_input<M>(message: M) -> Self
    where
        M: IntoCowStr,
    {
        Self::with_kind(ErrorKind::InvalidInput, message)
    }

    /// Create an [`Error`] of kind [`ErrorKind::InvalidData`].
    pub fn with_invalid_data<M>(message: M) -> Self
    where
        M: IntoCowStr,
    {
        Self::with_kind(ErrorKind::InvalidData, message)
    }

    /// Create an [`Error`] of kind [`ErrorKind::UnexpectedEof`].
    pub fn with_unexpected_eof<M>(message: M) -> Self
    where
        M: IntoCowStr,
    {
        Self::with_kind(ErrorKind::UnexpectedEof, message)
    }

    /// Create an [`Error`] of kind [`ErrorKind::Unsupported`].
    pub fn with_unsupported<M>(message: M) -> Self
    where
        M: IntoCowStr,
    {
        Self::with_kind(ErrorKind::Unsupported, message)
    }

    /// Create an [`Error`] of kind [`ErrorKind::BuildIdMismatch`].
    pub fn with_build_id_mismatch<M>(message: M) -> Self
    where
        M: IntoCowStr,
    {
        Self::with_kind(ErrorKind::BuildIdMismatch, message)
    }

    /// Retrieve the kind of the root cause of this error.
    #[inline]
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }

    fn layer_context(self, context: Cow<'static, str>) -> Self {
        Self {
            error: Box::new(ErrorImpl::Context {
                context,
                source: self.error,
            }),
        }
    }
}

impl Debug for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        if f.alternate() {
            Debug::fmt(&self.error, f)
        } else {
            write!(f, "Error: {:#} ({:?})", self.error, self.kind())
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        Display::fmt(&self.error, f)
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.error.source()
    }
}

impl From<io::Error> for Error {
    fn from(other: io::Error) -> Self {
        Self {
            error: Box::new(ErrorImpl::Io(other)),
        }
    }
}

impl From<io::ErrorKind> for Error {
    fn from(other: io::ErrorKind) -> Self {
        Self::from(io::Error::from(other))
    }
}


/// A trait providing ergonomic chaining capabilities to [`Error`].
pub trait ErrorExt: private::Sealed {
    /// The output type produced by [`context`](Self::context) and
    /// [`with_context`](Self::with_context).
    type Output;

    /// Add context to this error.
    fn context<C>(self, context: C) -> Self::Output
    where
        C: IntoCowStr;

    /// Add context to this error, using a closure for lazy evaluation.
    fn with_context<C, F>(self, f: F) -> Self::Output
    where
        C: IntoCowStr,
        F: FnOnce() -> C;
}

impl ErrorExt for Error {
    type Output = Error;

    fn context<C>(self, context: C) -> Self::Output
    where
        C: IntoCowStr,
    {
        self.layer_context(context.into_cow_str())
    }

    fn with_context<C, F>(self, f: F) -> Self::Output
    where
        C: IntoCowStr,
        F: FnOnce() -> C,
    {
        self.layer_context(f().into_cow_str())
    }
}

impl<T, E> ErrorExt for Result<T, E>
where
    E: Into<Error>,
{
    type Output = Result<T, Error>;

    fn context<C>(self, context: C) -> Self::Output
    where
        C: IntoCowStr,
    {
        self.map_err(|err| Into::<Error>::into(err).context(context))
    }

    fn with_context<C, F>(self, f: F) -> Self::Output
    where
        C: IntoCowStr,
        F: FnOnce() -> C,
    {
        self.map_err(|err| Into::<Error>::into(err).with_context(f))
    }
}


/// A trait providing conversion shortcuts for creating `Error`
/// instances from `Option`s.
pub trait IntoError<T>: private::Sealed
where
    Self: Sized,
{
    /// Convert into a `Result`, creating an error of the provided kind
    /// with the message produced by `f` on `None`.
    fn ok_or_error<C, F>(self, kind: ErrorKind, f: F) -> Result<T, Error>
    where
        C: IntoCowStr,
        F: FnOnce() -> C;

    /// Unwrap `self` into an `Ok` or an [`Error`] of the
    /// [`ErrorKind::InvalidInput`] kind.
    #[inline]
    fn ok_or_invalid_input<C, F>(self, f: F) -> Result<T, Error>
    where
        C: IntoCowStr,
        F: FnOnce() -> C,
    {
        self.ok_or_error(ErrorKind::InvalidInput, f)
    }

    /// Unwrap `self` into an `Ok` or an [`Error`] of the
    /// [`ErrorKind::InvalidData`] kind.
    #[inline]
    fn ok_or_invalid_data<C, F>(self, f: F) -> Result<T, Error>
    where
        C: IntoCowStr,
        F: FnOnce() -> C,
    {
        self.ok_or_error(ErrorKind::InvalidData, f)
    }

    /// Unwrap `self` into an `Ok` or an [`Error`] of the
    /// [`ErrorKind::UnexpectedEof`] kind.
    #[inline]
    fn ok_or_unexpected_eof<C, F>(self, f: F) -> Result<T, Error>
    where
        C: IntoCowStr,
        F: FnOnce() -> C,
    {
        self.ok_or_error(ErrorKind::UnexpectedEof, f)
    }
}

impl<T> IntoError<T> for Option<T> {
    #[inline]
    fn ok_or_error<C, F>(self, kind: ErrorKind, f: F) -> Result<T, Error>
    where
        C: IntoCowStr,
        F: FnOnce() -> C,
    {
        self.ok_or_else(|| Error::with_kind(kind, f()))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    use std::mem::size_of;

    use test_log::test;


    /// Check that our `Error` type stays pointer sized.
    #[test]
    fn error_size() {
        assert_eq!(size_of::<Error>(), size_of::<usize>());
    }

    /// Check that context layers are printed as expected.
    #[test]
    fn error_chain_formatting() {
        let err = io::Error::new(io::ErrorKind::InvalidData, "some invalid data");
        let err = Error::from(err);
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        assert_eq!(format!("{err}"), "some invalid data");

        let err = err.context("inner context");
        let err = err.with_context(|| format!("outer context for {}", 42));
        assert_eq!(format!("{err}"), "outer context for 42");
        assert_eq!(
            format!("{err:#}"),
            "outer context for 42: inner context: some invalid data"
        );
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        assert!(err.source().is_some());
        assert_ne!(format!("{err:?}"), "");
        assert_ne!(format!("{err:#?}"), "");
    }

    /// Check that `Option` conversion helpers report the expected kind.
    #[test]
    fn option_conversion() {
        let err = None::<()>.ok_or_invalid_data(|| "no data").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        assert_eq!(err.to_string(), "no data");

        let err = None::<()>.ok_or_unexpected_eof(|| "eof").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);

        let value = Some(1337).ok_or_invalid_input(|| "unused").unwrap();
        assert_eq!(value, 1337);
    }

    /// Make sure that the build ID mismatch kind is reported as such.
    #[test]
    fn build_id_mismatch_kind() {
        let err = Error::with_build_id_mismatch("abc != def").context("debug file rejected");
        assert_eq!(err.kind(), ErrorKind::BuildIdMismatch);
        assert_eq!(err.kind().to_string(), "build ID mismatch");
    }
}
