use std::fmt;
use std::path::PathBuf;
use thiserror::Error as TError;

/// An error that occurred while loading migrations, planning a patch, or
/// executing the grid. Mirrors the applied-so-far progress in `partial`
/// so callers can tell how much of a run made it through.
#[derive(Debug)]
pub struct Error {
    kind: Box<Kind>,
    partial: Option<PartialOutcome>,
}

impl Error {
    pub(crate) fn new(kind: Kind, partial: Option<PartialOutcome>) -> Error {
        Error {
            kind: Box::new(kind),
            partial,
        }
    }

    /// The partial progress made before this error surfaced, if any.
    pub fn partial(&self) -> Option<&PartialOutcome> {
        self.partial.as_ref()
    }

    /// The kind of error that occurred.
    pub fn kind(&self) -> &Kind {
        &self.kind
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.kind.source()
    }
}

/// Minimal record of what a run managed to do before failing, carried by
/// [`Error`] so operators don't need to re-derive it from logs.
#[derive(Debug, Clone, Default)]
pub struct PartialOutcome {
    pub succeeded_migrations: usize,
    pub errored_migrations: usize,
}

/// Enum listing the possible failure modes of the engine. Each variant
/// corresponds to one of the error kinds named in the design.
#[derive(Debug, TError)]
pub enum Kind {
    /// A migration file name does not match the expected pattern.
    #[error("migration file name must be in the format <timestamp>.<title>.<prefix>.(up|dn).sql, got {0}")]
    InvalidName(String),
    /// A `.up.sql` file has no matching `.dn.sql` (or vice-versa).
    #[error("migration {0} is missing its matching {1} file")]
    MissingPair(String, &'static str),
    /// A `-- $name=value` directive uses a name the engine does not recognize.
    #[error("unknown migration directive ${0} in {1}")]
    UnknownDirective(String, PathBuf),
    /// A directive value could not be parsed as the expected type.
    #[error("invalid value for directive ${0} in {1}: {2}")]
    InvalidDirectiveValue(String, PathBuf, String),
    /// The non-transactional index wrap validator rejected a file.
    #[error("invalid CONCURRENTLY index migration {0}: {1}")]
    WrapValidation(PathBuf, String),
    /// Two incomparable schema-name prefixes both match the same schema.
    #[error("schema {0} matches two incomparable prefixes: {1:?} and {2:?}")]
    PrefixAmbiguity(String, String, String),
    /// The persisted version list diverges from the on-disk entry order.
    #[error("timeline violation on schema {schema}: database has {persisted} applied but disk expects {proposed} at that position")]
    TimelineViolation {
        schema: String,
        persisted: String,
        proposed: String,
    },
    /// The persisted version list has versions beyond what's on disk.
    #[error("schema {schema} has applied version {version} which is missing from the on-disk registry")]
    MissingOnDisk { schema: String, version: String },
    /// An undo target is not the single latest applied version.
    #[error("cannot undo {target} on schema {schema}: it is not the latest applied version")]
    UndoNotLatest { schema: String, target: String },
    /// Could not connect, or connection dropped, while probing/creating a database.
    #[error("connectivity error against {0}: {1}")]
    Connectivity(String, #[source] Box<dyn std::error::Error + Sync + Send>),
    /// A migration script exited non-zero.
    #[error("migration {version} failed on {dest}: {output}")]
    MigrationFailure {
        dest: String,
        version: String,
        output: String,
    },
    /// Every Dest failed to report a digest.
    #[error("could not read a digest from any of {0} destinations")]
    DigestBlackout(usize),
    /// `after.sql` failed; the run fails even though the chains themselves succeeded.
    #[error("after.sql failed on {0}: {1}")]
    PostFailure(String, String),
    /// Generic I/O failure reading the migration directory.
    #[error("invalid migrations path {0}: {1}")]
    InvalidMigrationPath(PathBuf, std::io::Error),
    /// Generic I/O failure reading one migration file.
    #[error("invalid migration file {0}: {1}")]
    InvalidMigrationFile(PathBuf, std::io::Error),
}

/// Helper trait for wrapping a foreign error as a [`Kind::Connectivity`] and
/// attaching whatever partial progress has been made so far.
pub trait WrapEngineError<T, E> {
    fn engine_err(self, target: &str, partial: Option<PartialOutcome>) -> Result<T, Error>;
}

impl<T, E> WrapEngineError<T, E> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn engine_err(self, target: &str, partial: Option<PartialOutcome>) -> Result<T, Error> {
        match self {
            Ok(v) => Ok(v),
            Err(err) => Err(Error {
                kind: Box::new(Kind::Connectivity(target.into(), Box::new(err))),
                partial,
            }),
        }
    }
}
