use std::path::PathBuf;

use snafu::Snafu;

/// The public error type for this library.
///
/// The kernel itself never fails: bad indices no-op, bad values clamp, a
/// broken script silences its own mode. Errors exist only at the host
/// boundary, for song persistence and script loading.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("could not read song file {}: {}", path.display(), source))]
    SongRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("could not write song file {}: {}", path.display(), source))]
    SongWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("song file {} is malformed: {}", path.display(), source))]
    SongParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[snafu(display("song file {} has version {found}, expected {expected}", path.display()))]
    SongVersion {
        path: PathBuf,
        found: String,
        expected: &'static str,
    },

    #[snafu(display("script {} failed to load: {message}", path.display()))]
    ScriptLoad { path: PathBuf, message: String },
}

/// The public result type for this library.
pub type Result<T> = std::result::Result<T, Error>;
