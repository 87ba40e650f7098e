use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced at the crate's seams: the frame codec, broker startup,
/// and the client API. Inside the broker core, failures are logged where
/// they happen and only booleans or `Option` sentinels cross layers.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("i/o error while {}: {}", doing, source))]
    Io {
        doing: String,
        source: std::io::Error,
    },

    #[snafu(display("frame of {} bytes exceeds the {} byte limit", size, limit))]
    FrameTooLarge { size: u64, limit: u64 },

    #[snafu(display("malformed record: {}", source))]
    Codec { source: bincode::Error },

    #[snafu(display("metadata store failure: {}", source))]
    Store { source: rusqlite::Error },

    #[snafu(display("request for unknown channel {}", cid))]
    UnknownChannel { cid: String },

    #[snafu(display("broker refused the request"))]
    Refused,

    #[snafu(display("connection to the broker is gone"))]
    ClientDropped,
}
