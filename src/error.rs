use thiserror::Error;

/// crate specific Result type
pub type Result<T> = std::result::Result<T, Error>;

/// crate specific Error enum
#[derive(Error, Debug)]
pub enum Error {
    /// The source is not a COPC file: no LAS 1.4 header, or the COPC info
    /// VLR is missing from its mandatory position right after the header
    #[error("not a COPC file: {0}")]
    NotACopc(String),

    /// The container is damaged: truncated data, misaligned hierarchy page,
    /// invalid entry, or a compressed chunk that ends mid-stream
    #[error("corrupt COPC data: {0}")]
    Corrupt(String),

    /// The point data record format is not one this reader decompresses
    #[error("unsupported point format {format} with record length {record_length}")]
    UnsupportedPointFormat {
        /// Point data record format (without the compression bit)
        format: u8,
        /// Point data record length in bytes
        record_length: u16,
    },

    /// The requested voxel key has no node in the hierarchy
    #[error("no node for voxel key {0}")]
    NodeNotFound(crate::VoxelKey),

    /// The requested resolution is either negative, zero or not normal
    #[error("the requested resolution is not possible: {0}")]
    InvalidResolution(f64),

    /// [las::Error]
    #[error(transparent)]
    LasError(#[from] las::Error),

    /// [std::io::Error]
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Maps an end-of-stream error hit while decoding a chunk to [Error::Corrupt].
    ///
    /// The arithmetic decoder pulls renormalization bytes from a memory
    /// buffer; running out of bytes there means the chunk was truncated.
    pub(crate) fn from_decode_io(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::Corrupt("compressed chunk ended mid-stream".to_string())
        } else {
            Error::Io(err)
        }
    }
}
