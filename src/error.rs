//! Error type for the bootloader core as a whole.

/// Failure of a core operation.
///
/// Flash driver errors are collapsed to a static description; the driver's
/// own error value is logged at the call site and is of no further use to the
/// boot path (a flash fault mid-swap is fatal either way).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The flash driver reported a fault, or refused an access.
    Flash(&'static str),
    /// Header, TLV, hash, signature or rollback-counter rejection.
    BadImage,
    /// A declared length would read past the end of its container.
    NoPayload,
    /// The trailer or status area contents are not a state this
    /// implementation can resume from.
    BadState(&'static str),
    /// An operation was refused because an upload is in progress.
    Busy,
    /// Malformed frame or CBOR structure on the recovery path.
    Decode(&'static str),
    /// The request names a feature this build does not carry.
    Unsupported(&'static str),
}

pub type Result<T> = core::result::Result<T, Error>;
