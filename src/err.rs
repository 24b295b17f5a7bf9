use crate::sock::Phase;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("poll error: {0}")]
    Poll(#[from] nix::Error),

    #[error("malformed datagram: {0}")]
    Malformed(&'static str),

    #[error("payload exceeds the maximum packet size")]
    PayloadTooLarge,

    #[error("operation not valid in phase {0:?}")]
    InvalidPhase(Phase),
}
