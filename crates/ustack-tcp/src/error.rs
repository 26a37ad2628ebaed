use thiserror::Error;
use ustack_packet::PacketError;

use crate::Tuple;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TcpError {
    #[error("connection handler is already set")]
    HandlerAlreadySet,

    #[error("connection is handled by NAT, cannot set a connection handler")]
    OwnedByNat,

    #[error("NAT is already set")]
    NatAlreadySet,

    #[error("connection is handled by the TCP stack, cannot set NAT")]
    OwnedByStack,

    #[error("no such connection {0}")]
    NoSuchConnection(Tuple),

    #[error("connection {0} has not been accepted")]
    NotAccepted(Tuple),

    #[error("cannot close connection {tuple} in state {state}")]
    InvalidState {
        tuple: Tuple,
        state: crate::TcpState,
    },

    #[error("address pool exhausted")]
    PoolExhausted,

    #[error(transparent)]
    Packet(#[from] PacketError),
}
