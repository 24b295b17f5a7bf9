//! Reliable, ordered datagram delivery on top of UDP: a fixed sliding send
//! window, cumulative acknowledgements and bounded retransmission, driven by
//! a single-threaded readiness-and-timer dispatcher.

mod dispatch;
mod err;
mod packet;
mod sock;

pub use dispatch::{Dispatcher, IoCallback, IoHandle, TimerCallback, TimerHandle};
pub use err::Error;
pub use packet::{Kind, Packet, HEADER_LEN, MAX_PAYLOAD, VERSION};
pub use sock::{
    Event, EventHandler, Phase, RecvHandler, RudpSocket, MAX_RETRANS, MAX_SEQ, RUDP_TIMEOUT, WINDOW,
};
