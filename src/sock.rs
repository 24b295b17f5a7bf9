use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use rand::Rng;

use crate::dispatch::{Dispatcher, IoHandle, TimerHandle};
use crate::packet::{Kind, Packet, HEADER_LEN, MAX_PAYLOAD};
use crate::Error;

/// Packets transmitted but not yet acknowledged, at most.
pub const WINDOW: u32 = 3;
/// Fixed retransmission timeout; there is no RTT estimation.
pub const RUDP_TIMEOUT: Duration = Duration::from_millis(200);
/// Retransmissions attempted per packet before giving up.
pub const MAX_RETRANS: u32 = 3;
/// Sequence numbers are drawn from [0, MAX_SEQ).
pub const MAX_SEQ: u32 = 2_147_483_646;

/*
                        +------+
           open() ----> | INIT | <--------------------------.
                        +------+                            |
              send_to() /      \ rcv SYN                    |
              snd SYN  /        \ snd ACK                   | rcv FIN
                      v          v                          | snd ACK
                 +------------------+                       |
                 |       DATA       |-----------------------'
                 +------------------+
                        | close()
                        v
                 +-------------+  rcv ACK of all DATA  +--------------+
                 |   CLOSING   |---------------------->| WAIT_FIN_ACK |
                 +-------------+        snd FIN        +--------------+
                                                             | rcv ACK of FIN
                                                             v
                                                          +-----+
                                                          | FIN |
                                                          +-----+
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Data,
    Closing,
    WaitFinAck,
    Fin,
}

/// Connection lifecycle notifications delivered through the event handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// An orderly shutdown completed.
    Closed,
    /// A packet ran out of retransmissions without being acknowledged.
    Timeout,
}

pub type RecvHandler =
    Box<dyn FnMut(&mut Dispatcher, &RudpSocket, SocketAddr, &[u8]) -> Result<(), Error>>;
pub type EventHandler =
    Box<dyn FnMut(&mut Dispatcher, &RudpSocket, Event, SocketAddr) -> Result<(), Error>>;

/// One packet queued for (re)transmission. An entry owns at most one live
/// timer; dropping the entry without cancelling it leaves a stale timer that
/// fires as a no-op.
struct Outstanding {
    kind: Kind,
    seq: u32,
    wire: bytes::Bytes,
    to: SocketAddr,
    retrans: u32,
    timer: Option<TimerHandle>,
}

struct Inner {
    sock: Option<UdpSocket>,
    phase: Phase,
    /// Fixed on the first send; replies always go to the datagram's source.
    peer: Option<SocketAddr>,
    /// Receive side: the next sequence number accepted from the peer.
    rx_next: u32,
    /// Send side: the next sequence number the peer is expected to
    /// acknowledge, i.e. the base of the send window.
    ack_base: u32,
    /// Sequence of the SYN this endpoint sent, kept to recognise its ACK.
    syn_seq: u32,
    /// Sequence assigned to the most recently queued DATA or FIN.
    tx_next: u32,
    window_free: u32,
    /// Latched once the transmit probe reaches the FIN.
    reached_end: bool,
    queue: VecDeque<Outstanding>,
    on_recv: Option<RecvHandler>,
    on_event: Option<EventHandler>,
    io: Option<IoHandle>,
}

/// Upcalls collected while the endpoint state is borrowed; they are
/// delivered right afterwards, still inside the same dispatch.
enum Pending {
    Recv(SocketAddr, Vec<u8>),
    Event(Event, SocketAddr),
}

/// A reliable datagram endpoint: one UDP socket plus the connection state
/// driving SYN/DATA/ACK/FIN exchanges against a single remote peer. All
/// protocol work happens from dispatcher callbacks; handles are cheap to
/// clone and share one endpoint.
#[derive(Clone)]
pub struct RudpSocket {
    inner: Rc<RefCell<Inner>>,
}

impl RudpSocket {
    /// Create an endpoint bound to `port` (a random port out of
    /// [4711, 64710] when `port` is zero) and register it with the
    /// dispatcher. The registration keeps the endpoint alive until it tears
    /// itself down.
    pub fn open(dispatcher: &mut Dispatcher, port: u16) -> Result<RudpSocket, Error> {
        let port = if port == 0 {
            rand::thread_rng().gen_range(4711u16..=64710)
        } else {
            port
        };

        let sock = UdpSocket::bind(("0.0.0.0", port))?;
        sock.set_nonblocking(true)?;
        let fd = sock.as_raw_fd();
        debug!("open: fd {fd} bound to port {port}");

        let inner = Rc::new(RefCell::new(Inner {
            sock: Some(sock),
            phase: Phase::Init,
            peer: None,
            rx_next: 0,
            ack_base: 0,
            syn_seq: 0,
            tx_next: 0,
            window_free: WINDOW,
            reached_end: false,
            queue: VecDeque::new(),
            on_recv: None,
            on_event: None,
            io: None,
        }));

        let cb = {
            let inner = Rc::clone(&inner);
            Rc::new(move |dispatcher: &mut Dispatcher, _: RawFd| on_readable(dispatcher, &inner))
        };
        let io = dispatcher.register_readable(fd, cb, "rudp recv");
        inner.borrow_mut().io = Some(io);

        Ok(RudpSocket { inner })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        let st = self.inner.borrow();

        match &st.sock {
            Some(sock) => Ok(sock.local_addr()?),
            None => Err(Error::InvalidPhase(st.phase)),
        }
    }

    pub fn set_recv_handler(&self, handler: RecvHandler) {
        self.inner.borrow_mut().on_recv = Some(handler);
    }

    pub fn set_event_handler(&self, handler: EventHandler) {
        self.inner.borrow_mut().on_event = Some(handler);
    }

    /// Queue `data` for reliable delivery to `to`. The first send on a fresh
    /// endpoint fixes the peer and transmits a SYN carrying a random initial
    /// sequence number; the DATA itself goes out as acknowledgements open
    /// the send window.
    pub fn send_to(
        &self,
        dispatcher: &mut Dispatcher,
        data: &[u8],
        to: SocketAddr,
    ) -> Result<(), Error> {
        if data.len() > MAX_PAYLOAD {
            return Err(Error::PayloadTooLarge);
        }

        let mut st = self.inner.borrow_mut();
        let st = &mut *st;

        match st.phase {
            Phase::Closing | Phase::WaitFinAck | Phase::Fin => {
                return Err(Error::InvalidPhase(st.phase));
            }
            Phase::Init => {
                let iss = rand::thread_rng().gen_range(0..MAX_SEQ);
                let wire = Packet::syn(iss).encode();

                st.transmit(&wire, to)?;
                debug!("connecting to {to}, initial seq {iss}");

                st.peer = Some(to);
                st.syn_seq = iss;
                st.ack_base = iss;
                st.tx_next = iss;
                st.phase = Phase::Data;

                let timer = arm_retransmit(dispatcher, &self.inner, iss);
                st.queue.push_back(Outstanding {
                    kind: Kind::Syn,
                    seq: iss,
                    wire,
                    to,
                    retrans: 0,
                    timer: Some(timer),
                });
            }
            Phase::Data => {}
        }

        // The peer was fixed on the first send; later destinations are
        // ignored, as is a destination passed to a receive-side endpoint.
        let to = *st.peer.get_or_insert(to);

        st.tx_next += 1;
        let seq = st.tx_next;
        st.queue.push_back(Outstanding {
            kind: Kind::Data,
            seq,
            wire: Packet::data(seq, data).encode(),
            to,
            retrans: 0,
            timer: None,
        });
        trace!("queued DATA {seq} ({} bytes) for {to}", data.len());

        Ok(())
    }

    /// Queue an orderly shutdown: the FIN takes the next sequence number and
    /// the endpoint stops accepting new sends. Nothing is transmitted here;
    /// the FIN goes out once everything ahead of it has been acknowledged.
    pub fn close(&self) -> Result<(), Error> {
        let mut st = self.inner.borrow_mut();

        let to = match (st.phase, st.peer) {
            (Phase::Init | Phase::Data, Some(to)) => to,
            _ => return Err(Error::InvalidPhase(st.phase)),
        };

        st.tx_next += 1;
        let seq = st.tx_next;
        st.queue.push_back(Outstanding {
            kind: Kind::Fin,
            seq,
            wire: Packet::fin(seq).encode(),
            to,
            retrans: 0,
            timer: None,
        });
        st.phase = Phase::Closing;
        debug!("close: FIN {seq} queued for {to}");

        Ok(())
    }
}

impl Inner {
    fn sock(&self) -> Result<&UdpSocket, Error> {
        self.sock.as_ref().ok_or(Error::InvalidPhase(self.phase))
    }

    fn transmit(&self, wire: &[u8], to: SocketAddr) -> Result<(), Error> {
        self.sock()?.send_to(wire, to)?;

        Ok(())
    }

    fn send_ack(&self, to: SocketAddr) -> Result<(), Error> {
        trace!("snd ACK {} to {to}", self.rx_next);
        self.transmit(&Packet::ack(self.rx_next).encode(), to)
    }

    fn head_is_syn(&self) -> bool {
        self.queue.front().map_or(false, |e| e.kind == Kind::Syn)
    }

    /// Drop the packet whose acknowledgement was awaited, cancelling its
    /// retransmit timer with it.
    fn pop_head(&mut self, dispatcher: &mut Dispatcher) {
        if let Some(entry) = self.queue.pop_front() {
            if let Some(timer) = entry.timer {
                dispatcher.cancel_timer(timer);
            }
        }
    }

    /// Cumulative acknowledgement: `ack` names the next sequence number the
    /// peer expects, so everything below it leaves the queue and the window
    /// opens accordingly.
    fn process_ack(&mut self, dispatcher: &mut Dispatcher, ack: u32) {
        if self.head_is_syn() {
            if ack == self.syn_seq + 1 {
                self.pop_head(dispatcher);
                self.ack_base += 1;
                self.window_free = WINDOW;
                debug!("connection established, seq {}", self.ack_base);
            }

            return;
        }

        let outstanding = WINDOW - self.window_free;

        if ack > self.ack_base && ack <= self.ack_base + outstanding {
            while ack > self.ack_base {
                self.pop_head(dispatcher);
                self.ack_base += 1;
                self.window_free += 1;
            }
        }
    }

    /// Return a receive-side endpoint to its initial state, ready to accept
    /// a fresh connection.
    fn reset(&mut self, dispatcher: &mut Dispatcher) {
        while let Some(entry) = self.queue.pop_front() {
            if let Some(timer) = entry.timer {
                dispatcher.cancel_timer(timer);
            }
        }

        self.phase = Phase::Init;
        self.peer = None;
        self.rx_next = 0;
        self.ack_base = 0;
        self.syn_seq = 0;
        self.tx_next = 0;
        self.window_free = WINDOW;
        self.reached_end = false;
    }

    /// Release everything the endpoint holds: pending timers, the readable
    /// registration and the socket. The handle stays valid but every
    /// further operation reports the FIN phase.
    fn teardown(&mut self, dispatcher: &mut Dispatcher) {
        while let Some(entry) = self.queue.pop_front() {
            if let Some(timer) = entry.timer {
                dispatcher.cancel_timer(timer);
            }
        }

        if let Some(io) = self.io.take() {
            dispatcher.unregister_readable(io);
        }

        self.sock = None;
    }
}

fn on_readable(dispatcher: &mut Dispatcher, ep: &Rc<RefCell<Inner>>) -> Result<(), Error> {
    let mut buf = [0u8; HEADER_LEN + MAX_PAYLOAD];

    let pending = {
        let mut st = ep.borrow_mut();
        let st = &mut *st;

        let (len, from) = match st.sock()?.recv_from(&mut buf) {
            Ok(got) => got,
            // A spurious wakeup; nothing to do.
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        match Packet::decode(&buf[..len]) {
            Ok(packet) => handle_packet(st, ep, dispatcher, packet, from)?,
            Err(err) => {
                warn!("dropping datagram from {from}: {err}");
                return Ok(());
            }
        }
    };

    for item in pending {
        deliver(dispatcher, ep, item)?;
    }

    Ok(())
}

fn handle_packet(
    st: &mut Inner,
    ep: &Rc<RefCell<Inner>>,
    dispatcher: &mut Dispatcher,
    packet: Packet,
    from: SocketAddr,
) -> Result<Vec<Pending>, Error> {
    trace!("rcv {:?} {} from {from} in {:?}", packet.kind, packet.seq, st.phase);

    match st.phase {
        Phase::Init => on_init(st, packet, from),
        Phase::Data => on_established(st, ep, dispatcher, packet, from),
        Phase::Closing => on_closing(st, ep, dispatcher, packet, from),
        Phase::WaitFinAck => on_wait_fin_ack(st, dispatcher, packet, from),
        // A finished endpoint ignores everything.
        Phase::Fin => Ok(Vec::new()),
    }
}

/// A fresh endpoint only answers a SYN, which opens the connection.
fn on_init(st: &mut Inner, packet: Packet, from: SocketAddr) -> Result<Vec<Pending>, Error> {
    if packet.kind != Kind::Syn {
        return Ok(Vec::new());
    }

    st.phase = Phase::Data;
    st.rx_next = packet.seq + 1;
    debug!("accepted connection from {from}, next seq {}", st.rx_next);
    st.send_ack(from)?;

    Ok(Vec::new())
}

fn on_established(
    st: &mut Inner,
    ep: &Rc<RefCell<Inner>>,
    dispatcher: &mut Dispatcher,
    packet: Packet,
    from: SocketAddr,
) -> Result<Vec<Pending>, Error> {
    let mut pending = Vec::new();

    match packet.kind {
        Kind::Data => {
            if packet.seq == st.rx_next {
                st.rx_next += 1;
                pending.push(Pending::Recv(from, packet.payload.to_vec()));
            }

            // Acknowledge duplicates too, so a lost ACK heals itself.
            st.send_ack(from)?;
        }
        Kind::Ack => {
            st.process_ack(dispatcher, packet.seq);
            pump(st, ep, dispatcher)?;
        }
        Kind::Fin => {
            if packet.seq == st.rx_next {
                st.rx_next += 1;
                st.send_ack(from)?;
                pending.push(Pending::Event(Event::Closed, from));
                st.reset(dispatcher);
            } else {
                st.send_ack(from)?;
            }
        }
        Kind::Syn => {}
    }

    Ok(pending)
}

fn on_closing(
    st: &mut Inner,
    ep: &Rc<RefCell<Inner>>,
    dispatcher: &mut Dispatcher,
    packet: Packet,
    from: SocketAddr,
) -> Result<Vec<Pending>, Error> {
    if packet.kind != Kind::Ack {
        return Ok(Vec::new());
    }

    st.process_ack(dispatcher, packet.seq);
    pump(st, ep, dispatcher)?;

    // Every packet ahead of the FIN is acknowledged: the FIN itself goes on
    // the wire and the endpoint waits for its acknowledgement.
    if st.reached_end && st.ack_base == st.tx_next {
        if let Some(at) = st.queue.iter().position(|e| e.kind == Kind::Fin) {
            let to = st.queue[at].to;
            let seq = st.queue[at].seq;

            st.transmit(&st.queue[at].wire, to)?;
            st.queue[at].timer = Some(arm_retransmit(dispatcher, ep, seq));
            st.window_free -= 1;
            st.phase = Phase::WaitFinAck;
            debug!("snd FIN {seq} to {to}");
        }
    }

    Ok(Vec::new())
}

fn on_wait_fin_ack(
    st: &mut Inner,
    dispatcher: &mut Dispatcher,
    packet: Packet,
    from: SocketAddr,
) -> Result<Vec<Pending>, Error> {
    if packet.kind != Kind::Ack {
        return Ok(Vec::new());
    }

    // Only the acknowledgement of the FIN at the head of the queue finishes
    // the shutdown; everything else is stale.
    if !fin_acked(st, packet.seq) {
        return Ok(Vec::new());
    }

    st.pop_head(dispatcher);
    st.phase = Phase::Fin;
    st.teardown(dispatcher);
    debug!("connection to {from} closed");

    Ok(vec![Pending::Event(Event::Closed, from)])
}

fn fin_acked(st: &Inner, ack: u32) -> bool {
    st.queue.front().map_or(false, |e| ack == e.seq + 1)
}

/// Window-driven transmission: put queued packets on the wire while there
/// are free slots. The SYN only ever goes out eagerly and through its own
/// timer, and the FIN stays queued until the rest of the queue drains.
fn pump(st: &mut Inner, ep: &Rc<RefCell<Inner>>, dispatcher: &mut Dispatcher) -> Result<(), Error> {
    while st.window_free > 0 {
        let probe = st.ack_base + (WINDOW - st.window_free);

        let Some(at) = st.queue.iter().position(|e| e.seq == probe) else {
            return Ok(());
        };

        match st.queue[at].kind {
            Kind::Syn => return Ok(()),
            Kind::Fin => {
                st.reached_end = true;
                return Ok(());
            }
            _ => {}
        }

        let to = st.queue[at].to;
        st.transmit(&st.queue[at].wire, to)?;
        st.queue[at].timer = Some(arm_retransmit(dispatcher, ep, probe));
        st.window_free -= 1;
        trace!("snd DATA {probe} to {to}, window {}", st.window_free);
    }

    Ok(())
}

fn arm_retransmit(
    dispatcher: &mut Dispatcher,
    ep: &Rc<RefCell<Inner>>,
    seq: u32,
) -> TimerHandle {
    let ep = Rc::downgrade(ep);

    dispatcher.schedule_timer(
        Instant::now() + RUDP_TIMEOUT,
        Box::new(move |dispatcher| on_retransmit(dispatcher, &ep, seq)),
        "rudp retransmit",
    )
}

fn on_retransmit(
    dispatcher: &mut Dispatcher,
    ep: &Weak<RefCell<Inner>>,
    seq: u32,
) -> Result<(), Error> {
    // The endpoint or the queue entry may be gone; a stale timer is a no-op.
    let Some(ep) = ep.upgrade() else { return Ok(()) };

    let exhausted = {
        let mut st = ep.borrow_mut();
        let st = &mut *st;

        let Some(at) = st.queue.iter().position(|e| e.seq == seq) else {
            return Ok(());
        };

        if st.queue[at].retrans < MAX_RETRANS {
            let to = st.queue[at].to;

            st.transmit(&st.queue[at].wire, to)?;
            st.queue[at].retrans += 1;
            st.queue[at].timer = Some(arm_retransmit(dispatcher, &ep, seq));
            debug!("retransmit {seq} (attempt {})", st.queue[at].retrans);

            None
        } else {
            // Give up: the packet stays queued with no timer, and the
            // application decides what happens to the endpoint.
            st.queue[at].timer = None;
            warn!("{seq} unacknowledged after {MAX_RETRANS} retransmissions");

            Some(st.queue[at].to)
        }
    };

    match exhausted {
        Some(peer) => deliver(dispatcher, &ep, Pending::Event(Event::Timeout, peer)),
        None => Ok(()),
    }
}

/// Hand an upcall to the application with the endpoint borrow released, so
/// the handler can call back into `send_to`/`close`. The handler slot is
/// taken for the duration of the call; a handler replacing itself wins over
/// the put-back.
fn deliver(
    dispatcher: &mut Dispatcher,
    ep: &Rc<RefCell<Inner>>,
    item: Pending,
) -> Result<(), Error> {
    let sock = RudpSocket {
        inner: Rc::clone(ep),
    };

    match item {
        Pending::Recv(from, payload) => {
            let Some(mut cb) = ep.borrow_mut().on_recv.take() else {
                return Ok(());
            };

            let res = cb(dispatcher, &sock, from, &payload);

            let mut st = ep.borrow_mut();
            if st.on_recv.is_none() {
                st.on_recv = Some(cb);
            }

            res
        }
        Pending::Event(event, from) => {
            let Some(mut cb) = ep.borrow_mut().on_event.take() else {
                return Ok(());
            };

            let res = cb(dispatcher, &sock, event, from);

            let mut st = ep.borrow_mut();
            if st.on_event.is_none() {
                st.on_event = Some(cb);
            }

            res
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::UdpSocket as Plain;

    use super::*;

    fn open_endpoint(disp: &mut Dispatcher) -> RudpSocket {
        // Random ports can collide with something already bound.
        for _ in 0..16 {
            if let Ok(sock) = RudpSocket::open(disp, 0) {
                return sock;
            }
        }

        panic!("could not bind a local port");
    }

    fn scripted_peer() -> (Plain, SocketAddr) {
        let peer = Plain::bind("127.0.0.1:0").unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let addr = peer.local_addr().unwrap();

        (peer, addr)
    }

    fn recv_packet(peer: &Plain) -> (Packet, SocketAddr) {
        let mut buf = [0u8; HEADER_LEN + MAX_PAYLOAD];
        let (n, from) = peer.recv_from(&mut buf).unwrap();

        (Packet::decode(&buf[..n]).unwrap(), from)
    }

    fn send_ack(peer: &Plain, seq: u32, to: SocketAddr) {
        peer.send_to(&Packet::ack(seq).encode(), to).unwrap();
    }

    #[test]
    fn handshake_then_data_then_open_window() {
        let mut disp = Dispatcher::new();
        let sock = open_endpoint(&mut disp);
        let (peer, peer_addr) = scripted_peer();

        sock.send_to(&mut disp, b"AB", peer_addr).unwrap();

        // The SYN goes out eagerly; the DATA waits for the handshake.
        let (syn, ep_addr) = recv_packet(&peer);
        assert_eq!(syn.kind, Kind::Syn);
        {
            let st = sock.inner.borrow();
            assert_eq!(st.phase, Phase::Data);
            assert_eq!(st.queue.len(), 2);
            assert_eq!(st.window_free, WINDOW);
            assert!(st.queue[1].timer.is_none());
        }

        send_ack(&peer, syn.seq + 1, ep_addr);
        disp.step().unwrap();

        let (data, _) = recv_packet(&peer);
        assert_eq!(data.kind, Kind::Data);
        assert_eq!(data.seq, syn.seq + 1);
        assert_eq!(&data.payload[..], b"AB");

        send_ack(&peer, syn.seq + 2, ep_addr);
        disp.step().unwrap();

        let st = sock.inner.borrow();
        assert!(st.queue.is_empty());
        assert_eq!(st.window_free, WINDOW);
        assert_eq!(disp.timer_count(), 0);
    }

    #[test]
    fn window_limits_in_flight_packets() {
        let mut disp = Dispatcher::new();
        let sock = open_endpoint(&mut disp);
        let (peer, peer_addr) = scripted_peer();

        for msg in [b"p0".as_slice(), b"p1", b"p2", b"p3", b"p4"] {
            sock.send_to(&mut disp, msg, peer_addr).unwrap();
        }

        let (syn, ep_addr) = recv_packet(&peer);
        send_ack(&peer, syn.seq + 1, ep_addr);
        disp.step().unwrap();

        // Exactly WINDOW packets in flight, the rest queued untransmitted.
        for offset in 1..=WINDOW {
            let (data, _) = recv_packet(&peer);
            assert_eq!(data.kind, Kind::Data);
            assert_eq!(data.seq, syn.seq + offset);
        }
        {
            let st = sock.inner.borrow();
            assert_eq!(st.window_free, 0);
            assert_eq!(st.queue.len(), 5);
            assert!(st.queue.iter().skip(WINDOW as usize).all(|e| e.timer.is_none()));
            assert_eq!(disp.timer_count(), WINDOW as usize);
        }

        // One ACK advances the window by exactly one slot.
        send_ack(&peer, syn.seq + 2, ep_addr);
        disp.step().unwrap();

        let (data, _) = recv_packet(&peer);
        assert_eq!(data.seq, syn.seq + WINDOW + 1);
        let st = sock.inner.borrow();
        assert_eq!(st.window_free, 0);
        assert_eq!(st.queue.len(), 4);
        assert_eq!(st.ack_base, syn.seq + 2);
    }

    #[test]
    fn cumulative_ack_drops_covered_packets_and_timers() {
        let mut disp = Dispatcher::new();
        let sock = open_endpoint(&mut disp);
        let (peer, peer_addr) = scripted_peer();

        for msg in [b"a".as_slice(), b"b", b"c"] {
            sock.send_to(&mut disp, msg, peer_addr).unwrap();
        }

        let (syn, ep_addr) = recv_packet(&peer);
        send_ack(&peer, syn.seq + 1, ep_addr);
        disp.step().unwrap();

        for _ in 0..WINDOW {
            recv_packet(&peer);
        }

        // One ACK covering the first two packets at once.
        send_ack(&peer, syn.seq + 3, ep_addr);
        disp.step().unwrap();

        {
            let st = sock.inner.borrow();
            assert_eq!(st.queue.len(), 1);
            assert_eq!(st.ack_base, syn.seq + 3);
            assert_eq!(st.window_free, 2);
            assert_eq!(disp.timer_count(), 1);
        }

        // A duplicate of the same ACK changes nothing.
        send_ack(&peer, syn.seq + 3, ep_addr);
        disp.step().unwrap();

        {
            let st = sock.inner.borrow();
            assert_eq!(st.queue.len(), 1);
            assert_eq!(st.window_free, 2);
            assert_eq!(disp.timer_count(), 1);
        }

        send_ack(&peer, syn.seq + 4, ep_addr);
        disp.step().unwrap();

        let st = sock.inner.borrow();
        assert!(st.queue.is_empty());
        assert_eq!(st.window_free, WINDOW);
        assert_eq!(disp.timer_count(), 0);
    }

    #[test]
    fn receiver_delivers_in_order_and_reacks_duplicates() {
        let mut disp = Dispatcher::new();
        let sock = open_endpoint(&mut disp);
        let ep_addr: SocketAddr = format!("127.0.0.1:{}", sock.local_addr().unwrap().port())
            .parse()
            .unwrap();
        let (peer, _) = scripted_peer();

        let got = Rc::new(RefCell::new(Vec::new()));
        {
            let got = Rc::clone(&got);
            sock.set_recv_handler(Box::new(move |_, _, _, payload| {
                got.borrow_mut().push(payload.to_vec());
                Ok(())
            }));
        }

        peer.send_to(&Packet::syn(100).encode(), ep_addr).unwrap();
        disp.step().unwrap();

        let (ack, _) = recv_packet(&peer);
        assert_eq!(ack.kind, Kind::Ack);
        assert_eq!(ack.seq, 101);

        peer.send_to(&Packet::data(101, b"X").encode(), ep_addr).unwrap();
        disp.step().unwrap();

        let (ack, _) = recv_packet(&peer);
        assert_eq!(ack.seq, 102);
        assert_eq!(*got.borrow(), vec![b"X".to_vec()]);

        // The same DATA again: one delivery total, but a fresh ACK.
        peer.send_to(&Packet::data(101, b"X").encode(), ep_addr).unwrap();
        disp.step().unwrap();

        let (ack, _) = recv_packet(&peer);
        assert_eq!(ack.seq, 102);
        assert_eq!(got.borrow().len(), 1);

        // A future sequence number is not buffered, only re-acknowledged.
        peer.send_to(&Packet::data(103, b"Z").encode(), ep_addr).unwrap();
        disp.step().unwrap();

        let (ack, _) = recv_packet(&peer);
        assert_eq!(ack.seq, 102);
        assert_eq!(got.borrow().len(), 1);
    }

    #[test]
    fn receiver_resets_on_fin_and_accepts_a_new_connection() {
        let mut disp = Dispatcher::new();
        let sock = open_endpoint(&mut disp);
        let ep_addr: SocketAddr = format!("127.0.0.1:{}", sock.local_addr().unwrap().port())
            .parse()
            .unwrap();
        let (peer, _) = scripted_peer();

        let events = Rc::new(RefCell::new(Vec::new()));
        {
            let events = Rc::clone(&events);
            sock.set_event_handler(Box::new(move |_, _, event, _| {
                events.borrow_mut().push(event);
                Ok(())
            }));
        }

        peer.send_to(&Packet::syn(100).encode(), ep_addr).unwrap();
        disp.step().unwrap();
        recv_packet(&peer);

        peer.send_to(&Packet::data(101, b"X").encode(), ep_addr).unwrap();
        disp.step().unwrap();
        recv_packet(&peer);

        // An out-of-order FIN is only re-acknowledged.
        peer.send_to(&Packet::fin(103).encode(), ep_addr).unwrap();
        disp.step().unwrap();
        let (ack, _) = recv_packet(&peer);
        assert_eq!(ack.seq, 102);
        assert!(events.borrow().is_empty());

        // The in-order FIN closes and resets the endpoint.
        peer.send_to(&Packet::fin(102).encode(), ep_addr).unwrap();
        disp.step().unwrap();
        let (ack, _) = recv_packet(&peer);
        assert_eq!(ack.seq, 103);
        assert_eq!(*events.borrow(), vec![Event::Closed]);
        assert_eq!(sock.inner.borrow().phase, Phase::Init);

        // Ready for a fresh connection with new sequence numbers.
        peer.send_to(&Packet::syn(500).encode(), ep_addr).unwrap();
        disp.step().unwrap();
        let (ack, _) = recv_packet(&peer);
        assert_eq!(ack.seq, 501);
        assert_eq!(sock.inner.borrow().phase, Phase::Data);
    }

    #[test]
    fn syn_retransmits_then_reports_timeout() {
        let mut disp = Dispatcher::new();
        let sock = open_endpoint(&mut disp);
        let (peer, peer_addr) = scripted_peer();

        let events = Rc::new(RefCell::new(Vec::new()));
        {
            let events = Rc::clone(&events);
            sock.set_event_handler(Box::new(move |_, _, event, from| {
                events.borrow_mut().push((event, from));
                Ok(())
            }));
        }

        sock.send_to(&mut disp, b"AB", peer_addr).unwrap();

        // The eager transmission plus MAX_RETRANS timer-driven ones.
        for _ in 0..MAX_RETRANS {
            disp.step().unwrap();
        }
        for _ in 0..=MAX_RETRANS {
            let (packet, _) = recv_packet(&peer);
            assert_eq!(packet.kind, Kind::Syn);
        }
        assert!(events.borrow().is_empty());

        // The next expiry gives up instead of transmitting again.
        disp.step().unwrap();

        assert_eq!(*events.borrow(), vec![(Event::Timeout, peer_addr)]);
        assert_eq!(disp.timer_count(), 0);
        // The endpoint is left in place for the application to judge.
        assert_eq!(disp.io_count(), 1);
        let st = sock.inner.borrow();
        assert_eq!(st.queue.front().unwrap().retrans, MAX_RETRANS);
        assert!(st.queue.front().unwrap().timer.is_none());
    }

    #[test]
    fn sending_after_close_is_refused() {
        let mut disp = Dispatcher::new();
        let sock = open_endpoint(&mut disp);
        let (_peer, peer_addr) = scripted_peer();

        sock.send_to(&mut disp, b"AB", peer_addr).unwrap();
        sock.close().unwrap();

        assert!(matches!(
            sock.send_to(&mut disp, b"CD", peer_addr),
            Err(Error::InvalidPhase(Phase::Closing))
        ));
        assert!(matches!(
            sock.close(),
            Err(Error::InvalidPhase(Phase::Closing))
        ));

        // The refused operations did not grow the queue.
        assert_eq!(sock.inner.borrow().queue.len(), 3);
    }

    #[test]
    fn closing_before_any_send_is_refused() {
        let mut disp = Dispatcher::new();
        let sock = open_endpoint(&mut disp);

        assert!(matches!(
            sock.close(),
            Err(Error::InvalidPhase(Phase::Init))
        ));
    }

    #[test]
    fn oversized_payload_is_refused() {
        let mut disp = Dispatcher::new();
        let sock = open_endpoint(&mut disp);
        let (_peer, peer_addr) = scripted_peer();

        let too_big = vec![0u8; MAX_PAYLOAD + 1];

        assert!(matches!(
            sock.send_to(&mut disp, &too_big, peer_addr),
            Err(Error::PayloadTooLarge)
        ));
        assert_eq!(sock.inner.borrow().phase, Phase::Init);
    }
}
