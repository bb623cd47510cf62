//! Peer communication layer.
//!
//! A thin wrapper over the externally provided transport: the engine hands
//! fully encoded buffers to a [`Network`] implementation and never blocks on
//! I/O. Message framing and fan-out live here; the transport owns the actual
//! sockets and flushes asynchronously.

use std::fmt;

use crate::ledger::AcceptorList;
use crate::wire;
use crate::wire::Message;

/// Token identifying one transport connection. Assigned by the transport;
/// opaque to the engine.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Conn({})", self.0)
    }
}

/// Contract the external transport provides: per-peer duplex byte streams,
/// taking fully-formed outbound buffers. Send failures are not reported here;
/// a dead peer eventually surfaces as a connection-closed event.
pub trait Network {
    fn send(&mut self, conn: ConnId, buf: &[u8]);
    fn close(&mut self, conn: ConnId);
}

pub struct Comms {
    net: Box<dyn Network>,
}

impl Comms {
    pub fn new(net: Box<dyn Network>) -> Comms {
        Comms { net }
    }

    /// Send one message over a specific connection.
    pub fn send_to(&mut self, conn: ConnId, msg: &Message) {
        let buf = wire::frame(&msg.encode());
        self.net.send(conn, &buf);
    }

    /// Broadcast to every acceptor with a live peer handle. The local
    /// participant's own entry has no handle and is skipped naturally.
    pub fn broadcast(&mut self, alist: &AcceptorList, msg: &Message) {
        let buf = wire::frame(&msg.encode());
        for acc in alist.iter() {
            if let Some(conn) = acc.conn {
                self.net.send(conn, &buf);
            }
        }
    }

    pub fn close(&mut self, conn: ConnId) {
        self.net.close(conn);
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::ids::{Ballot, SessionId};
    use crate::ledger::Acceptor;
    use crate::wire::{FrameBuffer, Header, Opcode};

    struct Recorder {
        sent: Rc<RefCell<Vec<(ConnId, Vec<u8>)>>>,
    }

    impl Network for Recorder {
        fn send(&mut self, conn: ConnId, buf: &[u8]) {
            self.sent.borrow_mut().push((conn, buf.to_vec()));
        }
        fn close(&mut self, _conn: ConnId) {}
    }

    fn hello() -> Message {
        Message::Hello(Header {
            session: SessionId(9),
            ballot: Ballot::new(1, 1),
            op: Opcode::Hello,
            inum: 1,
        })
    }

    #[test]
    fn broadcast_skips_unreachable_peers() {
        let sent = Rc::new(RefCell::new(Vec::new()));
        let mut comms = Comms::new(Box::new(Recorder { sent: sent.clone() }));

        let mut alist = AcceptorList::new();
        alist.insert(Acceptor { paxid: 1, conn: None, desc: vec![] });
        alist.insert(Acceptor { paxid: 2, conn: Some(ConnId(20)), desc: vec![] });
        alist.insert(Acceptor { paxid: 3, conn: None, desc: vec![] });
        alist.insert(Acceptor { paxid: 4, conn: Some(ConnId(40)), desc: vec![] });

        comms.broadcast(&alist, &hello());

        let sent = sent.borrow();
        let conns: Vec<ConnId> = sent.iter().map(|(c, _)| *c).collect();
        assert_eq!(conns, vec![ConnId(40), ConnId(20)]);
    }

    #[test]
    fn sent_buffers_are_framed_messages() {
        let sent = Rc::new(RefCell::new(Vec::new()));
        let mut comms = Comms::new(Box::new(Recorder { sent: sent.clone() }));

        comms.send_to(ConnId(5), &hello());

        let sent = sent.borrow();
        let mut fb = FrameBuffer::new();
        fb.push(&sent[0].1);
        let payload = fb.next_frame().unwrap().unwrap();
        assert_eq!(Message::decode(&payload), Ok(hello()));
    }
}
