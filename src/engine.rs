//! The consensus protocol engine.
//!
//! A [`Paxos`] value is the singleton protocol context for one participant:
//! its identity, the current ballot, its belief about who the proposer is,
//! and the log/membership/request stores. Every participant runs the
//! acceptor logic; the one whose paxid matches the believed proposer also
//! runs the proposer logic. That belief is derived, never cached elsewhere,
//! and can be transiently wrong across the cluster, which the protocol
//! tolerates.
//!
//! The engine is single-threaded and event-driven: each call runs one
//! protocol step to completion, mutating the context and handing any
//! outbound buffers to the communication layer. Nothing here blocks.

mod acceptor;
mod dispatch;
mod greet;
mod proposer;

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use log::{debug, warn};

use crate::comms::{Comms, ConnId, Network};
use crate::ids::{Ballot, Paxid, ReqId, SessionId};
use crate::ledger::{Acceptor, AcceptorList, Instance, InstanceLog, RequestCache};
use crate::wire::{
    Dkind, FrameBuffer, Header, InstanceRec, Message, Opcode, RequestRec, Value, WelcomeRec,
};

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Error {
    /// No reachable proposer to forward a request to
    NoProposer,
    /// The operation is only valid on the proposer
    NotProposer,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::NoProposer => write!(f, "NoProposer"),
            Error::NotProposer => write!(f, "NotProposer"),
        }
    }
}

/// Application-facing delivery of committed decrees.
pub trait Listener {
    /// Our WELCOME arrived and we now know our own paxid.
    fn on_welcome(&mut self, self_id: Paxid);

    /// A chat decree committed and its body is available.
    fn on_chat(&mut self, from: Paxid, data: &[u8]);

    fn on_join(&mut self, member: Paxid);

    fn on_part(&mut self, member: Paxid);
}

/// Transient state of an in-flight prepare phase. At most one exists per
/// process; starting a new prepare supersedes the old one.
struct Prep {
    /// Lowest instance the prepare asks about
    start: Paxid,
    /// Promises received, counting our own
    acks: u32,
    /// Instances reported by promisers, merged per inum
    ilist: BTreeMap<Paxid, InstanceRec>,
}

/// A connection admitted by the proposer whose JOIN decree is still in
/// flight; resolved when the decree commits and yields the new paxid.
struct PendingJoin {
    reqid: ReqId,
    conn: ConnId,
}

/// Singleton protocol context for one participant.
pub struct Paxos {
    /// Our paxid; 0 until a WELCOME assigns one
    self_id: Paxid,
    session: SessionId,
    ballot: Ballot,
    /// Paxid of the believed proposer (possibly ourselves)
    proposer: Option<Paxid>,
    alist: AcceptorList,
    ilist: InstanceLog,
    rcache: RequestCache,
    prep: Option<Prep>,
    pending_joins: Vec<PendingJoin>,
    /// Hellos naming a paxid we do not know yet; resolved when the JOIN
    /// commit propagates
    pending_hellos: Vec<(Paxid, ConnId)>,
    /// Lowest instance we hold full history from
    istart: Paxid,
    /// Local request submission counter (gen half of our reqids)
    req_gen: Paxid,
    frames: HashMap<ConnId, FrameBuffer>,
    comms: Comms,
    listener: Box<dyn Listener>,
}

impl Paxos {
    /// Found a new session as its sole member and proposer.
    ///
    /// The founder's own JOIN is recorded as a pre-committed instance 1, so
    /// every member's paxid equals the instance number of its JOIN decree,
    /// founder included.
    pub fn bootstrap(desc: Vec<u8>, net: Box<dyn Network>, listener: Box<dyn Listener>) -> Paxos {
        let session = SessionId::generate();
        let ballot = Ballot::new(1, 1);

        let mut alist = AcceptorList::new();
        alist.insert(Acceptor { paxid: 1, conn: None, desc: desc.clone() });

        let value = Value {
            dkind: Dkind::Join,
            reqid: ReqId::new(1, 0),
            extra: 0,
        };
        let mut rcache = RequestCache::new();
        rcache.insert(RequestRec { value, data: desc });

        let mut ilist = InstanceLog::new();
        let founding = Instance {
            hdr: Header { session, ballot, op: Opcode::Commit, inum: 1 },
            committed: true,
            cached: true,
            learned: true,
            votes: 1,
            rejects: 0,
            value,
        };
        ilist.insert(founding);

        Paxos {
            self_id: 1,
            session,
            ballot,
            proposer: Some(1),
            alist,
            ilist,
            rcache,
            prep: None,
            pending_joins: Vec::new(),
            pending_hellos: Vec::new(),
            istart: 1,
            req_gen: 0,
            frames: HashMap::new(),
            comms: Comms::new(net),
            listener,
        }
    }

    /// An empty context awaiting a WELCOME from the session's proposer.
    pub fn joining(net: Box<dyn Network>, listener: Box<dyn Listener>) -> Paxos {
        Paxos {
            self_id: 0,
            session: SessionId(0),
            ballot: Ballot::default(),
            proposer: None,
            alist: AcceptorList::new(),
            ilist: InstanceLog::new(),
            rcache: RequestCache::new(),
            prep: None,
            pending_joins: Vec::new(),
            pending_hellos: Vec::new(),
            istart: 1,
            req_gen: 0,
            frames: HashMap::new(),
            comms: Comms::new(net),
            listener,
        }
    }

    pub fn self_id(&self) -> Paxid {
        self.self_id
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn ballot(&self) -> Ballot {
        self.ballot
    }

    pub fn members(&self) -> usize {
        self.alist.len()
    }

    /// Derived role predicate; never cached.
    pub fn is_proposer(&self) -> bool {
        self.proposer == Some(self.self_id)
    }

    fn header(&self, op: Opcode, inum: Paxid) -> Header {
        Header {
            session: self.session,
            ballot: self.ballot,
            op,
            inum,
        }
    }

    fn next_reqid(&mut self) -> ReqId {
        self.req_gen += 1;
        ReqId::new(self.self_id, self.req_gen)
    }

    /// Transport callback: bytes arrived on a connection. Complete frames
    /// are decoded and dispatched in the peer's send order; malformed input
    /// is logged and dropped without touching protocol state.
    pub fn receive(&mut self, conn: ConnId, bytes: &[u8]) {
        self.frames.entry(conn).or_insert_with(FrameBuffer::new).push(bytes);

        loop {
            let next = match self.frames.get_mut(&conn) {
                Some(fb) => fb.next_frame(),
                None => break,
            };
            match next {
                Ok(Some(payload)) => match Message::decode(&payload) {
                    Ok(msg) => self.dispatch(conn, msg),
                    Err(e) => {
                        warn!("{}: dropping malformed message: {}", conn, e);
                    }
                },
                Ok(None) => break,
                Err(crate::wire::WireError::BadChecksum) => {
                    warn!("{}: dropping frame with bad checksum", conn);
                }
                Err(e) => {
                    // The stream cannot be resynchronized past a corrupt
                    // length; cut the connection loose.
                    warn!("{}: unrecoverable stream corruption ({}), closing", conn, e);
                    self.frames.remove(&conn);
                    self.comms.close(conn);
                    break;
                }
            }
        }
    }

    /// Transport callback: a fresh connection to some peer is up. Announce
    /// our identity so the peer can associate the connection with our
    /// acceptor record.
    pub fn peer_connected(&mut self, conn: ConnId) {
        if self.self_id != 0 {
            self.hello(conn);
        }
    }

    /// Transport callback: a connection reached end-of-stream. Membership is
    /// a log-recorded fact, so the acceptor stays; only its peer handle is
    /// nulled. Losing the proposer triggers local succession.
    pub fn peer_disconnected(&mut self, conn: ConnId) {
        self.frames.remove(&conn);

        let lost = match self.alist.find_conn_mut(conn) {
            Some(acc) => {
                acc.conn = None;
                acc.paxid
            }
            None => return,
        };
        debug!("lost connection to acceptor {}", lost);

        if self.proposer != Some(lost) {
            return;
        }

        // Elect the new proposer locally: the first acceptor in list order
        // that is reachable, or ourselves.
        let next = self
            .alist
            .iter()
            .find(|a| a.conn.is_some() || a.paxid == self.self_id)
            .map(|a| a.paxid);
        self.proposer = next;
        debug!("proposer {} lost, now believe proposer is {:?}", lost, next);

        if self.is_proposer() {
            self.prepare();
        }
    }

    /// Submit a decree on behalf of the local client. Decreed directly if we
    /// are the proposer, otherwise forwarded as a REQUEST.
    pub fn request(&mut self, dkind: Dkind, data: Vec<u8>) -> Result<(), Error> {
        let extra = match dkind {
            Dkind::Part => self.self_id,
            _ => 0,
        };
        let value = Value {
            dkind,
            reqid: self.next_reqid(),
            extra,
        };
        self.submit(value, data)
    }

    /// Decree the departure of a member.
    pub fn part(&mut self, paxid: Paxid) -> Result<(), Error> {
        let value = Value {
            dkind: Dkind::Part,
            reqid: self.next_reqid(),
            extra: paxid,
        };
        self.submit(value, Vec::new())
    }

    /// Proposer-side join admission: decree a JOIN whose request body is the
    /// joiner's descriptor. The connection is parked until the decree
    /// commits and its instance number becomes the new member's paxid.
    pub fn add_member(&mut self, conn: ConnId, desc: Vec<u8>) -> Result<(), Error> {
        if !self.is_proposer() {
            return Err(Error::NotProposer);
        }
        let reqid = self.next_reqid();
        let value = Value {
            dkind: Dkind::Join,
            reqid,
            extra: 0,
        };
        self.pending_joins.push(PendingJoin { reqid, conn });
        self.rcache.insert(RequestRec { value, data: desc });
        self.decree(value);
        Ok(())
    }

    fn submit(&mut self, value: Value, data: Vec<u8>) -> Result<(), Error> {
        let req = RequestRec { value, data };
        if self.is_proposer() {
            self.rcache.insert(req);
            self.decree(value);
            Ok(())
        } else {
            let proposer = self.proposer.ok_or(Error::NoProposer)?;
            let conn = self
                .alist
                .find(proposer)
                .and_then(|a| a.conn)
                .ok_or(Error::NoProposer)?;
            let msg = Message::Request(self.header(Opcode::Request, 0), req.clone());
            self.rcache.insert(req);
            self.comms.send_to(conn, &msg);
            Ok(())
        }
    }

    /// Point a peer at the believed proposer instead of processing its
    /// message.
    fn redirect(&mut self, conn: ConnId) {
        let hint = self.proposer.unwrap_or(self.ballot.id);
        let msg = Message::Redirect(self.header(Opcode::Redirect, hint));
        self.comms.send_to(conn, &msg);
    }

    /// Adopt a strictly higher ballot seen on the wire, abandoning any
    /// proposer-side progress of our own.
    fn yield_to(&mut self, ballot: Ballot) {
        debug!("yielding to higher ballot {}", ballot);
        self.ballot = ballot;
        self.proposer = Some(ballot.id);
        self.prep = None;
    }

    fn take_pending_join(&mut self, reqid: ReqId) -> Option<ConnId> {
        let pos = self.pending_joins.iter().position(|p| p.reqid == reqid)?;
        Some(self.pending_joins.remove(pos).conn)
    }

    /// Apply the effect of a committed instance exactly once.
    ///
    /// A chat whose body is not yet cached is left unlearned and the body is
    /// retrieved out of band; the later RESEND completes delivery.
    fn learn(&mut self, inum: Paxid) {
        let value = match self.ilist.find(inum) {
            Some(inst) if inst.committed && !inst.learned => inst.value,
            _ => return,
        };

        match value.dkind {
            Dkind::Null => {
                self.mark_learned(inum, false);
            }
            Dkind::Chat => {
                let body = self.rcache.find(value.reqid).map(|r| r.data.clone());
                match body {
                    Some(data) => {
                        self.mark_learned(inum, true);
                        self.listener.on_chat(value.reqid.id, &data);
                    }
                    None => self.retrieve(value.reqid),
                }
            }
            Dkind::Join => {
                let new_paxid = inum;
                // The join applies even when the descriptor body has not
                // arrived; the descriptor is fetched out of band and patched
                // in when the resend lands.
                let body = self.rcache.find(value.reqid).map(|r| r.data.clone());
                let cached = body.is_some();
                let desc = body.unwrap_or_default();
                let conn = self.take_pending_join(value.reqid);

                if self.alist.find(new_paxid).is_none() {
                    self.alist.insert(Acceptor { paxid: new_paxid, conn, desc });
                } else if let Some(c) = conn {
                    if let Some(acc) = self.alist.find_mut(new_paxid) {
                        acc.conn = Some(c);
                    }
                }

                // A hello may have raced ahead of this commit.
                if let Some(pos) = self.pending_hellos.iter().position(|(p, _)| *p == new_paxid) {
                    let (_, c) = self.pending_hellos.remove(pos);
                    if let Some(acc) = self.alist.find_mut(new_paxid) {
                        acc.conn = Some(c);
                    }
                }

                self.mark_learned(inum, cached);
                if !cached {
                    self.retrieve(value.reqid);
                }
                if self.is_proposer() && new_paxid != self.self_id {
                    self.welcome(new_paxid);
                }
                self.listener.on_join(new_paxid);
            }
            Dkind::Part => {
                let paxid = value.extra;
                if let Some(acc) = self.alist.remove(paxid) {
                    if let Some(c) = acc.conn {
                        self.frames.remove(&c);
                        self.comms.close(c);
                    }
                }
                self.mark_learned(inum, false);
                self.listener.on_part(paxid);
            }
        }
    }

    fn mark_learned(&mut self, inum: Paxid, cached: bool) {
        if let Some(inst) = self.ilist.find_mut(inum) {
            inst.learned = true;
            inst.cached = cached;
        }
    }

    /// Fetch a request body we are missing: ask the original requester if it
    /// is reachable, else the proposer.
    fn retrieve(&mut self, reqid: ReqId) {
        let target = self
            .alist
            .find(reqid.id)
            .and_then(|a| a.conn)
            .or_else(|| {
                self.proposer
                    .and_then(|p| self.alist.find(p))
                    .and_then(|a| a.conn)
            });
        if let Some(conn) = target {
            let msg = Message::Retrieve(self.header(Opcode::Retrieve, 0), self.self_id, reqid);
            self.comms.send_to(conn, &msg);
        }
    }
}
