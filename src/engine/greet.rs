//! Participant initialization: the welcome/hello handshake that brings new
//! members into the session and associates connections with acceptors.

use log::debug;

use super::*;
use crate::ledger::Instance;

impl Paxos {
    /// Welcome a newly joined member by shipping it our ballot, the full
    /// membership list, and the full instance log. The new member's paxid
    /// rides in the header's inum field, since it equals the instance number
    /// of its JOIN decree. The request cache is deliberately not sent; the
    /// joiner retrieves bodies lazily.
    pub(super) fn welcome(&mut self, paxid: Paxid) {
        let conn = match self.alist.find(paxid).and_then(|a| a.conn) {
            Some(c) => c,
            None => {
                debug!("cannot welcome unreachable acceptor {}", paxid);
                return;
            }
        };

        let info = WelcomeRec {
            istart: self.istart,
            alist: self.alist.iter().map(|a| a.rec()).collect(),
            ilist: self.ilist.iter().map(|i| i.rec()).collect(),
        };
        debug!(
            "welcoming acceptor {} with {} members, {} instances",
            paxid,
            info.alist.len(),
            info.ilist.len()
        );
        let msg = Message::Welcome(self.header(Opcode::Welcome, paxid), info);
        self.comms.send_to(conn, &msg);
    }

    /// Be welcomed into the session: adopt the transmitted session, ballot,
    /// and our assigned paxid, and rebuild membership and log from the
    /// payload. Transferred committed history is considered applied; its
    /// effects are already reflected in the membership list we received.
    pub(super) fn ack_welcome(&mut self, conn: ConnId, hdr: Header, info: WelcomeRec) {
        self.session = hdr.session;
        self.ballot = hdr.ballot;
        self.self_id = hdr.inum;
        self.istart = info.istart;
        self.proposer = Some(hdr.ballot.id);
        debug!(
            "welcomed as acceptor {} into {} (proposer {})",
            self.self_id, self.session, hdr.ballot.id
        );

        self.alist.clear();
        for rec in info.alist {
            let assoc = if rec.paxid == hdr.ballot.id { Some(conn) } else { None };
            self.alist.insert(Acceptor {
                paxid: rec.paxid,
                conn: assoc,
                desc: rec.desc,
            });
        }

        self.ilist.clear();
        for rec in info.ilist {
            let mut inst = Instance::from_rec(&rec);
            inst.learned = inst.committed;
            self.ilist.insert(inst);
        }

        // Hellos that raced ahead of the welcome can be resolved now.
        let parked: Vec<(Paxid, ConnId)> = self.pending_hellos.drain(..).collect();
        for (paxid, c) in parked {
            match self.alist.find_mut(paxid) {
                Some(acc) => acc.conn = Some(c),
                None => self.pending_hellos.push((paxid, c)),
            }
        }

        let self_id = self.self_id;
        self.listener.on_welcome(self_id);
    }

    /// Announce our identity over a fresh connection. The inum field is
    /// overloaded with our own paxid.
    pub(super) fn hello(&mut self, conn: ConnId) {
        let msg = Message::Hello(self.header(Opcode::Hello, self.self_id));
        self.comms.send_to(conn, &msg);
    }

    /// Record the identity of a fellow acceptor, associating its connection
    /// both ways. A hello naming a paxid we do not know yet is parked: the
    /// JOIN decree may simply not have reached us, and the association is
    /// made when it does.
    pub(super) fn ack_hello(&mut self, conn: ConnId, hdr: Header) {
        let paxid = hdr.inum;
        match self.alist.find_mut(paxid) {
            Some(acc) => {
                acc.conn = Some(conn);
            }
            None => {
                debug!("hello from unknown acceptor {}, parking", paxid);
                self.pending_hellos.push((paxid, conn));
            }
        }
    }
}
