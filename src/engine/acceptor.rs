//! Acceptor-side operations: promise, accept, commit application, redirect
//! handling, and the request body retrieve/resend service.

use log::debug;

use super::*;
use crate::ledger::Instance;

impl Paxos {
    /// A proposer claims a ballot. If it is at least as high as ours we
    /// adopt it and report every instance at or past the cutoff, committed
    /// or not, so the proposer can reconstruct the authoritative value for
    /// each slot. A stale ballot earns a redirect.
    pub(super) fn ack_prepare(&mut self, conn: ConnId, hdr: Header) {
        if hdr.ballot < self.ballot {
            return self.redirect(conn);
        }

        self.yield_to(hdr.ballot);
        if let Some(acc) = self.alist.find_mut(hdr.ballot.id) {
            if acc.conn.is_none() {
                acc.conn = Some(conn);
            }
        }

        let replies: Vec<InstanceRec> = self.ilist.iter_from(hdr.inum).map(|i| i.rec()).collect();
        debug!(
            "promising ballot {} with {} instances from {}",
            self.ballot,
            replies.len(),
            hdr.inum
        );
        let reply = Message::Promise(self.header(Opcode::Promise, hdr.inum), replies);
        self.comms.send_to(conn, &reply);
    }

    /// Record a decreed instance and vote for it. An entry already held for
    /// the slot is superseded only by a higher ballot; a committed slot is
    /// never displaced.
    pub(super) fn ack_decree(&mut self, conn: ConnId, hdr: Header, value: Value) {
        if hdr.ballot < self.ballot {
            return self.redirect(conn);
        }
        if hdr.ballot > self.ballot {
            self.yield_to(hdr.ballot);
        }

        match self.ilist.find_mut(hdr.inum) {
            Some(inst) if inst.committed => (),
            Some(inst) => {
                if hdr.ballot >= inst.hdr.ballot {
                    let mut fresh = Instance::from_rec(&InstanceRec {
                        hdr,
                        committed: false,
                        value,
                    });
                    fresh.cached = inst.cached;
                    self.ilist.replace(fresh);
                }
            }
            None => {
                self.ilist.insert(Instance::from_rec(&InstanceRec {
                    hdr,
                    committed: false,
                    value,
                }));
            }
        }

        let reply = Message::Accept(self.header(Opcode::Accept, hdr.inum), value);
        self.comms.send_to(conn, &reply);
    }

    /// Mark an instance committed and apply its effect. Committing an
    /// already-committed instance is a no-op; a commit for a slot we never
    /// recorded creates it from the carried value.
    pub(super) fn ack_commit(&mut self, hdr: Header, value: Value) {
        if hdr.ballot > self.ballot {
            self.yield_to(hdr.ballot);
        }

        match self.ilist.find_mut(hdr.inum) {
            Some(inst) => {
                if inst.committed {
                    return;
                }
                inst.committed = true;
                inst.hdr.ballot = hdr.ballot;
                inst.hdr.op = Opcode::Commit;
                inst.value = value;
            }
            None => {
                self.ilist.insert(Instance::from_rec(&InstanceRec {
                    hdr,
                    committed: true,
                    value,
                }));
            }
        }
        self.learn(hdr.inum);
    }

    /// A peer pointed us at the proposer it believes in. Adopt the higher
    /// epoch; otherwise the redirect is stale and ignored.
    pub(super) fn ack_redirect(&mut self, hdr: Header) {
        if hdr.ballot <= self.ballot {
            return;
        }
        self.yield_to(hdr.ballot);
        // The inum field hints at the believed proposer, which may differ
        // from the ballot owner if an election is in progress.
        if self.alist.find(hdr.inum).is_some() {
            self.proposer = Some(hdr.inum);
        }
    }

    /// A peer asks for a request body it is missing.
    pub(super) fn ack_retrieve(&mut self, asker: Paxid, reqid: ReqId) {
        let req = match self.rcache.find(reqid) {
            Some(r) => r.clone(),
            None => {
                debug!("retrieve for unknown request {}", reqid);
                return;
            }
        };
        let msg = Message::Resend(self.header(Opcode::Resend, 0), req);
        if let Some(acc) = self.alist.find(asker) {
            let acc_conn = acc.conn;
            if let Some(conn) = acc_conn {
                self.comms.send_to(conn, &msg);
            }
        }
    }

    /// A request body arrived out of band. Cache it and finish delivering
    /// any committed instances that were waiting on it.
    pub(super) fn ack_resend(&mut self, req: RequestRec) {
        let reqid = req.value.reqid;
        let data = req.data.clone();
        self.rcache.insert(req);

        // A join applied before its body arrived holds an empty descriptor;
        // patch the membership record now that the body is here.
        let joins: Vec<Paxid> = self
            .ilist
            .iter()
            .filter(|i| i.learned && i.value.dkind == Dkind::Join && i.value.reqid == reqid)
            .map(|i| i.inum())
            .collect();
        for paxid in joins {
            if let Some(acc) = self.alist.find_mut(paxid) {
                if acc.desc.is_empty() {
                    acc.desc = data.clone();
                }
            }
            self.mark_learned(paxid, true);
        }

        let waiting: Vec<Paxid> = self
            .ilist
            .iter()
            .filter(|i| i.committed && !i.learned && i.value.reqid == reqid)
            .map(|i| i.inum())
            .collect();
        for inum in waiting {
            self.learn(inum);
        }
    }
}
