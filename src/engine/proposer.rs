//! Proposer-side operations: prepare/promise, decree/accept/commit, and
//! request acknowledgement.

use std::cmp;

use log::debug;

use super::*;
use crate::ledger::Instance;

impl Paxos {
    /// Start a prepare phase under a freshly bumped ballot.
    ///
    /// Called when and only when we just lost the connection to the previous
    /// proposer and we were next in line. The prepare's cutoff is our first
    /// unrecorded-or-uncommitted instance, so promisers report exactly the
    /// slots we may need to repair.
    pub(super) fn prepare(&mut self) {
        self.ballot = self.ballot.bump(self.self_id);

        let (start, _) = self.ilist.first_hole(self.istart);
        debug!(
            "preparing ballot {} from instance {} ({} members)",
            self.ballot,
            start,
            self.alist.len()
        );

        // Our own promise is implicit: everything we hold is already local.
        self.prep = Some(Prep {
            start,
            acks: 1,
            ilist: BTreeMap::new(),
        });

        let msg = Message::Prepare(self.header(Opcode::Prepare, start));
        self.comms.broadcast(&self.alist, &msg);

        // A sole reachable member is its own majority.
        self.maybe_finish_prepare();
    }

    /// Merge one acceptor's promise into the prepare.
    ///
    /// For each reported inum the entry with the strictly highest ballot is
    /// retained, except that a committed report always wins: a committed
    /// value is chosen and must never be displaced.
    pub(super) fn ack_promise(&mut self, hdr: Header, replies: Vec<InstanceRec>) {
        if hdr.ballot != self.ballot {
            return;
        }
        let prep = match self.prep.as_mut() {
            Some(p) => p,
            None => return,
        };

        for rec in replies {
            let inum = rec.hdr.inum;
            match prep.ilist.get(&inum) {
                None => {
                    prep.ilist.insert(inum, rec);
                }
                Some(have) if have.committed => (),
                Some(have) => {
                    if rec.committed || rec.hdr.ballot > have.hdr.ballot {
                        prep.ilist.insert(inum, rec);
                    }
                }
            }
        }

        prep.acks += 1;
        self.maybe_finish_prepare();
    }

    /// If a majority has promised, resolve the prepare: re-decree every
    /// collected uncommitted value under our ballot, adopt committed values
    /// verbatim, and decree no-ops for holes nobody reported.
    fn maybe_finish_prepare(&mut self) {
        let majority = self.alist.majority();
        let prep = match self.prep.take() {
            Some(p) => {
                if p.acks < majority {
                    self.prep = Some(p);
                    return;
                }
                p
            }
            None => return,
        };

        let mut end = self.ilist.next_instance();
        if let Some((&highest, _)) = prep.ilist.iter().next_back() {
            end = cmp::max(end, highest + 1);
        }
        debug!(
            "prepare {} resolved with {} acks; repairing instances {}..{}",
            self.ballot, prep.acks, prep.start, end
        );

        for inum in prep.start..end {
            if let Some(local) = self.ilist.find(inum) {
                if local.committed {
                    continue;
                }
            }
            match prep.ilist.get(&inum) {
                Some(rec) if rec.committed => {
                    // Already chosen under an earlier ballot; adopt, never
                    // re-decree.
                    let mut inst = Instance::from_rec(rec);
                    inst.hdr.session = self.session;
                    self.ilist.replace(inst);
                    self.learn(inum);
                }
                Some(rec) => {
                    self.decree_at(inum, rec.value);
                }
                None => {
                    let noop = Value {
                        dkind: Dkind::Null,
                        reqid: ReqId::default(),
                        extra: 0,
                    };
                    self.decree_at(inum, noop);
                }
            }
        }
    }

    /// Decree a value at the next free instance.
    pub(super) fn decree(&mut self, value: Value) {
        let inum = self.ilist.next_instance();
        self.decree_at(inum, value);
    }

    /// Decree a value at a specific instance under the current ballot,
    /// superseding any uncommitted local record for that slot. Our own vote
    /// is counted immediately.
    pub(super) fn decree_at(&mut self, inum: Paxid, value: Value) {
        let hdr = self.header(Opcode::Decree, inum);
        self.ilist.replace(Instance::new(hdr, value));

        let msg = Message::Decree(hdr, value);
        self.comms.broadcast(&self.alist, &msg);

        self.maybe_commit(inum);
    }

    /// Acknowledge an acceptor's accept: one more vote for the instance.
    pub(super) fn ack_accept(&mut self, hdr: Header) {
        if hdr.ballot != self.ballot {
            return;
        }
        if let Some(inst) = self.ilist.find_mut(hdr.inum) {
            if !inst.committed && inst.hdr.ballot == hdr.ballot {
                inst.votes += 1;
            }
        }
        self.maybe_commit(hdr.inum);
    }

    fn maybe_commit(&mut self, inum: Paxid) {
        let majority = self.alist.majority();
        match self.ilist.find(inum) {
            Some(inst) if !inst.committed && inst.votes >= majority => (),
            _ => return,
        }
        self.commit(inum);
    }

    /// Broadcast a commit for an instance that reached majority, mark it
    /// committed, and apply its effect.
    fn commit(&mut self, inum: Paxid) {
        let value = match self.ilist.find_mut(inum) {
            Some(inst) => {
                inst.committed = true;
                inst.hdr.op = Opcode::Commit;
                inst.value
            }
            None => return,
        };
        debug!("instance {} committed under ballot {}", inum, self.ballot);

        let msg = Message::Commit(self.header(Opcode::Commit, inum), value);
        self.comms.broadcast(&self.alist, &msg);

        self.learn(inum);
    }

    /// Dispatch a forwarded client request as a decree. A request whose
    /// reqid was already decreed is a duplicate submission and only
    /// refreshes the cache.
    pub(super) fn ack_request(&mut self, req: RequestRec) {
        let duplicate = self
            .ilist
            .iter()
            .any(|i| i.value.dkind == req.value.dkind && i.value.reqid == req.value.reqid);

        let value = req.value;
        self.rcache.insert(req);

        if duplicate {
            debug!("ignoring duplicate request {}", value.reqid);
            return;
        }
        self.decree(value);
    }
}
