//! The decree log, membership list, and request cache.
//!
//! All three are ordered associative stores with idempotent insertion: an
//! insert that collides with an existing key returns the existing record
//! untouched, and the engine decides whether an overwrite is warranted. Each
//! record is owned by exactly one store; removal hands ownership back to the
//! caller.

use std::collections::BTreeMap;

use crate::comms::ConnId;
use crate::ids::{Paxid, ReqId};
use crate::wire::{AcceptorRec, Header, InstanceRec, RequestRec, Value};

/// A protocol participant. Membership is a log-recorded fact: a disconnected
/// acceptor keeps its entry with a null peer handle, since it may return.
#[derive(Debug)]
pub struct Acceptor {
    pub paxid: Paxid,

    /// Non-owning association to a transport connection; None when the peer
    /// is not currently reachable
    pub conn: Option<ConnId>,

    /// Opaque identity descriptor supplied at join time
    pub desc: Vec<u8>,
}

impl Acceptor {
    pub fn rec(&self) -> AcceptorRec {
        AcceptorRec {
            paxid: self.paxid,
            desc: self.desc.clone(),
        }
    }
}

/// Membership list ordered by paxid descending, so the newest-joined
/// acceptors (largest paxids) are found first.
#[derive(Debug, Default)]
pub struct AcceptorList {
    map: BTreeMap<Paxid, Acceptor>,
}

impl AcceptorList {
    pub fn new() -> AcceptorList {
        AcceptorList { map: BTreeMap::new() }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Acknowledgements required to commit: floor(members / 2) + 1.
    pub fn majority(&self) -> u32 {
        (self.map.len() / 2 + 1) as u32
    }

    pub fn find(&self, paxid: Paxid) -> Option<&Acceptor> {
        self.map.get(&paxid)
    }

    pub fn find_mut(&mut self, paxid: Paxid) -> Option<&mut Acceptor> {
        self.map.get_mut(&paxid)
    }

    /// Locate the acceptor currently associated with a transport connection.
    pub fn find_conn_mut(&mut self, conn: ConnId) -> Option<&mut Acceptor> {
        self.map.values_mut().find(|a| a.conn == Some(conn))
    }

    pub fn insert(&mut self, acc: Acceptor) -> &mut Acceptor {
        self.map.entry(acc.paxid).or_insert(acc)
    }

    pub fn remove(&mut self, paxid: Paxid) -> Option<Acceptor> {
        self.map.remove(&paxid)
    }

    /// Iterate in the list's defined order (paxid descending).
    pub fn iter(&self) -> impl Iterator<Item = &Acceptor> {
        self.map.values().rev()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }
}

/// One slot in the decree log.
#[derive(Debug, Clone)]
pub struct Instance {
    pub hdr: Header,
    pub committed: bool,
    /// Request body present in the local cache (or not needed)
    pub cached: bool,
    /// Effect delivered to the application
    pub learned: bool,
    pub votes: u32,
    /// Refusals recorded against this slot. No opcode in the current
    /// protocol carries one; acceptors redirect instead of voting no.
    pub rejects: u32,
    pub value: Value,
}

impl Instance {
    /// A freshly decreed instance: the proposer's own vote is counted.
    pub fn new(hdr: Header, value: Value) -> Instance {
        Instance {
            hdr,
            committed: false,
            cached: false,
            learned: false,
            votes: 1,
            rejects: 0,
            value,
        }
    }

    /// An instance reconstructed from the wire (promise or welcome); it
    /// carries no local vote accounting.
    pub fn from_rec(rec: &InstanceRec) -> Instance {
        Instance {
            hdr: rec.hdr,
            committed: rec.committed,
            cached: false,
            learned: false,
            votes: 0,
            rejects: 0,
            value: rec.value,
        }
    }

    pub fn rec(&self) -> InstanceRec {
        InstanceRec {
            hdr: self.hdr,
            committed: self.committed,
            value: self.value,
        }
    }

    pub fn inum(&self) -> Paxid {
        self.hdr.inum
    }
}

/// The decree log, keyed by instance number.
#[derive(Debug, Default)]
pub struct InstanceLog {
    map: BTreeMap<Paxid, Instance>,
}

impl InstanceLog {
    pub fn new() -> InstanceLog {
        InstanceLog { map: BTreeMap::new() }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn find(&self, inum: Paxid) -> Option<&Instance> {
        self.map.get(&inum)
    }

    pub fn find_mut(&mut self, inum: Paxid) -> Option<&mut Instance> {
        self.map.get_mut(&inum)
    }

    /// Idempotent insert: an existing instance at the same inum wins.
    pub fn insert(&mut self, inst: Instance) -> &mut Instance {
        self.map.entry(inst.inum()).or_insert(inst)
    }

    /// Unconditional overwrite, for when a higher ballot supersedes a slot.
    pub fn replace(&mut self, inst: Instance) {
        self.map.insert(inst.inum(), inst);
    }

    pub fn remove(&mut self, inum: Paxid) -> Option<Instance> {
        self.map.remove(&inum)
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    /// Iterate ascending by inum.
    pub fn iter(&self) -> impl Iterator<Item = &Instance> {
        self.map.values()
    }

    /// Iterate instances with inum >= start, ascending.
    pub fn iter_from(&self, start: Paxid) -> impl Iterator<Item = &Instance> {
        self.map.range(start..).map(|(_, inst)| inst)
    }

    /// One past the highest recorded inum; 1 for an empty log.
    pub fn next_instance(&self) -> Paxid {
        match self.map.keys().next_back() {
            Some(&inum) => inum + 1,
            None => 1,
        }
    }

    /// Scanning forward from `start`, the lowest inum that is absent or
    /// recorded but uncommitted, plus the instance immediately preceding
    /// that gap (none at the head of the log).
    pub fn first_hole(&self, start: Paxid) -> (Paxid, Option<&Instance>) {
        let mut hole = start;
        for (&inum, inst) in self.map.range(start..) {
            if inum != hole || !inst.committed {
                break;
            }
            hole += 1;
        }
        let prev = if hole > 1 { self.map.get(&(hole - 1)) } else { None };
        (hole, prev)
    }
}

/// Cache of raw request bodies, keyed and ordered by reqid. Kept by the
/// original proposer side so late joiners can fetch bodies without a full
/// history replay.
#[derive(Debug, Default)]
pub struct RequestCache {
    map: BTreeMap<ReqId, RequestRec>,
}

impl RequestCache {
    pub fn new() -> RequestCache {
        RequestCache { map: BTreeMap::new() }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn find(&self, reqid: ReqId) -> Option<&RequestRec> {
        self.map.get(&reqid)
    }

    pub fn insert(&mut self, req: RequestRec) -> &RequestRec {
        self.map.entry(req.value.reqid).or_insert(req)
    }

    pub fn remove(&mut self, reqid: ReqId) -> Option<RequestRec> {
        self.map.remove(&reqid)
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::ids::{Ballot, SessionId};
    use crate::wire::{Dkind, Opcode};

    fn hdr(inum: Paxid) -> Header {
        Header {
            session: SessionId(1),
            ballot: Ballot::new(1, 1),
            op: Opcode::Decree,
            inum,
        }
    }

    fn null_value() -> Value {
        Value {
            dkind: Dkind::Null,
            reqid: ReqId::new(0, 0),
            extra: 0,
        }
    }

    fn committed(inum: Paxid) -> Instance {
        let mut inst = Instance::new(hdr(inum), null_value());
        inst.committed = true;
        inst
    }

    #[test]
    fn acceptor_list_orders_descending() {
        let mut alist = AcceptorList::new();
        for paxid in [2u32, 5, 1, 3].iter() {
            alist.insert(Acceptor { paxid: *paxid, conn: None, desc: vec![] });
        }
        let order: Vec<Paxid> = alist.iter().map(|a| a.paxid).collect();
        assert_eq!(order, vec![5, 3, 2, 1]);
    }

    #[test]
    fn acceptor_insert_is_idempotent() {
        let mut alist = AcceptorList::new();
        alist.insert(Acceptor { paxid: 1, conn: Some(ConnId(7)), desc: b"a".to_vec() });
        let existing = alist.insert(Acceptor { paxid: 1, conn: None, desc: b"b".to_vec() });
        assert_eq!(existing.conn, Some(ConnId(7)));
        assert_eq!(existing.desc, b"a".to_vec());
        assert_eq!(alist.len(), 1);
    }

    #[test]
    fn majority_thresholds() {
        let mut alist = AcceptorList::new();
        for paxid in 1..=1 {
            alist.insert(Acceptor { paxid, conn: None, desc: vec![] });
        }
        assert_eq!(alist.majority(), 1);
        for paxid in 2..=3 {
            alist.insert(Acceptor { paxid, conn: None, desc: vec![] });
        }
        assert_eq!(alist.majority(), 2);
        for paxid in 4..=4 {
            alist.insert(Acceptor { paxid, conn: None, desc: vec![] });
        }
        assert_eq!(alist.majority(), 3);
    }

    #[test]
    fn next_instance_empty_log() {
        let ilist = InstanceLog::new();
        assert_eq!(ilist.next_instance(), 1);
    }

    #[test]
    fn next_instance_tracks_highest() {
        let mut ilist = InstanceLog::new();
        ilist.insert(committed(1));
        ilist.insert(committed(7));
        assert_eq!(ilist.next_instance(), 8);
    }

    #[test]
    fn first_hole_on_empty_log() {
        let ilist = InstanceLog::new();
        let (hole, prev) = ilist.first_hole(1);
        assert_eq!(hole, 1);
        assert!(prev.is_none());
    }

    #[test]
    fn first_hole_after_uncommitted_tail() {
        let mut ilist = InstanceLog::new();
        for inum in 1..=5 {
            ilist.insert(committed(inum));
        }
        ilist.insert(Instance::new(hdr(6), null_value()));

        let (hole, prev) = ilist.first_hole(1);
        assert_eq!(hole, 6);
        assert_eq!(prev.map(|i| i.inum()), Some(5));
    }

    #[test]
    fn first_hole_at_gap() {
        let mut ilist = InstanceLog::new();
        ilist.insert(committed(1));
        ilist.insert(committed(2));
        ilist.insert(committed(4));

        let (hole, prev) = ilist.first_hole(1);
        assert_eq!(hole, 3);
        assert_eq!(prev.map(|i| i.inum()), Some(2));
    }

    #[test]
    fn first_hole_honors_start() {
        let mut ilist = InstanceLog::new();
        ilist.insert(Instance::new(hdr(1), null_value()));
        ilist.insert(committed(3));

        let (hole, _) = ilist.first_hole(3);
        assert_eq!(hole, 4);
    }

    #[test]
    fn instance_insert_is_idempotent() {
        let mut ilist = InstanceLog::new();
        ilist.insert(committed(1));
        let existing = ilist.insert(Instance::new(hdr(1), null_value()));
        assert!(existing.committed);
        assert_eq!(ilist.len(), 1);
    }

    #[test]
    fn request_cache_keyed_by_reqid() {
        let mut cache = RequestCache::new();
        let mut value = null_value();
        value.dkind = Dkind::Chat;
        value.reqid = ReqId::new(2, 9);
        cache.insert(RequestRec { value, data: b"hello".to_vec() });

        assert!(cache.find(ReqId::new(2, 9)).is_some());
        assert!(cache.find(ReqId::new(2, 8)).is_none());
        assert_eq!(cache.remove(ReqId::new(2, 9)).map(|r| r.data), Some(b"hello".to_vec()));
        assert!(cache.find(ReqId::new(2, 9)).is_none());
    }
}
