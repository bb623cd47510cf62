//! Identifier and ordering primitives for the consensus protocol.
//!
//! Every correctness argument in the engine rests on all participants
//! computing the same total order over these identifiers from the same bytes.

use std::cmp::Ordering;
use std::fmt;

/// Identifies a protocol participant or a position in the decree log.
/// Compared by magnitude.
pub type Paxid = u32;

/// An ordered pair of paxids identifying a proposer's term.
///
/// The generation is the primary sort key. The id is the tie-breaker and
/// compares inverted: at equal generation, the lower id orders higher. This
/// keeps ballots a strict total order that is deterministic across nodes.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash, Default)]
pub struct Ballot {
    /// Paxid of the peer that opened this term
    pub id: Paxid,

    /// Term generation, bumped on every new prepare
    pub gen: Paxid,
}

impl Ballot {
    pub fn new(id: Paxid, gen: Paxid) -> Ballot {
        Ballot { id, gen }
    }

    /// The next ballot owned by `id`, superseding this one.
    pub fn bump(&self, id: Paxid) -> Ballot {
        Ballot { id, gen: self.gen + 1 }
    }
}

impl Ord for Ballot {
    fn cmp(&self, other: &Ballot) -> Ordering {
        match self.gen.cmp(&other.gen) {
            Ordering::Equal => other.id.cmp(&self.id),
            ord => ord,
        }
    }
}

impl PartialOrd for Ballot {
    fn partial_cmp(&self, other: &Ballot) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Ballot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({}, {})", self.id, self.gen)
    }
}

/// Identifies a client request. The id half is the paxid of the requester and
/// the gen half its local submission counter, so duplicate submissions are
/// disambiguated. Shares the pair ordering with [`Ballot`].
pub type ReqId = Ballot;

/// 64-bit identifier of a chat session. Minted once by the founding member.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash, Default)]
pub struct SessionId(pub u64);

impl SessionId {
    /// Mint a fresh session id from random UUID bytes.
    pub fn generate() -> SessionId {
        let u = uuid::Uuid::new_v4();
        let mut b: [u8; 8] = [0; 8];
        b.copy_from_slice(&u.as_bytes()[..8]);
        SessionId(u64::from_be_bytes(b))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Session({:016x})", self.0)
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn ballot_gen_dominates() {
        assert!(Ballot::new(0, 5) > Ballot::new(2, 4));
        assert!(Ballot::new(4, 4) < Ballot::new(0, 5));
    }

    #[test]
    fn ballot_id_inverted_at_equal_gen() {
        assert!(Ballot::new(0, 5) > Ballot::new(1, 5));
        assert!(Ballot::new(3, 7) < Ballot::new(2, 7));
        assert!(Ballot::new(4, 4) == Ballot::new(4, 4));
    }

    #[test]
    fn ballot_total_order_is_transitive() {
        let x = Ballot::new(3, 2);
        let y = Ballot::new(1, 2);
        let z = Ballot::new(9, 3);
        assert!(x < y && y < z && x < z);
    }

    #[test]
    fn bump_supersedes() {
        let b = Ballot::new(1, 3);
        assert!(b.bump(5) > b);
        assert!(b.bump(0) > b);
        assert_eq!(b.bump(5), Ballot::new(5, 4));
    }
}
