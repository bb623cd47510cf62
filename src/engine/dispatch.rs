//! Message demultiplexing.
//!
//! A decoded message is routed by the local role (proposer or acceptor) and
//! its opcode. The matches are exhaustive over [`Message`], so an opcode
//! added to the wire enum cannot silently fall through unhandled.

use log::{debug, warn};

use super::*;

impl Paxos {
    pub(super) fn dispatch(&mut self, conn: ConnId, msg: Message) {
        let hdr = *msg.header();

        // A welcome is the one message that establishes our session rather
        // than matching it.
        let msg = match msg {
            Message::Welcome(whdr, info) => {
                if self.self_id == 0 {
                    self.ack_welcome(conn, whdr, info);
                } else {
                    warn!("{}: ignoring welcome, already a member", conn);
                }
                return;
            }
            other => other,
        };

        if hdr.session != self.session {
            if self.self_id == 0 {
                // Not yet welcomed; a hello may legitimately race ahead.
                if let Message::Hello(h) = msg {
                    debug!("{}: parking pre-welcome hello from {}", conn, h.inum);
                    self.pending_hellos.push((h.inum, conn));
                }
            } else {
                warn!(
                    "{}: dropping message for foreign session {}",
                    conn, hdr.session
                );
            }
            return;
        }

        if self.is_proposer() {
            self.proposer_dispatch(conn, msg);
        } else {
            self.acceptor_dispatch(conn, msg);
        }
    }

    fn proposer_dispatch(&mut self, conn: ConnId, msg: Message) {
        match msg {
            // A rival proposer. The higher ballot wins; ours earns them a
            // redirect.
            Message::Prepare(hdr) => {
                if hdr.ballot > self.ballot {
                    self.ack_prepare(conn, hdr);
                } else {
                    self.redirect(conn);
                }
            }
            Message::Decree(hdr, value) => {
                if hdr.ballot > self.ballot {
                    self.ack_decree(conn, hdr, value);
                } else {
                    self.redirect(conn);
                }
            }
            Message::Commit(hdr, value) => {
                if hdr.ballot >= self.ballot {
                    self.ack_commit(hdr, value);
                } else {
                    self.redirect(conn);
                }
            }
            Message::Promise(hdr, replies) => self.ack_promise(hdr, replies),
            Message::Accept(hdr, _) => self.ack_accept(hdr),
            Message::Request(_, req) => self.ack_request(req),
            Message::Redirect(hdr) => self.ack_redirect(hdr),
            Message::Welcome(..) => (),
            Message::Hello(hdr) => self.ack_hello(conn, hdr),
            Message::Retrieve(_, asker, reqid) => self.ack_retrieve(asker, reqid),
            Message::Resend(_, req) => self.ack_resend(req),
        }
    }

    fn acceptor_dispatch(&mut self, conn: ConnId, msg: Message) {
        match msg {
            Message::Prepare(hdr) => self.ack_prepare(conn, hdr),
            Message::Decree(hdr, value) => self.ack_decree(conn, hdr, value),
            Message::Commit(hdr, value) => self.ack_commit(hdr, value),
            // Replies meant for a proposer we are not; stale by definition.
            Message::Promise(hdr, _) | Message::Accept(hdr, _) => {
                debug!("{}: dropping stale {:?} for ballot {}", conn, hdr.op, hdr.ballot);
            }
            // We cannot decree; point the sender at the proposer we believe
            // in.
            Message::Request(..) => self.redirect(conn),
            Message::Redirect(hdr) => self.ack_redirect(hdr),
            Message::Welcome(..) => (),
            Message::Hello(hdr) => self.ack_hello(conn, hdr),
            Message::Retrieve(_, asker, reqid) => self.ack_retrieve(asker, reqid),
            Message::Resend(_, req) => self.ack_resend(req),
        }
    }
}
