//! Request dispatcher (§4.F) and the concurrency model around it (§5): a
//! single receive loop that classifies each packet by `type`, invokes the
//! matching handler, and forwards anything this node doesn't own.
//!
//! Every handler is a plain synchronous function from `&mut Node` to the
//! list of packets it wants sent — no handler touches the socket directly.
//! The async `run` loop is the only place that actually does I/O, merging
//! the UDP socket with a shutdown signal in one `tokio::select!` (§9
//! "Signal-driven leave"), so `NodeState`/`Store`/`RoutingTable` are only
//! ever touched from this one task.

use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::hash::hash;
use crate::packet::{Packet, PacketType};
use crate::ring::{HashRange, NodeInfo, NodeState};
use crate::routing::RoutingTable;
use crate::store::Store;

/// A packet this node wants sent, and where to.
pub struct Outgoing {
    pub packet: Packet,
    pub to: SocketAddr,
}

impl Outgoing {
    fn new(packet: Packet, to: SocketAddr) -> Self {
        Self { packet, to }
    }
}

/// All per-node state, owned exclusively by the task running [`Node::run`].
pub struct Node {
    pub state: NodeState,
    pub store: Store,
    pub cache: Option<Store>,
    pub routes: RoutingTable,
    pub socket: UdpSocket,
    debug: bool,
}

impl Node {
    pub fn new(state: NodeState, num_routes: usize, cache_enabled: bool, debug: bool, socket: UdpSocket) -> Self {
        let my_info = state.my_info;
        Self {
            state,
            store: Store::new(),
            cache: cache_enabled.then(Store::new),
            routes: RoutingTable::new(num_routes, my_info),
            socket,
            debug,
        }
    }

    fn add_route(&mut self, n: NodeInfo) {
        self.routes.add_route(n, self.state.succ_info, self.debug);
    }

    /// Assigns a tag/ttl to a freshly-built packet if it doesn't already
    /// carry one (§4.B `send`: "assigns a tag if none set").
    fn finalize(&mut self, mut p: Packet) -> Packet {
        if p.tag.is_none() {
            p.tag = Some(self.state.take_tag());
        }
        if p.ttl.is_none() {
            p.ttl = Some(crate::packet::DEFAULT_TTL);
        }
        p
    }

    /// The single entry point for everything arriving on the socket (§4.F
    /// "Receive loop"). `check()` failures are handled before dispatch;
    /// well-formed packets are routed either into the join-completion path
    /// (while `Joining`) or the normal per-type handlers.
    pub fn process_inbound(&mut self, packet: Packet, sender: SocketAddr) -> Vec<Outgoing> {
        if self.debug {
            debug!(?packet, %sender, "received packet");
        }

        let is_reply = matches!(
            packet.kind,
            PacketType::Success | PacketType::NoMatch | PacketType::Failure
        );

        if let Err(reason) = packet.check() {
            // §7: "Replies never cascade: a node never replies to a reply."
            // A malformed success/no match/failure is logged and dropped
            // rather than answered with a fresh failure.
            if is_reply {
                warn!(kind = ?packet.kind, %reason, "dropping malformed reply packet");
                return Vec::new();
            }
            let mut reply = Packet::new(PacketType::Failure);
            reply.reason = Some(reason);
            reply.tag = packet.tag;
            reply.ttl = packet.ttl;
            return vec![Outgoing::new(reply, sender)];
        }

        if packet.kind != PacketType::Leave {
            if let Some(info) = packet.sender_info {
                self.add_route(info);
            }
        }

        if self.state.phase == crate::ring::Phase::Joining {
            return self.handle_while_joining(packet);
        }

        match packet.kind {
            PacketType::Get => self.handle_get(&packet, sender),
            PacketType::Put => self.handle_put(&packet, sender),
            PacketType::Transfer => self.handle_xfer(&packet),
            PacketType::Join => self.handle_join(&packet),
            PacketType::Leave => self.handle_leave(&packet),
            PacketType::Update => self.handle_update(&packet),
            PacketType::Success | PacketType::NoMatch | PacketType::Failure => self.handle_reply(&packet, sender),
        }
    }

    /// §4.E "Join, seen from the joining node J", step 3.
    fn handle_while_joining(&mut self, packet: Packet) -> Vec<Outgoing> {
        match packet.kind {
            PacketType::Transfer => {
                self.handle_xfer(&packet);
                Vec::new()
            }
            PacketType::Success => {
                let hash_range = packet.hash_range.expect("checked: success requires hashRange");
                let succ_info = packet.succ_info.unwrap_or(self.state.my_info);
                let pred_info = packet.pred_info.unwrap_or(self.state.my_info);
                self.state
                    .complete_join(hash_range, succ_info, pred_info)
                    .expect("phase is Joining");
                self.add_route(succ_info);
                info!(?hash_range, "join completed");
                Vec::new()
            }
            other => {
                debug!(?other, "ignoring packet while joining");
                Vec::new()
            }
        }
    }

    /// §4.F `handleGet`.
    fn handle_get(&mut self, p: &Packet, sender: SocketAddr) -> Vec<Outgoing> {
        let key = p.key.as_ref().expect("checked: get requires key");
        let h = hash(key);
        let owned = self.state.owns(h);
        let cache_hit = !owned && self.cache.as_ref().is_some_and(|c| c.contains_key(key));

        if owned || cache_hit {
            let mut reply = if owned {
                match self.store.get(key).cloned() {
                    Some(val) => {
                        let mut r = Packet::new(PacketType::Success);
                        r.val = Some(val);
                        r
                    }
                    None => Packet::new(PacketType::NoMatch),
                }
            } else {
                let mut r = Packet::new(PacketType::Success);
                r.val = self.cache.as_ref().and_then(|c| c.get(key)).cloned();
                r
            };
            reply.key = Some(key.clone());
            reply.hash_range = Some(self.state.hash_range);
            reply.tag = p.tag;
            reply.ttl = p.ttl;
            reply.client_adr = p.client_adr;

            let dest = match p.relay_adr {
                Some(relay) => {
                    reply.sender_info = Some(self.state.my_info);
                    relay
                }
                None => sender,
            };
            vec![Outgoing::new(reply, dest)]
        } else {
            let mut fwd = p.clone();
            if fwd.relay_adr.is_none() {
                fwd.relay_adr = Some(self.state.my_info.address);
                fwd.client_adr = Some(sender);
            }
            self.forward(fwd, h)
        }
    }

    /// §4.F `handlePut`.
    fn handle_put(&mut self, p: &Packet, sender: SocketAddr) -> Vec<Outgoing> {
        let key = p.key.as_ref().expect("checked: put requires key");
        let h = hash(key);

        if self.state.owns(h) {
            self.store.put(key.clone(), p.val.clone());

            let mut reply = Packet::new(PacketType::Success);
            reply.key = Some(key.clone());
            reply.val = p.val.clone();
            reply.hash_range = Some(self.state.hash_range);
            reply.tag = p.tag;
            reply.ttl = p.ttl;

            let dest = p.client_adr.unwrap_or(sender);
            vec![Outgoing::new(reply, dest)]
        } else {
            let mut fwd = p.clone();
            if fwd.relay_adr.is_none() {
                fwd.relay_adr = Some(self.state.my_info.address);
                fwd.client_adr = Some(sender);
            }
            self.forward(fwd, h)
        }
    }

    /// §4.F `handleXfer`.
    fn handle_xfer(&mut self, p: &Packet) -> Vec<Outgoing> {
        let key = p.key.clone().expect("checked: transfer requires key");
        let val = p.val.clone();
        self.store.put(key, val);
        Vec::new()
    }

    /// §4.F `handleReply`, invoked at the relay that stamped `relayAdr`.
    fn handle_reply(&mut self, p: &Packet, sender: SocketAddr) -> Vec<Outgoing> {
        if let Some(range) = p.hash_range {
            self.add_route(NodeInfo::new(sender, range.low));
        }

        if let (Some(cache), Some(key), Some(val)) = (self.cache.as_mut(), &p.key, &p.val) {
            cache.put(key.clone(), Some(val.clone()));
        }

        let Some(client_adr) = p.client_adr else {
            // No client to answer (e.g. this relay is also the client);
            // nothing further to send.
            return Vec::new();
        };

        let mut final_reply = p.clone();
        final_reply.client_adr = None;
        final_reply.relay_adr = None;
        final_reply.sender_info = None;

        vec![Outgoing::new(final_reply, client_adr)]
    }

    /// §4.E "Join, seen from P".
    fn handle_join(&mut self, p: &Packet) -> Vec<Outgoing> {
        let joiner = p.sender_info.expect("checked: join requires senderInfo");
        let (joiner_info, joiner_range, old_succ) = self.state.split_for_join(joiner.address);
        self.add_route(joiner_info);

        let mut out = Vec::new();

        // Even on a solo ring, `old_succ` is `myInfo` (the one-node ring's
        // self-loop) and this update is addressed to ourselves — harmless,
        // and what step 4 describes unconditionally.
        let mut update_old_succ = Packet::new(PacketType::Update);
        update_old_succ.pred_info = Some(joiner_info);
        out.push(Outgoing::new(self.finalize(update_old_succ), old_succ.address));

        let transferred: Vec<(String, String)> = self
            .store
            .iter()
            .filter(|&(k, _)| hash(k) >= joiner_info.first_hash)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (k, _) in &transferred {
            self.store.remove(k);
        }
        for (k, v) in transferred {
            let mut xfer = Packet::new(PacketType::Transfer);
            xfer.key = Some(k);
            xfer.val = Some(v);
            xfer.sender_info = Some(self.state.my_info);
            out.push(Outgoing::new(self.finalize(xfer), joiner_info.address));
        }

        let mut success = Packet::new(PacketType::Success);
        success.pred_info = Some(self.state.my_info);
        success.succ_info = Some(old_succ);
        success.hash_range = Some(joiner_range);
        out.push(Outgoing::new(self.finalize(success), joiner_info.address));

        out
    }

    /// §4.E "Forwarding of leave".
    fn handle_leave(&mut self, p: &Packet) -> Vec<Outgoing> {
        let sender_info = p.sender_info.expect("checked: leave requires senderInfo");
        if self.state.is_own_leave(sender_info) {
            self.state.stop_flag = true;
            info!("leave packet circled back");
            Vec::new()
        } else {
            self.routes.remove_route(sender_info.address, self.debug);
            vec![Outgoing::new(p.clone(), self.state.succ_info.address)]
        }
    }

    /// §4.E "Update".
    fn handle_update(&mut self, p: &Packet) -> Vec<Outgoing> {
        self.state.apply_update(p.pred_info, p.succ_info, p.hash_range);
        if let Some(succ) = p.succ_info {
            self.add_route(succ);
        }
        Vec::new()
    }

    /// §4.F `forward`.
    fn forward(&mut self, mut p: Packet, h: u32) -> Vec<Outgoing> {
        let ttl = p.ttl_or_default();
        if ttl == 0 {
            let Some(client_adr) = p.client_adr else {
                return Vec::new();
            };
            let mut failure = Packet::new(PacketType::Failure);
            failure.reason = Some("time to live expired".to_string());
            failure.tag = p.tag;
            failure.ttl = p.ttl;
            return vec![Outgoing::new(failure, client_adr)];
        }

        match self.routes.closest_to(h) {
            Some(next) => {
                p.ttl = Some(ttl - 1);
                vec![Outgoing::new(p, next.address)]
            }
            None => Vec::new(),
        }
    }

    /// §4.E "Join, seen from the joining node J", step 2: send the initial
    /// join request to the predecessor address chosen at bootstrap.
    pub async fn send_join(&mut self) {
        let mut join = Packet::new(PacketType::Join);
        join.sender_info = Some(self.state.my_info);
        join.pred_info = Some(self.state.pred_info);
        let join = self.finalize(join);
        let dest = self.state.pred_info.address;
        self.send(&Outgoing::new(join, dest)).await;
    }

    /// §4.E "Leave, seen from leaving node X", steps 1–2: sends `leave` to
    /// the successor and flips into the `Leaving` phase. The caller must
    /// keep running [`Node::process_inbound`] until `state.stop_flag` is
    /// set, then call [`Node::finish_leave`].
    pub fn start_leave(&mut self) -> Outgoing {
        self.state.begin_leave().expect("leave initiated only once");
        let mut leave = Packet::new(PacketType::Leave);
        leave.sender_info = Some(self.state.my_info);
        let leave = self.finalize(leave);
        Outgoing::new(leave, self.state.succ_info.address)
    }

    /// §4.E "Leave", steps 3–6, run once `stop_flag` is set.
    pub fn finish_leave(&mut self) -> Vec<Outgoing> {
        let pred = self.state.pred_info;
        let succ = self.state.succ_info;
        let absorbed = self.state.range_absorbed_by_predecessor();

        let entries: Vec<(String, String)> = self
            .store
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut out = Vec::new();
        for (k, v) in entries {
            let mut xfer = Packet::new(PacketType::Transfer);
            xfer.key = Some(k);
            xfer.val = Some(v);
            xfer.sender_info = Some(self.state.my_info);
            out.push(Outgoing::new(self.finalize(xfer), pred.address));
        }

        let mut update_pred = Packet::new(PacketType::Update);
        update_pred.succ_info = Some(succ);
        update_pred.hash_range = Some(absorbed);
        out.push(Outgoing::new(self.finalize(update_pred), pred.address));

        let mut update_succ = Packet::new(PacketType::Update);
        update_succ.pred_info = Some(pred);
        out.push(Outgoing::new(self.finalize(update_succ), succ.address));

        self.store.clear();
        if let Some(cache) = self.cache.as_mut() {
            cache.clear();
        }
        self.routes.clear();

        out
    }

    /// Encodes and sends `out.packet` to `out.to`, logging (never failing)
    /// on a transport error (§7 "Transient send failures").
    async fn send(&self, out: &Outgoing) {
        let payload = out.packet.encode();
        if let Err(e) = self.socket.send_to(payload.as_bytes(), out.to).await {
            warn!(to = %out.to, error = %e, "failed to send packet");
        }
    }

    async fn send_all(&self, outs: Vec<Outgoing>) {
        for out in &outs {
            self.send(out).await;
        }
    }

    /// The dispatcher's main loop (§5 "single-threaded cooperative on a UDP
    /// receive loop"): merges socket reads with a one-shot shutdown signal
    /// so `leave()` runs on the same task that owns all node state,
    /// eliminating the need for the source's `stopFlag` busy-wait and any
    /// locking (§9).
    pub async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        let mut buf = [0u8; 4096];
        let mut leave_sent = false;

        loop {
            if leave_sent && self.state.stop_flag {
                let outs = self.finish_leave();
                self.send_all(outs).await;
                info!("leave complete, shutting down");
                return;
            }

            tokio::select! {
                biased;

                _ = &mut shutdown, if !leave_sent => {
                    info!("shutdown requested, initiating leave");
                    let out = self.start_leave();
                    self.send(&out).await;
                    leave_sent = true;
                }

                recv = self.socket.recv_from(&mut buf) => {
                    match recv {
                        Ok((len, sender)) => match Packet::decode(&buf[..len]) {
                            Ok(packet) => {
                                let outs = self.process_inbound(packet, sender);
                                self.send_all(outs).await;
                            }
                            Err(e) => warn!(%sender, error = %e, "dropping malformed packet"),
                        },
                        Err(e) => warn!(error = %e, "transport error on recv"),
                    }
                }
            }
        }
    }
}
