//! The message pump: request/reply traffic over the slot arrays, with
//! re-entrant servicing of incoming calls while a reply is pending.
//!
//! Each side runs one pump over the same region. A call claims a free slot
//! in its outbound array, publishes it and then spins on the reply; while
//! spinning it keeps servicing the *inbound* array, because the peer may
//! legitimately call back before answering (a plugin asking for the time
//! while handling a dispatch, for instance). Refusing to service inbound
//! traffic here would deadlock both processes.

use crate::error::{BridgeError, Result};
use crate::protocol::aux_name;
use crate::shm::{AuxSegment, EventWord, SharedRegion, MSG_SLOTS, WAIT_POLL};
use crate::slot::{Slot, SlotStatus};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Host,
    Bridge,
}

impl Side {
    fn tag(self) -> &'static str {
        match self {
            Side::Host => "h",
            Side::Bridge => "b",
        }
    }
}

/// Services one raw inbound request and produces the raw reply. Decoding
/// failures are the handler's to report: it receives whatever bytes were in
/// the slot (possibly empty if the payload could not be read at all) and
/// must always encode *some* reply.
pub trait InboundHandler: Sync {
    fn handle(&self, request: &[u8]) -> Vec<u8>;
}

pub struct MessagePump {
    region: Arc<SharedRegion>,
    side: Side,
    /// Serializes outbound slot claims among this process's threads. The
    /// status CAS alone orders against the peer, not against siblings that
    /// all see the same slot as Free.
    send_lock: Mutex<()>,
    aux_seq: AtomicU64,
    serviced: AtomicU64,
    /// Reply aux segments parked until the peer releases the slot. Unlinking
    /// earlier would race the peer's open-by-name.
    retired_aux: Mutex<Vec<(usize, AuxSegment)>>,
}

impl MessagePump {
    pub fn new(region: Arc<SharedRegion>, side: Side) -> Self {
        Self {
            region,
            side,
            send_lock: Mutex::new(()),
            aux_seq: AtomicU64::new(0),
            serviced: AtomicU64::new(0),
            retired_aux: Mutex::new(Vec::new()),
        }
    }

    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.region
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// Requests served so far (each inbound slot claim counts once).
    pub fn serviced(&self) -> u64 {
        self.serviced.load(Ordering::Relaxed)
    }

    fn outbound(&self) -> &[Slot; MSG_SLOTS] {
        match self.side {
            Side::Host => &self.region.header().to_bridge,
            Side::Bridge => &self.region.header().to_host,
        }
    }

    fn inbound(&self) -> &[Slot; MSG_SLOTS] {
        match self.side {
            Side::Host => &self.region.header().to_host,
            Side::Bridge => &self.region.header().to_bridge,
        }
    }

    fn outbound_event(&self) -> &EventWord {
        match self.side {
            Side::Host => &self.region.header().msg_to_bridge,
            Side::Bridge => &self.region.header().msg_to_host,
        }
    }

    fn inbound_event(&self) -> &EventWord {
        match self.side {
            Side::Host => &self.region.header().msg_to_host,
            Side::Bridge => &self.region.header().msg_to_bridge,
        }
    }

    fn inbound_acks(&self) -> &[EventWord; MSG_SLOTS] {
        // Acks for requests the *peer* sent to us.
        match self.side {
            Side::Host => &self.region.header().ack_to_host,
            Side::Bridge => &self.region.header().ack_to_bridge,
        }
    }

    fn outbound_acks(&self) -> &[EventWord; MSG_SLOTS] {
        // Acks for requests we sent; raised by the peer's servicer.
        match self.side {
            Side::Host => &self.region.header().ack_to_bridge,
            Side::Bridge => &self.region.header().ack_to_host,
        }
    }

    /// Block on the inbound doorbell until `deadline`. Returns true if it
    /// fired. The doorbell collapses multiple raises, so callers must still
    /// scan with [`service_one`](Self::service_one) before waiting again.
    pub fn wait_inbound(&self, deadline: Instant) -> bool {
        self.inbound_event().wait(Some(deadline), || true)
    }

    fn next_aux_name(&self) -> String {
        aux_name(
            self.region.name(),
            self.side.tag(),
            self.aux_seq.fetch_add(1, Ordering::Relaxed),
        )
    }

    fn peer_gone(&self) -> BridgeError {
        match self.side {
            Side::Host => BridgeError::ShutDown,
            Side::Bridge => BridgeError::HostGone,
        }
    }

    /// Send a request and block for the reply. While waiting, inbound
    /// requests are serviced through `handler` if one is supplied. `alive`
    /// is polled between spins; when it turns false the wait aborts.
    pub fn send<Req, Rep>(
        &self,
        message: &Req,
        handler: Option<&dyn InboundHandler>,
        alive: impl Fn() -> bool,
    ) -> Result<Rep>
    where
        Req: Serialize,
        Rep: DeserializeOwned,
    {
        let (index, _request_aux) = self.claim_and_publish(message, handler, &alive)?;
        let slot = &self.outbound()[index];

        loop {
            if slot.transition(SlotStatus::Done, SlotStatus::Delivered) {
                let reply = slot.read_message::<Rep>();
                slot.release();
                return reply;
            }
            let mut worked = false;
            if let Some(h) = handler {
                worked = self.service_one(h);
            }
            if !alive() {
                // Abandon the call; the cell is reclaimed wholesale when the
                // region goes away.
                return Err(self.peer_gone());
            }
            if !worked {
                // Short deadline so inbound traffic and liveness stay
                // checked even when the reply is slow.
                self.outbound_acks()[index].wait(Some(Instant::now() + WAIT_POLL), &alive);
            }
        }
    }

    fn claim_and_publish<Req: Serialize>(
        &self,
        message: &Req,
        handler: Option<&dyn InboundHandler>,
        alive: &impl Fn() -> bool,
    ) -> Result<(usize, Option<AuxSegment>)> {
        loop {
            {
                let _guard = self.send_lock.lock();
                for (index, slot) in self.outbound().iter().enumerate() {
                    if slot.status() != SlotStatus::Free as u32 {
                        continue;
                    }
                    // A stale ack from the slot's previous tenant must not
                    // wake this call early.
                    self.outbound_acks()[index].reset();
                    let aux = slot.write_message(message, || self.next_aux_name())?;
                    if !slot.transition(SlotStatus::Free, SlotStatus::Sent) {
                        // Cannot happen while we hold the send lock; bail
                        // loudly rather than corrupt the cell.
                        return Err(BridgeError::Protocol(
                            "Outbound slot changed state under the send lock".to_string(),
                        ));
                    }
                    self.outbound_event().raise();
                    return Ok((index, aux));
                }
            }
            // All slots in flight. Keep the peer serviced while we wait for
            // one to come back.
            if !alive() {
                return Err(self.peer_gone());
            }
            let mut worked = false;
            if let Some(h) = handler {
                worked = self.service_one(h);
            }
            if !worked {
                std::thread::sleep(WAIT_POLL);
            }
        }
    }

    /// Claim and answer at most one pending inbound request. Returns true if
    /// a request was served.
    pub fn service_one(&self, handler: &dyn InboundHandler) -> bool {
        self.sweep_retired_aux();

        for (index, slot) in self.inbound().iter().enumerate() {
            if !slot.transition(SlotStatus::Sent, SlotStatus::Received) {
                continue;
            }
            self.serviced.fetch_add(1, Ordering::Relaxed);

            let request = match slot.read_payload() {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Failed to read inbound payload: {}", e);
                    Vec::new()
                }
            };
            let reply = handler.handle(&request);

            match slot.write_payload(&reply, || self.next_aux_name()) {
                Ok(Some(segment)) => {
                    self.retired_aux.lock().push((index, segment));
                }
                Ok(None) => {}
                Err(e) => {
                    // Peer gets a zero-length reply and reports the decode
                    // failure on its side.
                    warn!("Failed to write reply payload: {}", e);
                    let _ = slot.write_payload(&[], String::new);
                }
            }
            if !slot.transition(SlotStatus::Received, SlotStatus::Done) {
                warn!("Inbound slot {} left Received state unexpectedly", index);
            }
            self.inbound_acks()[index].raise();
            return true;
        }
        false
    }

    /// Drop reply aux segments whose slot the peer has released.
    fn sweep_retired_aux(&self) {
        let mut retired = self.retired_aux.lock();
        if retired.is_empty() {
            return;
        }
        let inbound = self.inbound();
        retired.retain(|(index, _)| inbound[*index].status() != SlotStatus::Free as u32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{BridgeReply, ToBridge};
    use std::sync::atomic::AtomicBool;

    fn region_pair(name: &str) -> (Arc<SharedRegion>, Arc<SharedRegion>) {
        let region_name = format!("fxbridge-test-engine-{}-{}", name, std::process::id());
        let host = SharedRegion::create(region_name.clone(), std::process::id(), 0).unwrap();
        let bridge = SharedRegion::open(region_name).unwrap();
        (host, bridge)
    }

    struct Echo;

    impl InboundHandler for Echo {
        fn handle(&self, request: &[u8]) -> Vec<u8> {
            let msg: ToBridge = bincode::deserialize(request).unwrap();
            let reply = match msg {
                ToBridge::GetParameter { index } => BridgeReply::ParameterValue {
                    value: index as f32,
                },
                ToBridge::Dispatch { data, .. } => BridgeReply::Dispatched {
                    result: 1,
                    data,
                },
                other => BridgeReply::Error {
                    message: format!("Unexpected request: {:?}", other),
                },
            };
            bincode::serialize(&reply).unwrap()
        }
    }

    #[test]
    fn test_round_trip_between_threads() {
        let (host_region, bridge_region) = region_pair("roundtrip");
        let host = MessagePump::new(host_region, Side::Host);
        let bridge = Arc::new(MessagePump::new(bridge_region, Side::Bridge));

        let stop = Arc::new(AtomicBool::new(false));
        let server = {
            let bridge = Arc::clone(&bridge);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    if !bridge.service_one(&Echo) {
                        std::thread::sleep(WAIT_POLL);
                    }
                }
            })
        };

        for i in 0..32u32 {
            let reply: BridgeReply = host
                .send(&ToBridge::GetParameter { index: i }, None, || true)
                .unwrap();
            match reply {
                BridgeReply::ParameterValue { value } => assert_eq!(value, i as f32),
                other => panic!("Unexpected reply: {:?}", other),
            }
        }

        stop.store(true, Ordering::Relaxed);
        server.join().unwrap();
        assert_eq!(bridge.serviced(), 32);
    }

    #[test]
    fn test_signal_words_track_traffic() {
        let (host_region, bridge_region) = region_pair("signals");
        let host = MessagePump::new(Arc::clone(&host_region), Side::Host);
        let bridge = MessagePump::new(bridge_region, Side::Bridge);
        let header = host_region.header();

        let message = ToBridge::GetParameter { index: 3 };
        let (index, _aux) = host.claim_and_publish(&message, None, &|| true).unwrap();
        assert!(header.msg_to_bridge.is_raised());
        assert!(bridge.wait_inbound(Instant::now()));
        assert!(!header.msg_to_bridge.is_raised());
        assert!(!bridge.wait_inbound(Instant::now()));

        assert!(bridge.service_one(&Echo));
        assert!(header.ack_to_bridge[index].is_raised());

        // Sender pickup: reply readable, slot back to Free.
        let slot = &header.to_bridge[index];
        assert!(slot.transition(SlotStatus::Done, SlotStatus::Delivered));
        let reply: BridgeReply = slot.read_message().unwrap();
        match reply {
            BridgeReply::ParameterValue { value } => assert_eq!(value, 3.0),
            other => panic!("Unexpected reply: {:?}", other),
        }
        slot.release();

        // The next claim of the same slot clears the stale ack.
        let (again, _aux) = host.claim_and_publish(&message, None, &|| true).unwrap();
        assert_eq!(again, index);
        assert!(!header.ack_to_bridge[index].is_raised());
    }

    #[test]
    fn test_oversized_payload_round_trip() {
        let (host_region, bridge_region) = region_pair("aux");
        let host = MessagePump::new(host_region, Side::Host);
        let bridge = Arc::new(MessagePump::new(bridge_region, Side::Bridge));

        let stop = Arc::new(AtomicBool::new(false));
        let server = {
            let bridge = Arc::clone(&bridge);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    if !bridge.service_one(&Echo) {
                        std::thread::sleep(WAIT_POLL);
                    }
                }
            })
        };

        let blob = vec![0x42u8; 64 * 1024];
        let reply: BridgeReply = host
            .send(
                &ToBridge::Dispatch {
                    opcode: crate::protocol::Opcode::SetChunk,
                    index: 0,
                    value: 0,
                    opt: 0.0,
                    data: Some(blob.clone()),
                },
                None,
                || true,
            )
            .unwrap();
        match reply {
            BridgeReply::Dispatched { result, data } => {
                assert_eq!(result, 1);
                assert_eq!(data, Some(blob));
            }
            other => panic!("Unexpected reply: {:?}", other),
        }

        stop.store(true, Ordering::Relaxed);
        server.join().unwrap();
    }

    #[test]
    fn test_concurrent_producers_each_served_once() {
        let (host_region, bridge_region) = region_pair("concurrent");
        let host = Arc::new(MessagePump::new(host_region, Side::Host));
        let bridge = Arc::new(MessagePump::new(bridge_region, Side::Bridge));

        let stop = Arc::new(AtomicBool::new(false));
        let server = {
            let bridge = Arc::clone(&bridge);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    if !bridge.service_one(&Echo) {
                        std::thread::sleep(WAIT_POLL);
                    }
                }
            })
        };

        // More producers than slots, all hammering the same direction.
        let producers: Vec<_> = (0..12u32)
            .map(|p| {
                let host = Arc::clone(&host);
                std::thread::spawn(move || {
                    for i in 0..16u32 {
                        let index = p * 100 + i;
                        let reply: BridgeReply = host
                            .send(&ToBridge::GetParameter { index }, None, || true)
                            .unwrap();
                        match reply {
                            BridgeReply::ParameterValue { value } => {
                                assert_eq!(value, index as f32)
                            }
                            other => panic!("Unexpected reply: {:?}", other),
                        }
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        stop.store(true, Ordering::Relaxed);
        server.join().unwrap();
        // Every request claimed exactly once.
        assert_eq!(bridge.serviced(), 12 * 16);
    }

    /// A handler that calls back into its own pump mid-request: the waiting
    /// side must keep servicing while blocked on its reply.
    struct Reentrant {
        pump: Arc<MessagePump>,
    }

    impl InboundHandler for Reentrant {
        fn handle(&self, request: &[u8]) -> Vec<u8> {
            let msg: ToBridge = bincode::deserialize(request).unwrap();
            if let ToBridge::GetParameter { index } = msg {
                // Nested host call before answering.
                let nested: BridgeReply = self
                    .pump
                    .send(&ToBridge::GetParameter { index: index + 100 }, None, || {
                        true
                    })
                    .unwrap();
                let nested_value = match nested {
                    BridgeReply::ParameterValue { value } => value,
                    other => panic!("Unexpected nested reply: {:?}", other),
                };
                return bincode::serialize(&BridgeReply::ParameterValue {
                    value: nested_value + 1.0,
                })
                .unwrap();
            }
            bincode::serialize(&BridgeReply::Error {
                message: "Unexpected request".to_string(),
            })
            .unwrap()
        }
    }

    #[test]
    fn test_nested_call_while_waiting() {
        let (host_region, bridge_region) = region_pair("reentrant");
        let host = Arc::new(MessagePump::new(host_region, Side::Host));
        let bridge = Arc::new(MessagePump::new(bridge_region, Side::Bridge));

        // Bridge thread: serve one request, calling back mid-service.
        let server = {
            let bridge = Arc::clone(&bridge);
            std::thread::spawn(move || {
                let handler = Reentrant {
                    pump: Arc::clone(&bridge),
                };
                while !bridge.service_one(&handler) {
                    std::thread::sleep(WAIT_POLL);
                }
            })
        };

        // Host sends, and must answer the bridge's nested call (index + 100)
        // from inside its own wait loop.
        let reply: BridgeReply = host
            .send(&ToBridge::GetParameter { index: 5 }, Some(&Echo), || true)
            .unwrap();
        match reply {
            BridgeReply::ParameterValue { value } => assert_eq!(value, 106.0),
            other => panic!("Unexpected reply: {:?}", other),
        }

        server.join().unwrap();
        assert_eq!(host.serviced(), 1);
    }

    #[test]
    fn test_send_aborts_when_peer_dead() {
        let (host_region, _bridge_region) = region_pair("dead");
        let host = MessagePump::new(host_region, Side::Host);

        // Nobody services; alive flips false immediately after the publish.
        let polls = AtomicU64::new(0);
        let result: Result<BridgeReply> =
            host.send(&ToBridge::Close, None, || {
                polls.fetch_add(1, Ordering::Relaxed) < 3
            });
        assert!(matches!(result, Err(BridgeError::ShutDown)));
    }
}
