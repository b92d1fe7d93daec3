//! Shared CAN dispatcher: one hardware handle multiplexed between every protocol
//! instance in an orchestrator (design §3 Ownership, §5 Concurrency).

use super::frame::{CanFilter, CanFrame};
use crate::error::{Error, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// Opaque per-instance registration handle (design §5: "filter slots are allocated
/// per protocol instance via opaque handles").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DispatcherHandle(u32);

/// The raw hardware transport a [`CanDispatcher`] pumps frames through. Implemented
/// for a real `socketcan` socket in production and for an in-memory loopback bus in
/// tests (see `tests/` and the unit tests below).
pub trait CanTransport: Send {
    fn send_frame(&self, frame: &CanFrame) -> Result<()>;
    /// Non-blocking: returns `Ok(None)` rather than blocking if nothing is queued.
    fn try_recv_frame(&self) -> Result<Option<CanFrame>>;
}

/// Single-threaded cooperative dispatcher: `pump` drains everything currently
/// queued at the hardware and redistributes it to registered handles whose filter
/// matches; frames matching no handle are dropped (design §5).
pub struct CanDispatcher {
    transport: Box<dyn CanTransport>,
    filters: Mutex<HashMap<DispatcherHandle, CanFilter>>,
    queues: Mutex<HashMap<DispatcherHandle, VecDeque<CanFrame>>>,
    next_handle: AtomicU32,
}

impl CanDispatcher {
    pub fn new(transport: Box<dyn CanTransport>) -> Self {
        Self {
            transport,
            filters: Mutex::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
            next_handle: AtomicU32::new(1),
        }
    }

    pub fn register(&self, filter: CanFilter) -> DispatcherHandle {
        let handle = DispatcherHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.filters.lock().unwrap().insert(handle, filter);
        self.queues.lock().unwrap().insert(handle, VecDeque::new());
        handle
    }

    pub fn unregister(&self, handle: DispatcherHandle) {
        self.filters.lock().unwrap().remove(&handle);
        self.queues.lock().unwrap().remove(&handle);
    }

    pub fn send(&self, frame: CanFrame) -> Result<()> {
        self.transport.send_frame(&frame)
    }

    /// Drains every frame currently available at the hardware layer into the
    /// matching handles' receive queues. Frames matching no filter are discarded.
    pub fn pump(&self) -> Result<()> {
        loop {
            match self.transport.try_recv_frame()? {
                Some(frame) => self.distribute(frame),
                None => return Ok(()),
            }
        }
    }

    fn distribute(&self, frame: CanFrame) {
        let filters = self.filters.lock().unwrap();
        let mut queues = self.queues.lock().unwrap();
        for (handle, filter) in filters.iter() {
            if filter.matches(&frame) {
                if let Some(queue) = queues.get_mut(handle) {
                    queue.push_back(frame);
                }
            }
        }
    }

    /// Pumps the hardware, then pops the oldest queued frame for `handle`, if any.
    pub fn poll(&self, handle: DispatcherHandle) -> Result<Option<CanFrame>> {
        self.pump()?;
        Ok(self
            .queues
            .lock()
            .unwrap()
            .get_mut(&handle)
            .and_then(VecDeque::pop_front))
    }

    /// Clears `handle`'s receive queue without consuming it (design §5: broadcasts
    /// "drain every instance's receive queue on entry and exit").
    pub fn drain(&self, handle: DispatcherHandle) -> Result<()> {
        self.pump()?;
        if let Some(queue) = self.queues.lock().unwrap().get_mut(&handle) {
            queue.clear();
        }
        Ok(())
    }

    /// Clears every registered handle's queue.
    pub fn drain_all(&self) -> Result<()> {
        self.pump()?;
        for queue in self.queues.lock().unwrap().values_mut() {
            queue.clear();
        }
        Ok(())
    }

    /// Retargets `handle`'s filter, e.g. when a protocol is handed off to a
    /// legacy-routing dispatcher and back (design §4.3).
    pub fn reconfigure(&self, handle: DispatcherHandle, filter: CanFilter) -> Result<()> {
        let mut filters = self.filters.lock().unwrap();
        if !filters.contains_key(&handle) {
            return Err(Error::Config(
                "reconfigure called with an unregistered dispatcher handle".into(),
            ));
        }
        filters.insert(handle, filter);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct LoopbackTransport {
        inbox: StdMutex<VecDeque<CanFrame>>,
        sent: StdMutex<Vec<CanFrame>>,
    }

    impl LoopbackTransport {
        fn inject(&self, frame: CanFrame) {
            self.inbox.lock().unwrap().push_back(frame);
        }
    }

    impl CanTransport for LoopbackTransport {
        fn send_frame(&self, frame: &CanFrame) -> Result<()> {
            self.sent.lock().unwrap().push(*frame);
            Ok(())
        }

        fn try_recv_frame(&self) -> Result<Option<CanFrame>> {
            Ok(self.inbox.lock().unwrap().pop_front())
        }
    }

    #[test]
    fn frame_is_delivered_only_to_matching_handle() {
        let shared = std::sync::Arc::new(LoopbackTransport::default());
        let dispatcher = CanDispatcher::new(Box::new(ArcTransport(shared.clone())));

        let h1 = dispatcher.register(CanFilter { rx_id: 0x123 });
        let h2 = dispatcher.register(CanFilter { rx_id: 0x456 });

        shared.inject(CanFrame::new(0x123, false, &[1, 2, 3]));

        assert!(dispatcher.poll(h1).unwrap().is_some());
        assert!(dispatcher.poll(h2).unwrap().is_none());
    }

    #[test]
    fn wildcard_filter_matches_any_id() {
        let shared = std::sync::Arc::new(LoopbackTransport::default());
        let dispatcher = CanDispatcher::new(Box::new(ArcTransport(shared.clone())));
        let h = dispatcher.register(CanFilter {
            rx_id: super::super::frame::RX_ID_WILDCARD,
        });
        shared.inject(CanFrame::new(0xABC, true, &[9]));
        assert!(dispatcher.poll(h).unwrap().is_some());
    }

    #[test]
    fn drain_clears_queue_without_consuming_caller_view() {
        let shared = std::sync::Arc::new(LoopbackTransport::default());
        let dispatcher = CanDispatcher::new(Box::new(ArcTransport(shared.clone())));
        let h = dispatcher.register(CanFilter { rx_id: 0x10 });
        shared.inject(CanFrame::new(0x10, false, &[1]));
        dispatcher.drain(h).unwrap();
        assert!(dispatcher.poll(h).unwrap().is_none());
    }

    struct ArcTransport(std::sync::Arc<LoopbackTransport>);
    impl CanTransport for ArcTransport {
        fn send_frame(&self, frame: &CanFrame) -> Result<()> {
            self.0.send_frame(frame)
        }
        fn try_recv_frame(&self) -> Result<Option<CanFrame>> {
            self.0.try_recv_frame()
        }
    }
}
