//! Dataplane port adapter
//!
//! Wraps an external injection/capture transport behind "send on port" and
//! "read frames arriving on ports within a window".

use async_trait::async_trait;
use bytes::Bytes;
use netcheck_common::PortId;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Injection/capture capability the harness drives
#[async_trait]
pub trait DataplaneTransport: Send + Sync {
    /// Submit a frame to the local transmit path of `port`
    async fn send(&self, port: PortId, frame: Bytes) -> io::Result<()>;

    /// Drop every frame captured so far
    async fn flush(&self) -> io::Result<()>;

    /// Collect every frame arriving on any port during `window`
    async fn recv_all(&self, window: Duration) -> io::Result<HashMap<PortId, Vec<Bytes>>>;
}

/// Shared receive buffer for transports that capture in the background
#[derive(Clone, Default)]
pub struct CaptureQueue {
    frames: Arc<Mutex<Vec<(PortId, Bytes)>>>,
}

impl CaptureQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, port: PortId, frame: Bytes) {
        self.frames.lock().push((port, frame));
    }

    pub fn clear(&self) {
        self.frames.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take everything captured so far, grouped by port in arrival order
    pub fn drain(&self) -> HashMap<PortId, Vec<Bytes>> {
        let frames = std::mem::take(&mut *self.frames.lock());
        let mut by_port: HashMap<PortId, Vec<Bytes>> = HashMap::new();
        for (port, frame) in frames {
            by_port.entry(port).or_default().push(frame);
        }
        by_port
    }
}

/// A frame seen during observation. Arrival is known to within the poll
/// slice `[after, by]` it was collected in.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub port: PortId,
    pub after: Instant,
    pub by: Instant,
    pub data: Bytes,
}

/// Frames collected over one observation
#[derive(Debug, Clone, Default)]
pub struct Observation {
    frames: Vec<CapturedFrame>,
}

impl Observation {
    pub fn frames(&self) -> &[CapturedFrame] {
        &self.frames
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn on_port(&self, port: PortId) -> impl Iterator<Item = &CapturedFrame> {
        self.frames.iter().filter(move |f| f.port == port)
    }

    /// Frames on `port` whose collection slice overlaps `[from, until]`
    pub fn within(&self, port: PortId, from: Instant, until: Instant) -> Vec<&Bytes> {
        self.on_port(port)
            .filter(|f| f.by >= from && f.after <= until)
            .map(|f| &f.data)
            .collect()
    }

    /// Frames grouped per port, ignoring timing
    pub fn by_port(&self) -> HashMap<PortId, Vec<Bytes>> {
        let mut map: HashMap<PortId, Vec<Bytes>> = HashMap::new();
        for f in &self.frames {
            map.entry(f.port).or_default().push(f.data.clone());
        }
        map
    }
}

/// Adapter the case engine uses to reach the dataplane
#[derive(Clone)]
pub struct PortAdapter {
    transport: Arc<dyn DataplaneTransport>,
    poll_interval: Duration,
}

impl PortAdapter {
    pub fn new(transport: Arc<dyn DataplaneTransport>) -> Self {
        Self { transport, poll_interval: Duration::from_millis(50) }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Fire-and-forget: success means the frame was handed to the transmit path
    pub async fn send(&self, port: PortId, frame: Bytes) -> io::Result<()> {
        debug!(%port, len = frame.len(), "sending frame");
        self.transport.send(port, frame).await
    }

    /// Clear the incoming-frame buffer. Idempotent.
    pub async fn flush(&self) -> io::Result<()> {
        trace!("flushing capture buffer");
        self.transport.flush().await
    }

    /// Collect every frame arriving on `ports` for the full `window`
    pub async fn observe(&self, ports: &BTreeSet<PortId>, window: Duration) -> io::Result<Observation> {
        let deadline = Instant::now() + window;
        self.observe_until(ports, deadline, |_| false).await
    }

    /// Collect frames on `ports` until `deadline`, or earlier once `done`
    /// reports that the observation so far is conclusive.
    pub async fn observe_until<F>(
        &self,
        ports: &BTreeSet<PortId>,
        deadline: Instant,
        mut done: F,
    ) -> io::Result<Observation>
    where
        F: FnMut(&Observation) -> bool,
    {
        let mut observation = Observation::default();

        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let slice = self.poll_interval.min(deadline - now);

            let received = self.transport.recv_all(slice).await?;
            let by = Instant::now();
            for (port, frames) in received {
                if !ports.contains(&port) {
                    continue;
                }
                for data in frames {
                    trace!(%port, frame = %netcheck_common::describe(&data), "captured");
                    observation.frames.push(CapturedFrame { port, after: now, by, data });
                }
            }

            if done(&observation) {
                debug!("observation satisfied early");
                break;
            }
        }

        Ok(observation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimSwitch;
    use netcheck_common::{build_frame, FrameSpec};

    fn ports(ids: &[u16]) -> BTreeSet<PortId> {
        ids.iter().copied().map(PortId::new).collect()
    }

    #[test]
    fn test_capture_queue_groups_by_port() {
        let queue = CaptureQueue::new();
        queue.push(PortId::new(1), Bytes::from_static(b"a"));
        queue.push(PortId::new(0), Bytes::from_static(b"b"));
        queue.push(PortId::new(1), Bytes::from_static(b"c"));

        let drained = queue.drain();
        assert_eq!(drained[&PortId::new(1)], vec![Bytes::from_static(b"a"), Bytes::from_static(b"c")]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_flush_is_idempotent() {
        let switch = Arc::new(SimSwitch::new([0, 1]));
        let adapter = PortAdapter::new(switch.clone()).with_poll_interval(Duration::from_millis(10));
        let frame = build_frame(&FrameSpec::new().eth_dst("ff:ff:ff:ff:ff:ff").marker("STALE")).unwrap();
        adapter.send(PortId::new(0), frame).await.unwrap();

        adapter.flush().await.unwrap();
        let once = adapter.observe(&ports(&[0, 1]), Duration::from_millis(30)).await.unwrap();

        adapter.send(PortId::new(0), build_frame(&FrameSpec::new().marker("STALE")).unwrap()).await.unwrap();
        adapter.flush().await.unwrap();
        adapter.flush().await.unwrap();
        let twice = adapter.observe(&ports(&[0, 1]), Duration::from_millis(30)).await.unwrap();

        assert!(once.is_empty());
        assert!(twice.is_empty());
    }

    #[tokio::test]
    async fn test_observe_returns_empty_when_nothing_arrives() {
        let switch = Arc::new(SimSwitch::new([0, 1]));
        let adapter = PortAdapter::new(switch).with_poll_interval(Duration::from_millis(10));
        let obs = adapter.observe(&ports(&[1]), Duration::from_millis(25)).await.unwrap();
        assert!(obs.is_empty());
    }

    #[tokio::test]
    async fn test_observe_until_stops_early() {
        let switch = Arc::new(SimSwitch::new([0, 1]));
        let adapter = PortAdapter::new(switch).with_poll_interval(Duration::from_millis(10));
        let frame = build_frame(&FrameSpec::new().eth_dst("ff:ff:ff:ff:ff:ff").marker("EARLY")).unwrap();
        adapter.send(PortId::new(0), frame).await.unwrap();

        let start = Instant::now();
        let deadline = start + Duration::from_secs(5);
        let obs = adapter
            .observe_until(&ports(&[1]), deadline, |o| !o.is_empty())
            .await
            .unwrap();

        assert_eq!(obs.on_port(PortId::new(1)).count(), 1);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_observe_filters_unrequested_ports() {
        let switch = Arc::new(SimSwitch::new([0, 1, 2]));
        let adapter = PortAdapter::new(switch).with_poll_interval(Duration::from_millis(10));
        let frame = build_frame(&FrameSpec::new().eth_dst("ff:ff:ff:ff:ff:ff").marker("FLOOD")).unwrap();
        adapter.send(PortId::new(0), frame).await.unwrap();

        let obs = adapter.observe(&ports(&[2]), Duration::from_millis(30)).await.unwrap();
        let by_port = obs.by_port();
        assert_eq!(by_port.len(), 1);
        assert!(by_port.contains_key(&PortId::new(2)));
    }
}
