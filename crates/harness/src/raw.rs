//! AF_PACKET dataplane transport for live labs
//!
//! One raw socket per topology port, bound to the interface named in the
//! port map. A reader task per socket feeds a shared [`CaptureQueue`];
//! frames the host itself transmitted are discarded so a port never
//! observes its own injections.

use async_trait::async_trait;
use bytes::Bytes;
use netcheck_common::frame::ETH_MAX_LEN;
use netcheck_common::{PortId, Topology};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::collections::HashMap;
use std::io;
use std::mem::MaybeUninit;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dataplane::{CaptureQueue, DataplaneTransport};
use crate::error::{HarnessError, HarnessResult};

/// Consecutive receive errors before a reader gives up on its socket
const MAX_RECV_ERRORS: u32 = 8;
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(50);

pub struct RawSocketTransport {
    sockets: HashMap<PortId, Arc<AsyncFd<Socket>>>,
    rx: CaptureQueue,
    readers: Vec<JoinHandle<()>>,
}

impl RawSocketTransport {
    /// Open and bind a socket for every port. Requires CAP_NET_RAW and a
    /// running tokio runtime.
    pub fn open(topology: &Topology) -> HarnessResult<Self> {
        let mut bindings = Vec::new();
        for port in topology.port_ids() {
            let interface = topology.interface_for(port).ok_or_else(|| {
                HarnessError::Setup(format!("port {} has no interface binding", port))
            })?;
            bindings.push((port, interface.to_string()));
        }

        let rx = CaptureQueue::new();
        let mut sockets = HashMap::new();
        let mut readers = Vec::new();

        for (port, interface) in bindings {
            let ifindex = nix::net::if_::if_nametoindex(interface.as_str())
                .map_err(|e| HarnessError::Setup(format!("interface {}: {}", interface, e)))?;

            let socket = Socket::new(
                Domain::PACKET,
                Type::RAW,
                Some(Protocol::from(i32::from((libc::ETH_P_ALL as u16).to_be()))),
            )?;
            socket.bind(&link_addr(ifindex))?;
            socket.set_nonblocking(true)?;

            let fd = Arc::new(AsyncFd::with_interest(socket, Interest::READABLE | Interest::WRITABLE)?);
            info!(%port, %interface, ifindex, "raw socket bound");

            readers.push(tokio::spawn(read_loop(port, fd.clone(), rx.clone())));
            sockets.insert(port, fd);
        }

        Ok(Self { sockets, rx, readers })
    }
}

impl Drop for RawSocketTransport {
    fn drop(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
    }
}

#[async_trait]
impl DataplaneTransport for RawSocketTransport {
    async fn send(&self, port: PortId, frame: Bytes) -> io::Result<()> {
        let fd = self
            .sockets
            .get(&port)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no socket for port {}", port)))?;

        loop {
            let mut guard = fd.writable().await?;
            match guard.try_io(|inner| inner.get_ref().send(&frame)) {
                Ok(result) => return result.map(|_| ()),
                Err(_would_block) => continue,
            }
        }
    }

    async fn flush(&self) -> io::Result<()> {
        tokio::task::yield_now().await;
        self.rx.clear();
        Ok(())
    }

    async fn recv_all(&self, window: Duration) -> io::Result<HashMap<PortId, Vec<Bytes>>> {
        tokio::time::sleep(window).await;
        Ok(self.rx.drain())
    }
}

async fn read_loop(port: PortId, fd: Arc<AsyncFd<Socket>>, rx: CaptureQueue) {
    let mut buf = [MaybeUninit::<u8>::uninit(); ETH_MAX_LEN];
    let mut errors = 0;

    loop {
        let mut guard = match fd.readable().await {
            Ok(guard) => guard,
            Err(e) => {
                warn!(%port, "socket no longer readable: {}", e);
                return;
            }
        };

        match guard.try_io(|inner| inner.get_ref().recv_from(&mut buf)) {
            Ok(Ok((len, addr))) => {
                errors = 0;
                if is_outgoing(&addr) {
                    continue;
                }
                // SAFETY: the kernel initialized the first `len` bytes
                let data = unsafe { std::slice::from_raw_parts(buf.as_ptr().cast::<u8>(), len) };
                debug!(%port, len, "frame received");
                rx.push(port, Bytes::copy_from_slice(data));
            }
            Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
            Ok(Err(e)) => {
                errors += 1;
                let Some(delay) = recv_backoff(errors) else {
                    warn!(%port, "receive error: {}; giving up after {} in a row", e, errors);
                    return;
                };
                warn!(%port, "receive error: {}", e);
                guard.clear_ready();
                drop(guard);
                tokio::time::sleep(delay).await;
            }
            Err(_would_block) => continue,
        }
    }
}

/// Delay before the next read after `errors` consecutive failures, or
/// `None` once the socket should be abandoned
fn recv_backoff(errors: u32) -> Option<Duration> {
    (errors < MAX_RECV_ERRORS).then(|| RECV_ERROR_BACKOFF * errors)
}

fn link_addr(ifindex: u32) -> SockAddr {
    // SAFETY: sockaddr_storage is valid when zeroed and large enough for sockaddr_ll
    unsafe {
        let mut storage: libc::sockaddr_storage = std::mem::zeroed();
        let ll = &mut *(&mut storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr_ll>();
        ll.sll_family = libc::AF_PACKET as u16;
        ll.sll_protocol = (libc::ETH_P_ALL as u16).to_be();
        ll.sll_ifindex = ifindex as i32;
        SockAddr::new(storage, std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t)
    }
}

fn is_outgoing(addr: &SockAddr) -> bool {
    if addr.family() != libc::AF_PACKET as libc::sa_family_t {
        return false;
    }
    // SAFETY: family checked above, storage holds a sockaddr_ll
    let ll = unsafe { &*addr.as_ptr().cast::<libc::sockaddr_ll>() };
    ll.sll_pkttype == libc::PACKET_OUTGOING as u8
}
