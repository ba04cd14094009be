//! Base interface: one inbound and one outbound SPSC slot queue plus the
//! unix-socket connection used to establish them.
//!
//! The listener carves both queues from its pool and ships the geometry (and
//! the pool fd) in its intro; the connecter maps the fd and adopts the
//! listener's geometry with the directions swapped. After the handshake both
//! sides only touch the shared memory; the socket is kept around solely to
//! detect peer death.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU8, Ordering};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{
    accept4, bind, connect, getsockopt, listen, socket, sockopt, AddressFamily, Backlog,
    ControlMessage, ControlMessageOwned, MsgFlags, SockFlag, SockType, UnixAddr,
};
use tracing::{debug, trace, warn};

use crate::intro::{ConnecterIntro, ListenerIntro, FLAG_SYNC, FLAG_SYNC_FORCE};
use crate::msgs::{MSG_SYNC, MSG_TERMINATE, OWN_CONSUMER, OWN_MASK, OWN_TYPE_OFFSET, TYPE_MASK};
use crate::shm::ShmPool;
use crate::{Error, Params, Result, SyncMode, PROTO_VERSION};

/// Connection establishment progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Ready,
    Pending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Closed,
    Listening,
    Connecting,
    AwaitHandshakeRxTx,
    AwaitHandshakeRx,
    AwaitHandshakeTx,
    Open,
}

/// One direction of slots carved out of the pool.
struct SlotArray {
    queue: *mut u8,
    pos: usize,
    elen: usize,
    nentries: usize,
}

impl SlotArray {
    fn empty() -> Self {
        SlotArray { queue: std::ptr::null_mut(), pos: 0, elen: 0, nentries: 0 }
    }

    fn slot(&self) -> *mut u8 {
        unsafe { self.queue.add(self.pos * self.elen) }
    }

    fn advance(&mut self) {
        self.pos = (self.pos + 1) % self.nentries;
    }
}

/// A received message. Must be handed back with [`BaseIf::done`] once
/// processed so the producer can reuse the slot.
pub struct InMsg {
    slot: *mut u8,
    elen: usize,
}

impl InMsg {
    pub fn msg_type(&self) -> u8 {
        own_type(self.slot).load(Ordering::Relaxed) & TYPE_MASK
    }

    pub fn timestamp(&self) -> u64 {
        let mut b = [0u8; 8];
        unsafe { std::ptr::copy_nonoverlapping(self.slot, b.as_mut_ptr(), 8) };
        u64::from_le_bytes(b)
    }

    pub fn payload(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(
                self.slot.add(crate::msgs::PAYLOAD_OFFSET),
                self.elen - crate::msgs::PAYLOAD_OFFSET,
            )
        }
    }
}

/// An allocated outbound slot. Fill the payload, then hand it to
/// [`BaseIf::send`], which publishes it with a release-store of the
/// own/type octet.
pub struct OutMsg {
    slot: *mut u8,
    elen: usize,
}

impl OutMsg {
    pub fn payload_mut(&mut self) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(
                self.slot.add(crate::msgs::PAYLOAD_OFFSET),
                self.elen - crate::msgs::PAYLOAD_OFFSET,
            )
        }
    }

    pub fn capacity(&self) -> usize {
        self.elen - crate::msgs::PAYLOAD_OFFSET
    }
}

fn own_type(slot: *mut u8) -> &'static AtomicU8 {
    // The octet lives in the shared mapping for the life of the process; it
    // is the only byte both sides access concurrently.
    unsafe { &*(slot.add(OWN_TYPE_OFFSET) as *const AtomicU8) }
}

pub struct BaseIf {
    params: Params,
    state: ConnState,
    listener: bool,
    sync: bool,

    inq: SlotArray,
    outq: SlotArray,
    in_timestamp: u64,
    out_timestamp: u64,

    listen_fd: Option<OwnedFd>,
    conn_fd: Option<OwnedFd>,

    /// Listener: fd + offsets of the pool the queues were carved from.
    /// Connecter: the mapped pool received during the handshake.
    shm_fd: RawFd,
    in_offset: usize,
    out_offset: usize,
    mapped_pool: Option<ShmPool>,
}

// Safety: the queue pointers target the shared pool; slot ownership is
// handed between processes through the own/type octet with acquire/release.
// A BaseIf itself is only ever driven by one thread.
unsafe impl Send for BaseIf {}

impl BaseIf {
    pub fn new(params: Params) -> Result<Self> {
        let may_sync = params.sync_mode != SyncMode::Disabled;
        if may_sync && params.link_latency < params.sync_interval {
            return Err(Error::LatencyBelowSyncInterval);
        }
        Ok(BaseIf {
            params,
            state: ConnState::Closed,
            listener: false,
            sync: false,
            inq: SlotArray::empty(),
            outq: SlotArray::empty(),
            in_timestamp: 0,
            out_timestamp: 0,
            listen_fd: None,
            conn_fd: None,
            shm_fd: -1,
            in_offset: 0,
            out_offset: 0,
            mapped_pool: None,
        })
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn sync_enabled(&self) -> bool {
        self.sync
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnState::Open
    }

    pub fn out_msg_len(&self) -> usize {
        self.outq.elen
    }

    /// Carve the queues from `pool`, bind the socket and start listening.
    /// Does not wait for a connecter. The pool must outlive this interface.
    pub fn listen(&mut self, pool: &mut ShmPool) -> Result<()> {
        let p = &self.params;

        self.in_offset = pool.carve(p.in_num_entries, p.in_entries_size)?;
        self.inq = SlotArray {
            queue: pool.at(self.in_offset),
            pos: 0,
            elen: p.in_entries_size,
            nentries: p.in_num_entries,
        };
        self.out_offset = pool.carve(p.out_num_entries, p.out_entries_size)?;
        self.outq = SlotArray {
            queue: pool.at(self.out_offset),
            pos: 0,
            elen: p.out_entries_size,
            nentries: p.out_num_entries,
        };
        self.shm_fd = pool.fd();

        let mut flags = SockFlag::empty();
        if !p.blocking_conn {
            flags |= SockFlag::SOCK_NONBLOCK;
        }
        let fd = socket(AddressFamily::Unix, SockType::Stream, flags, None)?;
        let addr = UnixAddr::new(p.sock_path.as_path())?;
        // a stale socket file from a previous run would fail the bind
        let _ = std::fs::remove_file(&p.sock_path);
        bind(fd.as_raw_fd(), &addr)?;
        listen(&fd, Backlog::new(5)?)?;

        debug!(path = %p.sock_path.display(), "listening");
        self.listen_fd = Some(fd);
        self.listener = true;
        self.state = ConnState::Listening;
        self.try_accept()?;
        Ok(())
    }

    fn try_accept(&mut self) -> Result<Progress> {
        let lfd = self.listen_fd.as_ref().expect("listening without fd");
        let mut flags = SockFlag::empty();
        if !self.params.blocking_conn {
            flags |= SockFlag::SOCK_NONBLOCK;
        }
        match accept4(lfd.as_raw_fd(), flags) {
            Ok(fd) => {
                self.conn_fd = Some(unsafe { OwnedFd::from_raw_fd(fd) });
                self.listen_fd = None;
                self.state = ConnState::AwaitHandshakeRxTx;
                debug!("peer connected");
                Ok(Progress::Ready)
            }
            Err(Errno::EAGAIN) => Ok(Progress::Pending),
            Err(e) => {
                self.listen_fd = None;
                self.state = ConnState::Closed;
                Err(e.into())
            }
        }
    }

    /// Initiate a connection to a listening peer. Asynchronous unless
    /// `blocking_conn` is set.
    pub fn connect(&mut self) -> Result<()> {
        let p = &self.params;
        self.listener = false;

        let mut flags = SockFlag::empty();
        if !p.blocking_conn {
            flags |= SockFlag::SOCK_NONBLOCK;
        }
        let fd = socket(AddressFamily::Unix, SockType::Stream, flags, None)?;
        let addr = UnixAddr::new(p.sock_path.as_path())?;

        match connect(fd.as_raw_fd(), &addr) {
            Ok(()) => self.state = ConnState::AwaitHandshakeRxTx,
            Err(Errno::EINPROGRESS) | Err(Errno::EAGAIN) => self.state = ConnState::Connecting,
            Err(e) => {
                self.state = ConnState::Closed;
                return Err(e.into());
            }
        }
        self.conn_fd = Some(fd);
        Ok(())
    }

    /// Drive connection establishment; `Ready` once the socket is connected
    /// (the intro exchange may still be outstanding).
    pub fn connected(&mut self) -> Result<Progress> {
        match self.state {
            ConnState::Closed => Err(Error::InvalidState("closed")),
            ConnState::Listening => self.try_accept(),
            ConnState::Connecting => {
                let fd = self.conn_fd.as_ref().expect("connecting without fd");
                let mut pfd = [PollFd::new(fd.as_fd(), PollFlags::POLLOUT)];
                let n = poll(&mut pfd, PollTimeout::ZERO)?;
                if n == 0 {
                    return Ok(Progress::Pending);
                }
                let err = getsockopt(fd, sockopt::SocketError)?;
                if err == 0 {
                    self.state = ConnState::AwaitHandshakeRxTx;
                    Ok(Progress::Ready)
                } else {
                    self.conn_fd = None;
                    self.state = ConnState::Closed;
                    Err(Errno::from_raw(err).into())
                }
            }
            _ => Ok(Progress::Ready),
        }
    }

    /// Fd to poll while waiting for connection or handshake progress, along
    /// with the events of interest.
    pub fn wait_fd(&self) -> Option<(RawFd, PollFlags)> {
        match self.state {
            ConnState::Listening => {
                self.listen_fd.as_ref().map(|f| (f.as_raw_fd(), PollFlags::POLLIN))
            }
            ConnState::Connecting => {
                self.conn_fd.as_ref().map(|f| (f.as_raw_fd(), PollFlags::POLLOUT))
            }
            ConnState::AwaitHandshakeRxTx | ConnState::AwaitHandshakeRx => {
                self.conn_fd.as_ref().map(|f| (f.as_raw_fd(), PollFlags::POLLIN))
            }
            _ => None,
        }
    }

    /// Send our intro, with `upper` appended as the upper-layer intro.
    /// Listeners attach the pool fd as ancillary data.
    pub fn intro_send(&mut self, upper: &[u8]) -> Result<()> {
        if self.state != ConnState::AwaitHandshakeRxTx && self.state != ConnState::AwaitHandshakeTx
        {
            return Err(Error::InvalidState("intro_send"));
        }
        let p = &self.params;
        let mut flags = 0;
        if p.sync_mode != SyncMode::Disabled {
            flags |= FLAG_SYNC;
            if p.sync_mode == SyncMode::Required {
                flags |= FLAG_SYNC_FORCE;
            }
        }

        let fd = self.conn_fd.as_ref().expect("handshake without fd").as_raw_fd();
        let sent = if self.listener {
            let intro = ListenerIntro {
                version: PROTO_VERSION,
                flags,
                l2c_offset: self.out_offset as u64,
                l2c_elen: self.outq.elen as u64,
                l2c_nentries: self.outq.nentries as u64,
                c2l_offset: self.in_offset as u64,
                c2l_elen: self.inq.elen as u64,
                c2l_nentries: self.inq.nentries as u64,
                upper_layer_proto: p.upper_layer_proto,
                upper_layer_intro_off: crate::intro::LISTENER_INTRO_LEN as u64,
            };
            let base = intro.encode();
            let iov = [std::io::IoSlice::new(&base), std::io::IoSlice::new(upper)];
            let fds = [self.shm_fd];
            let cmsg = [ControlMessage::ScmRights(&fds)];
            nix::sys::socket::sendmsg::<()>(fd, &iov, &cmsg, MsgFlags::empty(), None)?
        } else {
            let intro = ConnecterIntro {
                version: PROTO_VERSION,
                flags,
                upper_layer_proto: p.upper_layer_proto,
                upper_layer_intro_off: crate::intro::CONNECTER_INTRO_LEN as u64,
            };
            let base = intro.encode();
            let iov = [std::io::IoSlice::new(&base), std::io::IoSlice::new(upper)];
            nix::sys::socket::sendmsg::<()>(fd, &iov, &[], MsgFlags::empty(), None)?
        };

        let expected = upper.len()
            + if self.listener {
                crate::intro::LISTENER_INTRO_LEN
            } else {
                crate::intro::CONNECTER_INTRO_LEN
            };
        if sent != expected {
            return Err(Error::BadIntro);
        }

        self.state = match self.state {
            ConnState::AwaitHandshakeTx => ConnState::Open,
            ConnState::AwaitHandshakeRxTx => ConnState::AwaitHandshakeRx,
            _ => unreachable!(),
        };
        trace!(listener = self.listener, "intro sent");
        Ok(())
    }

    /// Receive the peer's intro. Returns `None` if it has not arrived yet.
    /// On success the upper-layer intro bytes are appended to `upper`, sync
    /// is negotiated, and (for connecters) the pool is mapped and the queue
    /// geometry adopted.
    pub fn intro_recv(&mut self, upper: &mut Vec<u8>) -> Result<Option<()>> {
        if self.state != ConnState::AwaitHandshakeRxTx && self.state != ConnState::AwaitHandshakeRx
        {
            return Err(Error::InvalidState("intro_recv"));
        }

        let fd = self.conn_fd.as_ref().expect("handshake without fd").as_raw_fd();
        let mut buf = [0u8; 2048];
        let mut iov = [std::io::IoSliceMut::new(&mut buf)];
        let mut cmsg_space = nix::cmsg_space!([RawFd; 1]);

        let (n, shm_fd) = {
            let res = nix::sys::socket::recvmsg::<()>(
                fd,
                &mut iov,
                if self.listener { None } else { Some(&mut cmsg_space) },
                MsgFlags::empty(),
            );
            let msg = match res {
                Ok(m) => m,
                Err(Errno::EAGAIN) => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            let mut shm_fd = None;
            for c in msg.cmsgs()? {
                if let ControlMessageOwned::ScmRights(fds) = c {
                    shm_fd = fds.first().copied();
                }
            }
            (msg.bytes, shm_fd)
        };
        if n == 0 {
            self.state = ConnState::Closed;
            return Err(Error::PeerClosed);
        }

        let (version, flags, upper_proto, upper_off);
        if self.listener {
            let ci = ConnecterIntro::decode(&buf[..n])?;
            version = ci.version;
            flags = ci.flags;
            upper_proto = ci.upper_layer_proto;
            upper_off = ci.upper_layer_intro_off as usize;
        } else {
            let li = ListenerIntro::decode(&buf[..n])?;
            version = li.version;
            flags = li.flags;
            upper_proto = li.upper_layer_proto;
            upper_off = li.upper_layer_intro_off as usize;

            let shm_fd = shm_fd.ok_or(Error::BadIntro)?;
            let pool = ShmPool::map_fd(unsafe { OwnedFd::from_raw_fd(shm_fd) })?;
            // our out is the peer's in and vice versa
            self.outq = SlotArray {
                queue: pool.at(li.c2l_offset as usize),
                pos: 0,
                elen: li.c2l_elen as usize,
                nentries: li.c2l_nentries as usize,
            };
            self.inq = SlotArray {
                queue: pool.at(li.l2c_offset as usize),
                pos: 0,
                elen: li.l2c_elen as usize,
                nentries: li.l2c_nentries as usize,
            };
            self.mapped_pool = Some(pool);
        }

        if version != PROTO_VERSION {
            return Err(Error::VersionMismatch(version));
        }
        if upper_proto != self.params.upper_layer_proto {
            return Err(Error::UpperProtoMismatch {
                ours: self.params.upper_layer_proto,
                theirs: upper_proto,
            });
        }

        let peer_sync = flags & FLAG_SYNC != 0;
        let peer_force = flags & FLAG_SYNC_FORCE != 0;
        match self.params.sync_mode {
            SyncMode::Disabled if peer_force => return Err(Error::SyncForceConflict),
            SyncMode::Required if !peer_sync && !peer_force => return Err(Error::SyncRequired),
            SyncMode::Disabled => self.sync = false,
            _ => self.sync = peer_sync || peer_force,
        }

        if upper_off > n {
            return Err(Error::BadIntro);
        }
        upper.extend_from_slice(&buf[upper_off..n]);

        self.state = match self.state {
            ConnState::AwaitHandshakeRx => ConnState::Open,
            ConnState::AwaitHandshakeRxTx => ConnState::AwaitHandshakeTx,
            _ => unreachable!(),
        };
        debug!(listener = self.listener, sync = self.sync, "intro received");
        Ok(Some(()))
    }

    /// Peek the next inbound message without consuming it. Returns the slot
    /// only if the producer has published it and (when synchronizing) its
    /// timestamp is due.
    pub fn peek(&mut self, now: u64) -> Option<InMsg> {
        let slot = self.inq.slot();
        let ot = own_type(slot).load(Ordering::Acquire);
        if ot & OWN_MASK != OWN_CONSUMER {
            return None;
        }

        let msg = InMsg { slot, elen: self.inq.elen };
        self.in_timestamp = msg.timestamp();
        if self.sync && self.in_timestamp > now {
            return None;
        }
        Some(msg)
    }

    /// Peek and consume the next inbound message. Must be balanced by a
    /// [`BaseIf::done`] call.
    pub fn poll(&mut self, now: u64) -> Option<InMsg> {
        let msg = self.peek(now)?;
        self.inq.advance();
        Some(msg)
    }

    /// Hand a processed message's slot back to the producer.
    pub fn done(&mut self, msg: InMsg) {
        let ot = own_type(msg.slot).load(Ordering::Relaxed);
        own_type(msg.slot).store(ot & TYPE_MASK, Ordering::Release);
    }

    /// Timestamp of the next inbound message. Only meaningful after a poll
    /// came back empty because the message is in the future.
    pub fn next_in_timestamp(&self) -> u64 {
        self.in_timestamp
    }

    /// Timestamp of the message currently published at the inbound
    /// position, whether or not it is due yet. `None` while the queue is
    /// empty.
    pub fn in_pending_timestamp(&mut self) -> Option<u64> {
        let slot = self.inq.slot();
        let ot = own_type(slot).load(Ordering::Acquire);
        if ot & OWN_MASK != OWN_CONSUMER {
            return None;
        }
        let ts = InMsg { slot, elen: self.inq.elen }.timestamp();
        self.in_timestamp = ts;
        Some(ts)
    }

    /// Allocate the next outbound slot, stamping its delivery time as
    /// `now + link_latency`. `None` when the queue is full.
    pub fn alloc(&mut self, now: u64) -> Option<OutMsg> {
        let slot = self.outq.slot();
        let ot = own_type(slot).load(Ordering::Acquire);
        if ot & OWN_MASK == OWN_CONSUMER {
            return None;
        }

        let ts = now.saturating_add(self.params.link_latency);
        unsafe {
            std::ptr::copy_nonoverlapping(ts.to_le_bytes().as_ptr(), slot, 8);
        }
        self.out_timestamp = now;
        self.outq.advance();
        Some(OutMsg { slot, elen: self.outq.elen })
    }

    /// Publish a fully written message with a release-store of own/type.
    pub fn send(&mut self, msg: OutMsg, msg_type: u8) {
        own_type(msg.slot).store((msg_type & TYPE_MASK) | OWN_CONSUMER, Ordering::Release);
    }

    /// Emit a sync dummy message if the sync interval has elapsed.
    /// `Ok(true)` if one was sent, `Ok(false)` if none was needed,
    /// `Err(QueueFull)` if one was needed but no slot was free.
    pub fn out_sync(&mut self, now: u64) -> Result<bool> {
        if !self.sync
            || (self.out_timestamp > 0 && now - self.out_timestamp < self.params.sync_interval)
        {
            return Ok(false);
        }
        let msg = self.alloc(now).ok_or(Error::QueueFull)?;
        self.send(msg, MSG_SYNC);
        Ok(true)
    }

    /// Deadline by which the next outbound message (sync or data) is due.
    pub fn out_next_sync(&self) -> u64 {
        self.out_timestamp + self.params.sync_interval
    }

    /// Close the connection, sending a TERMINATE first if it is open.
    pub fn close(&mut self) {
        match self.state {
            ConnState::Closed => return,
            ConnState::Listening => {
                self.listen_fd = None;
                self.state = ConnState::Closed;
                return;
            }
            ConnState::Open => {
                // blocking alloc; the peer is draining the queue
                let msg = loop {
                    if let Some(m) = self.alloc(u64::MAX) {
                        break m;
                    }
                    std::hint::spin_loop();
                };
                self.send(msg, MSG_TERMINATE);
            }
            _ => {}
        }
        self.conn_fd = None;
        self.state = ConnState::Closed;
        debug!("connection closed");
    }
}

/// One interface being established, with its outgoing upper-layer intro and
/// a buffer receiving the peer's.
pub struct Establish<'a> {
    pub base: &'a mut BaseIf,
    pub tx_upper: Vec<u8>,
    pub rx_upper: Vec<u8>,
}

impl<'a> Establish<'a> {
    pub fn new(base: &'a mut BaseIf, tx_upper: Vec<u8>) -> Self {
        Establish { base, tx_upper, rx_upper: Vec::new() }
    }
}

/// Drive a set of interfaces until every one is open, blocking in `poll`
/// while nothing can progress. Any handshake failure aborts the whole set.
pub fn establish(ifs: &mut [Establish<'_>]) -> Result<()> {
    loop {
        let mut open = 0;
        let mut wait: Vec<(RawFd, PollFlags)> = Vec::new();

        for e in ifs.iter_mut() {
            if e.base.state == ConnState::Closed {
                return Err(Error::InvalidState("closed during establish"));
            }

            e.base.connected()?;

            if matches!(
                e.base.state,
                ConnState::AwaitHandshakeRxTx | ConnState::AwaitHandshakeTx
            ) {
                e.base.intro_send(&e.tx_upper)?;
            }
            if e.base.state == ConnState::AwaitHandshakeRx {
                e.base.intro_recv(&mut e.rx_upper)?;
            }

            if e.base.state == ConnState::Open {
                open += 1;
            } else if let Some(w) = e.base.wait_fd() {
                wait.push(w);
            }
        }

        if open == ifs.len() {
            return Ok(());
        }
        if wait.is_empty() {
            warn!("establish: nothing to wait on but not all open");
            return Err(Error::InvalidState("establish stalled"));
        }

        let mut pfds: Vec<PollFd> = wait
            .iter()
            .map(|(fd, ev)| PollFd::new(unsafe { BorrowedFd::borrow_raw(*fd) }, *ev))
            .collect();
        poll(&mut pfds, PollTimeout::NONE)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msgs::PAYLOAD_OFFSET;

    /// Two interfaces wired back-to-back over one pool, no sockets involved.
    fn linked_pair(dir: &tempfile::TempDir) -> (BaseIf, BaseIf, ShmPool) {
        let mut params = Params::new(dir.path().join("sock"), crate::UPPER_PROTO_PCIE);
        params.in_num_entries = 8;
        params.in_entries_size = 64;
        params.out_num_entries = 8;
        params.out_entries_size = 64;
        params.link_latency = 100;
        params.sync_interval = 100;

        let mut pool = ShmPool::create(&dir.path().join("pool"), params.shm_size()).unwrap();

        let mut a = BaseIf::new(params.clone()).unwrap();
        let a_in = pool.carve(8, 64).unwrap();
        let a_out = pool.carve(8, 64).unwrap();
        a.inq = SlotArray { queue: pool.at(a_in), pos: 0, elen: 64, nentries: 8 };
        a.outq = SlotArray { queue: pool.at(a_out), pos: 0, elen: 64, nentries: 8 };
        a.state = ConnState::Open;
        a.sync = true;

        let mut b = BaseIf::new(params).unwrap();
        b.inq = SlotArray { queue: pool.at(a_out), pos: 0, elen: 64, nentries: 8 };
        b.outq = SlotArray { queue: pool.at(a_in), pos: 0, elen: 64, nentries: 8 };
        b.state = ConnState::Open;
        b.sync = true;

        (a, b, pool)
    }

    #[test]
    fn test_send_poll_done_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let (mut a, mut b, _pool) = linked_pair(&dir);

        // empty queue: nothing to poll
        assert!(b.poll(u64::MAX).is_none());

        let mut msg = a.alloc(1000).unwrap();
        msg.payload_mut()[0] = 0x5a;
        a.send(msg, 0x42);

        // not due yet at t=1000 (latency 100)
        assert!(b.poll(1000).is_none());
        assert_eq!(b.next_in_timestamp(), 1100);

        let msg = b.poll(1100).unwrap();
        assert_eq!(msg.msg_type(), 0x42);
        assert_eq!(msg.timestamp(), 1100);
        assert_eq!(msg.payload()[0], 0x5a);
        b.done(msg);

        // slot is free again for the producer
        for _ in 0..8 {
            let m = a.alloc(2000).unwrap();
            a.send(m, 1);
        }
        // now the ring is full
        assert!(a.alloc(2000).is_none());
    }

    #[test]
    fn test_out_timestamps_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let (mut a, mut b, _pool) = linked_pair(&dir);

        let mut last = 0;
        for t in [0u64, 10, 10, 50, 300] {
            let m = a.alloc(t).unwrap();
            a.send(m, 1);
            let m = b.poll(u64::MAX - 1000).unwrap();
            assert!(m.timestamp() >= last);
            assert_eq!(m.timestamp(), t + 100);
            last = m.timestamp();
            b.done(m);
        }
    }

    #[test]
    fn test_out_sync_interval() {
        let dir = tempfile::tempdir().unwrap();
        let (mut a, mut b, _pool) = linked_pair(&dir);

        // first sync primes the outbound clock
        assert!(a.out_sync(10).unwrap());
        // within the interval nothing is sent
        assert!(!a.out_sync(50).unwrap());
        assert!(!a.out_sync(109).unwrap());
        // past the interval a new sync is due
        assert!(a.out_sync(110).unwrap());
        assert_eq!(a.out_next_sync(), 210);

        for _ in 0..2 {
            let m = b.poll(u64::MAX - 1000).unwrap();
            assert_eq!(m.msg_type(), MSG_SYNC);
            assert_eq!(m.payload().len(), 64 - PAYLOAD_OFFSET);
            b.done(m);
        }
        assert!(b.poll(u64::MAX - 1000).is_none());
    }

    #[test]
    fn test_latency_below_sync_interval_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut params = Params::new(dir.path().join("s"), crate::UPPER_PROTO_ETH);
        params.link_latency = 10;
        params.sync_interval = 100;
        assert!(matches!(
            BaseIf::new(params.clone()),
            Err(Error::LatencyBelowSyncInterval)
        ));

        params.sync_mode = SyncMode::Disabled;
        assert!(BaseIf::new(params).is_ok());
    }
}
