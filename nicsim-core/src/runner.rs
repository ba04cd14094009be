//! The per-device runtime loop.
//!
//! One `Runner` owns one device model, the shared memory pool, and the two
//! base interfaces (PCIe towards the host simulator, Ethernet towards the
//! network simulator). It is strictly single-threaded: every device callback
//! happens on the runner's thread with an explicit [`Kernel`] handle.

use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{signal, SigHandler, Signal};
use nicsim_proto::base::{establish, BaseIf, Establish, OutMsg};
use nicsim_proto::intro::PcieDevIntro;
use nicsim_proto::msgs::{self, IntType};
use nicsim_proto::shm::ShmPool;
use nicsim_proto::{Params, UPPER_PROTO_ETH, UPPER_PROTO_PCIE};
use tracing::{debug, info, warn};

use crate::args::NicArgs;
use crate::dma::{DmaEngine, DmaOp};
use crate::events::EventHeap;
use crate::kernel::{Device, Kernel};
use crate::Result;

/// Ethernet queues use larger slots so jumbo frames fit a single message.
const ETH_ENTRY_SIZE: usize = 9472;
const ETH_NUM_ENTRIES: usize = 1024;

/// Inbound messages handled per interface per loop iteration.
const POLL_BATCH: usize = 64;

static EXITING: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_exit_signal(_: i32) {
    EXITING.store(true, Ordering::Relaxed);
}

/// Install SIGINT/SIGTERM handlers that request a clean shutdown of every
/// runner in the process. Call once, before spawning device threads.
pub fn install_signal_handlers() {
    unsafe {
        let _ = signal(Signal::SIGINT, SigHandler::Handler(handle_exit_signal));
        let _ = signal(Signal::SIGTERM, SigHandler::Handler(handle_exit_signal));
    }
}

/// True once a shutdown signal was received.
pub fn shutdown_requested() -> bool {
    EXITING.load(Ordering::Relaxed)
}

/// The live [`Kernel`] implementation: owns the transport endpoints, the
/// DMA engine and the timed-event heap.
pub struct SimKernel<T> {
    now: u64,
    mac: u64,
    pci: BaseIf,
    eth: BaseIf,
    dma: DmaEngine<T>,
    events: EventHeap,
    devctrl: u64,
}

impl<T> SimKernel<T> {
    fn pci_alloc_spin(&mut self) -> OutMsg {
        // the peer drains its inbound queue independently of us, so a full
        // queue only means we must wait for it to catch up
        loop {
            if let Some(m) = self.pci.alloc(self.now) {
                return m;
            }
            std::hint::spin_loop();
        }
    }

    fn eth_alloc_spin(&mut self) -> OutMsg {
        loop {
            if let Some(m) = self.eth.alloc(self.now) {
                return m;
            }
            std::hint::spin_loop();
        }
    }

    /// Push queued DMA chunks onto the wire while slots and the in-flight
    /// window allow.
    fn flush_dma(&mut self) {
        loop {
            let now = self.now;
            let Some(chunk) = self.dma.next_ready() else { break };
            let Some(mut msg) = self.pci.alloc(now) else { break };
            let t = if chunk.write {
                msgs::encode_d2h_write(msg.payload_mut(), chunk.req_id, chunk.addr, chunk.data)
            } else {
                msgs::encode_d2h_read(msg.payload_mut(), chunk.req_id, chunk.addr, chunk.len as u16)
            };
            self.pci.send(msg, t);
            self.dma.sent();
        }
    }
}

impl<T> Kernel<T> for SimKernel<T> {
    fn time_ps(&self) -> u64 {
        self.now
    }

    fn mac_addr(&self) -> u64 {
        self.mac
    }

    fn issue_dma(&mut self, op: DmaOp<T>) {
        self.dma.submit(op);
        self.flush_dma();
    }

    fn eth_send(&mut self, data: &[u8]) {
        let mut msg = self.eth_alloc_spin();
        assert!(
            data.len() + 8 <= msg.capacity(),
            "frame of {} bytes exceeds the ethernet message capacity",
            data.len()
        );
        let t = msgs::encode_eth_packet(msg.payload_mut(), 0, data);
        self.eth.send(msg, t);
    }

    fn msi_issue(&mut self, vec: u8) {
        debug!(vec, "issuing MSI");
        let mut msg = self.pci_alloc_spin();
        let t = msgs::encode_d2h_interrupt(msg.payload_mut(), vec as u16, IntType::Msi);
        self.pci.send(msg, t);
    }

    fn msix_issue(&mut self, vec: u16) {
        debug!(vec, "issuing MSI-X");
        let mut msg = self.pci_alloc_spin();
        let t = msgs::encode_d2h_interrupt(msg.payload_mut(), vec, IntType::Msix);
        self.pci.send(msg, t);
    }

    fn event_schedule(&mut self, key: u64, time: u64) {
        self.events.schedule(key, time);
    }

    fn event_cancel(&mut self, key: u64) {
        self.events.cancel(key);
    }

    fn intx_enabled(&self) -> bool {
        self.devctrl & msgs::DEVCTRL_INTX_EN != 0
    }

    fn msi_enabled(&self) -> bool {
        self.devctrl & msgs::DEVCTRL_MSI_EN != 0
    }

    fn msix_enabled(&self) -> bool {
        self.devctrl & msgs::DEVCTRL_MSIX_EN != 0
    }
}

pub struct Runner<D: Device> {
    dev: D,
    kern: SimKernel<D::DmaTag>,
    pool: ShmPool,
    terminated: bool,
}

impl<D: Device> Runner<D> {
    /// Create the pool, listen on both sockets, and run the handshakes.
    /// Blocks until both peers are connected.
    pub fn new(dev: D, args: &NicArgs, instance: usize) -> Result<Self> {
        let mut pci_params = Params::new(&args.pci_socket, UPPER_PROTO_PCIE);
        pci_params.sync_mode = args.sync_mode;
        pci_params.link_latency = args.pci_latency * 1000;
        pci_params.sync_interval = args.sync_period * 1000;

        let mut eth_params = Params::new(&args.eth_socket, UPPER_PROTO_ETH);
        eth_params.sync_mode = args.sync_mode;
        eth_params.link_latency = args.eth_latency * 1000;
        eth_params.sync_interval = args.sync_period * 1000;
        eth_params.in_num_entries = ETH_NUM_ENTRIES;
        eth_params.in_entries_size = ETH_ENTRY_SIZE;
        eth_params.out_num_entries = ETH_NUM_ENTRIES;
        eth_params.out_entries_size = ETH_ENTRY_SIZE;

        let pool_size = pci_params.shm_size() + eth_params.shm_size();
        let mut pool = ShmPool::create(&args.shm_path, pool_size)?;

        let mut pci = BaseIf::new(pci_params)?;
        pci.listen(&mut pool)?;
        let mut eth = BaseIf::new(eth_params)?;
        eth.listen(&mut pool)?;

        let mut di = PcieDevIntro::default();
        dev.setup_intro(&mut di);

        info!(
            pci = %args.pci_socket.display(),
            eth = %args.eth_socket.display(),
            "waiting for peers"
        );
        {
            let mut est = [
                Establish::new(&mut pci, di.encode().to_vec()),
                Establish::new(&mut eth, Vec::new()),
            ];
            establish(&mut est)?;
        }
        info!(
            pci_sync = pci.sync_enabled(),
            eth_sync = eth.sync_enabled(),
            "peers connected"
        );

        let max_payload = msgs::max_dma_payload(pci.out_msg_len());
        Ok(Runner {
            dev,
            kern: SimKernel {
                now: args.start_tick,
                mac: args.mac_addr(instance),
                pci,
                eth,
                dma: DmaEngine::new(max_payload),
                events: EventHeap::new(),
                devctrl: 0,
            },
            pool,
            terminated: false,
        })
    }

    /// Main loop; returns once a peer terminates or a shutdown signal is
    /// received.
    pub fn run(&mut self) -> Result<()> {
        while !shutdown_requested() && !self.terminated {
            let mut did_work = false;

            for _ in 0..POLL_BATCH {
                if !self.poll_pci()? {
                    break;
                }
                did_work = true;
            }
            for _ in 0..POLL_BATCH {
                if !self.poll_eth()? {
                    break;
                }
                did_work = true;
            }

            self.kern.flush_dma();
            self.out_sync();
            self.fire_events();
            self.advance_clock(did_work);

            if !did_work {
                std::hint::spin_loop();
            }
        }

        info!("shutting down");
        self.kern.pci.close();
        self.kern.eth.close();
        let _ = self.pool.unlink();
        Ok(())
    }

    fn poll_pci(&mut self) -> Result<bool> {
        let Some(msg) = self.kern.pci.poll(self.kern.now) else {
            return Ok(false);
        };

        let t = msg.msg_type();
        match t {
            msgs::MSG_SYNC => {}
            msgs::MSG_TERMINATE => {
                info!("PCIe peer terminated");
                self.terminated = true;
            }
            _ => match msgs::decode_pcie_h2d(t, msg.payload()) {
                Some(msgs::PcieH2D::Read { req_id, bar, offset, len }) => {
                    let mut buf = vec![0u8; len as usize];
                    self.dev.reg_read(&mut self.kern, bar, offset, &mut buf);
                    let mut out = self.kern.pci_alloc_spin();
                    let t = msgs::encode_d2h_readcomp(out.payload_mut(), req_id, &buf);
                    self.kern.pci.send(out, t);
                }
                Some(msgs::PcieH2D::Write { req_id, bar, offset, data }) => {
                    self.dev.reg_write(&mut self.kern, bar, offset, data);
                    let mut out = self.kern.pci_alloc_spin();
                    let t = msgs::encode_d2h_writecomp(out.payload_mut(), req_id);
                    self.kern.pci.send(out, t);
                }
                Some(msgs::PcieH2D::ReadComp { req_id, data }) => {
                    if let Some(op) = self.kern.dma.read_complete(req_id, data) {
                        self.dev.dma_complete(&mut self.kern, op);
                    }
                }
                Some(msgs::PcieH2D::WriteComp { req_id }) => {
                    if let Some(op) = self.kern.dma.write_complete(req_id) {
                        self.dev.dma_complete(&mut self.kern, op);
                    }
                }
                Some(msgs::PcieH2D::Devctrl { flags }) => {
                    debug!(flags, "device control update");
                    self.kern.devctrl = flags;
                    self.dev.devctrl_update(&mut self.kern, flags);
                }
                None => {
                    warn!(msg_type = t, "unknown PCIe message type");
                }
            },
        }

        self.kern.pci.done(msg);
        self.kern.flush_dma();
        Ok(true)
    }

    fn poll_eth(&mut self) -> Result<bool> {
        let Some(msg) = self.kern.eth.poll(self.kern.now) else {
            return Ok(false);
        };

        let t = msg.msg_type();
        match t {
            msgs::MSG_SYNC => {}
            msgs::MSG_TERMINATE => {
                info!("Ethernet peer terminated");
                self.terminated = true;
            }
            msgs::ETH_PACKET => {
                let (port, data) = msgs::decode_eth_packet(msg.payload());
                self.dev.eth_rx(&mut self.kern, port, data);
            }
            _ => {
                warn!(msg_type = t, "unknown Ethernet message type");
            }
        }

        self.kern.eth.done(msg);
        Ok(true)
    }

    fn out_sync(&mut self) {
        let now = self.kern.now;
        // a full queue just postpones the sync to the next iteration
        if let Err(nicsim_proto::Error::QueueFull) = self.kern.pci.out_sync(now) {
            debug!("PCIe out queue full, sync postponed");
        }
        if let Err(nicsim_proto::Error::QueueFull) = self.kern.eth.out_sync(now) {
            debug!("Ethernet out queue full, sync postponed");
        }
    }

    fn fire_events(&mut self) {
        while let Some(key) = self.kern.events.pop_due(self.kern.now) {
            self.dev.timed_event(&mut self.kern, key);
        }
    }

    /// Advance simulated time. Under synchronization, time moves to the
    /// earliest of: the next inbound timestamps (both must be visible), the
    /// next timed event, and the next outbound sync deadlines. Without
    /// synchronization, time only tracks the timed-event heap.
    fn advance_clock(&mut self, did_work: bool) {
        let pci_sync = self.kern.pci.sync_enabled();
        let eth_sync = self.kern.eth.sync_enabled();

        if pci_sync || eth_sync {
            let mut next = u64::MAX;
            if pci_sync {
                match self.kern.pci.in_pending_timestamp() {
                    Some(ts) => next = next.min(ts),
                    // peer horizon unknown: cannot safely advance
                    None => return,
                }
                next = next.min(self.kern.pci.out_next_sync());
            }
            if eth_sync {
                match self.kern.eth.in_pending_timestamp() {
                    Some(ts) => next = next.min(ts),
                    None => return,
                }
                next = next.min(self.kern.eth.out_next_sync());
            }
            if let Some(t) = self.kern.events.next_time() {
                next = next.min(t);
            }
            if next != u64::MAX && next > self.kern.now {
                self.kern.now = next;
            }
        } else if !did_work {
            if let Some(t) = self.kern.events.next_time() {
                if t > self.kern.now {
                    self.kern.now = t;
                }
            }
        }
    }

    pub fn device(&self) -> &D {
        &self.dev
    }

    pub fn kernel(&self) -> &SimKernel<D::DmaTag> {
        &self.kern
    }
}
