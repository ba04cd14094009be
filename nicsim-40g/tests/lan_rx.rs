//! RX path: RSS steering into queues, descriptor write-back, silent drops.

mod harness;

use harness::*;
use nicsim_40g::device::DmaTag;
use nicsim_40g::lan::{RXD_LEN_PBUF_SHIFT, RXD_STATUS_DD, RXD_STATUS_EOF, RXD_STATUS_L3L4P};
use nicsim_40g::rss::RssKeyCache;
use nicsim_40g::{regs, FortyGig};
use nicsim_core::kernel::Device;
use nicsim_core::test_util::RecordingKernel;

const FPM_HOST: u64 = 0x10_0000;
const RING_BASE: u64 = 0x4_0000;

/// Post RX descriptors pointing at sequential packet buffers.
fn post_rx_descs(dev: &mut FortyGig, k: &mut Kern, idx: usize, bufs: &[u64]) {
    write32(dev, k, regs::qrx_tail(idx), bufs.len() as u32);

    let fetch = k.pop_dma().expect("descriptor fetch");
    assert_eq!(fetch.tag, DmaTag::LanFetch { rx: true, idx, pos: 0 });
    let bytes: Vec<u8> = bufs.iter().flat_map(|a| rx_read_desc(*a)).collect();
    answer_read(dev, k, fetch, &bytes);
}

/// The default hash key, as installed by reset.
fn default_key() -> [u32; 13] {
    [
        0xda565a6d, 0xc20e5b25, 0x3d256741, 0xb08fa343, 0xcb2bcad0, 0xb4307bae, 0xa32dcb77,
        0x0cf23080, 0x3bb7426a, 0xfa01acbe, 0, 0, 0,
    ]
}

#[test]
fn test_rx_rss_steers_to_lut_queue() {
    let mut dev = FortyGig::new();
    let mut k: Kern = RecordingKernel::new();

    let frame = tcp_frame([10, 0, 0, 9], [10, 0, 0, 1], 1234, 80, 0, 0, &[0x11; 64]);

    // find where this flow hashes, and map that LUT slot to queue 3;
    // each LUT register packs four byte-wide queue entries
    let mut kc = RssKeyCache::new();
    let hash = kc.hash_ipv4(&default_key(), 0x0a000009, 0x0a000001, 1234, 80);
    let lut_idx = (hash % 128) as usize;
    write32(&mut dev, &mut k, regs::pfqf_hlut(lut_idx / 4), 3u32 << (8 * (lut_idx % 4)));

    enable_rx_queue(&mut dev, &mut k, 3, FPM_HOST, RING_BASE, 64, 2048);
    post_rx_descs(&mut dev, &mut k, 3, &[0x7000, 0x7800]);

    dev.eth_rx(&mut k, 0, &frame);

    // packet data lands in the first descriptor's buffer
    let data = k.pop_dma().expect("packet data write");
    assert_eq!(data.tag, DmaTag::LanDataWrite { rx: true, idx: 3, pos: 0 });
    assert_eq!(data.addr, 0x7000);
    assert_eq!(data.data, frame);
    answer_write(&mut dev, &mut k, data);

    // completed descriptor written back with DD, EOF and L3L4P
    let wb = k.pop_dma().expect("descriptor write-back");
    assert_eq!(wb.tag, DmaTag::LanWriteback { rx: true, idx: 3, pos: 0, cnt: 1 });
    let qw1 = u64::from_le_bytes(wb.data[8..16].try_into().unwrap());
    assert!(qw1 & RXD_STATUS_DD != 0);
    assert!(qw1 & RXD_STATUS_EOF != 0);
    assert!(qw1 & RXD_STATUS_L3L4P != 0);
    assert_eq!((qw1 >> RXD_LEN_PBUF_SHIFT) & 0x3fff, frame.len() as u64);
    answer_write(&mut dev, &mut k, wb);
    assert_eq!(dev.lan().rxqs[3].ring.head(), 1);
}

#[test]
fn test_rx_multi_descriptor_scatter() {
    let mut dev = FortyGig::new();
    let mut k: Kern = RecordingKernel::new();
    // small 128-byte buffers force scattering
    enable_rx_queue(&mut dev, &mut k, 0, FPM_HOST, RING_BASE, 64, 128);
    post_rx_descs(&mut dev, &mut k, 0, &[0x7000, 0x7800, 0x8000]);

    // non-IP frame lands on queue 0 and spans three buffers
    let mut frame = vec![0u8; 300];
    frame[12] = 0x08;
    frame[13] = 0x06; // arp
    dev.eth_rx(&mut k, 0, &frame);

    let d0 = k.pop_dma().unwrap();
    let d1 = k.pop_dma().unwrap();
    let d2 = k.pop_dma().unwrap();
    assert_eq!((d0.addr, d0.data.len()), (0x7000, 128));
    assert_eq!((d1.addr, d1.data.len()), (0x7800, 128));
    assert_eq!((d2.addr, d2.data.len()), (0x8000, 44));

    // EOF only on the final segment
    for (op, last) in [(&d0, false), (&d1, false), (&d2, true)] {
        let c = dev.lan().rxqs[0].ring.ctx(match op.tag {
            DmaTag::LanDataWrite { pos, .. } => pos,
            ref t => panic!("unexpected tag {t:?}"),
        });
        let qw1 = u64::from_le_bytes(c.desc[8..16].try_into().unwrap());
        assert_eq!(qw1 & RXD_STATUS_EOF != 0, last);
        assert!(qw1 & RXD_STATUS_DD != 0);
    }

    // the first completed segment is written back on its own while the
    // others are still in flight
    answer_write(&mut dev, &mut k, d0);
    let wb1 = k.pop_dma().expect("first write-back");
    assert_eq!(wb1.tag, DmaTag::LanWriteback { rx: true, idx: 0, pos: 0, cnt: 1 });

    answer_write(&mut dev, &mut k, d1);
    answer_write(&mut dev, &mut k, d2);
    answer_write(&mut dev, &mut k, wb1);
    assert_eq!(dev.lan().rxqs[0].ring.head(), 1);

    // the remaining contiguous run goes out as one batch
    let wb2 = k.pop_dma().expect("second write-back");
    assert_eq!(wb2.tag, DmaTag::LanWriteback { rx: true, idx: 0, pos: 1, cnt: 2 });
    answer_write(&mut dev, &mut k, wb2);
    assert_eq!(dev.lan().rxqs[0].ring.head(), 3);
}

#[test]
fn test_rx_drops_without_descriptors() {
    let mut dev = FortyGig::new();
    let mut k: Kern = RecordingKernel::new();
    enable_rx_queue(&mut dev, &mut k, 0, FPM_HOST, RING_BASE, 64, 2048);
    // no descriptors posted

    let frame = vec![0u8; 100];
    dev.eth_rx(&mut k, 0, &frame);

    // silent drop: no DMA, no interrupt, only the counter moves
    assert!(k.dmas.is_empty());
    assert!(k.msixs.is_empty());
    assert_eq!(dev.lan().rx_drops, 1);
}

#[test]
fn test_rx_queue_interrupt_fires_after_head_advance() {
    let mut dev = FortyGig::new();
    let mut k: Kern = RecordingKernel::new();
    enable_rx_queue(&mut dev, &mut k, 0, FPM_HOST, RING_BASE, 64, 2048);

    // cause enabled, msix vector 5, no-throttle itr index
    write32(
        &mut dev,
        &mut k,
        regs::qint_rqctl(0),
        5 | regs::QINT_CTL_CAUSE_ENA | (3 << regs::QINT_CTL_ITR_INDX_SHIFT),
    );
    write32(&mut dev, &mut k, regs::PFINT_DYN_CTL0, regs::PFINT_DYN_CTL0_INTENA);

    post_rx_descs(&mut dev, &mut k, 0, &[0x7000]);
    dev.eth_rx(&mut k, 0, &[0u8; 60]);

    let data = k.pop_dma().unwrap();
    answer_write(&mut dev, &mut k, data);
    let wb = k.pop_dma().unwrap();
    answer_write(&mut dev, &mut k, wb);

    // head advanced, vector 5 armed immediately (itr index 3 = no throttle)
    assert_eq!(k.armed_time(5), Some(k.now));

    // firing the event delivers MSI-X vector 5
    dev.timed_event(&mut k, 5);
    assert_eq!(k.msixs, vec![5]);
}
