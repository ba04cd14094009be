//! Admin queue command handling, driven through the register interface.

mod harness;

use harness::*;
use nicsim_40g::adminq::*;
use nicsim_40g::device::DmaTag;
use nicsim_40g::{regs, FortyGig};
use nicsim_core::test_util::RecordingKernel;

const RING_BASE: u64 = 0x5000;

fn admin_desc(opcode: u16, flags: u16, datalen: u16, buf_addr: u64) -> [u8; 32] {
    let mut d = [0u8; 32];
    d[0..2].copy_from_slice(&flags.to_le_bytes());
    d[2..4].copy_from_slice(&opcode.to_le_bytes());
    d[4..6].copy_from_slice(&datalen.to_le_bytes());
    d[24..28].copy_from_slice(&((buf_addr >> 32) as u32).to_le_bytes());
    d[28..32].copy_from_slice(&(buf_addr as u32).to_le_bytes());
    d
}

/// Enable the admin queue and post one descriptor; returns after the
/// descriptor fetch has been answered.
fn post_admin_desc(dev: &mut FortyGig, k: &mut Kern, desc: &[u8; 32]) {
    write32(dev, k, regs::PF_ATQBAL, RING_BASE as u32);
    write32(dev, k, regs::PF_ATQBAH, (RING_BASE >> 32) as u32);
    write32(dev, k, regs::PF_ATQLEN, 64 | regs::ATQLEN_ENABLE);
    write32(dev, k, regs::PF_ATQT, 1);

    let op = k.pop_dma().expect("descriptor fetch");
    assert_eq!(op.tag, DmaTag::AtqFetch { pos: 0 });
    assert_eq!(op.addr, RING_BASE);
    answer_read(dev, k, op, desc);
}

#[test]
fn test_get_version_completes_in_place() {
    let mut dev = FortyGig::new();
    let mut k: Kern = RecordingKernel::new();

    post_admin_desc(&mut dev, &mut k, &admin_desc(AQC_GET_VERSION, 0, 0, 0));

    let wb = k.pop_dma().expect("descriptor write-back");
    assert_eq!(wb.tag, DmaTag::AtqWriteback { pos: 0, cnt: 1 });
    assert_eq!(wb.addr, RING_BASE);

    let flags = u16::from_le_bytes([wb.data[0], wb.data[1]]);
    assert!(flags & AQ_FLAG_DD != 0);
    assert!(flags & AQ_FLAG_CMP != 0);
    assert!(flags & AQ_FLAG_ERR == 0);
    assert_eq!(u16::from_le_bytes([wb.data[6], wb.data[7]]), AQ_RC_OK);
    assert_eq!(u16::from_le_bytes([wb.data[28], wb.data[29]]), FW_API_MAJOR);
    assert_eq!(u16::from_le_bytes([wb.data[30], wb.data[31]]), FW_API_MINOR);

    // completing the write-back advances the visible head
    answer_write(&mut dev, &mut k, wb);
    let head = read32(&mut dev, &mut k, regs::PF_ATQH);
    assert_eq!(head, 1);
}

#[test]
fn test_list_capabilities_buffer_too_small() {
    let mut dev = FortyGig::new();
    let mut k: Kern = RecordingKernel::new();

    // driver offers a 16-byte buffer; the table needs far more
    post_admin_desc(
        &mut dev,
        &mut k,
        &admin_desc(AQC_LIST_DEV_CAPABILITIES, AQ_FLAG_BUF, 16, 0x9000),
    );

    let wb = k.pop_dma().expect("descriptor write-back");
    assert_eq!(wb.tag, DmaTag::AtqWriteback { pos: 0, cnt: 1 });

    let flags = u16::from_le_bytes([wb.data[0], wb.data[1]]);
    assert!(flags & AQ_FLAG_ERR != 0);
    assert_eq!(u16::from_le_bytes([wb.data[6], wb.data[7]]), AQ_RC_ENOMEM);
    // required size reported back; the full table is 6 x 32 bytes
    let datalen = u16::from_le_bytes([wb.data[4], wb.data[5]]);
    assert_eq!(datalen, 192);
    assert!(datalen >= 96);

    // no indirect response was written
    answer_write(&mut dev, &mut k, wb);
    assert!(k.dmas.is_empty());
}

#[test]
fn test_list_capabilities_fits() {
    let mut dev = FortyGig::new();
    let mut k: Kern = RecordingKernel::new();

    post_admin_desc(
        &mut dev,
        &mut k,
        &admin_desc(AQC_LIST_DEV_CAPABILITIES, AQ_FLAG_BUF, 512, 0x9000),
    );

    let data = k.pop_dma().expect("indirect response write");
    assert_eq!(data.tag, DmaTag::AtqDataWrite { pos: 0 });
    assert_eq!(data.addr, 0x9000);
    assert_eq!(data.data.len(), 192);
    // first element: RSS capability
    assert_eq!(u16::from_le_bytes([data.data[0], data.data[1]]), AQ_CAP_ID_RSS);
    answer_write(&mut dev, &mut k, data);

    let wb = k.pop_dma().expect("descriptor write-back");
    let flags = u16::from_le_bytes([wb.data[0], wb.data[1]]);
    assert!(flags & AQ_FLAG_ERR == 0);
    assert_eq!(u16::from_le_bytes([wb.data[4], wb.data[5]]), 192);
}

#[test]
fn test_mac_address_read() {
    let mut dev = FortyGig::new();
    let mut k: Kern = RecordingKernel::new();
    k.mac = 0x5254_0012_3456;

    post_admin_desc(
        &mut dev,
        &mut k,
        &admin_desc(AQC_MAC_ADDRESS_READ, AQ_FLAG_BUF, 24, 0xa000),
    );

    let data = k.pop_dma().expect("indirect response write");
    assert_eq!(data.addr, 0xa000);
    let mac = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];
    assert_eq!(&data.data[0..6], &mac); // pf lan mac
    assert_eq!(&data.data[12..18], &mac); // port mac
    answer_write(&mut dev, &mut k, data);

    let wb = k.pop_dma().expect("descriptor write-back");
    let cmd_flags = u16::from_le_bytes([wb.data[16], wb.data[17]]);
    assert_eq!(cmd_flags, AQC_LAN_ADDR_VALID | AQC_PORT_ADDR_VALID);
}

#[test]
fn test_unknown_opcode_succeeds() {
    let mut dev = FortyGig::new();
    let mut k: Kern = RecordingKernel::new();

    post_admin_desc(&mut dev, &mut k, &admin_desc(0x7f7f, 0, 0, 0));

    let wb = k.pop_dma().expect("descriptor write-back");
    let flags = u16::from_le_bytes([wb.data[0], wb.data[1]]);
    assert!(flags & AQ_FLAG_DD != 0);
    assert!(flags & AQ_FLAG_ERR == 0);
    assert_eq!(u16::from_le_bytes([wb.data[6], wb.data[7]]), AQ_RC_OK);
}

#[test]
fn test_get_link_status_reports_40g_up() {
    let mut dev = FortyGig::new();
    let mut k: Kern = RecordingKernel::new();

    post_admin_desc(&mut dev, &mut k, &admin_desc(AQC_GET_LINK_STATUS, 0, 0, 0));

    let wb = k.pop_dma().expect("descriptor write-back");
    assert_eq!(wb.data[19], LINK_SPEED_40GB);
    assert!(wb.data[20] & AQ_LINK_UP_FUNCTION != 0);
    assert!(wb.data[20] & AQ_MEDIA_AVAILABLE != 0);
}

#[test]
fn test_indirect_command_fetches_buffer() {
    let mut dev = FortyGig::new();
    let mut k: Kern = RecordingKernel::new();

    // remove_macvlan with one address entry carried indirect
    let mut d = admin_desc(AQC_REMOVE_MACVLAN, AQ_FLAG_RD | AQ_FLAG_BUF, 16, 0xb000);
    d[16..18].copy_from_slice(&1u16.to_le_bytes()); // num_addresses
    post_admin_desc(&mut dev, &mut k, &d);

    // the RD flag makes the queue fetch the indirect buffer first
    let fetch = k.pop_dma().expect("indirect buffer fetch");
    assert_eq!(fetch.tag, DmaTag::AtqDataFetch { pos: 0 });
    assert_eq!(fetch.addr, 0xb000);
    let mut entry = vec![0u8; 16];
    entry[12] = 0xff; // error code to be overwritten
    answer_read(&mut dev, &mut k, fetch, &entry);

    let resp = k.pop_dma().expect("indirect response write");
    assert_eq!(resp.tag, DmaTag::AtqDataWrite { pos: 0 });
    assert_eq!(resp.data[12], 0); // success
}
