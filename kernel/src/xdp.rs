//! XDP packet classifier
//!
//! Counts every frame, records filtered NFS traffic per packet and per
//! COMPOUND transaction id, and always lets the frame through.

use core::sync::atomic::AtomicU32;

use aya_ebpf::{bindings::xdp_action, macros::xdp, programs::XdpContext};
use nfsdig_common::classifier::{self, PacketBytes};

use crate::{helpers::*, maps::*};

/// Frame bytes between `data` and `data_end`
struct XdpBytes {
    start: usize,
    end: usize,
}

impl XdpBytes {
    #[inline(always)]
    fn new(ctx: &XdpContext) -> Self {
        XdpBytes {
            start: ctx.data(),
            end: ctx.data_end(),
        }
    }

    /// Pointer to `N` bytes at `offset`, if they lie inside the frame
    #[inline(always)]
    fn window<const N: usize>(&self, offset: usize) -> Option<*const [u8; N]> {
        let at = self.start.checked_add(offset)?;
        if at + N > self.end {
            return None;
        }
        Some(at as *const [u8; N])
    }
}

impl PacketBytes for XdpBytes {
    #[inline(always)]
    fn byte_len(&self) -> usize {
        self.end - self.start
    }

    #[inline(always)]
    fn u8_at(&self, offset: usize) -> Option<u8> {
        let p = self.window::<1>(offset)?;
        Some(unsafe { (*p)[0] })
    }

    #[inline(always)]
    fn be16_at(&self, offset: usize) -> Option<u16> {
        let p = self.window::<2>(offset)?;
        Some(u16::from_be_bytes(unsafe { core::ptr::read_unaligned(p) }))
    }

    #[inline(always)]
    fn be32_at(&self, offset: usize) -> Option<u32> {
        let p = self.window::<4>(offset)?;
        Some(u32::from_be_bytes(unsafe { core::ptr::read_unaligned(p) }))
    }
}

#[xdp]
pub fn nfsdig_xdp(ctx: XdpContext) -> u32 {
    let pkt = XdpBytes::new(&ctx);
    let classified = classifier::classify(&pkt, &packet_filter(), get_timestamp());

    if let Some(stats) = PACKET_STATS.get_ptr_mut(0) {
        classifier::account(unsafe { &mut *stats }, &classified);
    }

    if classified.record.is_some() {
        if let Some(counter) = PACKET_COUNTER.get_ptr_mut(0) {
            let counter = unsafe { AtomicU32::from_ptr(counter) };
            finish(classifier::record(
                &classified,
                counter,
                &mut MapStore(&PACKET_RECORDS),
                &mut MapStore(&XID_RECORDS),
            ));
        }
    }

    xdp_action::XDP_PASS
}
