//! Conversion between wire-level and context-free events.
//!
//! Packing turns plain controller and program-change runs into the
//! self-contained forms: a bank select followed by a program change
//! becomes one XPC carrying the bank, the NRPN/RPN preamble plus data
//! entry becomes one NRPN/RPN event, and coarse/fine controller pairs
//! become one 14-bit XCTL. Unpacking is the inverse. The context (last
//! bank, last parameter number, last coarse values) lives in a state list
//! holding plain CTL records keyed by controller number and channel.

use smallvec::SmallVec;

use segno_midi::defs::{
    BANK_HI, BANK_LO, DATAENT_HI, DATAENT_LO, NRPN_HI, NRPN_LO, RPN_HI, RPN_LO,
};
use segno_midi::{Cmd, ConvFlags, Ev, EV_UNDEF};

use crate::state::{State, StateFlags, StateList, StatePool};

/// Upper bound on events produced by one unpack call.
pub const CONV_NUMREV: usize = 4;

pub type ConvOut = SmallVec<[Ev; CONV_NUMREV]>;

#[inline]
fn chan_match(a: &Ev, b: &Ev) -> bool {
    a.ch == b.ch && a.dev == b.dev
}

/// Whether controller `num` is 14-bit on this device side.
#[inline]
fn is_fine(xctlset: u32, num: u32) -> bool {
    num < 32 && xctlset & (1 << num) != 0
}

/// Record the value of the given controller, updating in place when a
/// state already exists.
fn setctl(slist: &mut StateList, pool: &mut StatePool, ev: &Ev) {
    let mut cur = slist.first_id();
    while let Some(id) = cur {
        let s = &pool[id];
        if s.ev.ctl_num() == ev.ctl_num() && chan_match(&s.ev, ev) {
            pool[id].ev.v1 = ev.ctl_val();
            return;
        }
        cur = s.next_id();
    }
    let id = pool.alloc(State::with_flags(StateFlags::empty()));
    slist.add(pool, id);
    pool[id].ev = *ev;
}

/// Last seen value of controller `num` on `ev`'s channel, or EV_UNDEF.
fn getctl(slist: &StateList, pool: &StatePool, ev: &Ev, num: u32) -> u32 {
    let mut cur = slist.first_id();
    while let Some(id) = cur {
        let s = &pool[id];
        if s.ev.ctl_num() == num && chan_match(&s.ev, ev) {
            return s.ev.ctl_val();
        }
        cur = s.next_id();
    }
    EV_UNDEF
}

/// Forget the state of controller `num` on `ev`'s channel.
fn rmctl(slist: &mut StateList, pool: &mut StatePool, ev: &Ev, num: u32) {
    let mut cur = slist.first_id();
    while let Some(id) = cur {
        let s = &pool[id];
        if s.ev.ctl_num() == num && chan_match(&s.ev, ev) {
            slist.rm(pool, id);
            pool.free(id);
            return;
        }
        cur = s.next_id();
    }
}

/// 14-bit value of a coarse/fine controller pair, or EV_UNDEF if either
/// half is missing.
fn getctx(slist: &StateList, pool: &StatePool, ev: &Ev, hi: u32, lo: u32) -> u32 {
    let vlo = getctl(slist, pool, ev, lo);
    if vlo == EV_UNDEF {
        return EV_UNDEF;
    }
    let vhi = getctl(slist, pool, ev, hi);
    if vhi == EV_UNDEF {
        return EV_UNDEF;
    }
    vlo | (vhi << 7)
}

/// Convert a wire-level event (CTL, PC) to its context-free form. Returns
/// `None` when the event only updated the context (bank selects, NRPN
/// preambles, coarse halves of 14-bit pairs).
pub fn packev(
    slist: &mut StateList,
    pool: &mut StatePool,
    xctlset: u32,
    flags: ConvFlags,
    ev: &Ev,
) -> Option<Ev> {
    if ev.cmd == Cmd::PC {
        let bank = if flags.contains(ConvFlags::XPC) {
            getctx(slist, pool, ev, BANK_HI, BANK_LO)
        } else {
            0
        };
        return Some(Ev::xpc(ev.dev, ev.ch, ev.pc_prog(), bank));
    }
    if ev.cmd != Cmd::CTL {
        return Some(*ev);
    }

    let num = ev.ctl_num();
    match num {
        BANK_HI if flags.contains(ConvFlags::XPC) => {
            rmctl(slist, pool, ev, BANK_LO);
            setctl(slist, pool, ev);
            return None;
        }
        RPN_HI if flags.contains(ConvFlags::RPN) => {
            rmctl(slist, pool, ev, NRPN_LO);
            rmctl(slist, pool, ev, RPN_LO);
            setctl(slist, pool, ev);
            return None;
        }
        NRPN_HI if flags.contains(ConvFlags::NRPN) => {
            rmctl(slist, pool, ev, RPN_LO);
            rmctl(slist, pool, ev, NRPN_LO);
            setctl(slist, pool, ev);
            return None;
        }
        DATAENT_HI if flags.intersects(ConvFlags::RPN | ConvFlags::NRPN) => {
            rmctl(slist, pool, ev, DATAENT_LO);
            setctl(slist, pool, ev);
            return None;
        }
        BANK_LO if flags.contains(ConvFlags::XPC) => {
            setctl(slist, pool, ev);
            return None;
        }
        NRPN_LO if flags.contains(ConvFlags::NRPN) => {
            rmctl(slist, pool, ev, RPN_LO);
            setctl(slist, pool, ev);
            return None;
        }
        RPN_LO if flags.contains(ConvFlags::RPN) => {
            rmctl(slist, pool, ev, NRPN_LO);
            setctl(slist, pool, ev);
            return None;
        }
        DATAENT_LO if flags.intersects(ConvFlags::RPN | ConvFlags::NRPN) => {
            let (cmd, num) = {
                let nrpn = getctx(slist, pool, ev, NRPN_HI, NRPN_LO);
                if nrpn != EV_UNDEF {
                    (Cmd::NRPN, nrpn)
                } else {
                    let rpn = getctx(slist, pool, ev, RPN_HI, RPN_LO);
                    if rpn == EV_UNDEF {
                        return None;
                    }
                    (Cmd::RPN, rpn)
                }
            };
            let hi = getctl(slist, pool, ev, DATAENT_HI);
            if hi == EV_UNDEF {
                return None;
            }
            let val = ev.ctl_val() | (hi << 7);
            return Some(if cmd == Cmd::NRPN {
                Ev::nrpn(ev.dev, ev.ch, num, val)
            } else {
                Ev::rpn(ev.dev, ev.ch, num, val)
            });
        }
        _ => {}
    }

    if num < 32 {
        if is_fine(xctlset, num) {
            // coarse half: hold it until the fine half arrives
            setctl(slist, pool, ev);
            return None;
        }
    } else if num < 64 {
        let coarse = num - 32;
        if is_fine(xctlset, coarse) {
            let hi = getctl(slist, pool, ev, coarse);
            if hi == EV_UNDEF {
                return None;
            }
            return Some(Ev::xctl(ev.dev, ev.ch, coarse, ev.ctl_val() | (hi << 7)));
        }
    }
    Some(Ev::xctl(ev.dev, ev.ch, num, ev.ctl_val() << 7))
}

/// Convert a context-free event to the wire-level events realizing it,
/// at most [`CONV_NUMREV`] of them. Events whose conversion is disabled
/// on this side produce nothing.
pub fn unpackev(
    slist: &mut StateList,
    pool: &mut StatePool,
    xctlset: u32,
    flags: ConvFlags,
    ev: &Ev,
) -> ConvOut {
    let mut out = ConvOut::new();
    match ev.cmd {
        Cmd::XCTL => {
            let num = ev.ctl_num();
            match num {
                BANK_HI | BANK_LO if flags.contains(ConvFlags::XPC) => return out,
                NRPN_HI | NRPN_LO if flags.contains(ConvFlags::NRPN) => return out,
                RPN_HI | RPN_LO if flags.contains(ConvFlags::RPN) => return out,
                DATAENT_HI | DATAENT_LO
                    if flags.intersects(ConvFlags::NRPN | ConvFlags::RPN) =>
                {
                    return out
                }
                _ => {}
            }
            if is_fine(xctlset, num) {
                let hi = ev.ctl_val() >> 7;
                let cur = getctl(slist, pool, ev, num);
                if cur != hi || cur == EV_UNDEF {
                    let msb = Ev::ctl(ev.dev, ev.ch, num, hi);
                    setctl(slist, pool, &msb);
                    out.push(msb);
                }
                out.push(Ev::ctl(ev.dev, ev.ch, num + 32, ev.ctl_val() & 0x7f));
            } else {
                out.push(Ev::ctl(ev.dev, ev.ch, num, ev.ctl_val() >> 7));
            }
        }
        Cmd::XPC => {
            if flags.contains(ConvFlags::XPC) {
                let cur = getctx(slist, pool, ev, BANK_HI, BANK_LO);
                let bank = ev.pc_bank();
                if cur != bank && bank != EV_UNDEF {
                    let msb = Ev::ctl(ev.dev, ev.ch, BANK_HI, bank >> 7);
                    setctl(slist, pool, &msb);
                    out.push(msb);
                    let lsb = Ev::ctl(ev.dev, ev.ch, BANK_LO, bank & 0x7f);
                    setctl(slist, pool, &lsb);
                    out.push(lsb);
                }
            }
            out.push(Ev::pc(ev.dev, ev.ch, ev.pc_prog()));
        }
        Cmd::NRPN => {
            if !flags.contains(ConvFlags::NRPN) {
                return out;
            }
            let cur = getctx(slist, pool, ev, NRPN_HI, NRPN_LO);
            if cur != ev.v0 {
                rmctl(slist, pool, ev, RPN_HI);
                rmctl(slist, pool, ev, RPN_LO);
                preamble(slist, pool, ev, NRPN_HI, NRPN_LO, &mut out);
            }
            dataentry(ev, &mut out);
        }
        Cmd::RPN => {
            if !flags.contains(ConvFlags::RPN) {
                return out;
            }
            let cur = getctx(slist, pool, ev, RPN_HI, RPN_LO);
            if cur != ev.v0 {
                rmctl(slist, pool, ev, NRPN_HI);
                rmctl(slist, pool, ev, NRPN_LO);
                preamble(slist, pool, ev, RPN_HI, RPN_LO, &mut out);
            }
            dataentry(ev, &mut out);
        }
        _ => out.push(*ev),
    }
    out
}

fn preamble(
    slist: &mut StateList,
    pool: &mut StatePool,
    ev: &Ev,
    hi: u32,
    lo: u32,
    out: &mut ConvOut,
) {
    let msb = Ev::ctl(ev.dev, ev.ch, hi, ev.v0 >> 7);
    setctl(slist, pool, &msb);
    out.push(msb);
    let lsb = Ev::ctl(ev.dev, ev.ch, lo, ev.v0 & 0x7f);
    setctl(slist, pool, &lsb);
    out.push(lsb);
}

fn dataentry(ev: &Ev, out: &mut ConvOut) {
    out.push(Ev::ctl(ev.dev, ev.ch, DATAENT_HI, ev.v1 >> 7));
    out.push(Ev::ctl(ev.dev, ev.ch, DATAENT_LO, ev.v1 & 0x7f));
}
