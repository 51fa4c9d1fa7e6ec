//! MIDI device ports.
//!
//! A [`MidiDev`] owns one port's complete wire state: the input parser
//! (running status, partial data bytes, sysex accumulation, the MTC
//! parser), the bounded output buffer with its running-status cache, the
//! active-sensing timers, and the per-device conversion and timing
//! settings. The [`DevList`] is the registry, with the two distinguished
//! slots for the clock source and the MTC source.

use bitflags::bitflags;
use smallvec::SmallVec;
use tracing::{debug, warn};

use segno_midi::defs::{DEFAULT_TPU, MAX_DEVS};
use segno_midi::{Cmd, ConvFlags, Ev, EvPat, MtcOut, MtcParser, EV_NOFF_DEFAULTVEL};

use crate::backend::DevOps;
use crate::error::{Error, Result};

/// Outbound active sensing is due after this much output silence (1/24 µs).
pub const OSENSTO: u32 = 250 * 24 * 1000;

/// Inbound sensing watchdog (1/24 µs).
pub const ISENSTO: u32 = 350 * 24 * 1000;

/// Device output buffer size in bytes.
pub const BUFLEN: usize = 1024;

/// Read chunk size used by the input drain.
pub const INBUFLEN: usize = 1024;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Mode: u8 {
        const IN = 1 << 0;
        const OUT = 1 << 1;
    }
}

/// One parsed item from a device's input stream.
#[derive(Debug, PartialEq, Eq)]
pub enum MidiIn {
    /// A complete voice event, in wire-level form (PC/CTL, not XPC/XCTL).
    Ev(Ev),
    /// MIDI clock (0xf8).
    Tick,
    /// MIDI start or continue (0xfa, 0xfb).
    Start,
    /// MIDI stop (0xfc).
    Stop,
    /// Active sensing (0xfe).
    Ack,
    /// A complete system-exclusive message, 0xf0 and 0xf7 included.
    Sysex(Vec<u8>),
    /// MTC state change from this device's quarter-frame parser.
    Mtc(MtcOut),
}

pub type MidiInVec = SmallVec<[MidiIn; 8]>;

pub struct MidiDev {
    ops: Box<dyn DevOps>,

    pub unit: usize,
    pub mode: Mode,
    pub eof: bool,

    /// Clock ticks this device expects per unit note.
    pub ticrate: u32,
    /// Running tick debt against the engine tick rate.
    pub ticdelta: u32,
    /// Forward MIDI clock to this device.
    pub sendclk: bool,
    /// Forward MMC start/stop/locate to this device.
    pub sendmmc: bool,
    /// Use running status on output.
    pub runst: bool,
    /// Flush after every message.
    pub sync: bool,

    /// Which controllers are 14-bit, input and output sides.
    pub ixctlset: u32,
    pub oxctlset: u32,
    /// Which conversions are enabled, input and output sides.
    pub ievset: ConvFlags,
    pub oevset: ConvFlags,

    /// Sensing timers, counted down by the engine timer; 0 means unarmed.
    pub isensto: u32,
    pub osensto: u32,

    pub imtc: MtcParser,

    // input parser state
    istatus: u8,
    icount: u8,
    idata: [u8; 2],
    isysex: Option<Vec<u8>>,

    // output state
    obuf: [u8; BUFLEN],
    oused: usize,
    ostatus: u8,
}

impl MidiDev {
    pub fn new(unit: usize, mode: Mode, ops: Box<dyn DevOps>) -> MidiDev {
        MidiDev {
            ops,
            unit,
            mode,
            eof: false,
            ticrate: DEFAULT_TPU,
            ticdelta: DEFAULT_TPU,
            sendclk: false,
            sendmmc: true,
            runst: true,
            sync: false,
            ixctlset: 0,
            oxctlset: 0,
            ievset: ConvFlags::empty(),
            oevset: ConvFlags::empty(),
            isensto: 0,
            osensto: OSENSTO,
            imtc: MtcParser::new(),
            istatus: 0,
            icount: 0,
            idata: [0; 2],
            isysex: None,
            obuf: [0; BUFLEN],
            oused: 0,
            ostatus: 0,
        }
    }

    pub fn open(&mut self) {
        self.eof = !self.ops.open();
        self.istatus = 0;
        self.icount = 0;
        self.isysex = None;
        self.imtc.reset();
        self.oused = 0;
        self.ostatus = 0;
        self.ticdelta = self.ticrate;
        self.isensto = 0;
        self.osensto = OSENSTO;
    }

    pub fn close(&mut self) {
        if self.isysex.take().is_some() {
            warn!(unit = self.unit, "lost incomplete sysex");
        }
        self.ops.close();
    }

    /// Read whatever the port has pending. An error marks the device
    /// failed and returns it.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.ops.read(buf) {
            Ok(n) => Ok(n),
            Err(e) => {
                self.eof = true;
                Err(Error::Io(e))
            }
        }
    }

    pub fn nfds(&self) -> usize {
        self.ops.nfds()
    }

    pub fn pollfd(&self, pfds: &mut [nix::libc::pollfd], events: i16) -> usize {
        self.ops.pollfd(pfds, events)
    }

    pub fn revents(&self, pfds: &[nix::libc::pollfd]) -> i16 {
        self.ops.revents(pfds)
    }

    /// Number of data bytes for a voice status byte.
    fn voice_len(status: u8) -> u8 {
        match status & 0xf0 {
            0xc0 | 0xd0 => 1,
            _ => 2,
        }
    }

    fn voice_ev(&self, status: u8, data: &[u8]) -> Ev {
        let ch = status & 0x0f;
        let dev = self.unit as u8;
        match status & 0xf0 {
            0x80 => Ev::note_off(dev, ch, data[0] as u32, data[1] as u32),
            0x90 => {
                if data[1] == 0 {
                    // note-on with velocity 0 is a note-off
                    Ev::note_off(dev, ch, data[0] as u32, EV_NOFF_DEFAULTVEL)
                } else {
                    Ev::note_on(dev, ch, data[0] as u32, data[1] as u32)
                }
            }
            0xa0 => Ev::key_aftertouch(dev, ch, data[0] as u32, data[1] as u32),
            0xb0 => Ev::ctl(dev, ch, data[0] as u32, data[1] as u32),
            0xc0 => Ev::pc(dev, ch, data[0] as u32),
            0xd0 => Ev::chan_aftertouch(dev, ch, data[0] as u32),
            0xe0 => Ev::bend(dev, ch, data[0] as u32 | ((data[1] as u32) << 7)),
            _ => unreachable!(),
        }
    }

    fn sysex_done(&mut self, out: &mut MidiInVec) {
        let Some(data) = self.isysex.take() else {
            return;
        };
        if let Some(mtc) = self.imtc.full_frame(&data) {
            out.push(MidiIn::Mtc(mtc));
            return;
        }
        // other universal real-time MTC messages are not recordable
        if data.len() >= 6 && data[1] == 0x7f && data[3] == 0x01 {
            debug!(unit = self.unit, "discarded real-time sysex");
            return;
        }
        out.push(MidiIn::Sysex(data));
    }

    /// Feed raw bytes from the port into the parser.
    pub fn inputcb(&mut self, bytes: &[u8], out: &mut MidiInVec) {
        for &b in bytes {
            if b >= 0xf8 {
                // system real-time: processed immediately, transparent to
                // the rest of the parser state
                match b {
                    0xf8 => out.push(MidiIn::Tick),
                    0xfa | 0xfb => out.push(MidiIn::Start),
                    0xfc => out.push(MidiIn::Stop),
                    0xfe => out.push(MidiIn::Ack),
                    _ => debug!(unit = self.unit, byte = b, "ignored real-time byte"),
                }
                continue;
            }
            if b >= 0x80 {
                if b != 0xf7 && self.isysex.take().is_some() {
                    debug!(unit = self.unit, "aborted incomplete sysex");
                }
                match b {
                    0xf0 => {
                        let mut v = Vec::with_capacity(64);
                        v.push(0xf0);
                        self.isysex = Some(v);
                        self.istatus = 0;
                    }
                    0xf7 => {
                        if let Some(v) = self.isysex.as_mut() {
                            v.push(0xf7);
                            self.sysex_done(out);
                        }
                        self.istatus = 0;
                    }
                    0xf1 | 0xf2 | 0xf3 => {
                        // system common with data: quarter frame, song
                        // position, song select
                        self.istatus = b;
                        self.icount = 0;
                    }
                    0xf4..=0xf6 => self.istatus = 0,
                    _ => {
                        self.istatus = b;
                        self.icount = 0;
                    }
                }
                continue;
            }
            // data byte
            if let Some(v) = self.isysex.as_mut() {
                v.push(b);
                continue;
            }
            match self.istatus {
                0 => {
                    // stray data byte, no running status to attach it to
                }
                0xf1 => {
                    if let Some(mtc) = self.imtc.quarter_frame(b) {
                        out.push(MidiIn::Mtc(mtc));
                    }
                    self.istatus = 0;
                }
                0xf2 => {
                    // song position pointer: consume and ignore
                    self.idata[self.icount as usize] = b;
                    self.icount += 1;
                    if self.icount == 2 {
                        self.istatus = 0;
                    }
                }
                0xf3 => {
                    // song select: consume and ignore
                    self.istatus = 0;
                }
                status => {
                    self.idata[self.icount as usize] = b;
                    self.icount += 1;
                    if self.icount == Self::voice_len(status) {
                        let ev = self.voice_ev(status, &self.idata[..self.icount as usize]);
                        out.push(MidiIn::Ev(ev));
                        self.icount = 0;
                    }
                }
            }
        }
    }

    fn out(&mut self, byte: u8) {
        if self.oused == BUFLEN {
            self.flush();
        }
        self.obuf[self.oused] = byte;
        self.oused += 1;
    }

    /// Encode one wire-level voice event, with running status when the
    /// device allows it. Pattern events render through `pat`.
    pub fn putev(&mut self, ev: &Ev, pat: Option<&EvPat>) {
        if ev.cmd.is_sx() {
            match pat {
                Some(pat) => {
                    let mut buf = Vec::with_capacity(16);
                    pat.render(ev.v0, ev.v1, &mut buf);
                    self.sendraw(&buf);
                }
                None => warn!(unit = self.unit, %ev, "no pattern for event, dropped"),
            }
            if self.sync {
                self.flush();
            }
            return;
        }
        let (nib, d0, d1) = match ev.cmd {
            Cmd::NOFF => (0x80, ev.note_num(), Some(ev.note_vel())),
            Cmd::NON => (0x90, ev.note_num(), Some(ev.note_vel())),
            Cmd::KAT => (0xa0, ev.note_num(), Some(ev.note_vel())),
            Cmd::CTL => (0xb0, ev.ctl_num(), Some(ev.ctl_val())),
            Cmd::PC => (0xc0, ev.pc_prog(), None),
            Cmd::CAT => (0xd0, ev.cat_val(), None),
            Cmd::BEND => (0xe0, ev.bend_val() & 0x7f, Some(ev.bend_val() >> 7)),
            _ => {
                // conversion must reduce everything else before it gets here
                tracing::error!(unit = self.unit, %ev, "not a wire-level event");
                panic!("mididev: not a wire-level event");
            }
        };
        let status = nib | ev.ch;
        if !(self.runst && self.ostatus == status) {
            self.ostatus = status;
            self.out(status);
        }
        self.out((d0 & 0x7f) as u8);
        if let Some(d1) = d1 {
            self.out((d1 & 0x7f) as u8);
        }
        if self.sync {
            self.flush();
        }
    }

    pub fn puttic(&mut self) {
        self.out(0xf8);
    }

    pub fn putstart(&mut self) {
        self.out(0xfa);
    }

    pub fn putstop(&mut self) {
        self.out(0xfc);
    }

    pub fn putack(&mut self) {
        self.out(0xfe);
    }

    /// Queue raw bytes, typically a sysex message. Cancels running status.
    pub fn sendraw(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.out(b);
        }
        self.ostatus = 0;
    }

    /// Write out the queued bytes. Restarts the sensing timer whenever
    /// something was actually sent.
    pub fn flush(&mut self) {
        let mut done = 0;
        while done < self.oused {
            match self.ops.write(&self.obuf[done..self.oused]) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) => {
                    warn!(unit = self.unit, error = %e, "write failed, device lost");
                    self.eof = true;
                    self.oused = 0;
                    return;
                }
            }
        }
        if done > 0 {
            self.osensto = OSENSTO;
            self.obuf.copy_within(done..self.oused, 0);
            self.oused -= done;
        }
    }
}

/// The device registry: slots indexed by unit number plus the two
/// distinguished synchronization source designations.
#[derive(Default)]
pub struct DevList {
    devs: Vec<Option<MidiDev>>,
    clksrc: Option<usize>,
    mtcsrc: Option<usize>,
}

impl DevList {
    pub fn new() -> DevList {
        let mut devs = Vec::with_capacity(MAX_DEVS);
        devs.resize_with(MAX_DEVS, || None);
        DevList {
            devs,
            clksrc: None,
            mtcsrc: None,
        }
    }

    pub fn attach(&mut self, dev: MidiDev) -> Result<()> {
        let unit = dev.unit;
        let slot = self.devs.get_mut(unit).ok_or(Error::BadUnit(unit))?;
        if slot.is_some() {
            return Err(Error::UnitInUse(unit));
        }
        *slot = Some(dev);
        Ok(())
    }

    pub fn detach(&mut self, unit: usize) -> Result<MidiDev> {
        if self.clksrc == Some(unit) {
            self.clksrc = None;
        }
        if self.mtcsrc == Some(unit) {
            self.mtcsrc = None;
        }
        self.devs
            .get_mut(unit)
            .and_then(Option::take)
            .ok_or(Error::BadUnit(unit))
    }

    #[inline]
    pub fn get(&self, unit: usize) -> Option<&MidiDev> {
        self.devs.get(unit).and_then(Option::as_ref)
    }

    #[inline]
    pub fn get_mut(&mut self, unit: usize) -> Option<&mut MidiDev> {
        self.devs.get_mut(unit).and_then(Option::as_mut)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MidiDev> {
        self.devs.iter().filter_map(Option::as_ref)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut MidiDev> {
        self.devs.iter_mut().filter_map(Option::as_mut)
    }

    pub fn units(&self) -> impl Iterator<Item = usize> + '_ {
        self.devs
            .iter()
            .enumerate()
            .filter_map(|(u, d)| d.as_ref().map(|_| u))
    }

    /// The device whose incoming MIDI clock drives the transport, if any.
    pub fn clksrc(&self) -> Option<usize> {
        self.clksrc
    }

    /// The device whose incoming MTC drives the transport, if any.
    pub fn mtcsrc(&self) -> Option<usize> {
        self.mtcsrc
    }

    pub fn set_clksrc(&mut self, unit: Option<usize>) -> Result<()> {
        if let Some(u) = unit {
            if self.get(u).is_none() {
                return Err(Error::BadUnit(u));
            }
        }
        self.clksrc = unit;
        Ok(())
    }

    pub fn set_mtcsrc(&mut self, unit: Option<usize>) -> Result<()> {
        if let Some(u) = unit {
            if self.get(u).is_none() {
                return Err(Error::BadUnit(u));
            }
        }
        self.mtcsrc = unit;
        Ok(())
    }
}
