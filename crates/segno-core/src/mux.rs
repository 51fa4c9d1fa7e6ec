//! The transport and device multiplexer.
//!
//! The clock unit is the 24th of a microsecond, so tempi round-trip
//! losslessly with standard MIDI files. The timer walks through the
//! following phases:
//!
//! ```text
//! STOP -> STARTWAIT -> START -> FIRST -> NEXT -> STOP
//! ```
//!
//! STARTWAIT waits (forever) for a MIDI start event; with no external
//! clock source one is generated immediately. START waits for the first
//! clock tick, or for [`MUX_START_DELAY`] on the internal clock. FIRST is
//! the tick that begins the music; NEXT moves it one step forward. Ticks
//! come from exactly one place: the clock source device if there is one,
//! else the MTC source, else the internal timer crossing `nextpos`.

use smallvec::SmallVec;
use tracing::{debug, error, warn};

use segno_midi::defs::{
    CTL_ALLNOTSOFF, CTL_RESETALL, DEFAULT_FPS, DEFAULT_TPU, DEFAULT_USEC24, MAX_DEVS,
};
use segno_midi::{Ev, MtcOut, PatSet, MTC_SEC};
use segno_midi_io::{DevList, MidiDev, MidiIn, MidiInVec, Poller, Result, INBUFLEN, ISENSTO, OSENSTO};

use crate::conv;
use crate::filt::Filt;
use crate::metro::Metro;
use crate::mixout::{Mixout, MIXOUT_TIMO};
use crate::norm::Norm;
use crate::pool::Pool;
use crate::song::{Loc, Song};
use crate::state::{StateIter, StateList, StatePool, MAXNSTATES};
use crate::timeout::TimoQueue;

/// Delay between the generated start event and the first tick when the
/// internal clock is the master: one tick at 30 bpm.
pub const MUX_START_DELAY: u32 = 24_000_000 / 3;

const MMC_START: [u8; 6] = [0xf0, 0x7f, 0x7f, 0x06, 0x02, 0xf7];
const MMC_STOP: [u8; 6] = [0xf0, 0x7f, 0x7f, 0x06, 0x01, 0xf7];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MuxPhase {
    /// Waiting for a start event.
    StartWait = 0,
    /// Just got a start, waiting for the first tick.
    Start = 1,
    /// Just got the first tick.
    First = 2,
    /// Got a subsequent tick.
    Next = 3,
    /// Nothing to do.
    Stop = 4,
}

/// Tokens on the engine timeout wheel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimoTok {
    /// Mixer state aging.
    Mixout,
    /// Input-side state sweeps.
    Outdate,
    /// Metronome click-off.
    Metro,
}

pub struct Mux {
    phase: MuxPhase,
    reqphase: MuxPhase,
    /// Tick length in 1/24 µs (the tempo).
    ticlength: u32,
    /// Ticks per unit note.
    ticrate: u32,
    curpos: u32,
    nextpos: u32,
    curtic: u32,
    wallclock: u32,
    manualstart: bool,

    devs: DevList,
    timo: TimoQueue<TimoTok>,
    spool: StatePool,
    /// Conversion context for the input side.
    istate: StateList,
    /// Conversion context for the output side.
    ostate: StateList,
    norm: Norm,
    filt: Filt,
    mixout: Mixout,
    metro: Metro,
    patset: PatSet,
}

impl Default for Mux {
    fn default() -> Self {
        Self::new()
    }
}

impl Mux {
    pub fn new() -> Mux {
        Mux {
            phase: MuxPhase::Stop,
            reqphase: MuxPhase::Stop,
            ticlength: DEFAULT_USEC24,
            ticrate: DEFAULT_TPU,
            curpos: 0,
            nextpos: 0,
            curtic: 0,
            wallclock: 0,
            manualstart: true,
            devs: DevList::new(),
            timo: TimoQueue::new(),
            spool: Pool::new("state", MAXNSTATES),
            istate: StateList::new(),
            ostate: StateList::new(),
            norm: Norm::new(),
            filt: Filt::new(),
            mixout: Mixout::new(),
            metro: Metro::new(),
            patset: PatSet::new(),
        }
    }

    /// Open all devices and reset the clock state.
    pub fn open(&mut self) {
        self.ticlength = DEFAULT_USEC24;
        self.ticrate = DEFAULT_TPU;
        for dev in self.devs.iter_mut() {
            dev.open();
        }
        self.curpos = 0;
        self.nextpos = 0;
        self.curtic = 0;
        self.reqphase = MuxPhase::Stop;
        self.phase = MuxPhase::Stop;
        self.wallclock = 0;
        self.timo = TimoQueue::new();
        self.timo.add(TimoTok::Mixout, MIXOUT_TIMO);
        self.timo.add(TimoTok::Outdate, MIXOUT_TIMO);
    }

    /// Flush and close all devices, releasing the tracked state.
    pub fn close(&mut self) {
        self.flush();
        for dev in self.devs.iter_mut() {
            dev.close();
        }
        self.norm.done(&mut self.spool);
        self.filt.done(&mut self.spool);
        self.mixout.done(&mut self.spool);
        self.istate.done(&mut self.spool);
        self.ostate.done(&mut self.spool);
    }

    pub fn devs(&self) -> &DevList {
        &self.devs
    }

    pub fn devs_mut(&mut self) -> &mut DevList {
        &mut self.devs
    }

    pub fn attach(&mut self, dev: MidiDev) -> Result<()> {
        self.devs.attach(dev)
    }

    pub fn detach(&mut self, unit: usize) -> Result<MidiDev> {
        self.devs.detach(unit)
    }

    pub fn patset(&self) -> &PatSet {
        &self.patset
    }

    pub fn patset_mut(&mut self) -> &mut PatSet {
        &mut self.patset
    }

    pub fn filt_mut(&mut self) -> &mut Filt {
        &mut self.filt
    }

    pub fn metro_mut(&mut self) -> &mut Metro {
        &mut self.metro
    }

    pub fn phase(&self) -> MuxPhase {
        self.phase
    }

    pub fn curtic(&self) -> u32 {
        self.curtic
    }

    pub fn wallclock(&self) -> u32 {
        self.wallclock
    }

    pub fn ticlength(&self) -> u32 {
        self.ticlength
    }

    /// Live frames of the input stream, for serialization and queries.
    pub fn input_frames(&self) -> StateIter<'_> {
        self.norm.states().iter(&self.spool)
    }

    fn chgphase(&mut self, phase: MuxPhase) {
        debug!(from = ?self.phase, to = ?phase, "phase change");
        self.phase = phase;
    }

    /// Send a clock tick to every device that wants real-time events,
    /// scaled by its tick rate. A device faster than the engine receives
    /// several clock bytes per engine tick.
    fn sendtic(&mut self) {
        let clksrc = self.devs.clksrc();
        let ticrate = self.ticrate;
        for dev in self.devs.iter_mut() {
            if dev.sendclk && Some(dev.unit) != clksrc {
                while dev.ticdelta >= ticrate {
                    dev.puttic();
                    dev.ticdelta -= ticrate;
                }
                dev.ticdelta += dev.ticrate;
            }
        }
    }

    fn sendstart(&mut self) {
        let clksrc = self.devs.clksrc();
        for dev in self.devs.iter_mut() {
            if dev.sendclk && Some(dev.unit) != clksrc {
                dev.ticdelta = dev.ticrate;
                // a spurious tick just before the start announces that we
                // are the clock master
                dev.puttic();
                dev.putstart();
            }
        }
    }

    fn sendstop(&mut self) {
        let clksrc = self.devs.clksrc();
        for dev in self.devs.iter_mut() {
            if dev.sendclk && Some(dev.unit) != clksrc {
                dev.putstop();
            }
        }
    }

    /// Send a voice event to its device; this is the only egress point.
    /// The output conversion context decides how it hits the wire.
    pub fn putev(&mut self, ev: &Ev) {
        if !ev.cmd.is_voice() && !ev.cmd.is_sx() {
            error!(%ev, "only voice events can be sent");
            panic!("mux: only voice events can be sent");
        }
        let unit = ev.dev as usize;
        if unit >= MAX_DEVS {
            error!(%ev, "bogus unit number");
            panic!("mux: bogus unit number");
        }
        let Some(dev) = self.devs.get(unit) else {
            return;
        };
        let (oxctl, oevset) = (dev.oxctlset, dev.oevset);
        let revs = conv::unpackev(&mut self.ostate, &mut self.spool, oxctl, oevset, ev);
        let Some(dev) = self.devs.get_mut(unit) else {
            return;
        };
        for rev in &revs {
            let pat = rev.cmd.pat_slot().and_then(|s| self.patset.get(s));
            dev.putev(rev, pat);
        }
    }

    /// Send raw bytes (typically sysex) to a device.
    pub fn sendraw(&mut self, unit: usize, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        if let Some(dev) = self.devs.get_mut(unit) {
            dev.sendraw(bytes);
        }
    }

    /// Submit an event for output through the priority mixer.
    pub fn mixout_putev(&mut self, ev: &Ev, prio: u32) {
        let outs = self.mixout.putev(&mut self.spool, ev, prio);
        for ev in outs {
            self.putev(&ev);
        }
    }

    pub fn flush(&mut self) {
        for dev in self.devs.iter_mut() {
            dev.flush();
        }
    }

    /// Change the tempo. While running, the in-progress tick is stretched
    /// or shrunk by the difference so timing drifts smoothly.
    pub fn chgtempo(&mut self, ticlength: u32) {
        assert!(ticlength > 0);
        if self.phase == MuxPhase::First || self.phase == MuxPhase::Next {
            self.nextpos = self.nextpos.wrapping_add(ticlength).wrapping_sub(self.ticlength);
        }
        self.ticlength = ticlength;
    }

    /// Change the number of ticks per unit note.
    pub fn chgticrate(&mut self, tpu: u32) {
        self.ticrate = tpu;
    }

    /// Start waiting for a MIDI start event, or generate one right away
    /// if we are the clock master. With `manualstart` the zeroth tick is
    /// not triggered automatically.
    pub fn startreq(&mut self, manualstart: bool, song: &mut dyn Song) {
        self.manualstart = manualstart;
        self.reqphase = MuxPhase::StartWait;
        if self.phase != MuxPhase::Stop {
            error!(phase = ?self.phase, "bad state for a start request");
            panic!("mux: bad state for a start request");
        }
        self.chgphase(MuxPhase::StartWait);
        if self.devs.clksrc().is_none() && self.devs.mtcsrc().is_none() {
            debug!("generated internal start");
            self.curpos = 0;
            self.nextpos = MUX_START_DELAY;
            self.mtcstart(0, song);
        } else {
            self.curpos = 0;
            self.nextpos = self.ticlength;
        }
        for dev in self.devs.iter_mut() {
            if dev.sendmmc {
                dev.sendraw(&MMC_START);
            }
        }
    }

    /// Stop the clock.
    pub fn stopreq(&mut self, song: &mut dyn Song) {
        self.reqphase = MuxPhase::Stop;
        if self.phase < MuxPhase::Stop {
            self.stopcb(song);
        }
        for dev in self.devs.iter_mut() {
            if dev.sendmmc {
                dev.sendraw(&MMC_STOP);
            }
        }
    }

    /// Relocate: tell MMC followers where we are.
    pub fn gotoreq(&mut self, mmcpos: u32) {
        // 25 fps rate bits in the hour byte
        const FPS_ID: u8 = 1 << 5;
        let mmc_reloc: [u8; 13] = [
            0xf0,
            0x7f,
            0x7f,
            0x06,
            0x44,
            0x06,
            0x01,
            ((mmcpos / (3600 * MTC_SEC)) % 24) as u8 | FPS_ID,
            ((mmcpos / (60 * MTC_SEC)) % 60) as u8,
            ((mmcpos / MTC_SEC) % 60) as u8,
            ((mmcpos / (MTC_SEC / DEFAULT_FPS)) % DEFAULT_FPS) as u8,
            0,
            0xf7,
        ];
        for dev in self.devs.iter_mut() {
            if dev.sendmmc {
                dev.sendraw(&mmc_reloc);
            }
        }
    }

    /// The MTC timer started (full frame received), or an internal start
    /// is being generated.
    pub fn mtcstart(&mut self, mtcpos: u32, song: &mut dyn Song) {
        // if already started, stop first so we can restart cleanly
        if self.phase >= MuxPhase::Start && self.phase <= MuxPhase::Next {
            debug!("mtc start while running, triggered stop");
            self.mtcstop(song);
        }
        if self.phase == MuxPhase::Stop {
            debug!("ignored mtc start (stopped)");
            return;
        }
        if self.devs.mtcsrc().is_some() {
            self.curpos = song.gotocb(self, Loc::Mtc, mtcpos);
            self.nextpos = self.ticlength;
            if self.curpos >= self.nextpos {
                error!(
                    curpos = self.curpos,
                    ticlength = self.ticlength,
                    "mtc offset larger than one tick"
                );
                panic!("mux: mtc offset larger than one tick");
            }
        }
        self.startcb(song);
    }

    /// Advance the position accumulator; fires ticks on tick-boundary
    /// crossings. Driven by the MTC source, or by the internal timer when
    /// there is no external source at all.
    pub fn mtctick(&mut self, delta: u32, song: &mut dyn Song) {
        if self.devs.clksrc().is_some() {
            // an external clock source owns the tick stream
            return;
        }
        self.curpos += delta;
        while self.curpos >= self.nextpos {
            self.curpos -= self.nextpos;
            self.nextpos = self.ticlength;
            // in manual-start mode the zeroth tick is not auto-triggered
            if !self.manualstart || self.phase != MuxPhase::Start {
                self.ticcb(song);
            }
        }
    }

    /// The MTC timer stopped.
    pub fn mtcstop(&mut self, song: &mut dyn Song) {
        if self.devs.clksrc().is_some() {
            return;
        }
        if self.phase >= MuxPhase::Start && self.phase < MuxPhase::Stop {
            debug!("mtc stop, generated stop");
            self.stopcb(song);
        }
    }

    /// Called on every timer wake with the elapsed 1/24 µs.
    pub fn timercb(&mut self, delta: u32, song: &mut dyn Song) {
        self.wallclock = self.wallclock.wrapping_add(delta);

        self.timo.advance(delta);
        while let Some(tok) = self.timo.pop_expired() {
            match tok {
                TimoTok::Mixout => {
                    self.mixout.timocb(&mut self.spool);
                    self.timo.add(TimoTok::Mixout, MIXOUT_TIMO);
                }
                TimoTok::Outdate => {
                    self.norm.outdate(&mut self.spool);
                    self.filt.outdate(&mut self.spool);
                    self.timo.add(TimoTok::Outdate, MIXOUT_TIMO);
                }
                TimoTok::Metro => {
                    if let Some(off) = self.metro.timeout() {
                        self.putev(&off);
                    }
                }
            }
        }

        // sensing and MTC watchdogs
        let mut mtc_stops: SmallVec<[usize; 2]> = SmallVec::new();
        for dev in self.devs.iter_mut() {
            if dev.isensto > 0 {
                if dev.isensto <= delta {
                    dev.isensto = 0;
                    warn!(unit = dev.unit, "sensing timeout, disabled");
                } else {
                    dev.isensto -= delta;
                }
            }
            if dev.osensto > 0 {
                if dev.osensto <= delta {
                    dev.putack();
                    dev.flush();
                    dev.osensto = OSENSTO;
                } else {
                    dev.osensto -= delta;
                }
            }
            if dev.imtc.timo > 0 {
                if dev.imtc.timo <= delta {
                    dev.imtc.timo = 0;
                    if dev.imtc.timeout().is_some() {
                        mtc_stops.push(dev.unit);
                    }
                } else {
                    dev.imtc.timo -= delta;
                }
            }
        }
        for unit in mtc_stops {
            if self.devs.mtcsrc() == Some(unit) {
                self.mtcstop(song);
            }
        }

        // with no external source the timer itself generates the position
        if self.devs.mtcsrc().is_none() && self.devs.clksrc().is_none() {
            match self.phase {
                MuxPhase::StartWait => {
                    if !self.manualstart {
                        error!("startwait with automatic start");
                        panic!("mux: startwait with automatic start");
                    }
                }
                MuxPhase::Start => {
                    self.curpos += delta;
                    if self.curpos >= self.nextpos {
                        self.curpos = 0;
                        self.nextpos = 0;
                        self.mtctick(0, song);
                    }
                }
                MuxPhase::First | MuxPhase::Next => self.mtctick(delta, song),
                MuxPhase::Stop => {}
            }
        }
    }

    /// A tick arrived (from the clock source, or generated). The clock
    /// source's tick rate is reconciled with ours here: a source ticking
    /// faster than the engine accumulates debt until a full engine tick
    /// is due, a slower one fires several engine ticks at once.
    pub fn ticcb(&mut self, song: &mut dyn Song) {
        loop {
            if let Some(cs) = self.devs.clksrc() {
                let dev = self.devs.get_mut(cs).expect("clock source is attached");
                if dev.ticdelta < dev.ticrate {
                    dev.ticdelta += self.ticrate;
                    break;
                }
            }
            if self.phase == MuxPhase::First {
                self.chgphase(MuxPhase::Next);
            } else if self.phase == MuxPhase::Start {
                self.curpos = 0;
                self.nextpos = self.ticlength;
                self.chgphase(MuxPhase::First);
            }
            if self.phase == MuxPhase::Next {
                self.curtic = self.curtic.wrapping_add(1);
                self.sendtic();
                song.movecb(self);
            } else if self.phase == MuxPhase::First {
                self.curtic = 0;
                self.sendtic();
                song.startcb(self);
            }
            let Some(cs) = self.devs.clksrc() else {
                break;
            };
            let dev = self.devs.get_mut(cs).expect("clock source is attached");
            dev.ticdelta -= dev.ticrate;
        }
    }

    /// A MIDI start arrived from the clock source.
    pub fn startcb(&mut self, song: &mut dyn Song) {
        debug!("got start event");
        if self.phase != MuxPhase::StartWait {
            warn!(phase = ?self.phase, "ignored MIDI start (not ready)");
            return;
        }
        if self.devs.clksrc().is_some() {
            // external starts always restart from the beginning; song
            // position pointers are not supported
            self.curpos = 0;
            self.nextpos = self.ticlength;
            song.gotocb(self, Loc::Mtc, 0);
        }
        self.chgphase(MuxPhase::Start);
        self.sendstart();
        self.flush();
    }

    /// A MIDI stop arrived from the clock source, or a stop request is
    /// being honored.
    pub fn stopcb(&mut self, song: &mut dyn Song) {
        debug!("got stop event");
        if self.phase >= MuxPhase::Start && self.phase <= MuxPhase::Next {
            self.sendstop();
        }
        self.chgphase(self.reqphase);
        if let Some(off) = self.metro.shut() {
            self.timo.del(&TimoTok::Metro);
            self.putev(&off);
        }
        song.stopcb(self);
        self.flush();
    }

    /// Active sensing arrived: arm the inbound watchdog.
    pub fn ackcb(&mut self, unit: usize) {
        if let Some(dev) = self.devs.get_mut(unit) {
            if dev.isensto == 0 {
                debug!(unit, "sensing enabled");
                dev.isensto = ISENSTO;
            }
        }
    }

    /// A voice event arrived from a device: convert it to context-free
    /// form and push it down the input chain.
    pub fn evcb(&mut self, ev: &Ev, song: &mut dyn Song) {
        let Some(dev) = self.devs.get(ev.dev as usize) else {
            return;
        };
        let (ixctl, ievset) = (dev.ixctlset, dev.ievset);
        if let Some(rev) = conv::packev(&mut self.istate, &mut self.spool, ixctl, ievset, ev) {
            self.norm_evcb(&rev, song);
        }
    }

    fn norm_evcb(&mut self, ev: &Ev, song: &mut dyn Song) {
        if !self.norm.evcb(&mut self.spool, ev) {
            return;
        }
        if let Some(fev) = self.filt.apply(&mut self.spool, ev) {
            song.evcb(self, &fev);
        }
    }

    /// A complete sysex arrived: registered patterns turn it into an
    /// event, everything else goes to the song for recording.
    pub fn sysexcb(&mut self, unit: usize, data: Vec<u8>, song: &mut dyn Song) {
        if let Some(ev) = self.patset.match_sysex(unit as u8, &data) {
            self.norm_evcb(&ev, song);
            return;
        }
        song.sysexcb(self, unit, data);
    }

    /// A device failed: quiesce everything that may keep sounding and
    /// keep running with the other devices.
    pub fn errorcb(&mut self, unit: usize, song: &mut dyn Song) {
        warn!(unit, "device error, quiescing outputs");
        self.shut(song);
        self.flush();
    }

    /// Cancel all open frames, then silence every active channel.
    pub fn shut(&mut self, song: &mut dyn Song) {
        let cancels = self.norm.shut(&self.spool);
        for ev in cancels {
            self.norm_evcb(&ev, song);
        }
        let (cancels, chans) = self.mixout.shut(&mut self.spool);
        for ev in cancels {
            self.putev(&ev);
        }
        for (dev, ch) in chans {
            self.putev(&Ev::ctl(dev, ch, CTL_ALLNOTSOFF, 0));
            self.putev(&Ev::ctl(dev, ch, CTL_RESETALL, 0));
        }
    }

    /// Metronome hook, called by the song layer with the position inside
    /// the measure.
    pub fn metro_tic(&mut self, beat: u32, tic: u32, recording: bool) {
        if let Some(click) = self.metro.tic(beat, tic, recording) {
            if let Some(prev_off) = click.prev_off {
                self.timo.del(&TimoTok::Metro);
                self.putev(&prev_off);
            }
            let clicklen = self.metro.clicklen;
            self.putev(&click.on);
            self.timo.add(TimoTok::Metro, clicklen);
        }
    }

    /// Feed raw bytes read from a device into the engine, dispatching
    /// everything they complete. This is the ingress used by the run
    /// loop and by device drivers with their own buffering.
    pub fn feed(&mut self, unit: usize, bytes: &[u8], song: &mut dyn Song) {
        let mut items = MidiInVec::new();
        {
            let Some(dev) = self.devs.get_mut(unit) else {
                return;
            };
            dev.inputcb(bytes, &mut items);
            if dev.isensto > 0 {
                dev.isensto = ISENSTO;
            }
        }
        for item in items {
            match item {
                MidiIn::Ev(ev) => self.evcb(&ev, song),
                MidiIn::Tick => {
                    if self.devs.clksrc() == Some(unit) {
                        self.ticcb(song);
                    }
                }
                MidiIn::Start => {
                    if self.devs.clksrc() == Some(unit) {
                        self.startcb(song);
                    }
                }
                MidiIn::Stop => {
                    if self.devs.clksrc() == Some(unit) {
                        self.stopcb(song);
                    }
                }
                MidiIn::Ack => self.ackcb(unit),
                MidiIn::Sysex(data) => self.sysexcb(unit, data, song),
                MidiIn::Mtc(out) => {
                    if self.devs.mtcsrc() == Some(unit) {
                        match out {
                            MtcOut::Start(pos) => self.mtcstart(pos, song),
                            MtcOut::Tick(d) => self.mtctick(d, song),
                            MtcOut::Stop => self.mtcstop(song),
                        }
                    }
                }
            }
        }
    }

    /// One iteration of the event loop: wait for input or the timer,
    /// drain readable devices, advance time, flush output. Returns false
    /// when a quit was requested.
    pub fn run_once(&mut self, poller: &mut Poller, song: &mut dyn Song) -> Result<bool> {
        let wake = poller.wait(&self.devs)?;
        if wake.quit {
            return Ok(false);
        }
        let mut buf = [0u8; INBUFLEN];
        for unit in wake.ready.iter().copied() {
            let res = {
                let Some(dev) = self.devs.get_mut(unit) else {
                    continue;
                };
                let has_fds = dev.nfds() > 0;
                match dev.read(&mut buf) {
                    Ok(0) if has_fds => {
                        // end of file on a readable descriptor
                        dev.eof = true;
                        Err(())
                    }
                    Ok(n) => Ok(n),
                    Err(_) => Err(()),
                }
            };
            match res {
                Ok(n) if n > 0 => self.feed(unit, &buf[..n], song),
                Ok(_) => {}
                Err(()) => self.errorcb(unit, song),
            }
        }
        if wake.elapsed_usec24 > 0 {
            self.timercb(wake.elapsed_usec24, song);
        }
        self.flush();
        Ok(true)
    }

    /// Run the event loop until a quit is requested.
    pub fn run(&mut self, poller: &mut Poller, song: &mut dyn Song) -> Result<()> {
        while self.run_once(poller, song)? {}
        Ok(())
    }
}
