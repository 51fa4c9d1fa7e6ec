//! MIDI Time Code reassembly.
//!
//! A complete MTC position arrives as eight quarter-frame messages; a full
//! frame sysex announces the position when the upstream transport is not
//! rolling. The parser turns that stream into three outputs: an absolute
//! start position, elapsed-time ticks, and a stop when the source goes
//! silent or desyncs.

use tracing::debug;

/// Units per second of absolute MTC positions. A common multiple of all
/// supported quarter-frame frequencies (96, 100, 120 per second).
pub const MTC_SEC: u32 = 2400;

/// MTC counters wrap every 24 hours.
pub const MTC_PERIOD: u32 = 24 * 60 * 60 * MTC_SEC;

/// Watchdog delay for the next quarter frame, in 1/24 µs. A quarter frame
/// is due every 8.3 ms at the slowest rate; a quarter second of silence
/// means the source is gone.
pub const MTC_TIMO: u32 = 250 * 24 * 1000;

/// SMPTE frame rate carried in the rate bits of the hour byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameRate {
    Fps24 = 0,
    #[default]
    Fps25 = 1,
    /// 29.97 fps drop-frame; counted as 30 frames per second.
    Fps2997 = 2,
    Fps30 = 3,
}

impl FrameRate {
    pub fn from_bits(bits: u8) -> FrameRate {
        match bits & 3 {
            0 => FrameRate::Fps24,
            1 => FrameRate::Fps25,
            2 => FrameRate::Fps2997,
            _ => FrameRate::Fps30,
        }
    }

    /// Nominal frame count per second, used to scale positions.
    pub fn fps(self) -> u32 {
        match self {
            FrameRate::Fps24 => 24,
            FrameRate::Fps25 => 25,
            FrameRate::Fps2997 | FrameRate::Fps30 => 30,
        }
    }

    /// Duration of one quarter frame in 1/24 µs.
    pub fn qf_usec24(self) -> u32 {
        match self {
            FrameRate::Fps24 => 250_000,
            FrameRate::Fps25 => 240_000,
            FrameRate::Fps2997 => 200_200,
            FrameRate::Fps30 => 200_000,
        }
    }

    /// MTC ticks per quarter frame.
    fn qf_ticks(self) -> u32 {
        MTC_SEC / (4 * self.fps())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MtcState {
    /// No position yet; quarter frames are ignored.
    #[default]
    Stop,
    /// Got a full frame but no quarter frame yet.
    Start,
    /// Got at least one quarter frame.
    Run,
}

/// Parser output, to be fed to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MtcOut {
    /// Timer started at the given absolute position (MTC ticks).
    Start(u32),
    /// Time advanced by the given amount of 1/24 µs.
    Tick(u32),
    /// Timer stopped (silence or desync).
    Stop,
}

#[derive(Debug)]
pub struct MtcParser {
    nibble: [u8; 8],
    qfr: u32,
    rate: FrameRate,
    pos: u32,
    state: MtcState,
    /// Remaining watchdog time in 1/24 µs; counted down by the caller's
    /// timer, 0 means unarmed. Call [`MtcParser::timeout`] when it expires.
    pub timo: u32,
}

impl Default for MtcParser {
    fn default() -> Self {
        Self::new()
    }
}

impl MtcParser {
    pub fn new() -> MtcParser {
        MtcParser {
            nibble: [0; 8],
            qfr: 0,
            rate: FrameRate::default(),
            pos: 0,
            state: MtcState::Stop,
            timo: 0,
        }
    }

    pub fn state(&self) -> MtcState {
        self.state
    }

    /// Current absolute position in MTC ticks.
    pub fn pos(&self) -> u32 {
        self.pos
    }

    pub fn reset(&mut self) {
        self.state = MtcState::Stop;
        self.qfr = 0;
        self.timo = 0;
    }

    /// Feed a complete full-frame sysex (`F0 7F cc 01 01 hh mm ss ff F7`).
    /// Returns `None` if the message is not a full frame.
    pub fn full_frame(&mut self, data: &[u8]) -> Option<MtcOut> {
        if data.len() != 10
            || data[0] != 0xf0
            || data[1] != 0x7f
            || data[3] != 0x01
            || data[4] != 0x01
            || data[9] != 0xf7
        {
            return None;
        }
        self.rate = FrameRate::from_bits(data[5] >> 5);
        let hr = (data[5] & 0x1f) as u32;
        let mn = data[6] as u32;
        let sc = data[7] as u32;
        let fr = data[8] as u32;
        self.pos = ((hr * 60 + mn) * 60 + sc) * MTC_SEC + fr * (MTC_SEC / self.rate.fps());
        self.pos %= MTC_PERIOD;
        self.qfr = 0;
        self.state = MtcState::Start;
        self.timo = MTC_TIMO;
        debug!(pos = self.pos, rate = ?self.rate, "mtc: full frame");
        Some(MtcOut::Start(self.pos))
    }

    /// Feed the data byte of a quarter-frame message (0xf1).
    pub fn quarter_frame(&mut self, data: u8) -> Option<MtcOut> {
        if self.state == MtcState::Stop {
            return None;
        }
        let index = ((data >> 4) & 7) as u32;
        if index != self.qfr & 7 {
            debug!(index, expected = self.qfr & 7, "mtc: desync, stopping");
            let was_running = self.state == MtcState::Run;
            self.reset();
            return was_running.then_some(MtcOut::Stop);
        }
        self.nibble[index as usize] = data & 0xf;
        self.qfr += 1;
        self.timo = MTC_TIMO;
        self.pos = (self.pos + self.rate.qf_ticks()) % MTC_PERIOD;
        if index == 7 {
            self.rate = FrameRate::from_bits(self.nibble[7] >> 1);
            // the assembled position refers to the moment the first quarter
            // frame of the group was sent, two frames ago
            let fr = (self.nibble[0] | ((self.nibble[1] & 1) << 4)) as u32 + 2;
            let sc = (self.nibble[2] | (self.nibble[3] << 4)) as u32;
            let mn = (self.nibble[4] | (self.nibble[5] << 4)) as u32;
            let hr = (self.nibble[6] | ((self.nibble[7] & 1) << 4)) as u32;
            self.pos = (((hr * 60 + mn) * 60 + sc) * MTC_SEC
                + fr * (MTC_SEC / self.rate.fps()))
                % MTC_PERIOD;
        }
        self.state = MtcState::Run;
        Some(MtcOut::Tick(self.rate.qf_usec24()))
    }

    /// The watchdog expired: the upstream is considered dead.
    pub fn timeout(&mut self) -> Option<MtcOut> {
        if self.state == MtcState::Stop {
            return None;
        }
        debug!("mtc: quarter frame timeout");
        self.reset();
        Some(MtcOut::Stop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_frame_bytes(rate: FrameRate, hr: u8, mn: u8, sc: u8, fr: u8) -> [u8; 10] {
        [
            0xf0,
            0x7f,
            0x7f,
            0x01,
            0x01,
            ((rate as u8) << 5) | hr,
            mn,
            sc,
            fr,
            0xf7,
        ]
    }

    #[test]
    fn test_full_frame_position() {
        let mut p = MtcParser::new();
        let out = p.full_frame(&full_frame_bytes(FrameRate::Fps25, 1, 2, 3, 10));
        let want = ((3600 + 120 + 3) * MTC_SEC) + 10 * (MTC_SEC / 25);
        assert_eq!(out, Some(MtcOut::Start(want)));
        assert_eq!(p.state(), MtcState::Start);
        assert!(p.timo > 0);
    }

    #[test]
    fn test_rejects_other_sysex() {
        let mut p = MtcParser::new();
        assert_eq!(p.full_frame(&[0xf0, 0x41, 0x10, 0x42, 0x12, 0xf7]), None);
        assert_eq!(p.state(), MtcState::Stop);
    }

    #[test]
    fn test_quarter_frames_tick() {
        let mut p = MtcParser::new();
        p.full_frame(&full_frame_bytes(FrameRate::Fps25, 0, 0, 0, 0));
        let out = p.quarter_frame(0x00);
        assert_eq!(out, Some(MtcOut::Tick(240_000)));
        assert_eq!(p.state(), MtcState::Run);
        let out = p.quarter_frame(0x10);
        assert_eq!(out, Some(MtcOut::Tick(240_000)));
    }

    #[test]
    fn test_quarter_frames_ignored_when_stopped() {
        let mut p = MtcParser::new();
        assert_eq!(p.quarter_frame(0x00), None);
    }

    #[test]
    fn test_desync_stops() {
        let mut p = MtcParser::new();
        p.full_frame(&full_frame_bytes(FrameRate::Fps25, 0, 0, 0, 0));
        p.quarter_frame(0x00);
        // expected index 1, got 5
        assert_eq!(p.quarter_frame(0x50), Some(MtcOut::Stop));
        assert_eq!(p.state(), MtcState::Stop);
    }

    #[test]
    fn test_timeout_stops_once() {
        let mut p = MtcParser::new();
        p.full_frame(&full_frame_bytes(FrameRate::Fps25, 0, 0, 0, 0));
        p.quarter_frame(0x00);
        assert_eq!(p.timeout(), Some(MtcOut::Stop));
        assert_eq!(p.timeout(), None);
    }

    #[test]
    fn test_eighth_quarter_frame_reassembles_position() {
        let mut p = MtcParser::new();
        p.full_frame(&full_frame_bytes(FrameRate::Fps25, 0, 0, 0, 0));
        // encode 00:00:02, frame 0, rate bits 01 (25 fps)
        let nibbles: [u8; 8] = [0, 0, 2, 0, 0, 0, 0, 1 << 1];
        for (i, n) in nibbles.iter().enumerate() {
            p.quarter_frame(((i as u8) << 4) | n);
        }
        // two-frame transmission lag is folded in
        assert_eq!(p.pos(), 2 * MTC_SEC + 2 * (MTC_SEC / 25));
    }
}
