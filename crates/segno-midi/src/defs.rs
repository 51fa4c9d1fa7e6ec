//! Protocol-level constants and time-unit conversions.
//!
//! The canonical clock unit everywhere in the engine is the 24th of a
//! microsecond, so tempo values round-trip losslessly with the SMF
//! microseconds-per-quarter representation.

/// Convert a tempo in beats per minute to a tick length in 1/24 µs.
pub const fn tempo_to_usec24(bpm: u32, tpb: u32) -> u32 {
    (60 * 24_000_000u64 / (bpm as u64 * tpb as u64)) as u32
}

/// Maximum number of attached MIDI devices.
pub const MAX_DEVS: usize = 16;

/// Default number of ticks per beat.
pub const DEFAULT_TPB: u32 = 24;

/// Default number of beats per measure.
pub const DEFAULT_BPM: u32 = 4;

/// Default number of ticks per unit note.
pub const DEFAULT_TPU: u32 = 96;

/// Default tempo in beats per minute.
pub const DEFAULT_TEMPO: u32 = 120;

/// Default tick length in 1/24 µs (120 bpm at 24 ticks per beat).
pub const DEFAULT_USEC24: u32 = tempo_to_usec24(DEFAULT_TEMPO, DEFAULT_TPB);

/// Upper bound on ticks per unit note.
pub const TPU_MAX: u32 = 96 * 40;

pub const TIMESIG_TICS_MAX: u32 = TPU_MAX / 4;
pub const TIMESIG_BEATS_MAX: u32 = 100;

/// Fastest allowed tick length.
pub const TEMPO_MIN: u32 = tempo_to_usec24(240, TIMESIG_TICS_MAX);

/// Slowest allowed tick length.
pub const TEMPO_MAX: u32 = tempo_to_usec24(20, 24);

/// Frame rate used when transmitting an initial MMC position. 25 fps is
/// convenient because the frame period is a whole number of milliseconds.
pub const DEFAULT_FPS: u32 = 25;

/// Controller numbers with a defined coarse/fine or preamble role.
pub const BANK_HI: u32 = 0;
pub const BANK_LO: u32 = 32;
pub const DATAENT_HI: u32 = 6;
pub const DATAENT_LO: u32 = 38;
pub const NRPN_HI: u32 = 99;
pub const NRPN_LO: u32 = 98;
pub const RPN_HI: u32 = 101;
pub const RPN_LO: u32 = 100;

/// Channel-mode controller numbers used when quiescing a failed device.
pub const CTL_RESETALL: u32 = 121;
pub const CTL_ALLNOTSOFF: u32 = 123;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tempo_is_half_a_million_units() {
        // 60 * 24e6 / (120 * 24)
        assert_eq!(DEFAULT_USEC24, 500_000);
    }

    #[test]
    fn test_tempo_bounds_ordering() {
        assert!(TEMPO_MIN < TEMPO_MAX);
        assert!(TEMPO_MIN <= DEFAULT_USEC24 && DEFAULT_USEC24 <= TEMPO_MAX);
    }
}
