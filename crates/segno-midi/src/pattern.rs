//! User-defined sysex command patterns.
//!
//! A pattern turns a family of system-exclusive messages into a first-class
//! event command: the pattern is the byte string of the message with
//! placeholder positions for the event's value fields. Inbound sysex that
//! matches a registered pattern is delivered as that command; outbound
//! pattern events render by substituting the values back in.

use thiserror::Error;

use crate::ev::{Cmd, Ev};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatError {
    #[error("pattern must start with 0xf0")]
    MissingStart,
    #[error("pattern must end with 0xf7")]
    MissingEnd,
    #[error("literal byte {0:#x} is not a valid sysex data byte")]
    BadByte(u8),
    #[error("no such pattern slot: {0}")]
    BadSlot(usize),
}

/// One element of a pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatTok {
    /// Literal byte; must match exactly.
    Byte(u8),
    /// Placeholder for the high 7 bits of v0.
    V0Hi,
    /// Placeholder for the low 7 bits of v0.
    V0Lo,
    /// Placeholder for the high 7 bits of v1.
    V1Hi,
    /// Placeholder for the low 7 bits of v1.
    V1Lo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvPat {
    name: String,
    toks: Vec<PatTok>,
}

impl EvPat {
    /// Validate and build a pattern. The token string must be a complete
    /// sysex message: a literal 0xf0, 7-bit payload bytes or placeholders,
    /// and a terminating literal 0xf7.
    pub fn new(name: impl Into<String>, toks: Vec<PatTok>) -> Result<EvPat, PatError> {
        if toks.first() != Some(&PatTok::Byte(0xf0)) {
            return Err(PatError::MissingStart);
        }
        if toks.last() != Some(&PatTok::Byte(0xf7)) {
            return Err(PatError::MissingEnd);
        }
        for tok in &toks[1..toks.len() - 1] {
            if let PatTok::Byte(b) = tok {
                if *b >= 0x80 {
                    return Err(PatError::BadByte(*b));
                }
            }
        }
        Ok(EvPat {
            name: name.into(),
            toks,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Match a complete sysex message against the pattern, extracting the
    /// value fields. Bytes after the pattern's terminator are ignored.
    pub fn matches(&self, data: &[u8]) -> Option<(u32, u32)> {
        let mut v0: u32 = 0;
        let mut v1: u32 = 0;
        let mut bytes = data.iter();
        for tok in &self.toks {
            let q = *bytes.next()?;
            match tok {
                PatTok::V0Hi => v0 |= (q as u32) << 7,
                PatTok::V0Lo => v0 |= q as u32,
                PatTok::V1Hi => v1 |= (q as u32) << 7,
                PatTok::V1Lo => v1 |= q as u32,
                PatTok::Byte(p) => {
                    if *p != q {
                        return None;
                    }
                }
            }
        }
        Some((v0, v1))
    }

    /// Render the sysex message for the given values.
    pub fn render(&self, v0: u32, v1: u32, out: &mut Vec<u8>) {
        for tok in &self.toks {
            out.push(match tok {
                PatTok::Byte(b) => *b,
                PatTok::V0Hi => ((v0 >> 7) & 0x7f) as u8,
                PatTok::V0Lo => (v0 & 0x7f) as u8,
                PatTok::V1Hi => ((v1 >> 7) & 0x7f) as u8,
                PatTok::V1Lo => (v1 & 0x7f) as u8,
            });
        }
    }
}

/// The registered pattern slots, one per `Cmd::pat(..)` command.
#[derive(Debug, Default)]
pub struct PatSet {
    slots: [Option<EvPat>; Cmd::NPAT],
}

impl PatSet {
    pub fn new() -> PatSet {
        PatSet::default()
    }

    pub fn set(&mut self, slot: usize, pat: EvPat) -> Result<(), PatError> {
        if slot >= Cmd::NPAT {
            return Err(PatError::BadSlot(slot));
        }
        self.slots[slot] = Some(pat);
        Ok(())
    }

    pub fn clear(&mut self, slot: usize) {
        if slot < Cmd::NPAT {
            self.slots[slot] = None;
        }
    }

    pub fn get(&self, slot: usize) -> Option<&EvPat> {
        self.slots.get(slot).and_then(|s| s.as_ref())
    }

    /// Try all registered patterns against a complete sysex message,
    /// producing the corresponding event.
    pub fn match_sysex(&self, unit: u8, data: &[u8]) -> Option<Ev> {
        for (slot, pat) in self.slots.iter().enumerate() {
            if let Some(pat) = pat {
                if let Some((v0, v1)) = pat.matches(data) {
                    return Some(Ev::pat(slot, unit, v0, v1));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn master_volume() -> EvPat {
        // universal real-time master volume: F0 7F 7F 04 01 ll mm F7
        EvPat::new(
            "mvol",
            vec![
                PatTok::Byte(0xf0),
                PatTok::Byte(0x7f),
                PatTok::Byte(0x7f),
                PatTok::Byte(0x04),
                PatTok::Byte(0x01),
                PatTok::V0Lo,
                PatTok::V0Hi,
                PatTok::Byte(0xf7),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_validation() {
        assert_eq!(
            EvPat::new("x", vec![PatTok::Byte(0x41), PatTok::Byte(0xf7)]),
            Err(PatError::MissingStart)
        );
        assert_eq!(
            EvPat::new("x", vec![PatTok::Byte(0xf0), PatTok::Byte(0x41)]),
            Err(PatError::MissingEnd)
        );
        assert_eq!(
            EvPat::new(
                "x",
                vec![PatTok::Byte(0xf0), PatTok::Byte(0x90), PatTok::Byte(0xf7)]
            ),
            Err(PatError::BadByte(0x90))
        );
    }

    #[test]
    fn test_match_extracts_values() {
        let pat = master_volume();
        let (v0, v1) = pat.matches(&[0xf0, 0x7f, 0x7f, 0x04, 0x01, 0x23, 0x45, 0xf7]).unwrap();
        assert_eq!(v0, (0x45 << 7) | 0x23);
        assert_eq!(v1, 0);
        assert!(pat.matches(&[0xf0, 0x7f, 0x7f, 0x05, 0x01, 0x23, 0x45, 0xf7]).is_none());
        // truncated message
        assert!(pat.matches(&[0xf0, 0x7f, 0x7f, 0x04, 0x01, 0x23]).is_none());
    }

    #[test]
    fn test_render_match_round_trip() {
        let pat = master_volume();
        let mut buf = Vec::new();
        pat.render(0x1234, 0, &mut buf);
        assert_eq!(buf[0], 0xf0);
        assert_eq!(*buf.last().unwrap(), 0xf7);
        let (v0, _) = pat.matches(&buf).unwrap();
        assert_eq!(v0, 0x1234);
    }

    #[test]
    fn test_patset_lookup() {
        let mut set = PatSet::new();
        set.set(2, master_volume()).unwrap();
        let ev = set
            .match_sysex(1, &[0xf0, 0x7f, 0x7f, 0x04, 0x01, 0x00, 0x40, 0xf7])
            .unwrap();
        assert_eq!(ev.cmd, Cmd::pat(2));
        assert_eq!(ev.dev, 1);
        assert_eq!(ev.v0, 0x2000);
        assert!(set.match_sysex(0, &[0xf0, 0x41, 0xf7]).is_none());
        assert!(set.set(Cmd::NPAT, master_volume()).is_err());
    }
}
