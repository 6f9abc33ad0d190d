//! Modem control-line state and change tracking.

use std::fmt;

/// Line bits in the high nibble, "changed" flags in the low nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct ModemState(u8);

impl ModemState {
    pub const CTS_CHANGED: u8 = 0x01;
    pub const DSR_CHANGED: u8 = 0x02;
    pub const RI_CHANGED: u8 = 0x04;
    pub const CD_CHANGED: u8 = 0x08;
    pub const CTS: u8 = 0x10;
    pub const DSR: u8 = 0x20;
    pub const RI: u8 = 0x40;
    pub const CD: u8 = 0x80;

    pub const LINES: u8 = 0xf0;
    pub const CHANGES: u8 = 0x0f;

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn lines(self) -> u8 {
        self.0 & Self::LINES
    }

    pub const fn changed(self) -> u8 {
        self.0 & Self::CHANGES
    }

    pub const fn cd(self) -> bool {
        self.0 & Self::CD != 0
    }

    pub const fn cts(self) -> bool {
        self.0 & Self::CTS != 0
    }

    pub const fn dsr(self) -> bool {
        self.0 & Self::DSR != 0
    }

    pub const fn ri(self) -> bool {
        self.0 & Self::RI != 0
    }
}

impl fmt::Display for ModemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(u8, &str); 4] = [
            (ModemState::CD, "CD"),
            (ModemState::CTS, "CTS"),
            (ModemState::DSR, "DSR"),
            (ModemState::RI, "RI"),
        ];
        let list = |mask: u8| {
            NAMES
                .iter()
                .filter(|(bit, _)| mask & bit != 0)
                .map(|(_, n)| *n)
                .collect::<Vec<_>>()
                .join("|")
        };
        write!(
            f,
            "lines [{}] changed [{}]",
            list(self.lines()),
            list(self.changed() << 4)
        )
    }
}

/// Diffs successive line samples against the last reported state.
///
/// The first report after construction or `reset()` is always emitted,
/// measured against an all-zero baseline.
#[derive(Debug, Clone)]
pub struct ModemStateTracker {
    current: u8,
    reported: Option<u8>,
    mask: u8,
}

impl ModemStateTracker {
    pub fn new() -> Self {
        Self {
            current: 0,
            reported: None,
            mask: ModemState::CHANGES,
        }
    }

    /// Record the latest line sample (only the line nibble is kept).
    pub fn sample(&mut self, bits: u8) {
        self.current = bits & ModemState::LINES;
    }

    pub fn current(&self) -> ModemState {
        ModemState(self.current)
    }

    /// Restrict which line changes are reportable. Takes either nibble.
    pub fn set_mask(&mut self, mask: u8) {
        self.mask = (mask | (mask >> 4)) & ModemState::CHANGES;
    }

    pub fn mask(&self) -> u8 {
        self.mask
    }

    /// Forget the last report so the next one is a fresh baseline.
    pub fn reset(&mut self) {
        self.reported = None;
    }

    /// The notification due for the current sample, if any.
    pub fn report(&mut self) -> Option<ModemState> {
        let prev = self.reported.unwrap_or(0);
        let changed = ((prev ^ self.current) >> 4) & self.mask;
        if self.reported.is_some() && changed == 0 {
            return None;
        }
        self.reported = Some(self.current);
        Some(ModemState(self.current | changed))
    }
}

impl Default for ModemStateTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn first_report_is_baseline() {
        let mut t = ModemStateTracker::new();
        assert_eq!(t.report(), Some(ModemState::from_bits(0)));
        assert_eq!(t.report(), None);

        let mut t = ModemStateTracker::new();
        t.sample(ModemState::CD | ModemState::DSR);
        let first = t.report().unwrap();
        assert!(first.cd() && first.dsr());
        assert_eq!(first.changed(), ModemState::CD_CHANGED | ModemState::DSR_CHANGED);
    }

    #[test]
    fn identical_sample_is_silent() {
        let mut t = ModemStateTracker::new();
        t.sample(ModemState::CTS);
        t.report();
        t.sample(ModemState::CTS | ModemState::CTS_CHANGED);
        assert_eq!(t.report(), None);

        t.sample(0);
        let r = t.report().unwrap();
        assert_eq!(r.bits(), ModemState::CTS_CHANGED);
    }

    #[test]
    fn mask_hides_lines() {
        let mut t = ModemStateTracker::new();
        t.report();
        t.set_mask(ModemState::CD);
        t.sample(ModemState::RI);
        assert_eq!(t.report(), None);
        t.sample(ModemState::RI | ModemState::CD);
        assert_eq!(t.report().unwrap().changed(), ModemState::CD_CHANGED);
    }

    #[test]
    fn reset_reports_again() {
        let mut t = ModemStateTracker::new();
        t.sample(ModemState::CD);
        t.report();
        t.reset();
        assert_eq!(
            t.report(),
            Some(ModemState::from_bits(ModemState::CD | ModemState::CD_CHANGED))
        );
    }

    #[test]
    fn display_lists_lines() {
        let s = ModemState::from_bits(ModemState::CD | ModemState::CTS | ModemState::CTS_CHANGED);
        assert_eq!(s.to_string(), "lines [CD|CTS] changed [CTS]");
    }

    proptest! {
        #[test]
        fn changes_xor_to_endpoints(samples in proptest::collection::vec(any::<u8>(), 1..64)) {
            let mut t = ModemStateTracker::new();
            let mut reports = Vec::new();
            let mut prev_lines: Option<u8> = None;
            for s in &samples {
                t.sample(*s);
                let r = t.report();
                let lines = s & ModemState::LINES;
                if let Some(p) = prev_lines {
                    prop_assert_eq!(r.is_none(), p == lines);
                }
                if let Some(r) = r {
                    prop_assert_eq!(r.changed() << 4, (prev_lines.unwrap_or(0) ^ lines));
                    prev_lines = Some(lines);
                    reports.push(r);
                }
            }

            let first = samples[0] & ModemState::LINES;
            let last = samples[samples.len() - 1] & ModemState::LINES;
            let all = reports.iter().fold(0u8, |acc, r| acc ^ (r.changed() << 4));
            prop_assert_eq!(all, last);
            let after_first = reports[1..].iter().fold(0u8, |acc, r| acc ^ (r.changed() << 4));
            prop_assert_eq!(after_first, first ^ last);
        }
    }
}
