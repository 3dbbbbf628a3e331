//! Arrival time stamps of 192-byte AVCHD / Blu-ray packets.
//!
//! Each packet is prefixed by 2 bits of copy permission and a 30-bit arrival
//! time stamp (ATS) counting 27 MHz ticks. The stamp wraps every ~40 s; the
//! tracker counts wraps so every packet gets a monotonic 64-bit time base.

/// Modulus of the raw 30-bit stamp.
pub const ATS_MODULUS: u64 = 1 << 30;

/// Modulus once a packed stamp has been re-derived: 21 bits of 300-tick units.
pub const CORRECTED_ATS_MODULUS: u64 = (1 << 21) * 300;

/// The 4-byte prefix of an AVCHD packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrivalPrefix {
    /// Two copy permission bits.
    pub copy_permission: u8,
    /// 30-bit stamp in 27 MHz ticks.
    pub arrival_time_stamp: u32,
}

impl ArrivalPrefix {
    /// Splits the big-endian prefix word.
    pub fn parse(prefix: [u8; 4]) -> Self {
        let raw = u32::from_be_bytes(prefix);
        Self {
            copy_permission: (raw >> 30) as u8,
            arrival_time_stamp: raw & 0x3fff_ffff,
        }
    }
}

/// Re-derives a stamp some recorders write as 300-tick units over a 9-bit
/// remainder, the same packing as a PCR. A remainder above 299 is clamped so
/// the result stays below [`CORRECTED_ATS_MODULUS`].
pub fn correct_packed_stamp(ats: u32) -> u64 {
    let ats = (ats & 0x3fff_ffff) as u64;
    (ats >> 9) * 300 + (ats & 0x1ff).min(299)
}

/// Tracks ATS rollovers over one parse pass.
#[derive(Debug, Clone, Default)]
pub struct ArrivalTimeTracker {
    correct_packed: bool,
    previous: Option<u64>,
    rollovers: u32,
    /// Rollover count as of each packet, by packet number.
    per_packet: Vec<u32>,
    /// Corrected stamp of each packet.
    stamps: Vec<u64>,
}

impl ArrivalTimeTracker {
    /// A tracker that re-derives packed stamps when `correct_packed` is set.
    pub fn new(correct_packed: bool) -> Self {
        Self {
            correct_packed,
            ..Default::default()
        }
    }

    /// Wrap period of the stamps this tracker records.
    pub fn modulus(&self) -> u64 {
        if self.correct_packed {
            CORRECTED_ATS_MODULUS
        } else {
            ATS_MODULUS
        }
    }

    /// Records the next packet's prefix and returns its monotonic time base.
    pub fn record(&mut self, prefix: [u8; 4]) -> u64 {
        self.record_stamp(ArrivalPrefix::parse(prefix).arrival_time_stamp)
    }

    /// Records the next packet's raw 30-bit stamp.
    pub fn record_stamp(&mut self, ats: u32) -> u64 {
        let stamp = if self.correct_packed {
            correct_packed_stamp(ats)
        } else {
            (ats & 0x3fff_ffff) as u64
        };

        if let Some(previous) = self.previous {
            if stamp < previous {
                self.rollovers += 1;
                log::debug!(
                    "arrival time stamp rollover #{} at packet {}",
                    self.rollovers,
                    self.per_packet.len()
                );
            }
        }
        self.previous = Some(stamp);
        self.per_packet.push(self.rollovers);
        self.stamps.push(stamp);
        self.rollovers as u64 * self.modulus() + stamp
    }

    /// Total rollovers seen so far.
    pub fn rollovers(&self) -> u32 {
        self.rollovers
    }

    /// Packets recorded so far.
    pub fn packets(&self) -> usize {
        self.per_packet.len()
    }

    /// Rollover count as of `packet_no`.
    pub fn rollovers_at(&self, packet_no: u64) -> Option<u32> {
        self.per_packet.get(usize::try_from(packet_no).ok()?).copied()
    }

    /// Monotonic 64-bit time base of a recorded packet, in 27 MHz ticks.
    pub fn time_base_at(&self, packet_no: u64) -> Option<u64> {
        let index = usize::try_from(packet_no).ok()?;
        let rollovers = *self.per_packet.get(index)?;
        let stamp = *self.stamps.get(index)?;
        Some(rollovers as u64 * self.modulus() + stamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_prefix_split() {
        let prefix = ArrivalPrefix::parse([0xc0, 0x00, 0x01, 0x02]);
        assert_eq!(prefix.copy_permission, 3);
        assert_eq!(prefix.arrival_time_stamp, 0x102);
    }

    #[test]
    fn test_single_rollover_at_wrap() {
        let mut stamps: Vec<u32> = (5..10).collect();
        stamps.extend_from_slice(&[0x3fff_fffe, 0x3fff_ffff, 0, 1]);

        let mut tracker = ArrivalTimeTracker::new(false);
        let bases: Vec<u64> = stamps.iter().map(|&s| tracker.record_stamp(s)).collect();

        assert_eq!(tracker.rollovers(), 1);
        assert_eq!(tracker.rollovers_at(6), Some(0));
        assert_eq!(tracker.rollovers_at(7), Some(1));
        assert_eq!(bases[7], ATS_MODULUS);
        assert_eq!(bases[8], ATS_MODULUS + 1);
        assert!(bases[6..].windows(2).all(|w| w[0] < w[1]));
        assert_eq!(tracker.time_base_at(8), Some(ATS_MODULUS + 1));
        assert_eq!(tracker.time_base_at(9), None);
    }

    #[test]
    fn test_packed_correction() {
        assert_eq!(correct_packed_stamp((3 << 9) | 17), 3 * 300 + 17);

        let mut tracker = ArrivalTimeTracker::new(true);
        tracker.record_stamp((100 << 9) | 5);
        let base = tracker.record_stamp(2 << 9);
        assert_eq!(tracker.rollovers(), 1);
        assert_eq!(base, CORRECTED_ATS_MODULUS + 600);
    }

    #[test]
    fn test_packed_remainder_is_clamped() {
        let top = ((1u32 << 21) - 1) << 9 | 0x1ff;
        assert_eq!(correct_packed_stamp(top), CORRECTED_ATS_MODULUS - 1);

        let mut tracker = ArrivalTimeTracker::new(true);
        let before = tracker.record_stamp(top);
        let after = tracker.record_stamp(0);
        assert_eq!(tracker.rollovers(), 1);
        assert!(after > before);
    }
}
