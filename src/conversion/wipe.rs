//! Overwrite patterns for wiping the previous contents of converted blocks.
//!
//! Each algorithm is a sequence of numbered passes (starting at 1). A pass
//! either fills the buffer with a fixed pattern or asks the caller for
//! pseudo-random data, which the conversion engine derives by encrypting the
//! block.

use std::fmt;
use std::str::FromStr;

use crate::config::WIPE_RAND_CHAR_COUNT;

/// Wipe algorithm applied before each converted block is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WipeAlgorithm {
    /// One pass of pseudo-random data.
    OnePassRandom,
    /// US DoD 5220.22-M (3 passes): 0x00, 0xFF, random.
    Dod3Pass,
    /// US DoD 5220.22-M (7 passes).
    Dod7Pass,
    /// Peter Gutmann's 35-pass sequence.
    Gutmann35,
}

impl WipeAlgorithm {
    pub const ALL: [WipeAlgorithm; 4] = [
        WipeAlgorithm::OnePassRandom,
        WipeAlgorithm::Dod3Pass,
        WipeAlgorithm::Dod7Pass,
        WipeAlgorithm::Gutmann35,
    ];

    pub fn pass_count(self) -> u32 {
        match self {
            WipeAlgorithm::OnePassRandom => 1,
            WipeAlgorithm::Dod3Pass => 3,
            WipeAlgorithm::Dod7Pass => 7,
            WipeAlgorithm::Gutmann35 => 35,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            WipeAlgorithm::OnePassRandom => "1-rand",
            WipeAlgorithm::Dod3Pass => "dod3",
            WipeAlgorithm::Dod7Pass => "dod7",
            WipeAlgorithm::Gutmann35 => "gutmann35",
        }
    }
}

impl fmt::Display for WipeAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for WipeAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WipeAlgorithm::ALL
            .into_iter()
            .find(|algorithm| algorithm.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown wipe algorithm '{}'", s))
    }
}

/// Fills `buffer` with the pattern of `pass`.
///
/// Returns false when the pass needs pseudo-random data instead; the buffer
/// is left untouched in that case.
pub fn wipe_buffer(
    algorithm: WipeAlgorithm,
    rand_chars: &[u8; WIPE_RAND_CHAR_COUNT],
    pass: u32,
    buffer: &mut [u8],
) -> bool {
    match algorithm {
        WipeAlgorithm::OnePassRandom => false,
        WipeAlgorithm::Dod3Pass => dod3(pass, buffer),
        WipeAlgorithm::Dod7Pass => dod7(pass, rand_chars, buffer),
        WipeAlgorithm::Gutmann35 => gutmann(pass, buffer),
    }
}

fn dod3(pass: u32, buffer: &mut [u8]) -> bool {
    let pattern = match pass {
        1 => 0x00,
        2 => 0xFF,
        _ => return false,
    };
    buffer.fill(pattern);
    true
}

fn dod7(pass: u32, rand_chars: &[u8; WIPE_RAND_CHAR_COUNT], buffer: &mut [u8]) -> bool {
    let pattern = match pass {
        1 => rand_chars[0],
        2 => !rand_chars[0],
        4 => rand_chars[1],
        5 => rand_chars[2],
        6 => !rand_chars[2],
        _ => return false,
    };
    buffer.fill(pattern);
    true
}

fn gutmann(pass: u32, buffer: &mut [u8]) -> bool {
    let rotation = match pass {
        5 => {
            buffer.fill(0x55);
            return true;
        }
        6 => {
            buffer.fill(0xAA);
            return true;
        }
        7 | 26 | 29 => 0,
        8 | 27 | 30 => 1,
        9 | 28 | 31 => 2,
        10..=25 => {
            buffer.fill((pass - 10) as u8 * 0x11);
            return true;
        }
        _ => return false,
    };

    let mut pattern = [0x92u8, 0x49, 0x24];
    if pass >= 29 {
        pattern.iter_mut().for_each(|b| *b = !*b);
    }
    for (i, byte) in buffer.iter_mut().enumerate() {
        *byte = pattern[(rotation + i) % 3];
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAND: [u8; WIPE_RAND_CHAR_COUNT] = [0x12, 0x34, 0x56];

    fn random_passes(algorithm: WipeAlgorithm) -> Vec<u32> {
        let mut buffer = [0u8; 16];
        (1..=algorithm.pass_count())
            .filter(|&pass| !wipe_buffer(algorithm, &RAND, pass, &mut buffer))
            .collect()
    }

    #[test]
    fn test_pass_counts() {
        assert_eq!(WipeAlgorithm::OnePassRandom.pass_count(), 1);
        assert_eq!(WipeAlgorithm::Dod3Pass.pass_count(), 3);
        assert_eq!(WipeAlgorithm::Dod7Pass.pass_count(), 7);
        assert_eq!(WipeAlgorithm::Gutmann35.pass_count(), 35);
    }

    #[test]
    fn test_dod3_patterns() {
        let mut buffer = [0x77u8; 8];
        assert!(wipe_buffer(WipeAlgorithm::Dod3Pass, &RAND, 1, &mut buffer));
        assert_eq!(buffer, [0x00; 8]);
        assert!(wipe_buffer(WipeAlgorithm::Dod3Pass, &RAND, 2, &mut buffer));
        assert_eq!(buffer, [0xFF; 8]);
        assert_eq!(random_passes(WipeAlgorithm::Dod3Pass), vec![3]);
    }

    #[test]
    fn test_dod7_uses_rand_chars() {
        let mut buffer = [0u8; 4];
        wipe_buffer(WipeAlgorithm::Dod7Pass, &RAND, 2, &mut buffer);
        assert_eq!(buffer, [!0x12; 4]);
        wipe_buffer(WipeAlgorithm::Dod7Pass, &RAND, 5, &mut buffer);
        assert_eq!(buffer, [0x56; 4]);
        assert_eq!(random_passes(WipeAlgorithm::Dod7Pass), vec![3, 7]);
    }

    #[test]
    fn test_gutmann_patterns() {
        let mut buffer = [0u8; 6];
        assert!(wipe_buffer(WipeAlgorithm::Gutmann35, &RAND, 8, &mut buffer));
        assert_eq!(buffer, [0x49, 0x24, 0x92, 0x49, 0x24, 0x92]);

        assert!(wipe_buffer(WipeAlgorithm::Gutmann35, &RAND, 29, &mut buffer));
        assert_eq!(buffer[..3], [!0x92, !0x49, !0x24]);

        assert!(wipe_buffer(WipeAlgorithm::Gutmann35, &RAND, 13, &mut buffer));
        assert_eq!(buffer, [0x33; 6]);

        assert_eq!(
            random_passes(WipeAlgorithm::Gutmann35),
            vec![1, 2, 3, 4, 32, 33, 34, 35]
        );
    }

    #[test]
    fn test_one_pass_random() {
        let mut buffer = [9u8; 4];
        assert!(!wipe_buffer(WipeAlgorithm::OnePassRandom, &RAND, 1, &mut buffer));
        assert_eq!(buffer, [9; 4]);
    }

    #[test]
    fn test_parse_names() {
        for algorithm in WipeAlgorithm::ALL {
            assert_eq!(algorithm.name().parse::<WipeAlgorithm>().unwrap(), algorithm);
        }
        assert_eq!("DoD3".parse::<WipeAlgorithm>().unwrap(), WipeAlgorithm::Dod3Pass);
        assert!("zero".parse::<WipeAlgorithm>().is_err());
    }
}
