//! Packed per-cell attributes.
//!
//! Layout of the u16: bits 0-3 foreground, bits 4-7 background (0 means the
//! default colour, 1..=8 are the ANSI colours offset by one), then one flag
//! bit each for bold, low intensity, invert, underline and invisible.

pub const FG_MASK: u16 = 0x000f;
pub const BG_MASK: u16 = 0x00f0;
pub const BG_SHIFT: u16 = 4;

pub const BOLD: u16 = 1 << 8;
pub const LOW: u16 = 1 << 9;
pub const INVERT: u16 = 1 << 10;
pub const UNDERLINE: u16 = 1 << 11;
pub const INVISIBLE: u16 = 1 << 12;

pub const COLOR_MASK: u16 = FG_MASK | BG_MASK;

/// Replaces the foreground field. `color` 0 is the default; 1..=8 select an
/// ANSI colour.
pub fn with_fg(attr: u16, color: u16) -> u16 {
    (attr & !FG_MASK) | (color & 0xf)
}

/// Replaces the background field, same encoding as [`with_fg`].
pub fn with_bg(attr: u16, color: u16) -> u16 {
    (attr & !BG_MASK) | ((color & 0xf) << BG_SHIFT)
}

pub fn fg(attr: u16) -> u16 {
    attr & FG_MASK
}

pub fn bg(attr: u16) -> u16 {
    (attr & BG_MASK) >> BG_SHIFT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_fields_are_independent() {
        let attr = with_bg(with_fg(BOLD, 3), 8);
        assert_eq!(fg(attr), 3);
        assert_eq!(bg(attr), 8);
        assert_ne!(attr & BOLD, 0);
        let attr = with_fg(attr, 0);
        assert_eq!(fg(attr), 0);
        assert_eq!(bg(attr), 8);
    }
}
