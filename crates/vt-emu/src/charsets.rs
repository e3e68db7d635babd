//! Character set translation tables.

/// DEC Special Graphics, codepoints 0x5f..=0x7e.
const DEC_SPECIAL: [char; 32] = [
    '\u{0040}', // 5f blank
    '\u{2666}', // 60 black diamond
    '\u{2592}', // 61 grey square
    '\u{2409}', // 62 HT picture
    '\u{240c}', // 63 FF picture
    '\u{240d}', // 64 CR picture
    '\u{240a}', // 65 LF picture
    '\u{00ba}', // 66 masculine ordinal
    '\u{00b1}', // 67 plus-minus
    '\u{2424}', // 68 NL picture
    '\u{240b}', // 69 VT picture
    '\u{2518}', // 6a up and left
    '\u{2510}', // 6b down and left
    '\u{250c}', // 6c down and right
    '\u{2514}', // 6d up and right
    '\u{253c}', // 6e vertical and horizontal
    '\u{2594}', // 6f scan 1
    '\u{2580}', // 70 scan 3
    '\u{2500}', // 71 scan 5
    '\u{25ac}', // 72 scan 7
    '\u{005f}', // 73 scan 9
    '\u{251c}', // 74 vertical and right
    '\u{2524}', // 75 vertical and left
    '\u{2534}', // 76 up and horizontal
    '\u{252c}', // 77 down and horizontal
    '\u{2502}', // 78 vertical bar
    '\u{2264}', // 79 less or equal
    '\u{2265}', // 7a greater or equal
    '\u{00b6}', // 7b paragraph
    '\u{2260}', // 7c not equal
    '\u{00a3}', // 7d pound sign
    '\u{00b7}', // 7e middle dot
];

/// Maps a codepoint drawn through the DEC Special Graphics set. Codepoints
/// outside 0x5f..=0x7e pass through unchanged.
pub fn dec_special_to_unicode(c: char) -> char {
    match c {
        '\u{5f}'..='\u{7e}' => DEC_SPECIAL[c as usize - 0x5f],
        _ => c,
    }
}

/// CP437 high half, codepoints 0x80..=0xff.
const CP437_HIGH: [char; 128] = [
    '\u{00c7}', '\u{00fc}', '\u{00e9}', '\u{00e2}', '\u{00e4}', '\u{00e0}', '\u{00e5}', '\u{00e7}',
    '\u{00ea}', '\u{00eb}', '\u{00e8}', '\u{00ef}', '\u{00ee}', '\u{00ec}', '\u{00c4}', '\u{00c5}',
    '\u{00c9}', '\u{00e6}', '\u{00c6}', '\u{00f4}', '\u{00f6}', '\u{00f2}', '\u{00fb}', '\u{00f9}',
    '\u{00ff}', '\u{00d6}', '\u{00dc}', '\u{00a2}', '\u{00a3}', '\u{00a5}', '\u{20a7}', '\u{0192}',
    '\u{00e1}', '\u{00ed}', '\u{00f3}', '\u{00fa}', '\u{00f1}', '\u{00d1}', '\u{00aa}', '\u{00ba}',
    '\u{00bf}', '\u{2310}', '\u{00ac}', '\u{00bd}', '\u{00bc}', '\u{00a1}', '\u{00ab}', '\u{00bb}',
    '\u{2591}', '\u{2592}', '\u{2593}', '\u{2502}', '\u{2524}', '\u{2561}', '\u{2562}', '\u{2556}',
    '\u{2555}', '\u{2563}', '\u{2551}', '\u{2557}', '\u{255d}', '\u{255c}', '\u{255b}', '\u{2510}',
    '\u{2514}', '\u{2534}', '\u{252c}', '\u{251c}', '\u{2500}', '\u{253c}', '\u{255e}', '\u{255f}',
    '\u{255a}', '\u{2554}', '\u{2569}', '\u{2566}', '\u{2560}', '\u{2550}', '\u{256c}', '\u{2567}',
    '\u{2568}', '\u{2564}', '\u{2565}', '\u{2559}', '\u{2558}', '\u{2552}', '\u{2553}', '\u{256b}',
    '\u{256a}', '\u{2518}', '\u{250c}', '\u{2588}', '\u{2584}', '\u{258c}', '\u{2590}', '\u{2580}',
    '\u{03b1}', '\u{00df}', '\u{0393}', '\u{03c0}', '\u{03a3}', '\u{03c3}', '\u{00b5}', '\u{03c4}',
    '\u{03a6}', '\u{0398}', '\u{03a9}', '\u{03b4}', '\u{221e}', '\u{03c6}', '\u{03b5}', '\u{2229}',
    '\u{2261}', '\u{00b1}', '\u{2265}', '\u{2264}', '\u{2320}', '\u{2321}', '\u{00f7}', '\u{2248}',
    '\u{00b0}', '\u{2219}', '\u{00b7}', '\u{221a}', '\u{207f}', '\u{00b2}', '\u{25a0}', '\u{00a0}',
];

/// Translates a CP437 byte to Unicode. The low half is identity.
pub fn cp437_to_unicode(b: u8) -> char {
    if b < 0x80 {
        b as char
    } else {
        CP437_HIGH[b as usize - 0x80]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dec_special_box_drawing() {
        assert_eq!(dec_special_to_unicode('q'), '\u{2500}');
        assert_eq!(dec_special_to_unicode('x'), '\u{2502}');
        assert_eq!(dec_special_to_unicode('l'), '\u{250c}');
        assert_eq!(dec_special_to_unicode('Z'), 'Z');
    }

    #[test]
    fn cp437_high_half() {
        assert_eq!(cp437_to_unicode(0xb0), '\u{2591}');
        assert_eq!(cp437_to_unicode(0xdb), '\u{2588}');
        assert_eq!(cp437_to_unicode(0xff), '\u{00a0}');
        assert_eq!(cp437_to_unicode(b'A'), 'A');
    }
}
