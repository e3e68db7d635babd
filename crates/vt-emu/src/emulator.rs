use tracing::{debug, trace};

use crate::attr;
use crate::charsets::{cp437_to_unicode, dec_special_to_unicode};
use crate::grid::{blank_row, Row, RowData};

const MAX_PARAMS: usize = 30;
const REPLACEMENT: char = '\u{fffd}';

/// 8-bit C1 controls recognized in the data state.
const C1_IND: char = '\u{84}';
const C1_NEL: char = '\u{85}';
const C1_HTS: char = '\u{88}';
const C1_RI: char = '\u{8d}';
const C1_SS2: char = '\u{8e}';
const C1_SS3: char = '\u{8f}';
const C1_DCS: char = '\u{90}';
const C1_CSI: char = '\u{9b}';
const C1_OSC: char = '\u{9d}';

/// How bytes are turned into codepoints before they reach the state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Encoding {
    Latin1,
    Utf8,
    IbmCp437,
}

/// Encoding information announced by the stream itself (`ESC %`). Takes
/// precedence over the externally selected encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncodingOverride {
    Legacy,
    Utf8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ParseState {
    Data,
    Esc,
    Csi,
    Dcs,
    DecPrivate,
    EscHash,
    Osc,
    SetG0,
    SetG1,
    SetG2,
    SetG3,
    CsiDollar,
    CsiEx,
    EscSpace,
    Vt52X,
    Vt52Y,
    CsiTicks,
    CsiEqual,
    EscPercent,
}

/// VT320 terminal state. Cloning is cheap: the grid rows are shared and
/// copied on first write, so a clone per frame costs one pointer vector.
#[derive(Clone, Debug, PartialEq)]
pub struct Terminal {
    rows: Vec<Row>,
    cols: i32,
    r: i32,
    c: i32,
    attributes: u16,
    saved_r: i32,
    saved_c: i32,
    saved_attr: u16,
    top_margin: i32,
    bottom_margin: i32,
    cursor_visible: bool,
    move_outside_margins: bool,
    wraparound: bool,
    insert_mode: bool,
    vt52_mode: bool,
    tabs: Vec<bool>,
    gx: [char; 4],
    gl: usize,
    gr: usize,
    one_shift: Option<usize>,
    used_charsets: bool,
    state: ParseState,
    params: [i32; MAX_PARAMS],
    nparams: usize,
    pending: String,
    auto_grow: bool,
    auto_grow_veto: bool,
    encoding: Encoding,
    encoding_override: Option<EncodingOverride>,
    utf8_pending: Vec<u8>,
}

impl Terminal {
    pub fn new(cols: usize, rows: usize) -> Self {
        let cols = cols.max(1) as i32;
        let rows = rows.max(1);
        let tab_len = (cols as usize).max(132);
        Self {
            rows: (0..rows).map(|_| blank_row(cols as usize)).collect(),
            cols,
            r: 0,
            c: 0,
            attributes: 0,
            saved_r: 0,
            saved_c: 0,
            saved_attr: 0,
            top_margin: 0,
            bottom_margin: rows as i32 - 1,
            cursor_visible: true,
            move_outside_margins: true,
            wraparound: true,
            insert_mode: false,
            vt52_mode: false,
            tabs: (0..tab_len).map(|i| i % 8 == 0).collect(),
            gx: ['B', '0', 'B', 'B'],
            gl: 0,
            gr: 2,
            one_shift: None,
            used_charsets: false,
            state: ParseState::Data,
            params: [0; MAX_PARAMS],
            nparams: 0,
            pending: String::new(),
            auto_grow: true,
            auto_grow_veto: false,
            encoding: Encoding::Latin1,
            encoding_override: None,
            utf8_pending: Vec::new(),
        }
    }

    pub fn cols(&self) -> usize {
        self.cols as usize
    }

    pub fn rows(&self) -> usize {
        self.rows.len()
    }

    /// Cursor position as (row, col), clamped into the grid.
    pub fn cursor(&self) -> (usize, usize) {
        let r = self.r.clamp(0, self.rows_count() - 1) as usize;
        let c = self.c.clamp(0, self.cols - 1) as usize;
        (r, c)
    }

    pub fn cursor_visible(&self) -> bool {
        self.cursor_visible
    }

    pub fn char_at(&self, row: usize, col: usize) -> char {
        self.rows
            .get(row)
            .and_then(|r| r.chars.get(col))
            .copied()
            .unwrap_or(' ')
    }

    pub fn attr_at(&self, row: usize, col: usize) -> u16 {
        self.rows
            .get(row)
            .and_then(|r| r.attrs.get(col))
            .copied()
            .unwrap_or(0)
    }

    pub fn row(&self, row: usize) -> Option<&Row> {
        self.rows.get(row)
    }

    pub fn row_text(&self, row: usize) -> String {
        self.rows
            .get(row)
            .map(|r| r.chars.iter().collect::<String>())
            .unwrap_or_default()
    }

    /// All rows joined with newlines, trailing spaces kept.
    pub fn screen_text(&self) -> String {
        let mut out = String::new();
        for (i, row) in self.rows.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            out.extend(row.chars.iter());
        }
        out
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn set_encoding(&mut self, encoding: Encoding) {
        self.encoding = encoding;
    }

    pub fn encoding_override(&self) -> Option<EncodingOverride> {
        self.encoding_override
    }

    pub fn auto_grow(&self) -> bool {
        self.auto_grow
    }

    /// Enables or disables growth on cursor overflow. Ignored once an
    /// explicit size has vetoed growth.
    pub fn set_auto_grow(&mut self, auto_grow: bool) {
        if !self.auto_grow_veto {
            self.auto_grow = auto_grow;
        }
    }

    pub fn auto_grow_vetoed(&self) -> bool {
        self.auto_grow_veto
    }

    pub fn set_auto_grow_veto(&mut self, veto: bool) {
        self.auto_grow_veto = veto;
        if veto {
            self.auto_grow = false;
        }
    }

    fn effective_encoding(&self) -> Encoding {
        match self.encoding_override {
            Some(EncodingOverride::Utf8) => Encoding::Utf8,
            Some(EncodingOverride::Legacy) => match self.encoding {
                Encoding::Utf8 => Encoding::Latin1,
                other => other,
            },
            None => self.encoding,
        }
    }

    /// Feeds raw bytes, decoding them per the effective encoding.
    pub fn feed_bytes(&mut self, bytes: &[u8]) {
        for &b in bytes {
            match self.effective_encoding() {
                Encoding::Utf8 => self.feed_utf8_byte(b),
                _ => self.put_char(b as char),
            }
        }
    }

    /// Feeds already-decoded characters.
    pub fn feed_str(&mut self, s: &str) {
        for c in s.chars() {
            self.put_char(c);
        }
    }

    fn feed_utf8_byte(&mut self, b: u8) {
        if !self.utf8_pending.is_empty() && (b & 0xc0) != 0x80 {
            self.utf8_pending.clear();
            self.put_char(REPLACEMENT);
        }
        if self.utf8_pending.is_empty() {
            match b {
                0x00..=0x7f => self.put_char(b as char),
                0xc2..=0xf4 => self.utf8_pending.push(b),
                _ => self.put_char(REPLACEMENT),
            }
            return;
        }
        self.utf8_pending.push(b);
        let need = match self.utf8_pending[0] {
            0xc2..=0xdf => 2,
            0xe0..=0xef => 3,
            _ => 4,
        };
        if self.utf8_pending.len() >= need {
            let parsed = std::str::from_utf8(&self.utf8_pending)
                .ok()
                .and_then(|s| s.chars().next());
            self.utf8_pending.clear();
            self.put_char(parsed.unwrap_or(REPLACEMENT));
        }
    }

    // ---- grid primitives -------------------------------------------------

    fn rows_count(&self) -> i32 {
        self.rows.len() as i32
    }

    fn row_mut(&mut self, row: i32) -> Option<&mut RowData> {
        if row < 0 || row >= self.rows_count() {
            return None;
        }
        Some(std::sync::Arc::make_mut(&mut self.rows[row as usize]))
    }

    fn put_cell(&mut self, col: i32, row: i32, ch: char, attr: u16) {
        let cols = self.cols;
        if col < 0 || col >= cols {
            return;
        }
        if let Some(r) = self.row_mut(row) {
            r.chars[col as usize] = ch;
            r.attrs[col as usize] = attr;
        }
    }

    fn insert_cell(&mut self, col: i32, row: i32, ch: char, attr: u16) {
        let cols = self.cols as usize;
        if col < 0 || col as usize >= cols {
            return;
        }
        if let Some(r) = self.row_mut(row) {
            r.chars.insert(col as usize, ch);
            r.chars.truncate(cols);
            r.attrs.insert(col as usize, attr);
            r.attrs.truncate(cols);
        }
    }

    fn delete_cell(&mut self, col: i32, row: i32) {
        let cols = self.cols as usize;
        if col < 0 || col as usize >= cols {
            return;
        }
        if let Some(r) = self.row_mut(row) {
            r.chars.remove(col as usize);
            r.chars.push(' ');
            r.attrs.remove(col as usize);
            r.attrs.push(0);
        }
    }

    fn erase_area(&mut self, x: i32, y: i32, w: i32, h: i32, attr: u16) {
        let cols = self.cols;
        let rows = self.rows_count();
        let x0 = x.clamp(0, cols);
        let x1 = (x + w).clamp(0, cols);
        let y0 = y.clamp(0, rows);
        let y1 = (y + h).clamp(0, rows);
        for row in y0..y1 {
            if let Some(r) = self.row_mut(row) {
                for col in x0 as usize..x1 as usize {
                    r.chars[col] = ' ';
                    r.attrs[col] = attr;
                }
            }
        }
    }

    fn scroll_up(&mut self, top: i32, bottom: i32, n: i32) {
        let rows = self.rows_count();
        let top = top.clamp(0, rows - 1);
        let bottom = bottom.clamp(0, rows - 1);
        if top > bottom || n <= 0 {
            return;
        }
        let n = n.min(bottom - top + 1);
        for i in top..=bottom - n {
            self.rows[i as usize] = self.rows[(i + n) as usize].clone();
        }
        for i in bottom - n + 1..=bottom {
            self.rows[i as usize] = blank_row(self.cols as usize);
        }
    }

    fn scroll_down(&mut self, top: i32, bottom: i32, n: i32) {
        let rows = self.rows_count();
        let top = top.clamp(0, rows - 1);
        let bottom = bottom.clamp(0, rows - 1);
        if top > bottom || n <= 0 {
            return;
        }
        let n = n.min(bottom - top + 1);
        for i in (top + n..=bottom).rev() {
            self.rows[i as usize] = self.rows[(i - n) as usize].clone();
        }
        for i in top..top + n {
            self.rows[i as usize] = blank_row(self.cols as usize);
        }
    }

    /// Scroll-up at `row`: the region between the top margin and `row` moves
    /// up `n` lines and blanks open at `row`.
    fn insert_line_up(&mut self, row: i32, n: i32) {
        self.scroll_up(self.top_margin, row, n);
    }

    /// Scroll-down at `row`: the region between `row` and the bottom margin
    /// moves down `n` lines and blanks open at `row`.
    fn insert_line_down(&mut self, row: i32, n: i32) {
        self.scroll_down(row, self.bottom_margin, n);
    }

    fn delete_line(&mut self, row: i32) {
        let bottom = if row <= self.bottom_margin {
            self.bottom_margin
        } else {
            self.rows_count() - 1
        };
        self.scroll_up(row, bottom, 1);
    }

    /// Resizes the grid in place, preserving content. The bottom margin
    /// tracks the last row when it was there before; the cursor and margins
    /// are clamped into the new bounds.
    pub fn set_screen_size(&mut self, cols: usize, rows: usize) {
        let cols = cols.max(1) as i32;
        let rows = rows.max(1) as i32;
        let old_rows = self.rows_count();
        if cols == self.cols && rows == old_rows {
            return;
        }
        let margin_tracks_bottom = self.bottom_margin == old_rows - 1;
        if cols != self.cols {
            for row in self.rows.iter_mut() {
                std::sync::Arc::make_mut(row).resize(cols as usize);
            }
            self.cols = cols;
        }
        while self.rows_count() < rows {
            self.rows.push(blank_row(cols as usize));
        }
        self.rows.truncate(rows as usize);
        if margin_tracks_bottom || self.bottom_margin >= rows {
            self.bottom_margin = rows - 1;
        }
        self.top_margin = self.top_margin.clamp(0, rows - 1);
        self.r = self.r.min(rows - 1);
        self.c = self.c.min(cols - 1);
        while self.tabs.len() < cols as usize {
            let i = self.tabs.len();
            self.tabs.push(i % 8 == 0);
        }
    }

    /// Full reset of charsets, tabs and parser state.
    pub fn reset(&mut self) {
        self.gx = ['B', '0', 'B', 'B'];
        self.gl = 0;
        self.gr = 1;
        let tab_len = (self.cols as usize).max(132);
        self.tabs = (0..tab_len).map(|i| i % 8 == 0).collect();
        self.state = ParseState::Data;
    }

    // ---- state machine ---------------------------------------------------

    fn clear_params(&mut self) {
        self.nparams = 0;
        self.params[..4].fill(0);
    }

    fn param(&self, i: usize) -> i32 {
        self.params.get(i).copied().unwrap_or(0)
    }

    fn accumulate_param(&mut self, c: char) {
        self.params[self.nparams] = self.params[self.nparams] * 10 + (c as i32 - '0' as i32);
    }

    fn next_param(&mut self) {
        if self.nparams + 1 < MAX_PARAMS {
            self.nparams += 1;
            self.params[self.nparams] = 0;
        }
    }

    fn set_cursor_clamped(&mut self, row: i32, col: i32) {
        let mut maxr = self.rows_count() - 1;
        let tm = self.top_margin;
        self.r = row.max(0);
        self.c = col.max(0);
        if !self.move_outside_margins {
            self.r += tm;
            maxr = self.bottom_margin;
        }
        if self.r > maxr && (!self.auto_grow || !self.move_outside_margins) {
            self.r = maxr;
        }
    }

    fn put_char(&mut self, c: char) {
        let rows = self.rows_count();
        let columns = self.cols;
        let tm = self.top_margin;
        let bm = self.bottom_margin;
        let mut wrapped_here = false;
        let ibm = self.effective_encoding() == Encoding::IbmCp437;

        match self.state {
            ParseState::Data => {
                if !ibm {
                    let mut handled = true;
                    match c {
                        C1_OSC => {
                            self.pending.clear();
                            self.state = ParseState::Osc;
                        }
                        C1_RI => {
                            if self.r > tm {
                                self.r -= 1;
                            } else {
                                self.insert_line_down(self.r, 1);
                            }
                        }
                        C1_IND => {
                            if self.r == bm || self.r == rows - 1 {
                                self.insert_line_up(self.r, 1);
                            } else {
                                self.r += 1;
                            }
                        }
                        C1_NEL => {
                            if self.r == bm || self.r == rows - 1 {
                                self.insert_line_up(self.r, 1);
                            } else {
                                self.r += 1;
                            }
                            self.c = 0;
                        }
                        C1_HTS => {
                            if (self.c as usize) < self.tabs.len() {
                                self.tabs[self.c as usize] = true;
                            }
                        }
                        C1_DCS => {
                            self.pending.clear();
                            self.state = ParseState::Dcs;
                        }
                        _ => handled = false,
                    }
                    if handled {
                        self.finish_put(wrapped_here);
                        return;
                    }
                }
                match c {
                    C1_SS3 => self.one_shift = Some(3),
                    C1_SS2 => self.one_shift = Some(2),
                    C1_CSI => {
                        self.clear_params();
                        self.state = ParseState::Csi;
                    }
                    '\u{1b}' => self.state = ParseState::Esc,
                    '\u{05}' => {} // ENQ, a recording gets no answerback
                    '\u{0c}' => {
                        let attr = self.attributes;
                        self.erase_area(0, 0, columns, rows, attr);
                        self.r = 0;
                        self.c = 0;
                    }
                    '\u{08}' => {
                        self.c = (self.c - 1).max(0);
                    }
                    '\t' => loop {
                        self.c += 1;
                        if self.c >= columns || self.tabs.get(self.c as usize).copied().unwrap_or(false) {
                            break;
                        }
                    },
                    '\r' => self.c = 0,
                    '\n' => {
                        if self.r == bm || self.r >= rows - 1 {
                            self.insert_line_up(self.r, 1);
                        } else {
                            self.r += 1;
                        }
                    }
                    '\u{07}' => {} // BEL
                    '\u{0e}' => {
                        // SO, G1 into GL
                        self.gl = 1;
                        self.used_charsets = true;
                    }
                    '\u{0f}' => {
                        // SI, G0 into GL
                        self.gl = 0;
                        self.used_charsets = true;
                    }
                    _ => {
                        let mut c = c;
                        let thisgl = self.one_shift.take().unwrap_or(self.gl);
                        if c == '\0' {
                            self.finish_put(wrapped_here);
                            return;
                        }
                        if self.c >= columns {
                            if self.auto_grow {
                                let new_cols = self.c + 1;
                                self.set_screen_size(new_cols as usize, rows as usize);
                            } else if self.wraparound {
                                if self.r < rows - 1 {
                                    self.r += 1;
                                } else {
                                    self.insert_line_up(self.r, 1);
                                }
                                self.c = 0;
                            } else {
                                self.c = self.cols - 1;
                            }
                        } else if self.c == columns - 1 {
                            wrapped_here = true;
                        }
                        let mut mapped = false;
                        if self.used_charsets {
                            if ('\u{20}'..='\u{7f}').contains(&c) {
                                match self.gx[thisgl] {
                                    '0' => {
                                        if ('\u{5f}'..='\u{7e}').contains(&c) {
                                            c = dec_special_to_unicode(c);
                                            mapped = true;
                                        }
                                    }
                                    '<' => {
                                        // user preferred: Latin-1 supplement
                                        if let Some(mc) = char::from_u32((c as u32 & 0x7f) | 0x80) {
                                            c = mc;
                                        }
                                        mapped = true;
                                    }
                                    'A' | 'B' => mapped = true,
                                    other => debug!(target: "vt", charset = %other, "unsupported GL mapping"),
                                }
                            }
                            if !mapped && ('\u{80}'..='\u{ff}').contains(&c) {
                                match self.gx[self.gr] {
                                    '0' => {
                                        if ('\u{df}'..='\u{fe}').contains(&c) {
                                            if let Some(low) = char::from_u32(c as u32 - 0x80) {
                                                c = dec_special_to_unicode(low);
                                                mapped = true;
                                            }
                                        }
                                    }
                                    '<' | 'A' | 'B' => {}
                                    other => debug!(target: "vt", charset = %other, "unsupported GR mapping"),
                                }
                            }
                        }
                        if !mapped && ibm && (c as u32) < 0x100 {
                            c = cp437_to_unicode(c as u32 as u8);
                        }
                        let attr = self.attributes;
                        let (col, row) = (self.c, self.r);
                        if self.insert_mode {
                            self.insert_cell(col, row, c, attr);
                        } else {
                            self.put_cell(col, row, c, attr);
                        }
                        self.c += 1;
                    }
                }
            }
            ParseState::Osc => {
                if c < '\u{20}' && c != '\u{1b}' {
                    self.state = ParseState::Data;
                } else if c == '\\' && self.pending.ends_with('\u{1b}') {
                    self.state = ParseState::Data;
                } else {
                    self.pending.push(c);
                }
            }
            ParseState::Dcs => {
                if c == '\\' && self.pending.ends_with('\u{1b}') {
                    self.state = ParseState::Data;
                } else {
                    self.pending.push(c);
                }
            }
            ParseState::EscPercent => {
                self.state = ParseState::Data;
                match c {
                    '@' => self.encoding_override = Some(EncodingOverride::Legacy),
                    '8' | 'G' => self.encoding_override = Some(EncodingOverride::Utf8),
                    _ => debug!(target: "vt", seq = %c, "unhandled ESC %"),
                }
            }
            ParseState::EscSpace => {
                self.state = ParseState::Data;
                match c {
                    'F' | 'G' => {} // S7C1T / S8C1T, no output channel here
                    _ => debug!(target: "vt", seq = %c, "unhandled ESC <space>"),
                }
            }
            ParseState::Esc => {
                self.state = ParseState::Data;
                match c {
                    ' ' => self.state = ParseState::EscSpace,
                    '#' => self.state = ParseState::EscHash,
                    'c' => {
                        self.reset_charsets_and_tabs();
                    }
                    '[' => {
                        self.clear_params();
                        self.state = ParseState::Csi;
                    }
                    ']' => {
                        self.pending.clear();
                        self.state = ParseState::Osc;
                    }
                    'P' => {
                        self.pending.clear();
                        self.state = ParseState::Dcs;
                    }
                    'A' => self.r = (self.r - 1).max(0),
                    'B' => self.r = (self.r + 1).min(rows - 1),
                    'C' => self.c = (self.c + 1).min(columns - 1),
                    'I' => self.insert_line_down(self.r, 1),
                    'E' => {
                        if self.r == bm || self.r == rows - 1 {
                            self.insert_line_up(self.r, 1);
                        } else {
                            self.r += 1;
                        }
                        self.c = 0;
                    }
                    'D' => {
                        if self.r == bm || self.r == rows - 1 {
                            self.insert_line_up(self.r, 1);
                        } else {
                            self.r += 1;
                        }
                    }
                    'J' => {
                        let attr = self.attributes;
                        if self.r < rows - 1 {
                            self.erase_area(0, self.r + 1, columns, rows - self.r - 1, attr);
                        }
                        if self.c < columns - 1 {
                            self.erase_area(self.c, self.r, columns - self.c, 1, attr);
                        }
                    }
                    'K' => {
                        let attr = self.attributes;
                        if self.c < columns - 1 {
                            self.erase_area(self.c, self.r, columns - self.c, 1, attr);
                        }
                    }
                    'M' => {
                        if self.r <= bm {
                            if self.r > tm {
                                self.r -= 1;
                            } else {
                                self.insert_line_down(self.r, 1);
                            }
                        }
                    }
                    'H' => {
                        if self.c >= columns {
                            self.c = columns - 1;
                        }
                        if (self.c as usize) < self.tabs.len() {
                            self.tabs[self.c as usize] = true;
                        }
                    }
                    'N' => self.one_shift = Some(2),
                    'O' => self.one_shift = Some(3),
                    '=' | '>' => {} // keypad modes, nothing to display
                    '<' => self.vt52_mode = false,
                    '7' | '8' => {} // DECSC/DECRC handled via CSI s/u
                    '(' => {
                        self.state = ParseState::SetG0;
                        self.used_charsets = true;
                    }
                    ')' => {
                        self.state = ParseState::SetG1;
                        self.used_charsets = true;
                    }
                    '*' => {
                        self.state = ParseState::SetG2;
                        self.used_charsets = true;
                    }
                    '+' => {
                        self.state = ParseState::SetG3;
                        self.used_charsets = true;
                    }
                    '%' => self.state = ParseState::EscPercent,
                    '~' => {
                        self.gr = 1;
                        self.used_charsets = true;
                    }
                    'n' => {
                        self.gl = 2;
                        self.used_charsets = true;
                    }
                    '}' => {
                        self.gr = 2;
                        self.used_charsets = true;
                    }
                    'o' => {
                        self.gl = 3;
                        self.used_charsets = true;
                    }
                    '|' => {
                        self.gr = 3;
                        self.used_charsets = true;
                    }
                    'Y' => self.state = ParseState::Vt52Y,
                    _ => debug!(target: "vt", seq = %c, "unknown escape letter"),
                }
            }
            ParseState::Vt52X => {
                self.c = c as i32 - 37;
                self.state = ParseState::Vt52Y;
            }
            ParseState::Vt52Y => {
                self.r = c as i32 - 37;
                self.state = ParseState::Data;
            }
            ParseState::SetG0 | ParseState::SetG1 | ParseState::SetG2 | ParseState::SetG3 => {
                let slot = match self.state {
                    ParseState::SetG0 => 0,
                    ParseState::SetG1 => 1,
                    ParseState::SetG2 => 2,
                    _ => 3,
                };
                if c == '0' || c == 'A' || c == 'B' || c == '<' {
                    self.gx[slot] = c;
                } else {
                    debug!(target: "vt", slot, charset = %c, "unknown charset designator");
                }
                self.state = ParseState::Data;
            }
            ParseState::EscHash => {
                if c == '8' {
                    // DECALN
                    for row in 0..rows {
                        for col in 0..columns {
                            self.put_cell(col, row, 'E', 0);
                        }
                    }
                } else {
                    debug!(target: "vt", seq = %c, "unsupported ESC #");
                }
                self.state = ParseState::Data;
            }
            ParseState::DecPrivate => {
                self.state = ParseState::Data;
                match c {
                    '0'..='9' => {
                        self.accumulate_param(c);
                        self.state = ParseState::DecPrivate;
                    }
                    ';' => {
                        self.next_param();
                        self.state = ParseState::DecPrivate;
                    }
                    'h' => {
                        for i in 0..=self.nparams {
                            match self.param(i) {
                                1 => {}
                                2 => self.vt52_mode = false,
                                3 => self.set_screen_size(132, rows as usize),
                                6 => self.move_outside_margins = false,
                                7 => self.wraparound = true,
                                25 => self.cursor_visible = true,
                                9 | 1000..=1003 => {} // mouse reporting
                                1049 => {
                                    // The producer is alt-screen aware, so
                                    // cursor movement will stay in bounds on
                                    // its own terms. Stop growing the grid.
                                    self.auto_grow = false;
                                }
                                other => {
                                    trace!(target: "vt", mode = other, "DECSET unsupported")
                                }
                            }
                        }
                    }
                    'l' => {
                        for i in 0..=self.nparams {
                            match self.param(i) {
                                1 => {}
                                2 => self.vt52_mode = true,
                                3 => self.set_screen_size(80, rows as usize),
                                6 => self.move_outside_margins = true,
                                7 => self.wraparound = false,
                                25 => self.cursor_visible = false,
                                9 | 1000..=1003 => {}
                                1049 => self.auto_grow = false,
                                other => {
                                    trace!(target: "vt", mode = other, "DECRST unsupported")
                                }
                            }
                        }
                    }
                    'r' => {
                        for i in 0..=self.nparams {
                            match self.param(i) {
                                3 => self.set_screen_size(80, rows as usize),
                                6 => self.move_outside_margins = true,
                                7 => self.wraparound = false,
                                9 | 1000..=1003 => {}
                                other => {
                                    trace!(target: "vt", mode = other, "DEC mode restore unsupported")
                                }
                            }
                        }
                    }
                    'i' | 'n' | 's' => {
                        trace!(target: "vt", seq = %c, "DEC private sequence ignored")
                    }
                    other => debug!(target: "vt", seq = %other, "unsupported DEC private"),
                }
            }
            ParseState::CsiEx => {
                self.state = ParseState::Data;
                match c {
                    '\u{1b}' => self.state = ParseState::Esc,
                    _ => debug!(target: "vt", seq = %c, "unknown CSI !"),
                }
            }
            ParseState::CsiTicks => {
                self.state = ParseState::Data;
                match c {
                    'p' => {} // DECSCL, conformance level has no display effect
                    _ => debug!(target: "vt", seq = %c, "unknown CSI \""),
                }
            }
            ParseState::CsiEqual => {
                self.state = ParseState::Data;
                match c {
                    '0'..='9' => {
                        self.accumulate_param(c);
                        self.state = ParseState::CsiEqual;
                    }
                    ';' => {
                        self.next_param();
                        self.state = ParseState::CsiEqual;
                    }
                    'F' => {
                        // SCO ANSI foreground, BGR bit order
                        let v = self.param(0);
                        let color = ((v & 1) << 2) | (v & 2) | ((v & 4) >> 2);
                        self.attributes = attr::with_fg(self.attributes, color as u16 + 1);
                    }
                    'G' => {
                        let v = self.param(0);
                        let color = ((v & 1) << 2) | (v & 2) | ((v & 4) >> 2);
                        self.attributes = attr::with_bg(self.attributes, color as u16 + 1);
                    }
                    _ => debug!(target: "vt", seq = %c, "unknown CSI ="),
                }
            }
            ParseState::CsiDollar => {
                self.state = ParseState::Data;
                match c {
                    '}' | '~' => {} // status display controls
                    _ => debug!(target: "vt", seq = %c, "unknown CSI $"),
                }
            }
            ParseState::Csi => {
                self.state = ParseState::Data;
                match c {
                    '"' => self.state = ParseState::CsiTicks,
                    '$' => self.state = ParseState::CsiDollar,
                    '=' => self.state = ParseState::CsiEqual,
                    '!' => self.state = ParseState::CsiEx,
                    '?' => {
                        self.clear_params();
                        self.state = ParseState::DecPrivate;
                    }
                    '0'..='9' => {
                        self.accumulate_param(c);
                        self.state = ParseState::Csi;
                    }
                    ';' => {
                        self.next_param();
                        self.state = ParseState::Csi;
                    }
                    'c' | 'q' => {} // device attributes / LEDs
                    'g' => match self.param(0) {
                        3 => self.tabs.fill(false),
                        0 => {
                            if (self.c as usize) < self.tabs.len() {
                                self.tabs[self.c as usize] = false;
                            }
                        }
                        _ => {}
                    },
                    'h' => match self.param(0) {
                        4 => self.insert_mode = true,
                        20 => {}
                        other => trace!(target: "vt", mode = other, "SM unsupported"),
                    },
                    'l' => match self.param(0) {
                        4 => self.insert_mode = false,
                        20 => {}
                        other => trace!(target: "vt", mode = other, "RM unsupported"),
                    },
                    'i' => {} // printer controller
                    'A' => {
                        let limit = if self.r > bm {
                            bm + 1
                        } else if self.r >= tm {
                            tm
                        } else {
                            0
                        };
                        let n = self.param(0).max(1);
                        self.r = (self.r - n).max(limit);
                    }
                    'B' => {
                        let limit = if self.r < tm {
                            tm - 1
                        } else if self.r <= bm {
                            bm
                        } else {
                            rows - 1
                        };
                        let n = self.param(0).max(1);
                        self.r += n;
                        if self.r > limit {
                            if limit == rows - 1 && self.auto_grow {
                                let new_rows = self.r + 1;
                                self.set_screen_size(columns as usize, new_rows as usize);
                            } else {
                                self.r = limit;
                            }
                        }
                    }
                    'C' => {
                        let n = self.param(0).max(1);
                        self.c += n;
                        if self.c > columns - 1 {
                            if self.auto_grow {
                                let new_cols = self.c + 1;
                                self.set_screen_size(new_cols as usize, rows as usize);
                            } else {
                                self.c = columns - 1;
                            }
                        }
                    }
                    'd' => self.r = self.param(0) - 1,
                    'D' => {
                        let n = self.param(0).max(1);
                        self.c = (self.c - n).max(0);
                    }
                    'r' => {
                        // DECSTBM
                        let mut row = if self.nparams > 0 {
                            let r = self.param(1) - 1;
                            if r < 0 || r >= rows {
                                rows - 1
                            } else {
                                r
                            }
                        } else {
                            rows - 1
                        };
                        self.bottom_margin = row;
                        if row >= self.param(0) {
                            row = (self.param(0) - 1).max(0);
                        }
                        self.top_margin = row;
                        self.set_cursor_clamped(0, 0);
                    }
                    'G' => self.c = self.param(0) - 1,
                    'H' => {
                        let (row, col) = (self.param(0) - 1, self.param(1) - 1);
                        self.set_cursor_clamped(row, col);
                    }
                    'f' => {
                        self.r = (self.param(0) - 1).max(0);
                        self.c = (self.param(1) - 1).max(0);
                    }
                    'S' => {
                        let n = self.param(0).max(1);
                        self.insert_line_up(rows - 1, n);
                    }
                    'L' => {
                        let n = self.param(0).max(1);
                        self.insert_line_down(self.r, n);
                    }
                    'T' => {
                        let n = self.param(0).max(1);
                        self.insert_line_down(0, n);
                    }
                    'M' => {
                        let n = self.param(0).max(1);
                        for _ in 0..n {
                            self.delete_line(self.r);
                        }
                    }
                    'K' => {
                        let attr = self.attributes;
                        match self.param(0) {
                            // some terminals use 6 for erase to end of line
                            0 | 6 => {
                                if self.c < columns - 1 {
                                    self.erase_area(self.c, self.r, columns - self.c, 1, attr);
                                }
                            }
                            1 => {
                                if self.c > 0 {
                                    self.erase_area(0, self.r, self.c + 1, 1, attr);
                                }
                            }
                            2 => self.erase_area(0, self.r, columns, 1, attr),
                            _ => {}
                        }
                    }
                    'J' => {
                        let attr = self.attributes;
                        match self.param(0) {
                            0 => {
                                if self.r < rows - 1 {
                                    self.erase_area(0, self.r + 1, columns, rows - self.r - 1, attr);
                                }
                                if self.c < columns - 1 {
                                    self.erase_area(self.c, self.r, columns - self.c, 1, attr);
                                }
                            }
                            1 => {
                                if self.r > 0 {
                                    self.erase_area(0, 0, columns, self.r, attr);
                                }
                                if self.c > 0 {
                                    self.erase_area(0, self.r, self.c + 1, 1, attr);
                                }
                            }
                            2 => self.erase_area(0, 0, columns, rows, attr),
                            _ => {}
                        }
                    }
                    '@' => {
                        let attr = self.attributes;
                        for _ in 0..self.param(0) {
                            let (col, row) = (self.c, self.r);
                            self.insert_cell(col, row, ' ', attr);
                        }
                    }
                    'X' => {
                        let mut n = self.param(0).max(1);
                        if n + self.c > columns {
                            n = columns - self.c;
                        }
                        let attr = self.attributes;
                        self.erase_area(self.c, self.r, n, 1, attr);
                    }
                    'P' => {
                        let n = self.param(0).max(1);
                        for _ in 0..n {
                            let (col, row) = (self.c, self.r);
                            self.delete_cell(col, row);
                        }
                    }
                    'n' => {} // device status report, nothing to answer
                    's' => {
                        self.saved_c = self.c;
                        self.saved_r = self.r;
                        self.saved_attr = self.attributes;
                    }
                    't' => {
                        if self.param(0) == 8 {
                            let (h, w) = (self.param(1), self.param(2));
                            if h > 0 && w > 0 {
                                self.set_screen_size(w as usize, h as usize);
                                self.auto_grow_veto = true;
                                self.auto_grow = false;
                            }
                        } else {
                            trace!(target: "vt", op = self.param(0), "CSI t unsupported");
                        }
                    }
                    'u' => {
                        self.c = self.saved_c;
                        self.r = self.saved_r;
                        self.attributes = self.saved_attr;
                    }
                    'm' => self.apply_sgr(),
                    _ => debug!(target: "vt", seq = %c, "unknown CSI letter"),
                }
            }
        }
        self.finish_put(wrapped_here);
    }

    fn apply_sgr(&mut self) {
        if self.nparams == 0 && self.param(0) == 0 {
            self.attributes = 0;
        }
        for i in 0..=self.nparams {
            match self.param(i) {
                0 => {
                    if self.nparams > 0 {
                        self.attributes = 0;
                    }
                }
                1 => {
                    self.attributes |= attr::BOLD;
                    self.attributes &= !attr::LOW;
                }
                2 => self.attributes |= attr::LOW,
                4 => self.attributes |= attr::UNDERLINE,
                7 => self.attributes |= attr::INVERT,
                8 => self.attributes |= attr::INVISIBLE,
                5 | 25 => {} // blink
                10 => {
                    self.gl = 0;
                    self.used_charsets = true;
                }
                11 | 12 => {
                    self.gl = 1;
                    self.used_charsets = true;
                }
                21 => self.attributes &= !(attr::LOW | attr::BOLD),
                22 => self.attributes &= !attr::BOLD,
                24 => self.attributes &= !attr::UNDERLINE,
                27 => self.attributes &= !attr::INVERT,
                28 => self.attributes &= !attr::INVISIBLE,
                v @ 30..=37 => self.attributes = attr::with_fg(self.attributes, (v - 30 + 1) as u16),
                39 => self.attributes = attr::with_fg(self.attributes, 0),
                v @ 40..=47 => self.attributes = attr::with_bg(self.attributes, (v - 40 + 1) as u16),
                49 => self.attributes = attr::with_bg(self.attributes, 0),
                other => debug!(target: "vt", sgr = other, "unknown SGR"),
            }
        }
    }

    fn reset_charsets_and_tabs(&mut self) {
        self.gx = ['B', '0', 'B', 'B'];
        self.gl = 0;
        self.gr = 1;
        let tab_len = (self.cols as usize).max(132);
        self.tabs = (0..tab_len).map(|i| i % 8 == 0).collect();
    }

    fn finish_put(&mut self, wrapped_here: bool) {
        if self.auto_grow {
            if self.c >= self.cols && !wrapped_here && self.state == ParseState::Data {
                let (new_cols, rows) = (self.c + 1, self.rows.len());
                self.set_screen_size(new_cols as usize, rows);
            }
            if self.r >= self.rows_count() {
                let (cols, new_rows) = (self.cols, self.r + 1);
                self.set_screen_size(cols as usize, new_rows as usize);
            }
        } else {
            // the cursor may rest one past the edge with a wrap pending
            if self.c > self.cols {
                self.c = self.cols;
            }
            if self.r > self.rows_count() {
                self.r = self.rows_count();
            }
        }
        self.r = self.r.max(0);
        self.c = self.c.max(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attr;

    fn term() -> Terminal {
        let mut t = Terminal::new(80, 24);
        t.set_auto_grow(false);
        t
    }

    #[test]
    fn plain_text_advances_cursor() {
        let mut t = term();
        t.feed_str("hello");
        assert_eq!(t.row_text(0).trim_end(), "hello");
        assert_eq!(t.cursor(), (0, 5));
    }

    #[test]
    fn cup_is_one_based_and_clamped() {
        let mut t = term();
        t.feed_str("\x1b[10;20Hx");
        assert_eq!(t.char_at(9, 19), 'x');
        t.feed_str("\x1b[99;99H");
        assert_eq!(t.cursor(), (23, 79));
    }

    #[test]
    fn clamped_cursor_still_prints_on_the_bottom_row() {
        let mut t = term();
        t.feed_str("\x1b[30;1HX");
        assert_eq!(t.char_at(23, 0), 'X');
        assert_eq!(t.rows(), 24);
    }

    #[test]
    fn sgr_sets_packed_attributes() {
        let mut t = term();
        t.feed_str("\x1b[1;31;44mZ");
        let a = t.attr_at(0, 0);
        assert_ne!(a & attr::BOLD, 0);
        assert_eq!(attr::fg(a), 2); // red is colour 1, stored offset by one
        assert_eq!(attr::bg(a), 5); // blue is colour 4
        t.feed_str("\x1b[mY");
        assert_eq!(t.attr_at(0, 2), 0);
    }

    #[test]
    fn wrap_at_right_edge() {
        let mut t = term();
        t.feed_str(&"a".repeat(81));
        assert_eq!(t.char_at(0, 79), 'a');
        assert_eq!(t.char_at(1, 0), 'a');
    }

    #[test]
    fn scroll_region_confines_linefeed() {
        let mut t = term();
        t.feed_str("\x1b[5;10r"); // margins rows 5..10 (one based)
        t.feed_str("\x1b[10;1Hbottom");
        t.feed_str("\n");
        // the region scrolled, the line moved up one row
        assert_eq!(t.row_text(8).trim_end(), "bottom");
        assert_eq!(t.row_text(9).trim_end(), "");
    }

    #[test]
    fn erase_line_variants() {
        let mut t = term();
        t.feed_str("abcdef\x1b[1;3H\x1b[K");
        assert_eq!(t.row_text(0).trim_end(), "ab");
        t.feed_str("\x1b[2K");
        assert_eq!(t.row_text(0).trim_end(), "");
    }

    #[test]
    fn auto_grow_extends_grid_on_overflow() {
        let mut t = Terminal::new(80, 24);
        assert!(t.auto_grow());
        t.feed_str("\x1b[30;1Hdeep");
        assert!(t.rows() >= 30);
        assert_eq!(t.row_text(29).trim_end(), "deep");
    }

    #[test]
    fn alt_screen_marker_disables_growth() {
        let mut t = Terminal::new(80, 24);
        t.feed_str("\x1b[?1049h");
        assert!(!t.auto_grow());
        t.feed_str("\x1b[30;1HX");
        assert_eq!(t.rows(), 24);
        assert_eq!(t.char_at(23, 0), 'X');
    }

    #[test]
    fn explicit_size_vetoes_growth() {
        let mut t = Terminal::new(80, 24);
        t.feed_str("\x1b[8;30;100t");
        assert_eq!((t.cols(), t.rows()), (100, 30));
        assert!(t.auto_grow_vetoed());
        t.set_auto_grow(true);
        assert!(!t.auto_grow());
    }

    #[test]
    fn dec_special_charset_draws_lines() {
        let mut t = term();
        t.feed_str("\x1b(0qqq");
        assert_eq!(t.char_at(0, 0), '\u{2500}');
        t.feed_str("\x1b(Bq");
        assert_eq!(t.char_at(0, 3), 'q');
    }

    #[test]
    fn shift_out_uses_g1() {
        let mut t = term();
        t.feed_str("\x0eq\x0fq");
        assert_eq!(t.char_at(0, 0), '\u{2500}'); // G1 defaults to DEC special
        assert_eq!(t.char_at(0, 1), 'q');
    }

    #[test]
    fn utf8_bytes_decode_incrementally() {
        let mut t = term();
        t.set_encoding(Encoding::Utf8);
        t.feed_bytes(&[0xe2, 0x82]);
        assert_eq!(t.cursor(), (0, 0));
        t.feed_bytes(&[0xac, b'A']);
        assert_eq!(t.char_at(0, 0), '\u{20ac}');
        assert_eq!(t.char_at(0, 1), 'A');
    }

    #[test]
    fn cp437_maps_high_bytes() {
        let mut t = term();
        t.set_encoding(Encoding::IbmCp437);
        t.feed_bytes(&[0xb0]);
        assert_eq!(t.char_at(0, 0), '\u{2591}');
    }

    #[test]
    fn encoding_override_forces_utf8() {
        let mut t = term();
        t.feed_str("\x1b%G");
        assert_eq!(t.encoding_override(), Some(EncodingOverride::Utf8));
        t.feed_bytes(&[0xe2, 0x82, 0xac]);
        assert_eq!(t.char_at(0, 0), '\u{20ac}');
    }

    #[test]
    fn clone_is_independent() {
        let mut a = term();
        a.feed_str("shared");
        let mut b = a.clone();
        assert_eq!(a, b);
        b.feed_str("\x1b[1;1HX");
        assert_eq!(a.char_at(0, 0), 's');
        assert_eq!(b.char_at(0, 0), 'X');
    }

    #[test]
    fn insert_and_delete_chars() {
        let mut t = term();
        t.feed_str("abc\x1b[1;1H\x1b[2@");
        assert_eq!(t.row_text(0).trim_end(), "  abc");
        t.feed_str("\x1b[1P");
        assert_eq!(t.row_text(0).trim_end(), " abc");
    }

    #[test]
    fn tabs_move_to_stops() {
        let mut t = term();
        t.feed_str("\tx");
        assert_eq!(t.char_at(0, 8), 'x');
    }

    #[test]
    fn save_restore_cursor() {
        let mut t = term();
        t.feed_str("\x1b[5;5H\x1b[s\x1b[1;1H\x1b[u!");
        assert_eq!(t.char_at(4, 4), '!');
    }

    #[test]
    fn decaln_fills_screen() {
        let mut t = term();
        t.feed_str("\x1b#8");
        assert_eq!(t.char_at(0, 0), 'E');
        assert_eq!(t.char_at(23, 79), 'E');
    }
}
