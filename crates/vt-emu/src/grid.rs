use std::sync::Arc;

/// One row of the terminal grid. Rows are shared between terminal clones and
/// copied on first write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RowData {
    pub chars: Vec<char>,
    pub attrs: Vec<u16>,
}

impl RowData {
    pub fn blank(cols: usize) -> Self {
        Self {
            chars: vec![' '; cols],
            attrs: vec![0; cols],
        }
    }

    pub fn blank_with(cols: usize, attr: u16) -> Self {
        Self {
            chars: vec![' '; cols],
            attrs: vec![attr; cols],
        }
    }

    pub fn resize(&mut self, cols: usize) {
        self.chars.resize(cols, ' ');
        self.attrs.resize(cols, 0);
    }
}

pub type Row = Arc<RowData>;

pub fn blank_row(cols: usize) -> Row {
    Arc::new(RowData::blank(cols))
}
