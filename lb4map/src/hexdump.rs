use std::fmt;

const ROW: usize = 16;

/// Renders bytes as offset, two groups of eight hex bytes and an ASCII
/// column, one line per 16 bytes.
pub struct HexDump<'a>(pub &'a [u8]);

impl fmt::Display for HexDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (idx, row) in self.0.chunks(ROW).enumerate() {
            write!(f, "{:08x}  ", idx * ROW)?;
            for pos in 0..ROW {
                match row.get(pos) {
                    Some(b) => write!(f, "{:02x} ", b)?,
                    None => f.write_str("   ")?,
                }
                if pos == 7 {
                    f.write_str(" ")?;
                }
            }

            f.write_str(" |")?;
            for &c in row {
                let shown = if c.is_ascii_graphic() || c == b' ' {
                    c as char
                } else {
                    '.'
                };
                write!(f, "{}", shown)?;
            }
            f.write_str("|\n")?;
        }
        Ok(())
    }
}
