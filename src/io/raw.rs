//! Read / write float arrays as raw little-endian binary

use std::fs::File;
use std::io::{Write, Read, BufWriter, BufReader};
use std::path::Path;

pub fn write(data: impl Iterator<Item = f32>, path: &Path) -> std::io::Result<()> {
    let file = File::create(path)?;
    let mut buf = BufWriter::new(file);
    for datum in data {
        buf.write_all(&datum.to_le_bytes())?;
    }
    buf.flush()
}

type IORes<T> = std::io::Result<T>;

/// Lazily read consecutive `f32`s. Trailing bytes which do not make up a
/// whole value are reported as an error.
pub fn read<'a>(path: &Path) -> IORes<impl Iterator<Item = IORes<f32>> + 'a> {
    let file = File::open(path)?;
    let mut buf = BufReader::new(file);
    let mut buffer = [0; 4];

    Ok(std::iter::from_fn(move || {
        let mut filled = 0;
        while filled < 4 {
            match buf.read(&mut buffer[filled..]) {
                Ok(0) if filled == 0 => return None,
                Ok(0) => return Some(Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("{filled} trailing byte(s) do not make up an f32"),
                ))),
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => (),
                Err(e) => return Some(Err(e)),
            }
        }
        Some(Ok(f32::from_le_bytes(buffer)))
    }))
}
