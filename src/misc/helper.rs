// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Miscellaneous helper functions that didn't fit elsewhere.

use byteorder::{BigEndian, ReadBytesExt};
use std::{fs::File, io::Cursor, path::Path};

/// Read a 16 bit gray png image from a file.
///
/// Returns `(width, height, buffer)` with the buffer in row major order.
pub fn read_png_16bits<P: AsRef<Path>>(
    file_path: P,
) -> Result<(usize, usize, Vec<u16>), png::DecodingError> {
    let img_file = File::open(file_path)?;
    let mut decoder = png::Decoder::new(img_file);
    // Use the IDENTITY transformation because by default
    // it will use STRIP_16 which only keep 8 bits.
    decoder.set_transformations(png::Transformations::IDENTITY);
    let mut reader = decoder.read_info()?;
    let mut buffer = vec![0; reader.output_buffer_size()];
    let info = reader.next_frame(&mut buffer)?;

    // Transform buffer into 16 bits slice.
    let nb_pixels = (info.width * info.height) as usize;
    let mut buffer_u16 = vec![0; nb_pixels];
    let end = buffer.len().min(2 * nb_pixels);
    let mut buffer_cursor = Cursor::new(&buffer[..end]);
    buffer_cursor.read_u16_into::<BigEndian>(&mut buffer_u16)?;

    Ok((info.width as usize, info.height as usize, buffer_u16))
}

/// Read an 8 bits png from a file, without palette expansion.
///
/// Indexed images give their palette indices, as label maps need.
/// Only the first sample of each pixel is kept.
/// Returns `(width, height, buffer)` with the buffer in row major order.
pub fn read_png_8bits<P: AsRef<Path>>(
    file_path: P,
) -> Result<(usize, usize, Vec<u8>), png::DecodingError> {
    let img_file = File::open(file_path)?;
    let mut decoder = png::Decoder::new(img_file);
    decoder.set_transformations(png::Transformations::IDENTITY);
    let mut reader = decoder.read_info()?;
    let mut buffer = vec![0; reader.output_buffer_size()];
    let info = reader.next_frame(&mut buffer)?;

    let (width, height) = (info.width as usize, info.height as usize);
    let bytes_per_pixel = info.color_type.samples() * ((info.bit_depth as usize + 7) / 8);
    let values = buffer
        .chunks(info.line_size)
        .take(height)
        .flat_map(|row| row.iter().step_by(bytes_per_pixel).take(width).copied())
        .collect();
    Ok((width, height, values))
}

/// Format a duration in seconds as `XXhYYm`.
#[allow(clippy::cast_possible_truncation)]
#[allow(clippy::cast_sign_loss)]
pub fn sec_to_hm_str(seconds: f64) -> String {
    let minutes = (seconds.max(0.0) / 60.0) as u64;
    format!("{:02}h{:02}m", minutes / 60, minutes % 60)
}

/// Reflect an index into `0..len`, mirroring around the borders without
/// repeating the edge sample (`-1 -> 1`, `len -> len - 2`).
#[allow(clippy::cast_possible_wrap)]
#[allow(clippy::cast_sign_loss)]
pub fn reflect(index: isize, len: usize) -> usize {
    if len < 2 {
        return 0;
    }
    let last = len as isize - 1;
    let mut i = index;
    while i < 0 || i > last {
        i = if i < 0 { -i } else { 2 * last - i };
    }
    i as usize
}

// TESTS #############################################################

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn reflect_borders() {
        assert_eq!(1, reflect(-1, 5));
        assert_eq!(3, reflect(5, 5));
        assert_eq!(2, reflect(2, 5));
        assert_eq!(0, reflect(-3, 1));
    }

    #[test]
    fn hours_minutes() {
        assert_eq!("01h01m", sec_to_hm_str(3671.0));
        assert_eq!("00h00m", sec_to_hm_str(-5.0));
    }
}
