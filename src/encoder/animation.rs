// Animated image detection (GIF loop extension / multiple frames, APNG)

use std::path::Path;

const GIF_LOOP_MARKERS: [&[u8]; 2] = [b"NETSCAPE2.0", b"ANIMEXTS1.0"];
const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

/// True when the file is a multi-frame GIF, a GIF with a loop extension, or an APNG.
pub fn is_animated(path: &Path) -> std::io::Result<bool> {
    let bytes = std::fs::read(path)?;
    Ok(is_animated_bytes(&bytes))
}

pub fn is_animated_bytes(bytes: &[u8]) -> bool {
    if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        return match scan_gif(bytes) {
            Some(scan) => scan.has_loop_marker || scan.frames > 1,
            // Truncated or odd files: fall back to a plain marker search
            None => GIF_LOOP_MARKERS
                .iter()
                .any(|m| bytes.windows(m.len()).any(|w| w == *m)),
        };
    }
    if bytes.starts_with(PNG_SIGNATURE) {
        return png_has_actl(bytes);
    }
    false
}

struct GifScan {
    frames: usize,
    has_loop_marker: bool,
}

/// Walk the GIF block structure counting image descriptors.
fn scan_gif(bytes: &[u8]) -> Option<GifScan> {
    let packed = *bytes.get(10)?;
    let mut pos = 13;
    if packed & 0x80 != 0 {
        pos += 3 * (1usize << ((packed & 0x07) + 1));
    }

    let mut scan = GifScan { frames: 0, has_loop_marker: false };

    loop {
        match *bytes.get(pos)? {
            0x21 => {
                let label = *bytes.get(pos + 1)?;
                pos += 2;
                let first_block_start = pos;
                pos = skip_sub_blocks(bytes, pos)?;
                if label == 0xFF {
                    let len = *bytes.get(first_block_start)? as usize;
                    let app_id = bytes.get(first_block_start + 1..first_block_start + 1 + len)?;
                    if GIF_LOOP_MARKERS.iter().any(|m| app_id == *m) {
                        scan.has_loop_marker = true;
                    }
                }
            }
            0x2C => {
                scan.frames += 1;
                let packed = *bytes.get(pos + 9)?;
                pos += 10;
                if packed & 0x80 != 0 {
                    pos += 3 * (1usize << ((packed & 0x07) + 1));
                }
                // LZW minimum code size, then image data sub-blocks
                pos += 1;
                pos = skip_sub_blocks(bytes, pos)?;
            }
            0x3B => return Some(scan),
            _ => return None,
        }
    }
}

fn skip_sub_blocks(bytes: &[u8], mut pos: usize) -> Option<usize> {
    loop {
        let len = *bytes.get(pos)? as usize;
        pos += 1;
        if len == 0 {
            return Some(pos);
        }
        pos += len;
    }
}

/// APNG carries an `acTL` chunk before the first `IDAT`.
fn png_has_actl(bytes: &[u8]) -> bool {
    let mut pos = PNG_SIGNATURE.len();
    while pos + 8 <= bytes.len() {
        let len = u32::from_be_bytes([bytes[pos], bytes[pos + 1], bytes[pos + 2], bytes[pos + 3]]) as usize;
        let kind = &bytes[pos + 4..pos + 8];
        match kind {
            b"acTL" => return true,
            b"IDAT" | b"IEND" => return false,
            _ => {}
        }
        pos = match pos.checked_add(12 + len) {
            Some(p) => p,
            None => return false,
        };
    }
    false
}

#[cfg(test)]
pub(crate) mod fixtures {
    /// Minimal GIF89a: no global color table, optional NETSCAPE loop block, `frames` 1x1 images.
    pub fn gif(frames: usize, loop_marker: bool) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"GIF89a");
        out.extend_from_slice(&[1, 0, 1, 0, 0x00, 0, 0]);
        if loop_marker {
            out.extend_from_slice(&[0x21, 0xFF, 0x0B]);
            out.extend_from_slice(b"NETSCAPE2.0");
            out.extend_from_slice(&[0x03, 0x01, 0x00, 0x00, 0x00]);
        }
        for _ in 0..frames {
            out.extend_from_slice(&[0x2C, 0, 0, 0, 0, 1, 0, 1, 0, 0x00]);
            out.extend_from_slice(&[0x02, 0x02, 0x44, 0x01, 0x00]);
        }
        out.push(0x3B);
        out
    }
}
