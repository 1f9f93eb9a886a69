//! # SLIP Framing
//!
//! RFC 1055 byte stuffing as used by the iU880B/LoRa style serial links.
//! `0xC0` marks frame boundaries; `0xDB 0xDC` and `0xDB 0xDD` escape literal
//! `0xC0` and `0xDB` bytes inside a frame.

const SLIP_END: u8 = 0xc0;
const SLIP_ESC: u8 = 0xdb;
const SLIP_ESC_END: u8 = 0xdc;
const SLIP_ESC_ESC: u8 = 0xdd;

/// Wrap a payload in SLIP framing.
pub fn add_slip_framing(from: &[u8]) -> Vec<u8> {
    let mut to = Vec::with_capacity(from.len() + 2);
    to.push(SLIP_END);
    for &c in from {
        match c {
            SLIP_END => {
                to.push(SLIP_ESC);
                to.push(SLIP_ESC_END);
            }
            SLIP_ESC => {
                to.push(SLIP_ESC);
                to.push(SLIP_ESC_ESC);
            }
            _ => to.push(c),
        }
    }
    to.push(SLIP_END);
    to
}

/// Extract the first SLIP frame from a buffer.
///
/// Returns the unframed payload and how many input bytes were consumed, so
/// a caller accumulating serial data can drain its buffer. A return of
/// `(empty, 0)` means no complete frame is available yet.
pub fn remove_slip_framing(from: &[u8]) -> (Vec<u8>, usize) {
    let mut to = Vec::with_capacity(from.len());
    let mut esc = false;
    let mut consumed = 0;
    let mut found_end = false;

    for (i, &c) in from.iter().enumerate() {
        if c == SLIP_END {
            if !to.is_empty() {
                found_end = true;
                consumed = i + 1;
                break;
            }
            // Leading frame marker, or an empty frame: keep scanning.
        } else if c == SLIP_ESC {
            esc = true;
        } else if esc {
            match c {
                SLIP_ESC_END => to.push(SLIP_END),
                SLIP_ESC_ESC => to.push(SLIP_ESC),
                // Protocol violation, keep the byte to stay in sync.
                _ => to.push(c),
            }
            esc = false;
        } else {
            to.push(c);
        }
    }

    if found_end {
        (to, consumed)
    } else {
        (Vec::new(), 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_with_escapes() {
        let payload = [1u8, 0xc0, 3, 4, 5, 0xdb];
        let framed = add_slip_framing(&payload);
        assert_eq!(
            framed,
            vec![0xc0, 1, 0xdb, 0xdc, 3, 4, 5, 0xdb, 0xdd, 0xc0]
        );
        let (unframed, consumed) = remove_slip_framing(&framed);
        assert_eq!(unframed, payload);
        assert_eq!(consumed, 10);
    }

    #[test]
    fn test_two_concatenated_frames() {
        let a = [0x11u8, 0x22];
        let b = [0x33u8, 0xc0, 0x44];
        let mut buf = add_slip_framing(&a);
        buf.extend_from_slice(&add_slip_framing(&b));

        let (first, consumed) = remove_slip_framing(&buf);
        assert_eq!(first, a);
        let (second, consumed2) = remove_slip_framing(&buf[consumed..]);
        assert_eq!(second, b);
        assert_eq!(consumed + consumed2, buf.len());
    }

    #[test]
    fn test_incomplete_frame() {
        let (frame, consumed) = remove_slip_framing(&[0xc0, 0x01, 0x02]);
        assert!(frame.is_empty());
        assert_eq!(consumed, 0);
    }
}
