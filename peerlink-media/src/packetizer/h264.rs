//! H.264 payload fragmentation: single NAL unit packets for small units,
//! fragmentation units (FU-A) for units over the fragment budget.

use bytes::{BufMut, Bytes, BytesMut};
use shared::error::{Error, Result};

use super::NalSeparator;

const FU_A_TYPE: u8 = 28;
const FU_HEADER_LEN: usize = 2;

const NAL_REF_IDC_MASK: u8 = 0x60;
const NAL_TYPE_MASK: u8 = 0x1f;

/// Split a sample into NAL units according to the configured separator and
/// emit payloads within `max_fragment` bytes each.
pub(crate) fn payloads(
    separator: NalSeparator,
    sample: &[u8],
    max_fragment: usize,
) -> Result<Vec<Bytes>> {
    let mut out = Vec::new();
    for unit in split_units(separator, sample)? {
        if unit.is_empty() {
            continue;
        }
        emit_unit(unit, max_fragment, &mut out);
    }
    Ok(out)
}

fn split_units(separator: NalSeparator, sample: &[u8]) -> Result<Vec<&[u8]>> {
    match separator {
        NalSeparator::Length => split_length_prefixed(sample),
        NalSeparator::LongStartSequence => Ok(split_start_codes(sample, false)),
        NalSeparator::ShortStartSequence | NalSeparator::StartSequence => {
            Ok(split_start_codes(sample, true))
        }
    }
}

fn split_length_prefixed(sample: &[u8]) -> Result<Vec<&[u8]>> {
    let mut units = Vec::new();
    let mut offset = 0;
    while offset < sample.len() {
        if offset + 4 > sample.len() {
            return Err(Error::ErrInvalidSampleFraming);
        }
        let len = u32::from_be_bytes([
            sample[offset],
            sample[offset + 1],
            sample[offset + 2],
            sample[offset + 3],
        ]) as usize;
        offset += 4;
        if offset + len > sample.len() {
            return Err(Error::ErrInvalidSampleFraming);
        }
        units.push(&sample[offset..offset + len]);
        offset += len;
    }
    Ok(units)
}

/// Scan for 0x000001 start codes. With `allow_short` false only the
/// four-byte form delimits units; a three-byte match preceded by a zero is
/// treated as the long form either way.
fn split_start_codes(sample: &[u8], allow_short: bool) -> Vec<&[u8]> {
    let mut starts: Vec<usize> = Vec::new();
    let mut i = 0;
    while i + 3 <= sample.len() {
        if sample[i] == 0 && sample[i + 1] == 0 && sample[i + 2] == 1 {
            let is_long = i > 0 && sample[i - 1] == 0;
            if allow_short || is_long {
                starts.push(i + 3);
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    let mut units = Vec::with_capacity(starts.len());
    for (idx, &start) in starts.iter().enumerate() {
        let mut end = if idx + 1 < starts.len() {
            starts[idx + 1] - 3
        } else {
            sample.len()
        };
        // Trim the zero that belongs to the next long start code
        while end > start && sample[end - 1] == 0 && idx + 1 < starts.len() {
            end -= 1;
        }
        units.push(&sample[start..end]);
    }
    units
}

fn emit_unit(unit: &[u8], max_fragment: usize, out: &mut Vec<Bytes>) {
    if unit.len() <= max_fragment {
        out.push(Bytes::copy_from_slice(unit));
        return;
    }

    // FU-A fragmentation: the unit header is replaced by an indicator and
    // a fragment header carrying the original type.
    let indicator = (unit[0] & NAL_REF_IDC_MASK) | FU_A_TYPE;
    let nal_type = unit[0] & NAL_TYPE_MASK;
    let chunk_size = max_fragment.saturating_sub(FU_HEADER_LEN).max(1);
    let body = &unit[1..];
    let mut offset = 0;
    while offset < body.len() {
        let end = (offset + chunk_size).min(body.len());
        let start_bit = if offset == 0 { 0x80 } else { 0 };
        let end_bit = if end == body.len() { 0x40 } else { 0 };
        let mut payload = BytesMut::with_capacity(FU_HEADER_LEN + end - offset);
        payload.put_u8(indicator);
        payload.put_u8(start_bit | end_bit | nal_type);
        payload.extend_from_slice(&body[offset..end]);
        out.push(payload.freeze());
        offset = end;
    }
}
