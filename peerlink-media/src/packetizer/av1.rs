//! AV1 payload packetization per the AV1 RTP specification.
//!
//! Elements carry a LEB128 length prefix (W=0 form); OBU size fields are
//! stripped since the length prefix makes them redundant. Oversized OBUs
//! fragment across packets using the Z/Y continuation flags.

use bytes::{BufMut, Bytes, BytesMut};
use shared::error::{Error, Result};

use super::ObuPacketization;

const AGGREGATION_HEADER_LEN: usize = 1;

const AV1_Z_MASK: u8 = 0b1000_0000;
const AV1_Y_MASK: u8 = 0b0100_0000;
const AV1_N_MASK: u8 = 0b0000_1000;

const OBU_TYPE_MASK: u8 = 0x78;
const OBU_EXTENSION_BIT: u8 = 0x04;
const OBU_HAS_SIZE_BIT: u8 = 0x02;

const OBU_TYPE_SEQUENCE_HEADER: u8 = 1;
const OBU_TYPE_TEMPORAL_DELIMITER: u8 = 2;
const OBU_TYPE_TILE_LIST: u8 = 8;

pub(crate) fn payloads(
    packetization: ObuPacketization,
    sample: &[u8],
    max_fragment: usize,
) -> Result<Vec<Bytes>> {
    let obus = parse_obus(sample)?;
    if obus.is_empty() {
        return Ok(Vec::new());
    }
    let new_sequence = obus
        .iter()
        .any(|obu| obu_type(obu[0]) == OBU_TYPE_SEQUENCE_HEADER);

    let mut out = Vec::new();
    match packetization {
        ObuPacketization::TemporalUnit => {
            pack_elements(&obus, max_fragment, new_sequence, &mut out);
        }
        ObuPacketization::Obu => {
            for (i, obu) in obus.iter().enumerate() {
                pack_elements(
                    std::slice::from_ref(obu),
                    max_fragment,
                    new_sequence && i == 0,
                    &mut out,
                );
            }
        }
    }
    Ok(out)
}

fn obu_type(header: u8) -> u8 {
    (header & OBU_TYPE_MASK) >> 3
}

/// Parse a low-overhead bitstream into size-field-free OBU elements,
/// dropping temporal delimiters and tile lists.
fn parse_obus(sample: &[u8]) -> Result<Vec<Bytes>> {
    let mut obus = Vec::new();
    let mut offset = 0;
    while offset < sample.len() {
        let header = sample[offset];
        let has_extension = header & OBU_EXTENSION_BIT != 0;
        let has_size = header & OBU_HAS_SIZE_BIT != 0;
        let header_len = if has_extension { 2 } else { 1 };
        if offset + header_len > sample.len() {
            return Err(Error::ErrInvalidSampleFraming);
        }
        let (payload_start, payload_len) = if has_size {
            let (size, consumed) = read_leb128(&sample[offset + header_len..]);
            if consumed == 0 {
                return Err(Error::ErrInvalidSampleFraming);
            }
            (offset + header_len + consumed, size as usize)
        } else {
            // Only legal for the final unit of the sample
            (offset + header_len, sample.len() - offset - header_len)
        };
        if payload_start + payload_len > sample.len() {
            return Err(Error::ErrInvalidSampleFraming);
        }

        let kind = obu_type(header);
        if kind != OBU_TYPE_TEMPORAL_DELIMITER && kind != OBU_TYPE_TILE_LIST {
            let mut element = BytesMut::with_capacity(header_len + payload_len);
            element.put_u8(header & !OBU_HAS_SIZE_BIT);
            if has_extension {
                element.put_u8(sample[offset + 1]);
            }
            element.extend_from_slice(&sample[payload_start..payload_start + payload_len]);
            obus.push(element.freeze());
        }
        offset = payload_start + payload_len;
    }
    Ok(obus)
}

struct PacketInProgress {
    body: BytesMut,
    z: bool,
    y: bool,
}

/// Greedily fill packets with length-prefixed elements, fragmenting
/// elements that overflow the budget.
fn pack_elements(elements: &[Bytes], max_fragment: usize, new_sequence: bool, out: &mut Vec<Bytes>) {
    let budget = max_fragment.max(AGGREGATION_HEADER_LEN + 2);
    let mut packets: Vec<PacketInProgress> = Vec::new();
    let mut current = PacketInProgress {
        body: BytesMut::new(),
        z: false,
        y: false,
    };

    for element in elements {
        let mut remaining = &element[..];
        let mut first_fragment = true;
        loop {
            let space = budget - AGGREGATION_HEADER_LEN - current.body.len();
            let need = leb128_size(remaining.len() as u32) + remaining.len();
            if need <= space {
                write_leb128(&mut current.body, remaining.len() as u32);
                current.body.extend_from_slice(remaining);
                break;
            }
            // Not even room for a minimal fragment: close this packet first
            if space < 2 {
                let continued = !first_fragment;
                packets.push(std::mem::replace(
                    &mut current,
                    PacketInProgress {
                        body: BytesMut::new(),
                        z: continued,
                        y: false,
                    },
                ));
                continue;
            }
            let fragment_len = fit_fragment(space, remaining.len());
            write_leb128(&mut current.body, fragment_len as u32);
            current.body.extend_from_slice(&remaining[..fragment_len]);
            remaining = &remaining[fragment_len..];
            current.y = true;
            packets.push(std::mem::replace(
                &mut current,
                PacketInProgress {
                    body: BytesMut::new(),
                    z: true,
                    y: false,
                },
            ));
            first_fragment = false;
        }
    }
    if !current.body.is_empty() {
        packets.push(current);
    }

    for (i, packet) in packets.into_iter().enumerate() {
        let mut header = 0u8;
        if packet.z {
            header |= AV1_Z_MASK;
        }
        if packet.y {
            header |= AV1_Y_MASK;
        }
        if new_sequence && i == 0 && !packet.z {
            header |= AV1_N_MASK;
        }
        let mut payload = BytesMut::with_capacity(AGGREGATION_HEADER_LEN + packet.body.len());
        payload.put_u8(header);
        payload.extend_from_slice(&packet.body);
        out.push(payload.freeze());
    }
}

/// Largest fragment length whose length prefix still fits in `space`.
fn fit_fragment(space: usize, remaining: usize) -> usize {
    let mut fragment = remaining.min(space.saturating_sub(1));
    while fragment > 0 && leb128_size(fragment as u32) + fragment > space {
        fragment -= 1;
    }
    fragment.max(1)
}

fn leb128_size(mut value: u32) -> usize {
    let mut size = 1;
    while value >= 0x80 {
        value >>= 7;
        size += 1;
    }
    size
}

fn write_leb128(buf: &mut BytesMut, mut value: u32) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

fn read_leb128(buf: &[u8]) -> (u32, usize) {
    let mut value: u32 = 0;
    for (i, &byte) in buf.iter().enumerate().take(5) {
        value |= ((byte & 0x7f) as u32) << (i * 7);
        if byte & 0x80 == 0 {
            return (value, i + 1);
        }
    }
    (0, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A frame OBU (type 6) without a size field.
    fn frame_obu(payload: &[u8]) -> Vec<u8> {
        let mut obu = vec![0x30];
        obu.extend_from_slice(payload);
        obu
    }

    #[test]
    fn test_single_obu_single_packet() {
        let sample = frame_obu(&[1, 2, 3]);
        let payloads = payloads(ObuPacketization::TemporalUnit, &sample, 1200).unwrap();
        assert_eq!(payloads.len(), 1);
        let p = &payloads[0];
        // W=0, no continuation flags
        assert_eq!(p[0] & (AV1_Z_MASK | AV1_Y_MASK), 0);
        // Length prefix covers header byte plus payload
        assert_eq!(p[1], 4);
        assert_eq!(p[2] & OBU_HAS_SIZE_BIT, 0);
        assert_eq!(&p[3..], &[1, 2, 3]);
    }

    #[test]
    fn test_temporal_delimiter_skipped() {
        // Temporal delimiter (type 2, has_size, size 0) then a frame
        let mut sample = vec![0x12, 0x00];
        sample.extend_from_slice(&frame_obu(&[7]));
        let payloads = payloads(ObuPacketization::TemporalUnit, &sample, 1200).unwrap();
        assert_eq!(payloads.len(), 1);
        assert_eq!(&payloads[0][3..], &[7]);
    }

    #[test]
    fn test_sequence_header_sets_n_flag() {
        // Sequence header (type 1, has_size) then frame
        let mut sample = vec![0x0a, 0x02, 0xAA, 0xBB];
        sample.extend_from_slice(&frame_obu(&[7]));
        let payloads = payloads(ObuPacketization::TemporalUnit, &sample, 1200).unwrap();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0][0] & AV1_N_MASK, AV1_N_MASK);
    }

    #[test]
    fn test_large_obu_fragments_with_continuation_flags() {
        let body: Vec<u8> = (0..200u32).map(|i| i as u8).collect();
        let sample = frame_obu(&body);
        let payloads = payloads(ObuPacketization::TemporalUnit, &sample, 64).unwrap();
        assert!(payloads.len() > 1);
        assert_eq!(payloads[0][0] & AV1_Z_MASK, 0);
        assert_eq!(payloads[0][0] & AV1_Y_MASK, AV1_Y_MASK);
        for p in &payloads[1..] {
            assert_eq!(p[0] & AV1_Z_MASK, AV1_Z_MASK);
        }
        assert_eq!(payloads.last().unwrap()[0] & AV1_Y_MASK, 0);

        // Every packet stays within budget
        for p in &payloads {
            assert!(p.len() <= 64);
        }

        // Reassembling the fragments yields the original element
        let mut recovered = Vec::new();
        for p in &payloads {
            let (len, consumed) = read_leb128(&p[1..]);
            recovered.extend_from_slice(&p[1 + consumed..1 + consumed + len as usize]);
        }
        assert_eq!(recovered[0], 0x30 & !OBU_HAS_SIZE_BIT);
        assert_eq!(&recovered[1..], &body[..]);
    }

    #[test]
    fn test_obu_mode_one_packet_per_obu() {
        // Two sized frame OBUs
        let mut sample = Vec::new();
        sample.extend_from_slice(&[0x32, 0x02, 1, 2]);
        sample.extend_from_slice(&[0x32, 0x01, 3]);
        let per_obu = payloads(ObuPacketization::Obu, &sample, 1200).unwrap();
        assert_eq!(per_obu.len(), 2);
        let aggregated = payloads(ObuPacketization::TemporalUnit, &sample, 1200).unwrap();
        assert_eq!(aggregated.len(), 1);
    }

    #[test]
    fn test_truncated_obu_rejected() {
        // has_size announces 9 bytes, only 1 present
        let sample = [0x32u8, 0x09, 0x01];
        assert_eq!(
            payloads(ObuPacketization::TemporalUnit, &sample, 1200),
            Err(Error::ErrInvalidSampleFraming)
        );
    }
}
