//! H.264 NAL unit reformatting
//!
//! Converts between Annex B (start code) and AVCC (length-prefixed) layouts.
//! Raw encoders and transport streams produce Annex B; hardware decoders want
//! a length-prefixed stream plus an avcC configuration record built from the
//! SPS/PPS. The software decoder wants the opposite direction.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BitstreamError {
    #[error("No SPS NAL unit found in parameter sets")]
    MissingSps,
    #[error("Truncated NAL unit at offset {0}")]
    Truncated(usize),
    #[error("NAL unit of {0} bytes does not fit its length field")]
    NalTooLarge(usize),
}

/// Annex B start code (4-byte version)
const ANNEX_B_START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// NAL unit types carried in the configuration record
pub const NAL_TYPE_SPS: u8 = 7;
pub const NAL_TYPE_PPS: u8 = 8;

/// Length field size we emit for length-prefixed streams
pub const NAL_LENGTH_SIZE: usize = 4;

/// Shorter extradata is handed through as is
pub const MIN_CONFIG_LEN: usize = 7;

/// Type tag of a NAL unit (low five bits of the header byte)
pub fn nal_type(nal: &[u8]) -> Option<u8> {
    nal.first().map(|b| b & 0x1f)
}

// ============================================================================
// Start code scanning
// ============================================================================

#[inline]
fn is_start_code3(buf: &[u8], p: usize) -> bool {
    buf[p] == 0 && buf[p + 1] == 0 && buf[p + 2] == 1
}

/// Position of the next `00 00 01` at or after `from`, or `buf.len()`.
///
/// Scalar scan up to a 4-byte boundary, then one word at a time using the
/// "word has a zero byte" test, then scalar again for the last bytes.
fn find_start_code_internal(buf: &[u8], from: usize) -> usize {
    let len = buf.len();
    let mut p = from;

    let misalign = (buf.as_ptr() as usize).wrapping_add(p) & 3;
    let aligned = p + ((4 - misalign) & 3);
    while p < aligned && p + 3 <= len {
        if is_start_code3(buf, p) {
            return p;
        }
        p += 1;
    }

    // Each step inspects bytes p..p+6
    while p + 6 <= len {
        let x = u32::from_ne_bytes([buf[p], buf[p + 1], buf[p + 2], buf[p + 3]]);
        if x.wrapping_sub(0x0101_0101) & !x & 0x8080_8080 != 0 {
            if buf[p + 1] == 0 {
                if buf[p] == 0 && buf[p + 2] == 1 {
                    return p;
                }
                if buf[p + 2] == 0 && buf[p + 3] == 1 {
                    return p + 1;
                }
            }
            if buf[p + 3] == 0 {
                if buf[p + 2] == 0 && buf[p + 4] == 1 {
                    return p + 2;
                }
                if buf[p + 4] == 0 && buf[p + 5] == 1 {
                    return p + 3;
                }
            }
        }
        p += 4;
    }

    while p + 3 <= len {
        if is_start_code3(buf, p) {
            return p;
        }
        p += 1;
    }

    len
}

/// Position of the next start code at or after `from`, or `buf.len()`.
/// A 3-byte code preceded by a zero byte is reported at that zero.
pub fn find_start_code(buf: &[u8], from: usize) -> usize {
    let out = find_start_code_internal(buf, from);
    if from < out && out < buf.len() && buf[out - 1] == 0 {
        out - 1
    } else {
        out
    }
}

/// Check if data already has Annex B start codes
pub fn is_annexb(data: &[u8]) -> bool {
    data.starts_with(&ANNEX_B_START_CODE) || data.starts_with(&[0x00, 0x00, 0x01])
}

// ============================================================================
// Annex B -> length-prefixed
// ============================================================================

/// Split an Annex B stream on start codes and re-emit every NAL unit as a
/// 4-byte big-endian length followed by the NAL bytes.
pub fn annexb_to_length_prefixed(data: &[u8]) -> Result<Vec<u8>, BitstreamError> {
    let len = data.len();
    let mut out = Vec::with_capacity(len + 16);

    let mut nal_start = find_start_code(data, 0);
    while nal_start < len {
        // Skip the zeros and the 0x01 of the start code
        while nal_start < len && data[nal_start] == 0 {
            nal_start += 1;
        }
        nal_start += 1;
        if nal_start >= len {
            break;
        }

        let nal_end = find_start_code(data, nal_start);
        let nal = &data[nal_start..nal_end];
        let size = u32::try_from(nal.len()).map_err(|_| BitstreamError::NalTooLarge(nal.len()))?;
        out.extend_from_slice(&size.to_be_bytes());
        out.extend_from_slice(nal);
        nal_start = nal_end;
    }

    Ok(out)
}

/// Iterate the NAL units of a 4-byte length-prefixed stream
fn length_prefixed_units(data: &[u8]) -> Result<Vec<&[u8]>, BitstreamError> {
    let mut units = Vec::new();
    let mut offset = 0;
    while offset + NAL_LENGTH_SIZE <= data.len() {
        let size = read_be_uint(&data[offset..], NAL_LENGTH_SIZE);
        let body = offset + NAL_LENGTH_SIZE;
        if body + size > data.len() {
            return Err(BitstreamError::Truncated(offset));
        }
        if size > 0 {
            units.push(&data[body..body + size]);
        }
        offset = body + size;
    }
    Ok(units)
}

// ============================================================================
// avcC configuration record
// ============================================================================

/// Build an avcC configuration record from Annex B parameter sets.
///
/// ```text
///  8   version ( always 0x01 )
///  8   avc profile ( sps[0][1] )
///  8   avc compatibility ( sps[0][2] )
///  8   avc level ( sps[0][3] )
///  6   reserved ( all bits on )
///  2   NALULengthSizeMinusOne
///  3   reserved ( all bits on )
///  5   number of SPS NALUs
///      repeated per SPS: 16 size, SPS NALU data
///  8   number of PPS NALUs
///      repeated per PPS: 16 size, PPS NALU data
/// ```
///
/// Input that does not start with a start code, or is shorter than
/// [`MIN_CONFIG_LEN`], is returned unchanged.
pub fn build_avcc_record(data: &[u8]) -> Result<Vec<u8>, BitstreamError> {
    if data.len() < MIN_CONFIG_LEN || !is_annexb(data) {
        return Ok(data.to_vec());
    }

    let prefixed = annexb_to_length_prefixed(data)?;
    let units = length_prefixed_units(&prefixed)?;

    let sps: Vec<&[u8]> = units
        .iter()
        .copied()
        .filter(|nal| nal_type(nal) == Some(NAL_TYPE_SPS))
        .collect();
    let pps: Vec<&[u8]> = units
        .iter()
        .copied()
        .filter(|nal| nal_type(nal) == Some(NAL_TYPE_PPS))
        .collect();

    let first = sps.first().ok_or(BitstreamError::MissingSps)?;
    if first.len() < 4 {
        return Err(BitstreamError::Truncated(0));
    }
    let num_sps = sps.len().min(31);
    let num_pps = pps.len().min(255);

    let mut record = Vec::with_capacity(7 + units.iter().map(|u| u.len() + 2).sum::<usize>());
    record.push(1); // version
    record.push(first[1]); // profile
    record.push(first[2]); // profile compat
    record.push(first[3]); // level
    record.push(0xfc | (NAL_LENGTH_SIZE as u8 - 1));
    record.push(0xe0 | num_sps as u8);
    for nal in &sps[..num_sps] {
        push_u16_prefixed(&mut record, nal)?;
    }
    record.push(num_pps as u8);
    for nal in &pps[..num_pps] {
        push_u16_prefixed(&mut record, nal)?;
    }

    Ok(record)
}

fn push_u16_prefixed(out: &mut Vec<u8>, nal: &[u8]) -> Result<(), BitstreamError> {
    let size = u16::try_from(nal.len()).map_err(|_| BitstreamError::NalTooLarge(nal.len()))?;
    out.extend_from_slice(&size.to_be_bytes());
    out.extend_from_slice(nal);
    Ok(())
}

/// Outcome of [`convert_extradata`]
#[derive(Debug, PartialEq, Eq)]
pub enum Reformatted<'a> {
    /// Annex B input rewritten as an avcC record
    Converted(Vec<u8>),
    /// Input was already length-prefixed
    Passthrough(&'a [u8]),
}

impl Reformatted<'_> {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Converted(v) => v,
            Self::Passthrough(s) => s,
        }
    }
}

/// Produce the configuration record a hardware decoder is opened with
pub fn convert_extradata(data: &[u8]) -> Result<Reformatted<'_>, BitstreamError> {
    if data.len() >= MIN_CONFIG_LEN && is_annexb(data) {
        build_avcc_record(data).map(Reformatted::Converted)
    } else {
        Ok(Reformatted::Passthrough(data))
    }
}

// ============================================================================
// Length-prefixed -> Annex B (software decoder input)
// ============================================================================

/// Convert AVCC format NAL units to Annex B format
///
/// AVCC: [4-byte length][NAL][4-byte length][NAL]...
/// Annex B: [0x00 0x00 0x00 0x01][NAL][0x00 0x00 0x00 0x01][NAL]...
pub fn avcc_to_annexb(data: &[u8], nal_length_size: usize) -> Vec<u8> {
    if data.is_empty() || nal_length_size == 0 || nal_length_size > 4 {
        return data.to_vec();
    }

    let mut result = Vec::with_capacity(data.len() + 64);
    let mut offset = 0;

    while offset + nal_length_size <= data.len() {
        let nal_len = read_be_uint(&data[offset..], nal_length_size);
        offset += nal_length_size;

        if nal_len == 0 || offset + nal_len > data.len() {
            break;
        }

        result.extend_from_slice(&ANNEX_B_START_CODE);
        result.extend_from_slice(&data[offset..offset + nal_len]);
        offset += nal_len;
    }

    result
}

/// Parse avcC extradata and extract SPS/PPS as Annex B
///
/// Returns the parameter sets with start codes plus the NAL length size
pub fn parse_avcc_extradata(extradata: &[u8]) -> Option<(Vec<u8>, usize)> {
    if extradata.len() < 7 || extradata[0] != 1 {
        return None;
    }

    let nal_length_size = ((extradata[4] & 0x03) + 1) as usize;
    let num_sps = (extradata[5] & 0x1F) as usize;

    let mut result = Vec::with_capacity(extradata.len() + 32);
    let mut offset = 6;

    for _ in 0..num_sps {
        if offset + 2 > extradata.len() {
            return None;
        }
        let sps_len = u16::from_be_bytes([extradata[offset], extradata[offset + 1]]) as usize;
        offset += 2;

        if offset + sps_len > extradata.len() {
            return None;
        }

        result.extend_from_slice(&ANNEX_B_START_CODE);
        result.extend_from_slice(&extradata[offset..offset + sps_len]);
        offset += sps_len;
    }

    if offset >= extradata.len() {
        return Some((result, nal_length_size));
    }

    let num_pps = extradata[offset] as usize;
    offset += 1;

    for _ in 0..num_pps {
        if offset + 2 > extradata.len() {
            break;
        }
        let pps_len = u16::from_be_bytes([extradata[offset], extradata[offset + 1]]) as usize;
        offset += 2;

        if offset + pps_len > extradata.len() {
            break;
        }

        result.extend_from_slice(&ANNEX_B_START_CODE);
        result.extend_from_slice(&extradata[offset..offset + pps_len]);
        offset += pps_len;
    }

    Some((result, nal_length_size))
}

/// Read big-endian unsigned integer of variable size (1-4 bytes)
fn read_be_uint(data: &[u8], size: usize) -> usize {
    data[..size]
        .iter()
        .fold(0usize, |val, b| (val << 8) | *b as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPS: [u8; 8] = [0x67, 0x64, 0x00, 0x1f, 0xac, 0xd9, 0x40, 0x50];
    const PPS: [u8; 4] = [0x68, 0xeb, 0xe3, 0xcb];

    fn annexb(units: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for u in units {
            out.extend_from_slice(&ANNEX_B_START_CODE);
            out.extend_from_slice(u);
        }
        out
    }

    /// Reference scan, one byte at a time
    fn naive_find(buf: &[u8], from: usize) -> usize {
        let mut p = from;
        while p + 3 <= buf.len() {
            if buf[p] == 0 && buf[p + 1] == 0 && buf[p + 2] == 1 {
                return if p > from && buf[p - 1] == 0 { p - 1 } else { p };
            }
            p += 1;
        }
        buf.len()
    }

    #[test]
    fn test_find_start_code_matches_scalar_scan() {
        // Start codes at every offset relative to word alignment
        for lead in 0..9 {
            for trail in 0..9 {
                let mut buf = vec![0xaa; lead];
                buf.extend_from_slice(&[0, 0, 1, 0x65]);
                buf.extend(std::iter::repeat(0x11).take(trail));
                buf.extend_from_slice(&[0, 0, 0, 1, 0x41]);
                for from in 0..buf.len() {
                    assert_eq!(
                        find_start_code(&buf, from),
                        naive_find(&buf, from),
                        "lead={} trail={} from={}",
                        lead,
                        trail,
                        from
                    );
                }
            }
        }
    }

    #[test]
    fn test_find_start_code_none() {
        assert_eq!(find_start_code(&[1, 2, 3, 4, 5, 6, 7, 8, 9], 0), 9);
        assert_eq!(find_start_code(&[0, 0], 0), 2);
        assert_eq!(find_start_code(&[], 0), 0);
    }

    #[test]
    fn test_annexb_to_length_prefixed() {
        let mut input = annexb(&[&SPS]);
        input.extend_from_slice(&[0x00, 0x00, 0x01]);
        input.extend_from_slice(&PPS);

        let out = annexb_to_length_prefixed(&input).unwrap();
        let mut expected = vec![0, 0, 0, SPS.len() as u8];
        expected.extend_from_slice(&SPS);
        expected.extend_from_slice(&[0, 0, 0, PPS.len() as u8]);
        expected.extend_from_slice(&PPS);
        assert_eq!(out, expected);
    }

    #[test]
    fn test_avcc_record_embeds_parameter_sets() {
        let record = build_avcc_record(&annexb(&[&SPS, &PPS])).unwrap();

        assert_eq!(record[0], 1);
        assert_eq!(&record[1..4], &SPS[1..4]);
        assert_eq!(record[4], 0xff);
        assert_eq!(record[5], 0xe1);
        let sps_len = u16::from_be_bytes([record[6], record[7]]) as usize;
        assert_eq!(&record[8..8 + sps_len], &SPS);

        let pps_at = 8 + sps_len;
        assert_eq!(record[pps_at], 1);
        let pps_len = u16::from_be_bytes([record[pps_at + 1], record[pps_at + 2]]) as usize;
        assert_eq!(&record[pps_at + 3..pps_at + 3 + pps_len], &PPS);
        assert_eq!(record.len(), pps_at + 3 + pps_len);
    }

    #[test]
    fn test_avcc_record_requires_sps() {
        let err = build_avcc_record(&annexb(&[&PPS, &[0x65, 0x88, 0x84, 0x00]])).unwrap_err();
        assert_eq!(err, BitstreamError::MissingSps);
    }

    #[test]
    fn test_short_input_passes_through() {
        let short = [0, 0, 0, 1, 0x67, 0x42];
        assert_eq!(build_avcc_record(&short).unwrap(), short.to_vec());
        assert_eq!(convert_extradata(&short).unwrap(), Reformatted::Passthrough(&short[..]));
        assert_eq!(build_avcc_record(&[]).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_length_prefixed_passthrough() {
        let mut avcc = vec![0, 0, 0, SPS.len() as u8];
        avcc.extend_from_slice(&SPS);

        assert_eq!(convert_extradata(&avcc).unwrap(), Reformatted::Passthrough(&avcc[..]));
        assert_eq!(build_avcc_record(&avcc).unwrap(), avcc);
    }

    #[test]
    fn test_record_round_trips_through_parser() {
        let record = build_avcc_record(&annexb(&[&SPS, &PPS])).unwrap();
        let (annexb_sets, nal_length_size) = parse_avcc_extradata(&record).unwrap();
        assert_eq!(nal_length_size, 4);
        assert_eq!(annexb_sets, annexb(&[&SPS, &PPS]));
    }

    #[test]
    fn test_avcc_to_annexb() {
        let avcc = vec![0x00, 0x00, 0x00, 0x05, 0x67, 0x42, 0x00, 0x1e, 0x9a];
        let annexb = avcc_to_annexb(&avcc, 4);

        assert_eq!(&annexb[0..4], &[0x00, 0x00, 0x00, 0x01]);
        assert_eq!(&annexb[4..], &[0x67, 0x42, 0x00, 0x1e, 0x9a]);
    }

    #[test]
    fn test_is_annexb() {
        assert!(is_annexb(&[0x00, 0x00, 0x00, 0x01, 0x67]));
        assert!(is_annexb(&[0x00, 0x00, 0x01, 0x67]));
        assert!(!is_annexb(&[0x00, 0x00, 0x00, 0x05, 0x67])); // AVCC
    }
}
