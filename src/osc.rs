//! Open Sound Control decoding for the headset stream.
//!
//! The headset bridge sends one OSC message per datagram, occasionally wrapped
//! in a bundle. Decoding is closed: every recognised address maps to one
//! [`Reading`] variant and everything else decodes to `None`.

use crate::error::DecodeError;
use crate::types::{Band, Reading, BAND_CHANNELS};

pub const ALPHA_ADDR: &str = "/muse/elements/alpha_absolute";
pub const BETA_ADDR: &str = "/muse/elements/beta_absolute";
pub const GAMMA_ADDR: &str = "/muse/elements/gamma_absolute";
pub const DELTA_ADDR: &str = "/muse/elements/delta_absolute";
pub const THETA_ADDR: &str = "/muse/elements/theta_absolute";
pub const BLINK_ADDR: &str = "/muse/elements/blink";
pub const ACC_ADDR: &str = "/muse/acc";

const BUNDLE_TAG: &[u8] = b"#bundle\0";

/// A single OSC argument.
#[derive(Debug, Clone, PartialEq)]
pub enum OscArg {
    Float(f32),
    Int(i32),
    Double(f64),
    Long(i64),
    Str(String),
    True,
    False,
    Nil,
}

impl OscArg {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            OscArg::Float(v) => Some(f64::from(*v)),
            OscArg::Int(v) => Some(f64::from(*v)),
            OscArg::Double(v) => Some(*v),
            OscArg::Long(v) => Some(*v as f64),
            _ => None,
        }
    }

    fn tag(&self) -> char {
        match self {
            OscArg::Float(_) => 'f',
            OscArg::Int(_) => 'i',
            OscArg::Double(_) => 'd',
            OscArg::Long(_) => 'h',
            OscArg::Str(_) => 's',
            OscArg::True => 'T',
            OscArg::False => 'F',
            OscArg::Nil => 'N',
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OscMessage {
    pub address: String,
    pub args: Vec<OscArg>,
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::Truncated(self.pos));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Null-terminated string padded to a multiple of four bytes.
    fn padded_str(&mut self) -> Result<String, DecodeError> {
        let start = self.pos;
        let rest = &self.buf[start..];
        let nul = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or(DecodeError::InvalidString(start))?;
        let text = std::str::from_utf8(&rest[..nul]).map_err(|_| DecodeError::InvalidString(start))?;
        let padded = (nul + 4) & !3;
        self.take(padded.min(rest.len()))?;
        Ok(text.to_string())
    }
}

/// Decode a datagram; bundles yield their first element.
pub fn decode_packet(buf: &[u8]) -> Result<OscMessage, DecodeError> {
    if buf.starts_with(BUNDLE_TAG) {
        let mut cursor = Cursor::new(buf);
        cursor.take(BUNDLE_TAG.len())?;
        cursor.take(8)?; // time tag
        if cursor.remaining() == 0 {
            return Err(DecodeError::EmptyBundle);
        }
        let offset = cursor.pos;
        let size = u32::from_be_bytes(cursor.array()?) as usize;
        if size > cursor.remaining() {
            return Err(DecodeError::BadElementSize { size, offset });
        }
        return decode_packet(cursor.take(size)?);
    }
    decode_message(buf)
}

pub fn decode_message(buf: &[u8]) -> Result<OscMessage, DecodeError> {
    let mut cursor = Cursor::new(buf);
    let address = cursor.padded_str()?;

    // Older senders omit the type tag string entirely.
    if cursor.remaining() == 0 {
        return Ok(OscMessage { address, args: Vec::new() });
    }

    let tags = cursor.padded_str()?;
    if !tags.starts_with(',') {
        return Err(DecodeError::MissingTypeTag(tags));
    }

    let mut args = Vec::with_capacity(tags.len() - 1);
    for tag in tags[1..].chars() {
        let arg = match tag {
            'f' => OscArg::Float(f32::from_be_bytes(cursor.array()?)),
            'i' => OscArg::Int(i32::from_be_bytes(cursor.array()?)),
            'd' => OscArg::Double(f64::from_be_bytes(cursor.array()?)),
            'h' => OscArg::Long(i64::from_be_bytes(cursor.array()?)),
            's' => OscArg::Str(cursor.padded_str()?),
            'T' => OscArg::True,
            'F' => OscArg::False,
            'N' => OscArg::Nil,
            other => return Err(DecodeError::UnsupportedType(other)),
        };
        args.push(arg);
    }

    Ok(OscMessage { address, args })
}

/// Map a decoded message onto a reading. Unknown addresses give `Ok(None)`.
pub fn reading_from_message(msg: &OscMessage) -> Result<Option<Reading>, DecodeError> {
    let band = match msg.address.as_str() {
        ALPHA_ADDR => Band::Alpha,
        BETA_ADDR => Band::Beta,
        GAMMA_ADDR => Band::Gamma,
        DELTA_ADDR => Band::Delta,
        THETA_ADDR => Band::Theta,
        BLINK_ADDR => return Ok(Some(Reading::Blink)),
        ACC_ADDR => return Ok(Some(Reading::Accelerometer)),
        _ => return Ok(None),
    };

    let numbers: Vec<f64> = msg.args.iter().filter_map(OscArg::as_f64).collect();
    if numbers.len() < BAND_CHANNELS {
        return Err(DecodeError::MissingArguments {
            address: msg.address.clone(),
            expected: BAND_CHANNELS,
            got: numbers.len(),
        });
    }

    let mut channels = [0.0; BAND_CHANNELS];
    channels.copy_from_slice(&numbers[..BAND_CHANNELS]);
    Ok(Some(Reading::Band { band, channels }))
}

/// Decode a datagram straight into a reading.
pub fn decode_reading(buf: &[u8]) -> Result<Option<Reading>, DecodeError> {
    reading_from_message(&decode_packet(buf)?)
}

fn push_padded_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(s.as_bytes());
    let pad = 4 - (s.len() % 4);
    out.extend(std::iter::repeat(0u8).take(pad));
}

pub fn encode_message(address: &str, args: &[OscArg]) -> Vec<u8> {
    let mut out = Vec::new();
    push_padded_str(&mut out, address);

    let tags: String = std::iter::once(',').chain(args.iter().map(OscArg::tag)).collect();
    push_padded_str(&mut out, &tags);

    for arg in args {
        match arg {
            OscArg::Float(v) => out.extend_from_slice(&v.to_be_bytes()),
            OscArg::Int(v) => out.extend_from_slice(&v.to_be_bytes()),
            OscArg::Double(v) => out.extend_from_slice(&v.to_be_bytes()),
            OscArg::Long(v) => out.extend_from_slice(&v.to_be_bytes()),
            OscArg::Str(s) => push_padded_str(&mut out, s),
            OscArg::True | OscArg::False | OscArg::Nil => {}
        }
    }
    out
}

/// Wrap encoded packets in a bundle with an "immediately" time tag.
pub fn encode_bundle(elements: &[Vec<u8>]) -> Vec<u8> {
    let mut out = BUNDLE_TAG.to_vec();
    out.extend_from_slice(&1u64.to_be_bytes());
    for element in elements {
        out.extend_from_slice(&(element.len() as u32).to_be_bytes());
        out.extend_from_slice(element);
    }
    out
}

/// Encode a band-power message the way the headset bridge does.
pub fn encode_band(band: Band, channels: [f32; BAND_CHANNELS]) -> Vec<u8> {
    let address = match band {
        Band::Alpha => ALPHA_ADDR,
        Band::Beta => BETA_ADDR,
        Band::Gamma => GAMMA_ADDR,
        Band::Delta => DELTA_ADDR,
        Band::Theta => THETA_ADDR,
    };
    let args: Vec<OscArg> = channels.iter().copied().map(OscArg::Float).collect();
    encode_message(address, &args)
}
