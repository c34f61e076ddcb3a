//! Encoding of wire frames.
//!
//! The data plane (per-vertex values, global IDs) travels as raw scalar
//! arrays in host byte order; the control plane (mesh partitions,
//! communication maps) travels as JSON envelopes. Every decoder validates
//! the frame shape and reports a [`TransportError::Malformed`] instead of
//! panicking, since a bad frame can originate in the remote participant.

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::TransportError;

pub fn encode_f64s(values: &[f64]) -> Vec<u8> {
    bytemuck::cast_slice(values).to_vec()
}

pub fn decode_f64s(frame: &[u8]) -> Result<Vec<f64>, TransportError> {
    if frame.len() % 8 != 0 {
        return Err(TransportError::Malformed(format!(
            "f64 array frame has {} bytes",
            frame.len()
        )));
    }
    Ok(bytemuck::pod_collect_to_vec(frame))
}

pub fn encode_u64s(values: &[u64]) -> Vec<u8> {
    bytemuck::cast_slice(values).to_vec()
}

pub fn decode_u64s(frame: &[u8]) -> Result<Vec<u64>, TransportError> {
    if frame.len() % 8 != 0 {
        return Err(TransportError::Malformed(format!(
            "u64 array frame has {} bytes",
            frame.len()
        )));
    }
    Ok(bytemuck::pod_collect_to_vec(frame))
}

pub fn encode_f64(value: f64) -> Vec<u8> {
    value.to_ne_bytes().to_vec()
}

pub fn decode_f64(frame: &[u8]) -> Result<f64, TransportError> {
    let bytes: [u8; 8] = frame
        .try_into()
        .map_err(|_| TransportError::Malformed(format!("f64 frame has {} bytes", frame.len())))?;
    Ok(f64::from_ne_bytes(bytes))
}

pub fn encode_u64(value: u64) -> Vec<u8> {
    value.to_ne_bytes().to_vec()
}

pub fn decode_u64(frame: &[u8]) -> Result<u64, TransportError> {
    let bytes: [u8; 8] = frame
        .try_into()
        .map_err(|_| TransportError::Malformed(format!("u64 frame has {} bytes", frame.len())))?;
    Ok(u64::from_ne_bytes(bytes))
}

pub fn encode_bool(value: bool) -> Vec<u8> {
    vec![u8::from(value)]
}

pub fn decode_bool(frame: &[u8]) -> Result<bool, TransportError> {
    match frame {
        [0] => Ok(false),
        [1] => Ok(true),
        _ => Err(TransportError::Malformed(format!(
            "bool frame has {} bytes",
            frame.len()
        ))),
    }
}

pub fn encode_json<T: Serialize>(value: &T) -> Result<Vec<u8>, TransportError> {
    serde_json::to_vec(value).map_err(|e| TransportError::Malformed(e.to_string()))
}

pub fn decode_json<T: DeserializeOwned>(frame: &[u8]) -> Result<T, TransportError> {
    serde_json::from_slice(frame).map_err(|e| TransportError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_round_trips() {
        assert_eq!(decode_f64(&encode_f64(1.5)).unwrap(), 1.5);
        assert_eq!(decode_u64(&encode_u64(42)).unwrap(), 42);
        assert!(decode_bool(&encode_bool(true)).unwrap());
        assert!(!decode_bool(&encode_bool(false)).unwrap());
    }

    #[test]
    fn test_array_round_trips() {
        let values = [1.0, -2.5, 3.25];
        assert_eq!(decode_f64s(&encode_f64s(&values)).unwrap(), values);
        let ids = [0_u64, 7, 123];
        assert_eq!(decode_u64s(&encode_u64s(&ids)).unwrap(), ids);
    }

    #[test]
    fn test_rejects_malformed_frames() {
        assert!(decode_f64(&[0; 7]).is_err());
        assert!(decode_f64s(&[0; 9]).is_err());
        assert!(decode_bool(&[2]).is_err());
        assert!(decode_bool(&[]).is_err());
    }
}
