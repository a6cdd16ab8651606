//! Zero-run compression for sparse payloads.
//!
//! The stream is a sequence of segments, each
//! `varint(literal_len) ++ literal bytes ++ varint(zero_run_len)`.
//! Zero runs shorter than [`MIN_ZERO_RUN`] stay inside literals.

use cow_types::{ParseError, read_varint, write_varint};

/// Shortest zero run worth a segment break.
pub const MIN_ZERO_RUN: usize = 8;

fn zeros_at(data: &[u8], start: usize) -> usize {
    data[start..].iter().take_while(|b| **b == 0).count()
}

#[must_use]
pub fn compress_zero_runs(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < input.len() {
        let literal_start = pos;
        let mut scan = pos;
        let mut run = 0;
        while scan < input.len() {
            if input[scan] == 0 {
                run = zeros_at(input, scan);
                if run >= MIN_ZERO_RUN {
                    break;
                }
                scan += run;
                run = 0;
            } else {
                scan += 1;
            }
        }
        write_varint(&mut out, (scan - literal_start) as u64);
        out.extend_from_slice(&input[literal_start..scan]);
        write_varint(&mut out, run as u64);
        pos = scan + run;
    }
    out
}

/// Expand `data` into exactly `logical_len` bytes.
pub fn decompress_zero_runs(data: &[u8], logical_len: usize) -> Result<Vec<u8>, ParseError> {
    // `logical_len` comes from a descriptor; grow with the stream instead.
    let mut out = Vec::with_capacity(data.len().min(logical_len));
    let mut pos = 0;
    while pos < data.len() {
        let (literal, used) = read_varint(data, pos)?;
        pos += used;
        let literal = usize::try_from(literal)
            .map_err(|_| ParseError::IntegerConversion { field: "literal_len" })?;
        let bytes = cow_types::ensure_slice(data, pos, literal)?;
        if out.len() + literal > logical_len {
            return Err(ParseError::InvalidField {
                field: "zero_run_stream",
                reason: "expands past logical size",
            });
        }
        out.extend_from_slice(bytes);
        pos += literal;

        let (zeros, used) = read_varint(data, pos)?;
        pos += used;
        let zeros = usize::try_from(zeros)
            .ok()
            .filter(|z| out.len() + z <= logical_len)
            .ok_or(ParseError::InvalidField {
                field: "zero_run_stream",
                reason: "expands past logical size",
            })?;
        out.resize(out.len() + zeros, 0);
    }
    if out.len() != logical_len {
        return Err(ParseError::InvalidField {
            field: "zero_run_stream",
            reason: "shorter than logical size",
        });
    }
    Ok(out)
}
