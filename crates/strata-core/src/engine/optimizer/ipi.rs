//! The i-PI socket protocol, seen from the force-provider side.
//!
//! i-PI acts as the server. It drives the conversation with 12-byte, space-padded ASCII
//! headers; numbers follow as little-endian `i32` and `f64`. The companion in this module
//! answers those messages from the handoff cells of an [`OptimizerEndpoint`].

use super::{ForceData, InboundPayload, OptimizerEndpoint, OptimizerStatus, PositionData};
use crate::engine::error::EngineError;
use crate::engine::handoff::CellClosed;
use nalgebra::{DVector, Matrix3};
use std::io::{self, Read, Write};
use thiserror::Error;
use tracing::{debug, trace, warn};

pub const HEADER_LEN: usize = 12;

pub const STATUS: &str = "STATUS";
pub const READY: &str = "READY";
pub const HAVEDATA: &str = "HAVEDATA";
pub const NEEDINIT: &str = "NEEDINIT";
pub const INIT: &str = "INIT";
pub const POSDATA: &str = "POSDATA";
pub const GETFORCE: &str = "GETFORCE";
pub const FORCEREADY: &str = "FORCEREADY";
pub const EXIT: &str = "EXIT";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Socket I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Unexpected message '{0}'")]
    UnexpectedMessage(String),

    #[error("Invalid length {found} in {message} (expected {expected})")]
    InvalidLength {
        message: &'static str,
        expected: usize,
        found: i64,
    },

    #[error(transparent)]
    ChannelClosed(#[from] CellClosed),

    #[error("Driver answered with {0} where forces were expected")]
    UnexpectedPayload(&'static str),
}

pub fn write_header<W: Write>(stream: &mut W, header: &str) -> io::Result<()> {
    let mut buf = [b' '; HEADER_LEN];
    let bytes = header.as_bytes();
    let len = bytes.len().min(HEADER_LEN);
    buf[..len].copy_from_slice(&bytes[..len]);
    stream.write_all(&buf)
}

pub fn read_header<R: Read>(stream: &mut R) -> io::Result<String> {
    let mut buf = [0u8; HEADER_LEN];
    stream.read_exact(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).trim_end().to_string())
}

pub fn write_i32<W: Write>(stream: &mut W, value: i32) -> io::Result<()> {
    stream.write_all(&value.to_le_bytes())
}

pub fn read_i32<R: Read>(stream: &mut R) -> io::Result<i32> {
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

pub fn write_f64s<W: Write>(stream: &mut W, values: &[f64]) -> io::Result<()> {
    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    stream.write_all(&bytes)
}

pub fn read_f64s<R: Read>(stream: &mut R, count: usize) -> io::Result<Vec<f64>> {
    let mut buf = vec![0u8; 8 * count];
    stream.read_exact(&mut buf)?;
    Ok(buf
        .chunks_exact(8)
        .map(|chunk| {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            f64::from_le_bytes(word)
        })
        .collect())
}

fn read_count<R: Read>(
    stream: &mut R,
    message: &'static str,
    expected: usize,
) -> Result<usize, ProtocolError> {
    let found = read_i32(stream)?;
    if usize::try_from(found).ok() != Some(expected) {
        return Err(ProtocolError::InvalidLength {
            message,
            expected,
            found: found.into(),
        });
    }
    Ok(expected)
}

/// Serves one i-PI connection until the optimiser finishes.
///
/// Every `STATUS` poll first checks the endpoint's sentinel file; once it exists the
/// companion reports [`OptimizerStatus::Done`] and returns. `POSDATA` is forwarded to the
/// outbound cell together with a [`OptimizerStatus::WantForces`] request, and the companion
/// then blocks until the driver has pushed the forces, which are handed out on `GETFORCE`.
pub fn run_companion<S: Read + Write>(
    stream: &mut S,
    endpoint: &OptimizerEndpoint,
) -> Result<(), ProtocolError> {
    let atoms = endpoint.partition.order.len();
    let mut initialised = false;
    let mut pending: Option<ForceData> = None;

    loop {
        let header = read_header(stream)?;
        trace!(depth = endpoint.depth, header = %header, "i-PI message.");
        match header.as_str() {
            STATUS => {
                if endpoint.sentinel_present() {
                    debug!(depth = endpoint.depth, "Sentinel found; optimiser is done.");
                    endpoint.status.put(OptimizerStatus::Done)?;
                    return Ok(());
                }
                let reply = if !initialised {
                    NEEDINIT
                } else if pending.is_some() {
                    HAVEDATA
                } else {
                    READY
                };
                write_header(stream, reply)?;
            }
            INIT => {
                let _bead = read_i32(stream)?;
                let len = read_i32(stream)?;
                let len = usize::try_from(len).map_err(|_| ProtocolError::InvalidLength {
                    message: INIT,
                    expected: 0,
                    found: len.into(),
                })?;
                let mut init = vec![0u8; len];
                stream.read_exact(&mut init)?;
                initialised = true;
            }
            POSDATA => {
                let _cell = read_f64s(stream, 9)?;
                let _inverse_cell = read_f64s(stream, 9)?;
                let natoms = read_count(stream, POSDATA, atoms)?;
                let coordinates = DVector::from_vec(read_f64s(stream, 3 * natoms)?);

                endpoint.outbound.put(PositionData { coordinates })?;
                endpoint.status.put(OptimizerStatus::WantForces)?;
                pending = Some(match endpoint.inbound.take()? {
                    InboundPayload::Forces(forces) => forces,
                    InboundPayload::Hessian(data) => data.forces,
                    InboundPayload::Positions(_) => {
                        return Err(ProtocolError::UnexpectedPayload("positions"));
                    }
                });
            }
            GETFORCE => {
                let forces = pending
                    .take()
                    .ok_or_else(|| ProtocolError::UnexpectedMessage(header.clone()))?;
                write_forces(stream, &forces)?;
            }
            EXIT => {
                debug!(depth = endpoint.depth, "Optimiser sent EXIT.");
                endpoint.status.put(OptimizerStatus::Done)?;
                return Ok(());
            }
            _ => return Err(ProtocolError::UnexpectedMessage(header)),
        }
    }
}

fn write_forces<W: Write>(stream: &mut W, data: &ForceData) -> Result<(), ProtocolError> {
    let natoms = data.forces.len() / 3;
    let natoms = i32::try_from(natoms).map_err(|_| ProtocolError::InvalidLength {
        message: FORCEREADY,
        expected: natoms,
        found: -1,
    })?;
    write_header(stream, FORCEREADY)?;
    write_f64s(stream, &[data.energy])?;
    write_i32(stream, natoms)?;
    write_f64s(stream, data.forces.as_slice())?;
    write_f64s(stream, data.virial.transpose().as_slice())?;
    write_i32(stream, 0)?;
    stream.flush()?;
    Ok(())
}

/// Thread body of a companion.
///
/// Any protocol failure closes the status cell, so a driver waiting for the next request
/// fails instead of hanging.
pub fn companion_main<S: Read + Write>(
    mut stream: S,
    endpoint: &OptimizerEndpoint,
) -> Result<(), EngineError> {
    let result = run_companion(&mut stream, endpoint);
    if let Err(e) = &result {
        if endpoint.status.is_closed() {
            debug!(depth = endpoint.depth, "Companion stopped after teardown: {}", e);
        } else {
            warn!(depth = endpoint.depth, "i-PI companion failed: {}", e);
        }
        endpoint.status.close();
    }
    result.map_err(EngineError::from)
}

/// Reads a `FORCEREADY` reply as the i-PI server would.
pub fn read_forceready<R: Read>(stream: &mut R) -> Result<ForceData, ProtocolError> {
    let header = read_header(stream)?;
    if header != FORCEREADY {
        return Err(ProtocolError::UnexpectedMessage(header));
    }
    let energy = read_f64s(stream, 1)?[0];
    let natoms = read_i32(stream)?;
    let natoms = usize::try_from(natoms).map_err(|_| ProtocolError::InvalidLength {
        message: FORCEREADY,
        expected: 0,
        found: natoms.into(),
    })?;
    let forces = DVector::from_vec(read_f64s(stream, 3 * natoms)?);
    let virial = Matrix3::from_row_slice(&read_f64s(stream, 9)?);
    let extra = read_i32(stream)?;
    let mut skipped = vec![0u8; usize::try_from(extra).unwrap_or(0)];
    stream.read_exact(&mut skipped)?;
    Ok(ForceData {
        energy,
        forces,
        virial,
    })
}

/// Sends a `POSDATA` message with an identity cell, as the i-PI server would.
pub fn write_posdata<W: Write>(stream: &mut W, coordinates: &[f64]) -> io::Result<()> {
    let identity = Matrix3::<f64>::identity();
    write_header(stream, POSDATA)?;
    write_f64s(stream, identity.as_slice())?;
    write_f64s(stream, identity.as_slice())?;
    write_i32(stream, (coordinates.len() / 3) as i32)?;
    write_f64s(stream, coordinates)?;
    stream.flush()
}
