use tokio_util::bytes::{Buf, BufMut as _, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

pub const MAX_SAFE_READ_COUNT: u16 = 123;
pub const MAX_WRITE_COUNT: u16 = 123;

const READ_HOLDINGS: u8 = 0x03;
const WRITE_HOLDINGS: u8 = 0x10;
const EXCEPTION_FLAG: u8 = 0x80;

#[derive(Debug, Clone)]
pub struct Request {
    pub unit_id: u8,
    pub transaction_id: u16,
    pub operation: Operation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    GetHoldings { address: u16, count: u16 },
    SetHoldings { address: u16, values: Vec<u16> },
}

#[derive(Debug, PartialEq, Eq)]
pub struct Response {
    pub unit_id: u8,
    pub transaction_id: u16,
    pub kind: ResponseKind,
}

impl Response {
    pub fn exception_code(&self) -> Option<u8> {
        match &self.kind {
            ResponseKind::ErrorCode(c) => Some(*c),
            _ => None,
        }
    }

    pub fn is_server_busy(&self) -> bool {
        self.exception_code() == Some(6)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ResponseKind {
    ErrorCode(u8),
    GetHoldings { values: Vec<u16> },
    SetHoldings { address: u16, count: u16 },
    /// A frame that could be delimited, but whose PDU makes no sense for the requests we send.
    Malformed { function_code: u8 },
}

/// Modbus TCP framing: the MBAP header followed by the unit id and the PDU.
pub struct ModbusTCPCodec {}

impl Encoder<&Request> for ModbusTCPCodec {
    type Error = std::io::Error;
    fn encode(&mut self, req: &Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let pdu_length = match &req.operation {
            Operation::GetHoldings { .. } => 5,
            Operation::SetHoldings { values, .. } if values.len() > usize::from(MAX_WRITE_COUNT) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "too many registers for a single write",
                ));
            }
            Operation::SetHoldings { values, .. } => 6 + 2 * values.len(),
        };
        // The length field counts the unit id as well.
        let length = u16::try_from(pdu_length + 1).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "request does not fit a frame")
        })?;
        dst.reserve(6 + usize::from(length));
        dst.put_u16(req.transaction_id);
        dst.put_u16(0);
        dst.put_u16(length);
        dst.put_u8(req.unit_id);
        match &req.operation {
            Operation::GetHoldings { address, count } => {
                dst.put_u8(READ_HOLDINGS);
                dst.put_u16(*address);
                dst.put_u16(*count);
            }
            Operation::SetHoldings { address, values } => {
                dst.put_u8(WRITE_HOLDINGS);
                dst.put_u16(*address);
                dst.put_u16(values.len() as u16);
                dst.put_u8((2 * values.len()) as u8);
                for value in values {
                    dst.put_u16(*value);
                }
            }
        }
        trace!(message="sending encoded", buffer=?dst);
        Ok(())
    }
}

impl Decoder for ModbusTCPCodec {
    type Item = Response;
    type Error = std::io::Error;
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            trace!(message="attempt at decoding", buffer=?src);
            let Some((header, remainder)) = src.split_first_chunk::<7>() else {
                return Ok(None);
            };
            let transaction_id = u16::from_be_bytes([header[0], header[1]]);
            let proto = u16::from_be_bytes([header[2], header[3]]);
            let length = u16::from_be_bytes([header[4], header[5]]);
            let unit_id = header[6];
            if proto != 0 || length < 2 {
                // Not at a frame boundary, skip ahead until something looks like a header.
                src.advance(1);
                continue;
            }
            let Some((pdu, _)) = remainder.split_at_checked(usize::from(length) - 1) else {
                return Ok(None);
            };
            let kind = match pdu {
                &[function_code, code] if function_code & EXCEPTION_FLAG != 0 => {
                    ResponseKind::ErrorCode(code)
                }
                [READ_HOLDINGS, _, data @ ..] if data.len() % 2 == 0 => ResponseKind::GetHoldings {
                    values: data.chunks_exact(2).map(|c| u16::from_be_bytes([c[0], c[1]])).collect(),
                },
                &[WRITE_HOLDINGS, a0, a1, c0, c1] => ResponseKind::SetHoldings {
                    address: u16::from_be_bytes([a0, a1]),
                    count: u16::from_be_bytes([c0, c1]),
                },
                _ => ResponseKind::Malformed { function_code: pdu[0] },
            };
            src.advance(6 + usize::from(length));
            return Ok(Some(Response { unit_id, transaction_id, kind }));
        }
    }
}
