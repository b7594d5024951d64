//! Wire messages. All fields are little-endian and every message has a
//! fixed on-the-wire size: handshake messages pad their address field to
//! the maximum, the vector message length is implied by its entry count.

use crate::fabric::{RemoteIov, Segment, ADDR_MAX};
use crate::support::{ErrorType, TransferError, TransferResult};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

pub const NONCE_LEN: usize = 16;
pub const VECTOR_IOVS_MAX: usize = 12;

const VECTOR_IOV_LEN: usize = 24;
const VECTOR_HDRLEN: usize = 8;

pub const INITIAL_MSGLEN: usize = NONCE_LEN + 4 + 4 + 4 + ADDR_MAX;
pub const ACK_MSGLEN: usize = 4 + ADDR_MAX;
pub const PROGRESS_MSGLEN: usize = 16;
pub const VECTOR_MSGLEN_MAX: usize = VECTOR_HDRLEN + VECTOR_IOVS_MAX * VECTOR_IOV_LEN;

/// First message of a session, putter to getter: a nonce, the number of
/// parallel sources, this source's id, and the putter's fabric address.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct InitialMsg {
    pub nonce: [u8; NONCE_LEN],
    pub nsources: u32,
    pub id: u32,
    pub addr: Vec<u8>,
}

impl InitialMsg {
    /// Serializes into `seg` and returns the wire length.
    pub fn encode(&self, seg: &Segment) -> usize {
        seg.with_mut(|mem| {
            let mut stream = Cursor::new(&mut mem[..INITIAL_MSGLEN]);

            stream.write_all(&self.nonce).unwrap();
            stream.write_u32::<LittleEndian>(self.nsources).unwrap();
            stream.write_u32::<LittleEndian>(self.id).unwrap();
            write_addr(&mut stream, &self.addr);
        });

        INITIAL_MSGLEN
    }

    pub fn decode(bytes: &[u8]) -> TransferResult<InitialMsg> {
        if bytes.len() != INITIAL_MSGLEN {
            return Err(TransferError::Fatal(ErrorType::InitialMismatch));
        }

        let mut stream = Cursor::new(bytes);
        let mut nonce = [0u8; NONCE_LEN];

        stream.read_exact(&mut nonce).unwrap();
        let nsources = stream.read_u32::<LittleEndian>().unwrap();
        let id = stream.read_u32::<LittleEndian>().unwrap();
        let addr = read_addr(&mut stream)?;

        Ok(InitialMsg {
            nonce,
            nsources,
            id,
            addr,
        })
    }
}

/// The getter's response: the address of the session's active endpoint.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AckMsg {
    pub addr: Vec<u8>,
}

impl AckMsg {
    pub fn encode(&self, seg: &Segment) -> usize {
        seg.with_mut(|mem| {
            let mut stream = Cursor::new(&mut mem[..ACK_MSGLEN]);
            write_addr(&mut stream, &self.addr);
        });

        ACK_MSGLEN
    }

    pub fn decode(bytes: &[u8]) -> TransferResult<AckMsg> {
        if bytes.len() != ACK_MSGLEN {
            return Err(TransferError::Fatal(ErrorType::UnexpectedCompletion));
        }

        let mut stream = Cursor::new(bytes);
        let addr = read_addr(&mut stream)?;

        Ok(AckMsg { addr })
    }
}

/// The transmitter's report of bytes written; `nleftover == 0` is EOF.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub struct ProgressMsg {
    pub nfilled: u64,
    pub nleftover: u64,
}

impl ProgressMsg {
    pub fn encode(&self, seg: &Segment) -> usize {
        seg.with_mut(|mem| {
            let mut stream = Cursor::new(&mut mem[..PROGRESS_MSGLEN]);

            stream.write_u64::<LittleEndian>(self.nfilled).unwrap();
            stream.write_u64::<LittleEndian>(self.nleftover).unwrap();
        });

        PROGRESS_MSGLEN
    }

    /// A progress message is wellformed iff it is exactly 16 bytes.
    pub fn decode(bytes: &[u8]) -> TransferResult<ProgressMsg> {
        if bytes.len() != PROGRESS_MSGLEN {
            return Err(TransferError::Fatal(ErrorType::MalformedProgress));
        }

        let mut stream = Cursor::new(bytes);

        Ok(ProgressMsg {
            nfilled: stream.read_u64::<LittleEndian>().unwrap(),
            nleftover: stream.read_u64::<LittleEndian>().unwrap(),
        })
    }
}

/// The receiver's advertisement of remote-writable regions. An empty
/// vector (`niovs == 0`) is the receiver's EOF.
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct VectorMsg {
    pub iovs: Vec<RemoteIov>,
}

impl VectorMsg {
    #[inline]
    pub fn wire_len(&self) -> usize {
        VECTOR_HDRLEN + self.iovs.len() * VECTOR_IOV_LEN
    }

    pub fn encode(&self, seg: &Segment) -> usize {
        assert!(self.iovs.len() <= VECTOR_IOVS_MAX);

        let len = self.wire_len();

        seg.with_mut(|mem| {
            let mut stream = Cursor::new(&mut mem[..len]);

            stream
                .write_u32::<LittleEndian>(self.iovs.len() as u32)
                .unwrap();
            stream.write_u32::<LittleEndian>(0).unwrap(); // pad

            for iov in &self.iovs {
                stream.write_u64::<LittleEndian>(iov.addr).unwrap();
                stream.write_u64::<LittleEndian>(iov.len).unwrap();
                stream.write_u64::<LittleEndian>(iov.key).unwrap();
            }
        });

        len
    }

    /// Validates the size relations before trusting the entry count: the
    /// message must cover its header, end on an entry boundary, and declare
    /// no more entries than its length implies or the hard cap allows.
    pub fn decode(bytes: &[u8]) -> TransferResult<VectorMsg> {
        if bytes.len() < VECTOR_HDRLEN {
            return Err(TransferError::Fatal(ErrorType::MalformedVector));
        }

        if (bytes.len() - VECTOR_HDRLEN) % VECTOR_IOV_LEN != 0 {
            return Err(TransferError::Fatal(ErrorType::MalformedVector));
        }

        let niovs_space = (bytes.len() - VECTOR_HDRLEN) / VECTOR_IOV_LEN;
        let mut stream = Cursor::new(bytes);
        let niovs = stream.read_u32::<LittleEndian>().unwrap() as usize;
        let _pad = stream.read_u32::<LittleEndian>().unwrap();

        if niovs > niovs_space {
            return Err(TransferError::Fatal(ErrorType::TruncatedVector));
        }

        if niovs > VECTOR_IOVS_MAX {
            return Err(TransferError::Fatal(ErrorType::TooManyVectors));
        }

        let mut iovs = Vec::with_capacity(niovs);

        for _ in 0..niovs {
            iovs.push(RemoteIov {
                addr: stream.read_u64::<LittleEndian>().unwrap(),
                len: stream.read_u64::<LittleEndian>().unwrap(),
                key: stream.read_u64::<LittleEndian>().unwrap(),
            });
        }

        Ok(VectorMsg { iovs })
    }
}

fn write_addr(stream: &mut Cursor<&mut [u8]>, addr: &[u8]) {
    assert!(addr.len() <= ADDR_MAX);

    stream.write_u32::<LittleEndian>(addr.len() as u32).unwrap();
    stream.write_all(addr).unwrap();

    let pad = vec![0u8; ADDR_MAX - addr.len()];
    stream.write_all(&pad).unwrap();
}

fn read_addr(stream: &mut Cursor<&[u8]>) -> TransferResult<Vec<u8>> {
    let addrlen = stream.read_u32::<LittleEndian>().unwrap() as usize;

    if addrlen > ADDR_MAX {
        return Err(TransferError::Fatal(ErrorType::MalformedVector));
    }

    let mut addr = vec![0u8; addrlen];
    stream.read_exact(&mut addr).unwrap();

    Ok(addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_roundtrip() {
        let msg = InitialMsg {
            nonce: [7u8; NONCE_LEN],
            nsources: 8,
            id: 3,
            addr: b"lo/4242#17".to_vec(),
        };

        let seg = Segment::new(INITIAL_MSGLEN);
        let len = msg.encode(&seg);
        assert_eq!(len, INITIAL_MSGLEN);

        let decoded = InitialMsg::decode(&seg.copy_out(0, len)).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_initial_rejects_wrong_size() {
        assert!(InitialMsg::decode(&[0u8; INITIAL_MSGLEN - 1]).is_err());
    }

    #[test]
    fn test_ack_roundtrip() {
        let msg = AckMsg {
            addr: b"lo/4242#2".to_vec(),
        };

        let seg = Segment::new(ACK_MSGLEN);
        let len = msg.encode(&seg);
        assert_eq!(len, ACK_MSGLEN);

        let decoded = AckMsg::decode(&seg.copy_out(0, len)).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_progress_roundtrip_and_size_check() {
        let msg = ProgressMsg {
            nfilled: 12345,
            nleftover: 1,
        };

        let seg = Segment::new(PROGRESS_MSGLEN);
        assert_eq!(msg.encode(&seg), PROGRESS_MSGLEN);
        assert_eq!(ProgressMsg::decode(&seg.copy_out(0, 16)).unwrap(), msg);

        assert_eq!(
            ProgressMsg::decode(&[0u8; 15]),
            Err(TransferError::Fatal(ErrorType::MalformedProgress))
        );
        assert_eq!(
            ProgressMsg::decode(&[0u8; 17]),
            Err(TransferError::Fatal(ErrorType::MalformedProgress))
        );
    }

    #[test]
    fn test_vector_roundtrip() {
        let msg = VectorMsg {
            iovs: vec![
                RemoteIov {
                    addr: 0,
                    len: 23,
                    key: 512,
                },
                RemoteIov {
                    addr: 0,
                    len: 37,
                    key: 513,
                },
            ],
        };

        let seg = Segment::new(VECTOR_MSGLEN_MAX);
        let len = msg.encode(&seg);
        assert_eq!(len, VECTOR_HDRLEN + 2 * VECTOR_IOV_LEN);

        let decoded = VectorMsg::decode(&seg.copy_out(0, len)).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_empty_vector_is_eight_bytes() {
        let msg = VectorMsg { iovs: Vec::new() };
        let seg = Segment::new(VECTOR_MSGLEN_MAX);

        assert_eq!(msg.encode(&seg), 8);
        assert!(VectorMsg::decode(&seg.copy_out(0, 8)).unwrap().iovs.is_empty());
    }

    #[test]
    fn test_vector_rejects_bad_sizes() {
        // Shorter than the header.
        assert_eq!(
            VectorMsg::decode(&[0u8; 7]),
            Err(TransferError::Fatal(ErrorType::MalformedVector))
        );

        // Not on an entry boundary.
        assert_eq!(
            VectorMsg::decode(&[0u8; VECTOR_HDRLEN + 11]),
            Err(TransferError::Fatal(ErrorType::MalformedVector))
        );

        // Declares more entries than the bytes hold.
        let mut bytes = vec![0u8; VECTOR_HDRLEN + VECTOR_IOV_LEN];
        bytes[0] = 2;
        assert_eq!(
            VectorMsg::decode(&bytes),
            Err(TransferError::Fatal(ErrorType::TruncatedVector))
        );

        // Declares more entries than the hard cap.
        let mut bytes = vec![0u8; VECTOR_HDRLEN + 13 * VECTOR_IOV_LEN];
        bytes[0] = 13;
        assert_eq!(
            VectorMsg::decode(&bytes),
            Err(TransferError::Fatal(ErrorType::TooManyVectors))
        );
    }
}
