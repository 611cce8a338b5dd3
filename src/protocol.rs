use crate::session::{Notify, Session};
use crate::transport::Transport;
use byteorder::{BE, ByteOrder};
use log::{info, trace};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::io::{Read, Write};
use thiserror::Error;

/// Size of the header that precedes every command: opcode, offset, count.
pub const FRAME_SIZE: usize = 1 + 4 + 4;

/// Largest block [dump] asks the cart for at once.
pub const READ_BLOCK_SIZE: u32 = 4096;

/// Largest payload [flash] sends with one write command, matching the cart firmware's write
/// buffer.
pub const WRITE_BLOCK_SIZE: u32 = 32;

/// Read `count` bytes of `memory` starting at `offset`. On success the result is exactly `count`
/// bytes long. The session must be ready.
pub fn read<T: Transport, N: Notify>(
    session: &mut Session<T, N>,
    memory: Memory,
    offset: u32,
    count: u32,
) -> Result<Vec<u8>, Error> {
    let frame = Frame::new(memory.read_command().into(), offset, count);

    let result = session
        .write_bulk(&frame.to_bytes(), "sending read command")
        .and_then(|()| {
            let mut data = vec![0u8; count as usize];
            session.read_bulk(&mut data, "reading data")?;
            Ok(data)
        });

    match result {
        Ok(data) => {
            trace!("Read {count} bytes of {memory:?} at {offset:#010x}");
            Ok(data)
        }
        Err(e) => {
            session.report(&e);
            Err(e)
        }
    }
}

/// Write `data` into `memory` starting at `offset`. `count` goes out in the command header and
/// must equal `data.len()`; a mismatch is refused before anything is sent. The session must be
/// ready.
pub fn write<T: Transport, N: Notify>(
    session: &mut Session<T, N>,
    memory: Memory,
    data: &[u8],
    offset: u32,
    count: u32,
) -> Result<(), Error> {
    let result = if data.len() != count as usize {
        Err(ProtocolError::LengthMismatch {
            count,
            actual: data.len(),
        }
        .into())
    } else {
        let frame = Frame::new(memory.write_command().into(), offset, count);
        let mut packet = Vec::with_capacity(FRAME_SIZE + data.len());
        packet.extend_from_slice(&frame.to_bytes());
        packet.extend_from_slice(data);

        session.write_bulk(&packet, "sending write command")
    };

    match result {
        Ok(()) => {
            trace!("Wrote {count} bytes of {memory:?} at {offset:#010x}");
            Ok(())
        }
        Err(e) => {
            session.report(&e);
            Err(e)
        }
    }
}

/// Copy `len` bytes of `memory` starting at `offset` into `file`, [READ_BLOCK_SIZE] bytes at a
/// time. Nothing is read if the range runs past the 32-bit address space.
pub fn dump<T: Transport, N: Notify>(
    session: &mut Session<T, N>,
    memory: Memory,
    offset: u32,
    len: u32,
    file: &mut impl Write,
) -> Result<(), Error> {
    if u64::from(offset) + u64::from(len) > 1u64 << 32 {
        return Err(ProtocolError::AddressOverflow.into());
    }

    let mut done = 0u32;
    while done < len {
        let count = (len - done).min(READ_BLOCK_SIZE);
        let block = read(session, memory, offset + done, count)?;
        file.write_all(&block)?;
        done += count;
    }

    info!("Read {len} bytes of {memory:?} starting at {offset:#010x}");
    Ok(())
}

/// Copy everything left in `file` into `memory` starting at `offset`, [WRITE_BLOCK_SIZE] bytes at a
/// time. Returns how many bytes were written.
pub fn flash<T: Transport, N: Notify>(
    session: &mut Session<T, N>,
    memory: Memory,
    offset: u32,
    file: &mut impl Read,
) -> Result<u64, Error> {
    let mut block = Vec::with_capacity(WRITE_BLOCK_SIZE as usize);
    let mut written = 0u64;

    loop {
        block.clear();
        let size = file
            .take(WRITE_BLOCK_SIZE as _)
            .read_to_end(&mut block)?;
        if size == 0 {
            break;
        }

        let addr = u32::try_from(written)
            .ok()
            .and_then(|w| offset.checked_add(w))
            .ok_or(ProtocolError::AddressOverflow)?;
        if u64::from(addr) + size as u64 > 1u64 << 32 {
            return Err(ProtocolError::AddressOverflow.into());
        }

        write(session, memory, &block, addr, size as u32)?;
        written += size as u64;
    }

    info!("Wrote {written} bytes of {memory:?} starting at {offset:#010x}");
    Ok(written)
}

/// Map a bulk transfer's byte count into an error if it moved less than asked.
pub(crate) fn ensure_complete(expected: usize, actual: usize) -> Result<(), Error> {
    if actual < expected {
        Err(ProtocolError::ShortTransfer { expected, actual }.into())
    } else {
        Ok(())
    }
}

/// The cart's two addressable regions.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive)]
pub enum Memory {
    Rom = 0,
    Sram = 1,
}

impl Memory {
    /// Look up a region by its raw code. Anything but ROM or SRAM is an invalid target.
    pub fn from_code(code: u8) -> Result<Self, ProtocolError> {
        Self::try_from(code).map_err(|e| ProtocolError::InvalidTarget(e.number))
    }

    fn read_command(self) -> Command {
        match self {
            Memory::Rom => Command::ReadRom,
            Memory::Sram => Command::ReadSram,
        }
    }

    fn write_command(self) -> Command {
        match self {
            Memory::Rom => Command::WriteRom,
            Memory::Sram => Command::WriteSram,
        }
    }
}

/// Opcodes understood by the cart firmware.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoPrimitive)]
pub enum Command {
    ReadRom = 0xff,
    WriteRom = 0x57,
    ReadSram = 0x6d,
    WriteSram = 0x4d,
}

/// Header preceding every command: `[opcode][offset BE u32][count BE u32]`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Frame {
    pub opcode: u8,
    pub offset: u32,
    pub count: u32,
}

impl Frame {
    pub fn new(opcode: u8, offset: u32, count: u32) -> Self {
        Frame {
            opcode,
            offset,
            count,
        }
    }

    pub fn to_bytes(&self) -> [u8; FRAME_SIZE] {
        let mut buf = [0u8; FRAME_SIZE];
        buf[0] = self.opcode;
        BE::write_u32(&mut buf[1..5], self.offset);
        BE::write_u32(&mut buf[5..9], self.count);
        buf
    }

    /// Decode the header at the start of `buf`, ignoring any payload after it.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < FRAME_SIZE {
            return None;
        }

        Some(Frame {
            opcode: buf[0],
            offset: BE::read_u32(&buf[1..5]),
            count: BE::read_u32(&buf[5..9]),
        })
    }
}

/// All errors (protocol and I/O) that can happen during a cart operation.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("cart protocol error")]
    ProtocolError(#[from] ProtocolError),

    #[error("no cart is ready")]
    NotReady,

    #[error("USB transfer error while {action}")]
    DeviceIoError {
        source: rusb::Error,
        action: &'static str,
    },

    #[error("USB transfer timed out while {action}")]
    Timeout { action: &'static str },

    #[error("file I/O error")]
    FileIoError(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn transfer(source: rusb::Error, action: &'static str) -> Self {
        match source {
            rusb::Error::Timeout => Error::Timeout { action },
            _ => Error::DeviceIoError { source, action },
        }
    }
}

/// Failure modes that can happen even when all I/O succeeds.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProtocolError {
    #[error("memory target {0} is neither ROM nor SRAM")]
    InvalidTarget(u8),

    #[error("bulk transfer moved {actual} bytes, expected {expected}")]
    ShortTransfer { expected: usize, actual: usize },

    #[error("command header says {count} bytes but payload is {actual}")]
    LengthMismatch { count: u32, actual: usize },

    #[error("transfer runs past the end of the 32-bit address space")]
    AddressOverflow,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_ids::{EMS_CART, RECEIVE_ENDPOINT, SEND_ENDPOINT};
    use crate::transport::mock::{Call, CallLog, MockTransport, Recorder};

    fn ready_session(mock: MockTransport, calls: &CallLog) -> Session<MockTransport, Recorder> {
        let mut session = Session::with_notify(mock.device(EMS_CART), Recorder::default());
        session.find_device().unwrap();
        calls.borrow_mut().clear();
        session
    }

    #[test]
    fn frame_layout_is_big_endian() {
        let frame = Frame::new(0xff, 0x0102_0304, 0xa0b0_c0d0);
        assert_eq!(
            frame.to_bytes(),
            [0xff, 0x01, 0x02, 0x03, 0x04, 0xa0, 0xb0, 0xc0, 0xd0]
        );
        assert_eq!(Frame::parse(&frame.to_bytes()), Some(frame));
    }

    #[test]
    fn frame_extremes_survive_decoding() {
        for (opcode, offset, count) in [(0, 0, 0), (0xff, u32::MAX, u32::MAX), (0x57, 1, 1 << 31)]
        {
            let frame = Frame::new(opcode, offset, count);
            let bytes = frame.to_bytes();
            assert_eq!(bytes.len(), FRAME_SIZE);
            assert_eq!(bytes[0], opcode);
            assert_eq!(Frame::parse(&bytes), Some(frame));
        }
    }

    #[test]
    fn parse_ignores_payload_and_rejects_short_headers() {
        let mut packet = Frame::new(0x4d, 16, 2).to_bytes().to_vec();
        packet.extend_from_slice(&[0xaa, 0xbb]);
        assert_eq!(Frame::parse(&packet), Some(Frame::new(0x4d, 16, 2)));
        assert_eq!(Frame::parse(&packet[..FRAME_SIZE - 1]), None);
    }

    #[test]
    fn opcodes_are_distinct() {
        let codes: Vec<u8> = [
            Command::ReadRom,
            Command::WriteRom,
            Command::ReadSram,
            Command::WriteSram,
        ]
        .into_iter()
        .map(u8::from)
        .collect();
        for (i, a) in codes.iter().enumerate() {
            assert!(!codes[i + 1..].contains(a));
        }
    }

    #[test]
    fn invalid_target_is_rejected() {
        assert_eq!(Memory::from_code(0).unwrap(), Memory::Rom);
        assert_eq!(Memory::from_code(1).unwrap(), Memory::Sram);
        assert!(matches!(
            Memory::from_code(2),
            Err(ProtocolError::InvalidTarget(2))
        ));
        assert!(matches!(
            Memory::from_code(0xff),
            Err(ProtocolError::InvalidTarget(0xff))
        ));
    }

    #[test]
    fn read_sends_frame_then_receives_count_bytes() {
        let (mock, calls) = MockTransport::new();
        let mut session = ready_session(mock.reads([Ok(vec![1, 2, 3, 4])]), &calls);

        let data = read(&mut session, Memory::Rom, 0x4000, 4).unwrap();

        assert_eq!(data, vec![1, 2, 3, 4]);
        assert_eq!(
            *calls.borrow(),
            vec![
                Call::BulkOut(
                    SEND_ENDPOINT,
                    Frame::new(Command::ReadRom.into(), 0x4000, 4)
                        .to_bytes()
                        .to_vec()
                ),
                Call::BulkIn(RECEIVE_ENDPOINT, 4),
            ]
        );
    }

    #[test]
    fn read_sram_uses_sram_opcode() {
        let (mock, calls) = MockTransport::new();
        let mut session = ready_session(mock, &calls);

        read(&mut session, Memory::Sram, 0, 8).unwrap();

        let sent = match &calls.borrow()[0] {
            Call::BulkOut(_, data) => data.clone(),
            other => panic!("unexpected call {other:?}"),
        };
        assert_eq!(sent[0], u8::from(Command::ReadSram));
    }

    #[test]
    fn failed_send_skips_receive() {
        let (mock, calls) = MockTransport::new();
        let mut session = ready_session(mock.writes([Err(rusb::Error::Pipe)]), &calls);

        let err = read(&mut session, Memory::Rom, 0, 16).unwrap_err();

        assert!(matches!(
            err,
            Error::DeviceIoError {
                source: rusb::Error::Pipe,
                ..
            }
        ));
        assert!(
            !calls
                .borrow()
                .iter()
                .any(|c| matches!(c, Call::BulkIn(..)))
        );
        assert_eq!(session.notify().errors.len(), 1);
    }

    #[test]
    fn failed_receive_is_an_error() {
        let (mock, calls) = MockTransport::new();
        let mut session = ready_session(mock.reads([Err(rusb::Error::Overflow)]), &calls);

        assert!(matches!(
            read(&mut session, Memory::Sram, 0, 16),
            Err(Error::DeviceIoError {
                source: rusb::Error::Overflow,
                ..
            })
        ));
    }

    #[test]
    fn short_read_is_an_error() {
        let (mock, calls) = MockTransport::new();
        let mut session = ready_session(mock.reads([Ok(vec![0; 3])]), &calls);

        assert!(matches!(
            read(&mut session, Memory::Rom, 0, 8),
            Err(Error::ProtocolError(ProtocolError::ShortTransfer {
                expected: 8,
                actual: 3
            }))
        ));
    }

    #[test]
    fn timeout_is_distinct() {
        let (mock, calls) = MockTransport::new();
        let mut session = ready_session(mock.reads([Err(rusb::Error::Timeout)]), &calls);

        assert!(matches!(
            read(&mut session, Memory::Rom, 0, 8),
            Err(Error::Timeout {
                action: "reading data"
            })
        ));
    }

    #[test]
    fn write_sends_frame_and_payload_together() {
        let (mock, calls) = MockTransport::new();
        let mut session = ready_session(mock, &calls);
        let data = [0xde, 0xad, 0xbe, 0xef];

        write(&mut session, Memory::Rom, &data, 0x100, 4).unwrap();

        let mut expected = Frame::new(Command::WriteRom.into(), 0x100, 4)
            .to_bytes()
            .to_vec();
        expected.extend_from_slice(&data);
        assert_eq!(*calls.borrow(), vec![Call::BulkOut(SEND_ENDPOINT, expected)]);
    }

    #[test]
    fn write_failure_is_reported() {
        let (mock, calls) = MockTransport::new();
        let mut session = ready_session(mock.writes([Err(rusb::Error::NoDevice)]), &calls);

        assert!(write(&mut session, Memory::Sram, &[1, 2], 0, 2).is_err());
        assert_eq!(session.notify().errors.len(), 1);
        assert!(session.notify().errors[0].contains("sending write command"));
    }

    #[test]
    fn write_length_mismatch_sends_nothing() {
        let (mock, calls) = MockTransport::new();
        let mut session = ready_session(mock, &calls);

        assert!(matches!(
            write(&mut session, Memory::Rom, &[1, 2, 3], 0, 4),
            Err(Error::ProtocolError(ProtocolError::LengthMismatch {
                count: 4,
                actual: 3
            }))
        ));
        assert!(calls.borrow().is_empty());
    }

    #[test]
    fn operations_fail_fast_when_not_ready() {
        let (mock, calls) = MockTransport::new();
        let mut session = Session::new(mock);

        assert!(matches!(
            read(&mut session, Memory::Rom, 0, 4),
            Err(Error::NotReady)
        ));
        assert!(matches!(
            write(&mut session, Memory::Rom, &[0; 4], 0, 4),
            Err(Error::NotReady)
        ));
        assert!(calls.borrow().is_empty());
    }

    #[test]
    fn dump_reads_in_blocks() {
        let (mock, calls) = MockTransport::new();
        let first = vec![0x11; READ_BLOCK_SIZE as usize];
        let mock = mock.reads([Ok(first.clone()), Ok(vec![0x22; 10])]);
        let mut session = ready_session(mock, &calls);
        let mut out = Vec::new();

        dump(&mut session, Memory::Rom, 0x8000, READ_BLOCK_SIZE + 10, &mut out).unwrap();

        assert_eq!(out.len(), READ_BLOCK_SIZE as usize + 10);
        assert_eq!(&out[..first.len()], &first[..]);
        assert!(out[first.len()..].iter().all(|&b| b == 0x22));

        let headers: Vec<Frame> = calls
            .borrow()
            .iter()
            .filter_map(|c| match c {
                Call::BulkOut(_, data) => Frame::parse(data),
                _ => None,
            })
            .collect();
        assert_eq!(
            headers,
            vec![
                Frame::new(Command::ReadRom.into(), 0x8000, READ_BLOCK_SIZE),
                Frame::new(Command::ReadRom.into(), 0x8000 + READ_BLOCK_SIZE, 10),
            ]
        );
    }

    #[test]
    fn dump_refuses_range_past_address_space() {
        let (mock, calls) = MockTransport::new();
        let mut session = ready_session(mock, &calls);

        assert!(matches!(
            dump(&mut session, Memory::Rom, u32::MAX, 2, &mut Vec::new()),
            Err(Error::ProtocolError(ProtocolError::AddressOverflow))
        ));
        assert!(calls.borrow().is_empty());
    }

    #[test]
    fn flash_refuses_block_past_address_space() {
        let (mock, calls) = MockTransport::new();
        let mut session = ready_session(mock, &calls);
        let image = [0u8; 32];

        assert!(matches!(
            flash(&mut session, Memory::Rom, u32::MAX - 3, &mut &image[..]),
            Err(Error::ProtocolError(ProtocolError::AddressOverflow))
        ));
        assert!(
            !calls
                .borrow()
                .iter()
                .any(|c| matches!(c, Call::BulkOut(..)))
        );
    }

    #[test]
    fn flash_block_may_end_at_top_of_address_space() {
        let (mock, calls) = MockTransport::new();
        let mut session = ready_session(mock, &calls);
        let image = [0u8; 4];

        assert_eq!(
            flash(&mut session, Memory::Rom, u32::MAX - 3, &mut &image[..]).unwrap(),
            4
        );
        assert_eq!(calls.borrow().len(), 1);
    }

    #[test]
    fn flash_writes_in_blocks() {
        let (mock, calls) = MockTransport::new();
        let mut session = ready_session(mock, &calls);
        let image: Vec<u8> = (0..70u8).collect();

        let written = flash(&mut session, Memory::Sram, 0x20, &mut &image[..]).unwrap();

        assert_eq!(written, 70);
        let packets: Vec<Vec<u8>> = calls
            .borrow()
            .iter()
            .filter_map(|c| match c {
                Call::BulkOut(_, data) => Some(data.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(packets.len(), 3);
        let sizes = [32, 32, 6];
        let mut addr = 0x20;
        let mut pos = 0;
        for (packet, size) in packets.iter().zip(sizes) {
            assert_eq!(
                Frame::parse(packet),
                Some(Frame::new(Command::WriteSram.into(), addr, size))
            );
            assert_eq!(&packet[FRAME_SIZE..], &image[pos..pos + size as usize]);
            addr += size;
            pos += size as usize;
        }
    }

    #[test]
    fn flash_stops_at_first_failure() {
        let (mock, calls) = MockTransport::new();
        let mock = mock.writes([Ok(FRAME_SIZE + 32), Err(rusb::Error::Io)]);
        let mut session = ready_session(mock, &calls);
        let image = [0u8; 100];

        assert!(flash(&mut session, Memory::Rom, 0, &mut &image[..]).is_err());
        assert_eq!(calls.borrow().len(), 2);
    }
}
